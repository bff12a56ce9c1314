use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use claimcheck_core::{
    clamp_chars, parse_decision, DecisionSummary, InvoiceContent, InvoiceDecision,
    InvoiceDocument, PromptTemplate,
};
use claimcheck_llm::LlmResponse;

/// Knobs for a batch run. Defaults match a single-tenant deployment
/// talking to a rate-limited hosted model.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Sleep inserted between invoices, in milliseconds.
    pub throttle_ms: u64,
    /// Attempts per invoice before the failure becomes an `Error` decision.
    pub max_retries: u32,
    /// Per-document character cap applied to both texts before rendering.
    pub max_doc_chars: Option<usize>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            throttle_ms: 0,
            max_retries: 3,
            max_doc_chars: None,
        }
    }
}

/// Token totals accumulated across the model calls of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    fn record(&mut self, response: &LlmResponse) {
        self.prompt_tokens += u64::from(response.prompt_tokens);
        self.completion_tokens += u64::from(response.completion_tokens);
    }
}

/// Everything a caller needs to build a response envelope: one decision
/// per invoice, in input order, plus the aggregate counters.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub decisions: Vec<InvoiceDecision>,
    pub summary: DecisionSummary,
    pub usage: TokenUsage,
}

/// Decide one invoice against the policy.
///
/// Invoices whose text never made it out of the PDF produce an `Error`
/// decision without touching the model; everything else costs exactly one
/// model call (plus retries). The second tuple element is that call's
/// token usage.
pub fn evaluate_invoice(
    template: &PromptTemplate,
    policy_text: &str,
    invoice: &InvoiceDocument,
    options: &AnalysisOptions,
    invoke: &impl Fn(Option<&str>, &str) -> Result<LlmResponse>,
) -> (InvoiceDecision, TokenUsage) {
    let mut usage = TokenUsage::default();
    let text = match &invoice.content {
        InvoiceContent::Failed(reason) => {
            return (
                InvoiceDecision::error(invoice.filename.as_str(), reason.as_str()),
                usage,
            );
        }
        InvoiceContent::Text(text) if text.trim().is_empty() => {
            return (
                InvoiceDecision::error(
                    invoice.filename.as_str(),
                    "Could not extract text from PDF",
                ),
                usage,
            );
        }
        InvoiceContent::Text(text) => text,
    };

    let (policy_text, text) = match options.max_doc_chars {
        Some(max) => (clamp_chars(policy_text, max), clamp_chars(text, max)),
        None => (policy_text, text.as_str()),
    };
    let prompt = template.render(policy_text, text);

    let started = Instant::now();
    let decision = match call_with_retry(invoke, &prompt, &invoice.filename, options.max_retries) {
        Ok(response) => {
            usage.record(&response);
            tracing::debug!(
                "model answered for {} (prompt={} completion={} elapsed={:?})",
                invoice.filename,
                response.prompt_tokens,
                response.completion_tokens,
                started.elapsed()
            );
            parse_decision(&invoice.filename, &response.content)
        }
        Err(err) => {
            InvoiceDecision::error(invoice.filename.as_str(), format!("Analysis error: {err}"))
        }
    };
    (decision, usage)
}

/// Run the whole batch sequentially, in archive order.
pub fn analyze_batch(
    template: &PromptTemplate,
    policy_text: &str,
    invoices: &[InvoiceDocument],
    options: &AnalysisOptions,
    invoke: &impl Fn(Option<&str>, &str) -> Result<LlmResponse>,
) -> AnalysisReport {
    let total = invoices.len();
    let mut decisions = Vec::with_capacity(total);
    let mut usage = TokenUsage::default();
    for (position, invoice) in invoices.iter().enumerate() {
        tracing::info!(
            "analyzing invoice {} ({}/{})",
            invoice.filename,
            position + 1,
            total
        );
        let (decision, call_usage) = evaluate_invoice(template, policy_text, invoice, options, invoke);
        usage.prompt_tokens += call_usage.prompt_tokens;
        usage.completion_tokens += call_usage.completion_tokens;
        decisions.push(decision);
        throttle(options.throttle_ms);
    }
    let summary = DecisionSummary::from_decisions(&decisions);
    AnalysisReport {
        decisions,
        summary,
        usage,
    }
}

fn throttle(delay_ms: u64) {
    if delay_ms > 0 {
        thread::sleep(Duration::from_millis(delay_ms));
    }
}

fn call_with_retry(
    invoke: &impl Fn(Option<&str>, &str) -> Result<LlmResponse>,
    prompt: &str,
    invoice_id: &str,
    max_retries: u32,
) -> Result<LlmResponse> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match invoke(None, prompt) {
            Ok(resp) => return Ok(resp),
            Err(err) => {
                tracing::warn!(
                    "model call failed for {invoice_id} (attempt {attempt}/{max_retries}): {err}"
                );
                if attempt >= max_retries {
                    return Err(err);
                }
                thread::sleep(Duration::from_secs(u64::from(attempt * 2)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use anyhow::anyhow;
    use claimcheck_core::{InvoiceContent, InvoiceDocument, ReimbursementStatus};

    use super::*;

    fn invoice(filename: &str, content: InvoiceContent) -> InvoiceDocument {
        InvoiceDocument {
            filename: filename.to_string(),
            content,
        }
    }

    fn decision_json(status: &str, amount: f64) -> String {
        format!(
            r#"{{"reimbursement_status": "{status}", "reimbursable_amount": {amount}, "reason": "stub"}}"#
        )
    }

    fn quick_options() -> AnalysisOptions {
        AnalysisOptions {
            max_retries: 1,
            ..AnalysisOptions::default()
        }
    }

    #[test]
    fn batch_collects_decisions_and_usage() {
        let template = PromptTemplate::default();
        let invoices = vec![
            invoice("a.pdf", InvoiceContent::Text("Dinner 42 EUR".into())),
            invoice("b.pdf", InvoiceContent::Text("Taxi 650 USD".into())),
        ];
        let response = LlmResponse {
            content: decision_json("Fully Reimbursed", 42.0),
            prompt_tokens: 10,
            completion_tokens: 5,
        };
        let report = analyze_batch(
            &template,
            "Meals up to 50 EUR",
            &invoices,
            &quick_options(),
            &|_, _| Ok(response.clone()),
        );
        assert_eq!(report.decisions.len(), 2);
        assert_eq!(report.summary.fully_reimbursed, 2);
        assert_eq!(report.usage.prompt_tokens, 20);
        assert_eq!(report.usage.completion_tokens, 10);
        assert_eq!(report.decisions[0].invoice_id, "a.pdf");
    }

    #[test]
    fn failed_extraction_skips_the_model() {
        let template = PromptTemplate::default();
        let calls = Cell::new(0usize);
        let doc = invoice("broken.pdf", InvoiceContent::Failed("pdf error: truncated".into()));
        let (decision, usage) = evaluate_invoice(
            &template,
            "policy",
            &doc,
            &quick_options(),
            &|_, _| {
                calls.set(calls.get() + 1);
                Ok(LlmResponse {
                    content: decision_json("Declined", 0.0),
                    prompt_tokens: 1,
                    completion_tokens: 1,
                })
            },
        );
        assert_eq!(calls.get(), 0);
        assert_eq!(decision.reimbursement_status, ReimbursementStatus::Error);
        assert_eq!(decision.reason, "pdf error: truncated");
        assert_eq!(usage, TokenUsage::default());
    }

    #[test]
    fn empty_text_becomes_error_without_a_call() {
        let template = PromptTemplate::default();
        let calls = Cell::new(0usize);
        let doc = invoice("scan.pdf", InvoiceContent::Text("   ".into()));
        let (decision, _) = evaluate_invoice(&template, "policy", &doc, &quick_options(), &|_, _| {
            calls.set(calls.get() + 1);
            Err(anyhow!("should not be called"))
        });
        assert_eq!(calls.get(), 0);
        assert_eq!(decision.reimbursement_status, ReimbursementStatus::Error);
        assert_eq!(decision.reason, "Could not extract text from PDF");
    }

    #[test]
    fn model_failure_becomes_error_decision() {
        let template = PromptTemplate::default();
        let doc = invoice("inv.pdf", InvoiceContent::Text("Taxi 20 EUR".into()));
        let (decision, usage) = evaluate_invoice(
            &template,
            "policy",
            &doc,
            &quick_options(),
            &|_, _| Err(anyhow!("gemini returned an error")),
        );
        assert_eq!(decision.reimbursement_status, ReimbursementStatus::Error);
        assert_eq!(decision.reason, "Analysis error: gemini returned an error");
        assert_eq!(usage.total_tokens(), 0);
    }

    #[test]
    fn unparseable_reply_becomes_error_decision() {
        let template = PromptTemplate::default();
        let doc = invoice("inv.pdf", InvoiceContent::Text("Taxi 20 EUR".into()));
        let (decision, _) = evaluate_invoice(&template, "policy", &doc, &quick_options(), &|_, _| {
            Ok(LlmResponse {
                content: "no json here".into(),
                prompt_tokens: 2,
                completion_tokens: 2,
            })
        });
        assert_eq!(decision.reimbursement_status, ReimbursementStatus::Error);
        assert_eq!(decision.reason, "Error parsing analysis response");
    }

    #[test]
    fn prompt_carries_both_documents() {
        let template = PromptTemplate::default();
        let seen = RefCell::new(String::new());
        let doc = invoice("inv.pdf", InvoiceContent::Text("Hotel night 120 EUR".into()));
        let _ = evaluate_invoice(
            &template,
            "Hotels up to 150 EUR",
            &doc,
            &quick_options(),
            &|_, prompt| {
                *seen.borrow_mut() = prompt.to_string();
                Ok(LlmResponse {
                    content: decision_json("Fully Reimbursed", 120.0),
                    prompt_tokens: 0,
                    completion_tokens: 0,
                })
            },
        );
        let prompt = seen.borrow();
        assert!(prompt.contains("Hotels up to 150 EUR"));
        assert!(prompt.contains("Hotel night 120 EUR"));
    }

    #[test]
    fn doc_cap_truncates_the_prompt() {
        let template = PromptTemplate::default();
        let seen = RefCell::new(String::new());
        let doc = invoice("inv.pdf", InvoiceContent::Text("x".repeat(5000)));
        let options = AnalysisOptions {
            max_doc_chars: Some(100),
            ..quick_options()
        };
        let _ = evaluate_invoice(&template, "policy", &doc, &options, &|_, prompt| {
            *seen.borrow_mut() = prompt.to_string();
            Ok(LlmResponse {
                content: decision_json("Declined", 0.0),
                prompt_tokens: 0,
                completion_tokens: 0,
            })
        });
        assert!(!seen.borrow().contains(&"x".repeat(101)));
        assert!(seen.borrow().contains(&"x".repeat(100)));
    }
}
