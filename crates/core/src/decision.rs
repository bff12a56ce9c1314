use serde::{Deserialize, Serialize};

/// Outcome category for one analyzed invoice.
///
/// The model is only ever asked for the first three; `Error` marks
/// extraction or processing failures on our side of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReimbursementStatus {
    #[serde(rename = "Fully Reimbursed")]
    FullyReimbursed,
    #[serde(rename = "Partially Reimbursed")]
    PartiallyReimbursed,
    Declined,
    Error,
}

impl ReimbursementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullyReimbursed => "Fully Reimbursed",
            Self::PartiallyReimbursed => "Partially Reimbursed",
            Self::Declined => "Declined",
            Self::Error => "Error",
        }
    }
}

impl std::fmt::Display for ReimbursementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The per-invoice verdict assembled from the model's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceDecision {
    pub invoice_id: String,
    pub reimbursement_status: ReimbursementStatus,
    pub reimbursable_amount: f64,
    pub reason: String,
}

impl InvoiceDecision {
    /// A processing-failure verdict: amount zero, status `Error`.
    pub fn error(invoice_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            invoice_id: invoice_id.into(),
            reimbursement_status: ReimbursementStatus::Error,
            reimbursable_amount: 0.0,
            reason: reason.into(),
        }
    }
}

/// Aggregate counters over a batch of decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub fully_reimbursed: usize,
    pub partially_reimbursed: usize,
    pub declined: usize,
    pub errors: usize,
    pub total_reimbursable_amount: f64,
}

impl DecisionSummary {
    pub fn from_decisions(decisions: &[InvoiceDecision]) -> Self {
        let mut summary = Self::default();
        for decision in decisions {
            match decision.reimbursement_status {
                ReimbursementStatus::FullyReimbursed => summary.fully_reimbursed += 1,
                ReimbursementStatus::PartiallyReimbursed => summary.partially_reimbursed += 1,
                ReimbursementStatus::Declined => summary.declined += 1,
                ReimbursementStatus::Error => {
                    summary.errors += 1;
                    continue;
                }
            }
            summary.total_reimbursable_amount += decision.reimbursable_amount;
        }
        summary
    }
}

/// Loose shape of what the model sends back. Accepts both the long and
/// short key spellings used across prompt templates.
#[derive(Deserialize)]
struct RawDecision {
    #[serde(alias = "status")]
    reimbursement_status: Option<String>,
    #[serde(alias = "amount")]
    reimbursable_amount: Option<serde_json::Value>,
    reason: Option<String>,
}

/// Turn a raw model reply into a decision, tolerating the usual damage.
///
/// Markdown code fences are stripped, and when the reply embeds JSON in
/// prose the outermost `{...}` region is retried. Anything that still
/// fails to parse becomes an `Error` decision rather than an error return.
/// A parseable reply with an unrecognized status string is coerced to
/// `Declined` with the offending value in the reason. `invoice_id` is
/// always the caller's filename, never trusted from the reply.
pub fn parse_decision(invoice_id: &str, raw: &str) -> InvoiceDecision {
    let cleaned = strip_code_fences(raw);
    let parsed: Option<RawDecision> = serde_json::from_str(cleaned).ok().or_else(|| {
        extract_json_object(cleaned).and_then(|slice| serde_json::from_str(slice).ok())
    });
    let Some(raw_decision) = parsed else {
        return InvoiceDecision::error(invoice_id, "Error parsing analysis response");
    };

    let amount = match raw_decision.reimbursable_amount {
        None | Some(serde_json::Value::Null) => 0.0,
        Some(value) => match numeric_amount(&value) {
            Some(amount) => amount,
            None => {
                return InvoiceDecision::error(
                    invoice_id,
                    "Analysis error: non-numeric reimbursable_amount",
                )
            }
        },
    };

    let mut reason = raw_decision
        .reason
        .unwrap_or_else(|| "No reason provided".to_string());
    let status = match raw_decision.reimbursement_status.as_deref() {
        Some("Fully Reimbursed") => ReimbursementStatus::FullyReimbursed,
        Some("Partially Reimbursed") => ReimbursementStatus::PartiallyReimbursed,
        Some("Declined") | None => ReimbursementStatus::Declined,
        Some(other) => {
            reason = format!("Invalid status returned: {other}");
            ReimbursementStatus::Declined
        }
    };

    InvoiceDecision {
        invoice_id: invoice_id.to_string(),
        reimbursement_status: status,
        reimbursable_amount: amount.max(0.0),
        reason,
    }
}

// `f64::from_str` accepts "inf" and "nan", which would otherwise survive
// the clamp and serialize as JSON null.
fn numeric_amount(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        serde_json::Value::String(s) => s.trim().parse().ok().filter(|f: &f64| f.is_finite()),
        _ => None,
    }
}

fn strip_code_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end > start {
        Some(&s[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json_reply() {
        let raw = r#"{"reimbursement_status": "Fully Reimbursed", "reimbursable_amount": 250, "reason": "Within the daily cab limit"}"#;
        let decision = parse_decision("cab_001.pdf", raw);
        assert_eq!(decision.invoice_id, "cab_001.pdf");
        assert_eq!(
            decision.reimbursement_status,
            ReimbursementStatus::FullyReimbursed
        );
        assert_eq!(decision.reimbursable_amount, 250.0);
        assert_eq!(decision.reason, "Within the daily cab limit");
    }

    #[test]
    fn strips_markdown_fences() {
        let raw = "```json\n{\"reimbursement_status\": \"Declined\", \"reimbursable_amount\": 0, \"reason\": \"Alcohol is not reimbursable\"}\n```";
        let decision = parse_decision("meal_001.pdf", raw);
        assert_eq!(decision.reimbursement_status, ReimbursementStatus::Declined);
        assert_eq!(decision.reason, "Alcohol is not reimbursable");
    }

    #[test]
    fn recovers_json_embedded_in_prose() {
        let raw = "Here is my assessment:\n{\"reimbursement_status\": \"Partially Reimbursed\", \"reimbursable_amount\": 500, \"reason\": \"Caps at the daily limit\"}\nLet me know if you need more.";
        let decision = parse_decision("cab_002.pdf", raw);
        assert_eq!(
            decision.reimbursement_status,
            ReimbursementStatus::PartiallyReimbursed
        );
        assert_eq!(decision.reimbursable_amount, 500.0);
    }

    #[test]
    fn accepts_short_key_spellings() {
        let raw = r#"{"invoice": "x.pdf", "status": "Fully Reimbursed", "amount": 99.5, "reason": "ok"}"#;
        let decision = parse_decision("x.pdf", raw);
        assert_eq!(
            decision.reimbursement_status,
            ReimbursementStatus::FullyReimbursed
        );
        assert_eq!(decision.reimbursable_amount, 99.5);
    }

    #[test]
    fn unknown_status_is_coerced_to_declined() {
        let raw = r#"{"reimbursement_status": "Gray Area", "reimbursable_amount": 10, "reason": "unsure"}"#;
        let decision = parse_decision("inv.pdf", raw);
        assert_eq!(decision.reimbursement_status, ReimbursementStatus::Declined);
        assert_eq!(decision.reason, "Invalid status returned: Gray Area");
    }

    #[test]
    fn malformed_reply_becomes_error_decision() {
        let decision = parse_decision("inv.pdf", "I could not decide, sorry.");
        assert_eq!(decision.reimbursement_status, ReimbursementStatus::Error);
        assert_eq!(decision.reimbursable_amount, 0.0);
        assert_eq!(decision.reason, "Error parsing analysis response");
    }

    #[test]
    fn negative_amount_is_clamped_to_zero() {
        let raw = r#"{"reimbursement_status": "Declined", "reimbursable_amount": -42, "reason": "no"}"#;
        let decision = parse_decision("inv.pdf", raw);
        assert_eq!(decision.reimbursable_amount, 0.0);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let decision = parse_decision("inv.pdf", "{}");
        assert_eq!(decision.reimbursement_status, ReimbursementStatus::Declined);
        assert_eq!(decision.reimbursable_amount, 0.0);
        assert_eq!(decision.reason, "No reason provided");
    }

    #[test]
    fn string_amounts_are_parsed() {
        let raw = r#"{"reimbursement_status": "Fully Reimbursed", "reimbursable_amount": "128.40", "reason": "ok"}"#;
        let decision = parse_decision("inv.pdf", raw);
        assert_eq!(decision.reimbursable_amount, 128.4);
    }

    #[test]
    fn non_numeric_amount_becomes_error_decision() {
        let raw = r#"{"reimbursement_status": "Fully Reimbursed", "reimbursable_amount": "a lot", "reason": "ok"}"#;
        let decision = parse_decision("inv.pdf", raw);
        assert_eq!(decision.reimbursement_status, ReimbursementStatus::Error);
        assert!(decision.reason.starts_with("Analysis error"));
    }

    #[test]
    fn non_finite_amounts_become_error_decisions() {
        for amount in ["inf", "-inf", "nan", "Infinity"] {
            let raw = format!(
                r#"{{"reimbursement_status": "Fully Reimbursed", "reimbursable_amount": "{amount}", "reason": "ok"}}"#
            );
            let decision = parse_decision("inv.pdf", &raw);
            assert_eq!(
                decision.reimbursement_status,
                ReimbursementStatus::Error,
                "amount {amount:?} must not survive as a number"
            );
            assert_eq!(decision.reimbursable_amount, 0.0);
            let value = serde_json::to_value(&decision).unwrap();
            assert!(value["reimbursable_amount"].is_number());
        }
    }

    #[test]
    fn statuses_serialize_with_spaces() {
        let decision = InvoiceDecision {
            invoice_id: "inv.pdf".to_string(),
            reimbursement_status: ReimbursementStatus::PartiallyReimbursed,
            reimbursable_amount: 12.0,
            reason: "capped".to_string(),
        };
        let value = serde_json::to_value(&decision).unwrap();
        assert_eq!(value["reimbursement_status"], "Partially Reimbursed");
    }

    #[test]
    fn summary_counts_every_status() {
        let decisions = vec![
            parse_decision(
                "a.pdf",
                r#"{"reimbursement_status": "Fully Reimbursed", "reimbursable_amount": 250, "reason": "ok"}"#,
            ),
            parse_decision(
                "b.pdf",
                r#"{"reimbursement_status": "Partially Reimbursed", "reimbursable_amount": 500, "reason": "capped"}"#,
            ),
            parse_decision(
                "c.pdf",
                r#"{"reimbursement_status": "Declined", "reimbursable_amount": 0, "reason": "no"}"#,
            ),
            parse_decision("d.pdf", "garbage"),
        ];
        let summary = DecisionSummary::from_decisions(&decisions);
        assert_eq!(summary.fully_reimbursed, 1);
        assert_eq!(summary.partially_reimbursed, 1);
        assert_eq!(summary.declined, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.total_reimbursable_amount, 750.0);
        let counted = summary.fully_reimbursed
            + summary.partially_reimbursed
            + summary.declined
            + summary.errors;
        assert_eq!(counted, decisions.len());
    }
}
