use std::path::Path;

use crate::error::{ClaimError, Result};

pub const POLICY_PLACEHOLDER: &str = "{policy_text}";
pub const INVOICE_PLACEHOLDER: &str = "{invoice_text}";

/// Built-in analysis prompt, used whenever no template file is configured.
pub const DEFAULT_TEMPLATE: &str = r#"You are an expert HR and finance analyst responsible for verifying reimbursement invoices based on a company's official policy document.

Input:
1. A company reimbursement policy (detailed below).
2. An employee invoice (detailed below).

Your task:
- Carefully compare the invoice contents (date, items, amount, purpose, tax, category) against the company's reimbursement policy.
- Determine whether the invoice should be Fully Reimbursed, Partially Reimbursed, or Declined.
- Explain the decision with specific references to policy rules and amounts.

Guidelines:
- If all items in the invoice are within policy rules and limits, mark as "Fully Reimbursed".
- If some items or amounts exceed policy limits but are otherwise valid, mark as "Partially Reimbursed" and give the reimbursable amount.
- If the invoice contains non-reimbursable or restricted items, mark as "Declined" and give the reason.
- The reimbursable amount must be a plain number without currency symbols.
- Only use the rules from the provided policy. Do not assume anything not mentioned.

Format your response as JSON:
{
  "reimbursement_status": "Fully Reimbursed | Partially Reimbursed | Declined",
  "reimbursable_amount": <number>,
  "reason": "<short explanation of decision>"
}

--- POLICY DOCUMENT ---
{policy_text}

--- INVOICE DOCUMENT ---
{invoice_text}"#;

/// Prompt template with `{policy_text}` and `{invoice_text}` slots.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl PromptTemplate {
    /// Validate and wrap a template string. Both placeholders must appear.
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        for placeholder in [POLICY_PLACEHOLDER, INVOICE_PLACEHOLDER] {
            if !template.contains(placeholder) {
                return Err(ClaimError::Template(format!(
                    "template is missing the {placeholder} placeholder"
                )));
            }
        }
        Ok(Self { template })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let template = std::fs::read_to_string(path).map_err(|err| {
            ClaimError::Template(format!("could not read {}: {err}", path.display()))
        })?;
        Self::new(template)
    }

    /// Substitute both document texts into the template.
    ///
    /// Single pass over the template, so placeholder tokens occurring
    /// inside the substituted documents are never expanded themselves.
    pub fn render(&self, policy_text: &str, invoice_text: &str) -> String {
        let mut out = String::with_capacity(
            self.template.len() + policy_text.len() + invoice_text.len(),
        );
        let mut rest = self.template.as_str();
        while let Some((at, token, value)) = next_placeholder(rest, policy_text, invoice_text) {
            out.push_str(&rest[..at]);
            out.push_str(value);
            rest = &rest[at + token.len()..];
        }
        out.push_str(rest);
        out
    }
}

fn next_placeholder<'v>(
    rest: &str,
    policy_text: &'v str,
    invoice_text: &'v str,
) -> Option<(usize, &'static str, &'v str)> {
    let policy_at = rest.find(POLICY_PLACEHOLDER);
    let invoice_at = rest.find(INVOICE_PLACEHOLDER);
    match (policy_at, invoice_at) {
        (Some(p), Some(i)) if p <= i => Some((p, POLICY_PLACEHOLDER, policy_text)),
        (Some(p), None) => Some((p, POLICY_PLACEHOLDER, policy_text)),
        (_, Some(i)) => Some((i, INVOICE_PLACEHOLDER, invoice_text)),
        (None, None) => None,
    }
}
