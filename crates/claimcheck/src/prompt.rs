use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use claimcheck_core::{extract_docx_text, extract_pdf_text};

use crate::config::{self, ClaimcheckConfig};

pub fn run(policy: String, invoice: String, prompt_file: Option<String>) -> Result<()> {
    let mut config = ClaimcheckConfig::from_env()?;
    if let Some(path) = prompt_file {
        config.prompt_file = Some(PathBuf::from(path));
    }
    let template = config::load_template(config.prompt_file.as_deref())?;
    let policy_bytes = fs::read(&policy).with_context(|| format!("failed to read {policy}"))?;
    let policy_text = extract_docx_text(&policy_bytes)?;
    if policy_text.trim().is_empty() {
        return Err(anyhow!("policy document appears to be empty"));
    }
    let invoice_bytes = fs::read(&invoice).with_context(|| format!("failed to read {invoice}"))?;
    let invoice_text = extract_pdf_text(&invoice_bytes)?;
    println!("{}", template.render(&policy_text, &invoice_text));
    Ok(())
}
