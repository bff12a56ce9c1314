use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

use claimcheck_analysis::{analyze_batch, AnalysisOptions, AnalysisReport};
use claimcheck_core::{extract_docx_text, unpack_invoices};
use claimcheck_llm::{LlmClient, LlmProvider, LlmRequest, LlmResponse};

use crate::config::{self, ClaimcheckConfig};
use crate::logging;

#[allow(clippy::too_many_arguments)]
pub fn run(
    policy: String,
    invoices: String,
    out: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    max_invoices: Option<usize>,
    throttle_ms: Option<u64>,
    prompt_file: Option<String>,
) -> Result<()> {
    let mut config = ClaimcheckConfig::from_env()?;
    if let Some(name) = provider {
        config.provider = LlmProvider::from_str(&name)
            .ok_or_else(|| anyhow!(format!("unknown provider {name}")))?;
    }
    if let Some(model) = model {
        config.model = Some(model);
    }
    if let Some(value) = max_invoices {
        config.max_invoices = Some(value);
    }
    if let Some(value) = throttle_ms {
        config.throttle_ms = value;
    }
    if let Some(path) = prompt_file {
        config.prompt_file = Some(PathBuf::from(path));
    }
    let model = config.resolved_model();

    logging::stage("extract", format!("reading policy document {policy}"));
    let policy_bytes = fs::read(&policy).with_context(|| format!("failed to read {policy}"))?;
    let policy_text = extract_docx_text(&policy_bytes)?;
    if policy_text.trim().is_empty() {
        return Err(anyhow!("policy document appears to be empty"));
    }
    let archive_bytes = fs::read(&invoices).with_context(|| format!("failed to read {invoices}"))?;
    let docs = unpack_invoices(&archive_bytes, config.max_invoices)?;
    if docs.is_empty() {
        return Err(anyhow!(format!("no PDF files found in {invoices}")));
    }
    logging::stage(
        "extract",
        format!("unpacked {} invoices from {invoices}", docs.len()),
    );

    let template = config::load_template(config.prompt_file.as_deref())?;
    let client = LlmClient::new(config.provider, model.clone())?;
    let runtime = Runtime::new().context("failed to start tokio runtime")?;
    let llm_runner = |system: Option<&str>, user: &str| -> Result<LlmResponse> {
        runtime.block_on(client.chat(&LlmRequest {
            system: system.map(|s| s.to_string()),
            user: user.to_string(),
        }))
    };
    logging::stage(
        "analyze",
        format!(
            "scoring {} invoices with {} ({model})",
            docs.len(),
            config.provider.as_str()
        ),
    );
    let options = AnalysisOptions {
        throttle_ms: config.throttle_ms,
        ..AnalysisOptions::default()
    };
    let report = analyze_batch(&template, &policy_text, &docs, &options, &llm_runner);
    for decision in &report.decisions {
        logging::verbose(format!(
            "{}: {} ({})",
            decision.invoice_id, decision.reimbursement_status, decision.reimbursable_amount
        ));
    }
    logging::stage(
        "analyze",
        format!(
            "{} fully, {} partially, {} declined, {} errors",
            report.summary.fully_reimbursed,
            report.summary.partially_reimbursed,
            report.summary.declined,
            report.summary.errors
        ),
    );

    let rendered = serde_json::to_string_pretty(&envelope(&policy, &invoices, report))?;
    match out {
        Some(path) => {
            fs::write(&path, rendered).with_context(|| format!("failed to write {path}"))?;
            logging::info(format!("wrote report to {path}"));
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn envelope(policy: &str, archive: &str, report: AnalysisReport) -> Value {
    json!({
        "policy_file": policy,
        "invoice_archive": archive,
        "invoices_processed": report.decisions.len(),
        "analysis": report.decisions,
        "summary": report.summary,
        "usage": report.usage,
    })
}
