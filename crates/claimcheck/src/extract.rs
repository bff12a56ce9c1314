use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use claimcheck_core::{
    extract_docx_text, extract_pdf_text, unpack_invoices, ClaimError, InvoiceContent,
};

use crate::logging;

pub fn run(input: String) -> Result<()> {
    let bytes = fs::read(&input).with_context(|| format!("failed to read {input}"))?;
    let extension = Path::new(&input)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "docx" => println!("{}", extract_docx_text(&bytes)?),
        "pdf" => println!("{}", extract_pdf_text(&bytes)?),
        "zip" => {
            let docs = unpack_invoices(&bytes, None)?;
            if docs.is_empty() {
                return Err(anyhow!(format!("no PDF files found in {input}")));
            }
            for doc in docs {
                println!("=== {} ===", doc.filename);
                match doc.content {
                    InvoiceContent::Text(text) => println!("{text}"),
                    InvoiceContent::Failed(reason) => {
                        logging::info(format!("could not extract {}: {reason}", doc.filename));
                    }
                }
                println!();
            }
        }
        _ => return Err(ClaimError::UnsupportedInput(PathBuf::from(&input)).into()),
    }
    Ok(())
}
