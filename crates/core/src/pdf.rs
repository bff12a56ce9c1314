use crate::error::{ClaimError, Result};
use crate::text::clean_text;

/// Extract text from a PDF held in memory, one `=== PAGE n ===` block per
/// non-empty page.
///
/// The bytes are structurally validated with `lopdf` first; `pdf_extract`
/// can panic on malformed input, so anything that fails to load is reported
/// as a `Pdf` error before it gets that far.
pub fn extract_pdf_text(data: &[u8]) -> Result<String> {
    if let Err(err) = lopdf::Document::load_mem(data) {
        return Err(ClaimError::Pdf(format!("not a valid pdf: {err}")));
    }

    let pages = pdf_extract::extract_text_from_mem_by_pages(data)
        .map_err(|err| ClaimError::Pdf(err.to_string()))?;

    let mut parts = Vec::new();
    for (page_num, page) in pages.iter().enumerate() {
        let page = page.trim();
        if page.is_empty() {
            continue;
        }
        parts.push(format!("=== PAGE {} ===", page_num + 1));
        parts.push(page.to_string());
    }
    Ok(clean_text(&parts.join("\n")))
}
