use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use zip::ZipArchive;

use crate::error::Result;
use crate::pdf::extract_pdf_text;

/// Upper bound on a single archive entry; larger PDFs are surfaced as
/// failures rather than read into memory.
const MAX_PDF_BYTES: u64 = 100 * 1024 * 1024;

/// One invoice pulled out of an uploaded ZIP archive.
#[derive(Debug, Clone)]
pub struct InvoiceDocument {
    /// Entry name as stored in the archive, after path sanitization.
    pub filename: String,
    pub content: InvoiceContent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvoiceContent {
    /// Cleaned text, possibly empty when the PDF had no extractable text.
    Text(String),
    /// Extraction failed; carries the reason surfaced in the decision.
    Failed(String),
}

/// Pull every PDF invoice out of a ZIP archive held in memory.
///
/// Directories, `__MACOSX` resource forks, and non-PDF entries are skipped.
/// A PDF entry that cannot be read or parsed still produces an
/// `InvoiceDocument`, with the failure reason in place of text, so the
/// caller can report one decision per invoice. `max_files` caps how many
/// PDFs are processed, in archive order.
pub fn unpack_invoices(data: &[u8], max_files: Option<usize>) -> Result<Vec<InvoiceDocument>> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;

    let mut selected = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let raw_name = entry.name().to_string();
        if raw_name.starts_with("__MACOSX") || !raw_name.to_lowercase().ends_with(".pdf") {
            continue;
        }
        let Some(sanitized) = sanitize_path(&raw_name) else {
            tracing::warn!("skipping archive entry with invalid path: {raw_name}");
            continue;
        };
        selected.push((i, sanitized.to_string_lossy().to_string()));
    }
    if let Some(max) = max_files {
        selected.truncate(max);
    }

    let mut invoices = Vec::with_capacity(selected.len());
    for (index, filename) in selected {
        let content = read_entry(&mut archive, index);
        invoices.push(InvoiceDocument { filename, content });
    }
    Ok(invoices)
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, index: usize) -> InvoiceContent {
    let mut entry = match archive.by_index(index) {
        Ok(entry) => entry,
        Err(err) => return InvoiceContent::Failed(format!("could not read archive entry: {err}")),
    };
    if entry.encrypted() {
        return InvoiceContent::Failed("archive entry is password protected".to_string());
    }
    if entry.size() > MAX_PDF_BYTES {
        return InvoiceContent::Failed(format!(
            "archive entry exceeds size limit ({} bytes)",
            entry.size()
        ));
    }
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    if let Err(err) = entry.read_to_end(&mut bytes) {
        return InvoiceContent::Failed(format!("could not read archive entry: {err}"));
    }
    match extract_pdf_text(&bytes) {
        Ok(text) => InvoiceContent::Text(text),
        Err(err) => InvoiceContent::Failed(err.to_string()),
    }
}

/// Keep only normal path components, dropping parent refs, roots, and
/// drive prefixes, so hostile entry names cannot escape their directory.
fn sanitize_path(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    let mut sanitized = PathBuf::new();
    for component in path.components() {
        if let Component::Normal(part) = component {
            sanitized.push(part);
        }
    }
    if sanitized.as_os_str().is_empty() {
        None
    } else {
        Some(sanitized)
    }
}
