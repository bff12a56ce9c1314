mod archive;
mod decision;
mod docx;
mod error;
mod pdf;
mod prompt;
mod text;

pub use archive::{unpack_invoices, InvoiceContent, InvoiceDocument};
pub use decision::{parse_decision, DecisionSummary, InvoiceDecision, ReimbursementStatus};
pub use docx::extract_docx_text;
pub use error::{ClaimError, Result};
pub use pdf::extract_pdf_text;
pub use prompt::{PromptTemplate, DEFAULT_TEMPLATE};
pub use text::{clamp_chars, clean_text};
