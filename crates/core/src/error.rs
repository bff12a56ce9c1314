use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClaimError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("pdf error: {0}")]
    Pdf(String),
    #[error("invalid document: {0}")]
    InvalidDocument(&'static str),
    #[error("unsupported input format: {0:?}")]
    UnsupportedInput(PathBuf),
    #[error("prompt template error: {0}")]
    Template(String),
}

pub type Result<T> = std::result::Result<T, ClaimError>;
