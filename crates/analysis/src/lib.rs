mod pipeline;

pub use pipeline::{
    analyze_batch, evaluate_invoice, AnalysisOptions, AnalysisReport, TokenUsage,
};
