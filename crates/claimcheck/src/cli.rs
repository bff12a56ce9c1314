use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "claimcheck", about = "Invoice reimbursement analysis CLI")]
pub struct Cli {
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Score every invoice in an archive against a policy document.
    Analyze {
        policy: String,
        #[arg(long)]
        invoices: String,
        #[arg(long)]
        out: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        max_invoices: Option<usize>,
        #[arg(long)]
        throttle_ms: Option<u64>,
        #[arg(long)]
        prompt_file: Option<String>,
    },
    /// Dump the extracted text of a .docx, .pdf, or .zip of PDFs.
    Extract {
        input: String,
    },
    /// Render the analysis prompt for one invoice without calling the model.
    Prompt {
        policy: String,
        invoice: String,
        #[arg(long)]
        prompt_file: Option<String>,
    },
}
