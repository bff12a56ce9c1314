mod analyze;
mod cli;
mod config;
mod extract;
mod logging;
mod prompt;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = if cli.verbose {
        true
    } else {
        logging::env_flag()
    };
    logging::init(verbose);
    match cli.command {
        Command::Analyze {
            policy,
            invoices,
            out,
            provider,
            model,
            max_invoices,
            throttle_ms,
            prompt_file,
        } => analyze::run(
            policy, invoices, out, provider, model, max_invoices, throttle_ms, prompt_file,
        ),
        Command::Extract { input } => extract::run(input),
        Command::Prompt {
            policy,
            invoice,
            prompt_file,
        } => prompt::run(policy, invoice, prompt_file),
    }
}
