use anyhow::{anyhow, Result};
use std::env;
use std::path::{Path, PathBuf};

use claimcheck_core::PromptTemplate;
use claimcheck_llm::LlmProvider;

#[derive(Debug, Clone)]
pub struct ClaimcheckConfig {
    pub provider: LlmProvider,
    /// Explicit model override; `resolved_model` falls back per provider.
    pub model: Option<String>,
    pub throttle_ms: u64,
    pub max_invoices: Option<usize>,
    pub prompt_file: Option<PathBuf>,
}

impl ClaimcheckConfig {
    pub fn from_env() -> Result<Self> {
        let provider_name =
            env::var("CLAIMCHECK_PROVIDER").unwrap_or_else(|_| "gemini".to_string());
        let provider = LlmProvider::from_str(&provider_name)
            .ok_or_else(|| anyhow!(format!("unknown provider {provider_name}")))?;
        let model = env::var("CLAIMCHECK_MODEL").ok();
        let throttle_ms = env::var("CLAIMCHECK_THROTTLE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let max_invoices = env::var("CLAIMCHECK_MAX_INVOICES")
            .ok()
            .and_then(|v| v.parse().ok());
        let prompt_file = env::var("CLAIMCHECK_PROMPT_FILE").ok().map(PathBuf::from);
        Ok(Self {
            provider,
            model,
            throttle_ms,
            max_invoices,
            prompt_file,
        })
    }

    pub fn resolved_model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| default_model(self.provider).to_string())
    }
}

pub fn default_model(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "gpt-4.1-mini",
        LlmProvider::Anthropic => "claude-3-5-sonnet",
        LlmProvider::Gemini => "gemini-1.5-flash",
        LlmProvider::Deepseek => "deepseek-chat",
        LlmProvider::Local => "local",
    }
}

pub fn load_template(path: Option<&Path>) -> Result<PromptTemplate> {
    match path {
        Some(path) => Ok(PromptTemplate::from_file(path)?),
        None => Ok(PromptTemplate::default()),
    }
}
