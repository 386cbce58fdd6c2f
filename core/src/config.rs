use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    /// Overrides the OpenAI endpoint, e.g. for a compatible proxy.
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub llm: LlmConfig,
    pub bind_addr: SocketAddr,
    /// Model calls allowed per chat turn. With 1, action results end the
    /// turn; above 1 they are fed back to the model.
    pub max_rounds: usize,
    /// JSON file listing remote chains to expose as actions.
    pub chains_path: Option<PathBuf>,
}

impl GatewayConfig {
    /// Reads the process environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set in .env")?;
        let model = var("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let base_url = var("OPENAI_BASE_URL");

        let bind_addr = var("COPILOT_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr: SocketAddr = bind_addr.parse().with_context(|| {
            format!("COPILOT_BIND_ADDR '{}' is not a socket address", bind_addr)
        })?;

        let max_rounds = match var("COPILOT_MAX_ROUNDS") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|&n| n >= 1)
                .with_context(|| {
                    format!("COPILOT_MAX_ROUNDS must be a positive integer, got '{}'", raw)
                })?,
            None => 1,
        };

        let chains_path = var("COPILOT_CHAINS_PATH").map(PathBuf::from);

        Ok(Self {
            llm: LlmConfig {
                api_key,
                model,
                base_url,
            },
            bind_addr,
            max_rounds,
            chains_path,
        })
    }
}
