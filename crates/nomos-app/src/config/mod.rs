//! Configuration loading and startup validation.
//!
//! Values come from an optional `config/settings.*` file overridden by
//! `NOMOS__`-prefixed environment variables (`NOMOS__DATABASE__URL`,
//! `NOMOS__LLM__API_KEY`, ...). Required credentials are checked up front so
//! a misconfigured deployment fails before any work is claimed.

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::constants::{
    DEFAULT_CONTEXT_WINDOW_TOKENS, DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_RETRIES,
    DEFAULT_PROMPT_OVERHEAD_TOKENS, DEFAULT_STALENESS_WINDOW_SECS,
};

const CONFIG_FILE: &str = "config/settings";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error(transparent)]
    Build(#[from] config::ConfigError),
    #[error("missing required configuration: {0}")]
    MissingRequired(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Upper bound on jobs claimed per model call.
    pub batch_size: usize,
    /// Seconds a recently-failed job stays out of the claimable set.
    pub staleness_window_secs: u64,
    /// Claim in random order instead of oldest-first.
    pub random_order: bool,
}

impl QueueConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub context_window_tokens: u32,
    pub prompt_overhead_tokens: u32,
    pub max_output_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    /// Ask the endpoint for JSON-mode responses where supported.
    pub json_mode: bool,
    pub max_retries: u32,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let builder = Config::builder()
        .set_default("database.url", "")?
        .set_default("database.max_connections", 5)?
        .set_default("queue.batch_size", DEFAULT_MAX_BATCH_SIZE as u64)?
        .set_default(
            "queue.staleness_window_secs",
            DEFAULT_STALENESS_WINDOW_SECS,
        )?
        .set_default("queue.random_order", false)?
        .set_default("llm.api_key", "")?
        .set_default("llm.base_url", "")?
        .set_default("llm.model", "")?
        .set_default(
            "llm.context_window_tokens",
            u64::from(DEFAULT_CONTEXT_WINDOW_TOKENS),
        )?
        .set_default(
            "llm.prompt_overhead_tokens",
            u64::from(DEFAULT_PROMPT_OVERHEAD_TOKENS),
        )?
        .set_default("llm.max_output_tokens", 8_000)?
        .set_default("llm.temperature", 0.3)?
        .set_default("llm.top_p", 0.8)?
        .set_default("llm.json_mode", true)?
        .set_default("llm.max_retries", u64::from(DEFAULT_MAX_RETRIES))?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("NOMOS").separator("__"));

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

impl AppConfig {
    /// Reject configurations that cannot possibly run before touching the
    /// database or the completion endpoint.
    pub fn validate(&self) -> Result<(), AppConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(AppConfigError::MissingRequired("database.url"));
        }
        if self.llm.api_key.trim().is_empty() {
            return Err(AppConfigError::MissingRequired("llm.api_key"));
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(AppConfigError::MissingRequired("llm.base_url"));
        }
        if self.llm.model.trim().is_empty() {
            return Err(AppConfigError::MissingRequired("llm.model"));
        }
        if self.queue.batch_size == 0 {
            return Err(AppConfigError::Invalid(
                "queue.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.llm.context_window_tokens <= self.llm.prompt_overhead_tokens {
            return Err(AppConfigError::Invalid(format!(
                "llm.context_window_tokens ({}) must exceed llm.prompt_overhead_tokens ({})",
                self.llm.context_window_tokens, self.llm.prompt_overhead_tokens
            )));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(AppConfigError::Invalid(format!(
                "llm.temperature must be within [0, 2], got {}",
                self.llm.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.llm.top_p) {
            return Err(AppConfigError::Invalid(format!(
                "llm.top_p must be within [0, 1], got {}",
                self.llm.top_p
            )));
        }
        Ok(())
    }
}
