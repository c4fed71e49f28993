//! Completion-endpoint adapter.
//!
//! One chat-completion request per batch against an OpenAI-compatible
//! endpoint. The model is an untrusted peer: replies are parsed and validated
//! strictly — 1:1 job correspondence, no extras, no omissions, every score in
//! range — and any violation fails the whole batch. Retry is the batch
//! processor's responsibility at a coarser grain; nothing here retries.

use std::{num::NonZeroU32, sync::Arc, time::Duration};

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LlmConfig;
use crate::constants::MODEL_REQUESTS_PER_SECOND;
use crate::pipeline::analysis::{AnalysisValidationError, BatchAnalysisReply, JobAnalysis};
use crate::services::queue::ClaimedJob;
use crate::services::usage::TokenUsage;

pub type GenericRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub(crate) const ANALYST_SYSTEM_PROMPT: &str = "You are an expert policy analyst. Assess each \
submitted legislative subject (a single bill, or a cluster of related bills) for its potential \
impact on demographic groups, identifying both direct and indirect effects and citing evidence \
from the supplied fields. Respond with one JSON document matching the schema below and nothing \
else: no prose, no markdown fences. Return exactly one analysis per submitted subject, keyed by \
the same job_id. Every score must be a number between 0 and 1. If a subject lacks a coherent \
theme to assess, set no_coherent_theme to true and explain why instead of scoring it.";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("completion endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },
    #[error("completion reply contained no content")]
    EmptyReply,
    #[error("failed to parse completion reply as JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("reply does not correspond 1:1 with the batch: {0}")]
    Correspondence(String),
    #[error(transparent)]
    Validation(#[from] AnalysisValidationError),
}

/// Validated analyses for one batch plus reported token usage.
#[derive(Debug, Clone)]
pub struct BatchAnalysis {
    pub analyses: Vec<JobAnalysis>,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait AnalystClient: Send + Sync {
    /// One completion call for the whole batch; hard error on any
    /// malformed or non-corresponding reply.
    async fn analyze(&self, batch: &[ClaimedJob]) -> Result<BatchAnalysis, ModelError>;
}

#[derive(Clone)]
pub struct HttpAnalystClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f64,
    top_p: f64,
    max_output_tokens: u32,
    json_mode: bool,
    system_prompt: String,
    limiter: Option<Arc<GenericRateLimiter>>,
}

impl HttpAnalystClient {
    pub fn from_config(
        cfg: &LlmConfig,
        limiter: Option<Arc<GenericRateLimiter>>,
    ) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let endpoint = format!("{}/chat/completions", cfg.base_url.trim_end_matches('/'));
        let system_prompt = format!(
            "{ANALYST_SYSTEM_PROMPT}\n\nReply schema:\n{}",
            BatchAnalysisReply::schema()
        );
        Ok(Self {
            http,
            endpoint,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            max_output_tokens: cfg.max_output_tokens,
            json_mode: cfg.json_mode,
            system_prompt,
            limiter,
        })
    }

    /// Build a rate limiter matching the default request throttle.
    pub fn default_limiter() -> Arc<GenericRateLimiter> {
        let quota = Quota::per_second(
            NonZeroU32::new(MODEL_REQUESTS_PER_SECOND).expect("throttle must be non-zero"),
        );
        Arc::new(RateLimiter::direct(quota))
    }
}

#[async_trait]
impl AnalystClient for HttpAnalystClient {
    async fn analyze(&self, batch: &[ClaimedJob]) -> Result<BatchAnalysis, ModelError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let user_message = build_user_message(batch)?;
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: self.system_prompt.clone(),
                },
                ChatMessage {
                    role: "user",
                    content: user_message,
                },
            ],
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_output_tokens,
            response_format: self.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ModelError::Endpoint {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&body)?;
        let content = parsed
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .filter(|content| !content.trim().is_empty())
            .ok_or(ModelError::EmptyReply)?;

        let expected: Vec<&str> = batch.iter().map(|job| job.job_id.as_str()).collect();
        let reply = parse_batch_reply(&expected, content)?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(BatchAnalysis {
            analyses: reply.analyses,
            usage,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ChatReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Serialize the batch's subject profiles into the user message.
pub(crate) fn build_user_message(batch: &[ClaimedJob]) -> Result<String, serde_json::Error> {
    debug_assert!(!batch.is_empty());

    #[derive(Serialize)]
    struct PromptEntry<'a> {
        job_id: &'a str,
        #[serde(flatten)]
        profile: &'a crate::pipeline::subject::SubjectProfile,
    }

    let entries: Vec<PromptEntry<'_>> = batch
        .iter()
        .map(|job| PromptEntry {
            job_id: &job.job_id,
            profile: &job.profile,
        })
        .collect();
    let serialized = serde_json::to_string_pretty(&entries)?;
    Ok(format!(
        "Analyze these legislative subjects for their potential impact on demographic groups:\n\n{serialized}"
    ))
}

/// Parse and validate a reply against the submitted job ids.
pub(crate) fn parse_batch_reply(
    expected: &[&str],
    content: &str,
) -> Result<BatchAnalysisReply, ModelError> {
    let reply: BatchAnalysisReply = serde_json::from_str(content.trim())?;

    if reply.analyses.len() != expected.len() {
        return Err(ModelError::Correspondence(format!(
            "expected {} analyses, got {}",
            expected.len(),
            reply.analyses.len()
        )));
    }

    let mut seen = std::collections::HashSet::with_capacity(reply.analyses.len());
    for analysis in &reply.analyses {
        if !seen.insert(analysis.job_id.as_str()) {
            return Err(ModelError::Correspondence(format!(
                "duplicate analysis for job `{}`",
                analysis.job_id
            )));
        }
        if !expected.contains(&analysis.job_id.as_str()) {
            return Err(ModelError::Correspondence(format!(
                "analysis for unknown job `{}`",
                analysis.job_id
            )));
        }
    }
    for job_id in expected {
        if !seen.contains(job_id) {
            return Err(ModelError::Correspondence(format!(
                "missing analysis for job `{job_id}`"
            )));
        }
    }

    for analysis in &reply.analyses {
        analysis.validate()?;
    }

    Ok(reply)
}

fn truncate_body(body: &str) -> String {
    const MAX_LEN: usize = 512;
    if body.len() > MAX_LEN {
        let mut end = MAX_LEN;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}
