//! Chat-completion client for the language-model decision oracle.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use super::types::*;
use crate::trading::OracleConfig;

#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("Oracle transport error: {0}")]
    Transport(String),

    #[error("Oracle request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Oracle request failed: {code} - {body}")]
    Status { code: u16, body: String },

    #[error("Malformed oracle response: {0}")]
    Malformed(String),

    #[error("OPENROUTER_API_KEY not set")]
    MissingApiKey,
}

impl OracleError {
    /// Failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, OracleError::MissingApiKey)
    }
}

/// Anything that can answer a chat prompt with raw text.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, OracleError>;
}

/// OpenRouter-compatible `/chat/completions` client.
pub struct OracleClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    referer: String,
    title: String,
}

impl OracleClient {
    pub fn new(config: &OracleConfig, api_key: String) -> anyhow::Result<Self> {
        if api_key.trim().is_empty() {
            anyhow::bail!(OracleError::MissingApiKey);
        }
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            referer: config.referer.clone(),
            title: config.title.clone(),
        })
    }

    /// Client keyed from `OPENROUTER_API_KEY`; `None` when the key is absent.
    pub fn from_env(config: &OracleConfig) -> anyhow::Result<Option<Self>> {
        match std::env::var("OPENROUTER_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Self::new(config, key).map(Some),
            _ => Ok(None),
        }
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String, api_key: String) -> anyhow::Result<Self> {
        let config = OracleConfig {
            base_url,
            ..Default::default()
        };
        Self::new(&config, api_key)
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ChatBackend for OracleClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, OracleError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens,
        };

        debug!(model = %self.model, max_tokens = max_tokens, "Querying oracle");

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout(timeout)
                } else {
                    OracleError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let envelope: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))?;

        envelope
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| OracleError::Malformed("no choices in response".to_string()))
    }
}
