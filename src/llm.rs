use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Failure modes of a single completion call. No variant is retried.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("rate limited by model API")]
    RateLimited,
    #[error("model API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model API request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode model reply: {0}")]
    Decode(String),
    #[error("model reply contained no text block")]
    NoTextBlock,
}

impl GatewayError {
    /// Short label used in fallback output and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::RateLimited => "rate limited",
            GatewayError::Status { .. } => "service error",
            GatewayError::Transport(_) => "service unreachable",
            GatewayError::Decode(_) | GatewayError::NoTextBlock => "unreadable reply",
        }
    }
}

/// An image attached to a user message.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub media_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ReplyBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    content: Vec<ReplyBlock>,
}

pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    /// Caps in-flight requests across all callers sharing this client.
    limit: Arc<Semaphore>,
}

impl LlmClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: &str,
        timeout: Duration,
        max_concurrent: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
        })
    }

    /// Build a client from the environment. Returns `None` when no API key is
    /// configured; callers then run in fallback mode.
    pub fn from_env() -> Result<Option<Self>> {
        let Some(api_key) = dotenv::var("LLM_API_KEY")
            .or_else(|_| dotenv::var("ANTHROPIC_API_KEY"))
            .ok()
            .filter(|k| !k.is_empty())
        else {
            return Ok(None);
        };

        let base_url = dotenv::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "https://api.anthropic.com".to_string());
        let model = dotenv::var("LLM_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());
        let timeout_secs = dotenv::var("LLM_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(120);
        let max_concurrent = dotenv::var("LLM_MAX_CONCURRENT")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(4);

        Self::new(
            &base_url,
            &model,
            &api_key,
            Duration::from_secs(timeout_secs),
            max_concurrent,
        )
        .map(Some)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Resolve the messages endpoint from the base URL.
    fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/messages") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{}/messages", base)
        } else {
            format!("{}/v1/messages", base)
        }
    }

    /// Text-only completion. Returns the first text block of the reply.
    pub async fn complete(
        &self,
        prompt: &str,
        system: &str,
        max_tokens: u32,
    ) -> Result<String, GatewayError> {
        let message = Message {
            role: "user",
            content: vec![ContentBlock::Text {
                text: prompt.to_string(),
            }],
        };
        self.send(message, system, max_tokens).await
    }

    /// Completion with an image placed ahead of the prompt text.
    pub async fn complete_with_image(
        &self,
        prompt: &str,
        image: &ImageInput,
        system: &str,
        max_tokens: u32,
    ) -> Result<String, GatewayError> {
        let data = base64::engine::general_purpose::STANDARD.encode(&image.data);
        let message = Message {
            role: "user",
            content: vec![
                ContentBlock::Image {
                    source: ImageSource {
                        kind: "base64",
                        media_type: image.media_type.clone(),
                        data,
                    },
                },
                ContentBlock::Text {
                    text: prompt.to_string(),
                },
            ],
        };
        self.send(message, system, max_tokens).await
    }

    async fn send(
        &self,
        message: Message,
        system: &str,
        max_tokens: u32,
    ) -> Result<String, GatewayError> {
        // The semaphore is never closed; a closed one would mean no cap.
        let _permit = self.limit.acquire().await.ok();

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": [message],
        });

        debug!(model = %self.model, max_tokens, system_len = system.len(), "model request");

        let resp = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("model API rate limited the request");
            return Err(GatewayError::RateLimited);
        }
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            });
        }

        first_text_block(&text)
    }
}

/// Extract the first `type == "text"` block from a raw reply body.
fn first_text_block(body: &str) -> Result<String, GatewayError> {
    let reply: Reply =
        serde_json::from_str(body).map_err(|e| GatewayError::Decode(e.to_string()))?;
    reply
        .content
        .into_iter()
        .find(|b| b.kind == "text")
        .and_then(|b| b.text)
        .ok_or(GatewayError::NoTextBlock)
}
