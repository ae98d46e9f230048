//! Streaming LLM chat client (OpenRouter-compatible chat completions).
//!
//! Responses stream as server-sent events; content deltas are accumulated
//! and time-to-first-token is recorded. Transient failures (network errors,
//! HTTP 429/5xx) retry with jittered exponential backoff; other HTTP errors
//! propagate.

use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LlmConfig;

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

const BASE_SYSTEM_PROMPT: &str = "You are a helpful and concise voice assistant. \
Your responses will be spoken aloud by a text-to-speech engine. \
Be concise and to the point. \
NEVER include citations, reference numbers, URLs, links, footnotes, \
source attributions, or any markup in your responses. \
Do not use markdown, bullet points, numbered lists, or code blocks. \
Just answer naturally as a human would in a spoken conversation. \
If you don't know something, say so honestly. \
Even when web search is used, never mention sources or citations.";

/// Chat message as sent to the completions API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Result of a completed chat call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub model: String,
    pub elapsed_s: f64,
    pub ttft_s: f64,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

pub struct LlmClient {
    config: LlmConfig,
    api_key: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let api_key = std::env::var(API_KEY_ENV).unwrap_or_default();
        if api_key.is_empty() {
            warn!("{API_KEY_ENV} not set — LLM requests will be rejected upstream");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .build()
            .unwrap_or_default();
        Self {
            config,
            api_key,
            client,
        }
    }

    /// Fire-and-forget minimal streaming request to warm the upstream
    /// connection and model. Errors are swallowed.
    pub fn warmup(&self) {
        if !self.config.warmup_enabled {
            return;
        }
        let client = self.client.clone();
        let url = format!("{}/chat/completions", self.config.api_base);
        let api_key = self.api_key.clone();
        let payload = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1,
            "stream": true,
        });
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .bearer_auth(&api_key)
                .json(&payload)
                .send()
                .await;
            match result {
                Ok(resp) => debug!(status = %resp.status(), "LLM warmup request sent"),
                Err(e) => debug!("LLM warmup failed: {e}"),
            }
        });
    }

    /// Send a streaming chat completion and accumulate the response.
    pub async fn chat(&self, messages: &[ChatMessage]) -> anyhow::Result<ChatOutcome> {
        let mut payload = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "stream": true,
        });
        if self.config.web_search {
            payload["plugins"] = serde_json::json!([{"id": "web"}]);
        }

        let url = format!("{}/chat/completions", self.config.api_base);
        let t0 = Instant::now();
        let attempts = self.config.max_retries + 1;
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..attempts {
            let resp = match self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    // Network-level failures are always retryable.
                    last_error = Some(e.into());
                    if attempt + 1 < attempts {
                        self.sleep_before_retry(attempt).await;
                        continue;
                    }
                    break;
                }
            };

            let status = resp.status();
            if !status.is_success() {
                if should_retry_status(status.as_u16()) && attempt + 1 < attempts {
                    warn!(status = %status, attempt, "retryable LLM error");
                    self.sleep_before_retry(attempt).await;
                    continue;
                }
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("LLM API error {status}: {body}");
            }

            match self.consume_stream(resp, t0).await {
                Ok(outcome) => {
                    info!(
                        model = %outcome.model,
                        ttft_s = outcome.ttft_s,
                        elapsed_s = outcome.elapsed_s,
                        chars = outcome.text.len(),
                        "LLM response complete"
                    );
                    return Ok(outcome);
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        self.sleep_before_retry(attempt).await;
                        continue;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("LLM chat failed without error")))
    }

    async fn consume_stream(
        &self,
        resp: reqwest::Response,
        t0: Instant,
    ) -> anyhow::Result<ChatOutcome> {
        use futures_util::StreamExt;

        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();
        let mut text = String::new();
        let mut model = self.config.model.clone();
        let mut ttft: Option<f64> = None;

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| anyhow::anyhow!("stream read failed: {e}"))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data.trim() == "[DONE]" {
                    break 'outer;
                }
                let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
                    continue;
                };
                if let Some(m) = event.model {
                    model = m;
                }
                if let Some(content) = event
                    .choices
                    .first()
                    .and_then(|c| c.delta.content.as_deref())
                {
                    if !content.is_empty() {
                        ttft.get_or_insert_with(|| t0.elapsed().as_secs_f64());
                        text.push_str(content);
                    }
                }
            }
        }

        let elapsed_s = t0.elapsed().as_secs_f64();
        Ok(ChatOutcome {
            text: text.trim().to_string(),
            model,
            elapsed_s,
            ttft_s: ttft.unwrap_or(elapsed_s),
        })
    }

    async fn sleep_before_retry(&self, attempt: u32) {
        tokio::time::sleep(retry_delay(self.config.retry_base_delay_s, attempt)).await;
    }
}

/// HTTP statuses worth retrying: rate limiting and server-side failures.
pub fn should_retry_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Exponential backoff with up to 25% additive jitter.
pub fn retry_delay(base_delay_s: f64, attempt: u32) -> Duration {
    let base = base_delay_s.max(0.05) * 2f64.powi(attempt as i32);
    let jitter = rand::rng().random_range(0.0..=base * 0.25);
    Duration::from_secs_f64(base + jitter)
}

/// System prompt, optionally tailored to the user's language.
pub fn get_system_prompt(language: Option<&str>) -> String {
    match language {
        None | Some("en") => BASE_SYSTEM_PROMPT.to_string(),
        Some(code) => {
            let name = match code {
                "de" => "German",
                other => other,
            };
            format!(
                "{BASE_SYSTEM_PROMPT} The user is speaking in {name}. \
                 Always respond in {name} unless the user explicitly asks \
                 for a different language (for example, when requesting a translation)."
            )
        }
    }
}

/// Assemble the messages list: system prompt, prior history, current user
/// text.
pub fn build_messages(
    system_prompt: &str,
    history: &[ChatMessage],
    user_text: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system_prompt));
    messages.extend_from_slice(history);
    messages.push(ChatMessage::user(user_text));
    messages
}
