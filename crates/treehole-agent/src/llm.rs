//! OpenAI-compatible chat client (DeepSeek by default).
//!
//! Non-streaming calls retry with the same backoff as the forum client.
//! Streaming calls parse the SSE `data:` lines of
//! `POST /chat/completions` with `"stream": true` and forward content
//! deltas chunk by chunk; a broken stream surfaces as an error item, not
//! a silent truncation.

use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use serde_json::Value;

use treehole_core::{AgentError, ChatModel};

use crate::config::LlmConfig;

pub struct DeepSeekClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_response_tokens: u32,
    max_retries: u32,
}

impl DeepSeekClient {
    /// Build a client from config, reading the key from
    /// `DEEPSEEK_API_KEY`.
    pub fn from_config(config: &LlmConfig) -> Result<Self, AgentError> {
        let api_key = std::env::var("DEEPSEEK_API_KEY")
            .map_err(|_| AgentError::Config("DEEPSEEK_API_KEY not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::upstream(format!("failed to build HTTP client: {e}")))?;

        Ok(DeepSeekClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_response_tokens: config.max_response_tokens,
            max_retries: config.max_retries,
        })
    }

    fn request_body(&self, system: Option<&str>, user: &str, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": user}));

        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_response_tokens,
            "stream": stream,
        })
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, AgentError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(AgentError::upstream(format!("LLM API error {status}")));
                        continue;
                    }
                    let text = response.text().await.unwrap_or_default();
                    return Err(AgentError::upstream(format!("LLM API error {status}: {text}")));
                }
                Err(e) => {
                    last_err = Some(AgentError::upstream(format!("LLM request failed: {e}")));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| AgentError::upstream("LLM request failed after retries")))
    }
}

#[async_trait]
impl ChatModel for DeepSeekClient {
    async fn complete(&self, system: Option<&str>, user: &str) -> Result<String, AgentError> {
        let body = self.request_body(system, user, false);
        let response = self.send(&body).await?;

        let json: Value = response
            .json()
            .await
            .map_err(|e| AgentError::upstream(format!("LLM returned invalid JSON: {e}")))?;

        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AgentError::upstream("LLM response missing choices[0].message.content"))
    }

    async fn complete_stream(
        &self,
        system: Option<&str>,
        user: &str,
    ) -> Result<BoxStream<'static, Result<String, AgentError>>, AgentError> {
        let body = self.request_body(system, user, true);
        let response = self.send(&body).await?;

        let (mut tx, rx) = mpsc::channel::<Result<String, AgentError>>(32);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(AgentError::upstream(format!("LLM stream broke: {e}"))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    match parse_sse_line(&line) {
                        StreamEvent::Chunk(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        StreamEvent::Done => return,
                        StreamEvent::Skip => {}
                    }
                }
            }
        });

        Ok(rx.boxed())
    }
}

/// One parsed SSE line of a streaming chat response.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Content delta to forward to the caller.
    Chunk(String),
    /// `data: [DONE]` terminator.
    Done,
    /// Blank line, comment, or delta without content (role headers etc.).
    Skip,
}

/// Parse one line of the SSE body.
pub fn parse_sse_line(line: &str) -> StreamEvent {
    let Some(data) = line.strip_prefix("data:") else {
        return StreamEvent::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return StreamEvent::Done;
    }

    let Ok(json) = serde_json::from_str::<Value>(data) else {
        return StreamEvent::Skip;
    };
    match json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
    {
        Some(content) if !content.is_empty() => StreamEvent::Chunk(content.to_string()),
        _ => StreamEvent::Skip,
    }
}
