//! OpenAI-compatible provider (Ollama, LM Studio, vLLM, or the hosted API).
//!
//! Non-streaming calls use the chat-completions endpoint directly; streamed
//! calls read the SSE body line by line and hand single content deltas to
//! the caller through a bounded channel.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ModelError;
use crate::llm::{ChatMessage, GenerateRequest, ModelGateway, TokenStream};

const PROVIDER: &str = "openai";

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: SecretString,
    reasoning_suffix: String,
    request_timeout: Duration,
    stream_timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(
        base_url: String,
        model: String,
        api_key: SecretString,
        reasoning_suffix: String,
        request_timeout_secs: u64,
        stream_timeout_secs: u64,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
            reasoning_suffix,
            request_timeout: Duration::from_secs(request_timeout_secs),
            stream_timeout: Duration::from_secs(stream_timeout_secs),
        }
    }

    fn model_for(&self, reasoning: bool) -> String {
        if reasoning && !self.reasoning_suffix.is_empty() {
            format!("{}{}", self.model, self.reasoning_suffix)
        } else {
            self.model.clone()
        }
    }

    fn build_body(&self, request: &GenerateRequest, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model_for(request.reasoning),
            messages: request
                .messages
                .iter()
                .map(|m: &ChatMessage| ApiMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            stream,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }

    async fn post(
        &self,
        body: &ChatCompletionRequest,
        timeout: Duration,
    ) -> Result<reqwest::Response, ModelError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let reason = match response.json::<ApiErrorBody>().await {
                Ok(err) => err.error.message,
                Err(_) => format!("HTTP {status}"),
            };
            return Err(ModelError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("{status}: {reason}"),
            });
        }
        Ok(response)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ApiMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
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

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Parse one SSE line into a content delta. Returns `Ok(None)` for
/// keepalives and chunks without content, `Err(())` for the end marker.
fn parse_sse_line(line: &str) -> Result<Option<String>, ()> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Err(());
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())),
        Err(_) => Ok(None),
    }
}

#[async_trait]
impl ModelGateway for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: GenerateRequest) -> Result<String, ModelError> {
        let body = self.build_body(&request, false);
        let response = self.post(&body, self.request_timeout).await?;
        let parsed: ChatCompletionResponse =
            response
                .json()
                .await
                .map_err(|e| ModelError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: e.to_string(),
                })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ModelError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: "no content in response".to_string(),
            })
    }

    async fn generate_stream(&self, request: GenerateRequest) -> Result<TokenStream, ModelError> {
        let body = self.build_body(&request, true);
        let response = self.post(&body, self.stream_timeout).await?;
        let (tx, rx) = mpsc::channel::<Result<String, ModelError>>(64);
        let stream_timeout = self.stream_timeout;

        tokio::spawn(async move {
            let mut bytes = Box::pin(response.bytes_stream());
            let mut buffer = String::new();
            let deadline = tokio::time::Instant::now() + stream_timeout;
            loop {
                let chunk = match tokio::time::timeout_at(deadline, bytes.next()).await {
                    Ok(Some(Ok(chunk))) => chunk,
                    Ok(Some(Err(e))) => {
                        let _ = tx
                            .send(Err(ModelError::StreamInterrupted {
                                reason: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                    Ok(None) => return,
                    Err(_) => {
                        let _ = tx
                            .send(Err(ModelError::Timeout {
                                provider: PROVIDER.to_string(),
                            }))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].to_string();
                    buffer.drain(..=pos);
                    match parse_sse_line(&line) {
                        Ok(Some(token)) => {
                            if tx.send(Ok(token)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(()) => return,
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_line_with_content() {
        let line = r#"data: {"choices":[{"delta":{"content":"he"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap().as_deref(), Some("he"));
    }

    #[test]
    fn sse_done_marker_ends_stream() {
        assert!(parse_sse_line("data: [DONE]").is_err());
    }

    #[test]
    fn sse_keepalive_and_empty_deltas_skipped() {
        assert_eq!(parse_sse_line(": keepalive").unwrap(), None);
        let empty = r#"data: {"choices":[{"delta":{}}]}"#;
        assert_eq!(parse_sse_line(empty).unwrap(), None);
    }

    #[test]
    fn reasoning_suffix_applied() {
        let p = OpenAiProvider::new(
            "http://localhost:11434/v1".into(),
            "llama3.2".into(),
            SecretString::from("ollama".to_string()),
            ":reasoning".into(),
            120,
            300,
        );
        assert_eq!(p.model_for(true), "llama3.2:reasoning");
        assert_eq!(p.model_for(false), "llama3.2");
    }
}
