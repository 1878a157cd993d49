//! Model gateway: unified interface to the language-model provider.
//!
//! The gateway yields either a final string or a lazy, non-restartable
//! token stream that the orchestrator pulls and republishes as
//! `StreamToken` envelopes. Lifecycle decisions never live here.

mod openai;

pub use openai::OpenAiProvider;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::config::ModelConfig;
use crate::error::ModelError;

/// Message role in the prompt array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub messages: Vec<ChatMessage>,
    pub reasoning: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Lazy finite token sequence. Pull-based and not restartable; the consumer
/// owns pacing and republication.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

/// Interface to a model provider.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    fn model_name(&self) -> &str;

    /// Generate a complete reply.
    async fn generate(&self, request: GenerateRequest) -> Result<String, ModelError>;

    /// Generate a streamed reply.
    async fn generate_stream(&self, request: GenerateRequest) -> Result<TokenStream, ModelError>;
}

/// Primary provider with an optional second provider tried on failure.
pub struct FallbackGateway {
    primary: Arc<dyn ModelGateway>,
    fallback: Option<Arc<dyn ModelGateway>>,
}

impl FallbackGateway {
    pub fn new(primary: Arc<dyn ModelGateway>, fallback: Option<Arc<dyn ModelGateway>>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl ModelGateway for FallbackGateway {
    fn model_name(&self) -> &str {
        self.primary.model_name()
    }

    async fn generate(&self, request: GenerateRequest) -> Result<String, ModelError> {
        match self.primary.generate(request.clone()).await {
            Ok(text) => Ok(text),
            Err(e) => match &self.fallback {
                Some(cloud) => {
                    tracing::warn!(error = %e, "primary model failed, trying fallback");
                    cloud.generate(request).await
                }
                None => Err(e),
            },
        }
    }

    async fn generate_stream(&self, request: GenerateRequest) -> Result<TokenStream, ModelError> {
        match self.primary.generate_stream(request.clone()).await {
            Ok(stream) => Ok(stream),
            Err(e) => match &self.fallback {
                Some(cloud) => {
                    tracing::warn!(error = %e, "primary model failed, trying fallback stream");
                    cloud.generate_stream(request).await
                }
                None => Err(e),
            },
        }
    }
}

/// Build the gateway from configuration.
pub fn create_model_gateway(config: &ModelConfig) -> Arc<dyn ModelGateway> {
    let primary: Arc<dyn ModelGateway> = Arc::new(OpenAiProvider::new(
        config.base_url.clone(),
        config.name.clone(),
        config.api_key.clone(),
        config.reasoning_suffix.clone(),
        config.request_timeout_secs,
        config.stream_timeout_secs,
    ));
    if !config.cloud_fallback_enabled {
        return primary;
    }
    let fallback = match (
        &config.cloud_base_url,
        &config.cloud_name,
        &config.cloud_api_key,
    ) {
        (Some(url), Some(name), Some(key)) => Some(Arc::new(OpenAiProvider::new(
            url.clone(),
            name.clone(),
            key.clone(),
            String::new(),
            config.request_timeout_secs,
            config.stream_timeout_secs,
        )) as Arc<dyn ModelGateway>),
        _ => {
            tracing::warn!("cloud fallback enabled but not fully configured; ignoring");
            None
        }
    };
    Arc::new(FallbackGateway::new(primary, fallback))
}
