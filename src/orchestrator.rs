// SPDX-License-Identifier: MIT
//
// Provider-agnostic chat facade. Requests are validated and routed before
// any network state is touched; vendor failures come back wrapped with the
// provider's identity so callers can tell "OpenAI is down" from "Anthropic
// rejected this request". No retries happen here; retry policy belongs to
// the caller.

use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::provider::anthropic::{ANTHROPIC_MODELS, AnthropicProvider};
use crate::provider::gemini::{GEMINI_MODELS, GeminiProvider};
use crate::provider::openai::{OPENAI_MODELS, OpenAiProvider};
use crate::provider::{ChatRequest, ChatResponse, ChunkStream, Message, Provider, validate_request};
use crate::router::{ProviderKind, route};

/// Per-request overrides; anything unset falls back to the process-wide
/// configured defaults.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// The seam consumed by the conversation service. `Orchestrator` is the
/// production implementation; tests substitute scripted backends.
pub trait ChatBackend: Send + Sync {
    fn chat(
        &self,
        messages: Vec<Message>,
        options: ChatOptions,
    ) -> impl std::future::Future<Output = Result<ChatResponse>> + Send;

    fn stream_chat(
        &self,
        messages: Vec<Message>,
        options: ChatOptions,
    ) -> impl std::future::Future<Output = Result<ChunkStream>> + Send;
}

pub struct Orchestrator {
    openai: Option<OpenAiProvider>,
    anthropic: Option<AnthropicProvider>,
    gemini: Option<GeminiProvider>,
    default_model: String,
    default_temperature: f32,
    default_max_tokens: u32,
}

impl Orchestrator {
    /// Build adapters for every provider with configured credentials.
    /// No connectivity is required or attempted.
    pub fn new(config: &Config) -> Self {
        let providers = &config.providers;
        Self {
            openai: providers
                .openai
                .as_ref()
                .map(|c| OpenAiProvider::new(c.api_key.clone(), c.base_url.clone())),
            anthropic: providers
                .anthropic
                .as_ref()
                .map(|c| AnthropicProvider::new(c.api_key.clone(), c.base_url.clone())),
            gemini: providers
                .gemini
                .as_ref()
                .map(|c| GeminiProvider::new(c.api_key.clone(), c.base_url.clone())),
            default_model: config.default_model.clone(),
            default_temperature: config.default_temperature,
            default_max_tokens: config.default_max_tokens,
        }
    }

    /// Models usable in the current process: the catalog of every provider
    /// whose credentials are configured. Answered without any network probe.
    pub fn available_models(&self) -> Vec<String> {
        let mut models = Vec::new();
        if self.openai.is_some() {
            models.extend(OPENAI_MODELS.iter().map(|m| m.to_string()));
        }
        if self.anthropic.is_some() {
            models.extend(ANTHROPIC_MODELS.iter().map(|m| m.to_string()));
        }
        if self.gemini.is_some() {
            models.extend(GEMINI_MODELS.iter().map(|m| m.to_string()));
        }
        models
    }

    fn resolve(
        &self,
        messages: Vec<Message>,
        options: ChatOptions,
        stream: bool,
    ) -> Result<(ChatRequest, ProviderKind)> {
        let request = ChatRequest {
            messages,
            model: options
                .model
                .unwrap_or_else(|| self.default_model.clone()),
            temperature: options.temperature.unwrap_or(self.default_temperature),
            max_tokens: options.max_tokens.unwrap_or(self.default_max_tokens),
            stream,
        };

        validate_request(&request)?;
        let kind = route(&request.model)?;
        debug!(model = %request.model, provider = kind.id(), stream, "routed chat request");
        Ok((request, kind))
    }

    fn missing_credentials(kind: ProviderKind) -> Error {
        Error::provider(kind, "no API key configured for this provider")
    }
}

impl ChatBackend for Orchestrator {
    async fn chat(&self, messages: Vec<Message>, options: ChatOptions) -> Result<ChatResponse> {
        let (request, kind) = self.resolve(messages, options, false)?;

        match kind {
            ProviderKind::OpenAi => {
                let provider = self
                    .openai
                    .as_ref()
                    .ok_or_else(|| Self::missing_credentials(kind))?;
                provider.complete(request).await
            }
            ProviderKind::Anthropic => {
                let provider = self
                    .anthropic
                    .as_ref()
                    .ok_or_else(|| Self::missing_credentials(kind))?;
                provider.complete(request).await
            }
            ProviderKind::Gemini => {
                let provider = self
                    .gemini
                    .as_ref()
                    .ok_or_else(|| Self::missing_credentials(kind))?;
                provider.complete(request).await
            }
        }
    }

    async fn stream_chat(
        &self,
        messages: Vec<Message>,
        options: ChatOptions,
    ) -> Result<ChunkStream> {
        let (request, kind) = self.resolve(messages, options, true)?;

        match kind {
            ProviderKind::OpenAi => {
                let provider = self
                    .openai
                    .as_ref()
                    .ok_or_else(|| Self::missing_credentials(kind))?;
                provider.stream_complete(request).await
            }
            ProviderKind::Anthropic => {
                let provider = self
                    .anthropic
                    .as_ref()
                    .ok_or_else(|| Self::missing_credentials(kind))?;
                provider.stream_complete(request).await
            }
            ProviderKind::Gemini => {
                let provider = self
                    .gemini
                    .as_ref()
                    .ok_or_else(|| Self::missing_credentials(kind))?;
                provider.stream_complete(request).await
            }
        }
    }
}
