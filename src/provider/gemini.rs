// SPDX-License-Identifier: MIT
//
// Google generative-language adapter. The system instruction travels in the
// request's `systemInstruction` channel; conversational turns become
// `contents` with `user`/`model` roles. The full turn list is sent on every
// call, so a conversation holding exactly one non-system message is an
// ordinary length-1 `contents` rather than a degenerate history slice.
// Streaming has no explicit stop event; end-of-body is the terminal signal.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::provider::{
    ChatRequest, ChatResponse, ChunkStream, Message, Provider, Role, StreamChunk, split_system,
};
use crate::router::ProviderKind;
use crate::sse::SseStream;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub(crate) const GEMINI_MODELS: &[&str] = &["gemini-pro", "gemini-pro-vision"];

const DEFAULT_FINISH_REASON: &str = "stop";

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct GeminiUsageMetadata {
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u32>,
}

fn build_contents(turns: &[&Message]) -> Vec<GeminiContent> {
    turns
        .iter()
        .map(|m| GeminiContent {
            role: match m.role {
                Role::Assistant => "model",
                Role::User | Role::System => "user",
            },
            parts: vec![GeminiPart {
                text: m.content.clone(),
            }],
        })
        .collect()
}

/// Concatenate the text parts of every candidate in one stream event.
fn event_text(response: &GeminiResponse) -> String {
    let mut text = String::new();
    for candidate in &response.candidates {
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                text.push_str(&part.text);
            }
        }
    }
    text
}

impl GeminiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn build_request(&self, request: &ChatRequest) -> GeminiRequest {
        let (system, turns) = split_system(&request.messages);

        GeminiRequest {
            system_instruction: system.map(|m| GeminiSystemInstruction {
                parts: vec![GeminiPart {
                    text: m.content.clone(),
                }],
            }),
            contents: build_contents(&turns),
            generation_config: GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        }
    }

    async fn send(&self, request: &ChatRequest, streaming: bool) -> Result<reqwest::Response> {
        let method = if streaming {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = format!(
            "{}/v1beta/models/{}:{}",
            self.base_url.trim_end_matches('/'),
            request.model,
            method
        );
        debug!(model = %request.model, streaming, "dispatching Gemini request");

        let body = self.build_request(request);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::provider(
                    ProviderKind::Gemini,
                    format!("Failed to connect to Gemini API ({url}): {e}"),
                )
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            warn!(status, "Gemini request failed");
            return Err(Error::provider(
                ProviderKind::Gemini,
                format!("chat failed: {status} - {text}"),
            ));
        }

        Ok(response)
    }
}

impl Provider for GeminiProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        let response = self.send(&request, false).await?;
        let parsed: GeminiResponse = response.json().await.map_err(|e| {
            Error::provider(ProviderKind::Gemini, format!("malformed response: {e}"))
        })?;

        let finish_reason = parsed
            .candidates
            .first()
            .and_then(|c| c.finish_reason.as_ref())
            .map(|r| r.to_lowercase())
            .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string());

        Ok(ChatResponse {
            content: event_text(&parsed),
            model: request.model,
            tokens_used: parsed
                .usage_metadata
                .and_then(|u| u.total_token_count)
                .unwrap_or(0),
            finish_reason,
        })
    }

    async fn stream_complete(&self, request: ChatRequest) -> Result<ChunkStream> {
        let response = self.send(&request, true).await?;

        struct State<S> {
            sse: SseStream<S>,
            done: bool,
        }

        let state = State {
            sse: SseStream::new(response.bytes_stream()),
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                match st.sse.next_event().await {
                    Some(Ok(data)) => {
                        let Ok(event) = serde_json::from_str::<GeminiResponse>(&data) else {
                            continue;
                        };
                        let text = event_text(&event);
                        if text.is_empty() {
                            continue;
                        }
                        return Some((Ok(StreamChunk::delta(text)), st));
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((
                            Err(Error::provider(
                                ProviderKind::Gemini,
                                format!("stream failed: {e}"),
                            )),
                            st,
                        ));
                    }
                    None => {
                        st.done = true;
                        return Some((Ok(StreamChunk::terminal()), st));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            messages,
            model: "gemini-pro".to_string(),
            temperature: 0.7,
            max_tokens: 2000,
            stream: false,
        }
    }

    #[test]
    fn test_roles_map_to_user_and_model() {
        let provider = GeminiProvider::new("key".to_string(), None);
        let built = provider.build_request(&request(vec![
            Message::user("q1"),
            Message::assistant("a1"),
            Message::user("q2"),
        ]));
        let roles: Vec<&str> = built.contents.iter().map(|c| c.role).collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
    }

    #[test]
    fn test_system_message_becomes_instruction() {
        let provider = GeminiProvider::new("key".to_string(), None);
        let built = provider.build_request(&request(vec![
            Message::system("rules"),
            Message::user("hi"),
        ]));
        assert_eq!(built.system_instruction.unwrap().parts[0].text, "rules");
        assert_eq!(built.contents.len(), 1);
    }

    #[test]
    fn test_single_turn_conversation_boundary() {
        // Exactly one non-system message must produce a length-1 contents
        // list, not an empty history.
        let provider = GeminiProvider::new("key".to_string(), None);
        let built = provider.build_request(&request(vec![Message::user("only")]));
        assert_eq!(built.contents.len(), 1);
        assert_eq!(built.contents[0].role, "user");
        assert_eq!(built.contents[0].parts[0].text, "only");
    }

    #[test]
    fn test_event_text_concatenates_parts() {
        let data = r#"{
            "candidates": [{"content": {"parts": [{"text": "Hel"}, {"text": "lo"}]}}]
        }"#;
        let event: GeminiResponse = serde_json::from_str(data).unwrap();
        assert_eq!(event_text(&event), "Hello");
    }

    #[test]
    fn test_usage_metadata_total() {
        let data = r#"{
            "candidates": [{"content": {"parts": [{"text": "x"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
        }"#;
        let parsed: GeminiResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.usage_metadata.unwrap().total_token_count, Some(6));
    }
}
