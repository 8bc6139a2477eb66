// SPDX-License-Identifier: MIT
//
// Anthropic messages-API adapter. The system instruction travels in the
// request's dedicated `system` field, never as a conversational turn.
// Streaming is SSE with typed events; `message_stop` is the terminal
// signal, flattened into the normalized `done: true` chunk.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::provider::{
    ChatRequest, ChatResponse, ChunkStream, Message, Provider, Role, StreamChunk, split_system,
};
use crate::router::ProviderKind;
use crate::sse::SseStream;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub(crate) const ANTHROPIC_MODELS: &[&str] = &[
    "claude-3-opus-20240229",
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
];

const DEFAULT_FINISH_REASON: &str = "end_turn";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
}

/// Build the conversational turns. The turn order is preserved exactly;
/// consecutive same-role turns are passed through untouched, and if the
/// vendor rejects the shape that rejection surfaces as a provider error
/// rather than a guessed repair.
fn build_messages(turns: &[&Message]) -> Vec<AnthropicMessage> {
    turns
        .iter()
        .map(|m| AnthropicMessage {
            role: match m.role {
                Role::Assistant => "assistant",
                Role::User | Role::System => "user",
            },
            content: m.content.clone(),
        })
        .collect()
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn build_request(&self, request: &ChatRequest) -> AnthropicRequest {
        let (system, turns) = split_system(&request.messages);

        AnthropicRequest {
            model: request.model.clone(),
            messages: build_messages(&turns),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: system.map(|m| m.content.clone()),
            stream: request.stream,
        }
    }

    async fn send(&self, body: &AnthropicRequest) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        debug!(model = %body.model, stream = body.stream, "dispatching Anthropic request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                Error::provider(
                    ProviderKind::Anthropic,
                    format!("Failed to connect to Anthropic API ({url}): {e}"),
                )
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            warn!(status, "Anthropic request failed");
            return Err(Error::provider(
                ProviderKind::Anthropic,
                format!("chat failed: {status} - {text}"),
            ));
        }

        Ok(response)
    }
}

impl Provider for AnthropicProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        let mut body = self.build_request(&request);
        body.stream = false;

        let response = self.send(&body).await?;
        let parsed: AnthropicResponse = response.json().await.map_err(|e| {
            Error::provider(ProviderKind::Anthropic, format!("malformed response: {e}"))
        })?;

        let content = parsed
            .content
            .iter()
            .find(|b| b.kind == "text")
            .map(|b| b.text.clone())
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            model: parsed.model,
            tokens_used: parsed.usage.input_tokens + parsed.usage.output_tokens,
            finish_reason: parsed
                .stop_reason
                .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string()),
        })
    }

    async fn stream_complete(&self, request: ChatRequest) -> Result<ChunkStream> {
        let mut body = self.build_request(&request);
        body.stream = true;

        let response = self.send(&body).await?;

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
                        let Ok(event) = serde_json::from_str::<StreamEvent>(&data) else {
                            continue;
                        };

                        match event.event_type.as_str() {
                            "content_block_delta" => {
                                let text = event
                                    .delta
                                    .filter(|d| d.kind.as_deref() == Some("text_delta"))
                                    .and_then(|d| d.text);
                                if let Some(text) = text
                                    && !text.is_empty()
                                {
                                    return Some((Ok(StreamChunk::delta(text)), st));
                                }
                            }
                            "message_stop" => {
                                st.done = true;
                                return Some((Ok(StreamChunk::terminal()), st));
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((
                            Err(Error::provider(
                                ProviderKind::Anthropic,
                                format!("stream failed: {e}"),
                            )),
                            st,
                        ));
                    }
                    None => {
                        // Stream closed without message_stop; the terminal
                        // chunk is still owed to the consumer.
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

    #[test]
    fn test_system_message_moves_to_system_field() {
        let provider = AnthropicProvider::new("key".to_string(), None);
        let request = ChatRequest {
            messages: vec![
                Message::system("be brief"),
                Message::user("hi"),
                Message::assistant("hello"),
            ],
            model: "claude-3-opus-20240229".to_string(),
            temperature: 0.7,
            max_tokens: 2000,
            stream: false,
        };

        let built = provider.build_request(&request);
        assert_eq!(built.system.as_deref(), Some("be brief"));
        assert_eq!(built.messages.len(), 2);
        assert_eq!(built.messages[0].role, "user");
        assert_eq!(built.messages[1].role, "assistant");
    }

    #[test]
    fn test_consecutive_same_role_turns_preserved() {
        let turns = [Message::user("a"), Message::user("b")];
        let refs: Vec<&Message> = turns.iter().collect();
        let built = build_messages(&refs);
        assert_eq!(built.len(), 2);
        assert_eq!(built[0].content, "a");
        assert_eq!(built[1].content, "b");
    }

    #[test]
    fn test_parse_text_delta_event() {
        let data = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        let event: StreamEvent = serde_json::from_str(data).unwrap();
        assert_eq!(event.event_type, "content_block_delta");
        assert_eq!(event.delta.unwrap().text.as_deref(), Some("Hi"));
    }

    #[test]
    fn test_parse_response_usage_totals() {
        let data = r#"{
            "model": "claude-3-opus-20240229",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 9, "output_tokens": 3}
        }"#;
        let parsed: AnthropicResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.usage.input_tokens + parsed.usage.output_tokens, 12);
        assert_eq!(parsed.content[0].text, "hello");
    }
}
