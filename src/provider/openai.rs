// SPDX-License-Identifier: MIT
//
// OpenAI chat-completions adapter. The vendor accepts system messages as
// ordinary leading turns, so the normalized message list maps through
// one-to-one; streaming uses SSE with a `[DONE]` sentinel and signals
// completion through a non-null `finish_reason` on the final delta.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::provider::{
    ChatRequest, ChatResponse, ChunkStream, Message, Provider, Role, StreamChunk,
};
use crate::router::ProviderKind;
use crate::sse::SseStream;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub(crate) const OPENAI_MODELS: &[&str] = &["gpt-4-turbo", "gpt-4", "gpt-3.5-turbo"];

const DEFAULT_FINISH_REASON: &str = "stop";

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    total_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct OpenAiChunk {
    choices: Vec<OpenAiChunkChoice>,
}

#[derive(Deserialize)]
struct OpenAiChunkChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiDelta {
    content: Option<String>,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn build_messages(messages: &[Message]) -> Vec<OpenAiMessage> {
    messages
        .iter()
        .map(|m| OpenAiMessage {
            role: role_str(m.role),
            content: m.content.clone(),
        })
        .collect()
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn build_request(&self, request: &ChatRequest) -> OpenAiRequest {
        OpenAiRequest {
            model: request.model.clone(),
            messages: build_messages(&request.messages),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: request.stream,
        }
    }

    async fn send(&self, body: &OpenAiRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!(model = %body.model, stream = body.stream, "dispatching OpenAI request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                Error::provider(
                    ProviderKind::OpenAi,
                    format!("Failed to connect to OpenAI API ({url}): {e}"),
                )
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            warn!(status, "OpenAI request failed");
            return Err(Error::provider(
                ProviderKind::OpenAi,
                format!("chat failed: {status} - {text}"),
            ));
        }

        Ok(response)
    }
}

impl Provider for OpenAiProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        let mut body = self.build_request(&request);
        body.stream = false;

        let response = self.send(&body).await?;
        let parsed: OpenAiResponse = response.json().await.map_err(|e| {
            Error::provider(ProviderKind::OpenAi, format!("malformed response: {e}"))
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            Error::provider(ProviderKind::OpenAi, "response contained no choices")
        })?;

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            model: parsed.model,
            tokens_used: parsed.usage.and_then(|u| u.total_tokens).unwrap_or(0),
            finish_reason: choice
                .finish_reason
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
                        let Ok(chunk) = serde_json::from_str::<OpenAiChunk>(&data) else {
                            continue;
                        };
                        let Some(choice) = chunk.choices.into_iter().next() else {
                            continue;
                        };

                        let content = choice.delta.content.unwrap_or_default();
                        if choice.finish_reason.is_some() {
                            st.done = true;
                            return Some((Ok(StreamChunk { content, done: true }), st));
                        }
                        if content.is_empty() {
                            continue;
                        }
                        return Some((Ok(StreamChunk::delta(content)), st));
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((
                            Err(Error::provider(
                                ProviderKind::OpenAi,
                                format!("stream failed: {e}"),
                            )),
                            st,
                        ));
                    }
                    None => {
                        // Vendor closed the stream without a finish_reason;
                        // the terminal chunk is still owed to the consumer.
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
    fn test_build_messages_maps_roles() {
        let messages = vec![
            Message::system("rules"),
            Message::user("hi"),
            Message::assistant("hello"),
        ];
        let built = build_messages(&messages);
        assert_eq!(built.len(), 3);
        assert_eq!(built[0].role, "system");
        assert_eq!(built[1].role, "user");
        assert_eq!(built[2].role, "assistant");
        assert_eq!(built[0].content, "rules");
    }

    #[test]
    fn test_parse_delta_chunk() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        let chunk: OpenAiChunk = serde_json::from_str(data).unwrap();
        let choice = &chunk.choices[0];
        assert_eq!(choice.delta.content.as_deref(), Some("Hel"));
        assert!(choice.finish_reason.is_none());
    }

    #[test]
    fn test_parse_terminal_chunk() {
        let data = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        let chunk: OpenAiChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_response_with_usage() {
        let data = r#"{
            "model": "gpt-4-turbo",
            "choices": [{"message": {"content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
        }"#;
        let parsed: OpenAiResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.model, "gpt-4-turbo");
        assert_eq!(parsed.usage.unwrap().total_tokens, Some(12));
    }
}
