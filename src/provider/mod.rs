// SPDX-License-Identifier: MIT
//
// The normalized request/response/stream contract shared by all vendor
// adapters, and the trait each adapter implements.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Vendor-reported or estimated token cost of this message. Zero means
    /// unknown, not empty.
    #[serde(default)]
    pub tokens_used: u32,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tokens_used: 0,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tokens_used: 0,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tokens_used: 0,
        }
    }
}

/// A vendor-agnostic chat request. Adapters translate this into their
/// vendor's native call shape and nothing else; defaults for temperature
/// and max_tokens are resolved by the orchestrator before dispatch.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

/// A vendor-agnostic chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    /// Vendor-reported total (input + output). Zero when the vendor does
    /// not report usage; callers must treat that as "unknown", never as an
    /// empty response.
    pub tokens_used: u32,
    pub finish_reason: String,
}

/// One increment of an in-progress answer. A stream yields any number of
/// delta chunks followed by exactly one chunk with `done: true` (which may
/// carry empty content).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
}

impl StreamChunk {
    pub(crate) fn delta(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: false,
        }
    }

    pub(crate) fn terminal() -> Self {
        Self {
            content: String::new(),
            done: true,
        }
    }
}

/// Lazy, finite, non-restartable chunk sequence. Pull-based: dropping the
/// stream (or simply no longer polling it) stops all further reads from the
/// vendor connection.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Trait implemented by every vendor adapter.
pub trait Provider: Send + Sync {
    /// Blocking completion: one request, one normalized response.
    fn complete(
        &self,
        request: ChatRequest,
    ) -> impl std::future::Future<Output = Result<ChatResponse>> + Send;

    /// Streaming completion. Setup failures surface here; mid-stream
    /// failures surface as an `Err` item that terminates the sequence.
    fn stream_complete(
        &self,
        request: ChatRequest,
    ) -> impl std::future::Future<Output = Result<ChunkStream>> + Send;
}

/// Split the first system message off from the conversational turns.
///
/// At most one system message is honored; the remaining messages keep
/// their original order. Additional system-role entries (which the context
/// manager never produces) are passed through as turns so nothing is
/// silently dropped.
pub(crate) fn split_system(messages: &[Message]) -> (Option<&Message>, Vec<&Message>) {
    let mut system = None;
    let mut turns = Vec::with_capacity(messages.len());

    for message in messages {
        if system.is_none() && message.role == Role::System {
            system = Some(message);
        } else {
            turns.push(message);
        }
    }

    (system, turns)
}

/// Validate the caller-supplied portion of a request before routing.
pub(crate) fn validate_request(request: &ChatRequest) -> Result<()> {
    if request.messages.is_empty() {
        return Err(Error::Validation("messages must not be empty".to_string()));
    }
    if !(0.0..=2.0).contains(&request.temperature) {
        return Err(Error::Validation(format!(
            "temperature must be in [0, 2], got {}",
            request.temperature
        )));
    }
    if request.max_tokens == 0 {
        return Err(Error::Validation("max_tokens must be at least 1".to_string()));
    }
    Ok(())
}
