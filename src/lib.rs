// SPDX-License-Identifier: MIT

//! AI orchestration and conversation-context core for a multi-tenant chat
//! backend. Normalizes three vendor chat APIs behind one
//! request/response/stream contract, routes model identifiers to the
//! provider that owns them, and maintains a bounded per-conversation
//! message window under concurrent access.
//!
//! The crate has no network-facing protocol of its own; transport,
//! authentication, persistence, and quota bookkeeping are external
//! collaborators reached through the traits in [`conversation`].

pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod provider;
pub mod router;

mod sse;

pub use config::Config;
pub use context::{ContextManager, estimate_tokens};
pub use conversation::{
    ConversationEvent, ConversationService, MessageExchange, MessageRecord, MessageStore,
    QuotaGate,
};
pub use error::{Error, Result};
pub use orchestrator::{ChatBackend, ChatOptions, Orchestrator};
pub use provider::{ChatResponse, ChunkStream, Message, Role, StreamChunk};
pub use router::ProviderKind;
