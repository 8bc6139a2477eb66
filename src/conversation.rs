// SPDX-License-Identifier: MIT
//
// Sequencing layer between transport and the core: persist the user
// message, update the context, call the model, persist the answer, update
// the context again. Persistence and quota bookkeeping live behind the
// collaborator traits; this module owns only the ordering.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::config;
use crate::context::{ContextManager, estimate_tokens};
use crate::error::Result;
use crate::orchestrator::{ChatBackend, ChatOptions};
use crate::provider::Role;

/// Fallback model recorded against a user-authored message.
const USER_INPUT_MODEL: &str = "user-input";

/// System instruction applied to conversations that do not carry their own.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Be concise, accurate, \
and helpful. When users ask you to perform actions, use the capabilities available to you to \
complete the tasks.";

/// A message row in the shape the storage collaborator persists.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub tokens_used: u32,
    pub model_used: String,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    fn new(
        conversation_id: &str,
        role: Role,
        content: &str,
        tokens_used: u32,
        model_used: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            tokens_used,
            model_used: model_used.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Persistence collaborator, implemented by the storage layer outside the
/// core.
pub trait MessageStore: Send + Sync {
    fn persist_message(
        &self,
        message: &MessageRecord,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Quota collaborator, implemented by the billing layer outside the core.
pub trait QuotaGate: Send + Sync {
    fn check_quota(
        &self,
        workspace_id: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn record_usage(
        &self,
        workspace_id: &str,
        tokens: u64,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Both sides of one completed exchange.
#[derive(Debug, Clone)]
pub struct MessageExchange {
    pub user_message: MessageRecord,
    pub assistant_message: MessageRecord,
}

/// Incremental events surfaced to the transport layer. A failed generation
/// ends with exactly one `Error` event so clients can tell "done" from
/// "failed"; the connection is never just dropped.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConversationEvent {
    User { message_id: String, content: String },
    Delta { content: String },
    Done { message_id: String },
    Error { message: String },
}

/// Encode an event as a Server-Sent-Events frame.
pub fn sse_frame(event: &ConversationEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("data: {json}\n\n")
}

/// Terminal frame closing an SSE response.
pub const SSE_DONE_FRAME: &str = "data: [DONE]\n\n";

pub struct ConversationService<B, S, Q> {
    backend: B,
    store: S,
    quota: Q,
    contexts: Arc<ContextManager>,
}

impl<B, S, Q> ConversationService<B, S, Q>
where
    B: ChatBackend,
    S: MessageStore,
    Q: QuotaGate,
{
    pub fn new(backend: B, store: S, quota: Q, contexts: Arc<ContextManager>) -> Self {
        Self {
            backend,
            store,
            quota,
            contexts,
        }
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    /// Persist and contextualize the user message, then run the exchange to
    /// completion and persist the answer.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        workspace_id: &str,
        content: &str,
        model: Option<String>,
    ) -> Result<MessageExchange> {
        self.quota.check_quota(workspace_id).await?;

        let user_message = self.accept_user_message(conversation_id, content, &model).await?;

        let messages = self.contexts.get_messages_for_ai(conversation_id)?;
        let options = ChatOptions {
            model,
            ..ChatOptions::default()
        };
        let response = self.backend.chat(messages, options).await?;

        let assistant_message = MessageRecord::new(
            conversation_id,
            Role::Assistant,
            &response.content,
            response.tokens_used,
            &response.model,
        );
        self.store.persist_message(&assistant_message).await?;
        self.contexts.add_message(
            conversation_id,
            Role::Assistant,
            &response.content,
            response.tokens_used,
        )?;

        self.quota
            .record_usage(
                workspace_id,
                u64::from(user_message.tokens_used) + u64::from(response.tokens_used),
            )
            .await?;

        Ok(MessageExchange {
            user_message,
            assistant_message,
        })
    }

    /// Like `send_message`, but the answer is surfaced incrementally. The
    /// returned stream yields the accepted user message, then deltas, then
    /// a single `Done` (or `Error`) event.
    pub async fn stream_message(
        &self,
        conversation_id: &str,
        workspace_id: &str,
        content: &str,
        model: Option<String>,
    ) -> Result<impl Stream<Item = ConversationEvent> + Send + '_> {
        self.quota.check_quota(workspace_id).await?;

        let user_message = self.accept_user_message(conversation_id, content, &model).await?;

        let messages = self.contexts.get_messages_for_ai(conversation_id)?;
        let options = ChatOptions {
            model: model.clone(),
            ..ChatOptions::default()
        };
        let upstream = self.backend.stream_chat(messages, options).await?;

        enum Phase {
            User,
            Streaming,
            Finish,
            Ended,
        }

        struct StreamState<'a, B, S, Q> {
            service: &'a ConversationService<B, S, Q>,
            upstream: crate::provider::ChunkStream,
            phase: Phase,
            conversation_id: String,
            workspace_id: String,
            model_used: String,
            user_message_id: String,
            user_content: String,
            user_tokens: u32,
            full_response: String,
        }

        let state = StreamState {
            service: self,
            upstream,
            phase: Phase::User,
            conversation_id: conversation_id.to_string(),
            workspace_id: workspace_id.to_string(),
            model_used: model.unwrap_or_else(|| config::DEFAULT_MODEL.to_string()),
            user_message_id: user_message.id,
            user_content: content.to_string(),
            user_tokens: user_message.tokens_used,
            full_response: String::new(),
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            loop {
                match st.phase {
                    Phase::User => {
                        st.phase = Phase::Streaming;
                        let event = ConversationEvent::User {
                            message_id: st.user_message_id.clone(),
                            content: st.user_content.clone(),
                        };
                        return Some((event, st));
                    }
                    Phase::Streaming => match st.upstream.next().await {
                        Some(Ok(chunk)) => {
                            st.full_response.push_str(&chunk.content);
                            if chunk.done {
                                st.phase = Phase::Finish;
                                if chunk.content.is_empty() {
                                    continue;
                                }
                            } else if chunk.content.is_empty() {
                                continue;
                            }
                            return Some((
                                ConversationEvent::Delta {
                                    content: chunk.content,
                                },
                                st,
                            ));
                        }
                        Some(Err(e)) => {
                            warn!(conversation_id = %st.conversation_id, error = %e, "generation failed mid-stream");
                            st.phase = Phase::Ended;
                            return Some((
                                ConversationEvent::Error {
                                    message: e.to_string(),
                                },
                                st,
                            ));
                        }
                        None => {
                            st.phase = Phase::Finish;
                        }
                    },
                    Phase::Finish => {
                        st.phase = Phase::Ended;
                        let event = finish_exchange(&mut st).await;
                        return Some((event, st));
                    }
                    Phase::Ended => return None,
                }
            }
        });

        async fn finish_exchange<B, S, Q>(
            st: &mut StreamState<'_, B, S, Q>,
        ) -> ConversationEvent
        where
            B: ChatBackend,
            S: MessageStore,
            Q: QuotaGate,
        {
            let total_tokens = estimate_tokens(&st.full_response);
            let assistant_message = MessageRecord::new(
                &st.conversation_id,
                Role::Assistant,
                &st.full_response,
                total_tokens,
                &st.model_used,
            );

            let outcome: Result<()> = async {
                st.service.store.persist_message(&assistant_message).await?;
                st.service.contexts.add_message(
                    &st.conversation_id,
                    Role::Assistant,
                    &st.full_response,
                    total_tokens,
                )?;
                st.service
                    .quota
                    .record_usage(
                        &st.workspace_id,
                        u64::from(st.user_tokens) + u64::from(total_tokens),
                    )
                    .await
            }
            .await;

            match outcome {
                Ok(()) => ConversationEvent::Done {
                    message_id: assistant_message.id,
                },
                Err(e) => {
                    warn!(conversation_id = %st.conversation_id, error = %e, "failed to finalize exchange");
                    ConversationEvent::Error {
                        message: e.to_string(),
                    }
                }
            }
        }

        Ok(stream)
    }

    /// Persist the inbound user message and append it to the context.
    async fn accept_user_message(
        &self,
        conversation_id: &str,
        content: &str,
        model: &Option<String>,
    ) -> Result<MessageRecord> {
        let tokens = estimate_tokens(content);
        let record = MessageRecord::new(
            conversation_id,
            Role::User,
            content,
            tokens,
            model.as_deref().unwrap_or(USER_INPUT_MODEL),
        );
        self.store.persist_message(&record).await?;
        self.contexts
            .add_message(conversation_id, Role::User, content, tokens)?;
        Ok(record)
    }
}
