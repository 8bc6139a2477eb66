// SPDX-License-Identifier: MIT
//
// Per-conversation message windows. One context exists per conversation id
// at a time; every mutation runs under that entry's map guard, so
// same-conversation operations are serialized while distinct conversations
// never interfere. Trimming is a two-stage count-then-budget eviction that
// never removes system messages: instructions survive context pressure even
// at the cost of conversational continuity.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::config;
use crate::error::{Error, Result};
use crate::provider::{Message, Role};

const MAX_MESSAGES_PER_CONTEXT: usize = 50;
const MAX_TOKENS_PER_CONTEXT: u64 = 8000;

/// Minimum number of non-system messages trimming will never go below,
/// even while over the token budget.
const RETAINED_FLOOR: usize = 2;

/// Estimate the token cost of a piece of text: roughly one token per four
/// characters. An approximation, not a vendor tokenizer; window budgets are
/// calibrated against it.
pub fn estimate_tokens(text: &str) -> u32 {
    text.chars().count().div_ceil(4) as u32
}

fn estimate_messages(messages: &[Message]) -> u64 {
    messages
        .iter()
        .map(|m| u64::from(estimate_tokens(&m.content)))
        .sum()
}

#[derive(Debug, Clone)]
pub struct ContextMetadata {
    pub user_id: String,
    pub workspace_id: String,
    pub model: String,
    /// Running token estimate: bumped additively on append, recomputed
    /// exactly on bulk load.
    pub total_tokens: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub metadata: ContextMetadata,
}

#[derive(Debug, Clone)]
pub struct ContextSummary {
    pub message_count: usize,
    pub total_tokens: u64,
    pub model: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ContextOverview {
    pub conversation_id: String,
    pub message_count: usize,
    pub total_tokens: u64,
    pub user_id: String,
}

/// A message row as persisted by the storage layer. Roles outside the three
/// valid values are dropped on load.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
}

pub struct ContextManager {
    contexts: DashMap<String, ConversationContext>,
    max_messages: usize,
    max_tokens: u64,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextManager {
    pub fn new() -> Self {
        Self::with_limits(MAX_MESSAGES_PER_CONTEXT, MAX_TOKENS_PER_CONTEXT)
    }

    pub fn with_limits(max_messages: usize, max_tokens: u64) -> Self {
        Self {
            contexts: DashMap::new(),
            max_messages,
            max_tokens,
        }
    }

    /// Create a context for the conversation, replacing any existing one.
    pub fn create_context(
        &self,
        conversation_id: &str,
        user_id: &str,
        workspace_id: &str,
        system_prompt: Option<String>,
    ) -> ConversationContext {
        let now = Utc::now();
        let context = ConversationContext {
            conversation_id: conversation_id.to_string(),
            messages: Vec::new(),
            system_prompt,
            metadata: ContextMetadata {
                user_id: user_id.to_string(),
                workspace_id: workspace_id.to_string(),
                model: config::DEFAULT_MODEL.to_string(),
                total_tokens: 0,
                created_at: now,
                updated_at: now,
            },
        };

        self.contexts
            .insert(conversation_id.to_string(), context.clone());
        context
    }

    /// Look up a context without creating one as a side effect.
    pub fn get_context(&self, conversation_id: &str) -> Option<ConversationContext> {
        self.contexts.get(conversation_id).map(|c| c.clone())
    }

    /// Append a message, bump the running totals, and trim synchronously
    /// before returning.
    pub fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        tokens_used: u32,
    ) -> Result<()> {
        let mut entry = self
            .contexts
            .get_mut(conversation_id)
            .ok_or_else(|| Error::ContextNotFound(conversation_id.to_string()))?;

        entry.messages.push(Message {
            role,
            content: content.to_string(),
            tokens_used,
        });
        entry.metadata.total_tokens += u64::from(tokens_used);
        entry.metadata.updated_at = Utc::now();

        self.trim(&mut entry);
        Ok(())
    }

    /// The exact ordered payload handed upstream: the system prompt (when
    /// set) followed by the conversation messages.
    pub fn get_messages_for_ai(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let entry = self
            .contexts
            .get(conversation_id)
            .ok_or_else(|| Error::ContextNotFound(conversation_id.to_string()))?;

        let mut messages = Vec::with_capacity(entry.messages.len() + 1);
        if let Some(prompt) = &entry.system_prompt {
            messages.push(Message::system(prompt.clone()));
        }
        messages.extend(entry.messages.iter().cloned());
        Ok(messages)
    }

    /// Replace the stored system prompt. An existing system-role entry in
    /// the message list is updated in place; otherwise one is inserted at
    /// position 0. At most one system entry exists at any time.
    pub fn update_system_prompt(&self, conversation_id: &str, system_prompt: &str) -> Result<()> {
        let mut entry = self
            .contexts
            .get_mut(conversation_id)
            .ok_or_else(|| Error::ContextNotFound(conversation_id.to_string()))?;

        entry.system_prompt = Some(system_prompt.to_string());

        if let Some(existing) = entry.messages.iter_mut().find(|m| m.role == Role::System) {
            existing.content = system_prompt.to_string();
        } else {
            entry.messages.insert(0, Message::system(system_prompt));
        }
        Ok(())
    }

    /// Reconstruct a context from persisted history, keeping only valid
    /// roles and recomputing the token total from scratch. Any existing
    /// context for the conversation is replaced wholesale.
    pub fn load_from_messages(
        &self,
        conversation_id: &str,
        user_id: &str,
        workspace_id: &str,
        stored: &[StoredMessage],
        system_prompt: Option<String>,
    ) -> ConversationContext {
        let messages: Vec<Message> = stored
            .iter()
            .filter_map(|row| {
                Role::parse(&row.role).map(|role| Message {
                    role,
                    content: row.content.clone(),
                    tokens_used: 0,
                })
            })
            .collect();

        let now = Utc::now();
        let context = ConversationContext {
            conversation_id: conversation_id.to_string(),
            system_prompt,
            metadata: ContextMetadata {
                user_id: user_id.to_string(),
                workspace_id: workspace_id.to_string(),
                model: config::DEFAULT_MODEL.to_string(),
                total_tokens: estimate_messages(&messages),
                created_at: now,
                updated_at: now,
            },
            messages,
        };

        self.contexts
            .insert(conversation_id.to_string(), context.clone());
        context
    }

    /// Idempotent removal.
    pub fn clear_context(&self, conversation_id: &str) {
        self.contexts.remove(conversation_id);
    }

    pub fn get_context_summary(&self, conversation_id: &str) -> Option<ContextSummary> {
        self.contexts.get(conversation_id).map(|c| ContextSummary {
            message_count: c.messages.len(),
            total_tokens: c.metadata.total_tokens,
            model: c.metadata.model.clone(),
            last_updated: c.metadata.updated_at,
        })
    }

    /// Snapshot of all live contexts, for monitoring.
    pub fn active_contexts(&self) -> Vec<ContextOverview> {
        self.contexts
            .iter()
            .map(|c| ContextOverview {
                conversation_id: c.conversation_id.clone(),
                message_count: c.messages.len(),
                total_tokens: c.metadata.total_tokens,
                user_id: c.metadata.user_id.clone(),
            })
            .collect()
    }

    /// Drop every context idle longer than the threshold, measured from
    /// `updated_at`. Returns the number removed. Safe to run concurrently
    /// with reads and writes on other conversations.
    pub fn cleanup_old_contexts(&self, max_age_minutes: i64) -> usize {
        let cutoff = Utc::now() - Duration::minutes(max_age_minutes);
        let before = self.contexts.len();

        self.contexts
            .retain(|_, context| context.metadata.updated_at >= cutoff);

        let removed = before.saturating_sub(self.contexts.len());
        if removed > 0 {
            debug!(removed, "swept idle conversation contexts");
        }
        removed
    }

    /// Two-stage eviction: cap the message count first, then walk the
    /// oldest non-system messages out until the token estimate fits the
    /// budget or the retained floor is reached. System messages are exempt
    /// from both stages.
    fn trim(&self, context: &mut ConversationContext) {
        if context.messages.len() > self.max_messages {
            let (system, mut others) = partition_system(&context.messages);
            let excess = others.len().saturating_sub(self.max_messages);
            if excess > 0 {
                others.drain(..excess);
                debug!(
                    conversation_id = %context.conversation_id,
                    dropped = excess,
                    "trimmed context to message ceiling"
                );
            }
            context.messages = [system, others].concat();
        }

        if estimate_messages(&context.messages) > self.max_tokens {
            let (system, mut others) = partition_system(&context.messages);
            let mut dropped = 0usize;
            while estimate_messages(&system) + estimate_messages(&others) > self.max_tokens
                && others.len() > RETAINED_FLOOR
            {
                others.remove(0);
                dropped += 1;
            }
            if dropped > 0 {
                debug!(
                    conversation_id = %context.conversation_id,
                    dropped,
                    "trimmed context to token budget"
                );
            }
            context.messages = [system, others].concat();
        }
    }

    #[cfg(test)]
    fn backdate(&self, conversation_id: &str, minutes: i64) {
        if let Some(mut entry) = self.contexts.get_mut(conversation_id) {
            entry.metadata.updated_at = Utc::now() - Duration::minutes(minutes);
        }
    }
}

fn partition_system(messages: &[Message]) -> (Vec<Message>, Vec<Message>) {
    messages
        .iter()
        .cloned()
        .partition(|m| m.role == Role::System)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ContextManager {
        ContextManager::new()
    }

    fn seeded(manager: &ContextManager) {
        manager.create_context("conv-1", "user-1", "ws-1", None);
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("12345678"), 2);
    }

    #[test]
    fn test_add_message_unknown_conversation() {
        let manager = manager();
        let result = manager.add_message("missing", Role::User, "hi", 0);
        assert!(matches!(result, Err(Error::ContextNotFound(_))));
        assert!(manager.active_contexts().is_empty());
    }

    #[test]
    fn test_add_message_updates_running_total() {
        let manager = manager();
        seeded(&manager);
        manager.add_message("conv-1", Role::User, "hello", 5).unwrap();
        manager.add_message("conv-1", Role::Assistant, "world", 7).unwrap();

        let summary = manager.get_context_summary("conv-1").unwrap();
        assert_eq!(summary.message_count, 2);
        assert_eq!(summary.total_tokens, 12);
    }

    #[test]
    fn test_get_messages_for_ai_prepends_system_prompt() {
        let manager = manager();
        manager.create_context("conv-1", "user-1", "ws-1", Some("be terse".to_string()));
        manager.add_message("conv-1", Role::User, "hi", 0).unwrap();

        let messages = manager.get_messages_for_ai("conv-1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "be terse");
        assert_eq!(messages[1].content, "hi");

        // Idempotent: a second read with no mutation in between is identical.
        assert_eq!(manager.get_messages_for_ai("conv-1").unwrap(), messages);
    }

    #[test]
    fn test_get_messages_for_ai_without_prompt() {
        let manager = manager();
        seeded(&manager);
        manager.add_message("conv-1", Role::User, "hi", 0).unwrap();
        let messages = manager.get_messages_for_ai("conv-1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[test]
    fn test_message_ceiling_keeps_most_recent() {
        let manager = ContextManager::with_limits(4, 1_000_000);
        seeded(&manager);

        for i in 0..6 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            manager
                .add_message("conv-1", role, &format!("turn-{i}"), 0)
                .unwrap();
        }

        let messages = manager.get_messages_for_ai("conv-1").unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["turn-2", "turn-3", "turn-4", "turn-5"]);
    }

    #[test]
    fn test_system_messages_survive_count_trimming() {
        let manager = ContextManager::with_limits(3, 1_000_000);
        seeded(&manager);
        manager
            .add_message("conv-1", Role::System, "instructions", 0)
            .unwrap();

        for i in 0..8 {
            manager
                .add_message("conv-1", Role::User, &format!("m{i}"), 0)
                .unwrap();
        }

        let context = manager.get_context("conv-1").unwrap();
        assert!(context.messages.iter().any(|m| m.role == Role::System));
        let non_system = context
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .count();
        assert!(non_system <= 3);
    }

    #[test]
    fn test_token_budget_evicts_oldest_first() {
        // 40-char messages estimate to 10 tokens each; budget of 25 keeps
        // the two newest and evicts the oldest.
        let manager = ContextManager::with_limits(50, 25);
        seeded(&manager);

        for i in 0..3 {
            let content = format!("{i}").repeat(40);
            manager.add_message("conv-1", Role::User, &content, 0).unwrap();
        }

        let context = manager.get_context("conv-1").unwrap();
        assert_eq!(context.messages.len(), 2);
        assert!(context.messages[0].content.starts_with('1'));
        assert!(context.messages[1].content.starts_with('2'));
    }

    #[test]
    fn test_retained_floor_allows_budget_overrun() {
        let manager = ContextManager::with_limits(50, 10);
        seeded(&manager);

        // Two messages at ~25 estimated tokens each: far over budget, but
        // the floor of two non-system messages holds.
        for content in ["a".repeat(100), "b".repeat(100)] {
            manager.add_message("conv-1", Role::User, &content, 0).unwrap();
        }

        let context = manager.get_context("conv-1").unwrap();
        assert_eq!(context.messages.len(), 2);
    }

    #[test]
    fn test_system_messages_survive_budget_trimming() {
        let manager = ContextManager::with_limits(50, 30);
        seeded(&manager);

        manager
            .add_message("conv-1", Role::System, &"s".repeat(60), 0)
            .unwrap();
        for i in 0..5 {
            manager
                .add_message("conv-1", Role::User, &format!("{i}").repeat(60), 0)
                .unwrap();
        }

        let context = manager.get_context("conv-1").unwrap();
        assert!(context.messages.iter().any(|m| m.role == Role::System));
        let non_system = context
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .count();
        assert_eq!(non_system, RETAINED_FLOOR);
    }

    #[test]
    fn test_update_system_prompt_keeps_single_entry() {
        let manager = manager();
        seeded(&manager);
        manager.add_message("conv-1", Role::User, "hi", 0).unwrap();

        manager.update_system_prompt("conv-1", "first").unwrap();
        manager.update_system_prompt("conv-1", "second").unwrap();

        let context = manager.get_context("conv-1").unwrap();
        let system_entries: Vec<&Message> = context
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .collect();
        assert_eq!(system_entries.len(), 1);
        assert_eq!(context.messages[0].role, Role::System);
        assert_eq!(context.messages[0].content, "second");
        assert_eq!(context.system_prompt.as_deref(), Some("second"));
    }

    #[test]
    fn test_load_from_messages_filters_and_recomputes() {
        let manager = manager();
        // Pre-existing state must be replaced wholesale, not merged.
        seeded(&manager);
        manager.add_message("conv-1", Role::User, "old", 999).unwrap();

        let stored = vec![
            StoredMessage {
                role: "user".to_string(),
                content: "abcd".to_string(),
            },
            StoredMessage {
                role: "tool".to_string(),
                content: "dropped".to_string(),
            },
            StoredMessage {
                role: "assistant".to_string(),
                content: "abcdefgh".to_string(),
            },
        ];

        let context = manager.load_from_messages("conv-1", "user-1", "ws-1", &stored, None);
        assert_eq!(context.messages.len(), 2);
        // 1 token for "abcd" + 2 for "abcdefgh", recomputed from scratch.
        assert_eq!(context.metadata.total_tokens, 3);

        let summary = manager.get_context_summary("conv-1").unwrap();
        assert_eq!(summary.total_tokens, 3);
    }

    #[test]
    fn test_clear_context_is_idempotent() {
        let manager = manager();
        seeded(&manager);
        manager.clear_context("conv-1");
        manager.clear_context("conv-1");
        assert!(manager.get_context("conv-1").is_none());
    }

    #[test]
    fn test_cleanup_removes_only_idle_contexts() {
        let manager = manager();
        manager.create_context("old", "user-1", "ws-1", None);
        manager.create_context("fresh", "user-1", "ws-1", None);
        manager.backdate("old", 120);

        let removed = manager.cleanup_old_contexts(60);
        assert_eq!(removed, 1);
        assert!(manager.get_context("old").is_none());
        assert!(manager.get_context("fresh").is_some());
    }

    #[test]
    fn test_create_context_replaces_existing() {
        let manager = manager();
        seeded(&manager);
        manager.add_message("conv-1", Role::User, "hi", 3).unwrap();

        manager.create_context("conv-1", "user-2", "ws-2", None);
        let context = manager.get_context("conv-1").unwrap();
        assert!(context.messages.is_empty());
        assert_eq!(context.metadata.user_id, "user-2");
        assert_eq!(context.metadata.total_tokens, 0);
    }
}
