// SPDX-License-Identifier: MIT
//
// Model-identifier routing. The dispatch rule is prefix-based and total:
// every accepted model string matches exactly one registered provider
// prefix, and unknown prefixes are rejected before any network state is
// touched. Pure by construction; no credentials are consulted here.

use crate::error::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

/// Registered model-prefix table. Order is irrelevant: prefixes are
/// mutually exclusive.
const PREFIXES: &[(&str, ProviderKind)] = &[
    ("gpt-", ProviderKind::OpenAi),
    ("claude-", ProviderKind::Anthropic),
    ("gemini-", ProviderKind::Gemini),
];

impl ProviderKind {
    pub fn id(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Anthropic => "Anthropic",
            ProviderKind::Gemini => "Google Gemini",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            "gemini" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Resolve a model identifier to the provider that owns it.
pub fn route(model: &str) -> Result<ProviderKind> {
    PREFIXES
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, kind)| *kind)
        .ok_or_else(|| Error::UnsupportedModel(model.to_string()))
}
