// SPDX-License-Identifier: MIT

use thiserror::Error;

use crate::router::ProviderKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("{provider} error: {message}")]
    Provider {
        provider: ProviderKind,
        message: String,
    },

    #[error("Context not found: {0}")]
    ContextNotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    pub(crate) fn provider(provider: ProviderKind, message: impl Into<String>) -> Self {
        Error::Provider {
            provider,
            message: message.into(),
        }
    }

    /// Whether this failure originated on the vendor side. Such failures may
    /// be transient; retry policy belongs to the caller, never to this crate.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, Error::Provider { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
