// SPDX-License-Identifier: MIT
//
// Process-wide configuration, read once from the environment. A provider is
// considered configured when its API key variable is present and non-empty;
// unconfigured providers are excluded from the model catalog and any direct
// request against them fails before a connection is attempted.

use std::env;

use url::Url;

use crate::error::{Error, Result};

pub(crate) const DEFAULT_MODEL: &str = "gpt-4-turbo";
pub(crate) const DEFAULT_TEMPERATURE: f32 = 0.7;
pub(crate) const DEFAULT_MAX_TOKENS: u32 = 2000;

#[derive(Debug, Clone)]
pub struct Config {
    pub providers: Providers,
    /// Model used when a request does not name one.
    pub default_model: String,
    pub default_temperature: f32,
    pub default_max_tokens: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Providers {
    pub openai: Option<ProviderCredentials>,
    pub anthropic: Option<ProviderCredentials>,
    pub gemini: Option<ProviderCredentials>,
}

#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub api_key: String,
    /// Override for the vendor endpoint, mainly for test doubles and
    /// region-pinned deployments.
    pub base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: Providers::default(),
            default_model: DEFAULT_MODEL.to_string(),
            default_temperature: DEFAULT_TEMPERATURE,
            default_max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Recognized variables: `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`,
    /// `GOOGLE_AI_API_KEY`, matching `*_BASE_URL` overrides,
    /// `DEFAULT_AI_MODEL`, `DEFAULT_TEMPERATURE`, `DEFAULT_MAX_TOKENS`.
    pub fn from_env() -> Result<Self> {
        let providers = Providers {
            openai: credentials_from_env("OPENAI_API_KEY", "OPENAI_BASE_URL")?,
            anthropic: credentials_from_env("ANTHROPIC_API_KEY", "ANTHROPIC_BASE_URL")?,
            gemini: credentials_from_env("GOOGLE_AI_API_KEY", "GOOGLE_AI_BASE_URL")?,
        };

        let default_model =
            non_empty_var("DEFAULT_AI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let default_temperature = match non_empty_var("DEFAULT_TEMPERATURE") {
            Some(raw) => raw
                .parse::<f32>()
                .ok()
                .filter(|t| (0.0..=2.0).contains(t))
                .ok_or_else(|| {
                    Error::Config(format!("DEFAULT_TEMPERATURE must be in [0, 2], got {raw}"))
                })?,
            None => DEFAULT_TEMPERATURE,
        };

        let default_max_tokens = match non_empty_var("DEFAULT_MAX_TOKENS") {
            Some(raw) => raw.parse::<u32>().ok().filter(|t| *t > 0).ok_or_else(|| {
                Error::Config(format!("DEFAULT_MAX_TOKENS must be a positive integer, got {raw}"))
            })?,
            None => DEFAULT_MAX_TOKENS,
        };

        Ok(Self {
            providers,
            default_model,
            default_temperature,
            default_max_tokens,
        })
    }
}

fn credentials_from_env(key_var: &str, url_var: &str) -> Result<Option<ProviderCredentials>> {
    let Some(api_key) = non_empty_var(key_var) else {
        return Ok(None);
    };

    let base_url = match non_empty_var(url_var) {
        Some(raw) => {
            Url::parse(&raw)
                .map_err(|e| Error::Config(format!("{url_var} is not a valid URL: {e}")))?;
            Some(raw.trim_end_matches('/').to_string())
        }
        None => None,
    };

    Ok(Some(ProviderCredentials { api_key, base_url }))
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.default_model, "gpt-4-turbo");
        assert_eq!(config.default_temperature, 0.7);
        assert_eq!(config.default_max_tokens, 2000);
        assert!(config.providers.openai.is_none());
    }
}
