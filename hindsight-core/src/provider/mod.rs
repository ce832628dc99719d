//! Language model capability interface
//!
//! The orchestrator only ever talks to a [`LanguageModel`]: a prompt call, a
//! token measurement, and the provider's static limits. Concrete back-ends live
//! in [`http`]; tests script their own.
//!
//! Errors are classified up front so the worker can decide between retrying
//! and aborting without inspecting message text.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Config;
use crate::types::ProviderCapabilities;

pub use http::HttpProvider;

/// Provider failure, classified by what the caller should do about it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider asked us to slow down
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Credentials, model name or endpoint are wrong
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Network hiccup, timeout or server-side failure
    #[error("transient failure: {0}")]
    Transient(String),
}

impl ProviderError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Transient(_)
        )
    }

    /// Delay the provider explicitly requested, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short explanation suitable for a progress line
    pub fn user_message(&self) -> String {
        match self {
            ProviderError::RateLimited { .. } => "The model provider is rate limiting requests".to_string(),
            ProviderError::Transient(msg) => format!("Temporary provider problem: {msg}"),
            ProviderError::InvalidConfiguration(msg) => format!("Provider configuration is invalid: {msg}"),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptOptions {
    /// System instructions, sent separately when the provider supports it
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    /// Ask for a JSON-only answer where the provider supports it
    pub json: bool,
}

/// Fixed-ratio fallback used when a provider cannot count tokens.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Minimal contract every language model back-end satisfies.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Identifier used in logs and `ai-status` events
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Run a single completion.
    async fn prompt(&self, text: &str, opts: &PromptOptions) -> Result<String, ProviderError>;

    /// Count the input tokens `text` would consume.
    ///
    /// The default is the character/4 estimate.
    async fn measure_input_usage(
        &self,
        text: &str,
        _opts: &PromptOptions,
    ) -> Result<usize, ProviderError> {
        Ok(estimate_tokens(text))
    }
}

/// Result of looking for a usable provider.
#[derive(Clone)]
pub enum ProviderProbe {
    Ready(Arc<dyn LanguageModel>),
    Unavailable { reason: String },
}

impl ProviderProbe {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProviderProbe::Ready(_))
    }

    pub fn provider(&self) -> Option<Arc<dyn LanguageModel>> {
        match self {
            ProviderProbe::Ready(p) => Some(Arc::clone(p)),
            ProviderProbe::Unavailable { .. } => None,
        }
    }
}

impl std::fmt::Debug for ProviderProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderProbe::Ready(p) => f.debug_tuple("Ready").field(&p.name()).finish(),
            ProviderProbe::Unavailable { reason } => f
                .debug_struct("Unavailable")
                .field("reason", reason)
                .finish(),
        }
    }
}

/// Build the configured provider, or explain why there is none.
pub fn probe_provider(config: &Config) -> ProviderProbe {
    let Some(llm) = config.llm.as_ref() else {
        return ProviderProbe::Unavailable {
            reason: "no [llm] section configured".to_string(),
        };
    };

    match HttpProvider::new(llm) {
        Ok(provider) => {
            tracing::info!(provider = provider.name(), model = %llm.model, "Language model ready");
            ProviderProbe::Ready(Arc::new(provider))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Language model unavailable");
            ProviderProbe::Unavailable {
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlmConfig, LlmProvider};

    struct Echo;

    #[async_trait]
    impl LanguageModel for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                max_input_tokens: 100,
                optimal_chunk_tokens: 50,
                supports_token_measurement: false,
            }
        }

        async fn prompt(&self, text: &str, _opts: &PromptOptions) -> Result<String, ProviderError> {
            Ok(text.to_string())
        }
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abcdefghi"), 3);
    }

    #[tokio::test]
    async fn test_default_measurement_uses_estimate() {
        let tokens = Echo
            .measure_input_usage("twelve chars", &PromptOptions::default())
            .await
            .unwrap();
        assert_eq!(tokens, 3);
    }

    #[test]
    fn test_error_classification() {
        assert!(ProviderError::Transient("reset".into()).is_transient());
        assert!(ProviderError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(2)),
        }
        .is_transient());
        assert!(!ProviderError::InvalidConfiguration("bad key".into()).is_transient());
        assert_eq!(
            ProviderError::RateLimited {
                message: String::new(),
                retry_after: Some(Duration::from_secs(2)),
            }
            .retry_after(),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_probe_without_llm_section() {
        let probe = probe_provider(&Config::default());
        assert!(!probe.is_ready());
        assert!(probe.provider().is_none());
    }

    #[test]
    fn test_probe_missing_api_key() {
        let config = Config {
            llm: Some(LlmConfig {
                provider: LlmProvider::OpenAI,
                model: "gpt-4o-mini".to_string(),
                endpoint: Some("http://localhost:1".to_string()),
                api_key: None,
                timeout_secs: 5,
                max_input_tokens: None,
                optimal_chunk_tokens: 1000,
            }),
            ..Default::default()
        };
        // Only meaningful when the env fallback is absent
        if std::env::var("OPENAI_API_KEY").is_err() {
            match probe_provider(&config) {
                ProviderProbe::Unavailable { reason } => assert!(reason.contains("api_key")),
                ProviderProbe::Ready(_) => panic!("probe should fail without api key"),
            }
        }
    }

    #[test]
    fn test_probe_ollama_needs_no_key() {
        let config = Config {
            llm: Some(LlmConfig {
                provider: LlmProvider::Ollama,
                model: "llama3.2".to_string(),
                endpoint: None,
                api_key: None,
                timeout_secs: 5,
                max_input_tokens: None,
                optimal_chunk_tokens: 1000,
            }),
            ..Default::default()
        };
        let probe = probe_provider(&config);
        assert!(probe.is_ready());
        let caps = probe.provider().unwrap().capabilities();
        assert_eq!(caps.max_input_tokens, 8_192);
        assert_eq!(caps.optimal_chunk_tokens, 1000);
    }
}
