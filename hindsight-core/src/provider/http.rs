//! HTTP-backed language model providers (Ollama, Claude, OpenAI).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::json;

use super::{LanguageModel, PromptOptions, ProviderError};
use crate::config::{LlmConfig, LlmProvider};
use crate::error::{Error, Result};
use crate::types::ProviderCapabilities;

const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 1_500;
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A provider reached over HTTP.
pub struct HttpProvider {
    model: String,
    provider: LlmProvider,
    endpoint: String,
    api_key: Option<String>,
    capabilities: ProviderCapabilities,
    http: reqwest::Client,
}

impl HttpProvider {
    /// Build a provider from configuration.
    ///
    /// Fails with [`Error::Config`] when a hosted provider has no API key in
    /// the config or its environment variable.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| config.provider.default_endpoint().to_string())
            .trim_end_matches('/')
            .to_string();
        let api_key = match config.provider {
            LlmProvider::Ollama => None,
            LlmProvider::Claude => config
                .api_key
                .clone()
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok()),
            LlmProvider::OpenAI => config
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok()),
        };

        if matches!(config.provider, LlmProvider::Claude | LlmProvider::OpenAI) && api_key.is_none()
        {
            return Err(Error::Config(
                "llm.api_key (or provider env var) is required".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        let max_input_tokens = config
            .max_input_tokens
            .unwrap_or_else(|| config.provider.default_max_input_tokens());

        Ok(Self {
            model: config.model.clone(),
            provider: config.provider,
            endpoint,
            api_key,
            capabilities: ProviderCapabilities {
                max_input_tokens,
                optimal_chunk_tokens: config.optimal_chunk_tokens.min(max_input_tokens),
                supports_token_measurement: config.provider == LlmProvider::Claude,
            },
            http,
        })
    }

    fn claude_headers(&self) -> std::result::Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(self.api_key.as_deref().unwrap_or_default()).map_err(|e| {
                ProviderError::InvalidConfiguration(format!("invalid claude api key header: {e}"))
            })?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        Ok(headers)
    }

    fn openai_headers(&self) -> std::result::Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!(
                "Bearer {}",
                self.api_key.as_deref().unwrap_or_default()
            ))
            .map_err(|e| ProviderError::InvalidConfiguration(format!("invalid auth header: {e}")))?,
        );
        Ok(headers)
    }

    async fn post_json(
        &self,
        url: String,
        headers: HeaderMap,
        body: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ProviderError> {
        let label = self.provider.as_str();
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(label, &e))?;

        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("{label} read body failed: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(label, status, retry_after, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| ProviderError::Transient(format!("{label} returned malformed JSON: {e}")))
    }
}

#[async_trait]
impl LanguageModel for HttpProvider {
    fn name(&self) -> &str {
        self.provider.as_str()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn prompt(
        &self,
        text: &str,
        opts: &PromptOptions,
    ) -> std::result::Result<String, ProviderError> {
        let temperature = opts.temperature.unwrap_or(0.0);
        let max_tokens = opts.max_output_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS);

        match self.provider {
            LlmProvider::Ollama => {
                let url = format!("{}/api/generate", self.endpoint);
                let mut body = json!({
                    "model": self.model,
                    "prompt": text,
                    "stream": false,
                    "options": { "temperature": temperature },
                });
                if let Some(system) = &opts.system {
                    body["system"] = json!(system);
                }
                if opts.json {
                    body["format"] = json!("json");
                }
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

                let json = self.post_json(url, headers, body).await?;
                json.get("response")
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string)
                    .ok_or_else(|| {
                        ProviderError::Transient(
                            "ollama response missing string field `response`".to_string(),
                        )
                    })
            }
            LlmProvider::Claude => {
                let url = format!("{}/v1/messages", self.endpoint);
                let mut body = json!({
                    "model": self.model,
                    "max_tokens": max_tokens,
                    "temperature": temperature,
                    "messages": [{ "role": "user", "content": text }],
                });
                if let Some(system) = &opts.system {
                    body["system"] = json!(system);
                }

                let json = self.post_json(url, self.claude_headers()?, body).await?;
                json.get("content")
                    .and_then(|v| v.as_array())
                    .and_then(|arr| arr.first())
                    .and_then(|v| v.get("text"))
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string)
                    .ok_or_else(|| {
                        ProviderError::Transient("claude response missing content[0].text".to_string())
                    })
            }
            LlmProvider::OpenAI => {
                let url = format!("{}/v1/chat/completions", self.endpoint);
                let mut messages = Vec::new();
                if let Some(system) = &opts.system {
                    messages.push(json!({ "role": "system", "content": system }));
                }
                messages.push(json!({ "role": "user", "content": text }));
                let mut body = json!({
                    "model": self.model,
                    "temperature": temperature,
                    "max_tokens": max_tokens,
                    "messages": messages,
                });
                if opts.json {
                    body["response_format"] = json!({ "type": "json_object" });
                }

                let json = self.post_json(url, self.openai_headers()?, body).await?;
                json.get("choices")
                    .and_then(|v| v.as_array())
                    .and_then(|arr| arr.first())
                    .and_then(|v| v.get("message"))
                    .and_then(|v| v.get("content"))
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string)
                    .ok_or_else(|| {
                        ProviderError::Transient(
                            "openai response missing choices[0].message.content".to_string(),
                        )
                    })
            }
        }
    }

    async fn measure_input_usage(
        &self,
        text: &str,
        opts: &PromptOptions,
    ) -> std::result::Result<usize, ProviderError> {
        if self.provider != LlmProvider::Claude {
            return Ok(super::estimate_tokens(text));
        }

        let url = format!("{}/v1/messages/count_tokens", self.endpoint);
        let mut body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": text }],
        });
        if let Some(system) = &opts.system {
            body["system"] = json!(system);
        }

        let json = self.post_json(url, self.claude_headers()?, body).await?;
        json.get("input_tokens")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .ok_or_else(|| {
                ProviderError::Transient("claude count_tokens missing `input_tokens`".to_string())
            })
    }
}

/// Map a non-success HTTP status to a provider error.
fn classify_status(
    label: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ProviderError {
    let message = format!("{label} returned {}: {}", status.as_u16(), truncate(body, 300));
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            message,
            retry_after,
        },
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::BAD_REQUEST
        | StatusCode::NOT_FOUND
        | StatusCode::UNPROCESSABLE_ENTITY => ProviderError::InvalidConfiguration(message),
        // 529 is Anthropic's "overloaded"
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT || s.as_u16() == 529 => {
            ProviderError::Transient(message)
        }
        _ => ProviderError::InvalidConfiguration(message),
    }
}

fn classify_transport_error(label: &str, error: &reqwest::Error) -> ProviderError {
    if error.is_builder() {
        ProviderError::InvalidConfiguration(format!("{label} request could not be built: {error}"))
    } else {
        ProviderError::Transient(format!("{label} request failed: {error}"))
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}
