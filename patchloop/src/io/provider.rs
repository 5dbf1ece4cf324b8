//! Provider backends for OpenAI-compatible chat completion APIs.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::types::{ChatMessage, ProviderKind};

/// Order tried at startup when the requested provider has no credential.
pub const STARTUP_FALLBACK: [ProviderKind; 5] = [
    ProviderKind::OpenRouter,
    ProviderKind::Mistral,
    ProviderKind::Groq,
    ProviderKind::Together,
    ProviderKind::OpenAi,
];

/// How the gateway reacts to a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Switch to the configured alternate provider once.
    Auth,
    /// Wait, then retry the same provider.
    RateLimit,
    /// Retry the same provider with linear backoff.
    Other,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider}: authentication failed (HTTP {status}): {body}")]
    Auth {
        provider: ProviderKind,
        status: u16,
        body: String,
    },
    #[error("{provider}: rate limited: {body}")]
    RateLimited { provider: ProviderKind, body: String },
    #[error("{provider}: HTTP {status}: {body}")]
    Status {
        provider: ProviderKind,
        status: u16,
        body: String,
    },
    #[error("{provider}: request failed: {message}")]
    Transport {
        provider: ProviderKind,
        message: String,
    },
    #[error("{provider}: malformed response: {message}")]
    Malformed {
        provider: ProviderKind,
        message: String,
        body: String,
    },
    #[error("{provider}: no credential configured (set {env_var})")]
    MissingCredential {
        provider: ProviderKind,
        env_var: String,
    },
}

impl ProviderError {
    pub fn provider(&self) -> ProviderKind {
        match self {
            ProviderError::Auth { provider, .. }
            | ProviderError::RateLimited { provider, .. }
            | ProviderError::Status { provider, .. }
            | ProviderError::Transport { provider, .. }
            | ProviderError::Malformed { provider, .. }
            | ProviderError::MissingCredential { provider, .. } => *provider,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            ProviderError::Auth { .. } | ProviderError::MissingCredential { .. } => {
                FailureClass::Auth
            }
            ProviderError::RateLimited { .. } => FailureClass::RateLimit,
            ProviderError::Status { .. }
            | ProviderError::Transport { .. }
            | ProviderError::Malformed { .. } => FailureClass::Other,
        }
    }

    /// Raw payload worth persisting for offline inspection.
    pub fn payload(&self) -> &str {
        match self {
            ProviderError::Auth { body, .. }
            | ProviderError::RateLimited { body, .. }
            | ProviderError::Status { body, .. }
            | ProviderError::Malformed { body, .. } => body,
            ProviderError::Transport { message, .. } => message,
            ProviderError::MissingCredential { env_var, .. } => env_var,
        }
    }
}

/// Connection details for one provider, resolved from the environment.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub credential: String,
    pub endpoint: String,
    pub model: String,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("credential", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish()
    }
}

/// Snapshot of provider credentials taken once per run.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    providers: BTreeMap<ProviderKind, ProviderConfig>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from explicit `NAME=value` pairs.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::from_lookup(|name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_string())
        })
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut providers = BTreeMap::new();
        for kind in ProviderKind::ALL {
            let prefix = kind.env_prefix();
            let non_empty = |suffix: &str| {
                lookup(&format!("{prefix}_{suffix}"))
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            };
            let Some(credential) = non_empty("API_KEY") else {
                continue;
            };
            providers.insert(
                kind,
                ProviderConfig {
                    kind,
                    credential,
                    endpoint: non_empty("CHAT_ENDPOINT")
                        .unwrap_or_else(|| kind.default_endpoint().to_string()),
                    model: non_empty("MODEL").unwrap_or_else(|| kind.default_model().to_string()),
                },
            );
        }
        Self { providers }
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        self.providers.get(&kind)
    }

    pub fn has(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    /// The requested provider if it has a credential, else the first configured fallback.
    pub fn resolve_start(&self, requested: ProviderKind) -> Result<ProviderKind> {
        if self.has(requested) {
            return Ok(requested);
        }
        STARTUP_FALLBACK
            .into_iter()
            .find(|kind| self.has(*kind))
            .ok_or_else(|| {
                anyhow!(
                    "no API key found (set one of: {})",
                    STARTUP_FALLBACK
                        .map(|k| format!("{}_API_KEY", k.env_prefix()))
                        .join(", ")
                )
            })
    }
}

/// Text content plus the raw body it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    pub content: String,
    pub raw: String,
}

/// One chat-completion capability, shared by every provider.
pub trait ChatBackend {
    fn complete(
        &self,
        provider: &ProviderConfig,
        messages: &[ChatMessage],
    ) -> std::result::Result<ChatResponse, ProviderError>;

    fn classify(&self, err: &ProviderError) -> FailureClass {
        err.class()
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Extract `choices[0].message.content` from a chat completion body.
pub fn completion_content(raw: &str) -> std::result::Result<String, String> {
    let parsed: ChatCompletion =
        serde_json::from_str(raw).map_err(|e| format!("invalid completion JSON: {e}"))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| "completion has no choices[0].message.content".to_string())
}

/// Blocking HTTP backend.
pub struct HttpBackend {
    client: Client,
}

impl HttpBackend {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self { client })
    }
}

impl ChatBackend for HttpBackend {
    #[instrument(skip_all, fields(provider = %provider.kind, model = %provider.model))]
    fn complete(
        &self,
        provider: &ProviderConfig,
        messages: &[ChatMessage],
    ) -> std::result::Result<ChatResponse, ProviderError> {
        let transport = |err: reqwest::Error| ProviderError::Transport {
            provider: provider.kind,
            message: err.to_string(),
        };
        let response = self
            .client
            .post(&provider.endpoint)
            .bearer_auth(&provider.credential)
            .json(&ChatRequest {
                model: &provider.model,
                messages,
            })
            .send()
            .map_err(transport)?;
        let status = response.status();
        let body = response.text().map_err(transport)?;
        debug!(status = status.as_u16(), bytes = body.len(), "provider responded");
        classify_status(provider.kind, status, body)
    }
}

fn classify_status(
    provider: ProviderKind,
    status: StatusCode,
    body: String,
) -> std::result::Result<ChatResponse, ProviderError> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::Auth {
            provider,
            status: status.as_u16(),
            body,
        }),
        StatusCode::TOO_MANY_REQUESTS => Err(ProviderError::RateLimited { provider, body }),
        s if !s.is_success() => Err(ProviderError::Status {
            provider,
            status: s.as_u16(),
            body,
        }),
        _ => match completion_content(&body) {
            Ok(content) => Ok(ChatResponse { content, raw: body }),
            Err(message) => Err(ProviderError::Malformed {
                provider,
                message,
                body,
            }),
        },
    }
}
