//! Shared deterministic types for the attempt loop.
//!
//! These types define the contracts between the parser, the applier and the
//! controller. They carry no I/O and serialize in a stable shape.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One parsed instruction from a model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Overwrite `path` (relative to the working directory) with `content`.
    FileWrite { path: String, content: String },
    /// Run a shell command in the working directory.
    CliCommand { command: String },
    /// Reasoning or summary prose from `<text>` tags.
    TextNote { content: String },
    /// `<complete>` marker: the model claims the instruction is done.
    CompleteSignal,
    /// `<upgradeModel>` marker, optionally naming the provider to switch to.
    UpgradeSignal { provider: Option<String> },
}

/// Parser output: ordered directives plus the terminal flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    pub directives: Vec<Directive>,
    pub complete: bool,
    pub upgrade: bool,
    pub provider_hint: Option<String>,
    /// Human-readable descriptions of tags that were skipped.
    pub malformed: Vec<String>,
}

impl ParsedResponse {
    pub fn file_writes(&self) -> usize {
        self.directives
            .iter()
            .filter(|d| matches!(d, Directive::FileWrite { .. }))
            .count()
    }

    pub fn commands(&self) -> usize {
        self.directives
            .iter()
            .filter(|d| matches!(d, Directive::CliCommand { .. }))
            .count()
    }
}

/// Supported LLM backends. All speak the OpenAI-compatible chat completions API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Mistral,
    Groq,
    OpenRouter,
    Together,
    OpenAi,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Mistral,
        ProviderKind::Groq,
        ProviderKind::OpenRouter,
        ProviderKind::Together,
        ProviderKind::OpenAi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Mistral => "mistral",
            ProviderKind::Groq => "groq",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Together => "together",
            ProviderKind::OpenAi => "openai",
        }
    }

    /// Prefix of the environment variables for this provider (`MISTRAL_API_KEY`, ...).
    pub fn env_prefix(self) -> &'static str {
        match self {
            ProviderKind::Mistral => "MISTRAL",
            ProviderKind::Groq => "GROQ",
            ProviderKind::OpenRouter => "OPENROUTER",
            ProviderKind::Together => "TOGETHER",
            ProviderKind::OpenAi => "OPENAI",
        }
    }

    pub fn default_endpoint(self) -> &'static str {
        match self {
            ProviderKind::Mistral => "https://api.mistral.ai/v1/chat/completions",
            ProviderKind::Groq => "https://api.groq.com/openai/v1/chat/completions",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1/chat/completions",
            ProviderKind::Together => "https://api.together.xyz/v1/chat/completions",
            ProviderKind::OpenAi => "https://api.openai.com/v1/chat/completions",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::Mistral => "codestral-latest",
            ProviderKind::Groq => "llama-3.3-70b-versatile",
            ProviderKind::OpenRouter => "deepseek/deepseek-r1",
            ProviderKind::Together => "deepseek-ai/DeepSeek-R1",
            ProviderKind::OpenAi => "gpt-4o",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == needle)
            .ok_or_else(|| {
                format!(
                    "unknown provider '{s}' (expected one of: {})",
                    ProviderKind::ALL.map(ProviderKind::as_str).join(", ")
                )
            })
    }
}

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
        }
    }
}

/// One chat message sent to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}
