//! Agent configuration stored under `.patchloop/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::ProviderKind;

/// Agent configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults that
/// target an npm project; credentials never live here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Attempts per run before giving up.
    pub max_attempts: u32,

    /// Provider used for the first dispatch when `--model` is not given.
    pub default_provider: ProviderKind,

    /// Wall-clock limit for each shell command (applier, gate and environment checks).
    pub command_timeout_secs: u64,

    /// Wall-clock limit for each provider HTTP request.
    pub request_timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    /// Upper bound for the rendered context bundle.
    pub context_budget_bytes: usize,

    /// Files larger than this are listed by path only.
    pub max_file_bytes: u64,

    /// Command history entries kept per attempt.
    pub history_window: usize,

    /// Lint output lines matching this regex count as warnings.
    pub lint_warning_pattern: String,

    pub validation: ValidationConfig,
    pub commands: CommandsConfig,
    pub providers: ProvidersConfig,
    pub context: ContextConfig,
}

/// Fixed install/lint/test sequence run by the validation gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    pub install: String,
    pub lint: String,
    pub test: String,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            install: "npm install".to_string(),
            lint: "npm run lint --fix".to_string(),
            test: "npm run test".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandsConfig {
    /// Regexes for commands the applier never runs (dev servers, gate duplicates).
    pub denylist: Vec<String>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            denylist: vec![
                "^npm run (start|dev)".to_string(),
                "^npm start".to_string(),
                "(eslint|lint)".to_string(),
                "^npm test".to_string(),
            ],
        }
    }
}

/// One `from -> to` entry of the authentication fallback table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FallbackRule {
    pub from: ProviderKind,
    pub to: ProviderKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Tries per provider before the chain gives up (rate limits and transient errors).
    pub max_tries: u32,
    /// Fixed wait after a rate-limit response.
    pub rate_limit_backoff_ms: u64,
    /// Base wait after a transient error; multiplied by the try number.
    pub retry_backoff_ms: u64,
    /// Providers tried, in order, when the model asks for an upgrade.
    pub escalation_order: Vec<ProviderKind>,
    /// Alternate provider used once after an authentication failure.
    pub auth_fallback: Vec<FallbackRule>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            max_tries: 3,
            rate_limit_backoff_ms: 5_000,
            retry_backoff_ms: 1_000,
            escalation_order: vec![
                ProviderKind::Together,
                ProviderKind::OpenRouter,
                ProviderKind::Groq,
                ProviderKind::Mistral,
            ],
            auth_fallback: vec![
                FallbackRule {
                    from: ProviderKind::Groq,
                    to: ProviderKind::Mistral,
                },
                FallbackRule {
                    from: ProviderKind::OpenRouter,
                    to: ProviderKind::Mistral,
                },
                FallbackRule {
                    from: ProviderKind::Together,
                    to: ProviderKind::OpenRouter,
                },
                FallbackRule {
                    from: ProviderKind::OpenAi,
                    to: ProviderKind::Mistral,
                },
            ],
        }
    }
}

impl ProvidersConfig {
    pub fn auth_fallback_for(&self, provider: ProviderKind) -> Option<ProviderKind> {
        self.auth_fallback
            .iter()
            .find(|rule| rule.from == provider)
            .map(|rule| rule.to)
    }
}

/// A labelled shell command whose output becomes an environment fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvCheck {
    pub label: String,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub checks: Vec<EnvCheck>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        let check = |label: &str, command: &str| EnvCheck {
            label: label.to_string(),
            command: command.to_string(),
        };
        Self {
            checks: vec![
                check("nodeVersion", "node -v"),
                check("npmVersion", "npm -v"),
                check("installedDependencies", "npm ls --depth=0"),
            ],
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            default_provider: ProviderKind::Mistral,
            command_timeout_secs: 5 * 60,
            request_timeout_secs: 5 * 60,
            output_limit_bytes: 100_000,
            context_budget_bytes: 200_000,
            max_file_bytes: 64_000,
            history_window: 100,
            lint_warning_pattern: "Warning: (.*)".to_string(),
            validation: ValidationConfig::default(),
            commands: CommandsConfig::default(),
            providers: ProvidersConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.context_budget_bytes == 0 {
            return Err(anyhow!("context_budget_bytes must be > 0"));
        }
        if self.history_window == 0 {
            return Err(anyhow!("history_window must be > 0"));
        }
        if self.providers.max_tries == 0 {
            return Err(anyhow!("providers.max_tries must be > 0"));
        }
        for (name, command) in [
            ("install", &self.validation.install),
            ("lint", &self.validation.lint),
            ("test", &self.validation.test),
        ] {
            if command.trim().is_empty() {
                return Err(anyhow!("validation.{name} must be a non-empty command"));
            }
        }
        self.lint_warning_regex()?;
        for pattern in &self.commands.denylist {
            Regex::new(pattern)
                .with_context(|| format!("commands.denylist entry '{pattern}' is not a regex"))?;
        }
        Ok(())
    }

    pub fn lint_warning_regex(&self) -> Result<Regex> {
        Regex::new(&self.lint_warning_pattern).with_context(|| {
            format!(
                "lint_warning_pattern '{}' is not a regex",
                self.lint_warning_pattern
            )
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
