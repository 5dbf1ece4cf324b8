//! Provider gateway: one ordered-chain executor for every dispatch.
//!
//! Within a single call the gateway may retry, switch to the authentication fallback, or
//! substitute an upgraded provider. None of that changes the run's current provider; the
//! outcome reports who answered and the controller decides what to keep.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::parser::escalation_target;
use crate::core::types::{ChatMessage, ProviderKind};
use crate::io::artifacts;
use crate::io::config::ProvidersConfig;
use crate::io::paths::AgentPaths;
use crate::io::provider::{ChatBackend, ChatResponse, Credentials, FailureClass, ProviderError};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("provider chain exhausted after {calls} call(s): {last}")]
    Exhausted { calls: u32, last: ProviderError },
}

/// Successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub response: ChatResponse,
    /// Provider whose response is returned.
    pub provider: ProviderKind,
    /// True if an `<upgradeModel provider="...">` marker was honored in this call.
    pub substituted: bool,
    /// Backend calls made, including retries and the substitution.
    pub calls: u32,
}

pub struct Gateway<'a, B: ChatBackend> {
    backend: &'a B,
    credentials: &'a Credentials,
    policy: &'a ProvidersConfig,
    paths: &'a AgentPaths,
}

impl<'a, B: ChatBackend> Gateway<'a, B> {
    pub fn new(
        backend: &'a B,
        credentials: &'a Credentials,
        policy: &'a ProvidersConfig,
        paths: &'a AgentPaths,
    ) -> Self {
        Self {
            backend,
            credentials,
            policy,
            paths,
        }
    }

    pub fn has_credential(&self, provider: ProviderKind) -> bool {
        self.credentials.has(provider)
    }

    /// Send `messages` starting at `requested`, with fallback, backoff and one upgrade substitution.
    #[instrument(skip_all, fields(requested = %requested))]
    pub fn dispatch(
        &self,
        messages: &[ChatMessage],
        requested: ProviderKind,
    ) -> Result<DispatchOutcome, GatewayError> {
        artifacts::save_prompt(self.paths, messages);
        let outcome = self.run_chain(messages, requested, true)?;
        Ok(self.maybe_substitute(messages, outcome))
    }

    /// Send `messages` to exactly `provider` (retries only, no fallback or substitution).
    #[instrument(skip_all, fields(provider = %provider))]
    pub fn dispatch_to(
        &self,
        messages: &[ChatMessage],
        provider: ProviderKind,
    ) -> Result<DispatchOutcome, GatewayError> {
        artifacts::save_prompt(self.paths, messages);
        self.run_chain(messages, provider, false)
    }

    fn run_chain(
        &self,
        messages: &[ChatMessage],
        start: ProviderKind,
        allow_auth_fallback: bool,
    ) -> Result<DispatchOutcome, GatewayError> {
        let mut provider = start;
        let mut tries = 0u32;
        let mut calls = 0u32;
        let mut switched = !allow_auth_fallback;

        loop {
            tries += 1;
            calls += 1;
            let err = match self.call(provider, messages) {
                Ok(response) => {
                    info!(provider = %provider, calls, "dispatch succeeded");
                    return Ok(DispatchOutcome {
                        response,
                        provider,
                        substituted: false,
                        calls,
                    });
                }
                Err(err) => err,
            };

            let class = self.backend.classify(&err);
            warn!(provider = %provider, tries, ?class, err = %err, "provider call failed");
            match class {
                FailureClass::Auth => {
                    let alternate = self
                        .policy
                        .auth_fallback_for(provider)
                        .filter(|alt| *alt != provider);
                    match alternate {
                        Some(alt) if !switched => {
                            info!(from = %provider, to = %alt, "switching provider after auth failure");
                            provider = alt;
                            tries = 0;
                            switched = true;
                        }
                        _ => return Err(GatewayError::Exhausted { calls, last: err }),
                    }
                }
                FailureClass::RateLimit if tries < self.policy.max_tries => {
                    pause(Duration::from_millis(self.policy.rate_limit_backoff_ms));
                }
                FailureClass::Other if tries < self.policy.max_tries => {
                    pause(Duration::from_millis(
                        self.policy.retry_backoff_ms.saturating_mul(u64::from(tries)),
                    ));
                }
                FailureClass::RateLimit | FailureClass::Other => {
                    return Err(GatewayError::Exhausted { calls, last: err });
                }
            }
        }
    }

    fn call(
        &self,
        provider: ProviderKind,
        messages: &[ChatMessage],
    ) -> Result<ChatResponse, ProviderError> {
        let Some(config) = self.credentials.get(provider) else {
            return Err(ProviderError::MissingCredential {
                provider,
                env_var: format!("{}_API_KEY", provider.env_prefix()),
            });
        };
        match self.backend.complete(config, messages) {
            Ok(response) => {
                artifacts::save_response(self.paths, &response.raw);
                Ok(response)
            }
            Err(err) => {
                artifacts::save_failure(
                    self.paths,
                    provider.as_str(),
                    &format!("{err}\n{}", err.payload()),
                );
                Err(err)
            }
        }
    }

    fn maybe_substitute(
        &self,
        messages: &[ChatMessage],
        mut outcome: DispatchOutcome,
    ) -> DispatchOutcome {
        let Some(name) = escalation_target(&outcome.response.content) else {
            return outcome;
        };
        let target = match name.parse::<ProviderKind>() {
            Ok(target) => target,
            Err(err) => {
                warn!(%err, "ignoring upgrade to unknown provider");
                return outcome;
            }
        };
        if target == outcome.provider {
            debug!(provider = %target, "upgrade names the answering provider");
            return outcome;
        }
        if !self.credentials.has(target) {
            warn!(provider = %target, "no credential for upgrade target, keeping response");
            return outcome;
        }

        info!(from = %outcome.provider, to = %target, "re-issuing request for upgrade");
        outcome.calls += 1;
        match self.call(target, messages) {
            Ok(response) => DispatchOutcome {
                response,
                provider: target,
                substituted: true,
                calls: outcome.calls,
            },
            Err(err) => {
                warn!(provider = %target, err = %err, "upgrade failed, keeping original response");
                outcome
            }
        }
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}
