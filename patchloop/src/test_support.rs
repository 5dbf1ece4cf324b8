//! Test-only fakes for the provider backend and the shell, plus a temp workspace.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::Result;

use crate::core::types::{ChatMessage, ProviderKind};
use crate::io::paths::AgentPaths;
use crate::io::process::{CommandResult, CommandRunner};
use crate::io::provider::{ChatBackend, ChatResponse, FailureClass, ProviderConfig, ProviderError};

/// Pop the next scripted item; the last one repeats forever.
fn next_scripted<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Reply(String),
    Fail(FailureClass),
}

/// Chat backend that replays per-provider scripts and records every request.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: RefCell<HashMap<ProviderKind, VecDeque<Scripted>>>,
    requests: RefCell<Vec<(ProviderKind, Vec<ChatMessage>)>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply with the given assistant content.
    pub fn reply(self, provider: ProviderKind, content: &str) -> Self {
        self.push(provider, Scripted::Reply(content.to_string()))
    }

    /// Queue a failure of the given class.
    pub fn fail(self, provider: ProviderKind, class: FailureClass) -> Self {
        self.push(provider, Scripted::Fail(class))
    }

    fn push(self, provider: ProviderKind, item: Scripted) -> Self {
        self.scripts
            .borrow_mut()
            .entry(provider)
            .or_default()
            .push_back(item);
        self
    }

    /// Providers called, in call order.
    pub fn calls(&self) -> Vec<ProviderKind> {
        self.requests.borrow().iter().map(|(p, _)| *p).collect()
    }

    /// Messages of every call, in call order.
    pub fn requests(&self) -> Vec<(ProviderKind, Vec<ChatMessage>)> {
        self.requests.borrow().clone()
    }
}

impl ChatBackend for ScriptedBackend {
    fn complete(
        &self,
        provider: &ProviderConfig,
        messages: &[ChatMessage],
    ) -> std::result::Result<ChatResponse, ProviderError> {
        self.requests
            .borrow_mut()
            .push((provider.kind, messages.to_vec()));
        let kind = provider.kind;
        let next = self
            .scripts
            .borrow_mut()
            .get_mut(&kind)
            .and_then(next_scripted);
        match next {
            Some(Scripted::Reply(content)) => Ok(ChatResponse {
                raw: serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": content}}]
                })
                .to_string(),
                content,
            }),
            Some(Scripted::Fail(FailureClass::Auth)) => Err(ProviderError::Auth {
                provider: kind,
                status: 401,
                body: "scripted auth failure".to_string(),
            }),
            Some(Scripted::Fail(FailureClass::RateLimit)) => Err(ProviderError::RateLimited {
                provider: kind,
                body: "scripted rate limit".to_string(),
            }),
            Some(Scripted::Fail(FailureClass::Other)) => Err(ProviderError::Status {
                provider: kind,
                status: 500,
                body: "scripted server error".to_string(),
            }),
            None => Err(ProviderError::Status {
                provider: kind,
                status: 500,
                body: format!("no scripted response for {kind}"),
            }),
        }
    }
}

/// Command runner that answers from scripts; unscripted commands succeed with no output.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: RefCell<HashMap<String, VecDeque<(i32, String, String)>>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_output(self, command: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        self.scripts
            .borrow_mut()
            .entry(command.to_string())
            .or_default()
            .push_back((exit_code, stdout.to_string(), stderr.to_string()));
        self
    }

    pub fn on_success(self, command: &str, stdout: &str) -> Self {
        self.on_output(command, 0, stdout, "")
    }

    pub fn on_failure(self, command: &str, exit_code: i32, stderr: &str) -> Self {
        self.on_output(command, exit_code, "", stderr)
    }

    /// Every command run, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls.borrow().iter().filter(|c| *c == command).count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, command: &str, _workdir: &Path) -> Result<CommandResult> {
        self.calls.borrow_mut().push(command.to_string());
        let (exit_code, stdout, stderr) = self
            .scripts
            .borrow_mut()
            .get_mut(command)
            .and_then(next_scripted)
            .unwrap_or((0, String::new(), String::new()));
        Ok(CommandResult {
            command: command.to_string(),
            exit_code: Some(exit_code),
            stdout,
            stderr,
            timed_out: false,
            cancelled: false,
        })
    }
}

/// Temporary working directory with resolved artifact paths.
pub struct TestWorkspace {
    _temp: tempfile::TempDir,
    pub paths: AgentPaths,
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl TestWorkspace {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("create temp workspace");
        let paths = AgentPaths::new(temp.path());
        Self { _temp: temp, paths }
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(path, contents).expect("write workspace file");
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.root().join(rel)).expect("read workspace file")
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.root().join(rel).exists()
    }
}
