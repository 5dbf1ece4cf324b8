//! Well-known locations inside the working directory.

use std::path::{Path, PathBuf};

/// Directory holding config and per-run artifacts, relative to the working directory.
pub const STATE_DIR: &str = ".patchloop";

/// Resolved artifact paths for one working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub last_prompt_path: PathBuf,
    pub last_response_path: PathBuf,
    pub last_failure_path: PathBuf,
    pub notes_path: PathBuf,
    pub llmignore_path: PathBuf,
    pub nocontents_path: PathBuf,
    pub rules_path: PathBuf,
    pub dotenv_path: PathBuf,
}

impl AgentPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(STATE_DIR);
        Self {
            config_path: state_dir.join("config.toml"),
            last_prompt_path: state_dir.join("lastprompt.txt"),
            last_response_path: state_dir.join("lastresponse.json"),
            last_failure_path: state_dir.join("lastfailure.txt"),
            notes_path: root.join("NOTES.txt"),
            llmignore_path: root.join(".llmignore"),
            nocontents_path: root.join(".nocontents"),
            rules_path: root.join(".cursor").join("rules"),
            dotenv_path: root.join(".env"),
            state_dir,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
