//! `patchloop`: iterate on a working tree until an instruction is done.
//!
//! `patchloop <instruction...>` runs attempts against the current directory (or `-C <dir>`).
//! `patchloop rewrite` replays the file writes of the last saved response.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use patchloop::controller::{RunError, RunSettings, run_attempts};
use patchloop::core::types::ProviderKind;
use patchloop::exit_codes;
use patchloop::io::artifacts;
use patchloop::io::config::load_config;
use patchloop::io::paths::AgentPaths;
use patchloop::io::process::{CancelToken, ShellRunner};
use patchloop::io::provider::{Credentials, HttpBackend};
use patchloop::logging;
use patchloop::rewrite::replay_last_response;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "patchloop",
    version,
    about = "Iterative code-modification agent",
    after_help = "Use `patchloop rewrite` to replay the file writes of the last saved response."
)]
struct Cli {
    /// Natural-language instruction, or `rewrite`.
    #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
    instruction: Vec<String>,

    /// Provider to start with (mistral, groq, openrouter, together, openai).
    #[arg(long)]
    model: Option<ProviderKind>,

    /// Override `max_attempts` from the config file.
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Working directory.
    #[arg(short = 'C', long = "dir", default_value = ".")]
    dir: PathBuf,
}

impl Cli {
    fn is_rewrite(&self) -> bool {
        self.instruction.len() == 1 && self.instruction[0] == "rewrite"
    }
}

fn main() {
    let cli = Cli::parse();
    let code = match run(&cli) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&cli.dir, &err)
        }
    };
    process::exit(code);
}

fn run(cli: &Cli) -> Result<()> {
    let root = cli
        .dir
        .canonicalize()
        .with_context(|| format!("resolve working directory {}", cli.dir.display()))?;
    let paths = AgentPaths::new(&root);
    if paths.dotenv_path.is_file() {
        dotenvy::from_path(&paths.dotenv_path)
            .with_context(|| format!("load {}", paths.dotenv_path.display()))?;
    }
    logging::init();

    if cli.is_rewrite() {
        let written = replay_last_response(&root)?;
        for path in &written {
            println!("{path}");
        }
        return Ok(());
    }

    let mut config = load_config(&paths.config_path)?;
    if let Some(max_attempts) = cli.max_attempts {
        config.max_attempts = max_attempts;
        config.validate()?;
    }
    let cancel = CancelToken::from_signals()?;
    let runner = ShellRunner {
        timeout: config.command_timeout(),
        output_limit_bytes: config.output_limit_bytes,
        cancel: cancel.clone(),
    };
    let backend = HttpBackend::new(config.request_timeout())?;
    let settings = RunSettings {
        instruction: cli.instruction.join(" "),
        requested_provider: cli.model.unwrap_or(config.default_provider),
        credentials: Credentials::from_env(),
        cancel,
        config,
    };

    let outcome = run_attempts(&root, &backend, &runner, &settings, |report| {
        match report.verdict.reason() {
            None => info!(attempt = report.attempt, provider = %report.provider, "attempt passed"),
            Some(reason) => {
                warn!(attempt = report.attempt, provider = %report.provider, %reason, "attempt failed");
            }
        }
    })?;
    println!(
        "done after {} attempt(s) using {}",
        outcome.attempts, outcome.provider
    );
    Ok(())
}

/// Map a run error to its exit code, noting unexpected failures in NOTES.txt.
fn exit_code_for(dir: &Path, err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<RunError>() {
        Some(RunError::MaxAttemptsReached { .. }) => exit_codes::MAX_ATTEMPTS,
        Some(RunError::ProviderExhausted { .. }) => exit_codes::PROVIDER_EXHAUSTED,
        Some(RunError::Cancelled { .. }) => exit_codes::CANCELLED,
        Some(RunError::EmptyInstruction | RunError::NoCredential(_)) => exit_codes::INVALID,
        None => {
            if dir.is_dir() {
                artifacts::append_note(&AgentPaths::new(dir), "patchloop", "fatal", &format!("{err:#}"));
            }
            exit_codes::INVALID
        }
    }
}
