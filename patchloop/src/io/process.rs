//! Helpers for running shell commands with timeouts, bounded output and cancellation.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Granularity of child waits, so cancellation is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Run-wide cancellation flag, set from SIGINT/SIGTERM.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that flips when the process receives SIGINT or SIGTERM.
    pub fn from_signals() -> Result<Self> {
        let token = Self::new();
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&token.flag))
                .with_context(|| format!("register handler for signal {signal}"))?;
        }
        Ok(token)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Build a platform shell invocation for `command`, spawned in its own process group.
pub fn shell_command(command: &str, workdir: &Path) -> Command {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    };
    own_process_group(&mut cmd);
    cmd.current_dir(workdir);
    cmd
}

/// Spawn the child as the leader of a new process group so the whole group can be killed.
pub fn own_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// On timeout or cancellation the child's whole process group is killed.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if let Some(status) = child.wait_timeout(WAIT_SLICE).context("wait for command")? {
            break status;
        }
        if cancel.is_cancelled() {
            warn!("run cancelled, killing command");
            cancelled = true;
        } else if Instant::now() >= deadline {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
        } else {
            continue;
        }
        kill_process_tree(&mut child)?;
        break child.wait().context("wait command after kill")?;
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    if let Err(err) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        debug!(%err, "killpg failed, killing child directly");
        child.kill().context("kill command")?;
    }
    Ok(())
}

#[cfg(windows)]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    let status = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &child.id().to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => Ok(()),
        _ => child.kill().context("kill command"),
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// Outcome of one shell command, as recorded in history and fed to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub command: String,
    /// `None` when the process was killed or died from a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandResult {
    pub fn from_output(command: &str, output: CommandOutput) -> Self {
        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.stdout_truncated > 0 {
            stdout.push_str(&format!(
                "\n[stdout truncated {} bytes]",
                output.stdout_truncated
            ));
        }
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.stderr_truncated > 0 {
            stderr.push_str(&format!(
                "\n[stderr truncated {} bytes]",
                output.stderr_truncated
            ));
        }
        Self {
            command: command.to_string(),
            exit_code: output.status.code(),
            stdout,
            stderr,
            timed_out: output.timed_out,
            cancelled: output.cancelled,
        }
    }

    /// A result for a command that never produced a process.
    pub fn spawn_failure(command: &str, err: &anyhow::Error) -> Self {
        Self {
            command: command.to_string(),
            exit_code: None,
            stdout: String::new(),
            stderr: format!("{err:#}"),
            timed_out: false,
            cancelled: false,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    fn exit_text(&self) -> String {
        if self.timed_out {
            "timed out".to_string()
        } else if self.cancelled {
            "cancelled".to_string()
        } else {
            match self.exit_code {
                Some(code) => code.to_string(),
                None => "none".to_string(),
            }
        }
    }

    /// Labelled block used in the context bundle (`Lint exit code: 0`, ...).
    pub fn render(&self, label: &str) -> String {
        format!(
            "{label} exit code: {}\n{label} stdout:\n{}\n{label} stderr:\n{}",
            self.exit_text(),
            self.stdout.trim_end(),
            self.stderr.trim_end()
        )
    }

    /// Command history entry.
    pub fn history_entry(&self) -> String {
        format!(
            "$ {}\nexit code: {}\nstdout:\n{}\nstderr:\n{}",
            self.command,
            self.exit_text(),
            self.stdout.trim_end(),
            self.stderr.trim_end()
        )
    }
}

/// Executes shell commands for the applier, the validation gate and environment checks.
pub trait CommandRunner {
    fn run(&self, command: &str, workdir: &Path) -> Result<CommandResult>;
}

/// Runs commands through the platform shell.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: CancelToken,
}

impl CommandRunner for ShellRunner {
    #[instrument(skip_all, fields(command = %command))]
    fn run(&self, command: &str, workdir: &Path) -> Result<CommandResult> {
        if self.cancel.is_cancelled() {
            return Err(anyhow!("run cancelled before '{command}' started"));
        }
        let cmd = shell_command(command, workdir);
        let output =
            run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes, &self.cancel)
                .with_context(|| format!("run '{command}'"))?;
        Ok(CommandResult::from_output(command, output))
    }
}
