//! External command execution.
//!
//! Every git, docker, build and pipeline invocation goes through a
//! [`CommandRunner`]. Children are spawned with `kill_on_drop`, so dropping
//! the future that awaits a command (for example when the CLI receives
//! SIGINT) terminates the process.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CommandError;

/// Environment variable that suppresses streamed subprocess output.
pub const SILENT_ENV: &str = "SILENT";

/// How long streamed output may stay open after the child has exited.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// An external program invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub work_dir: Option<PathBuf>,
    pub executable: String,
    pub args: Vec<String>,
    /// Forward output to the log line by line instead of capturing it.
    pub stream: bool,
}

impl Command {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn streamed(mut self) -> Self {
        self.stream = true;
        self
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.executable)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured output of a finished command. Empty for streamed commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn from_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim_end();
        let stderr = self.stderr.trim_end();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.trim_start().to_string(),
            (false, true) => stdout.trim_start().to_string(),
            (false, false) => format!("{}\n{}", stdout.trim_start(), stderr),
        }
    }
}

/// Runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion. A non-zero exit is an error.
    async fn run(&self, command: &Command) -> Result<CommandOutput, CommandError>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    silent: bool,
}

impl ProcessRunner {
    /// `silent` turns streamed commands into captured ones.
    pub fn new(silent: bool) -> Self {
        Self { silent }
    }

    async fn run_captured(
        &self,
        command: &Command,
        mut process: tokio::process::Command,
    ) -> Result<CommandOutput, CommandError> {
        let output = process
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| spawn_error(command, source))?;

        let captured = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !output.status.success() {
            return Err(CommandError::Failed {
                program: command.executable.clone(),
                status: output.status.to_string(),
                output: captured.combined(),
            });
        }
        Ok(captured)
    }

    /// Forward output while the child runs. The result is decided by the
    /// child's exit; output still open afterwards (for example held by a
    /// backgrounded grandchild) is drained for at most
    /// [`OUTPUT_DRAIN_TIMEOUT`].
    async fn run_streamed(
        &self,
        command: &Command,
        mut process: tokio::process::Command,
    ) -> Result<CommandOutput, CommandError> {
        let mut child = process
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| spawn_error(command, source))?;

        let mut forwarders = Forwarders(vec![
            tokio::spawn(forward_lines(child.stdout.take(), "stdout")),
            tokio::spawn(forward_lines(child.stderr.take(), "stderr")),
        ]);
        let status = child.wait().await.map_err(|source| CommandError::Io {
            program: command.executable.clone(),
            source,
        })?;
        if !forwarders.drain(OUTPUT_DRAIN_TIMEOUT).await {
            debug!(command = %command, "output still open after exit, detaching");
        }

        if !status.success() {
            return Err(CommandError::Failed {
                program: command.executable.clone(),
                status: status.to_string(),
                output: String::new(),
            });
        }
        Ok(CommandOutput::default())
    }
}

/// Output forwarding tasks of one streamed command, aborted on drop.
struct Forwarders(Vec<JoinHandle<()>>);

impl Forwarders {
    /// Wait up to `limit` for every forwarder to reach end of output.
    async fn drain(&mut self, limit: Duration) -> bool {
        let all = async {
            for task in self.0.iter_mut() {
                let _ = task.await;
            }
        };
        tokio::time::timeout(limit, all).await.is_ok()
    }
}

impl Drop for Forwarders {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &Command) -> Result<CommandOutput, CommandError> {
        if command.executable.is_empty() {
            return Err(CommandError::EmptyExecutable);
        }

        let mut process = tokio::process::Command::new(&command.executable);
        process
            .args(&command.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &command.work_dir {
            process.current_dir(dir);
        }

        debug!(command = %command, work_dir = ?command.work_dir, "running command");
        if command.stream && !self.silent {
            self.run_streamed(command, process).await
        } else {
            self.run_captured(command, process).await
        }
    }
}

fn spawn_error(command: &Command, source: std::io::Error) -> CommandError {
    CommandError::Spawn {
        program: command.executable.clone(),
        source,
    }
}

/// Log `reader` line by line. Lines need not be valid UTF-8.
async fn forward_lines<R>(reader: Option<R>, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).split(b'\n');
    loop {
        match lines.next_segment().await {
            Ok(Some(line)) => {
                let line = String::from_utf8_lossy(&line);
                info!(stream, "{}", line.trim_end_matches('\r'));
            }
            Ok(None) => break,
            Err(err) => {
                warn!(stream, error = %err, "failed to read command output");
                break;
            }
        }
    }
}

/// Interpret a boolean-ish environment value. Unset, empty, `0`, `false`,
/// `no` and `off` are false; anything else is true.
pub fn is_truthy(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") => false,
        Some(v) => !matches!(
            v.to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        ),
    }
}

/// Whether [`SILENT_ENV`] asks for silent subprocess output.
pub fn silent_from_env() -> bool {
    is_truthy(std::env::var(SILENT_ENV).ok().as_deref())
}
