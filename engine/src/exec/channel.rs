//! Execution channel abstraction.
//!
//! A channel runs a command either on the local host or on a remote host
//! over SSH, returning captured output while optionally streaming lines to
//! a deployment log sink. Every call site works against the same contract,
//! so there is exactly one code path per Docker operation regardless of
//! where the engine runs it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::models::server::RemoteServer;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Sink for live output lines
pub type LogSink = mpsc::UnboundedSender<String>;

/// A command to run on an execution target
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
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

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Render for log lines ("$ docker compose up -d")
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a failed command into the error the caller surfaces
    pub fn into_result(self) -> Result<CommandOutput, EngineError> {
        if self.success() {
            Ok(self)
        } else {
            Err(EngineError::ExecutionFailed {
                stderr: if self.stderr.is_empty() {
                    format!("command exited with status {}", self.exit_code)
                } else {
                    self.stderr
                },
            })
        }
    }
}

/// Uniform interface to run commands and place files on a Docker host
#[async_trait]
pub trait ExecutionChannel: Send + Sync {
    /// Run a command, capturing stdout/stderr. Lines are forwarded to
    /// `sink` as they are produced.
    async fn exec(
        &self,
        spec: &CommandSpec,
        sink: Option<LogSink>,
    ) -> Result<CommandOutput, EngineError>;

    /// Write a file on the target filesystem, creating parent directories
    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), EngineError>;

    /// Remove a directory tree on the target filesystem
    async fn remove_dir(&self, path: &Path) -> Result<(), EngineError>;

    /// Human-readable target description for logs
    fn describe(&self) -> String;
}

/// Spawn a prepared command and stream its output line by line.
///
/// Both stdio pipes are drained concurrently so neither can fill up and
/// stall the child.
async fn run_streamed(
    mut command: Command,
    sink: Option<&LogSink>,
    stdin_data: Option<&[u8]>,
) -> Result<CommandOutput, std::io::Error> {
    command
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await?;
            stdin.shutdown().await?;
        }
    }

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let out_sink = sink.cloned();
    let err_sink = sink.cloned();

    let stdout_task = async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut collected = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(sink) = &out_sink {
                let _ = sink.send(line.clone());
            }
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    };

    let stderr_task = async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut collected = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(sink) = &err_sink {
                let _ = sink.send(line.clone());
            }
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    };

    let (stdout_text, stderr_text) = tokio::join!(stdout_task, stderr_task);
    let status = child.wait().await?;

    Ok(CommandOutput {
        stdout: stdout_text,
        stderr: stderr_text,
        exit_code: status.code().unwrap_or(-1),
    })
}

// ================================ LOCAL ================================== //

/// Runs commands directly on the local host
#[derive(Debug, Clone, Default)]
pub struct LocalChannel;

impl LocalChannel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionChannel for LocalChannel {
    async fn exec(
        &self,
        spec: &CommandSpec,
        sink: Option<LogSink>,
    ) -> Result<CommandOutput, EngineError> {
        debug!("Executing locally: {}", spec.display());

        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let output = run_streamed(command, sink.as_ref(), None).await?;
        Ok(output)
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> Result<(), EngineError> {
        if tokio::fs::metadata(path).await.is_ok() {
            tokio::fs::remove_dir_all(path).await?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}

// ================================ REMOTE ================================= //

/// OpenSSH exit code reserved for connection/authentication failures
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Runs commands on a remote host over SSH.
///
/// Connection failures are retried with bounded exponential backoff before
/// surfacing as `TargetUnreachable`. Retry policy lives here, not in the
/// Docker executor: command-level failures are never retried.
pub struct RemoteChannel {
    server: RemoteServer,
    cooldown: CooldownOptions,
    max_attempts: u32,
}

impl RemoteChannel {
    pub fn new(server: RemoteServer) -> Self {
        Self {
            server,
            cooldown: CooldownOptions::default(),
            max_attempts: 3,
        }
    }

    pub fn with_retries(mut self, max_attempts: u32, cooldown: CooldownOptions) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.cooldown = cooldown;
        self
    }

    fn ssh_base(&self) -> Command {
        let mut command = Command::new("ssh");
        command.args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"]);
        command.args(["-p", &self.server.port.to_string()]);
        if let Some(identity) = &self.server.identity_file {
            command.args(["-i", identity]);
        }
        command.arg(self.server.destination());
        command
    }

    /// Build the remote command string with every argument shell-quoted
    fn remote_command(spec: &CommandSpec) -> String {
        let mut parts = Vec::with_capacity(spec.args.len() + 1);
        parts.push(shell_quote(&spec.program));
        parts.extend(spec.args.iter().map(|a| shell_quote(a)));
        let command = parts.join(" ");

        match &spec.cwd {
            Some(cwd) => format!(
                "cd {} && {}",
                shell_quote(&cwd.to_string_lossy()),
                command
            ),
            None => command,
        }
    }

    async fn exec_once(
        &self,
        remote: &str,
        sink: Option<&LogSink>,
        stdin_data: Option<&[u8]>,
    ) -> Result<CommandOutput, std::io::Error> {
        let mut command = self.ssh_base();
        command.arg(remote);
        run_streamed(command, sink, stdin_data).await
    }

    async fn exec_with_retries(
        &self,
        remote: &str,
        sink: Option<&LogSink>,
        stdin_data: Option<&[u8]>,
    ) -> Result<CommandOutput, EngineError> {
        let mut last_failure = String::new();

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = calc_exp_backoff(&self.cooldown, attempt - 1);
                warn!(
                    "Connection to {} failed, retrying in {:?} (attempt {}/{})",
                    self.server.host,
                    delay,
                    attempt + 1,
                    self.max_attempts
                );
                tokio::time::sleep(delay).await;
            }

            match self.exec_once(remote, sink, stdin_data).await {
                Ok(output) if output.exit_code == SSH_CONNECTION_FAILURE => {
                    last_failure = output.stderr.trim().to_string();
                }
                Ok(output) => return Ok(output),
                Err(e) => {
                    last_failure = e.to_string();
                }
            }
        }

        Err(EngineError::TargetUnreachable(format!(
            "{}: {}",
            self.server.host, last_failure
        )))
    }
}

#[async_trait]
impl ExecutionChannel for RemoteChannel {
    async fn exec(
        &self,
        spec: &CommandSpec,
        sink: Option<LogSink>,
    ) -> Result<CommandOutput, EngineError> {
        debug!("Executing on {}: {}", self.server.host, spec.display());

        let remote = Self::remote_command(spec);
        self.exec_with_retries(&remote, sink.as_ref(), None).await
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), EngineError> {
        let path_str = path.to_string_lossy();
        let parent = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());

        let remote = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(&parent),
            shell_quote(&path_str)
        );

        let output = self
            .exec_with_retries(&remote, None, Some(contents.as_bytes()))
            .await?;
        output.into_result().map(|_| ())
    }

    async fn remove_dir(&self, path: &Path) -> Result<(), EngineError> {
        let remote = format!("rm -rf {}", shell_quote(&path.to_string_lossy()));
        let output = self.exec_with_retries(&remote, None, None).await?;
        output.into_result().map(|_| ())
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.server.host, self.server.server_id)
    }
}

/// Single-quote a string for POSIX shells
fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ================================ TARGET ================================= //

/// Where a job executes. Resolved exactly once at dispatch time and never
/// changed mid-job.
#[derive(Debug, Clone)]
pub enum ExecutionTarget {
    Local,
    Remote(RemoteServer),
}

impl ExecutionTarget {
    /// Open the channel for this target
    pub fn channel(&self) -> Arc<dyn ExecutionChannel> {
        match self {
            ExecutionTarget::Local => Arc::new(LocalChannel::new()),
            ExecutionTarget::Remote(server) => Arc::new(RemoteChannel::new(server.clone())),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ExecutionTarget::Local => "local".to_string(),
            ExecutionTarget::Remote(server) => server.host.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain() {
        assert_eq!(shell_quote("docker-compose.yml"), "docker-compose.yml");
        assert_eq!(shell_quote("/var/lib/dockhand"), "/var/lib/dockhand");
    }

    #[test]
    fn test_shell_quote_special() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_remote_command_quoting() {
        let spec = CommandSpec::new("docker")
            .args(["compose", "-p", "my app", "up", "-d"])
            .cwd("/srv/deploys/my app");
        let remote = RemoteChannel::remote_command(&spec);
        assert_eq!(
            remote,
            "cd '/srv/deploys/my app' && docker compose -p 'my app' up -d"
        );
    }

    #[tokio::test]
    async fn test_local_exec_captures_and_streams() {
        let channel = LocalChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let spec = CommandSpec::new("sh").args(["-c", "echo one; echo two"]);
        let output = channel.exec(&spec, Some(tx)).await.unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, "one\ntwo\n");
        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_local_exec_nonzero_exit() {
        let channel = LocalChannel::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo oops >&2; exit 3"]);
        let output = channel.exec(&spec, None).await.unwrap();

        assert!(!output.success());
        assert_eq!(output.exit_code, 3);
        assert!(matches!(
            output.into_result(),
            Err(EngineError::ExecutionFailed { stderr }) if stderr.contains("oops")
        ));
    }
}
