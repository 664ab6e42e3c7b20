use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use burn_pipe::{PipeError, PipeListener, PipeStream};
use tracing::debug;
use wait_timeout::ChildExt;

/// Runs a command to completion and returns its exit code. A command that
/// cannot start is an error; a non-zero exit code is not.
pub fn run_process(command: &mut Command, context_message: &str) -> Result<u32> {
    let output = command
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    let code = exit_code(output.status.code());
    if code != 0 {
        debug!(
            "{context_message}: status={} stdout='{}' stderr='{}'",
            output.status,
            String::from_utf8_lossy(&output.stdout).trim(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(code)
}

/// Like [`run_process`] for tools where any non-zero exit is a failure.
pub fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

fn exit_code(code: Option<i32>) -> u32 {
    // Killed by a signal: report a generic failure.
    code.map_or(1, |code| code as u32)
}

/// A process started by a [`ProcessLauncher`].
pub trait ChildProcess: Send {
    /// The exit code once the process has exited.
    fn try_wait(&mut self) -> Result<Option<u32>>;

    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<u32>>;

    fn kill(&mut self) -> Result<()>;
}

/// Starts the elevated engine process and embedded bundles.
pub trait ProcessLauncher: Send + Sync {
    fn launch(
        &self,
        executable: &Path,
        arguments: &[String],
        elevate: bool,
    ) -> Result<Box<dyn ChildProcess>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(
        &self,
        executable: &Path,
        arguments: &[String],
        elevate: bool,
    ) -> Result<Box<dyn ChildProcess>> {
        let mut command = if elevate && cfg!(windows) {
            build_runas_command(executable, arguments)
        } else {
            let mut command = Command::new(executable);
            command.args(arguments);
            command
        };
        command.stdin(Stdio::null());
        debug!(executable = %executable.display(), elevate, "launching process");
        let child = command
            .spawn()
            .with_context(|| format!("failed to launch {}", executable.display()))?;
        Ok(Box::new(SystemChild { child }))
    }
}

/// PowerShell's `Start-Process -Verb RunAs` raises the UAC prompt. The
/// wrapper exits with the elevated process's code, or non-zero at once when
/// the prompt is declined.
pub(crate) fn build_runas_command(executable: &Path, arguments: &[String]) -> Command {
    let mut command = Command::new("powershell");
    command
        .arg("-NoProfile")
        .arg("-NonInteractive")
        .arg("-Command")
        .arg(
            "$p = Start-Process -FilePath $env:BURN_ELEVATE_EXE -ArgumentList $env:BURN_ELEVATE_ARGS -Verb RunAs -PassThru -Wait; exit $p.ExitCode",
        )
        .env("BURN_ELEVATE_EXE", executable)
        .env("BURN_ELEVATE_ARGS", join_command_line(arguments));
    command
}

#[derive(Debug)]
struct SystemChild {
    child: Child,
}

impl ChildProcess for SystemChild {
    fn try_wait(&mut self) -> Result<Option<u32>> {
        let status = self.child.try_wait().context("failed to poll child process")?;
        Ok(status.map(|status| exit_code(status.code())))
    }

    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<u32>> {
        let status = self
            .child
            .wait_timeout(timeout)
            .context("failed to wait for child process")?;
        Ok(status.map(|status| exit_code(status.code())))
    }

    fn kill(&mut self) -> Result<()> {
        self.child.kill().context("failed to stop child process")
    }
}

/// Why a child never connected to its pipe.
#[derive(Debug)]
pub(crate) enum ChildConnectError {
    Pipe(PipeError),
    Exited(u32),
    Poll(anyhow::Error),
}

impl From<PipeError> for ChildConnectError {
    fn from(err: PipeError) -> Self {
        Self::Pipe(err)
    }
}

/// Accepts the child's connection, giving up as soon as the child exits.
pub(crate) fn accept_from_child(
    listener: &PipeListener,
    child: &mut dyn ChildProcess,
    timeout: Duration,
) -> Result<PipeStream, ChildConnectError> {
    listener.accept_until(timeout, || match child.try_wait() {
        Ok(Some(code)) => Err(ChildConnectError::Exited(code)),
        Ok(None) => Ok(()),
        Err(err) => Err(ChildConnectError::Poll(err)),
    })
}

/// Splits a command line on whitespace, honoring double quotes. A doubled
/// quote inside quotes is a literal quote.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut arguments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            ch if ch.is_whitespace() && !in_quotes => {
                if has_token {
                    arguments.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            ch => {
                current.push(ch);
                has_token = true;
            }
        }
    }
    if has_token {
        arguments.push(current);
    }
    arguments
}

/// Quotes arguments that need it and joins them into one command line.
pub fn join_command_line(arguments: &[String]) -> String {
    arguments
        .iter()
        .map(|argument| {
            if !argument.is_empty() && !argument.contains([' ', '\t', '"']) {
                argument.clone()
            } else {
                format!("\"{}\"", argument.replace('"', "\"\""))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
