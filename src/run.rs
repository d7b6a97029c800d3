//! One-shot command execution.
//!
//! Every `run*` method opens a shell, executes one command, wires the
//! caller's streams to it, waits for completion and closes the shell on
//! every exit path. A drop mid-run (task aborted, panic unwinding) leaves
//! the shell to the [`Shell`] drop guard.
//!
//! When both the run and the shell delete fail, the run error is returned
//! and the delete error is logged. A delete failure after a successful run
//! is logged and the exit code returned. Buffered runs that fail hand back
//! the output collected so far inside [`RunError`].

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::Client;
use crate::command::FAILURE_EXIT_CODE;
use crate::error::{Result, RunError, RunResult, WinRmError};
use crate::powershell;
use crate::shell::Shell;
use crate::types::RunOutput;

impl Client {
    /// Run `command`, streaming its output to `stdout` and `stderr`.
    ///
    /// The command gets no input.
    pub async fn run<O, E>(
        &self,
        token: &CancellationToken,
        command: &str,
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<i32>
    where
        O: AsyncWrite + Unpin + ?Sized,
        E: AsyncWrite + Unpin + ?Sized,
    {
        self.run_with_input(token, command, stdout, stderr, None::<tokio::io::Empty>)
            .await
    }

    /// Run `command`, streaming output to the sinks and feeding it `stdin`.
    ///
    /// `None` means no input; the command's stdin is left open and the
    /// stdin duty completes at once. Cancelling `token` terminates the
    /// remote command and yields [`WinRmError::Cancelled`].
    pub async fn run_with_input<O, E, R>(
        &self,
        token: &CancellationToken,
        command: &str,
        stdout: &mut O,
        stderr: &mut E,
        stdin: Option<R>,
    ) -> Result<i32>
    where
        O: AsyncWrite + Unpin + ?Sized,
        E: AsyncWrite + Unpin + ?Sized,
        R: AsyncRead + Unpin,
    {
        if token.is_cancelled() {
            return Err(WinRmError::Cancelled);
        }

        let shell = self.create_shell().await?;
        let outcome = run_in_shell(&shell, token, command, stdout, stderr, stdin).await;
        let closed = shell.close().await;

        match (outcome, closed) {
            (Ok(code), Ok(())) => {
                info!(shell_id = %shell.id(), exit_code = code, "Remote command finished");
                Ok(code)
            }
            (Ok(code), Err(e)) => {
                warn!(shell_id = %shell.id(), error = %e, "Failed to delete shell after run");
                Ok(code)
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!(
                    shell_id = %shell.id(),
                    error = %close_err,
                    "Failed to delete shell after failed run"
                );
                Err(e)
            }
        }
    }

    /// Run `command` with `stdin` as its input, buffering its output.
    pub async fn run_with_string(
        &self,
        token: &CancellationToken,
        command: &str,
        stdin: &str,
    ) -> RunResult {
        self.run_buffered(token, command, Some(stdin.as_bytes())).await
    }

    /// Run `command` without input, buffering its output.
    pub async fn run_cmd(&self, token: &CancellationToken, command: &str) -> RunResult {
        self.run_buffered(token, command, None).await
    }

    /// Run a PowerShell script without input, buffering its output.
    ///
    /// A blank script fails with [`WinRmError::Encoding`] before any remote
    /// call.
    pub async fn run_ps(&self, token: &CancellationToken, script: &str) -> RunResult {
        let command = encode_script(script)?;
        self.run_buffered(token, &command, None).await
    }

    /// Run a PowerShell script with `stdin` as its input, buffering its
    /// output.
    pub async fn run_ps_with_string(
        &self,
        token: &CancellationToken,
        script: &str,
        stdin: &str,
    ) -> RunResult {
        let command = encode_script(script)?;
        self.run_buffered(token, &command, Some(stdin.as_bytes())).await
    }

    async fn run_buffered(
        &self,
        token: &CancellationToken,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> RunResult {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let result = self
            .run_with_input(token, command, &mut stdout, &mut stderr, stdin)
            .await;

        let output = |exit_code| RunOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        };
        match result {
            Ok(exit_code) => Ok(output(exit_code)),
            Err(error) => Err(RunError {
                output: output(FAILURE_EXIT_CODE),
                error,
            }),
        }
    }
}

fn encode_script(script: &str) -> Result<String> {
    powershell::encode(script)
        .ok_or_else(|| WinRmError::Encoding("script is empty".to_string()))
}

async fn run_in_shell<O, E, R>(
    shell: &Shell,
    token: &CancellationToken,
    command: &str,
    stdout: &mut O,
    stderr: &mut E,
    stdin: Option<R>,
) -> Result<i32>
where
    O: AsyncWrite + Unpin + ?Sized,
    E: AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + Unpin,
{
    let mut command = shell.execute_with_cancel(token, command).await?;
    let pumped = command.pump(stdout, stderr, stdin).await;

    if let Err(e) = command.close().await {
        warn!(command_id = %command.id(), error = %e, "Failed to terminate finished command");
    }

    pumped?;
    Ok(command.exit_code())
}
