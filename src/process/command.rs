use serde::de::DeserializeOwned;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ProcessError;

/// Everything a finished process produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code, `None` when the process was ended by a signal.
    pub status: Option<i32>,
}

/// Runs `executable` to completion and collects both output streams.
///
/// A non-zero exit code is not an error. Cancelling `cancel` kills the
/// process and returns [`ProcessError::Canceled`].
pub async fn execute_with_stderr(
    cancel: &CancellationToken,
    executable: &str,
    args: &[&str],
) -> Result<CommandOutput, ProcessError> {
    log::info!("[process::command] execute: executable={} args={:?}", executable, args);
    let child = Command::new(executable)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Start { executable: executable.to_string(), source })?;

    let output = tokio::select! {
        output = child.wait_with_output() => output
            .map_err(|source| ProcessError::Wait { executable: executable.to_string(), source })?,
        _ = cancel.cancelled() => {
            log::warn!("[process::command] canceled: executable={}", executable);
            return Err(ProcessError::Canceled);
        }
    };

    log::debug!("[process::command] completed: executable={} status={} stdout_len={} stderr_len={}",
        executable, output.status, output.stdout.len(), output.stderr.len());
    Ok(CommandOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        status: output.status.code(),
    })
}

/// Like [`execute_with_stderr`] but only returns standard output and the exit code.
pub async fn execute(
    cancel: &CancellationToken,
    executable: &str,
    args: &[&str],
) -> Result<(Vec<u8>, Option<i32>), ProcessError> {
    let output = execute_with_stderr(cancel, executable, args).await?;
    Ok((output.stdout, output.status))
}

/// Runs the command and decodes its standard output as JSON. A decoding
/// failure returns [`ProcessError::Parse`] with the raw outputs attached.
pub async fn execute_and_parse_json<T>(
    cancel: &CancellationToken,
    executable: &str,
    args: &[&str],
) -> Result<(T, Option<i32>), ProcessError>
where
    T: DeserializeOwned,
{
    let output = execute_with_stderr(cancel, executable, args).await?;
    match serde_json::from_slice(&output.stdout) {
        Ok(parsed) => Ok((parsed, output.status)),
        Err(e) => {
            log::error!("[process::command] parse_failed: executable={} error={}", executable, e);
            Err(ProcessError::Parse {
                output: output.stdout,
                err_output: output.stderr,
                status: output.status,
                parser_error: e.to_string(),
            })
        }
    }
}
