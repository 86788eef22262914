//! Running external executables as part of a check.
//!
//! [`ProcessHarness`] streams the standard output of a child process to a
//! [`ChunkProcessor`] while staying responsive to cancellation. The helpers in
//! [`command`] run a process to completion and hand back its whole output.

pub mod command;

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ProcessError;

const RAW_CHUNK_SIZE: usize = 8 * 1024;
const FILE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How the standard output is cut into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitPolicy {
    /// Newline terminated lines, without the line ending.
    #[default]
    Lines,
    /// Chunks terminated by the given byte, without the delimiter.
    Delimiter(u8),
    /// Whatever a single read returns.
    Raw,
}

/// Receives every chunk of output. Returning `false` stops reading.
pub trait ChunkProcessor: Send {
    fn process_chunk(&mut self, chunk: &[u8]) -> bool;
}

impl<F> ChunkProcessor for F
where
    F: FnMut(&[u8]) -> bool + Send,
{
    fn process_chunk(&mut self, chunk: &[u8]) -> bool {
        self(chunk)
    }
}

/// Why output reading ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The process closed its output, or reading it failed.
    Exhausted,
    /// The processor asked to stop.
    Processor,
    /// The execution context was canceled.
    Canceled,
}

#[derive(Debug)]
pub struct ProcessResult {
    pub status: ExitStatus,
    /// Raw bytes read from standard output before reading stopped.
    pub output: Vec<u8>,
    pub stop_reason: StopReason,
}

impl ProcessResult {
    pub fn stopped_early(&self) -> bool {
        self.stop_reason != StopReason::Exhausted
    }

    pub fn canceled(&self) -> bool {
        self.stop_reason == StopReason::Canceled
    }
}

/// Runs an executable and streams its standard output in chunks.
#[derive(Debug, Clone)]
pub struct ProcessHarness {
    executable: String,
    args: Vec<String>,
    split: SplitPolicy,
}

impl ProcessHarness {
    pub fn new<I, S>(executable: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            executable: executable.into(),
            args: args.into_iter().map(Into::into).collect(),
            split: SplitPolicy::default(),
        }
    }

    pub fn with_split(mut self, split: SplitPolicy) -> Self {
        self.split = split;
        self
    }

    /// Starts the process and feeds its output to `processor` until the
    /// output ends, the processor returns `false` or `cancel` fires, then
    /// waits for the process to exit. Cancellation kills the process.
    ///
    /// Only starting the process is an error; a non-zero exit is reported
    /// through the returned status.
    pub async fn run<P>(&self, cancel: &CancellationToken, processor: &mut P) -> Result<ProcessResult, ProcessError>
    where
        P: ChunkProcessor + ?Sized,
    {
        log::info!("[process] run: executable={} args={:?}", self.executable, self.args);
        let start = Instant::now();

        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                log::error!("[process] start_failed: executable={} error={}", self.executable, source);
                ProcessError::Start { executable: self.executable.clone(), source }
            })?;

        let stderr_task = child.stderr.take().map(|stderr| {
            let executable = self.executable.clone();
            tokio::spawn(drain_stderr(executable, stderr))
        });

        let (output, stop_reason) = match child.stdout.take() {
            Some(stdout) => read_chunks(stdout, self.split, cancel, processor).await,
            None => (Vec::new(), StopReason::Exhausted),
        };
        log::debug!("[process] output_reading_stopped: executable={} reason={:?} bytes={}",
            self.executable, stop_reason, output.len());

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                log::warn!("[process] killing: executable={} reason=canceled", self.executable);
                if let Err(e) = child.start_kill() {
                    log::warn!("[process] kill_failed: executable={} error={}", self.executable, e);
                }
                child.wait().await
            }
        }
        .map_err(|source| ProcessError::Wait { executable: self.executable.clone(), source })?;

        if let Some(task) = stderr_task {
            // descendants of a killed process may keep stderr open
            if cancel.is_cancelled() {
                task.abort();
            } else if let Err(e) = task.await {
                log::warn!("[process] stderr_task_failed: executable={} error={}", self.executable, e);
            }
        }

        if status.success() {
            log::info!("[process] finished: executable={} status={} duration={}ms",
                self.executable, status, start.elapsed().as_millis());
        } else {
            log::error!("[process] finished_unsuccessfully: executable={} status={} duration={}ms",
                self.executable, status, start.elapsed().as_millis());
        }

        let stop_reason = if stop_reason == StopReason::Exhausted && cancel.is_cancelled() {
            StopReason::Canceled
        } else {
            stop_reason
        };
        Ok(ProcessResult { status, output, stop_reason })
    }
}

async fn drain_stderr<R>(executable: String, mut stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    match stderr.read_to_end(&mut buf).await {
        Ok(_) if !buf.is_empty() => {
            log::error!("[process] stderr: executable={} output={}",
                executable, String::from_utf8_lossy(&buf).trim_end());
        }
        Ok(_) => {}
        Err(e) => log::error!("[process] stderr_read_failed: executable={} error={}", executable, e),
    }
}

async fn read_chunks<R, P>(
    stdout: R,
    split: SplitPolicy,
    cancel: &CancellationToken,
    processor: &mut P,
) -> (Vec<u8>, StopReason)
where
    R: AsyncRead + Unpin,
    P: ChunkProcessor + ?Sized,
{
    let mut reader = BufReader::new(stdout);
    let mut output = Vec::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::warn!("[process] reading_canceled");
                return (output, StopReason::Canceled);
            }
            read = next_chunk(&mut reader, split, &mut buf) => read,
        };

        match read {
            Ok(0) => return (output, StopReason::Exhausted),
            Ok(_) => {}
            Err(e) => {
                log::error!("[process] stdout_read_failed: error={}", e);
                return (output, StopReason::Exhausted);
            }
        }
        output.extend_from_slice(&buf);

        if cancel.is_cancelled() {
            log::warn!("[process] reading_canceled");
            return (output, StopReason::Canceled);
        }
        let chunk = trim_chunk(&buf, split);
        log::trace!("[process] chunk_read: len={} chunk={}", chunk.len(), String::from_utf8_lossy(chunk));
        if !processor.process_chunk(chunk) {
            log::info!("[process] processor_signaled_stop");
            return (output, StopReason::Processor);
        }
    }
}

async fn next_chunk<R>(reader: &mut BufReader<R>, split: SplitPolicy, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match split {
        SplitPolicy::Lines => reader.read_until(b'\n', buf).await,
        SplitPolicy::Delimiter(delim) => reader.read_until(delim, buf).await,
        SplitPolicy::Raw => {
            buf.resize(RAW_CHUNK_SIZE, 0);
            let n = reader.read(buf).await?;
            buf.truncate(n);
            Ok(n)
        }
    }
}

fn trim_chunk(buf: &[u8], split: SplitPolicy) -> &[u8] {
    match split {
        SplitPolicy::Lines => {
            let line = buf.strip_suffix(b"\n").unwrap_or(buf);
            line.strip_suffix(b"\r").unwrap_or(line)
        }
        SplitPolicy::Delimiter(delim) => buf.strip_suffix(&[delim]).unwrap_or(buf),
        SplitPolicy::Raw => buf,
    }
}

/// Waits until `path` exists and opens it, typically a report that a
/// process writes once it is done. Any error other than the file not
/// existing yet is returned right away.
pub async fn wait_for_file(path: impl AsRef<Path>, cancel: &CancellationToken) -> Result<tokio::fs::File, ProcessError> {
    let path = path.as_ref();
    let file_error = |source: std::io::Error| ProcessError::File { path: path.display().to_string(), source };
    loop {
        match tokio::fs::metadata(path).await {
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::trace!("[process] waiting_for_file: path={}", path.display());
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProcessError::Canceled),
                    _ = tokio::time::sleep(FILE_POLL_INTERVAL) => {}
                }
            }
            Err(e) => return Err(file_error(e)),
        }
    }
    tokio::fs::File::open(path).await.map_err(file_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessHarness {
        ProcessHarness::new("sh", ["-c", script])
    }

    #[tokio::test]
    async fn test_reads_every_line() {
        let mut lines = Vec::new();
        let mut processor = |chunk: &[u8]| {
            lines.push(String::from_utf8_lossy(chunk).to_string());
            true
        };
        let result = sh("printf 'one\\ntwo\\r\\nthree'").run(&CancellationToken::new(), &mut processor).await.unwrap();

        assert_eq!(lines, vec!["one", "two", "three"]);
        assert!(result.status.success());
        assert_eq!(result.stop_reason, StopReason::Exhausted);
        assert_eq!(result.output, b"one\ntwo\r\nthree");
    }

    #[tokio::test]
    async fn test_processor_stops_reading() {
        let mut seen = Vec::new();
        let mut processor = |chunk: &[u8]| {
            seen.push(String::from_utf8_lossy(chunk).to_string());
            chunk != b"TOKEN"
        };
        let result = sh("echo first; echo TOKEN; echo after; echo more")
            .run(&CancellationToken::new(), &mut processor)
            .await
            .unwrap();

        assert_eq!(seen, vec!["first", "TOKEN"]);
        assert_eq!(result.stop_reason, StopReason::Processor);
        assert!(result.stopped_early());
    }

    #[tokio::test]
    async fn test_custom_delimiter() {
        let mut chunks = Vec::new();
        let mut processor = |chunk: &[u8]| {
            chunks.push(chunk.to_vec());
            true
        };
        sh("printf 'a,b,c'")
            .with_split(SplitPolicy::Delimiter(b','))
            .run(&CancellationToken::new(), &mut processor)
            .await
            .unwrap();
        assert_eq!(chunks, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let mut processor = |_: &[u8]| true;
        let result = sh("echo out; echo err >&2; exit 3").run(&CancellationToken::new(), &mut processor).await.unwrap();
        assert_eq!(result.status.code(), Some(3));
        assert_eq!(result.output, b"out\n");
    }

    #[tokio::test]
    async fn test_start_failure() {
        let mut processor = |_: &[u8]| true;
        let result = ProcessHarness::new("/nonexistent/binary", Vec::<String>::new())
            .run(&CancellationToken::new(), &mut processor)
            .await;
        assert!(matches!(result, Err(ProcessError::Start { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let mut processor = |_: &[u8]| true;
        let start = Instant::now();
        let result = sh("echo started; exec sleep 30").run(&cancel, &mut processor).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(result.canceled());
        assert!(!result.status.success());
        assert_eq!(result.output, b"started\n");
    }

    #[tokio::test]
    async fn test_wait_for_file_appears_later() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let writer = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            tokio::fs::write(writer, b"{}").await.unwrap();
        });

        let mut file = tokio::time::timeout(Duration::from_secs(10), wait_for_file(&path, &CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "{}");
    }

    #[tokio::test]
    async fn test_wait_for_file_canceled() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = wait_for_file(dir.path().join("never"), &cancel).await;
        assert!(matches!(result, Err(ProcessError::Canceled)));
    }

    #[tokio::test]
    async fn test_wait_for_file_reports_other_errors() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("plain");
        std::fs::write(&blocker, b"").unwrap();
        // a path below a regular file can never exist
        let result = wait_for_file(blocker.join("report.json"), &CancellationToken::new()).await;
        assert!(matches!(result, Err(ProcessError::File { .. })));
    }
}
