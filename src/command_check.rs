use async_trait::async_trait;
use eyre::WrapErr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::check::Checker;
use crate::error::{CheckError, PushError};
use crate::process::ProcessHarness;
use crate::state::CheckHandle;

const TARGET_PLACEHOLDER: &str = "{target}";
const OPTIONS_PLACEHOLDER: &str = "{options}";
/// Share of the remaining distance to 1.0 covered by every output line.
const PROGRESS_STEP: f32 = 0.05;
const MAX_PROGRESS: f32 = 0.99;

/// Runs an external program as the check body. Each line the program prints
/// becomes a line of the report notes.
#[derive(Debug, Clone)]
pub struct CommandChecker {
    program: String,
    args: Vec<String>,
}

impl CommandChecker {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Arguments with `{target}` and `{options}` substituted.
    pub fn expand_args(&self, target: &str, options: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(TARGET_PLACEHOLDER, target).replace(OPTIONS_PLACEHOLDER, options))
            .collect()
    }
}

fn next_progress(current: f32) -> f32 {
    (current + (1.0 - current) * PROGRESS_STEP).min(MAX_PROGRESS)
}

#[async_trait]
impl Checker for CommandChecker {
    async fn run(
        &self,
        cancel: CancellationToken,
        target: &str,
        options: &str,
        handle: &mut CheckHandle<'_>,
    ) -> eyre::Result<()> {
        let harness = ProcessHarness::new(&self.program, self.expand_args(target, options));
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        // the processor owns the sender, so the channel closes once the process is done
        let run = async move {
            let mut processor = move |chunk: &[u8]| tx.send(String::from_utf8_lossy(chunk).into_owned()).is_ok();
            harness.run(&cancel, &mut processor).await
        };
        let collect = async {
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                let progress = next_progress(handle.progress());
                handle.set_progress(progress).await?;
                lines.push(line);
            }
            Ok::<_, PushError>(lines)
        };
        let (result, lines) = tokio::join!(run, collect);

        let result = result.wrap_err_with(|| format!("Failed to run {}", self.program))?;
        let lines = lines?;
        log::debug!("[command_check] output: program={} lines={} status={}", self.program, lines.len(), result.status);
        handle.set_notes(lines.join("\n"));

        if result.canceled() {
            return Err(CheckError::Canceled.into());
        }
        if !result.status.success() {
            eyre::bail!("{} exited with {}", self.program, result.status);
        }
        Ok(())
    }
}
