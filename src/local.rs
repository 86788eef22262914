//! Running a check from the command line, without a collector.

use async_trait::async_trait;
use std::sync::Arc;

use crate::check::{Check, Checker};
use crate::config::{CommMode, Config};
use crate::error::{CheckError, PushError};
use crate::push::StatePusher;
use crate::report::ResultData;
use crate::state::{CheckState, Status};

const TABLE_HEADER: [&str; 3] = ["Name", "Severity", "Recommendations"];
const COLUMN_PADDING: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json { OutputFormat::Json } else { OutputFormat::Text }
    }

    /// Line shown when progress changes. JSON output stays silent until the end.
    pub fn progress(&self, progress: f32) -> Option<String> {
        match self {
            OutputFormat::Text => Some(format!("progress {:.2}", progress)),
            OutputFormat::Json => None,
        }
    }

    pub fn render(&self, result: &ResultData) -> eyre::Result<String> {
        match self {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(result)?),
            OutputFormat::Text => Ok(render_table(result)),
        }
    }
}

fn render_table(result: &ResultData) -> String {
    if result.vulnerabilities.is_empty() {
        return "No vulnerabilities found".to_string();
    }

    let rows: Vec<[String; 3]> = result
        .ranked()
        .into_iter()
        .map(|vuln| {
            [
                vuln.summary.trim().to_string(),
                vuln.severity().as_str().to_string(),
                vuln.recommendations.iter().map(|r| r.trim()).collect::<Vec<_>>().join("; "),
            ]
        })
        .collect();

    let mut widths = TABLE_HEADER.map(|h| h.len());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |cells: [&str; 3]| {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width + COLUMN_PADDING))
            .collect::<String>()
            .trim_end()
            .to_string()
    };

    let mut out = vec![line(TABLE_HEADER)];
    out.extend(rows.iter().map(|row| line([row[0].as_str(), row[1].as_str(), row[2].as_str()])));
    out.join("\n")
}

/// Prints progress instead of sending it anywhere.
struct ConsolePusher {
    format: OutputFormat,
}

#[async_trait]
impl StatePusher for ConsolePusher {
    async fn update_state(&self, state: CheckState) -> Result<(), PushError> {
        log::debug!("[local] state: status={:?} progress={}", state.status, state.progress);
        if state.status == Status::Running {
            if let Some(line) = self.format.progress(state.progress) {
                eprintln!("{}", line);
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), PushError> {
        Ok(())
    }
}

/// Runs the check against `config.check.target` and prints its result to
/// standard output. A failed or aborted check is returned as an error.
pub async fn run_local(
    name: &str,
    checker: Arc<dyn Checker>,
    mut config: Config,
    format: OutputFormat,
) -> eyre::Result<CheckState> {
    if config.allow_private_ips.is_none() {
        config.allow_private_ips = Some(true);
    }
    config.comm_mode = CommMode::Push;
    log::info!("[local] running: name={} target={} format={:?}", name, config.check.target, format);

    let state = Check::new(name, checker, config)
        .with_pusher(Box::new(ConsolePusher { format }))
        .run_and_serve()
        .await?;

    match state.status {
        Status::Finished => {
            println!("{}", format.render(&state.report.result)?);
            Ok(state)
        }
        Status::Aborted => Err(CheckError::Canceled.into()),
        _ => Err(eyre::eyre!("check failed: {}", state.report.result.error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Vulnerability;
    use crate::state::CheckHandle;
    use tokio_util::sync::CancellationToken;

    struct FindingChecker;

    #[async_trait]
    impl Checker for FindingChecker {
        async fn run(
            &self,
            _cancel: CancellationToken,
            target: &str,
            _options: &str,
            handle: &mut CheckHandle<'_>,
        ) -> eyre::Result<()> {
            if target.is_empty() {
                eyre::bail!("no target given");
            }
            handle.set_progress(0.5).await?;
            handle.add_vulnerabilities([Vulnerability::new("Exposed admin panel", 7.5)]);
            Ok(())
        }
    }

    fn result_with(vulns: Vec<Vulnerability>) -> ResultData {
        let mut result = ResultData::default();
        result.add_vulnerabilities(vulns);
        result
    }

    #[test]
    fn test_text_table_sorted_by_score() {
        let mut low = Vulnerability::new("Missing header", 2.0);
        low.recommendations = vec!["Add the header".to_string(), " Redeploy ".to_string()];
        let result = result_with(vec![low, Vulnerability::new("Weak TLS", 8.1)]);

        let table = OutputFormat::Text.render(&result).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Name"));
        assert!(lines[1].starts_with("Weak TLS"));
        assert!(lines[1].contains("High"));
        assert!(lines[2].starts_with("Missing header"));
        assert!(lines[2].ends_with("Add the header; Redeploy"));
        // columns line up
        assert_eq!(lines[0].find("Severity"), lines[1].find("High"));
    }

    #[test]
    fn test_text_without_findings() {
        assert_eq!(OutputFormat::Text.render(&ResultData::default()).unwrap(), "No vulnerabilities found");
    }

    #[test]
    fn test_json_render_and_progress() {
        let result = result_with(vec![Vulnerability::new("Weak TLS", 8.1)]);
        let rendered = OutputFormat::Json.render(&result).unwrap();
        let parsed: ResultData = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, result);

        assert_eq!(OutputFormat::Json.progress(0.5), None);
        assert_eq!(OutputFormat::Text.progress(0.5).as_deref(), Some("progress 0.50"));
        assert_eq!(OutputFormat::from_json_flag(true), OutputFormat::Json);
    }

    #[tokio::test]
    async fn test_run_local_allows_private_targets() {
        let mut config = Config::default();
        config.check.target = "192.168.1.10".to_string();
        let state = run_local("local", Arc::new(FindingChecker), config, OutputFormat::Json).await.unwrap();

        assert_eq!(state.status, Status::Finished);
        assert_eq!(state.report.result.vulnerabilities.len(), 1);
    }

    #[tokio::test]
    async fn test_run_local_failure_is_an_error() {
        let err = run_local("local", Arc::new(FindingChecker), Config::default(), OutputFormat::Text)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no target given"));
    }
}
