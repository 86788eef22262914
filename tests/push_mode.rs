use async_trait::async_trait;
use check_harness::{Check, CheckError, CheckHandle, Checker, Config, Status, TestCollector};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CHECK_ID: &str = "e2e-check";

struct ProgressChecker;

#[async_trait]
impl Checker for ProgressChecker {
    async fn run(
        &self,
        _cancel: CancellationToken,
        _target: &str,
        _options: &str,
        handle: &mut CheckHandle<'_>,
    ) -> eyre::Result<()> {
        handle.set_progress(0.1).await?;
        Ok(())
    }
}

#[derive(Default)]
struct WaitForAbort {
    cleanups: AtomicUsize,
}

#[async_trait]
impl Checker for WaitForAbort {
    async fn run(
        &self,
        cancel: CancellationToken,
        _target: &str,
        _options: &str,
        _handle: &mut CheckHandle<'_>,
    ) -> eyre::Result<()> {
        cancel.cancelled().await;
        Err(CheckError::Canceled.into())
    }

    async fn clean_up(&self, _cancel: CancellationToken, _target: &str, _options: &str) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

fn config(collector: &TestCollector) -> Config {
    let mut config = Config::default();
    config.check.check_id = CHECK_ID.to_string();
    config.check.target = "www.example.com".to_string();
    config.push.agent_addr = collector.addr();
    config.allow_private_ips = Some(true);
    config
}

#[tokio::test]
async fn test_happy_path() {
    let collector = TestCollector::start(CHECK_ID).await.unwrap();
    let state = Check::new("happy-path", Arc::new(ProgressChecker), config(&collector))
        .run_and_serve()
        .await
        .unwrap();
    assert_eq!(state.status, Status::Finished);

    let received: Vec<(Status, f32)> = collector.stop().await.iter().map(|s| (s.status, s.progress)).collect();
    assert_eq!(received, vec![
        (Status::Running, 0.0),
        (Status::Running, 0.1),
        (Status::Finished, 1.0),
    ]);
}

#[tokio::test]
async fn test_abort() {
    let collector = TestCollector::start(CHECK_ID).await.unwrap();
    let checker = Arc::new(WaitForAbort::default());
    let check = Check::new("abort", checker.clone(), config(&collector));

    let notifier = check.abort_notifier();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        notifier.notify("test");
    });
    let state = tokio::time::timeout(Duration::from_secs(10), check.run_and_serve())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Status::Aborted);

    let received = collector.stop().await;
    let statuses: Vec<(Status, f32)> = received.iter().map(|s| (s.status, s.progress)).collect();
    assert_eq!(statuses, vec![(Status::Running, 0.0), (Status::Aborted, 1.0)]);
    assert_eq!(received[1].report.status, "ABORTED");
    assert!(received[1].report.end_time.is_some());
    assert_eq!(checker.cleanups.load(Ordering::SeqCst), 1);
}
