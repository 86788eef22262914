//! Delivery of check state snapshots to the collector.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::PushConfig;
use crate::error::PushError;
use crate::state::CheckState;

const DEFAULT_SCHEME: &str = "http";
const CHECK_RESOURCE: &str = "check";

/// Where state changes of a check go.
#[async_trait]
pub trait StatePusher: Send + Sync {
    /// Queues a snapshot for delivery, preserving submission order.
    async fn update_state(&self, state: CheckState) -> Result<(), PushError>;

    /// Stops accepting snapshots and waits until the queued ones are handled.
    async fn shutdown(&mut self) -> Result<(), PushError>;
}

/// A message waiting in the queue.
#[derive(Debug, Clone)]
pub struct PushMessage {
    pub check_id: String,
    pub state: CheckState,
}

/// Builds `<base>/check/<check-id>`. A bare `host:port` gets an http scheme.
pub fn check_url(agent_addr: &str, check_id: &str) -> Result<Url, PushError> {
    let base = if agent_addr.contains("://") {
        agent_addr.to_string()
    } else {
        format!("{}://{}", DEFAULT_SCHEME, agent_addr)
    };
    let mut url = Url::parse(&base).map_err(|e| PushError::InvalidAddress(format!("{}: {}", agent_addr, e)))?;
    url.path_segments_mut()
        .map_err(|_| PushError::InvalidAddress(agent_addr.to_string()))?
        .pop_if_empty()
        .push(CHECK_RESOURCE)
        .push(check_id);
    Ok(url)
}

/// Pushes snapshots over HTTP through a bounded queue drained by a single
/// sender task.
///
/// When the queue is full the producer waits for room instead of dropping
/// the snapshot. A failed delivery is fatal: the sender stops, the queue
/// closes and `fatal` is cancelled so the running check winds down.
pub struct PushTransport {
    check_id: String,
    queue: Option<mpsc::Sender<PushMessage>>,
    sender: Option<JoinHandle<Result<(), PushError>>>,
}

impl PushTransport {
    pub fn new(config: &PushConfig, check_id: &str, fatal: CancellationToken) -> Result<Self, PushError> {
        let url = check_url(&config.agent_addr, check_id)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PushError::Delivery(e.to_string()))?;
        let buffer_len = config.buffer_len.max(1);
        log::debug!("[push] new: url={} buffer_len={} timeout={}s", url, buffer_len, config.timeout_secs);

        let (queue, rx) = mpsc::channel(buffer_len);
        let sender = tokio::spawn(drain(rx, client, url, fatal));
        Ok(Self {
            check_id: check_id.to_string(),
            queue: Some(queue),
            sender: Some(sender),
        })
    }
}

#[async_trait]
impl StatePusher for PushTransport {
    async fn update_state(&self, state: CheckState) -> Result<(), PushError> {
        let queue = self.queue.as_ref().ok_or(PushError::Closed)?;
        let msg = PushMessage { check_id: self.check_id.clone(), state };
        log::debug!("[push] queueing: check_id={} status={:?} progress={}",
            msg.check_id, msg.state.status, msg.state.progress);

        match queue.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                log::warn!("[push] backpressure: queue_len={} - push queue is full, waiting for the sender to catch up",
                    queue.max_capacity());
                queue.send(msg).await.map_err(|_| PushError::Closed)
            }
            Err(TrySendError::Closed(_)) => {
                log::error!("[push] queue_closed: check_id={}", self.check_id);
                Err(PushError::Closed)
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), PushError> {
        log::debug!("[push] shutdown: check_id={}", self.check_id);
        // dropping the last sender lets the drain loop finish the backlog and exit
        self.queue.take();
        let result = match self.sender.take() {
            Some(handle) => handle.await.map_err(|e| PushError::Delivery(e.to_string()))?,
            None => Ok(()),
        };
        log::debug!("[push] shutdown_complete: check_id={} ok={}", self.check_id, result.is_ok());
        result
    }
}

async fn drain(
    mut rx: mpsc::Receiver<PushMessage>,
    client: Client,
    url: Url,
    fatal: CancellationToken,
) -> Result<(), PushError> {
    log::debug!("[push] sender_running: url={}", url);
    let mut sent = 0u64;
    while let Some(msg) = rx.recv().await {
        if let Err(e) = send(&client, &url, &msg).await {
            log::error!("[push] delivery_failed: url={} check_id={} sent={} error={}", url, msg.check_id, sent, e);
            // no retries; a check that can not report itself has nothing left to do
            rx.close();
            fatal.cancel();
            return Err(e);
        }
        sent += 1;
    }
    log::debug!("[push] sender_finished: url={} sent={}", url, sent);
    Ok(())
}

async fn send(client: &Client, url: &Url, msg: &PushMessage) -> Result<(), PushError> {
    let response = client
        .patch(url.clone())
        .json(&msg.state)
        .send()
        .await
        .map_err(|e| PushError::Delivery(e.to_string()))?;

    if response.status() != StatusCode::OK {
        return Err(PushError::Delivery(format!("received status {}, expected 200", response.status())));
    }
    log::trace!("[push] sent: url={} status={:?} progress={}", url, msg.state.status, msg.state.progress);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::TestCollector;
    use crate::state::Status;

    fn snapshot(progress: f32) -> CheckState {
        CheckState {
            status: Status::Running,
            progress,
            ..Default::default()
        }
    }

    #[test]
    fn test_check_url() {
        assert_eq!(check_url("127.0.0.1:8080", "abc").unwrap().as_str(), "http://127.0.0.1:8080/check/abc");
        assert_eq!(check_url("https://collector.example.com/api/", "abc").unwrap().as_str(),
            "https://collector.example.com/api/check/abc");
        assert!(check_url("", "abc").is_err());
    }

    #[tokio::test]
    async fn test_delivers_in_order_beyond_capacity() {
        let collector = TestCollector::start("check-1").await.unwrap();
        let config = PushConfig {
            agent_addr: collector.addr(),
            buffer_len: 3,
            ..Default::default()
        };
        let mut transport = PushTransport::new(&config, "check-1", CancellationToken::new()).unwrap();

        let total = 25;
        for i in 0..total {
            transport.update_state(snapshot(i as f32 / 100.0)).await.unwrap();
        }
        transport.shutdown().await.unwrap();

        let received = collector.stop().await;
        let progress: Vec<f32> = received.iter().map(|s| s.progress).collect();
        let expected: Vec<f32> = (0..total).map(|i| i as f32 / 100.0).collect();
        assert_eq!(progress, expected);
    }

    #[tokio::test]
    async fn test_update_after_shutdown_fails() {
        let collector = TestCollector::start("check-1").await.unwrap();
        let config = PushConfig { agent_addr: collector.addr(), ..Default::default() };
        let mut transport = PushTransport::new(&config, "check-1", CancellationToken::new()).unwrap();
        transport.shutdown().await.unwrap();

        assert!(matches!(transport.update_state(snapshot(0.5)).await, Err(PushError::Closed)));
        collector.stop().await;
    }

    #[tokio::test]
    async fn test_delivery_failure_is_fatal() {
        // the collector only accepts another check id
        let collector = TestCollector::start("other-check").await.unwrap();
        let config = PushConfig { agent_addr: collector.addr(), ..Default::default() };
        let fatal = CancellationToken::new();
        let mut transport = PushTransport::new(&config, "check-1", fatal.clone()).unwrap();

        transport.update_state(snapshot(0.0)).await.unwrap();
        fatal.cancelled().await;
        assert!(transport.update_state(snapshot(0.5)).await.is_err());
        assert!(matches!(transport.shutdown().await, Err(PushError::Delivery(_))));
        assert!(collector.stop().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_fatal() {
        let config = PushConfig { agent_addr: "127.0.0.1:1".to_string(), ..Default::default() };
        let fatal = CancellationToken::new();
        let mut transport = PushTransport::new(&config, "check-1", fatal.clone()).unwrap();

        transport.update_state(snapshot(0.0)).await.unwrap();
        assert!(matches!(transport.shutdown().await, Err(PushError::Delivery(_))));
        assert!(fatal.is_cancelled());
    }
}
