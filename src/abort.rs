use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CheckError;

/// Delivers a termination notification to an [`AbortCoordinator`], the same
/// way SIGTERM or SIGINT would.
#[derive(Debug, Clone)]
pub struct AbortNotifier {
    tx: mpsc::UnboundedSender<String>,
}

impl AbortNotifier {
    /// Returns false when the coordinator is gone.
    pub fn notify(&self, source: impl Into<String>) -> bool {
        self.tx.send(source.into()).is_ok()
    }
}

/// Turns the first termination notification into cancellation of the check.
pub struct AbortCoordinator {
    cancel: CancellationToken,
    stop: CancellationToken,
    aborted: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<String>,
    rx: Option<mpsc::UnboundedReceiver<String>>,
    listener: Option<JoinHandle<()>>,
}

impl AbortCoordinator {
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            cancel,
            stop: CancellationToken::new(),
            aborted: Arc::new(AtomicBool::new(false)),
            tx,
            rx: Some(rx),
            listener: None,
        }
    }

    pub fn notifier(&self) -> AbortNotifier {
        AbortNotifier { tx: self.tx.clone() }
    }

    /// Whether a termination notification has been acted upon.
    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Starts the listener. Calling it again is a no-op.
    pub fn run(&mut self) -> Result<(), CheckError> {
        let Some(rx) = self.rx.take() else {
            return Ok(());
        };
        let sigterm = signal(SignalKind::terminate()).map_err(CheckError::Signal)?;
        let sigint = signal(SignalKind::interrupt()).map_err(CheckError::Signal)?;

        log::debug!("[abort] listening");
        self.listener = Some(tokio::spawn(listen(
            rx,
            sigterm,
            sigint,
            self.cancel.clone(),
            self.stop.clone(),
            self.aborted.clone(),
        )));
        Ok(())
    }

    /// Stops the listener and waits for it to exit.
    pub async fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.await {
                log::warn!("[abort] listener_failed: error={}", e);
            }
        }
        log::debug!("[abort] shutdown: aborted={}", self.aborted());
    }
}

async fn listen(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut sigterm: tokio::signal::unix::Signal,
    mut sigint: tokio::signal::unix::Signal,
    cancel: CancellationToken,
    stop: CancellationToken,
    aborted: Arc<AtomicBool>,
) {
    loop {
        let source = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            Some(source) = rx.recv() => source,
            Some(()) = sigterm.recv() => "SIGTERM".to_string(),
            Some(()) = sigint.recv() => "SIGINT".to_string(),
        };

        if aborted.swap(true, Ordering::SeqCst) {
            log::warn!("[abort] notification_ignored: source={} - abort already requested", source);
            continue;
        }
        log::warn!("[abort] requested: source={}", source);
        cancel.cancel();
    }
}
