//! A minimal collector that accepts state pushes locally, for tests and
//! for running a check without a real orchestrator.

use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::state::CheckState;

const MAX_HEADER_LINES: usize = 100;
const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Accepts `PATCH .../<check-id>` requests whose body is a JSON
/// [`CheckState`] and forwards every decoded state onto a channel.
pub struct TestCollector {
    addr: SocketAddr,
    msgs: mpsc::UnboundedReceiver<CheckState>,
    stop: CancellationToken,
    server: JoinHandle<()>,
}

impl TestCollector {
    /// Listens on an ephemeral localhost port.
    pub async fn start(check_id: &str) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, msgs) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let server = tokio::spawn(serve(listener, check_id.to_string(), tx, stop.clone()));
        log::warn!("[collector] listening: addr={} check_id={}", addr, check_id);
        Ok(Self { addr, msgs, stop, server })
    }

    /// `host:port` to use as the collector address.
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Next state received, in arrival order.
    pub async fn recv(&mut self) -> Option<CheckState> {
        self.msgs.recv().await
    }

    /// Stops the server once in-flight requests are answered and returns the
    /// states received and not yet consumed.
    pub async fn stop(mut self) -> Vec<CheckState> {
        self.stop.cancel();
        if let Err(e) = (&mut self.server).await {
            log::warn!("[collector] server_task_failed: error={}", e);
        }
        let mut received = Vec::new();
        while let Ok(state) = self.msgs.try_recv() {
            received.push(state);
        }
        log::debug!("[collector] stopped: addr={} received={}", self.addr, received.len());
        received
    }
}

async fn serve(
    listener: TcpListener,
    check_id: String,
    tx: mpsc::UnboundedSender<CheckState>,
    stop: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::trace!("[collector] accepted: peer={}", peer);
                    let check_id = check_id.clone();
                    let tx = tx.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle(stream, &check_id, &tx).await {
                            log::warn!("[collector] connection_failed: peer={} error={}", peer, e);
                        }
                    });
                }
                Err(e) => log::warn!("[collector] accept_failed: error={}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    while connections.join_next().await.is_some() {}
}

async fn handle(stream: TcpStream, check_id: &str, tx: &mpsc::UnboundedSender<CheckState>) -> io::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    for _ in 0..MAX_HEADER_LINES {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let status = if content_length > MAX_BODY_LEN {
        "413 Payload Too Large"
    } else {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        let last_segment = path.split('?').next().unwrap_or_default().rsplit('/').next().unwrap_or_default();

        if last_segment != check_id {
            log::warn!("[collector] unknown_check: method={} path={}", method, path);
            "403 Forbidden"
        } else {
            match serde_json::from_slice::<CheckState>(&body) {
                Ok(state) => {
                    log::debug!("[collector] received: method={} path={} status={:?} progress={}",
                        method, path, state.status, state.progress);
                    // the receiver only goes away when the collector is dropped
                    let _ = tx.send(state);
                    "200 OK"
                }
                Err(e) => {
                    log::warn!("[collector] invalid_body: path={} error={}", path, e);
                    "406 Not Acceptable"
                }
            }
        }
    };

    let mut stream = reader.into_inner();
    let response = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status);
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
