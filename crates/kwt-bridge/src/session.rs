//! The terminal session bridge: two pump loops coupled through shared
//! session state, supervised so that the first side to finish tears the
//! whole session down exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use kwt_exec::ExecStream;

use crate::protocol::{classify, normalize_output, stdin_writes, ClientInput};

/// Bound on one remote pump wait.
const PUMP_WAIT: Duration = Duration::from_millis(50);
/// Cadence of empty stdin writes keeping the exec channel from idling out.
const REMOTE_HEARTBEAT: Duration = Duration::from_secs(15);
/// How long the client pump waits for a frame before rechecking budgets.
const RECV_CHECK: Duration = Duration::from_secs(30);

/// Which session budget expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Idle,
    Total,
}

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    TimedOut(TimeoutKind),
    ClientClosed,
    RemoteClosed,
    Failed,
}

/// Liveness and budget state shared by both pumps.
///
/// Only client-originated, non-heartbeat input refreshes the idle clock;
/// remote output and heartbeats in either direction never count as
/// activity.
pub struct SessionStatus {
    active: AtomicBool,
    started_at: Instant,
    last_activity: std::sync::Mutex<Instant>,
    idle_timeout: Duration,
    total_timeout: Duration,
}

impl SessionStatus {
    pub fn new(idle_timeout: Duration, total_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            active: AtomicBool::new(true),
            started_at: now,
            last_activity: std::sync::Mutex::new(now),
            idle_timeout,
            total_timeout,
        }
    }

    /// Record client activity.
    pub fn touch(&self) {
        let mut last = self.last_activity.lock().unwrap_or_else(|e| {
            warn!("session activity lock was poisoned, recovering");
            e.into_inner()
        });
        *last = Instant::now();
    }

    /// Whether a budget has expired. The total budget wins when both have.
    pub fn check(&self) -> Option<TimeoutKind> {
        if self.started_at.elapsed() >= self.total_timeout {
            return Some(TimeoutKind::Total);
        }
        let last = self.last_activity.lock().unwrap_or_else(|e| {
            warn!("session activity lock was poisoned, recovering");
            e.into_inner()
        });
        if last.elapsed() >= self.idle_timeout {
            return Some(TimeoutKind::Idle);
        }
        None
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// The client connection is gone; further sends are pointless.
#[derive(Debug, Error)]
#[error("client connection gone")]
pub struct ClientGone;

/// Receiving half of the client connection. `None` means the client
/// disconnected (or sent a close frame).
#[async_trait]
pub trait ClientRx: Send {
    async fn recv(&mut self) -> Option<String>;
}

/// Sending half of the client connection.
#[async_trait]
pub trait ClientTx: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), ClientGone>;
    /// Idempotent close of the client side.
    async fn close(&mut self);
}

/// Drive one terminal session to completion.
///
/// Spawns the remote-to-client and client-to-remote pumps, waits for the
/// first to finish, aborts the survivor, then closes both ends. Cleanup runs
/// exactly once regardless of which side ends the session.
pub async fn run_session<R, T>(
    rx: R,
    tx: T,
    stream: Box<dyn ExecStream>,
    idle_timeout: Duration,
    total_timeout: Duration,
) -> SessionEnd
where
    R: ClientRx + 'static,
    T: ClientTx + 'static,
{
    let status = Arc::new(SessionStatus::new(idle_timeout, total_timeout));
    let stream = Arc::new(Mutex::new(stream));
    let tx = Arc::new(Mutex::new(tx));

    let mut remote = tokio::spawn(pump_remote_to_client(
        Arc::clone(&stream),
        Arc::clone(&tx),
        Arc::clone(&status),
    ));
    let mut client = tokio::spawn(pump_client_to_remote(
        rx,
        Arc::clone(&stream),
        Arc::clone(&status),
    ));

    let end = tokio::select! {
        r = &mut remote => {
            client.abort();
            let _ = client.await;
            r.unwrap_or(SessionEnd::Failed)
        }
        c = &mut client => {
            remote.abort();
            let _ = remote.await;
            c.unwrap_or(SessionEnd::Failed)
        }
    };

    status.deactivate();
    stream.lock().await.close();
    tx.lock().await.close().await;

    info!(?end, "terminal session ended");
    end
}

/// Remote-to-client pump. Drains exec output, normalizes line endings and
/// forwards to the client; also keeps the exec channel warm with periodic
/// empty stdin writes. Remote output never refreshes the idle clock.
async fn pump_remote_to_client<T: ClientTx>(
    stream: Arc<Mutex<Box<dyn ExecStream>>>,
    tx: Arc<Mutex<T>>,
    status: Arc<SessionStatus>,
) -> SessionEnd {
    let mut last_heartbeat = Instant::now();
    loop {
        if let Some(kind) = status.check() {
            debug!(?kind, "remote pump observed expired budget");
            return SessionEnd::TimedOut(kind);
        }

        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let open = {
            let mut s = stream.lock().await;
            s.pump(PUMP_WAIT).await;
            if s.is_open() && last_heartbeat.elapsed() >= REMOTE_HEARTBEAT {
                // Keepalive only; failure here will surface as a closed
                // stream on the next iteration.
                let _ = s.write_stdin(b"");
                last_heartbeat = Instant::now();
            }
            while let Some(chunk) = s.read_stdout() {
                chunks.push(chunk);
            }
            while let Some(chunk) = s.read_stderr() {
                chunks.push(chunk);
            }
            s.is_open()
        };

        for chunk in &chunks {
            let text = String::from_utf8_lossy(chunk);
            let normalized = normalize_output(&text);
            if tx.lock().await.send_text(&normalized).await.is_err() {
                return SessionEnd::ClientClosed;
            }
        }

        if !open && chunks.is_empty() {
            // Fully drained and the remote side is gone.
            return SessionEnd::RemoteClosed;
        }
    }
}

/// Client-to-remote pump. Classifies each client frame and applies it:
/// heartbeats are discarded, resizes go to the resize sub-channel, data is
/// written to stdin under the bulk-paste write policy.
async fn pump_client_to_remote<R: ClientRx>(
    mut rx: R,
    stream: Arc<Mutex<Box<dyn ExecStream>>>,
    status: Arc<SessionStatus>,
) -> SessionEnd {
    loop {
        if let Some(kind) = status.check() {
            debug!(?kind, "client pump observed expired budget");
            return SessionEnd::TimedOut(kind);
        }

        let text = match tokio::time::timeout(RECV_CHECK, rx.recv()).await {
            Err(_) => continue, // quiet client, recheck budgets
            Ok(None) => return SessionEnd::ClientClosed,
            Ok(Some(text)) => text,
        };

        match classify(&text) {
            ClientInput::Heartbeat => continue,
            ClientInput::Resize { cols, rows } => {
                status.touch();
                if stream.lock().await.write_resize(cols, rows).is_err() {
                    return SessionEnd::RemoteClosed;
                }
            }
            ClientInput::Data(data) => {
                status.touch();
                let mut s = stream.lock().await;
                for write in stdin_writes(&data) {
                    if s.write_stdin(write.as_bytes()).is_err() {
                        return SessionEnd::RemoteClosed;
                    }
                }
            }
        }
    }
}
