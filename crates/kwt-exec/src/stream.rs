use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ExecError;

// ---------------------------------------------------------------------------
// Sub-channel numbering (control-plane exec protocol)
// ---------------------------------------------------------------------------

pub const STDIN_CHANNEL: u8 = 0;
pub const STDOUT_CHANNEL: u8 = 1;
pub const STDERR_CHANNEL: u8 = 2;
pub const STATUS_CHANNEL: u8 = 3;
pub const RESIZE_CHANNEL: u8 = 4;

// ---------------------------------------------------------------------------
// ExecStream
// ---------------------------------------------------------------------------

/// A command running inside a container, exposed as independent stdin /
/// stdout / stderr / resize sub-channels.
///
/// One instance per terminal session or per short-lived command. The owning
/// bridge closes it exactly once; `close()` is idempotent so concurrent
/// cleanup paths cannot double-fault.
#[async_trait]
pub trait ExecStream: Send {
    /// Whether the underlying channel is still connected.
    fn is_open(&self) -> bool;

    /// Ingest pending frames, waiting at most `timeout` for the first one.
    /// Never blocks longer than the bound; cancellation-safe.
    async fn pump(&mut self, timeout: Duration);

    fn peek_stdout(&self) -> bool;
    fn read_stdout(&mut self) -> Option<Vec<u8>>;
    fn peek_stderr(&self) -> bool;
    fn read_stderr(&mut self) -> Option<Vec<u8>>;

    fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError>;

    /// Control write on the resize sub-channel.
    fn write_resize(&mut self, cols: u16, rows: u16) -> Result<(), ExecError>;

    /// Half-close: signal end-of-input to the remote command while still
    /// draining its output.
    fn close_stdin(&mut self);

    /// Idempotent full close.
    fn close(&mut self);

    /// Exit code reported on the status sub-channel, if seen yet.
    fn exit_code(&self) -> Option<i32>;
}

impl std::fmt::Debug for dyn ExecStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStream")
            .field("is_open", &self.is_open())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Frame transport
// ---------------------------------------------------------------------------

/// Raw frame channel pair handed over by the cluster client. Each frame is
/// one channel byte followed by the payload.
pub struct FrameTransport {
    pub outbound: flume::Sender<Vec<u8>>,
    pub inbound: flume::Receiver<Vec<u8>>,
}

impl FrameTransport {
    /// Build a connected transport pair: (stream side, peer side).
    /// The peer side is what a test double or client library drives.
    pub fn pair(capacity: usize) -> (FrameTransport, FrameTransport) {
        let (a_tx, a_rx) = flume::bounded::<Vec<u8>>(capacity);
        let (b_tx, b_rx) = flume::bounded::<Vec<u8>>(capacity);
        (
            FrameTransport {
                outbound: a_tx,
                inbound: b_rx,
            },
            FrameTransport {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Status document (channel 3)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StatusDoc {
    status: Option<String>,
    details: Option<StatusDetails>,
}

#[derive(Debug, Deserialize)]
struct StatusDetails {
    causes: Option<Vec<StatusCause>>,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    reason: Option<String>,
    message: Option<String>,
}

fn parse_exit_code(payload: &[u8]) -> Result<i32, ExecError> {
    let doc: StatusDoc = serde_json::from_slice(payload)
        .map_err(|e| ExecError::Status(format!("status channel: {e}")))?;
    match doc.status.as_deref() {
        Some("Success") => Ok(0),
        Some("Failure") => {
            if let Some(causes) = doc.details.and_then(|d| d.causes) {
                for cause in causes {
                    if cause.reason.as_deref() == Some("ExitCode") {
                        if let Some(code) = cause.message.and_then(|m| m.trim().parse().ok()) {
                            return Ok(code);
                        }
                    }
                }
            }
            // A failure without an explicit ExitCode cause (e.g. the command
            // was killed) still has to read as non-zero.
            Ok(1)
        }
        other => Err(ExecError::Status(format!(
            "unexpected status value: {other:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// MuxExecStream
// ---------------------------------------------------------------------------

/// [`ExecStream`] over a channel-byte multiplexed frame transport.
///
/// Inbound frames are demuxed into per-channel queues; chunk boundaries are
/// preserved and nothing is reordered. The status frame records the exit
/// code; transport disconnect marks the stream closed.
pub struct MuxExecStream {
    outbound: Option<flume::Sender<Vec<u8>>>,
    inbound: flume::Receiver<Vec<u8>>,
    stdout: VecDeque<Vec<u8>>,
    stderr: VecDeque<Vec<u8>>,
    exit_code: Option<i32>,
    open: bool,
}

impl MuxExecStream {
    pub fn new(transport: FrameTransport) -> Self {
        Self {
            outbound: Some(transport.outbound),
            inbound: transport.inbound,
            stdout: VecDeque::new(),
            stderr: VecDeque::new(),
            exit_code: None,
            open: true,
        }
    }

    fn ingest(&mut self, frame: Vec<u8>) {
        let Some((&channel, payload)) = frame.split_first() else {
            return;
        };
        match channel {
            STDOUT_CHANNEL => {
                if !payload.is_empty() {
                    self.stdout.push_back(payload.to_vec());
                }
            }
            STDERR_CHANNEL => {
                if !payload.is_empty() {
                    self.stderr.push_back(payload.to_vec());
                }
            }
            STATUS_CHANNEL => match parse_exit_code(payload) {
                Ok(code) => {
                    debug!(code, "exec status received");
                    self.exit_code = Some(code);
                }
                Err(e) => {
                    warn!(error = %e, "ignoring malformed status frame");
                }
            },
            other => {
                debug!(channel = other, "ignoring frame on unexpected channel");
            }
        }
    }

    /// Drain everything currently buffered without waiting.
    fn drain_ready(&mut self) -> usize {
        let mut n = 0;
        loop {
            match self.inbound.try_recv() {
                Ok(frame) => {
                    self.ingest(frame);
                    n += 1;
                }
                Err(flume::TryRecvError::Empty) => break,
                Err(flume::TryRecvError::Disconnected) => {
                    self.open = false;
                    break;
                }
            }
        }
        n
    }

    fn send_frame(&mut self, channel: u8, payload: &[u8]) -> Result<(), ExecError> {
        let Some(tx) = self.outbound.as_ref() else {
            return Err(ExecError::StreamClosed);
        };
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(channel);
        frame.extend_from_slice(payload);
        tx.send(frame).map_err(|_| {
            self.open = false;
            ExecError::StreamClosed
        })
    }
}

#[async_trait]
impl ExecStream for MuxExecStream {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn pump(&mut self, timeout: Duration) {
        if !self.open {
            return;
        }
        if self.drain_ready() > 0 || timeout.is_zero() {
            return;
        }
        // Nothing buffered: wait for at most one frame within the bound,
        // then sweep up whatever arrived with it.
        let rx = self.inbound.clone();
        match tokio::time::timeout(timeout, rx.recv_async()).await {
            Ok(Ok(frame)) => {
                self.ingest(frame);
                self.drain_ready();
            }
            Ok(Err(_)) => self.open = false,
            Err(_) => {} // bound elapsed, nothing arrived
        }
    }

    fn peek_stdout(&self) -> bool {
        !self.stdout.is_empty()
    }

    fn read_stdout(&mut self) -> Option<Vec<u8>> {
        self.stdout.pop_front()
    }

    fn peek_stderr(&self) -> bool {
        !self.stderr.is_empty()
    }

    fn read_stderr(&mut self) -> Option<Vec<u8>> {
        self.stderr.pop_front()
    }

    fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError> {
        if !self.open {
            return Err(ExecError::StreamClosed);
        }
        self.send_frame(STDIN_CHANNEL, data)
    }

    fn write_resize(&mut self, cols: u16, rows: u16) -> Result<(), ExecError> {
        if !self.open {
            return Err(ExecError::StreamClosed);
        }
        let payload = serde_json::json!({ "Width": cols, "Height": rows });
        self.send_frame(RESIZE_CHANNEL, payload.to_string().as_bytes())
    }

    fn close_stdin(&mut self) {
        self.outbound.take();
    }

    fn close(&mut self) {
        self.outbound.take();
        self.open = false;
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(channel: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![channel];
        f.extend_from_slice(payload);
        f
    }

    #[tokio::test]
    async fn demuxes_stdout_and_stderr_in_order() {
        let (local, peer) = FrameTransport::pair(16);
        let mut stream = MuxExecStream::new(local);

        peer.outbound.send(frame(STDOUT_CHANNEL, b"one")).unwrap();
        peer.outbound.send(frame(STDERR_CHANNEL, b"oops")).unwrap();
        peer.outbound.send(frame(STDOUT_CHANNEL, b"two")).unwrap();

        stream.pump(Duration::from_millis(10)).await;

        assert!(stream.peek_stdout());
        assert_eq!(stream.read_stdout().unwrap(), b"one");
        assert_eq!(stream.read_stdout().unwrap(), b"two");
        assert!(stream.read_stdout().is_none());
        assert_eq!(stream.read_stderr().unwrap(), b"oops");
    }

    #[tokio::test]
    async fn stdin_frames_carry_channel_byte() {
        let (local, peer) = FrameTransport::pair(16);
        let mut stream = MuxExecStream::new(local);

        stream.write_stdin(b"ls\n").unwrap();
        let sent = peer.inbound.recv().unwrap();
        assert_eq!(sent[0], STDIN_CHANNEL);
        assert_eq!(&sent[1..], b"ls\n");
    }

    #[tokio::test]
    async fn resize_payload_is_width_height_json() {
        let (local, peer) = FrameTransport::pair(16);
        let mut stream = MuxExecStream::new(local);

        stream.write_resize(120, 40).unwrap();
        let sent = peer.inbound.recv().unwrap();
        assert_eq!(sent[0], RESIZE_CHANNEL);
        let v: serde_json::Value = serde_json::from_slice(&sent[1..]).unwrap();
        assert_eq!(v["Width"], 120);
        assert_eq!(v["Height"], 40);
    }

    #[tokio::test]
    async fn success_status_yields_exit_zero() {
        let (local, peer) = FrameTransport::pair(16);
        let mut stream = MuxExecStream::new(local);

        let status = br#"{"metadata":{},"status":"Success"}"#;
        peer.outbound.send(frame(STATUS_CHANNEL, status)).unwrap();
        stream.pump(Duration::from_millis(10)).await;
        assert_eq!(stream.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn failure_status_carries_exit_code_cause() {
        let (local, peer) = FrameTransport::pair(16);
        let mut stream = MuxExecStream::new(local);

        let status = br#"{"status":"Failure","reason":"NonZeroExitCode","details":{"causes":[{"reason":"ExitCode","message":"2"}]}}"#;
        peer.outbound.send(frame(STATUS_CHANNEL, status)).unwrap();
        stream.pump(Duration::from_millis(10)).await;
        assert_eq!(stream.exit_code(), Some(2));
    }

    #[tokio::test]
    async fn failure_without_cause_reads_nonzero() {
        let (local, peer) = FrameTransport::pair(16);
        let mut stream = MuxExecStream::new(local);

        let status = br#"{"status":"Failure","message":"killed"}"#;
        peer.outbound.send(frame(STATUS_CHANNEL, status)).unwrap();
        stream.pump(Duration::from_millis(10)).await;
        assert_eq!(stream.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn transport_disconnect_closes_stream() {
        let (local, peer) = FrameTransport::pair(16);
        let mut stream = MuxExecStream::new(local);

        drop(peer);
        stream.pump(Duration::from_millis(10)).await;
        assert!(!stream.is_open());
        assert!(matches!(
            stream.write_stdin(b"x"),
            Err(ExecError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (local, _peer) = FrameTransport::pair(16);
        let mut stream = MuxExecStream::new(local);

        stream.close();
        stream.close();
        assert!(!stream.is_open());
    }

    #[tokio::test]
    async fn close_stdin_signals_eof_but_keeps_reading() {
        let (local, peer) = FrameTransport::pair(16);
        let mut stream = MuxExecStream::new(local);

        stream.close_stdin();
        // Peer observes the write side disconnect.
        assert!(peer.inbound.recv().is_err());
        // Output still flows.
        peer.outbound.send(frame(STDOUT_CHANNEL, b"done")).unwrap();
        stream.pump(Duration::from_millis(10)).await;
        assert_eq!(stream.read_stdout().unwrap(), b"done");
        // But stdin writes now fail.
        assert!(stream.write_stdin(b"x").is_err());
    }

    #[tokio::test]
    async fn pump_honors_zero_and_short_timeouts() {
        let (local, _peer) = FrameTransport::pair(16);
        let mut stream = MuxExecStream::new(local);

        let start = std::time::Instant::now();
        stream.pump(Duration::from_millis(20)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        stream.pump(Duration::ZERO).await;
        assert!(stream.is_open());
    }
}
