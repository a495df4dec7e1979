//! kubectl-backed cluster client.
//!
//! Interactive shells run under a local PTY so the remote side sees a real
//! terminal; short-lived commands (upload helpers) run with plain piped
//! stdio. Both are surfaced through the [`ExecStream`] capability.

use std::collections::VecDeque;
use std::io::{Read as IoRead, Write as IoWrite};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use kwt_core::config::ClusterConfig;
use kwt_exec::{ClusterClient, ExecError, ExecRequest, ExecStream};

const IO_CHANNEL_CAPACITY: usize = 256;

/// [`ClusterClient`] shelling out to `kubectl`.
pub struct KubectlClient {
    cluster: ClusterConfig,
    /// Kubeconfig used for new commands. Swapped to the materialized copy
    /// by `reinitialize`; already-running streams keep their own fd.
    active_kubeconfig: Mutex<PathBuf>,
}

impl KubectlClient {
    pub fn new(cluster: ClusterConfig) -> Self {
        let active = cluster.kubeconfig.clone();
        Self {
            cluster,
            active_kubeconfig: Mutex::new(active),
        }
    }

    fn kubeconfig(&self) -> PathBuf {
        self.active_kubeconfig
            .lock()
            .unwrap_or_else(|e| {
                warn!("kubeconfig lock was poisoned, recovering");
                e.into_inner()
            })
            .clone()
    }

    fn exec_tty(
        &self,
        namespace: &str,
        pod: &str,
        request: &ExecRequest,
    ) -> Result<Box<dyn ExecStream>, ExecError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ExecError::Connection(e.to_string()))?;

        let mut command = CommandBuilder::new("kubectl");
        for arg in ["exec", "-it", pod, "-n", namespace, "--"] {
            command.arg(arg);
        }
        for arg in &request.command {
            command.arg(arg);
        }
        command.env("KUBECONFIG", self.kubeconfig());
        command.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| ExecError::Connection(e.to_string()))?;
        debug!(namespace, pod, "spawned kubectl exec under a pty");

        // -- output reader thread --
        let (read_tx, read_rx) = flume::bounded::<Vec<u8>>(IO_CHANNEL_CAPACITY);
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ExecError::Connection(e.to_string()))?;
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if read_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break, // EIO when the child exits
                }
            }
        });

        // -- input writer thread --
        let (write_tx, write_rx) = flume::bounded::<Vec<u8>>(IO_CHANNEL_CAPACITY);
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| ExecError::Connection(e.to_string()))?;
        std::thread::spawn(move || {
            while let Ok(data) = write_rx.recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        Ok(Box::new(PtyExecStream {
            reader: read_rx,
            writer: Some(write_tx),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            output: VecDeque::new(),
            exit_code: None,
            open: true,
        }))
    }

    async fn exec_piped(
        &self,
        namespace: &str,
        pod: &str,
        request: &ExecRequest,
    ) -> Result<Box<dyn ExecStream>, ExecError> {
        let mut args: Vec<String> = vec!["exec".to_string()];
        if request.stdin {
            args.push("-i".to_string());
        }
        args.extend([
            pod.to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "--".to_string(),
        ]);
        args.extend(request.command.iter().cloned());

        let mut cmd = tokio::process::Command::new("kubectl");
        cmd.args(&args)
            .env("KUBECONFIG", self.kubeconfig())
            .stdin(if request.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        spawn_piped(cmd, request.stdin)
    }
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn pod_exists(&self, namespace: &str, pod: &str) -> Result<bool, ExecError> {
        let output = tokio::process::Command::new("kubectl")
            .args(["get", "pod", pod, "-n", namespace, "--no-headers"])
            .arg("--request-timeout=10s")
            .env("KUBECONFIG", self.kubeconfig())
            .output()
            .await
            .map_err(|e| ExecError::Connection(format!("failed to run kubectl: {e}")))?;

        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("NotFound") || stderr.contains("not found") {
            Ok(false)
        } else {
            Err(ExecError::Cluster(stderr.trim().to_string()))
        }
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        request: &ExecRequest,
    ) -> Result<Box<dyn ExecStream>, ExecError> {
        if request.tty {
            self.exec_tty(namespace, pod, request)
        } else {
            self.exec_piped(namespace, pod, request).await
        }
    }

    async fn reinitialize(&self) -> Result<(), ExecError> {
        let src = self.cluster.kubeconfig.clone();
        let dst = self.cluster.materialized_kubeconfig.clone();
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecError::Connection(e.to_string()))?;
        }
        tokio::fs::copy(&src, &dst)
            .await
            .map_err(|e| ExecError::Connection(format!("failed to materialize kubeconfig: {e}")))?;
        info!(dst = %dst.display(), "kubeconfig re-materialized to stable storage");
        *self.active_kubeconfig.lock().unwrap_or_else(|e| {
            warn!("kubeconfig lock was poisoned, recovering");
            e.into_inner()
        }) = dst;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PTY-backed stream (interactive shells)
// ---------------------------------------------------------------------------

/// Terminal stream over a local PTY. The PTY merges the remote command's
/// stderr into the terminal byte stream, so the stderr side is always empty.
struct PtyExecStream {
    reader: flume::Receiver<Vec<u8>>,
    writer: Option<flume::Sender<Vec<u8>>>,
    master: Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    output: VecDeque<Vec<u8>>,
    exit_code: Option<i32>,
    open: bool,
}

impl PtyExecStream {
    fn drain_ready(&mut self) -> usize {
        let mut n = 0;
        loop {
            match self.reader.try_recv() {
                Ok(chunk) => {
                    self.output.push_back(chunk);
                    n += 1;
                }
                Err(flume::TryRecvError::Empty) => break,
                Err(flume::TryRecvError::Disconnected) => {
                    self.mark_exited();
                    break;
                }
            }
        }
        n
    }

    fn mark_exited(&mut self) {
        self.open = false;
        if self.exit_code.is_none() {
            let mut child = self.child.lock().unwrap_or_else(|e| {
                warn!("pty child lock was poisoned, recovering");
                e.into_inner()
            });
            self.exit_code = match child.try_wait() {
                Ok(Some(status)) => Some(status.exit_code() as i32),
                _ => None,
            };
        }
    }
}

#[async_trait]
impl ExecStream for PtyExecStream {
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
        let rx = self.reader.clone();
        match tokio::time::timeout(timeout, rx.recv_async()).await {
            Ok(Ok(chunk)) => {
                self.output.push_back(chunk);
                self.drain_ready();
            }
            Ok(Err(_)) => self.mark_exited(),
            Err(_) => {}
        }
    }

    fn peek_stdout(&self) -> bool {
        !self.output.is_empty()
    }

    fn read_stdout(&mut self) -> Option<Vec<u8>> {
        self.output.pop_front()
    }

    fn peek_stderr(&self) -> bool {
        false
    }

    fn read_stderr(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError> {
        let Some(tx) = self.writer.as_ref() else {
            return Err(ExecError::StreamClosed);
        };
        tx.send(data.to_vec()).map_err(|_| {
            self.open = false;
            ExecError::StreamClosed
        })
    }

    fn write_resize(&mut self, cols: u16, rows: u16) -> Result<(), ExecError> {
        let master = self.master.lock().unwrap_or_else(|e| {
            warn!("pty master lock was poisoned, recovering");
            e.into_inner()
        });
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ExecError::Connection(format!("resize failed: {e}")))?;
        debug!(cols, rows, "pty resized");
        Ok(())
    }

    fn close_stdin(&mut self) {
        self.writer.take();
    }

    fn close(&mut self) {
        self.writer.take();
        if self.open {
            let mut child = self.child.lock().unwrap_or_else(|e| {
                warn!("pty child lock was poisoned, recovering");
                e.into_inner()
            });
            if let Err(e) = child.kill() {
                debug!(error = %e, "pty child kill failed (already exited?)");
            }
        }
        self.open = false;
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

// ---------------------------------------------------------------------------
// Piped stream (non-interactive commands)
// ---------------------------------------------------------------------------

/// Spawn a prepared command and wrap its stdio as an [`ExecStream`].
fn spawn_piped(
    mut cmd: tokio::process::Command,
    wants_stdin: bool,
) -> Result<Box<dyn ExecStream>, ExecError> {
    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::Connection(format!("spawn failed: {e}")))?;

    let (stdin_tx, stdin_rx) = flume::bounded::<Vec<u8>>(IO_CHANNEL_CAPACITY);
    if wants_stdin {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecError::Connection("child stdin missing".to_string()))?;
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            while let Ok(data) = stdin_rx.recv_async().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
            }
            // Channel closed: dropping stdin delivers EOF.
            let _ = stdin.shutdown().await;
        });
    }

    let (stdout_tx, stdout_rx) = flume::bounded::<Vec<u8>>(IO_CHANNEL_CAPACITY);
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::Connection("child stdout missing".to_string()))?;
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout_tx.send_async(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (stderr_tx, stderr_rx) = flume::bounded::<Vec<u8>>(IO_CHANNEL_CAPACITY);
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::Connection("child stderr missing".to_string()))?;
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stderr_tx.send_async(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (exit_tx, exit_rx) = flume::bounded::<i32>(1);
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        };
        let _ = exit_tx.send_async(code).await;
    });

    Ok(Box::new(PipedExecStream {
        stdin_tx: Some(stdin_tx),
        stdout_rx,
        stderr_rx,
        exit_rx,
        stdout: VecDeque::new(),
        stderr: VecDeque::new(),
        exit_code: None,
        open: true,
    }))
}

struct PipedExecStream {
    stdin_tx: Option<flume::Sender<Vec<u8>>>,
    stdout_rx: flume::Receiver<Vec<u8>>,
    stderr_rx: flume::Receiver<Vec<u8>>,
    exit_rx: flume::Receiver<i32>,
    stdout: VecDeque<Vec<u8>>,
    stderr: VecDeque<Vec<u8>>,
    exit_code: Option<i32>,
    open: bool,
}

impl PipedExecStream {
    fn drain_ready(&mut self) -> usize {
        let mut n = 0;
        while let Ok(chunk) = self.stdout_rx.try_recv() {
            self.stdout.push_back(chunk);
            n += 1;
        }
        while let Ok(chunk) = self.stderr_rx.try_recv() {
            self.stderr.push_back(chunk);
            n += 1;
        }
        if self.exit_code.is_none() {
            if let Ok(code) = self.exit_rx.try_recv() {
                self.exit_code = Some(code);
                n += 1;
            }
        }
        if self.exit_code.is_some()
            && self.stdout_rx.is_disconnected()
            && self.stdout_rx.is_empty()
            && self.stderr_rx.is_disconnected()
            && self.stderr_rx.is_empty()
        {
            self.open = false;
        }
        n
    }
}

#[async_trait]
impl ExecStream for PipedExecStream {
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
        let stdout_rx = self.stdout_rx.clone();
        let stderr_rx = self.stderr_rx.clone();
        let exit_rx = self.exit_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            r = stdout_rx.recv_async() => {
                if let Ok(chunk) = r {
                    self.stdout.push_back(chunk);
                }
            }
            r = stderr_rx.recv_async() => {
                if let Ok(chunk) = r {
                    self.stderr.push_back(chunk);
                }
            }
            r = exit_rx.recv_async() => {
                if let Ok(code) = r {
                    self.exit_code = Some(code);
                }
            }
        }
        self.drain_ready();
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
        let Some(tx) = self.stdin_tx.as_ref() else {
            return Err(ExecError::StreamClosed);
        };
        tx.send(data.to_vec())
            .map_err(|_| ExecError::StreamClosed)
    }

    fn write_resize(&mut self, _cols: u16, _rows: u16) -> Result<(), ExecError> {
        Err(ExecError::Cluster(
            "resize is only supported on tty streams".to_string(),
        ))
    }

    fn close_stdin(&mut self) {
        self.stdin_tx.take();
    }

    fn close(&mut self) {
        self.stdin_tx.take();
        self.open = false;
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_exit(stream: &mut Box<dyn ExecStream>) -> Option<i32> {
        for _ in 0..100 {
            stream.pump(Duration::from_millis(50)).await;
            if !stream.is_open() {
                break;
            }
        }
        stream.exit_code()
    }

    fn piped(program: &str, args: &[&str], stdin: bool) -> Box<dyn ExecStream> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        spawn_piped(cmd, stdin).unwrap()
    }

    #[tokio::test]
    async fn piped_stream_round_trips_stdin_to_stdout() {
        let mut stream = piped("cat", &[], true);
        stream.write_stdin(b"hello").unwrap();
        stream.close_stdin();

        let code = wait_exit(&mut stream).await;
        assert_eq!(code, Some(0));

        let mut out = Vec::new();
        while let Some(chunk) = stream.read_stdout() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn piped_stream_reports_nonzero_exit() {
        let mut stream = piped("sh", &["-c", "echo oops >&2; exit 3"], false);
        let code = wait_exit(&mut stream).await;
        assert_eq!(code, Some(3));

        let mut err = Vec::new();
        while let Some(chunk) = stream.read_stderr() {
            err.extend_from_slice(&chunk);
        }
        assert_eq!(String::from_utf8_lossy(&err).trim(), "oops");
    }

    #[tokio::test]
    async fn piped_stream_rejects_resize() {
        let mut stream = piped("cat", &[], true);
        assert!(stream.write_resize(80, 24).is_err());
        stream.close();
        assert!(!stream.is_open());
    }

    #[tokio::test]
    async fn reinitialize_copies_kubeconfig_to_stable_path() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("kubeconfig");
        let dst = dir.path().join("stable").join("kubeconfig");
        std::fs::write(&src, "apiVersion: v1\n").unwrap();

        let client = KubectlClient::new(ClusterConfig {
            kubeconfig: src.clone(),
            materialized_kubeconfig: dst.clone(),
            verify_tls: false,
        });
        assert_eq!(client.kubeconfig(), src);

        client.reinitialize().await.unwrap();
        assert_eq!(client.kubeconfig(), dst);
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "apiVersion: v1\n");
    }
}
