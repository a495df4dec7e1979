//! File transfer bridge: push a single file into a running container by
//! streaming a tar archive through an exec'd `tar xf -` on the remote side.

use std::io::Write;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use kwt_core::config::UploadConfig;
use kwt_exec::{ExecError, ExecFactory, ExecRequest, ExecStream};

/// Ceiling on waiting for the remote extraction to report its exit status.
const EXTRACT_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid filename")]
    InvalidFilename,
    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },
    #[error("remote extraction failed (exit code {exit_code}): {stderr}")]
    Failed { exit_code: i32, stderr: String },
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("upload io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Absolute path the file landed at inside the container.
    pub remote_path: String,
    pub bytes: u64,
}

/// Reduce a client-supplied filename to a safe basename.
///
/// Anything carrying a path separator is rejected outright rather than
/// silently flattened, so a traversal attempt fails loudly.
fn safe_filename(name: &str) -> Result<String, UploadError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(UploadError::InvalidFilename);
    }
    let base = std::path::Path::new(name)
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or(UploadError::InvalidFilename)?;
    if base.is_empty() || base == "." || base == ".." {
        return Err(UploadError::InvalidFilename);
    }
    Ok(base.to_string())
}

/// Upload one file into `namespace/pod` under the configured target
/// directory.
///
/// The content is spooled to local scratch, wrapped in a single-entry tar
/// archive, and streamed in chunks to `tar xf -` running inside the
/// container. The remote exit status decides success.
pub async fn upload(
    factory: &ExecFactory,
    config: &UploadConfig,
    namespace: &str,
    pod: &str,
    filename: &str,
    content: &[u8],
) -> Result<UploadOutcome, UploadError> {
    let name = safe_filename(filename)?;
    let size = content.len() as u64;
    if size > config.max_bytes {
        return Err(UploadError::TooLarge {
            size,
            limit: config.max_bytes,
        });
    }

    let mut scratch = tempfile::NamedTempFile::new()?;
    scratch.write_all(content)?;
    scratch.flush()?;

    ensure_target_dir(factory, config, namespace, pod).await?;

    let mut archive = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut archive);
        builder.append_path_with_name(scratch.path(), &name)?;
        builder.finish()?;
    }

    let request = ExecRequest::command(&["tar", "xf", "-", "-C", config.target_dir.as_str()], true);
    let mut stream = factory.open(namespace, pod, &request).await?;

    for chunk in archive.chunks(config.chunk_size) {
        stream.write_stdin(chunk)?;
    }
    stream.close_stdin();

    let (exit_code, stderr) = drain_to_exit(&mut stream, EXTRACT_DEADLINE).await;
    stream.close();

    match exit_code {
        Some(0) => {
            let remote_path = format!("{}/{}", config.target_dir.trim_end_matches('/'), name);
            info!(namespace, pod, %remote_path, bytes = size, "upload complete");
            Ok(UploadOutcome { remote_path, bytes: size })
        }
        Some(code) => Err(UploadError::Failed {
            exit_code: code,
            stderr,
        }),
        None => Err(UploadError::Failed {
            exit_code: -1,
            stderr: if stderr.is_empty() {
                "extraction ended without reporting an exit status".to_string()
            } else {
                stderr
            },
        }),
    }
}

/// Best-effort `mkdir -p` of the target directory. The directory usually
/// exists already; a failure here is logged and extraction is attempted
/// anyway, which produces the authoritative error.
async fn ensure_target_dir(
    factory: &ExecFactory,
    config: &UploadConfig,
    namespace: &str,
    pod: &str,
) -> Result<(), UploadError> {
    let request = ExecRequest::command(&["mkdir", "-p", config.target_dir.as_str()], false);
    let mut stream = factory.open(namespace, pod, &request).await?;
    let (exit_code, stderr) = drain_to_exit(&mut stream, Duration::from_secs(15)).await;
    stream.close();
    if exit_code != Some(0) {
        warn!(
            namespace,
            pod,
            dir = %config.target_dir,
            ?exit_code,
            %stderr,
            "mkdir of upload target directory failed, continuing"
        );
    }
    Ok(())
}

/// Pump the stream until it reports an exit status, closes, or the deadline
/// passes. Collects stderr along the way; stdout is discarded.
async fn drain_to_exit(
    stream: &mut Box<dyn ExecStream>,
    deadline: Duration,
) -> (Option<i32>, String) {
    let start = tokio::time::Instant::now();
    let mut stderr = Vec::new();
    loop {
        stream.pump(Duration::from_millis(100)).await;
        while let Some(chunk) = stream.read_stderr() {
            stderr.extend_from_slice(&chunk);
        }
        while stream.read_stdout().is_some() {}

        if let Some(code) = stream.exit_code() {
            return (Some(code), String::from_utf8_lossy(&stderr).into_owned());
        }
        if !stream.is_open() {
            debug!("exec stream closed before reporting an exit status");
            return (None, String::from_utf8_lossy(&stderr).into_owned());
        }
        if start.elapsed() >= deadline {
            warn!("gave up waiting for remote exit status");
            return (
                stream.exit_code(),
                String::from_utf8_lossy(&stderr).into_owned(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kwt_exec::{
        ClusterClient, FrameTransport, MuxExecStream, STATUS_CHANNEL, STDERR_CHANNEL,
        STDIN_CHANNEL,
    };
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn frame(channel: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![channel];
        f.extend_from_slice(payload);
        f
    }

    /// Plays the remote side of an upload: the first exec is the mkdir, the
    /// second is the tar extraction, whose stdin bytes are captured.
    struct StubClient {
        tar_exit: i32,
        tar_stderr: Option<String>,
        calls: AtomicUsize,
        commands: Arc<Mutex<Vec<Vec<String>>>>,
        stdin_bytes: Arc<Mutex<Vec<u8>>>,
    }

    impl StubClient {
        fn new(tar_exit: i32, tar_stderr: Option<&str>) -> Self {
            Self {
                tar_exit,
                tar_stderr: tar_stderr.map(|s| s.to_string()),
                calls: AtomicUsize::new(0),
                commands: Arc::new(Mutex::new(Vec::new())),
                stdin_bytes: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl ClusterClient for StubClient {
        async fn pod_exists(&self, _namespace: &str, _pod: &str) -> Result<bool, ExecError> {
            Ok(true)
        }

        async fn exec(
            &self,
            _namespace: &str,
            _pod: &str,
            request: &ExecRequest,
        ) -> Result<Box<dyn ExecStream>, ExecError> {
            self.commands.lock().unwrap().push(request.command.clone());
            let (local, peer) = FrameTransport::pair(256);
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                peer.outbound
                    .send(frame(STATUS_CHANNEL, br#"{"status":"Success"}"#))
                    .unwrap();
                // Dropping the peer ends the mkdir stream.
            } else {
                let exit = self.tar_exit;
                let stderr = self.tar_stderr.clone();
                let sink = Arc::clone(&self.stdin_bytes);
                tokio::spawn(async move {
                    while let Ok(f) = peer.inbound.recv_async().await {
                        if f[0] == STDIN_CHANNEL {
                            sink.lock().unwrap().extend_from_slice(&f[1..]);
                        }
                    }
                    if let Some(msg) = stderr {
                        peer.outbound
                            .send(frame(STDERR_CHANNEL, msg.as_bytes()))
                            .unwrap();
                    }
                    let status = if exit == 0 {
                        r#"{"status":"Success"}"#.to_string()
                    } else {
                        format!(
                            r#"{{"status":"Failure","details":{{"causes":[{{"reason":"ExitCode","message":"{exit}"}}]}}}}"#
                        )
                    };
                    peer.outbound
                        .send(frame(STATUS_CHANNEL, status.as_bytes()))
                        .unwrap();
                });
            }
            Ok(Box::new(MuxExecStream::new(local)))
        }

        async fn reinitialize(&self) -> Result<(), ExecError> {
            Ok(())
        }
    }

    fn factory_with(client: Arc<StubClient>) -> ExecFactory {
        ExecFactory::new(client, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn successful_upload_streams_a_single_entry_archive() {
        let client = Arc::new(StubClient::new(0, None));
        let factory = factory_with(Arc::clone(&client));
        let config = UploadConfig::default();

        let outcome = upload(&factory, &config, "default", "web-0", "report.txt", b"hello")
            .await
            .unwrap();
        assert_eq!(outcome.remote_path, "/tmp/report.txt");
        assert_eq!(outcome.bytes, 5);

        let bytes = client.stdin_bytes.lock().unwrap().clone();
        let mut archive = tar::Archive::new(&bytes[..]);
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str().unwrap(), "report.txt");
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn remote_commands_target_the_configured_directory() {
        let client = Arc::new(StubClient::new(0, None));
        let factory = factory_with(Arc::clone(&client));
        let config = UploadConfig {
            target_dir: "/data/incoming".to_string(),
            ..UploadConfig::default()
        };

        let outcome = upload(&factory, &config, "default", "web-0", "a.bin", b"x")
            .await
            .unwrap();
        assert_eq!(outcome.remote_path, "/data/incoming/a.bin");

        let commands = client.commands.lock().unwrap();
        assert_eq!(commands[0], ["mkdir", "-p", "/data/incoming"]);
        assert_eq!(commands[1], ["tar", "xf", "-", "-C", "/data/incoming"]);
    }

    #[tokio::test]
    async fn traversal_and_separator_names_are_rejected_before_any_exec() {
        let client = Arc::new(StubClient::new(0, None));
        let factory = factory_with(Arc::clone(&client));
        let config = UploadConfig::default();

        for bad in ["../etc/passwd", "a/b.txt", "c\\d.txt", "", "..", "."] {
            let err = upload(&factory, &config, "default", "web-0", bad, b"x")
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::InvalidFilename), "{bad:?}");
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversize_content_is_rejected_before_any_exec() {
        let client = Arc::new(StubClient::new(0, None));
        let factory = factory_with(Arc::clone(&client));
        let config = UploadConfig {
            max_bytes: 4,
            ..UploadConfig::default()
        };

        let err = upload(&factory, &config, "default", "web-0", "big.bin", b"hello")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::TooLarge { size: 5, limit: 4 }
        ));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remote_failure_surfaces_exit_code_and_stderr() {
        let client = Arc::new(StubClient::new(2, Some("tar: write error")));
        let factory = factory_with(client);
        let config = UploadConfig::default();

        let err = upload(&factory, &config, "default", "web-0", "f.txt", b"x")
            .await
            .unwrap_err();
        match err {
            UploadError::Failed { exit_code, stderr } => {
                assert_eq!(exit_code, 2);
                assert!(stderr.contains("tar: write error"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn small_chunk_size_still_reassembles_the_archive() {
        let client = Arc::new(StubClient::new(0, None));
        let factory = factory_with(Arc::clone(&client));
        let config = UploadConfig {
            chunk_size: 8,
            ..UploadConfig::default()
        };
        let content: Vec<u8> = (0..=255u8).cycle().take(3000).collect();

        upload(&factory, &config, "default", "web-0", "blob.bin", &content)
            .await
            .unwrap();

        let bytes = client.stdin_bytes.lock().unwrap().clone();
        let mut archive = tar::Archive::new(&bytes[..]);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut restored = Vec::new();
        entry.read_to_end(&mut restored).unwrap();
        assert_eq!(restored, content);
    }

    #[test]
    fn safe_filename_keeps_plain_names() {
        assert_eq!(safe_filename("notes.md").unwrap(), "notes.md");
        assert_eq!(safe_filename(".env").unwrap(), ".env");
    }
}
