use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cache::PodExistenceCache;
use crate::error::ExecError;
use crate::stream::ExecStream;

/// Parameters for one remote command.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub stdin: bool,
    pub tty: bool,
}

impl ExecRequest {
    /// Interactive shell for a terminal session.
    pub fn shell(shell: &str) -> Self {
        Self {
            command: vec![shell.to_string()],
            stdin: true,
            tty: true,
        }
    }

    /// Non-interactive command (upload helpers).
    pub fn command(argv: &[&str], stdin: bool) -> Self {
        Self {
            command: argv.iter().map(|s| s.to_string()).collect(),
            stdin,
            tty: false,
        }
    }
}

/// The narrow seam to the cluster client library. Everything above this
/// trait is client-agnostic.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Uncached existence probe. `Ok(false)` means not-found; any other
    /// failure is a cluster query error.
    async fn pod_exists(&self, namespace: &str, pod: &str) -> Result<bool, ExecError>;

    /// Open a multiplexed exec stream for the given command.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        request: &ExecRequest,
    ) -> Result<Box<dyn ExecStream>, ExecError>;

    /// Re-materialize credential state (e.g. copy the kubeconfig to a
    /// stable path and reload). Only called under the factory's lock;
    /// must not disturb already-open streams.
    async fn reinitialize(&self) -> Result<(), ExecError>;
}

/// Opens exec streams, fronted by the existence cache, with a single
/// bounded retry when stream creation trips over a vanished credential file.
pub struct ExecFactory {
    client: Arc<dyn ClusterClient>,
    cache: PodExistenceCache,
    // Serializes reinitialization across sessions. Never held across the
    // actual exec call, so unrelated streams are not blocked.
    reinit_lock: tokio::sync::Mutex<()>,
}

impl ExecFactory {
    pub fn new(client: Arc<dyn ClusterClient>, cache_ttl: Duration) -> Self {
        Self {
            client,
            cache: PodExistenceCache::new(cache_ttl),
            reinit_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Cache-fronted existence check. Both outcomes are stored
    /// unconditionally; staleness is bounded by the cache TTL.
    pub async fn pod_exists(&self, namespace: &str, pod: &str) -> Result<bool, ExecError> {
        if let Some(cached) = self.cache.lookup(namespace, pod) {
            return Ok(cached);
        }
        let exists = self.client.pod_exists(namespace, pod).await?;
        self.cache.insert(namespace, pod, exists);
        Ok(exists)
    }

    /// Open an exec stream, verifying existence first.
    pub async fn open(
        &self,
        namespace: &str,
        pod: &str,
        request: &ExecRequest,
    ) -> Result<Box<dyn ExecStream>, ExecError> {
        if !self.pod_exists(namespace, pod).await? {
            return Err(ExecError::PodNotFound {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
            });
        }

        match self.client.exec(namespace, pod, request).await {
            Ok(stream) => Ok(stream),
            Err(e) if is_missing_credential(&e) => {
                warn!(namespace, pod, error = %e,
                    "exec failed on missing credential file, reinitializing client");
                {
                    let _guard = self.reinit_lock.lock().await;
                    self.client.reinitialize().await?;
                }
                info!(namespace, pod, "retrying exec after reinitialization");
                self.client
                    .exec(namespace, pod, request)
                    .await
                    .map_err(|e| ExecError::Connection(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

/// A transport failure whose message points at a vanished transient
/// credential/certificate file. Only this class of error earns the one
/// reinitialize-and-retry; everything else surfaces immediately.
fn is_missing_credential(e: &ExecError) -> bool {
    let ExecError::Connection(msg) = e else {
        return false;
    };
    let msg = msg.to_ascii_lowercase();
    msg.contains("no such file")
        && ["cert", "kubeconfig", "token", "credential", ".pem"]
            .iter()
            .any(|needle| msg.contains(needle))
}
