use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Environment variable that overrides the default config path.
pub const CONFIG_PATH_ENV: &str = "KUBE_WEBTERM_CONFIG";

/// Top-level configuration loaded from `~/.kube-webterm/config.toml`.
///
/// Every section has sane defaults, so a missing file or an empty file is a
/// valid configuration. Credentials are never stored here — the cluster
/// section only points at a kubeconfig file on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8006,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Source kubeconfig, possibly on ephemeral storage.
    pub kubeconfig: PathBuf,
    /// Stable path credentials are re-materialized to when the source
    /// disappears mid-flight.
    pub materialized_kubeconfig: PathBuf,
    pub verify_tls: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubeconfig: PathBuf::from("config/kubeconfig"),
            materialized_kubeconfig: PathBuf::from("/var/lib/kube-webterm/kubeconfig"),
            verify_tls: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds without user input before a session is closed.
    pub idle_timeout_secs: u64,
    /// Hard ceiling on session duration regardless of activity.
    pub total_timeout_secs: u64,
    /// TTL for cached pod-existence answers.
    pub pod_cache_ttl_secs: u64,
    /// Shell launched inside the target container.
    pub shell: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            total_timeout_secs: 3600,
            pod_cache_ttl_secs: 300,
            shell: "/bin/bash".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Fixed directory files are extracted into on the remote side.
    pub target_dir: String,
    /// Stdin write granularity for the tar stream.
    pub chunk_size: usize,
    /// Upper bound on a single uploaded file.
    pub max_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            target_dir: "/tmp".to_string(),
            chunk_size: 4096,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// SQLite database for connection/upload audit rows. Empty disables
    /// persistence (events are still logged).
    pub db_path: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            db_path: "kube-webterm-audit.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Load from `$KUBE_WEBTERM_CONFIG` or `~/.kube-webterm/config.toml`,
    /// falling back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn default_path() -> PathBuf {
        if let Ok(p) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(p);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".kube-webterm").join("config.toml")
    }

    /// Semantic validation for settings the type system cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.idle_timeout_secs must be positive".into(),
            ));
        }
        if self.session.total_timeout_secs < self.session.idle_timeout_secs {
            return Err(ConfigError::Invalid(
                "session.total_timeout_secs must be >= idle_timeout_secs".into(),
            ));
        }
        if self.upload.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "upload.chunk_size must be positive".into(),
            ));
        }
        if !self.upload.target_dir.starts_with('/') {
            return Err(ConfigError::Invalid(
                "upload.target_dir must be an absolute path".into(),
            ));
        }
        if self.session.shell.is_empty() {
            return Err(ConfigError::Invalid("session.shell must be set".into()));
        }
        Ok(())
    }
}
