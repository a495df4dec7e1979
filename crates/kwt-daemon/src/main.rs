//! kube-webterm daemon: serves the terminal WebSocket bridge, the pod
//! probe and the file upload API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use kwt_bridge::api::{router, ApiState};
use kwt_bridge::audit::{AuditSink, NullAuditSink, SqliteAuditSink};
use kwt_core::config::Config;
use kwt_exec::ExecFactory;

mod kubectl;

use kubectl::KubectlClient;

#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_err) = match Config::load() {
        Ok(c) => (c, None),
        Err(e) => (Config::default(), Some(e)),
    };
    kwt_core::logging::init("kube-webterm", &config.log);
    if let Some(e) = config_err {
        warn!(error = %e, "failed to load config, using defaults");
    }

    info!(version = env!("CARGO_PKG_VERSION"), "kube-webterm starting");

    let audit: Arc<dyn AuditSink> = if config.audit.db_path.is_empty() {
        info!("audit persistence disabled");
        Arc::new(NullAuditSink)
    } else {
        match SqliteAuditSink::open(&config.audit.db_path).await {
            Ok(sink) => {
                info!(db = %config.audit.db_path, "audit database opened");
                Arc::new(sink)
            }
            Err(e) => {
                warn!(error = %e, "failed to open audit database, events will not persist");
                Arc::new(NullAuditSink)
            }
        }
    };

    let client = Arc::new(KubectlClient::new(config.cluster.clone()));
    let factory = Arc::new(ExecFactory::new(
        client,
        Duration::from_secs(config.session.pod_cache_ttl_secs),
    ));

    let state = Arc::new(ApiState {
        factory,
        audit,
        config: config.clone(),
    });
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("kube-webterm stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
