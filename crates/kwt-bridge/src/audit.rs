//! Connection and upload audit trail.
//!
//! Recording is fire-and-forget: a broken sink must never take a live
//! terminal session down with it.

use async_trait::async_trait;
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::warn;

use kwt_core::types::AuditEvent;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit db error: {0}")]
    Db(String),
}

impl From<tokio_rusqlite::Error> for AuditError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        AuditError::Db(e.to_string())
    }
}

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Sink used when persistence is disabled; events still reach the log.
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn record(&self, _event: &AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

/// A persisted audit row as read back from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    pub username: String,
    pub namespace: String,
    pub pod: String,
    pub action: String,
    pub timestamp: String,
}

/// SQLite-backed audit sink.
pub struct SqliteAuditSink {
    conn: Connection,
}

impl SqliteAuditSink {
    /// Open (or create) the audit database at the given file path.
    pub async fn open(path: &str) -> Result<Self, AuditError> {
        let conn = Connection::open(path).await?;
        let sink = Self { conn };
        sink.init_schema().await?;
        Ok(sink)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory().await?;
        let sink = Self { conn };
        sink.init_schema().await?;
        Ok(sink)
    }

    async fn init_schema(&self) -> Result<(), AuditError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    CREATE TABLE IF NOT EXISTS terminal_audit (
                        id        INTEGER PRIMARY KEY AUTOINCREMENT,
                        username  TEXT NOT NULL,
                        namespace TEXT NOT NULL,
                        pod       TEXT NOT NULL,
                        action    TEXT NOT NULL,
                        timestamp TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_audit_pod
                        ON terminal_audit(namespace, pod);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Most recent events first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<AuditRow>, AuditError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT username, namespace, pod, action, timestamp
                     FROM terminal_audit ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit], |row| {
                        Ok(AuditRow {
                            username: row.get(0)?,
                            namespace: row.get(1)?,
                            pod: row.get(2)?,
                            action: row.get(3)?,
                            timestamp: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let event = event.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO terminal_audit (username, namespace, pod, action, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        event.username,
                        event.namespace,
                        event.pod,
                        event.action.as_str(),
                        event.timestamp.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Record an event, logging instead of failing when the sink is broken.
pub async fn record_best_effort(sink: &dyn AuditSink, event: &AuditEvent) {
    if let Err(e) = sink.record(event).await {
        warn!(
            error = %e,
            username = %event.username,
            namespace = %event.namespace,
            pod = %event.pod,
            action = event.action.as_str(),
            "failed to persist audit event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwt_core::types::{AuditAction, PodRef};

    #[tokio::test]
    async fn records_and_reads_back_in_reverse_order() {
        let sink = SqliteAuditSink::open_in_memory().await.unwrap();
        let pod = PodRef::new("default", "web-0");

        sink.record(&AuditEvent::now("alice", &pod, AuditAction::Connected))
            .await
            .unwrap();
        sink.record(&AuditEvent::now("alice", &pod, AuditAction::Disconnected))
            .await
            .unwrap();

        let rows = sink.recent(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, "disconnected");
        assert_eq!(rows[1].action, "connected");
        assert_eq!(rows[0].username, "alice");
        assert_eq!(rows[0].namespace, "default");
        assert_eq!(rows[0].pod, "web-0");
    }

    #[tokio::test]
    async fn recent_honors_the_limit() {
        let sink = SqliteAuditSink::open_in_memory().await.unwrap();
        let pod = PodRef::new("default", "web-0");
        for _ in 0..5 {
            sink.record(&AuditEvent::now("bob", &pod, AuditAction::UploadAttempted))
                .await
                .unwrap();
        }
        assert_eq!(sink.recent(3).await.unwrap().len(), 3);
    }

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn record(&self, _event: &AuditEvent) -> Result<(), AuditError> {
            Err(AuditError::Db("disk on fire".into()))
        }
    }

    #[tokio::test]
    async fn best_effort_swallows_sink_failures() {
        let pod = PodRef::new("default", "web-0");
        let event = AuditEvent::now("carol", &pod, AuditAction::Connected);
        record_best_effort(&BrokenSink, &event).await;
        record_best_effort(&NullAuditSink, &event).await;
    }
}
