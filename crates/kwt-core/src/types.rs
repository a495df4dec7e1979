use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A pod addressed by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Discrete lifecycle events recorded by the audit sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Connected,
    Disconnected,
    UploadAttempted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Connected => "connected",
            AuditAction::Disconnected => "disconnected",
            AuditAction::UploadAttempted => "upload_attempted",
        }
    }
}

/// A single audit row. Write-only and fire-and-forget from the bridge's
/// perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub username: String,
    pub namespace: String,
    pub pod: String,
    pub action: AuditAction,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn now(username: impl Into<String>, pod: &PodRef, action: AuditAction) -> Self {
        Self {
            username: username.into(),
            namespace: pod.namespace.clone(),
            pod: pod.name.clone(),
            action,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_ref_display() {
        let p = PodRef::new("default", "web-0");
        assert_eq!(p.to_string(), "default/web-0");
    }

    #[test]
    fn audit_action_labels() {
        assert_eq!(AuditAction::Connected.as_str(), "connected");
        assert_eq!(AuditAction::UploadAttempted.as_str(), "upload_attempted");
    }

    #[test]
    fn audit_event_carries_pod_fields() {
        let pod = PodRef::new("ops", "db-1");
        let ev = AuditEvent::now("alice", &pod, AuditAction::Disconnected);
        assert_eq!(ev.namespace, "ops");
        assert_eq!(ev.pod, "db-1");
        assert_eq!(ev.action, AuditAction::Disconnected);
    }
}
