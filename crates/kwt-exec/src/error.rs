use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The target pod does not exist (terminal, no retry).
    #[error("pod not found: {namespace}/{pod}")]
    PodNotFound { namespace: String, pod: String },

    /// The existence check itself failed for a reason other than not-found.
    #[error("cluster query failed: {0}")]
    Cluster(String),

    /// Transport or credential failure while opening or using a stream.
    #[error("remote connection error: {0}")]
    Connection(String),

    /// Write attempted on a stream that is no longer open.
    #[error("exec stream closed")]
    StreamClosed,

    /// The status channel carried a document we could not interpret.
    #[error("malformed status document: {0}")]
    Status(String),
}

pub type Result<T> = std::result::Result<T, ExecError>;
