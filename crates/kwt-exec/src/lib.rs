//! Cluster-side remote execution: the [`ExecStream`] capability, a
//! multiplexed-frame adapter over the control plane's exec channel, a
//! TTL cache for pod existence, and the factory that owns retry policy.
//!
//! The control plane's wire protocol (frame/channel multiplexing over the
//! exec endpoint) is assumed to be provided by a client library; this crate
//! consumes it through the [`ClusterClient`] seam only.

pub mod cache;
pub mod error;
pub mod factory;
pub mod stream;

pub use cache::PodExistenceCache;
pub use error::ExecError;
pub use factory::{ClusterClient, ExecFactory, ExecRequest};
pub use stream::{
    ExecStream, FrameTransport, MuxExecStream, RESIZE_CHANNEL, STATUS_CHANNEL, STDERR_CHANNEL,
    STDIN_CHANNEL, STDOUT_CHANNEL,
};
