//! Shared foundation for kube-webterm: configuration, audit/event types,
//! and logging initialisation.

pub mod config;
pub mod logging;
pub mod types;
