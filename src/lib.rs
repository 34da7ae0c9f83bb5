//! APM Port - Application Monitoring Abstraction
//!
//! A monitoring port (trait) for transactions, segments and custom metrics,
//! with adapters that either delegate to an APM agent or do nothing.
//!
//! # Architecture
//!
//! ```text
//! Application code → Monitoring port → ApmMonitoringAdapter → ApmAgent
//!                                    ↘ NoopMonitoring
//! ```
//!
//! The vendor-backed adapter loads its agent once, on `initialize()`. Without
//! a license key, or when loading fails, it stays in pass-through mode for
//! the rest of its life: the caller's operations still run, nothing is
//! reported.
//!
//! # Modules
//!
//! - [`adapters`] - Adapters implementing the domain ports
//! - [`domain`] - Ports, value objects and configuration
//! - [`error`] - Error types

pub mod adapters;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use adapters::{
    ApmMonitoringAdapter, MonitoringAdapter, NoopMonitoring, PrometheusAgent,
    PrometheusAgentLoader, TracingLogger,
};
pub use domain::{
    Capitalized, Monitoring, MonitoringConfig, MonitoringState, SegmentName,
};
pub use error::{Error, Result};
