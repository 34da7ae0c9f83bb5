//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │   Monitoring   │   ApmAgent   │  AgentLoader  │   Logger    │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ ApmMonitoringAdapter │ NoopMonitoring │ MonitoringAdapter  │ │
//! │  │ PrometheusAgent │ RecordingAgent │ TracingLogger           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use apm_port::adapters::{ApmMonitoringAdapter, PrometheusAgentLoader, TracingLogger};
//! use apm_port::domain::{Monitoring, MonitoringConfig};
//!
//! let config = MonitoringConfig::new("production")
//!     .with_license_key(license_key)
//!     .with_logger(Arc::new(TracingLogger::new()));
//! let monitoring = ApmMonitoringAdapter::new(config, PrometheusAgentLoader::new(registry));
//! monitoring.initialize().await;
//! ```

mod apm;
mod dispatch;
mod logging;
mod noop;
mod prometheus;
mod recording;

pub use apm::{ApmMonitoringAdapter, ENVIRONMENT_ATTRIBUTE};
pub use dispatch::MonitoringAdapter;
pub use logging::{InMemoryLogCollector, LogLevel, LogRecord, NoopLogger, TracingLogger};
pub use noop::NoopMonitoring;
pub use self::prometheus::{PrometheusAgent, PrometheusAgentLoader};
pub use recording::{AgentCall, RecordingAgent, RecordingAgentLoader};
