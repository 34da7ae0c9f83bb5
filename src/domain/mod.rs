//! Domain Layer
//!
//! This module contains the monitoring contract following Domain-Driven Design principles.
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for monitoring and its collaborators
//! - **Config** (`config.rs`) - Configuration handed to adapters at construction
//!
//! # Usage
//!
//! ```ignore
//! use apm_port::domain::ports::{Capitalized, Monitoring};
//!
//! // Depend on the port, not on a concrete adapter
//! async fn create_user<M: Monitoring>(monitoring: &M, input: NewUser) -> Result<User> {
//!     let domain = Capitalized::new("User")?;
//!     let name = Capitalized::new("Create")?;
//!     monitoring
//!         .monitor_transaction(&domain, &name, || async { store(input).await })
//!         .await
//! }
//! ```

pub mod config;
pub mod ports;

// Re-export commonly used types
pub use config::MonitoringConfig;
pub use ports::{
    metric_name,
    // Port traits
    AgentLoader,
    ApmAgent,
    // Value objects
    Capitalized,
    DisabledReason,
    Logger,
    Monitoring,
    MonitoringState,
    SegmentName,
    TransactionHandle,
    DEFAULT_COUNT,
};
