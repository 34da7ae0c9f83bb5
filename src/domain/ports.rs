//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the monitoring abstractions (ports) that application
//! code depends on, and the collaborator ports the vendor-backed adapter
//! depends on in turn.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  Monitoring │ ApmAgent │ AgentLoader │ Logger       │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  ApmMonitoringAdapter │ NoopMonitoring │ Prometheus │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Value recorded by `record_count` when the caller gives none.
pub const DEFAULT_COUNT: f64 = 1.0;

/// Separator used in composite metric and segment names.
pub const NAME_SEPARATOR: char = '/';

// =============================================================================
// Value Objects
// =============================================================================

/// Capitalized identifier used as a metric domain, metric name or segment part.
///
/// The value starts with an uppercase character and never contains the
/// name separator, so composite names can be split back unambiguously.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Capitalized(String);

impl Capitalized {
    /// Create a capitalized identifier, rejecting values that break the convention.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let invalid = |reason: &str| Error::InvalidName {
            value: value.clone(),
            reason: reason.to_string(),
        };

        match value.chars().next() {
            None => return Err(invalid("must not be empty")),
            Some(first) if !first.is_uppercase() => {
                return Err(invalid("must start with an uppercase character"))
            }
            Some(_) => {}
        }
        if value.contains(NAME_SEPARATOR) {
            return Err(invalid("must not contain '/'"));
        }

        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Capitalized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Capitalized {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Capitalized {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for Capitalized {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl FromStr for Capitalized {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Three-part segment name, rendered as `Domain/SubDomain/Action`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentName {
    domain: Capitalized,
    sub_domain: Capitalized,
    action: Capitalized,
}

impl SegmentName {
    pub fn new(domain: Capitalized, sub_domain: Capitalized, action: Capitalized) -> Self {
        Self {
            domain,
            sub_domain,
            action,
        }
    }

    /// Build a segment name from raw parts, validating each one.
    pub fn from_parts(domain: &str, sub_domain: &str, action: &str) -> Result<Self> {
        Ok(Self::new(
            Capitalized::new(domain)?,
            Capitalized::new(sub_domain)?,
            Capitalized::new(action)?,
        ))
    }

    pub fn domain(&self) -> &Capitalized {
        &self.domain
    }

    pub fn sub_domain(&self) -> &Capitalized {
        &self.sub_domain
    }

    pub fn action(&self) -> &Capitalized {
        &self.action
    }
}

impl std::fmt::Display for SegmentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.domain,
            self.sub_domain,
            self.action,
            sep = NAME_SEPARATOR
        )
    }
}

impl FromStr for SegmentName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(NAME_SEPARATOR).collect();
        match parts.as_slice() {
            [domain, sub_domain, action] => Self::from_parts(domain, sub_domain, action),
            _ => Err(Error::InvalidSegmentName(s.to_string())),
        }
    }
}

/// Compose the metric name `"<domain>/<name>"`.
pub fn metric_name(domain: &Capitalized, name: &Capitalized) -> String {
    format!("{}{}{}", domain, NAME_SEPARATOR, name)
}

/// Handle to an ambient transaction owned by an APM agent.
///
/// Clones share the same transaction; ending it is idempotent.
#[derive(Debug, Clone)]
pub struct TransactionHandle {
    inner: Arc<TransactionInner>,
}

#[derive(Debug)]
struct TransactionInner {
    id: Uuid,
    name: String,
    group: String,
    started_at: chrono::DateTime<chrono::Utc>,
    started: Instant,
    ended: AtomicBool,
}

impl TransactionHandle {
    /// Start tracking a new transaction.
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id: Uuid::new_v4(),
                name: name.into(),
                group: group.into(),
                started_at: chrono::Utc::now(),
                started: Instant::now(),
                ended: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// Wall-clock time the transaction started.
    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// Mark the transaction ended.
    ///
    /// Returns the elapsed time on the first call and `None` afterwards.
    pub fn end(&self) -> Option<Duration> {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(self.elapsed())
        }
    }
}

impl PartialEq for TransactionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for TransactionHandle {}

/// Why an adapter ended up with monitoring disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisabledReason {
    /// No license key was configured; the agent was never loaded.
    MissingLicenseKey,
    /// Loading or configuring the agent failed.
    AgentUnavailable,
    /// Monitoring was switched off and the no-op adapter is in use.
    DisabledByConfig,
}

/// Initialization state of a monitoring adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitoringState {
    Uninitialized,
    Disabled(DisabledReason),
    Enabled,
}

impl MonitoringState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, MonitoringState::Enabled)
    }
}

impl std::fmt::Display for MonitoringState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitoringState::Uninitialized => write!(f, "uninitialized"),
            MonitoringState::Disabled(DisabledReason::MissingLicenseKey) => {
                write!(f, "disabled (no license key)")
            }
            MonitoringState::Disabled(DisabledReason::AgentUnavailable) => {
                write!(f, "disabled (agent unavailable)")
            }
            MonitoringState::Disabled(DisabledReason::DisabledByConfig) => {
                write!(f, "disabled (no-op adapter)")
            }
            MonitoringState::Enabled => write!(f, "enabled"),
        }
    }
}

// =============================================================================
// Logger Port
// =============================================================================

/// Port for the leveled logger the monitoring layer reports through.
///
/// All methods are fire-and-forget. `fields` carries structured context
/// such as `{"domain": "User", "name": "Create"}`.
pub trait Logger: Send + Sync {
    fn debug(&self, message: &str, fields: Option<&serde_json::Value>);

    fn info(&self, message: &str);

    fn warn(&self, message: &str);

    fn error(&self, message: &str, fields: Option<&serde_json::Value>);
}

// =============================================================================
// APM Agent Port
// =============================================================================

/// Port for the APM agent the vendor-backed adapter delegates to.
///
/// The segment primitive hands the operation's output back; the background
/// transaction primitive only drives a callback, so callers bridge its result
/// out themselves.
#[async_trait]
pub trait ApmAgent: Send + Sync + 'static {
    /// Tag the whole process with a key/value attribute.
    fn add_custom_attribute(&self, key: &str, value: &str) -> Result<()>;

    /// Get the transaction the current task is running in, if any.
    fn get_transaction(&self) -> Option<TransactionHandle>;

    /// Run `operation` as a named segment of the ambient transaction.
    async fn start_segment<T: Send>(
        &self,
        name: &str,
        is_async: bool,
        operation: BoxFuture<'_, T>,
    ) -> T;

    /// Run `callback` inside a new background transaction.
    async fn start_background_transaction(
        &self,
        name: &str,
        group: &str,
        callback: BoxFuture<'_, ()>,
    );

    /// End the ambient transaction.
    fn end_transaction(&self);

    /// Record a value against a named custom metric.
    fn record_metric(&self, name: &str, value: f64);
}

/// Port for acquiring an APM agent on first use.
#[async_trait]
pub trait AgentLoader: Send + Sync {
    type Agent: ApmAgent;

    /// Load the agent for the given license key.
    async fn load(&self, license_key: &str) -> Result<Self::Agent>;
}

// =============================================================================
// Monitoring Port
// =============================================================================

/// Port for transaction, segment and metric monitoring.
///
/// Every operation passes through when monitoring is not enabled: the
/// caller's operation still runs and its output is returned unchanged.
///
/// # Example
///
/// ```ignore
/// let domain = Capitalized::new("User")?;
/// let name = Capitalized::new("Create")?;
///
/// let user = monitoring
///     .monitor_transaction(&domain, &name, || async { repo.create(input).await })
///     .await?;
/// monitoring.increment(&domain, &name);
/// ```
#[async_trait]
pub trait Monitoring: Send + Sync {
    /// Acquire and configure the underlying agent. Never fails.
    async fn initialize(&self);

    /// Run `operation` as a named segment of the ambient transaction.
    async fn monitor_segment<T, F, Fut>(&self, name: &SegmentName, operation: F) -> T
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send;

    /// Run `operation` as a named background transaction.
    async fn monitor_transaction<T, F, Fut>(
        &self,
        domain: &Capitalized,
        name: &Capitalized,
        operation: F,
    ) -> T
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send;

    /// Record a counter-style metric. `None` records [`DEFAULT_COUNT`].
    fn record_count(&self, domain: &Capitalized, name: &Capitalized, value: Option<f64>);

    /// Record a measurement-style metric in caller-defined units.
    fn record_measurement(&self, domain: &Capitalized, name: &Capitalized, value: f64);

    fn increment(&self, domain: &Capitalized, name: &Capitalized) {
        self.record_count(domain, name, None);
    }
}

// =============================================================================
// Tests
// =============================================================================
