//! APM Monitoring Adapter
//!
//! Implements the `Monitoring` port by delegating to an `ApmAgent`.
//!
//! # State machine
//!
//! ```text
//!                 initialize()
//! Uninitialized ──────────────┬──▶ Enabled    (agent loaded and tagged)
//!                             └──▶ Disabled   (no license key, or load failed)
//! ```
//!
//! Both end states are final for the lifetime of the adapter. While not
//! enabled every operation runs the caller's operation and nothing else.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{oneshot, OnceCell};

use super::logging::NoopLogger;
use crate::domain::config::MonitoringConfig;
use crate::domain::ports::{
    metric_name, AgentLoader, ApmAgent, Capitalized, DisabledReason, Logger, Monitoring,
    MonitoringState, SegmentName, DEFAULT_COUNT,
};
use crate::error::Result;

/// Custom attribute the environment is tagged under.
pub const ENVIRONMENT_ATTRIBUTE: &str = "environment";

enum AgentState<A> {
    Disabled(DisabledReason),
    Enabled(A),
}

/// Monitoring adapter backed by an APM agent.
///
/// The agent is obtained from the loader on `initialize()`, at most once.
pub struct ApmMonitoringAdapter<L: AgentLoader> {
    environment: String,
    license_key: Option<String>,
    logger: Arc<dyn Logger>,
    loader: L,
    state: OnceCell<AgentState<L::Agent>>,
}

impl<L: AgentLoader> ApmMonitoringAdapter<L> {
    /// Create an uninitialized adapter.
    pub fn new(config: MonitoringConfig, loader: L) -> Self {
        let license_key = config.license_key().map(str::to_string);
        let logger = config
            .logger
            .unwrap_or_else(|| Arc::new(NoopLogger) as Arc<dyn Logger>);

        Self {
            environment: config.environment,
            license_key,
            logger,
            loader,
            state: OnceCell::new(),
        }
    }

    pub fn state(&self) -> MonitoringState {
        match self.state.get() {
            None => MonitoringState::Uninitialized,
            Some(AgentState::Disabled(reason)) => MonitoringState::Disabled(*reason),
            Some(AgentState::Enabled(_)) => MonitoringState::Enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state().is_enabled()
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The loaded agent, once monitoring is enabled.
    pub fn agent(&self) -> Option<&L::Agent> {
        match self.state.get() {
            Some(AgentState::Enabled(agent)) => Some(agent),
            _ => None,
        }
    }

    async fn load_agent(&self) -> AgentState<L::Agent> {
        let Some(license_key) = self.license_key.as_deref() else {
            self.logger
                .warn("APM license key not configured, monitoring disabled");
            return AgentState::Disabled(DisabledReason::MissingLicenseKey);
        };

        let failure = match AssertUnwindSafe(self.connect(license_key))
            .catch_unwind()
            .await
        {
            Ok(Ok(agent)) => {
                self.logger.info(&format!(
                    "APM monitoring enabled for environment '{}'",
                    self.environment
                ));
                return AgentState::Enabled(agent);
            }
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };

        self.logger.error(
            "Failed to initialize APM agent, monitoring disabled",
            Some(&json!({ "error": failure })),
        );
        AgentState::Disabled(DisabledReason::AgentUnavailable)
    }

    async fn connect(&self, license_key: &str) -> Result<L::Agent> {
        let agent = self.loader.load(license_key).await?;
        agent.add_custom_attribute(ENVIRONMENT_ATTRIBUTE, &self.environment)?;
        Ok(agent)
    }

    fn record_metric(
        &self,
        agent: &L::Agent,
        message: &str,
        domain: &Capitalized,
        name: &Capitalized,
        value: f64,
    ) {
        agent.record_metric(&metric_name(domain, name), value);
        self.logger.debug(
            message,
            Some(&json!({
                "domain": domain.as_str(),
                "name": name.as_str(),
                "value": value,
            })),
        );
    }
}

impl<L: AgentLoader> std::fmt::Debug for ApmMonitoringAdapter<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApmMonitoringAdapter")
            .field("environment", &self.environment)
            .field("state", &self.state())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Logs segment duration when dropped, including on panic and cancellation.
struct SegmentTimer<'a> {
    logger: &'a dyn Logger,
    segment: &'a str,
    started: Instant,
}

impl<'a> SegmentTimer<'a> {
    fn start(logger: &'a dyn Logger, segment: &'a str) -> Self {
        Self {
            logger,
            segment,
            started: Instant::now(),
        }
    }
}

impl Drop for SegmentTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        self.logger.debug(
            "Segment completed",
            Some(&json!({
                "segment": self.segment,
                "duration_ms": elapsed.as_secs_f64() * 1000.0,
            })),
        );
    }
}

/// Ends the ambient transaction when dropped.
struct TransactionEnd<'a, A: ApmAgent> {
    agent: &'a A,
    logger: &'a dyn Logger,
    fields: &'a Value,
}

impl<A: ApmAgent> Drop for TransactionEnd<'_, A> {
    fn drop(&mut self) {
        self.agent.end_transaction();
        self.logger.debug("Transaction ended", Some(self.fields));
    }
}

#[async_trait]
impl<L: AgentLoader> Monitoring for ApmMonitoringAdapter<L> {
    async fn initialize(&self) {
        self.state.get_or_init(|| self.load_agent()).await;
    }

    async fn monitor_segment<T, F, Fut>(&self, name: &SegmentName, operation: F) -> T
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        let Some(agent) = self.agent() else {
            return operation().await;
        };

        let segment = name.to_string();
        let _timer = SegmentTimer::start(self.logger.as_ref(), &segment);

        if agent.get_transaction().is_none() {
            self.logger.error(
                "No parent transaction found for segment",
                Some(&json!({ "segment": &segment })),
            );
        }

        agent
            .start_segment(&segment, true, Box::pin(operation()))
            .await
    }

    async fn monitor_transaction<T, F, Fut>(
        &self,
        domain: &Capitalized,
        name: &Capitalized,
        operation: F,
    ) -> T
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        let Some(agent) = self.agent() else {
            return operation().await;
        };

        let logger = self.logger.as_ref();
        let fields = json!({ "domain": domain.as_str(), "name": name.as_str() });
        let pending = Mutex::new(Some(operation));
        let (settle, settled) = oneshot::channel();

        let callback = async {
            let operation = pending.lock().take();
            let Some(operation) = operation else {
                return;
            };

            let _end = TransactionEnd {
                agent,
                logger,
                fields: &fields,
            };
            logger.debug("Transaction started", Some(&fields));
            // Agents may isolate callback panics, so the panic travels back
            // through the channel instead.
            let outcome = AssertUnwindSafe(operation()).catch_unwind().await;
            let _ = settle.send(outcome);
        };

        agent
            .start_background_transaction(name.as_str(), domain.as_str(), Box::pin(callback))
            .await;

        if let Ok(outcome) = settled.await {
            return outcome.unwrap_or_else(|payload| panic::resume_unwind(payload));
        }

        match pending.into_inner() {
            Some(operation) => {
                logger.error("APM agent did not run the transaction callback", Some(&fields));
                operation().await
            }
            None => panic!(
                "APM agent dropped the transaction callback for {}/{} before it completed",
                domain, name
            ),
        }
    }

    fn record_count(&self, domain: &Capitalized, name: &Capitalized, value: Option<f64>) {
        if let Some(agent) = self.agent() {
            let value = value.unwrap_or(DEFAULT_COUNT);
            self.record_metric(agent, "Count recorded", domain, name, value);
        }
    }

    fn record_measurement(&self, domain: &Capitalized, name: &Capitalized, value: f64) {
        if let Some(agent) = self.agent() {
            self.record_metric(agent, "Measurement recorded", domain, name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::logging::{InMemoryLogCollector, LogLevel};
    use crate::adapters::recording::{AgentCall, RecordingAgent, RecordingAgentLoader};

    fn name(value: &str) -> Capitalized {
        Capitalized::new(value).unwrap()
    }

    fn adapter(
        license_key: Option<&str>,
        loader: RecordingAgentLoader,
    ) -> (ApmMonitoringAdapter<RecordingAgentLoader>, Arc<InMemoryLogCollector>) {
        let logs = Arc::new(InMemoryLogCollector::new());
        let mut config = MonitoringConfig::new("test").with_logger(logs.clone());
        if let Some(key) = license_key {
            config = config.with_license_key(key);
        }
        (ApmMonitoringAdapter::new(config, loader), logs)
    }

    #[tokio::test]
    async fn test_starts_uninitialized() {
        let (adapter, logs) = adapter(Some("key"), RecordingAgentLoader::default());
        assert_eq!(adapter.state(), MonitoringState::Uninitialized);
        assert!(adapter.agent().is_none());
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn test_missing_license_key_disables() {
        let loader = RecordingAgentLoader::default();
        let (adapter, logs) = adapter(None, loader.clone());

        adapter.initialize().await;

        assert_eq!(
            adapter.state(),
            MonitoringState::Disabled(DisabledReason::MissingLicenseKey)
        );
        assert_eq!(loader.load_count(), 0);
        assert_eq!(logs.count_matching(LogLevel::Warn, "license key"), 1);
    }

    #[tokio::test]
    async fn test_empty_license_key_disables() {
        let loader = RecordingAgentLoader::default();
        let (adapter, _logs) = adapter(Some(""), loader.clone());

        adapter.initialize().await;

        assert_eq!(
            adapter.state(),
            MonitoringState::Disabled(DisabledReason::MissingLicenseKey)
        );
        assert_eq!(loader.load_count(), 0);
    }

    #[tokio::test]
    async fn test_initialize_tags_environment() {
        let loader = RecordingAgentLoader::default();
        let agent = loader.agent();
        let (adapter, logs) = adapter(Some("key"), loader.clone());

        adapter.initialize().await;

        assert!(adapter.is_enabled());
        assert_eq!(
            agent.calls(),
            vec![AgentCall::AddCustomAttribute {
                key: ENVIRONMENT_ATTRIBUTE.to_string(),
                value: "test".to_string(),
            }]
        );
        assert_eq!(logs.records_at(LogLevel::Info).len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let loader = RecordingAgentLoader::default();
        let (adapter, _logs) = adapter(Some("key"), loader.clone());

        adapter.initialize().await;
        adapter.initialize().await;

        assert_eq!(loader.load_count(), 1);
        assert_eq!(loader.agent().attribute_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_initialize_loads_once() {
        let loader = RecordingAgentLoader::default();
        let (adapter, _logs) = adapter(Some("key"), loader.clone());

        tokio::join!(adapter.initialize(), adapter.initialize(), adapter.initialize());

        assert_eq!(loader.load_count(), 1);
        assert!(adapter.is_enabled());
    }

    #[tokio::test]
    async fn test_load_failure_disables() {
        let loader = RecordingAgentLoader::failing();
        let (adapter, logs) = adapter(Some("key"), loader.clone());

        adapter.initialize().await;

        assert_eq!(
            adapter.state(),
            MonitoringState::Disabled(DisabledReason::AgentUnavailable)
        );
        let errors = logs.records_at(LogLevel::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].fields.as_ref().unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("load"));
    }

    #[tokio::test]
    async fn test_load_panic_disables() {
        let loader = RecordingAgentLoader::panicking();
        let (adapter, logs) = adapter(Some("key"), loader);

        adapter.initialize().await;

        assert_eq!(
            adapter.state(),
            MonitoringState::Disabled(DisabledReason::AgentUnavailable)
        );
        let errors = logs.records_at(LogLevel::Error);
        assert!(errors[0].fields.as_ref().unwrap()["error"]
            .as_str()
            .unwrap()
            .starts_with("panic"));
    }

    #[tokio::test]
    async fn test_segment_logs_duration_once() {
        let loader = RecordingAgentLoader::new(RecordingAgent::with_transaction());
        let (adapter, logs) = adapter(Some("key"), loader.clone());
        adapter.initialize().await;

        let segment = SegmentName::from_parts("Database", "User", "Find").unwrap();
        let result = adapter.monitor_segment(&segment, || async { 42 }).await;

        assert_eq!(result, 42);
        assert_eq!(logs.count_matching(LogLevel::Debug, "Segment completed"), 1);
        assert_eq!(logs.records_at(LogLevel::Error).len(), 0);
        assert!(loader.agent().calls().contains(&AgentCall::StartSegment {
            name: "Database/User/Find".to_string(),
            is_async: true,
        }));
    }

    #[tokio::test]
    async fn test_segment_without_transaction_still_runs() {
        let loader = RecordingAgentLoader::default();
        let (adapter, logs) = adapter(Some("key"), loader.clone());
        adapter.initialize().await;

        let segment = SegmentName::from_parts("Cache", "Session", "Load").unwrap();
        let result = adapter.monitor_segment(&segment, || async { "hit" }).await;

        assert_eq!(result, "hit");
        let errors = logs.records_at(LogLevel::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].fields,
            Some(json!({ "segment": "Cache/Session/Load" }))
        );
        assert_eq!(loader.agent().segment_calls(), 1);
    }

    #[tokio::test]
    async fn test_transaction_passes_error_through() {
        let loader = RecordingAgentLoader::default();
        let (adapter, logs) = adapter(Some("key"), loader.clone());
        adapter.initialize().await;

        let result: std::result::Result<u32, &str> = adapter
            .monitor_transaction(&name("User"), &name("Create"), || async { Err("duplicate") })
            .await;

        assert_eq!(result, Err("duplicate"));
        assert_eq!(loader.agent().end_transaction_calls(), 1);
        assert_eq!(logs.count_matching(LogLevel::Debug, "Transaction started"), 1);
        assert_eq!(logs.count_matching(LogLevel::Debug, "Transaction ended"), 1);
    }

    #[tokio::test]
    async fn test_transaction_callback_skipped_falls_back() {
        let loader = RecordingAgentLoader::new(RecordingAgent::skipping_callbacks());
        let (adapter, logs) = adapter(Some("key"), loader.clone());
        adapter.initialize().await;

        let result = adapter
            .monitor_transaction(&name("Report"), &name("Build"), || async { 7 })
            .await;

        assert_eq!(result, 7);
        assert_eq!(
            logs.count_matching(LogLevel::Error, "did not run the transaction callback"),
            1
        );
        assert_eq!(loader.agent().end_transaction_calls(), 0);
    }

    #[tokio::test]
    async fn test_transaction_panic_survives_isolating_agent() {
        let loader = RecordingAgentLoader::new(RecordingAgent::isolating_panics());
        let (adapter, logs) = adapter(Some("key"), loader.clone());
        adapter.initialize().await;

        let result: std::thread::Result<()> = AssertUnwindSafe(adapter.monitor_transaction(
            &name("Report"),
            &name("Build"),
            || async { panic!("report generation failed") },
        ))
        .catch_unwind()
        .await;

        let payload = result.unwrap_err();
        assert_eq!(
            payload.downcast_ref::<&str>(),
            Some(&"report generation failed")
        );
        assert_eq!(loader.agent().end_transaction_calls(), 1);
        assert_eq!(logs.count_matching(LogLevel::Debug, "Transaction ended"), 1);
        assert_eq!(logs.records_at(LogLevel::Error).len(), 0);
    }

    #[tokio::test]
    async fn test_record_count_defaults_to_one() {
        let loader = RecordingAgentLoader::default();
        let (adapter, logs) = adapter(Some("key"), loader.clone());
        adapter.initialize().await;

        adapter.record_count(&name("User"), &name("Login"), None);
        adapter.record_count(&name("User"), &name("Login"), Some(5.0));

        assert_eq!(
            loader.agent().metrics(),
            vec![
                ("User/Login".to_string(), 1.0),
                ("User/Login".to_string(), 5.0)
            ]
        );
        assert_eq!(logs.count_matching(LogLevel::Debug, "Count recorded"), 2);
    }

    #[tokio::test]
    async fn test_disabled_operations_are_silent() {
        let loader = RecordingAgentLoader::default();
        let (adapter, logs) = adapter(None, loader.clone());
        adapter.initialize().await;
        logs.clear();

        let segment = SegmentName::from_parts("Database", "User", "Find").unwrap();
        assert_eq!(adapter.monitor_segment(&segment, || async { 1 }).await, 1);
        assert_eq!(
            adapter
                .monitor_transaction(&name("User"), &name("Create"), || async { 2 })
                .await,
            2
        );
        adapter.record_count(&name("User"), &name("Login"), None);
        adapter.record_measurement(&name("Performance"), &name("ResponseTime"), 150.0);

        assert!(logs.is_empty());
        assert!(loader.agent().calls().is_empty());
    }

    #[tokio::test]
    async fn test_uninitialized_operations_pass_through() {
        let loader = RecordingAgentLoader::default();
        let (adapter, logs) = adapter(Some("key"), loader.clone());

        let value = adapter
            .monitor_transaction(&name("User"), &name("Create"), || async { "created" })
            .await;
        adapter.increment(&name("User"), &name("Create"));

        assert_eq!(value, "created");
        assert!(logs.is_empty());
        assert_eq!(loader.load_count(), 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "panic: boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "panic: bang");

        let payload: Box<dyn Any + Send> = Box::new(3_u8);
        assert_eq!(panic_message(payload.as_ref()), "panic with non-string payload");
    }
}
