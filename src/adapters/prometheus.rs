//! Prometheus Agent Adapter
//!
//! Implements the `ApmAgent` and `AgentLoader` ports on top of a Prometheus
//! registry, so the vendor-backed monitoring adapter has a concrete
//! destination that can be scraped.
//!
//! The ambient transaction is a task-local: it is visible to everything the
//! transaction callback awaits, and to nothing else.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use prometheus::core::Collector;
use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};
use tracing::{debug, trace};

use crate::domain::ports::{AgentLoader, ApmAgent, TransactionHandle};
use crate::error::{Error, Result};

tokio::task_local! {
    static CURRENT_TRANSACTION: TransactionHandle;
}

/// Buckets for transaction and segment durations, in seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn current_transaction() -> Option<TransactionHandle> {
    CURRENT_TRANSACTION.try_with(TransactionHandle::clone).ok()
}

fn transaction_label(handle: &TransactionHandle) -> String {
    format!("{}/{}", handle.group(), handle.name())
}

/// APM agent that reports into a Prometheus registry.
pub struct PrometheusAgent {
    attributes: RwLock<BTreeMap<String, String>>,
    attribute_info: IntGaugeVec,
    transaction_duration: HistogramVec,
    active_transactions: IntGauge,
    segment_duration: HistogramVec,
    metric_samples: IntCounterVec,
    metric_sum: GaugeVec,
}

impl PrometheusAgent {
    /// Create the agent's collectors and register them with `registry`.
    ///
    /// Fails if the collectors are already registered there.
    pub fn register(registry: &Registry) -> Result<Self> {
        let attribute_info = IntGaugeVec::new(
            Opts::new("apm_custom_attribute", "Custom attributes tagged on the agent"),
            &["key", "value"],
        )?;
        let transaction_duration = HistogramVec::new(
            HistogramOpts::new(
                "apm_transaction_duration_seconds",
                "Duration of background transactions",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["group", "name"],
        )?;
        let active_transactions = IntGauge::new(
            "apm_active_transactions",
            "Background transactions currently running",
        )?;
        let segment_duration = HistogramVec::new(
            HistogramOpts::new(
                "apm_segment_duration_seconds",
                "Duration of segments inside a transaction",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["transaction", "segment"],
        )?;
        let metric_samples = IntCounterVec::new(
            Opts::new(
                "apm_custom_metric_samples_total",
                "Number of values recorded per custom metric",
            ),
            &["metric"],
        )?;
        let metric_sum = GaugeVec::new(
            Opts::new("apm_custom_metric_sum", "Sum of values recorded per custom metric"),
            &["metric"],
        )?;

        let agent = Self {
            attributes: RwLock::new(BTreeMap::new()),
            attribute_info,
            transaction_duration,
            active_transactions,
            segment_duration,
            metric_samples,
            metric_sum,
        };

        // Either every collector is registered or none is.
        for (registered, collector) in agent.collectors().into_iter().enumerate() {
            if let Err(e) = registry.register(collector) {
                for collector in agent.collectors().into_iter().take(registered) {
                    let _ = registry.unregister(collector);
                }
                return Err(e.into());
            }
        }

        Ok(agent)
    }

    fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.attribute_info.clone()),
            Box::new(self.transaction_duration.clone()),
            Box::new(self.active_transactions.clone()),
            Box::new(self.segment_duration.clone()),
            Box::new(self.metric_samples.clone()),
            Box::new(self.metric_sum.clone()),
        ]
    }

    /// Custom attributes tagged so far.
    pub fn attributes(&self) -> BTreeMap<String, String> {
        self.attributes.read().clone()
    }

    /// Number of finished transactions for `group`/`name`.
    pub fn transaction_count(&self, group: &str, name: &str) -> u64 {
        self.transaction_duration
            .with_label_values(&[group, name])
            .get_sample_count()
    }

    /// Number of finished segments named `segment` inside `transaction`
    /// (formatted `group/name`).
    pub fn segment_count(&self, transaction: &str, segment: &str) -> u64 {
        self.segment_duration
            .with_label_values(&[transaction, segment])
            .get_sample_count()
    }

    pub fn active_transactions(&self) -> i64 {
        self.active_transactions.get()
    }

    pub fn metric_samples(&self, metric: &str) -> u64 {
        self.metric_samples.with_label_values(&[metric]).get()
    }

    pub fn metric_sum(&self, metric: &str) -> f64 {
        self.metric_sum.with_label_values(&[metric]).get()
    }

    fn finish(&self, handle: &TransactionHandle) {
        if let Some(elapsed) = handle.end() {
            self.transaction_duration
                .with_label_values(&[handle.group(), handle.name()])
                .observe(elapsed.as_secs_f64());
            self.active_transactions.dec();
            trace!(
                transaction = %handle.id(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Transaction finished"
            );
        }
    }
}

impl std::fmt::Debug for PrometheusAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusAgent")
            .field("attributes", &*self.attributes.read())
            .field("active_transactions", &self.active_transactions.get())
            .finish()
    }
}

#[async_trait]
impl ApmAgent for PrometheusAgent {
    fn add_custom_attribute(&self, key: &str, value: &str) -> Result<()> {
        self.attribute_info
            .get_metric_with_label_values(&[key, value])?
            .set(1);

        let previous = self
            .attributes
            .write()
            .insert(key.to_string(), value.to_string());
        if let Some(previous) = previous.filter(|p| p != value) {
            let _ = self.attribute_info.remove_label_values(&[key, previous.as_str()]);
        }
        Ok(())
    }

    fn get_transaction(&self) -> Option<TransactionHandle> {
        current_transaction()
    }

    // Segments outside a transaction run unrecorded.
    async fn start_segment<T: Send>(
        &self,
        name: &str,
        _is_async: bool,
        operation: BoxFuture<'_, T>,
    ) -> T {
        let Some(transaction) = current_transaction() else {
            return operation.await;
        };

        let started = Instant::now();
        let output = operation.await;
        self.segment_duration
            .with_label_values(&[transaction_label(&transaction).as_str(), name])
            .observe(started.elapsed().as_secs_f64());
        output
    }

    async fn start_background_transaction(
        &self,
        name: &str,
        group: &str,
        callback: BoxFuture<'_, ()>,
    ) {
        let transaction = TransactionHandle::new(name, group);
        self.active_transactions.inc();
        trace!(transaction = %transaction.id(), group, name, "Transaction started");

        CURRENT_TRANSACTION
            .scope(transaction.clone(), callback)
            .await;

        // No-op when the callback already ended it.
        self.finish(&transaction);
    }

    fn end_transaction(&self) {
        match current_transaction() {
            Some(transaction) => self.finish(&transaction),
            None => debug!("end_transaction called outside a transaction"),
        }
    }

    fn record_metric(&self, name: &str, value: f64) {
        self.metric_samples.with_label_values(&[name]).inc();
        self.metric_sum.with_label_values(&[name]).add(value);
    }
}

/// Loader that registers a [`PrometheusAgent`] with a registry.
#[derive(Clone, Default)]
pub struct PrometheusAgentLoader {
    registry: Registry,
}

impl PrometheusAgentLoader {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Registry the agent reports into.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for PrometheusAgentLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusAgentLoader").finish_non_exhaustive()
    }
}

#[async_trait]
impl AgentLoader for PrometheusAgentLoader {
    type Agent = PrometheusAgent;

    async fn load(&self, license_key: &str) -> Result<PrometheusAgent> {
        if license_key.trim().is_empty() {
            return Err(Error::AgentLoad("license key is blank".to_string()));
        }
        debug!("Registering APM collectors");
        PrometheusAgent::register(&self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use prometheus::TextEncoder;

    fn agent() -> (PrometheusAgent, Registry) {
        let registry = Registry::new();
        let agent = PrometheusAgent::register(&registry).unwrap();
        (agent, registry)
    }

    #[test]
    fn test_custom_attributes() {
        let (agent, registry) = agent();

        agent.add_custom_attribute("environment", "staging").unwrap();
        agent.add_custom_attribute("environment", "production").unwrap();

        assert_eq!(
            agent.attributes().get("environment").map(String::as_str),
            Some("production")
        );
        let exposition = TextEncoder::new()
            .encode_to_string(&registry.gather())
            .unwrap();
        assert!(exposition.contains(r#"value="production""#));
        assert!(!exposition.contains(r#"value="staging""#));
    }

    #[test]
    fn test_failed_registration_is_rolled_back() {
        let registry = Registry::new();
        let conflicting = IntGauge::new("apm_segment_duration_seconds", "conflict").unwrap();
        registry.register(Box::new(conflicting.clone())).unwrap();

        let result = PrometheusAgent::register(&registry);
        assert_matches!(result, Err(Error::Metrics(_)));

        // Only the conflicting collector is left behind
        registry.unregister(Box::new(conflicting)).unwrap();
        assert!(PrometheusAgent::register(&registry).is_ok());
    }

    #[test]
    fn test_record_metric_accumulates() {
        let (agent, _registry) = agent();

        agent.record_metric("Performance/ResponseTime", 150.0);
        agent.record_metric("Performance/ResponseTime", 50.0);

        assert_eq!(agent.metric_samples("Performance/ResponseTime"), 2);
        assert_eq!(agent.metric_sum("Performance/ResponseTime"), 200.0);
    }

    #[tokio::test]
    async fn test_transaction_scope() {
        let (agent, _registry) = agent();
        assert!(agent.get_transaction().is_none());

        agent
            .start_background_transaction(
                "Create",
                "User",
                Box::pin(async {
                    let handle = agent.get_transaction().unwrap();
                    assert_eq!(handle.name(), "Create");
                    assert_eq!(agent.active_transactions(), 1);

                    agent
                        .start_segment("Database/User/Insert", true, Box::pin(async {}))
                        .await;
                    agent.end_transaction();
                }),
            )
            .await;

        assert!(agent.get_transaction().is_none());
        assert_eq!(agent.active_transactions(), 0);
        assert_eq!(agent.transaction_count("User", "Create"), 1);
        assert_eq!(agent.segment_count("User/Create", "Database/User/Insert"), 1);
    }

    #[tokio::test]
    async fn test_transaction_finished_when_callback_does_not_end_it() {
        let (agent, _registry) = agent();

        agent
            .start_background_transaction("Sync", "Job", Box::pin(async {}))
            .await;

        assert_eq!(agent.transaction_count("Job", "Sync"), 1);
        assert_eq!(agent.active_transactions(), 0);
    }

    #[tokio::test]
    async fn test_segment_outside_transaction_unrecorded() {
        let (agent, _registry) = agent();

        let out = agent
            .start_segment("Cache/Session/Load", true, Box::pin(async { 5 }))
            .await;

        assert_eq!(out, 5);
        agent.end_transaction();
        assert_eq!(agent.active_transactions(), 0);
    }

    #[tokio::test]
    async fn test_loader_rejects_double_registration() {
        let loader = PrometheusAgentLoader::new(Registry::new());

        assert!(loader.load("key").await.is_ok());
        assert_matches!(loader.load("key").await, Err(Error::Metrics(_)));
    }

    #[tokio::test]
    async fn test_loader_rejects_blank_key() {
        let loader = PrometheusAgentLoader::default();
        assert_matches!(loader.load("  ").await, Err(Error::AgentLoad(_)));
    }
}
