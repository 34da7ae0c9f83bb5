//! No-op Monitoring Adapter
//!
//! Implements the `Monitoring` port without reporting anything.

use std::future::Future;

use async_trait::async_trait;

use crate::domain::config::MonitoringConfig;
use crate::domain::ports::{Capitalized, Logger, Monitoring, SegmentName};

/// Monitoring adapter that only runs the caller's operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitoring;

impl NoopMonitoring {
    pub fn new() -> Self {
        Self
    }

    /// Create the adapter, noting on `logger` that monitoring is off.
    pub fn with_logger(logger: &dyn Logger) -> Self {
        logger.info("APM monitoring disabled, using no-op adapter");
        Self
    }

    pub fn from_config(config: &MonitoringConfig) -> Self {
        match config.logger.as_deref() {
            Some(logger) => Self::with_logger(logger),
            None => Self::new(),
        }
    }
}

#[async_trait]
impl Monitoring for NoopMonitoring {
    async fn initialize(&self) {}

    async fn monitor_segment<T, F, Fut>(&self, _name: &SegmentName, operation: F) -> T
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        operation().await
    }

    async fn monitor_transaction<T, F, Fut>(
        &self,
        _domain: &Capitalized,
        _name: &Capitalized,
        operation: F,
    ) -> T
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        operation().await
    }

    fn record_count(&self, _domain: &Capitalized, _name: &Capitalized, _value: Option<f64>) {}

    fn record_measurement(&self, _domain: &Capitalized, _name: &Capitalized, _value: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::logging::{InMemoryLogCollector, LogLevel};
    use std::sync::Arc;

    #[test]
    fn test_noop_passes_through() {
        let monitoring = NoopMonitoring::new();
        let segment = SegmentName::from_parts("Database", "User", "Find").unwrap();
        let domain = Capitalized::new("User").unwrap();
        let name = Capitalized::new("Create").unwrap();

        tokio_test::block_on(async {
            monitoring.initialize().await;
            assert_eq!(monitoring.monitor_segment(&segment, || async { 1 }).await, 1);

            let result: Result<(), String> = monitoring
                .monitor_transaction(&domain, &name, || async { Err("boom".to_string()) })
                .await;
            assert_eq!(result, Err("boom".to_string()));
        });

        monitoring.record_count(&domain, &name, None);
        monitoring.record_measurement(&domain, &name, 3.5);
    }

    #[test]
    fn test_from_config_logs_once() {
        let logs = Arc::new(InMemoryLogCollector::new());
        let config = MonitoringConfig::new("test").with_logger(logs.clone());

        let _monitoring = NoopMonitoring::from_config(&config);

        assert_eq!(logs.len(), 1);
        assert_eq!(logs.records_at(LogLevel::Info).len(), 1);
    }

    #[test]
    fn test_from_config_without_logger() {
        let config = MonitoringConfig::new("test");
        let _monitoring = NoopMonitoring::from_config(&config);
    }
}
