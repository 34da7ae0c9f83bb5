//! Adapter selection
//!
//! Picks the vendor-backed or no-op adapter at runtime and exposes both
//! through the `Monitoring` port.

use std::future::Future;

use async_trait::async_trait;

use super::apm::ApmMonitoringAdapter;
use super::noop::NoopMonitoring;
use crate::domain::config::MonitoringConfig;
use crate::domain::ports::{
    AgentLoader, Capitalized, DisabledReason, Monitoring, MonitoringState, SegmentName,
};

/// Either monitoring adapter behind one concrete type.
#[derive(Debug)]
pub enum MonitoringAdapter<L: AgentLoader> {
    Apm(ApmMonitoringAdapter<L>),
    Noop(NoopMonitoring),
}

impl<L: AgentLoader> MonitoringAdapter<L> {
    /// Build the vendor-backed adapter when `enabled`, the no-op one otherwise.
    pub fn from_config(config: MonitoringConfig, loader: L, enabled: bool) -> Self {
        if enabled {
            Self::Apm(ApmMonitoringAdapter::new(config, loader))
        } else {
            Self::Noop(NoopMonitoring::from_config(&config))
        }
    }

    pub fn state(&self) -> MonitoringState {
        match self {
            Self::Apm(adapter) => adapter.state(),
            Self::Noop(_) => MonitoringState::Disabled(DisabledReason::DisabledByConfig),
        }
    }
}

#[async_trait]
impl<L: AgentLoader> Monitoring for MonitoringAdapter<L> {
    async fn initialize(&self) {
        match self {
            Self::Apm(adapter) => adapter.initialize().await,
            Self::Noop(adapter) => adapter.initialize().await,
        }
    }

    async fn monitor_segment<T, F, Fut>(&self, name: &SegmentName, operation: F) -> T
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        match self {
            Self::Apm(adapter) => adapter.monitor_segment(name, operation).await,
            Self::Noop(adapter) => adapter.monitor_segment(name, operation).await,
        }
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
        match self {
            Self::Apm(adapter) => adapter.monitor_transaction(domain, name, operation).await,
            Self::Noop(adapter) => adapter.monitor_transaction(domain, name, operation).await,
        }
    }

    fn record_count(&self, domain: &Capitalized, name: &Capitalized, value: Option<f64>) {
        match self {
            Self::Apm(adapter) => adapter.record_count(domain, name, value),
            Self::Noop(adapter) => adapter.record_count(domain, name, value),
        }
    }

    fn record_measurement(&self, domain: &Capitalized, name: &Capitalized, value: f64) {
        match self {
            Self::Apm(adapter) => adapter.record_measurement(domain, name, value),
            Self::Noop(adapter) => adapter.record_measurement(domain, name, value),
        }
    }
}
