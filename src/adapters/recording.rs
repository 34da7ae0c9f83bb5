//! Recording Agent Adapter
//!
//! In-memory `ApmAgent` and `AgentLoader` implementations that record every
//! call, for tests and for exercising the monitoring port without a backend.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;

use crate::domain::ports::{AgentLoader, ApmAgent, TransactionHandle};
use crate::error::{Error, Result};

/// A call received by a [`RecordingAgent`].
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    AddCustomAttribute { key: String, value: String },
    GetTransaction,
    StartSegment { name: String, is_async: bool },
    StartBackgroundTransaction { name: String, group: String },
    EndTransaction,
    RecordMetric { name: String, value: f64 },
}

#[derive(Debug, Default)]
struct RecorderState {
    calls: RwLock<Vec<AgentCall>>,
    current: RwLock<Option<TransactionHandle>>,
    ambient_transaction: bool,
    fail_attributes: bool,
    skip_callbacks: bool,
    isolate_panics: bool,
}

/// Agent that records calls in memory.
///
/// Clones share the same recording. The ambient transaction is a single
/// slot, so transactions on one agent are meant to run one at a time.
#[derive(Debug, Clone, Default)]
pub struct RecordingAgent {
    state: Arc<RecorderState>,
}

impl RecordingAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agent that always reports an ambient transaction.
    pub fn with_transaction() -> Self {
        Self::build(|s| s.ambient_transaction = true)
    }

    /// Agent whose `add_custom_attribute` fails.
    pub fn failing_attributes() -> Self {
        Self::build(|s| s.fail_attributes = true)
    }

    /// Agent that never invokes transaction callbacks.
    pub fn skipping_callbacks() -> Self {
        Self::build(|s| s.skip_callbacks = true)
    }

    /// Agent that catches panics raised inside transaction callbacks.
    pub fn isolating_panics() -> Self {
        Self::build(|s| s.isolate_panics = true)
    }

    fn build(configure: impl FnOnce(&mut RecorderState)) -> Self {
        let mut state = RecorderState::default();
        configure(&mut state);
        Self {
            state: Arc::new(state),
        }
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<AgentCall> {
        self.state.calls.read().clone()
    }

    /// Recorded `(metric, value)` pairs, in order.
    pub fn metrics(&self) -> Vec<(String, f64)> {
        self.state
            .calls
            .read()
            .iter()
            .filter_map(|call| match call {
                AgentCall::RecordMetric { name, value } => Some((name.clone(), *value)),
                _ => None,
            })
            .collect()
    }

    pub fn attribute_calls(&self) -> usize {
        self.count(|c| matches!(c, AgentCall::AddCustomAttribute { .. }))
    }

    pub fn segment_calls(&self) -> usize {
        self.count(|c| matches!(c, AgentCall::StartSegment { .. }))
    }

    pub fn transaction_calls(&self) -> usize {
        self.count(|c| matches!(c, AgentCall::StartBackgroundTransaction { .. }))
    }

    pub fn end_transaction_calls(&self) -> usize {
        self.count(|c| matches!(c, AgentCall::EndTransaction))
    }

    fn count(&self, predicate: impl Fn(&AgentCall) -> bool) -> usize {
        self.state.calls.read().iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: AgentCall) {
        self.state.calls.write().push(call);
    }
}

#[async_trait]
impl ApmAgent for RecordingAgent {
    fn add_custom_attribute(&self, key: &str, value: &str) -> Result<()> {
        self.record(AgentCall::AddCustomAttribute {
            key: key.to_string(),
            value: value.to_string(),
        });
        if self.state.fail_attributes {
            return Err(Error::AgentConfiguration(format!(
                "attribute '{}' rejected",
                key
            )));
        }
        Ok(())
    }

    fn get_transaction(&self) -> Option<TransactionHandle> {
        self.record(AgentCall::GetTransaction);
        let current = self.state.current.read().clone();
        match current {
            Some(handle) => Some(handle),
            None if self.state.ambient_transaction => {
                Some(TransactionHandle::new("Ambient", "Recording"))
            }
            None => None,
        }
    }

    async fn start_segment<T: Send>(
        &self,
        name: &str,
        is_async: bool,
        operation: BoxFuture<'_, T>,
    ) -> T {
        self.record(AgentCall::StartSegment {
            name: name.to_string(),
            is_async,
        });
        operation.await
    }

    async fn start_background_transaction(
        &self,
        name: &str,
        group: &str,
        callback: BoxFuture<'_, ()>,
    ) {
        self.record(AgentCall::StartBackgroundTransaction {
            name: name.to_string(),
            group: group.to_string(),
        });
        if self.state.skip_callbacks {
            return;
        }

        let handle = TransactionHandle::new(name, group);
        let previous = self.state.current.write().replace(handle);
        let _restore = RestoreCurrent {
            slot: &self.state.current,
            previous,
        };

        if self.state.isolate_panics {
            let _ = AssertUnwindSafe(callback).catch_unwind().await;
        } else {
            callback.await;
        }
    }

    fn end_transaction(&self) {
        self.record(AgentCall::EndTransaction);
        if let Some(handle) = self.state.current.read().as_ref() {
            handle.end();
        }
    }

    fn record_metric(&self, name: &str, value: f64) {
        self.record(AgentCall::RecordMetric {
            name: name.to_string(),
            value,
        });
    }
}

/// Puts the previous ambient transaction back, including on panic.
struct RestoreCurrent<'a> {
    slot: &'a RwLock<Option<TransactionHandle>>,
    previous: Option<TransactionHandle>,
}

impl Drop for RestoreCurrent<'_> {
    fn drop(&mut self) {
        *self.slot.write() = self.previous.take();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadBehavior {
    Succeed,
    Fail,
    Panic,
}

/// Loader handing out a shared [`RecordingAgent`].
#[derive(Debug, Clone)]
pub struct RecordingAgentLoader {
    agent: RecordingAgent,
    behavior: LoadBehavior,
    loads: Arc<AtomicUsize>,
}

impl Default for RecordingAgentLoader {
    fn default() -> Self {
        Self::new(RecordingAgent::default())
    }
}

impl RecordingAgentLoader {
    /// Loader that succeeds with the given agent.
    pub fn new(agent: RecordingAgent) -> Self {
        Self {
            agent,
            behavior: LoadBehavior::Succeed,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Loader whose `load` returns an error.
    pub fn failing() -> Self {
        Self {
            behavior: LoadBehavior::Fail,
            ..Self::default()
        }
    }

    /// Loader whose `load` panics.
    pub fn panicking() -> Self {
        Self {
            behavior: LoadBehavior::Panic,
            ..Self::default()
        }
    }

    /// The agent handed out on a successful load.
    pub fn agent(&self) -> RecordingAgent {
        self.agent.clone()
    }

    /// Number of times `load` was called.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentLoader for RecordingAgentLoader {
    type Agent = RecordingAgent;

    async fn load(&self, _license_key: &str) -> Result<RecordingAgent> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            LoadBehavior::Succeed => Ok(self.agent.clone()),
            LoadBehavior::Fail => Err(Error::AgentLoad("recording agent unavailable".to_string())),
            LoadBehavior::Panic => panic!("recording agent crashed while loading"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_in_order() {
        let agent = RecordingAgent::new();

        agent.add_custom_attribute("environment", "test").unwrap();
        agent.record_metric("User/Login", 1.0);
        let out = agent
            .start_segment("A/B/C", true, Box::pin(async { 3 }))
            .await;

        assert_eq!(out, 3);
        assert_eq!(
            agent.calls(),
            vec![
                AgentCall::AddCustomAttribute {
                    key: "environment".to_string(),
                    value: "test".to_string(),
                },
                AgentCall::RecordMetric {
                    name: "User/Login".to_string(),
                    value: 1.0,
                },
                AgentCall::StartSegment {
                    name: "A/B/C".to_string(),
                    is_async: true,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_transaction_is_ambient_inside_callback() {
        let agent = RecordingAgent::new();
        assert!(agent.get_transaction().is_none());

        let inner = agent.clone();
        agent
            .start_background_transaction(
                "Create",
                "User",
                Box::pin(async move {
                    let handle = inner.get_transaction().unwrap();
                    assert_eq!(handle.name(), "Create");
                    inner.end_transaction();
                    assert!(handle.is_ended());
                }),
            )
            .await;

        assert!(agent.get_transaction().is_none());
        assert_eq!(agent.end_transaction_calls(), 1);
    }

    #[tokio::test]
    async fn test_transaction_restored_after_callback_panic() {
        let agent = RecordingAgent::new();

        let result = AssertUnwindSafe(agent.start_background_transaction(
            "Create",
            "User",
            Box::pin(async { panic!("callback failed") }),
        ))
        .catch_unwind()
        .await;

        assert!(result.is_err());
        assert!(agent.get_transaction().is_none());
    }

    #[tokio::test]
    async fn test_isolating_agent_swallows_callback_panic() {
        let agent = RecordingAgent::isolating_panics();

        agent
            .start_background_transaction(
                "Create",
                "User",
                Box::pin(async { panic!("callback failed") }),
            )
            .await;

        assert_eq!(agent.transaction_calls(), 1);
        assert!(agent.get_transaction().is_none());
    }

    #[test]
    fn test_failing_attributes() {
        let agent = RecordingAgent::failing_attributes();
        assert!(agent.add_custom_attribute("environment", "prod").is_err());
        assert_eq!(agent.attribute_calls(), 1);
    }

    #[tokio::test]
    async fn test_loader_counts_loads() {
        let loader = RecordingAgentLoader::default();
        loader.load("key").await.unwrap();
        loader.load("key").await.unwrap();
        assert_eq!(loader.load_count(), 2);

        let failing = RecordingAgentLoader::failing();
        assert!(failing.load("key").await.is_err());
        assert_eq!(failing.load_count(), 1);
    }
}
