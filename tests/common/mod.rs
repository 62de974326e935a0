//! Shared test doubles for the lifecycle scenarios.
//!
//! Import via `mod common;` in integration test files.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use magnetite::pipeline::{generate_instance_id, PipelineRuntimeContext};
use magnetite::spec::{keys, SettingValue, SpecError};
use magnetite::{
    Pipeline, PipelineError, PipelineFactory, ReplicationSettings, ReplicationSpec,
    ReplicationSpecSvc,
};

/// A pipeline that only tracks its running flag.
pub struct TestPipeline {
    topic: String,
    instance_id: String,
    running: AtomicBool,
}

#[async_trait]
impl Pipeline for TestPipeline {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn start(&self, _settings: ReplicationSettings) -> Result<(), PipelineError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), PipelineError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn runtime_context(&self) -> Option<Arc<dyn PipelineRuntimeContext>> {
        None
    }
}

/// Factory that fails construction a configured number of times before
/// succeeding.
pub struct TestFactory {
    fail_remaining: AtomicUsize,
}

impl TestFactory {
    pub fn new() -> Self {
        Self::failing(0)
    }

    pub fn failing(times: usize) -> Self {
        Self {
            fail_remaining: AtomicUsize::new(times),
        }
    }
}

impl Default for TestFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineFactory for TestFactory {
    async fn new_pipeline(&self, topic: &str) -> Result<Arc<dyn Pipeline>, PipelineError> {
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PipelineError::Construction(
                "injected construction failure".to_string(),
            ));
        }
        Ok(Arc::new(TestPipeline {
            topic: topic.to_string(),
            instance_id: generate_instance_id(topic),
            running: AtomicBool::new(false),
        }))
    }
}

/// Spec service backed by a mutable map.
pub struct TestSpecSvc {
    specs: Mutex<HashMap<String, ReplicationSpec>>,
}

impl TestSpecSvc {
    pub fn new() -> Self {
        Self {
            specs: Mutex::new(HashMap::new()),
        }
    }

    /// Register an active topic with the given repair interval.
    pub fn add_topic(&self, topic: &str, retry_interval_secs: i64) {
        let mut spec = ReplicationSpec::new(topic, "source", "remote", "target");
        spec.settings.insert(keys::ACTIVE, SettingValue::Bool(true));
        spec.settings.insert(
            keys::FAILURE_RESTART_INTERVAL,
            SettingValue::Int(retry_interval_secs),
        );
        self.specs.lock().insert(topic.to_string(), spec);
    }

    pub fn set_active(&self, topic: &str, active: bool) {
        if let Some(spec) = self.specs.lock().get_mut(topic) {
            spec.settings.insert(keys::ACTIVE, SettingValue::Bool(active));
        }
    }
}

impl Default for TestSpecSvc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicationSpecSvc for TestSpecSvc {
    async fn replication_spec(&self, topic: &str) -> Result<ReplicationSpec, SpecError> {
        self.specs
            .lock()
            .get(topic)
            .cloned()
            .ok_or_else(|| SpecError::NotFound(topic.to_string()))
    }
}
