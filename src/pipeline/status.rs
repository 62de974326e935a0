//! Per-topic replication status
//!
//! A small aggregate tracking what the engine knows about one topic: the
//! current spec, the settings of the current run, the attached pipeline, and
//! a bounded history of recent errors. The runtime status is derived, never
//! stored.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use super::{Pipeline, PipelineError};
use crate::spec::{ReplicationSettings, ReplicationSpec};

/// Error observations kept per topic.
pub const MAX_ERROR_HISTORY: usize = 32;

/// Derived runtime state of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// Registered but no pipeline attached yet.
    Pending,
    /// A pipeline is attached and reports running.
    Replicating,
    /// The last transition was a clean stop.
    Paused,
    /// The most recent observation was an error.
    Failed,
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Replicating => write!(f, "replicating"),
            Self::Paused => write!(f, "paused"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One recorded error observation.
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    /// When the error was observed.
    pub time: SystemTime,
    /// Rendered error message.
    pub message: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Transition {
    Initial,
    Stopped,
    Errored,
}

struct StatusInner {
    spec: Option<ReplicationSpec>,
    settings: ReplicationSettings,
    pipeline: Option<Arc<dyn Pipeline>>,
    last_transition: Transition,
    errors: VecDeque<ErrorEntry>,
}

/// Runtime record of one replication topic.
pub struct ReplicationStatus {
    topic: String,
    inner: Mutex<StatusInner>,
}

impl ReplicationStatus {
    /// Create a status for a topic with its spec and run settings.
    pub fn new(spec: ReplicationSpec, settings: ReplicationSettings) -> Self {
        Self {
            topic: spec.id.clone(),
            inner: Mutex::new(StatusInner {
                spec: Some(spec),
                settings,
                pipeline: None,
                last_transition: Transition::Initial,
                errors: VecDeque::new(),
            }),
        }
    }

    /// Topic this record belongs to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Replace the spec.
    pub fn set_spec(&self, spec: ReplicationSpec) {
        self.inner.lock().spec = Some(spec);
    }

    /// Current spec.
    pub fn spec(&self) -> Option<ReplicationSpec> {
        self.inner.lock().spec.clone()
    }

    /// Replace the settings of the current run.
    pub fn put_settings(&self, settings: ReplicationSettings) {
        self.inner.lock().settings = settings;
    }

    /// Settings of the current run.
    pub fn settings(&self) -> ReplicationSettings {
        self.inner.lock().settings.clone()
    }

    /// Attach a pipeline, or detach with `None`. Detaching counts as a
    /// clean stop and clears the run settings.
    pub fn set_pipeline(&self, pipeline: Option<Arc<dyn Pipeline>>) {
        let mut inner = self.inner.lock();
        match pipeline {
            Some(p) => {
                inner.pipeline = Some(p);
                inner.last_transition = Transition::Initial;
            }
            None => {
                inner.pipeline = None;
                inner.settings = ReplicationSettings::new();
                inner.last_transition = Transition::Stopped;
            }
        }
    }

    /// Currently attached pipeline.
    pub fn pipeline(&self) -> Option<Arc<dyn Pipeline>> {
        self.inner.lock().pipeline.clone()
    }

    /// Record an error observation into the bounded history.
    pub fn add_error(&self, error: &PipelineError) {
        let mut inner = self.inner.lock();
        if inner.errors.len() == MAX_ERROR_HISTORY {
            inner.errors.pop_front();
        }
        inner.errors.push_back(ErrorEntry {
            time: SystemTime::now(),
            message: error.to_string(),
        });
        inner.last_transition = Transition::Errored;
    }

    /// Recent error observations, oldest first.
    pub fn errors(&self) -> Vec<ErrorEntry> {
        self.inner.lock().errors.iter().cloned().collect()
    }

    /// Derive the runtime status.
    pub fn runtime_status(&self) -> RuntimeStatus {
        let inner = self.inner.lock();
        if let Some(pipeline) = &inner.pipeline {
            if pipeline.is_running() {
                return RuntimeStatus::Replicating;
            }
        }
        match inner.last_transition {
            Transition::Errored => RuntimeStatus::Failed,
            Transition::Stopped => RuntimeStatus::Paused,
            Transition::Initial => RuntimeStatus::Pending,
        }
    }
}

impl fmt::Debug for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationStatus")
            .field("topic", &self.topic)
            .field("runtime_status", &self.runtime_status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubPipeline {
        topic: String,
        running: AtomicBool,
    }

    #[async_trait]
    impl Pipeline for StubPipeline {
        fn topic(&self) -> &str {
            &self.topic
        }

        fn instance_id(&self) -> &str {
            "stub"
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

        fn runtime_context(&self) -> Option<Arc<dyn super::super::PipelineRuntimeContext>> {
            None
        }
    }

    fn status() -> ReplicationStatus {
        ReplicationStatus::new(
            ReplicationSpec::new("t1", "src", "remote", "dst"),
            ReplicationSettings::new(),
        )
    }

    #[test]
    fn test_pending_without_pipeline() {
        assert_eq!(status().runtime_status(), RuntimeStatus::Pending);
    }

    #[tokio::test]
    async fn test_replicating_when_attached_and_running() {
        let st = status();
        let pipeline = Arc::new(StubPipeline {
            topic: "t1".to_string(),
            running: AtomicBool::new(false),
        });
        pipeline.start(ReplicationSettings::new()).await.expect("start");
        st.set_pipeline(Some(pipeline));
        assert_eq!(st.runtime_status(), RuntimeStatus::Replicating);
    }

    #[test]
    fn test_paused_after_clean_stop() {
        let st = status();
        st.put_settings(
            ReplicationSettings::new().with("k", crate::spec::SettingValue::Int(1)),
        );
        st.set_pipeline(None);
        assert_eq!(st.runtime_status(), RuntimeStatus::Paused);
        // detaching clears the run settings
        assert_eq!(st.settings(), ReplicationSettings::new());
    }

    #[test]
    fn test_failed_after_error() {
        let st = status();
        st.add_error(&PipelineError::Start("boom".to_string()));
        assert_eq!(st.runtime_status(), RuntimeStatus::Failed);
        assert_eq!(st.errors().len(), 1);
    }

    #[test]
    fn test_error_history_is_bounded() {
        let st = status();
        for i in 0..(MAX_ERROR_HISTORY + 8) {
            st.add_error(&PipelineError::Start(format!("e{i}")));
        }
        let errors = st.errors();
        assert_eq!(errors.len(), MAX_ERROR_HISTORY);
        // oldest entries were evicted
        assert_eq!(errors[0].message, "pipeline start failed: e8");
    }
}
