//! Pipelines and their supervision
//!
//! A pipeline is the opaque running object that moves one topic's mutations
//! from source to destination. The engine does not build pipelines itself:
//! an injected [`PipelineFactory`] does, and the [`manager`] owns their
//! lifecycle (start, stop, and ticker-driven repair) together with the
//! per-topic [`status`] records.

pub mod manager;
pub mod status;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

use crate::spec::{ReplicationSettings, SpecError};

/// Errors from pipeline lifecycle operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Sentinel halting a repairer: the spec is gone or no longer active.
    #[error("replication specification not found or no longer active")]
    SpecNotActive,

    /// Spec lookup failed.
    #[error(transparent)]
    Spec(#[from] SpecError),

    /// The topic has no replication status entry.
    #[error("replication {0} has not been registered with the pipeline manager")]
    NotRegistered(String),

    /// A spec carried a negative repair interval.
    #[error("invalid repair retry interval {0}")]
    InvalidRetryInterval(i64),

    /// The factory failed to build a pipeline.
    #[error("pipeline construction failed: {0}")]
    Construction(String),

    /// The pipeline failed to start.
    #[error("pipeline start failed: {0}")]
    Start(String),

    /// The pipeline failed to stop.
    #[error("pipeline stop failed: {0}")]
    Stop(String),
}

/// Runtime context a pipeline exposes to its parts.
pub trait PipelineRuntimeContext: Send + Sync {
    /// Topic of the owning pipeline.
    fn pipeline_topic(&self) -> &str;
}

/// A running replication pipeline.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Topic this pipeline replicates.
    fn topic(&self) -> &str;

    /// Unique id of this pipeline instance.
    fn instance_id(&self) -> &str;

    /// Start streaming with the given settings.
    async fn start(&self, settings: ReplicationSettings) -> Result<(), PipelineError>;

    /// Stop streaming. Parts that fail to stop in time are expected to
    /// terminate themselves.
    async fn stop(&self) -> Result<(), PipelineError>;

    /// Whether the pipeline currently reports running.
    fn is_running(&self) -> bool;

    /// Runtime context, when the pipeline exposes one.
    fn runtime_context(&self) -> Option<Arc<dyn PipelineRuntimeContext>>;
}

/// Builds pipelines for topics.
#[async_trait]
pub trait PipelineFactory: Send + Sync {
    /// Construct (but do not start) a pipeline for a topic.
    async fn new_pipeline(&self, topic: &str) -> Result<Arc<dyn Pipeline>, PipelineError>;
}

/// Generate a pipeline instance id: topic plus a timestamp/random suffix.
pub fn generate_instance_id(topic: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let random: u64 = rand::random();
    format!("{topic}-{timestamp:x}-{random:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ids_are_unique() {
        let a = generate_instance_id("t1");
        let b = generate_instance_id("t1");
        assert!(a.starts_with("t1-"));
        assert_ne!(a, b);
    }
}
