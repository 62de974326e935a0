//! Replication specifications and settings
//!
//! A replication spec is the persisted configuration of one topic: source
//! bucket, target cluster and bucket, and a map of typed settings. Specs are
//! created and mutated by the administrative surface; the engine only reads
//! them, through the [`ReplicationSpecSvc`] seam.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Recognized settings keys.
pub mod keys {
    /// Whether the topic should be running (boolean, on the spec).
    pub const ACTIVE: &str = "active";
    /// Seconds between repair attempts (integer ≥ 0).
    pub const FAILURE_RESTART_INTERVAL: &str = "failure_restart_interval";
    /// Router filter regular expression (string; empty allows all).
    pub const FILTER_EXPRESSION: &str = "filter_expression";
    /// Whether to emit extended-metadata extras and parse the CR mode
    /// (boolean).
    pub const EXT_METADATA_SUPPORTED: &str = "ext_metadata_supported";
}

/// Default repair interval when a spec does not carry one.
pub const DEFAULT_FAILURE_RESTART_INTERVAL_SECS: i64 = 30;

/// Errors from spec handling.
#[derive(Debug, Error)]
pub enum SpecError {
    /// No spec exists for the topic (deleted or never created).
    #[error("replication specification {0} not found")]
    NotFound(String),

    /// A setting value has the wrong type or an invalid value.
    #[error("invalid setting {key}: {reason}")]
    InvalidSetting {
        /// Offending key.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// One typed setting value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    /// Boolean option.
    Bool(bool),
    /// Integer option.
    Int(i64),
    /// String option.
    Str(String),
}

impl SettingValue {
    /// Boolean payload, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer payload, if this is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// String payload, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Mapping of named options to typed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSettings(HashMap<String, SettingValue>);

impl ReplicationSettings {
    /// Empty settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key.
    pub fn insert(&mut self, key: impl Into<String>, value: SettingValue) {
        self.0.insert(key.into(), value);
    }

    /// Builder-style set.
    pub fn with(mut self, key: impl Into<String>, value: SettingValue) -> Self {
        self.insert(key, value);
        self
    }

    /// Read a key.
    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.0.get(key)
    }

    /// Whether the topic should be running. Absent means active: specs are
    /// created running and paused explicitly.
    pub fn active(&self) -> bool {
        self.get(keys::ACTIVE).and_then(SettingValue::as_bool).unwrap_or(true)
    }

    /// Seconds between repair attempts.
    pub fn failure_restart_interval(&self) -> i64 {
        self.get(keys::FAILURE_RESTART_INTERVAL)
            .and_then(SettingValue::as_int)
            .unwrap_or(DEFAULT_FAILURE_RESTART_INTERVAL_SECS)
    }

    /// Router filter expression; empty allows everything.
    pub fn filter_expression(&self) -> &str {
        self.get(keys::FILTER_EXPRESSION)
            .and_then(SettingValue::as_str)
            .unwrap_or("")
    }

    /// Whether extended-metadata extras are emitted.
    pub fn ext_metadata_supported(&self) -> bool {
        self.get(keys::EXT_METADATA_SUPPORTED)
            .and_then(SettingValue::as_bool)
            .unwrap_or(false)
    }
}

/// Persisted configuration of one replication topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSpec {
    /// Topic: stable identifier of this replication.
    pub id: String,
    /// Bucket replicated from.
    pub source_bucket: String,
    /// Reference to the destination cluster.
    pub target_cluster: String,
    /// Bucket replicated into.
    pub target_bucket: String,
    /// Spec-level settings.
    pub settings: ReplicationSettings,
}

impl ReplicationSpec {
    /// Create a spec with default settings.
    pub fn new(
        id: impl Into<String>,
        source_bucket: impl Into<String>,
        target_cluster: impl Into<String>,
        target_bucket: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_bucket: source_bucket.into(),
            target_cluster: target_cluster.into(),
            target_bucket: target_bucket.into(),
            settings: ReplicationSettings::new(),
        }
    }

    /// Whether the spec is active.
    pub fn active(&self) -> bool {
        self.settings.active()
    }
}

/// Read access to persisted replication specs.
#[async_trait]
pub trait ReplicationSpecSvc: Send + Sync {
    /// Look up the spec of a topic. Deleted topics surface
    /// [`SpecError::NotFound`].
    async fn replication_spec(&self, topic: &str) -> Result<ReplicationSpec, SpecError>;
}
