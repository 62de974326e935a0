//! Pipeline lifecycle management
//!
//! The manager owns the per-topic status registry, builds pipelines through
//! the injected factory, and supervises failing topics with repairers. A
//! repairer retries a stop/validate/start cycle on a fixed interval until
//! the topic runs again, its spec deactivates, or shutdown is signaled.
//!
//! Registries are typed and internally locked; no lock is ever held across
//! a pipeline call or network round trip.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::status::{ReplicationStatus, RuntimeStatus};
use super::{Pipeline, PipelineError, PipelineFactory, PipelineRuntimeContext};
use crate::spec::{ReplicationSettings, ReplicationSpec, ReplicationSpecSvc};

// ── Registries ───────────────────────────────────────────────────────────────

/// Topic → replication status, the single source of liveness.
struct StatusRegistry {
    map: RwLock<HashMap<String, Arc<ReplicationStatus>>>,
}

impl StatusRegistry {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, topic: &str) -> Option<Arc<ReplicationStatus>> {
        self.map.read().get(topic).cloned()
    }

    /// Insert or refresh a topic's status with the latest spec and settings.
    fn upsert(
        &self,
        topic: &str,
        spec: ReplicationSpec,
        settings: ReplicationSettings,
    ) -> Arc<ReplicationStatus> {
        let mut map = self.map.write();
        match map.get(topic) {
            Some(status) => {
                status.set_spec(spec);
                status.put_settings(settings);
                status.clone()
            }
            None => {
                let status = Arc::new(ReplicationStatus::new(spec, settings));
                map.insert(topic.to_string(), status.clone());
                status
            }
        }
    }

    fn topics(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }

    fn all(&self) -> Vec<Arc<ReplicationStatus>> {
        self.map.read().values().cloned().collect()
    }
}

struct RepairerHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

/// Topic → repairer. Insertion is check-and-insert under one lock, so a
/// second repairer for a topic cannot exist.
struct RepairerRegistry {
    map: Mutex<HashMap<String, RepairerHandle>>,
}

impl RepairerRegistry {
    fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    fn contains(&self, topic: &str) -> bool {
        self.map.lock().contains_key(topic)
    }

    /// Insert the handle built by `make` unless the topic already has one.
    /// Returns whether an insertion happened.
    fn insert_with(&self, topic: &str, make: impl FnOnce() -> RepairerHandle) -> bool {
        let mut map = self.map.lock();
        if map.contains_key(topic) {
            return false;
        }
        map.insert(topic.to_string(), make());
        true
    }

    fn remove(&self, topic: &str) -> Option<RepairerHandle> {
        self.map.lock().remove(topic)
    }

    fn drain(&self) -> Vec<(String, RepairerHandle)> {
        self.map.lock().drain().collect()
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Registry and supervisor of every replication pipeline in the process.
pub struct PipelineManager {
    statuses: StatusRegistry,
    repairers: RepairerRegistry,
    factory: Arc<dyn PipelineFactory>,
    spec_svc: Arc<dyn ReplicationSpecSvc>,
}

impl PipelineManager {
    /// Create a manager with its injected collaborators.
    pub fn new(factory: Arc<dyn PipelineFactory>, spec_svc: Arc<dyn ReplicationSpecSvc>) -> Self {
        info!("pipeline manager constructed");
        Self {
            statuses: StatusRegistry::new(),
            repairers: RepairerRegistry::new(),
            factory,
            spec_svc,
        }
    }

    /// Start the pipeline of a topic.
    ///
    /// A topic that is already replicating returns its pipeline unchanged.
    /// On a start failure the status keeps the spec, which a later repair
    /// needs.
    pub async fn start_pipeline(
        &self,
        topic: &str,
        settings: ReplicationSettings,
    ) -> Result<Arc<dyn Pipeline>, PipelineError> {
        info!(topic, "starting pipeline");

        if let Some(status) = self.statuses.get(topic) {
            if status.runtime_status() == RuntimeStatus::Replicating {
                if let Some(pipeline) = status.pipeline() {
                    info!(topic, "pipeline asked to start is already running");
                    return Ok(pipeline);
                }
            }
        }

        let spec = self.spec_svc.replication_spec(topic).await?;
        let status = self.statuses.upsert(topic, spec, settings.clone());

        let pipeline = match self.factory.new_pipeline(topic).await {
            Ok(p) => p,
            Err(e) => {
                error!(topic, error = %e, "failed to construct a new pipeline");
                return Err(e);
            }
        };

        info!(topic, instance = pipeline.instance_id(), "pipeline constructed, starting it");
        if let Err(e) = pipeline.start(settings).await {
            error!(topic, error = %e, "failed to start the pipeline");
            return Err(e);
        }

        status.set_pipeline(Some(pipeline.clone()));
        Ok(pipeline)
    }

    /// Stop the pipeline of a topic. Stop errors are logged and swallowed:
    /// the pipeline's parts are expected to terminate themselves. Stopping a
    /// non-running topic is a no-op.
    pub async fn stop_pipeline(&self, topic: &str) -> Result<(), PipelineError> {
        info!(topic, "stopping pipeline");
        let Some(status) = self.statuses.get(topic) else {
            info!(topic, "pipeline asked to stop is not running");
            return Ok(());
        };
        if status.runtime_status() != RuntimeStatus::Replicating {
            info!(topic, "pipeline asked to stop is not running");
            return Ok(());
        }
        if let Some(pipeline) = status.pipeline() {
            if let Err(e) = pipeline.stop().await {
                // the pipeline failed to stop gracefully in time; its parts
                // will eventually terminate themselves
                error!(topic, error = %e, "failed to stop pipeline");
            }
        }
        status.set_pipeline(None);
        info!(topic, "pipeline stopped");
        Ok(())
    }

    /// Launch a repairer for a failing topic. A topic already under repair
    /// is a no-op.
    pub async fn repair(
        self: &Arc<Self>,
        topic: &str,
        cause: PipelineError,
    ) -> Result<(), PipelineError> {
        if self.repairers.contains(topic) {
            info!(topic, "a repairer is already running for the replication, no-op");
            return Ok(());
        }

        let spec = self.spec_svc.replication_spec(topic).await?;
        let retry_interval = spec.settings.failure_restart_interval();
        if retry_interval < 0 {
            return Err(PipelineError::InvalidRetryInterval(retry_interval));
        }
        let status = self
            .statuses
            .get(topic)
            .ok_or_else(|| PipelineError::NotRegistered(topic.to_string()))?;

        let inserted = self.repairers.insert_with(topic, || {
            let shutdown = Arc::new(Notify::new());
            let repairer = Repairer {
                topic: topic.to_string(),
                retry_interval: Duration::from_secs(retry_interval as u64),
                attempts: 0,
                shutdown: shutdown.clone(),
                status,
            };
            let join = tokio::spawn(repairer.run(Arc::clone(self), cause));
            RepairerHandle { shutdown, join }
        });

        if inserted {
            info!(topic, retry_interval, "repairer launched");
        } else {
            info!(topic, "a repairer is already running for the replication, no-op");
        }
        Ok(())
    }

    /// Attached pipeline of a topic, if any.
    pub fn pipeline(&self, topic: &str) -> Option<Arc<dyn Pipeline>> {
        self.statuses.get(topic).and_then(|s| s.pipeline())
    }

    /// Replication status of a topic, if registered.
    pub fn replication_status(&self, topic: &str) -> Option<Arc<ReplicationStatus>> {
        self.statuses.get(topic)
    }

    /// Whether a topic's pipeline is attached and running.
    pub fn is_pipeline_running(&self, topic: &str) -> bool {
        self.statuses
            .get(topic)
            .is_some_and(|s| s.runtime_status() == RuntimeStatus::Replicating)
    }

    /// Runtime context of a topic's pipeline, when it exposes one.
    pub fn runtime_ctx(&self, topic: &str) -> Option<Arc<dyn PipelineRuntimeContext>> {
        self.pipeline(topic).and_then(|p| p.runtime_context())
    }

    /// Every registered topic.
    pub fn live_topics(&self) -> Vec<String> {
        self.statuses.topics()
    }

    /// Every replicating topic and its pipeline.
    pub fn live_pipelines(&self) -> HashMap<String, Arc<dyn Pipeline>> {
        self.statuses
            .all()
            .into_iter()
            .filter(|s| s.runtime_status() == RuntimeStatus::Replicating)
            .filter_map(|s| s.pipeline().map(|p| (s.topic().to_string(), p)))
            .collect()
    }

    /// Whether a repairer is registered for a topic.
    pub fn is_repair_pending(&self, topic: &str) -> bool {
        self.repairers.contains(topic)
    }

    /// Stop every live topic, signal every repairer, and wait for their
    /// tasks. Must complete before process exit.
    pub async fn on_exit(&self) -> Result<(), PipelineError> {
        for topic in self.statuses.topics() {
            let _ = self.stop_pipeline(&topic).await;
        }

        let handles = self.repairers.drain();
        for (_, handle) in &handles {
            handle.shutdown.notify_one();
        }
        info!(repairers = handles.len(), "sent finish signal to all running repairers");

        for (topic, handle) in handles {
            if let Err(e) = handle.join.await {
                warn!(topic = %topic, error = %e, "repairer task did not join cleanly");
            }
        }
        Ok(())
    }

    fn report_fixed(&self, topic: &str) {
        self.repairers.remove(topic);
    }

    async fn check_spec_active(&self, topic: &str) -> Result<(), PipelineError> {
        match self.spec_svc.replication_spec(topic).await {
            Ok(spec) if spec.active() => Ok(()),
            _ => Err(PipelineError::SpecNotActive),
        }
    }
}

// ── Repairer ─────────────────────────────────────────────────────────────────

/// Supervisor of one failing topic: retries a stop/validate/start cycle on a
/// fixed interval.
struct Repairer {
    topic: String,
    retry_interval: Duration,
    attempts: u64,
    shutdown: Arc<Notify>,
    status: Arc<ReplicationStatus>,
}

impl Repairer {
    async fn run(mut self, mgr: Arc<PipelineManager>, first_error: PipelineError) {
        self.status.add_error(&first_error);

        let period = self.retry_interval.max(Duration::from_millis(1));
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.repair_once(&mgr).await {
                        Ok(()) => {
                            info!(topic = %self.topic, attempts = self.attempts,
                                "pipeline is fixed, back to business");
                            mgr.report_fixed(&self.topic);
                            return;
                        }
                        Err(PipelineError::SpecNotActive) => {
                            info!(topic = %self.topic,
                                "stopping repair, replication is no longer active");
                            mgr.report_fixed(&self.topic);
                            return;
                        }
                        Err(e) => {
                            error!(topic = %self.topic, attempts = self.attempts, error = %e,
                                "repairing pipeline failed");
                            self.attempts += 1;
                            self.status.add_error(&e);
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!(topic = %self.topic, "quit repairing pipeline");
                    return;
                }
            }
        }
    }

    async fn repair_once(&self, mgr: &PipelineManager) -> Result<(), PipelineError> {
        info!(topic = %self.topic, "trying to fix pipeline");
        mgr.stop_pipeline(&self.topic).await?;
        mgr.check_spec_active(&self.topic).await?;
        mgr.start_pipeline(&self.topic, self.status.settings())
            .await
            .map(|_| ())
    }
}
