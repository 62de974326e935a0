//! Engine runtime context
//!
//! One context owns the two process-wide registries (the pipeline manager
//! and the connection pool manager) and hands out the services built on
//! them. Constructing the context replaces any notion of global singletons,
//! so tests and embedded hosts can run several engines side by side.

use std::sync::Arc;

use crate::checkpoints::CheckpointsService;
use crate::config::Config;
use crate::metadata::MetadataSvc;
use crate::metadata::client::RemoteMetadataSvc;
use crate::pipeline::manager::PipelineManager;
use crate::pipeline::PipelineFactory;
use crate::pool::{ConnPool, ConnPoolMgr, McConnector};
use crate::spec::ReplicationSpecSvc;

/// Owns the engine's registries and wiring.
pub struct ReplicationContext {
    config: Config,
    pipeline_manager: Arc<PipelineManager>,
    conn_pool_mgr: Arc<ConnPoolMgr>,
}

impl ReplicationContext {
    /// Build a context with the production TCP connector.
    pub fn new(
        config: Config,
        factory: Arc<dyn PipelineFactory>,
        spec_svc: Arc<dyn ReplicationSpecSvc>,
    ) -> Self {
        Self {
            config,
            pipeline_manager: Arc::new(PipelineManager::new(factory, spec_svc)),
            conn_pool_mgr: Arc::new(ConnPoolMgr::new()),
        }
    }

    /// Build a context with an injected destination connector.
    pub fn with_connector(
        config: Config,
        factory: Arc<dyn PipelineFactory>,
        spec_svc: Arc<dyn ReplicationSpecSvc>,
        connector: Arc<dyn McConnector>,
    ) -> Self {
        Self {
            config,
            pipeline_manager: Arc::new(PipelineManager::new(factory, spec_svc)),
            conn_pool_mgr: Arc::new(ConnPoolMgr::with_connector(connector)),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The pipeline manager.
    pub fn pipeline_manager(&self) -> &Arc<PipelineManager> {
        &self.pipeline_manager
    }

    /// The connection pool manager.
    pub fn conn_pool_mgr(&self) -> &Arc<ConnPoolMgr> {
        &self.conn_pool_mgr
    }

    /// Build a checkpoint service persisting through the given store, using
    /// the configured per-document record bound.
    pub fn checkpoints_service(&self, metadata_svc: Arc<dyn MetadataSvc>) -> CheckpointsService {
        CheckpointsService::new(metadata_svc).with_max_records(self.config.max_checkpoint_records)
    }

    /// Build a client for the configured remote metadata store.
    pub fn remote_metadata_svc(&self) -> RemoteMetadataSvc {
        RemoteMetadataSvc::new(self.config.metadata_addr.clone())
    }

    /// Get or create a destination pool with the configured default
    /// capacity.
    pub async fn destination_pool(
        &self,
        name: &str,
        host: &str,
        user: &str,
        pass: &str,
    ) -> Arc<ConnPool> {
        self.conn_pool_mgr
            .get_or_create(name, host, user, pass, self.config.default_pool_size)
            .await
    }

    /// Synchronous shutdown: stop every pipeline, drain every repairer,
    /// close every pool.
    pub async fn shutdown(&self) {
        let _ = self.pipeline_manager.on_exit().await;
        self.conn_pool_mgr.close_all();
    }
}
