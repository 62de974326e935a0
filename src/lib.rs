//! # Magnetite
//!
//! A cross-cluster bucket replication engine. Given a replication
//! specification (a source bucket, a destination bucket on a remote
//! cluster, and a filter expression), Magnetite continuously streams
//! mutations from every source vBucket to the destination, records
//! per-vBucket checkpoints so restarts resume from the last durable
//! position, and supervises the resulting pipelines so transient failures
//! heal on their own.
//!
//! **Stream everything, checkpoint everything, repair yourself.**
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`pipeline`] | Pipeline seams, per-topic status, manager and repairers |
//! | [`router`] | Event filtering, request composition, vBucket dispatch |
//! | [`checkpoints`] | Durable per-vBucket resume points |
//! | [`pool`] | Pooled, authenticated destination connections |
//! | [`metadata`] | Replicated metadata store access |
//! | [`topology`] | vBucket→server maps and topology seams |
//! | [`spec`] | Replication specifications and typed settings |
//! | [`wire`] | UPR events, memcached requests, extras codecs |
//! | [`context`] | Runtime context owning the registries |
//! | [`config`] | TOML-loadable engine configuration |

pub mod checkpoints;
pub mod config;
pub mod context;
pub mod metadata;
pub mod pipeline;
pub mod pool;
pub mod router;
pub mod spec;
pub mod topology;
pub mod wire;

pub use checkpoints::{CheckpointRecord, CheckpointsDoc, CheckpointsService};
pub use config::Config;
pub use context::ReplicationContext;
pub use metadata::{MetadataError, MetadataSvc, Revision};
pub use pipeline::manager::PipelineManager;
pub use pipeline::status::{ReplicationStatus, RuntimeStatus};
pub use pipeline::{Pipeline, PipelineError, PipelineFactory};
pub use pool::{ConnPool, ConnPoolMgr, McClient, McConnector};
pub use router::{Router, RouterError, RouterEvent};
pub use spec::{ReplicationSettings, ReplicationSpec, ReplicationSpecSvc, SettingValue};
pub use topology::{ClusterInfoSvc, VbServerMap, XdcrTopologySvc};
pub use wire::{CrMode, McRequest, UprEvent, UprOpcode, WrappedMcRequest};
