//! Cluster topology resolution
//!
//! The engine needs two things from topology: which destination host owns a
//! vBucket (to pick a connection pool) and which worker a vBucket's traffic
//! should route to (to build a routing map). Discovery itself, the HTTP
//! calls against the cluster, lives behind the service traits; a fixed
//! implementation covers single-node deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from topology resolution.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The vBucket number is outside the map.
    #[error("vbucket {0} is out of range for the server map")]
    VbucketOutOfRange(u16),

    /// The vBucket has no active owner in the map.
    #[error("vbucket {0} has no owning server")]
    NoOwner(u16),

    /// The owner index does not resolve to a server list entry.
    #[error("server index {index} for vbucket {vbno} is out of range")]
    BadServerIndex {
        /// Offending vBucket.
        vbno: u16,
        /// Offending index.
        index: i32,
    },

    /// The named bucket is unknown to the cluster info service.
    #[error("bucket {0} not found")]
    BucketNotFound(String),
}

/// A bucket's vBucket→server assignment.
///
/// `vbucket_map[vbno]` is the replica chain for that vBucket; index 0 is the
/// active owner, `-1` marks an unassigned slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VbServerMap {
    /// Host strings, indexed by the entries of `vbucket_map`.
    pub server_list: Vec<String>,
    /// Per-vBucket replica chains.
    pub vbucket_map: Vec<Vec<i32>>,
}

impl VbServerMap {
    /// Number of vBuckets covered by the map.
    pub fn num_vbuckets(&self) -> usize {
        self.vbucket_map.len()
    }

    /// Resolve the active owner of a vBucket.
    pub fn host_for_vb(&self, vbno: u16) -> Result<&str, TopologyError> {
        let chain = self
            .vbucket_map
            .get(vbno as usize)
            .ok_or(TopologyError::VbucketOutOfRange(vbno))?;
        let index = *chain.first().ok_or(TopologyError::NoOwner(vbno))?;
        if index < 0 {
            return Err(TopologyError::NoOwner(vbno));
        }
        self.server_list
            .get(index as usize)
            .map(String::as_str)
            .ok_or(TopologyError::BadServerIndex { vbno, index })
    }
}

/// Derive a routing map assigning every vBucket to the worker id of its
/// owning host.
pub fn routing_map_from_vb_map(
    vb_map: &VbServerMap,
) -> Result<HashMap<u16, String>, TopologyError> {
    let mut routing = HashMap::with_capacity(vb_map.num_vbuckets());
    for vbno in 0..vb_map.num_vbuckets() as u16 {
        routing.insert(vbno, vb_map.host_for_vb(vbno)?.to_string());
    }
    Ok(routing)
}

/// Cluster metadata lookups against a (possibly remote) cluster.
#[async_trait]
pub trait ClusterInfoSvc: Send + Sync {
    /// Server list of a bucket.
    async fn server_list(&self, bucket: &str) -> Result<Vec<String>, TopologyError>;

    /// vBucket→server map of a bucket.
    async fn vb_server_map(&self, bucket: &str) -> Result<VbServerMap, TopologyError>;
}

/// Topology of the local replication deployment.
#[async_trait]
pub trait XdcrTopologySvc: Send + Sync {
    /// Host this instance runs on.
    async fn my_host(&self) -> Result<String, TopologyError>;

    /// Admin port of the local cluster node.
    async fn my_admin_port(&self) -> Result<u16, TopologyError>;

    /// KV nodes this instance is responsible for.
    async fn my_kv_nodes(&self) -> Result<Vec<String>, TopologyError>;

    /// Replication service port per known node.
    async fn xdcr_topology(&self) -> Result<HashMap<String, u16>, TopologyError>;

    /// Connection string for the local node.
    fn connection_str(&self) -> String;

    /// Credentials for topology calls.
    fn username(&self) -> &str;

    /// Password paired with [`Self::username`].
    fn password(&self) -> &str;
}

/// Static cluster info backed by preconfigured maps.
#[derive(Debug, Clone, Default)]
pub struct StaticClusterInfoSvc {
    maps: HashMap<String, VbServerMap>,
}

impl StaticClusterInfoSvc {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bucket's server map.
    pub fn with_bucket(mut self, bucket: impl Into<String>, map: VbServerMap) -> Self {
        self.maps.insert(bucket.into(), map);
        self
    }
}

#[async_trait]
impl ClusterInfoSvc for StaticClusterInfoSvc {
    async fn server_list(&self, bucket: &str) -> Result<Vec<String>, TopologyError> {
        self.maps
            .get(bucket)
            .map(|m| m.server_list.clone())
            .ok_or_else(|| TopologyError::BucketNotFound(bucket.to_string()))
    }

    async fn vb_server_map(&self, bucket: &str) -> Result<VbServerMap, TopologyError> {
        self.maps
            .get(bucket)
            .cloned()
            .ok_or_else(|| TopologyError::BucketNotFound(bucket.to_string()))
    }
}

/// Fixed single-node topology.
#[derive(Debug, Clone)]
pub struct FixedTopologySvc {
    host: String,
    admin_port: u16,
    xdcr_rest_port: u16,
    username: String,
    password: String,
    kv_nodes: Vec<String>,
}

impl FixedTopologySvc {
    /// Describe a single-node deployment.
    pub fn new(
        host: impl Into<String>,
        admin_port: u16,
        xdcr_rest_port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        kv_nodes: Vec<String>,
    ) -> Self {
        Self {
            host: host.into(),
            admin_port,
            xdcr_rest_port,
            username: username.into(),
            password: password.into(),
            kv_nodes,
        }
    }
}

#[async_trait]
impl XdcrTopologySvc for FixedTopologySvc {
    async fn my_host(&self) -> Result<String, TopologyError> {
        Ok(self.host.clone())
    }

    async fn my_admin_port(&self) -> Result<u16, TopologyError> {
        Ok(self.admin_port)
    }

    async fn my_kv_nodes(&self) -> Result<Vec<String>, TopologyError> {
        Ok(self.kv_nodes.clone())
    }

    async fn xdcr_topology(&self) -> Result<HashMap<String, u16>, TopologyError> {
        Ok(self
            .kv_nodes
            .iter()
            .map(|node| (node.clone(), self.xdcr_rest_port))
            .collect())
    }

    fn connection_str(&self) -> String {
        format!("{}:{}", self.host, self.admin_port)
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn password(&self) -> &str {
        &self.password
    }
}
