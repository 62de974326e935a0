//! Destination connection pooling
//!
//! Each destination host gets a bounded inventory of authenticated memcached
//! connections. Construction is eager but tolerant: per-handle connect or
//! auth failures shrink the inventory instead of failing the pool. Acquire
//! blocks until a handle is idle or the pool is closed; the closed state is
//! an explicit one-way flag.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::topology::{TopologyError, VbServerMap};

/// Pool capacity used when a caller passes 0.
pub const DEFAULT_CONNECTION_SIZE: usize = 5;

const REQ_MAGIC: u8 = 0x80;
const OP_SASL_AUTH: u8 = 0x21;
const SASL_MECH_PLAIN: &[u8] = b"PLAIN";

/// Errors from connection pooling.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has been closed.
    #[error("connection pool is closed")]
    Closed,

    /// TCP connect or transport failure against a destination host.
    #[error("failed to connect to {host}: {source}")]
    Connect {
        /// Destination host.
        host: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The destination rejected the credentials.
    #[error("authentication rejected by {host} (status {status:#06x})")]
    AuthRejected {
        /// Destination host.
        host: String,
        /// Memcached status code from the auth response.
        status: u16,
    },

    /// vBucket→host resolution failed.
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

// ── Client handle ────────────────────────────────────────────────────────────

/// One authenticated memcached connection. Dropping the handle closes the
/// underlying stream.
pub struct McClient {
    host: String,
    stream: TcpStream,
}

impl McClient {
    /// Open a TCP connection to a destination host.
    pub async fn connect(host: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(host).await?;
        Ok(Self {
            host: host.to_string(),
            stream,
        })
    }

    /// Host this handle is connected to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Authenticate with SASL PLAIN.
    pub async fn auth(&mut self, user: &str, pass: &str) -> Result<(), PoolError> {
        let mut body = Vec::with_capacity(2 + user.len() + pass.len());
        body.push(0);
        body.extend_from_slice(user.as_bytes());
        body.push(0);
        body.extend_from_slice(pass.as_bytes());

        let mut frame = BytesMut::with_capacity(24 + SASL_MECH_PLAIN.len() + body.len());
        frame.put_u8(REQ_MAGIC);
        frame.put_u8(OP_SASL_AUTH);
        frame.put_u16(SASL_MECH_PLAIN.len() as u16);
        frame.put_u8(0); // extras length
        frame.put_u8(0); // data type
        frame.put_u16(0); // vbucket
        frame.put_u32((SASL_MECH_PLAIN.len() + body.len()) as u32);
        frame.put_u32(0); // opaque
        frame.put_u64(0); // cas
        frame.put_slice(SASL_MECH_PLAIN);
        frame.put_slice(&body);

        let write = self.stream.write_all(&frame).await;
        write.map_err(|e| self.io_err(e))?;

        let mut header = [0u8; 24];
        let read = self.stream.read_exact(&mut header).await;
        read.map_err(|e| self.io_err(e))?;
        let status = u16::from_be_bytes([header[6], header[7]]);
        let body_len =
            u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let mut response_body = vec![0u8; body_len];
        let read = self.stream.read_exact(&mut response_body).await;
        read.map_err(|e| self.io_err(e))?;

        if status != 0 {
            return Err(PoolError::AuthRejected {
                host: self.host.clone(),
                status,
            });
        }
        Ok(())
    }

    fn io_err(&self, source: std::io::Error) -> PoolError {
        PoolError::Connect {
            host: self.host.clone(),
            source,
        }
    }
}

// ── Connector seam ───────────────────────────────────────────────────────────

/// Establishes authenticated destination connections. Injected so tests can
/// stand in for the network.
#[async_trait]
pub trait McConnector: Send + Sync {
    /// Connect and authenticate against a destination host.
    async fn connect(&self, host: &str, user: &str, pass: &str) -> Result<McClient, PoolError>;
}

/// Production connector: TCP plus SASL PLAIN. Authentication is skipped when
/// the user is empty or the literal `"default"`.
pub struct TcpConnector;

#[async_trait]
impl McConnector for TcpConnector {
    async fn connect(&self, host: &str, user: &str, pass: &str) -> Result<McClient, PoolError> {
        let mut client = McClient::connect(host)
            .await
            .map_err(|source| PoolError::Connect {
                host: host.to_string(),
                source,
            })?;
        if !user.is_empty() && user != "default" {
            client.auth(user, pass).await?;
        }
        Ok(client)
    }
}

// ── Pool ─────────────────────────────────────────────────────────────────────

/// Bounded inventory of idle destination connections.
pub struct ConnPool {
    name: String,
    host: String,
    capacity: usize,
    idle: Mutex<VecDeque<McClient>>,
    /// One permit per idle handle; closing the semaphore fails waiters.
    slots: Semaphore,
    closed: AtomicBool,
}

impl ConnPool {
    /// Build a pool, eagerly attempting `capacity` connections. Per-handle
    /// failures are logged and reduce the live count; a partial pool is
    /// legal.
    pub async fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        user: &str,
        pass: &str,
        capacity: usize,
        connector: &dyn McConnector,
    ) -> Self {
        let name = name.into();
        let host = host.into();
        info!(pool = %name, host = %host, capacity, "creating connection pool");

        let pool = Self {
            name,
            host,
            capacity,
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(0),
            closed: AtomicBool::new(false),
        };

        for _ in 0..capacity {
            match connector.connect(&pool.host, user, pass).await {
                Ok(client) => {
                    pool.idle.lock().push_back(client);
                    pool.slots.add_permits(1);
                }
                Err(e) => {
                    warn!(pool = %pool.name, host = %pool.host, error = %e,
                        "failed to establish pooled connection");
                }
            }
        }

        info!(pool = %pool.name, live = pool.idle_count(), "connection pool created");
        pool
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Destination host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Idle handles currently available.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Acquire a handle, waiting until one is idle. Fails with
    /// [`PoolError::Closed`] once the pool is closed.
    pub async fn get(&self) -> Result<McClient, PoolError> {
        let permit = self.slots.acquire().await.map_err(|_| PoolError::Closed)?;
        permit.forget();
        // a permit implies an idle handle unless close_all drained in between
        self.idle.lock().pop_front().ok_or(PoolError::Closed)
    }

    /// Return a handle. If the idle set is at capacity the handle is
    /// dropped. Callers must not release after [`Self::close_all`].
    pub fn release(&self, client: McClient) {
        if self.is_closed() {
            debug_assert!(false, "release into a closed pool");
            warn!(pool = %self.name, "connection released into a closed pool, dropping");
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() >= self.capacity {
            // at capacity: discard the returned handle
            return;
        }
        idle.push_back(client);
        drop(idle);
        self.slots.add_permits(1);
    }

    /// Drain and close every idle handle, then mark the pool closed.
    /// Idempotent.
    pub fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slots.close();
        let drained = self.idle.lock().drain(..).count();
        info!(pool = %self.name, drained, "connection pool closed");
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Registry of named connection pools.
///
/// A pool's capacity is fixed at first creation for its name; callers
/// wanting a different size must create under a different name.
pub struct ConnPoolMgr {
    pools: Mutex<HashMap<String, Arc<ConnPool>>>,
    connector: Arc<dyn McConnector>,
}

impl ConnPoolMgr {
    /// Manager using the production TCP connector.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(TcpConnector))
    }

    /// Manager with an injected connector.
    pub fn with_connector(connector: Arc<dyn McConnector>) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            connector,
        }
    }

    /// Look up a pool by name.
    pub fn get_pool(&self, name: &str) -> Option<Arc<ConnPool>> {
        self.pools.lock().get(name).cloned()
    }

    /// Return the named pool, creating it on first use. `size` 0 means
    /// [`DEFAULT_CONNECTION_SIZE`].
    pub async fn get_or_create(
        &self,
        name: &str,
        host: &str,
        user: &str,
        pass: &str,
        size: usize,
    ) -> Arc<ConnPool> {
        if let Some(pool) = self.get_pool(name) {
            return pool;
        }
        let size = if size == 0 { DEFAULT_CONNECTION_SIZE } else { size };
        let pool = Arc::new(
            ConnPool::new(name, host, user, pass, size, self.connector.as_ref()).await,
        );

        let mut pools = self.pools.lock();
        match pools.entry(name.to_string()) {
            std::collections::hash_map::Entry::Occupied(existing) => {
                // lost the creation race: keep the registered pool
                let existing = existing.get().clone();
                drop(pools);
                pool.close_all();
                existing
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(pool.clone());
                pool
            }
        }
    }

    /// Get or create the pool for the host owning a vBucket. With no
    /// explicit `pool_name` the host string names the pool.
    pub async fn get_or_create_for_vb(
        &self,
        vb_map: &VbServerMap,
        vbno: u16,
        pool_name: Option<&str>,
        user: &str,
        pass: &str,
        size: usize,
    ) -> Result<Arc<ConnPool>, PoolError> {
        let host = vb_map.host_for_vb(vbno)?;
        let name = pool_name.unwrap_or(host);
        Ok(self.get_or_create(name, host, user, pass, size).await)
    }

    /// Acquire a connection to the host owning a vBucket.
    pub async fn get_connection_for_vb(
        &self,
        vb_map: &VbServerMap,
        vbno: u16,
        pool_name: Option<&str>,
        user: &str,
        pass: &str,
    ) -> Result<McClient, PoolError> {
        let pool = self
            .get_or_create_for_vb(vb_map, vbno, pool_name, user, pass, 0)
            .await?;
        pool.get().await
    }

    /// Close every registered pool.
    pub fn close_all(&self) {
        for (name, pool) in self.pools.lock().iter() {
            info!(pool = %name, "closing pool");
            pool.close_all();
        }
    }
}

impl Default for ConnPoolMgr {
    fn default() -> Self {
        Self::new()
    }
}
