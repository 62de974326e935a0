//! Replicated metadata store access
//!
//! The engine persists its durable state (checkpoints, and anything else the
//! outer service layers choose) through an external replicated key-value
//! store. This module defines the store interface, the opaque revision
//! tokens it hands out, and the error taxonomy shared by its
//! implementations:
//!
//! - [`client::RemoteMetadataSvc`]: thin request/reply client to a remote
//!   store.
//! - [`memory::MemMetadataSvc`]: in-process store for embedded use and
//!   tests.

pub mod client;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque revision token returned by the store.
///
/// Clients must not interpret the contents; tokens only travel back into
/// `set`/`del` calls as preconditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision(pub(crate) u64);

/// One entry of a catalog enumeration.
#[derive(Debug, Clone)]
pub struct MetaEntry {
    /// Full key of the entry.
    pub key: String,
    /// Stored value.
    pub value: Bytes,
    /// Revision of the entry at enumeration time.
    pub rev: Option<Revision>,
}

/// Errors from metadata store operations.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The key does not exist.
    #[error("metadata key not found")]
    NotFound,

    /// `add` on a key that already exists.
    #[error("metadata key already exists")]
    AlreadyExists,

    /// The expected revision did not match the stored one.
    #[error("metadata revision mismatch")]
    RevisionMismatch,

    /// Transport-level failure talking to the store.
    #[error("metadata i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The store replied with something the client could not parse.
    #[error("metadata protocol error: {0}")]
    Protocol(String),

    /// Request or reply encoding failed.
    #[error("metadata encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The store reported an error the client has no mapping for.
    #[error("metadata store error: {0}")]
    Remote(String),
}

/// Interface to the replicated key-value metadata store.
///
/// Catalog operations address a logical group of keys; how the store tracks
/// membership is its own concern. `get` on a missing key surfaces
/// [`MetadataError::NotFound`], distinguishable from every other failure.
#[async_trait]
pub trait MetadataSvc: Send + Sync {
    /// Read a key, returning its value and current revision.
    async fn get(&self, key: &str) -> Result<(Bytes, Revision), MetadataError>;

    /// Create a key; fails with [`MetadataError::AlreadyExists`] if present.
    async fn add(&self, key: &str, value: Bytes) -> Result<(), MetadataError>;

    /// Write a key. With `rev` set, the write only succeeds if the stored
    /// revision matches; with `None` the write is unconditional.
    async fn set(&self, key: &str, value: Bytes, rev: Option<Revision>)
        -> Result<(), MetadataError>;

    /// Delete a key, optionally guarded by an expected revision.
    async fn del(&self, key: &str, rev: Option<Revision>) -> Result<(), MetadataError>;

    /// Delete a key and drop it from its catalog group.
    async fn del_with_catalog(
        &self,
        catalog_key: &str,
        key: &str,
        rev: Option<Revision>,
    ) -> Result<(), MetadataError>;

    /// Enumerate every entry belonging to a catalog group.
    async fn get_all_from_catalog(&self, catalog_key: &str)
        -> Result<Vec<MetaEntry>, MetadataError>;

    /// Delete every entry belonging to a catalog group.
    async fn del_all_from_catalog(&self, catalog_key: &str) -> Result<(), MetadataError>;
}
