//! In-process metadata store
//!
//! A complete [`MetadataSvc`] backed by process memory, for embedded
//! deployments and tests. Catalogs are prefix-addressed: a key belongs to
//! the group whose catalog key precedes its next `|` boundary, so no
//! separate membership bookkeeping is needed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{MetaEntry, MetadataError, MetadataSvc, Revision};

/// In-memory [`MetadataSvc`] with monotonically increasing revisions.
#[derive(Default)]
pub struct MemMetadataSvc {
    entries: Mutex<BTreeMap<String, (Bytes, Revision)>>,
    next_rev: AtomicU64,
    /// Lifetime count of mutating store operations.
    write_ops: AtomicU64,
}

impl MemMetadataSvc {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifetime count of writes (set/add/del) the store has performed.
    ///
    /// Lets callers assert on write suppression, e.g. checkpoint upsert
    /// deduplication.
    pub fn write_ops(&self) -> u64 {
        self.write_ops.load(Ordering::Relaxed)
    }

    fn bump_rev(&self) -> Revision {
        Revision(self.next_rev.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// A key is a member of `catalog_key` when the catalog key is followed
    /// by a `|` boundary, so `grp` owns `grp|a` but not `grp2|a`.
    fn in_catalog(key: &str, catalog_key: &str) -> bool {
        key.strip_prefix(catalog_key)
            .is_some_and(|rest| rest.starts_with('|'))
    }
}

#[async_trait]
impl MetadataSvc for MemMetadataSvc {
    async fn get(&self, key: &str) -> Result<(Bytes, Revision), MetadataError> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or(MetadataError::NotFound)
    }

    async fn add(&self, key: &str, value: Bytes) -> Result<(), MetadataError> {
        let rev = self.bump_rev();
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Err(MetadataError::AlreadyExists);
        }
        entries.insert(key.to_string(), (value, rev));
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        rev: Option<Revision>,
    ) -> Result<(), MetadataError> {
        let new_rev = self.bump_rev();
        let mut entries = self.entries.lock();
        if let Some(expected) = rev {
            match entries.get(key) {
                Some((_, current)) if *current == expected => {}
                Some(_) => return Err(MetadataError::RevisionMismatch),
                None => return Err(MetadataError::NotFound),
            }
        }
        entries.insert(key.to_string(), (value, new_rev));
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn del(&self, key: &str, rev: Option<Revision>) -> Result<(), MetadataError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, current)) => {
                if let Some(expected) = rev {
                    if *current != expected {
                        return Err(MetadataError::RevisionMismatch);
                    }
                }
            }
            None => return Err(MetadataError::NotFound),
        }
        entries.remove(key);
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn del_with_catalog(
        &self,
        _catalog_key: &str,
        key: &str,
        rev: Option<Revision>,
    ) -> Result<(), MetadataError> {
        // prefix-addressed catalogs need no membership update
        self.del(key, rev).await
    }

    async fn get_all_from_catalog(
        &self,
        catalog_key: &str,
    ) -> Result<Vec<MetaEntry>, MetadataError> {
        let entries = self.entries.lock();
        Ok(entries
            .range(catalog_key.to_string()..)
            .take_while(|(k, _)| k.starts_with(catalog_key))
            .filter(|(k, _)| Self::in_catalog(k, catalog_key))
            .map(|(k, (v, rev))| MetaEntry {
                key: k.clone(),
                value: v.clone(),
                rev: Some(*rev),
            })
            .collect())
    }

    async fn del_all_from_catalog(&self, catalog_key: &str) -> Result<(), MetadataError> {
        let mut entries = self.entries.lock();
        let keys: Vec<String> = entries
            .range(catalog_key.to_string()..)
            .take_while(|(k, _)| k.starts_with(catalog_key))
            .filter(|(k, _)| Self::in_catalog(k, catalog_key))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            entries.remove(&key);
            self.write_ops.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
