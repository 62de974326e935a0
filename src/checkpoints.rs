//! Per-vBucket replication checkpoints
//!
//! Each (topic, vBucket) pair owns one checkpoint document in the metadata
//! store, holding a short history of resume points (most recent first). The
//! service deduplicates upserts against the document head and always writes
//! without a revision precondition: there is a single writer per
//! (topic, vBucket) by construction, and a lost update can only lose
//! progress, never correctness.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::metadata::{MetadataError, MetadataSvc, Revision};

/// Reserved delimiter between key parts; topics may not contain it.
pub const KEY_PARTS_DELIMITER: &str = "|";

/// Prefix of checkpoint document keys and of the per-topic catalog key.
pub const CHECKPOINTS_KEY_PREFIX: &str = "ckpt";

/// Records kept per checkpoint document, most recent first.
pub const MAX_CHECKPOINTS_PER_DOC: usize = 5;

/// Errors from the checkpoint service.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Metadata store failure.
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// Document payload could not be encoded or decoded.
    #[error("checkpoint document encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A catalog key did not carry a parseable vBucket suffix.
    #[error("malformed checkpoint document key: {0}")]
    BadKey(String),
}

/// The last durable position of one vBucket stream.
///
/// Equality is structural; the upsert path uses it to suppress duplicate
/// writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// UUID of the source vBucket incarnation.
    pub vbucket_uuid: u64,
    /// Sequence number the stream can resume from.
    pub seqno: u64,
    /// Snapshot start sequence number at the checkpoint.
    pub snapshot_start_seqno: u64,
    /// Snapshot end sequence number at the checkpoint.
    pub snapshot_end_seqno: u64,
    /// Remote (destination) timestamp at the checkpoint.
    pub target_timestamp: u64,
}

/// Per-(topic, vBucket) container of recent checkpoint records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointsDoc {
    /// Records, most recent first, in strictly decreasing seqno order.
    pub checkpoints: Vec<CheckpointRecord>,
    /// Store revision; attached after deserialization, never serialized.
    #[serde(skip)]
    pub revision: Option<Revision>,
}

impl CheckpointsDoc {
    /// An empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent record, if any.
    pub fn head(&self) -> Option<&CheckpointRecord> {
        self.checkpoints.first()
    }

    /// Prepend a record unless it is structurally equal to the head.
    ///
    /// Returns `false` (document unchanged) on a duplicate. The history is
    /// truncated to [`MAX_CHECKPOINTS_PER_DOC`].
    pub fn add_record(&mut self, record: CheckpointRecord) -> bool {
        if self.head() == Some(&record) {
            return false;
        }
        self.checkpoints.insert(0, record);
        self.checkpoints.truncate(MAX_CHECKPOINTS_PER_DOC);
        true
    }
}

/// Checkpoint persistence through the metadata store.
pub struct CheckpointsService {
    metadata_svc: Arc<dyn MetadataSvc>,
    max_records: usize,
}

impl CheckpointsService {
    /// Create a service persisting through the given store.
    pub fn new(metadata_svc: Arc<dyn MetadataSvc>) -> Self {
        Self {
            metadata_svc,
            max_records: MAX_CHECKPOINTS_PER_DOC,
        }
    }

    /// Lower the per-document record bound below
    /// [`MAX_CHECKPOINTS_PER_DOC`].
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.clamp(1, MAX_CHECKPOINTS_PER_DOC);
        self
    }

    fn catalog_key(topic: &str) -> String {
        format!("{CHECKPOINTS_KEY_PREFIX}{KEY_PARTS_DELIMITER}{topic}")
    }

    fn doc_key(topic: &str, vbno: u16) -> String {
        format!("{}{KEY_PARTS_DELIMITER}{vbno}", Self::catalog_key(topic))
    }

    fn vbno_from_doc_key(doc_key: &str) -> Result<u16, CheckpointError> {
        doc_key
            .rsplit(KEY_PARTS_DELIMITER)
            .next()
            .and_then(|part| part.parse::<u16>().ok())
            .ok_or_else(|| CheckpointError::BadKey(doc_key.to_string()))
    }

    fn decode_doc(content: &[u8], rev: Option<Revision>) -> Result<CheckpointsDoc, CheckpointError> {
        // an empty payload reads as an empty document
        let mut doc: CheckpointsDoc = if content.is_empty() {
            CheckpointsDoc::new()
        } else {
            serde_json::from_slice(content)?
        };
        doc.revision = rev;
        Ok(doc)
    }

    /// Read the checkpoint document for one vBucket.
    pub async fn checkpoints_doc(
        &self,
        topic: &str,
        vbno: u16,
    ) -> Result<CheckpointsDoc, CheckpointError> {
        let key = Self::doc_key(topic, vbno);
        let (content, rev) = self.metadata_svc.get(&key).await?;
        Self::decode_doc(&content, Some(rev))
    }

    /// Enumerate every checkpoint document of a topic, keyed by vBucket.
    pub async fn checkpoints_docs(
        &self,
        topic: &str,
    ) -> Result<HashMap<u16, CheckpointsDoc>, CheckpointError> {
        let mut docs = HashMap::new();
        let entries = self
            .metadata_svc
            .get_all_from_catalog(&Self::catalog_key(topic))
            .await?;
        for entry in entries {
            let vbno = Self::vbno_from_doc_key(&entry.key)?;
            docs.insert(vbno, Self::decode_doc(&entry.value, entry.rev)?);
        }
        Ok(docs)
    }

    /// Persist a checkpoint record for one vBucket.
    ///
    /// A record structurally equal to the current document head produces no
    /// store write. The write carries no revision precondition
    /// (last-writer-wins; single writer per (topic, vBucket)).
    pub async fn upsert_checkpoint(
        &self,
        topic: &str,
        vbno: u16,
        record: CheckpointRecord,
    ) -> Result<(), CheckpointError> {
        debug!(topic, vbno, seqno = record.seqno, "persisting checkpoint record");
        let key = Self::doc_key(topic, vbno);

        let mut doc = match self.metadata_svc.get(&key).await {
            Ok((content, rev)) => Self::decode_doc(&content, Some(rev))?,
            Err(MetadataError::NotFound) => CheckpointsDoc::new(),
            Err(e) => return Err(e.into()),
        };

        // single writer per (topic, vbno): the head may only move forward
        debug_assert!(
            doc.head().map_or(true, |head| record.seqno >= head.seqno),
            "checkpoint seqno moved backwards for {topic} vb {vbno}"
        );

        if !doc.add_record(record) {
            debug!(topic, vbno, "checkpoint record equals current head, skipping write");
            return Ok(());
        }
        doc.checkpoints.truncate(self.max_records);

        let payload = serde_json::to_vec(&doc)?;
        if let Err(e) = self.metadata_svc.set(&key, payload.into(), None).await {
            error!(topic, vbno, error = %e, "failed to set checkpoint document");
            return Err(e.into());
        }
        Ok(())
    }

    /// Delete the checkpoint document of one vBucket.
    pub async fn del_checkpoints_doc(&self, topic: &str, vbno: u16) -> Result<(), CheckpointError> {
        info!(topic, vbno, "deleting checkpoint document");
        let key = Self::doc_key(topic, vbno);
        let (_, rev) = self.metadata_svc.get(&key).await?;
        self.metadata_svc
            .del_with_catalog(&Self::catalog_key(topic), &key, Some(rev))
            .await?;
        Ok(())
    }

    /// Delete every checkpoint document of a topic.
    pub async fn del_checkpoints_docs(&self, topic: &str) -> Result<(), CheckpointError> {
        info!(topic, "deleting all checkpoint documents");
        if let Err(e) = self
            .metadata_svc
            .del_all_from_catalog(&Self::catalog_key(topic))
            .await
        {
            error!(topic, error = %e, "failed to delete checkpoint documents");
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::memory::MemMetadataSvc;

    fn record(seqno: u64) -> CheckpointRecord {
        CheckpointRecord {
            vbucket_uuid: 0xCAFE,
            seqno,
            snapshot_start_seqno: seqno.saturating_sub(10),
            snapshot_end_seqno: seqno + 10,
            target_timestamp: 1_000 + seqno,
        }
    }

    fn service() -> (CheckpointsService, Arc<MemMetadataSvc>) {
        let store = Arc::new(MemMetadataSvc::new());
        (CheckpointsService::new(store.clone()), store)
    }

    #[test]
    fn test_doc_key_schema() {
        assert_eq!(CheckpointsService::doc_key("t1", 12), "ckpt|t1|12");
        assert_eq!(CheckpointsService::catalog_key("t1"), "ckpt|t1");
        assert_eq!(
            CheckpointsService::vbno_from_doc_key("ckpt|t1|12").expect("vbno"),
            12
        );
        assert!(CheckpointsService::vbno_from_doc_key("ckpt|t1|x").is_err());
    }

    #[test]
    fn test_add_record_dedupes_head() {
        let mut doc = CheckpointsDoc::new();
        assert!(doc.add_record(record(5)));
        assert!(!doc.add_record(record(5)));
        assert!(doc.add_record(record(9)));
        assert_eq!(doc.checkpoints.len(), 2);
        assert_eq!(doc.head().expect("head").seqno, 9);
    }

    #[test]
    fn test_doc_bounded() {
        let mut doc = CheckpointsDoc::new();
        for seqno in 0..20 {
            doc.add_record(record(seqno));
        }
        assert_eq!(doc.checkpoints.len(), MAX_CHECKPOINTS_PER_DOC);
        assert_eq!(doc.head().expect("head").seqno, 19);
    }

    #[test]
    fn test_doc_serialization_skips_revision() {
        let mut doc = CheckpointsDoc::new();
        doc.add_record(record(3));
        doc.revision = Some(Revision(7));

        let payload = serde_json::to_vec(&doc).expect("encode");
        let restored: CheckpointsDoc = serde_json::from_slice(&payload).expect("decode");
        assert_eq!(restored.checkpoints, doc.checkpoints);
        assert_eq!(restored.revision, None);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_at_head() {
        let (svc, store) = service();

        svc.upsert_checkpoint("t1", 0, record(5)).await.expect("upsert");
        assert_eq!(store.write_ops(), 1);

        // identical record: no store write
        svc.upsert_checkpoint("t1", 0, record(5)).await.expect("upsert");
        assert_eq!(store.write_ops(), 1);

        // a different record writes and becomes the head
        svc.upsert_checkpoint("t1", 0, record(8)).await.expect("upsert");
        assert_eq!(store.write_ops(), 2);
        let doc = svc.checkpoints_doc("t1", 0).await.expect("doc");
        assert_eq!(doc.head().expect("head").seqno, 8);
    }

    #[tokio::test]
    async fn test_revision_restored_from_store() {
        let (svc, _) = service();
        svc.upsert_checkpoint("t1", 3, record(5)).await.expect("upsert");
        let doc = svc.checkpoints_doc("t1", 3).await.expect("doc");
        assert!(doc.revision.is_some());
    }

    #[tokio::test]
    async fn test_enumerate_by_vbucket() {
        let (svc, _) = service();
        svc.upsert_checkpoint("t1", 0, record(5)).await.expect("upsert");
        svc.upsert_checkpoint("t1", 7, record(9)).await.expect("upsert");
        svc.upsert_checkpoint("t2", 1, record(2)).await.expect("upsert");

        let docs = svc.checkpoints_docs("t1").await.expect("docs");
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[&0].head().expect("head").seqno, 5);
        assert_eq!(docs[&7].head().expect("head").seqno, 9);
    }

    #[tokio::test]
    async fn test_delete_one_and_all() {
        let (svc, _) = service();
        svc.upsert_checkpoint("t1", 0, record(5)).await.expect("upsert");
        svc.upsert_checkpoint("t1", 1, record(6)).await.expect("upsert");

        svc.del_checkpoints_doc("t1", 0).await.expect("del one");
        assert!(matches!(
            svc.checkpoints_doc("t1", 0).await,
            Err(CheckpointError::Metadata(MetadataError::NotFound))
        ));

        svc.del_checkpoints_docs("t1").await.expect("del all");
        assert!(svc.checkpoints_docs("t1").await.expect("docs").is_empty());
    }

    #[tokio::test]
    async fn test_records_strictly_decreasing() {
        let (svc, _) = service();
        for seqno in [3u64, 5, 9, 12] {
            svc.upsert_checkpoint("t1", 0, record(seqno)).await.expect("upsert");
        }
        let doc = svc.checkpoints_doc("t1", 0).await.expect("doc");
        for pair in doc.checkpoints.windows(2) {
            assert!(pair[0].seqno > pair[1].seqno);
        }
    }
}
