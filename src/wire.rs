//! Wire-level types shared by the router and the destination write path
//!
//! Models the UPR stream events arriving from the source cluster and the
//! memcached requests sent to the destination, including the bit-exact
//! extras layouts and the extended-metadata blob carrying the
//! conflict-resolution mode.

use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Version byte expected at the head of an extended-metadata blob.
pub const EXT_METADATA_VERSION: u8 = 1;

/// Field id of the conflict-resolution mode inside an extended-metadata blob.
pub const CR_MODE_FIELD_ID: u8 = 1;

/// Errors from extras decoding.
#[derive(Debug, Error)]
pub enum WireError {
    /// The extras buffer is shorter than the layout requires.
    #[error("extras too short: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes the layout requires.
        expected: usize,
        /// Bytes actually present.
        actual: usize,
    },
}

// ── Opcodes ──────────────────────────────────────────────────────────────────

/// UPR stream opcodes, carrying their memcached wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum UprOpcode {
    /// Document mutation.
    #[default]
    Mutation = 0x57,
    /// Document deletion.
    Deletion = 0x58,
    /// Document expiration.
    Expiration = 0x59,
    /// Snapshot boundary marker.
    SnapshotMarker = 0x56,
}

impl UprOpcode {
    /// Returns `true` for the opcodes that carry a document payload
    /// (mutation, deletion, expiration).
    pub fn is_document_op(self) -> bool {
        matches!(self, Self::Mutation | Self::Deletion | Self::Expiration)
    }
}

// ── Conflict resolution ──────────────────────────────────────────────────────

/// Per-mutation conflict-resolution mode understood by the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrMode {
    /// Revision-id based resolution.
    #[default]
    RevId,
    /// Last-write-wins resolution.
    Lww,
}

impl CrMode {
    /// Decode from the single-byte wire value; unknown values fall back to
    /// revision-id resolution.
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Lww,
            _ => Self::RevId,
        }
    }
}

/// Decode the conflict-resolution mode from an extended-metadata blob.
///
/// Blob layout: `version(u8)` followed by `(id(u8) ‖ len(u16 BE) ‖ value)`
/// entries. Entries are walked until the conflict-resolution id is found.
/// Returns [`CrMode::RevId`] when the blob is empty, the version byte does
/// not match, or the id is absent.
///
/// # Panics
///
/// Panics if a conflict-resolution entry has a length other than 1: the
/// upstream producer guarantees the layout, so a violation is a programming
/// error rather than recoverable input.
pub fn decode_cr_mode(ext_meta: &[u8]) -> CrMode {
    if ext_meta.len() > 1 && ext_meta[0] == EXT_METADATA_VERSION {
        let mut idx = 1;
        while idx + 3 <= ext_meta.len() {
            let id = ext_meta[idx];
            let len = u16::from_be_bytes([ext_meta[idx + 1], ext_meta[idx + 2]]) as usize;
            if id == CR_MODE_FIELD_ID {
                // the conflict-resolution mode has a fixed length of 1 byte
                if len != 1 || idx + 3 >= ext_meta.len() {
                    panic!(
                        "malformed extended metadata for conflict resolution mode: {:?}",
                        ext_meta
                    );
                }
                return CrMode::from_u8(ext_meta[idx + 3]);
            }
            idx += 3 + len;
        }
    }
    CrMode::RevId
}

// ── Events and requests ──────────────────────────────────────────────────────

/// One event from the source stream producer.
#[derive(Debug, Clone, Default)]
pub struct UprEvent {
    /// Stream opcode.
    pub opcode: UprOpcode,
    /// Source vBucket number.
    pub vbucket: u16,
    /// Document key (raw bytes).
    pub key: Bytes,
    /// Document body.
    pub value: Bytes,
    /// Document CAS.
    pub cas: u64,
    /// Document flags.
    pub flags: u32,
    /// Document expiry.
    pub expiry: u32,
    /// Mutation sequence number.
    pub seqno: u64,
    /// Revision sequence number.
    pub rev_seqno: u64,
    /// Snapshot start sequence number.
    pub snap_start_seqno: u64,
    /// Snapshot end sequence number.
    pub snap_end_seqno: u64,
    /// Snapshot type bits.
    pub snapshot_type: u32,
    /// Size of the extended metadata attached to the event.
    pub metadata_size: u16,
    /// Opaque extended-metadata blob.
    pub ext_meta: Bytes,
}

/// A memcached request bound for the destination cluster.
#[derive(Debug, Clone, Default)]
pub struct McRequest {
    /// Request opcode (copied from the source event).
    pub opcode: UprOpcode,
    /// Document CAS.
    pub cas: u64,
    /// Request opaque; always zero on composed requests.
    pub opaque: u32,
    /// Destination vBucket.
    pub vbucket: u16,
    /// Document key.
    pub key: Bytes,
    /// Document body.
    pub body: Bytes,
    /// Encoded extras (see the layout functions below).
    pub extras: Bytes,
    /// Extended-metadata blob, attached out-of-band when supported.
    pub ext_meta: Bytes,
}

/// A composed request plus the bookkeeping the downstream workers need.
#[derive(Debug, Clone)]
pub struct WrappedMcRequest {
    /// The destination request.
    pub req: McRequest,
    /// Sequence number of the originating event.
    pub seqno: u64,
    /// When the request was composed.
    pub start_time: Instant,
    /// Unique key for downstream bookkeeping (document key ‖ seqno).
    pub unique_key: String,
    /// Conflict-resolution mode decoded from the extended metadata.
    pub cr_mode: CrMode,
}

impl WrappedMcRequest {
    /// A fresh, empty wrapped request.
    pub fn new() -> Self {
        Self {
            req: McRequest::default(),
            seqno: 0,
            start_time: Instant::now(),
            unique_key: String::new(),
            cr_mode: CrMode::RevId,
        }
    }

    /// Derive the unique key from the request key and sequence number.
    pub fn construct_unique_key(&mut self) {
        self.unique_key = format!("{}-{}", String::from_utf8_lossy(&self.req.key), self.seqno);
    }
}

impl Default for WrappedMcRequest {
    fn default() -> Self {
        Self::new()
    }
}

// ── Extras codecs ────────────────────────────────────────────────────────────

/// Extras fields of a mutation/deletion/expiration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentExtras {
    /// Document flags.
    pub flags: u32,
    /// Document expiry.
    pub expiry: u32,
    /// Revision sequence number.
    pub rev_seqno: u64,
    /// Document CAS.
    pub cas: u64,
    /// Extended-metadata size; present only in the 26-byte layout.
    pub metadata_size: Option<u16>,
}

/// Extras fields of a snapshot-marker request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotExtras {
    /// Sequence number at the marker.
    pub seq_start: u64,
    /// Snapshot start sequence number.
    pub snap_start: u64,
    /// Snapshot end sequence number.
    pub snap_end: u64,
    /// Snapshot type bits.
    pub snapshot_type: u32,
}

/// Encode document-op extras, big-endian.
///
/// 24 bytes `Flags‖Expiry‖RevSeqno‖CAS` with extended metadata off, 26 bytes
/// with the trailing `MetadataSize(u16)` when it is on.
pub fn encode_document_extras(event: &UprEvent, ext_metadata: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(if ext_metadata { 26 } else { 24 });
    buf.put_u32(event.flags);
    buf.put_u32(event.expiry);
    buf.put_u64(event.rev_seqno);
    buf.put_u64(event.cas);
    if ext_metadata {
        buf.put_u16(event.metadata_size);
    }
    buf.freeze()
}

/// Encode snapshot-marker extras: 28 bytes
/// `SeqStart‖SnapStart‖SnapEnd‖SnapshotType`, big-endian.
pub fn encode_snapshot_extras(event: &UprEvent) -> Bytes {
    let mut buf = BytesMut::with_capacity(28);
    buf.put_u64(event.seqno);
    buf.put_u64(event.snap_start_seqno);
    buf.put_u64(event.snap_end_seqno);
    buf.put_u32(event.snapshot_type);
    buf.freeze()
}

/// Decode document-op extras; accepts both the 24- and 26-byte layouts.
pub fn decode_document_extras(extras: &[u8]) -> Result<DocumentExtras, WireError> {
    if extras.len() != 24 && extras.len() != 26 {
        return Err(WireError::Truncated {
            expected: 24,
            actual: extras.len(),
        });
    }
    let mut buf = extras;
    let flags = buf.get_u32();
    let expiry = buf.get_u32();
    let rev_seqno = buf.get_u64();
    let cas = buf.get_u64();
    let metadata_size = if buf.has_remaining() {
        Some(buf.get_u16())
    } else {
        None
    };
    Ok(DocumentExtras {
        flags,
        expiry,
        rev_seqno,
        cas,
        metadata_size,
    })
}

/// Decode snapshot-marker extras (28 bytes).
pub fn decode_snapshot_extras(extras: &[u8]) -> Result<SnapshotExtras, WireError> {
    if extras.len() != 28 {
        return Err(WireError::Truncated {
            expected: 28,
            actual: extras.len(),
        });
    }
    let mut buf = extras;
    Ok(SnapshotExtras {
        seq_start: buf.get_u64(),
        snap_start: buf.get_u64(),
        snap_end: buf.get_u64(),
        snapshot_type: buf.get_u32(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> UprEvent {
        UprEvent {
            opcode: UprOpcode::Mutation,
            vbucket: 7,
            key: Bytes::from_static(b"doc_1"),
            value: Bytes::from_static(b"{}"),
            cas: 0x99AA_BBCC_DDEE_FF00,
            flags: 0x0102_0304,
            expiry: 0x0506_0708,
            seqno: 42,
            rev_seqno: 0x1122_3344_5566_7788,
            snap_start_seqno: 40,
            snap_end_seqno: 50,
            snapshot_type: 1,
            metadata_size: 6,
            ext_meta: Bytes::new(),
        }
    }

    #[test]
    fn test_document_extras_exact_bytes() {
        let extras = encode_document_extras(&sample_event(), false);
        assert_eq!(
            extras.as_ref(),
            &[
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x11, 0x22, 0x33, 0x44, 0x55,
                0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00,
            ]
        );
    }

    #[test]
    fn test_document_extras_round_trip() {
        let event = sample_event();
        let decoded = decode_document_extras(&encode_document_extras(&event, false)).expect("decode");
        assert_eq!(decoded.flags, event.flags);
        assert_eq!(decoded.expiry, event.expiry);
        assert_eq!(decoded.rev_seqno, event.rev_seqno);
        assert_eq!(decoded.cas, event.cas);
        assert_eq!(decoded.metadata_size, None);
    }

    #[test]
    fn test_document_extras_ext_metadata_round_trip() {
        let event = sample_event();
        let extras = encode_document_extras(&event, true);
        assert_eq!(extras.len(), 26);
        let decoded = decode_document_extras(&extras).expect("decode");
        assert_eq!(decoded.metadata_size, Some(event.metadata_size));
    }

    #[test]
    fn test_snapshot_extras_round_trip() {
        let event = UprEvent {
            opcode: UprOpcode::SnapshotMarker,
            ..sample_event()
        };
        let extras = encode_snapshot_extras(&event);
        assert_eq!(extras.len(), 28);
        let decoded = decode_snapshot_extras(&extras).expect("decode");
        assert_eq!(decoded.seq_start, event.seqno);
        assert_eq!(decoded.snap_start, event.snap_start_seqno);
        assert_eq!(decoded.snap_end, event.snap_end_seqno);
        assert_eq!(decoded.snapshot_type, event.snapshot_type);
    }

    #[test]
    fn test_decode_truncated_extras() {
        assert!(decode_document_extras(&[0; 10]).is_err());
        assert!(decode_snapshot_extras(&[0; 27]).is_err());
    }

    #[test]
    fn test_cr_mode_decode_lww() {
        // version 1, entry (id=1, len=1, value=1)
        let blob = [EXT_METADATA_VERSION, CR_MODE_FIELD_ID, 0x00, 0x01, 0x01];
        assert_eq!(decode_cr_mode(&blob), CrMode::Lww);
    }

    #[test]
    fn test_cr_mode_skips_other_fields() {
        // version 1, entry (id=9, len=2), then (id=1, len=1, value=1)
        let blob = [
            EXT_METADATA_VERSION,
            9,
            0x00,
            0x02,
            0xAB,
            0xCD,
            CR_MODE_FIELD_ID,
            0x00,
            0x01,
            0x01,
        ];
        assert_eq!(decode_cr_mode(&blob), CrMode::Lww);
    }

    #[test]
    fn test_cr_mode_defaults() {
        // empty blob
        assert_eq!(decode_cr_mode(&[]), CrMode::RevId);
        // version mismatch
        let blob = [0x7F, CR_MODE_FIELD_ID, 0x00, 0x01, 0x01];
        assert_eq!(decode_cr_mode(&blob), CrMode::RevId);
        // id absent
        let blob = [EXT_METADATA_VERSION, 9, 0x00, 0x01, 0x01];
        assert_eq!(decode_cr_mode(&blob), CrMode::RevId);
    }

    #[test]
    #[should_panic(expected = "malformed extended metadata")]
    fn test_cr_mode_bad_length_panics() {
        let blob = [EXT_METADATA_VERSION, CR_MODE_FIELD_ID, 0x00, 0x02, 0x01, 0x01];
        decode_cr_mode(&blob);
    }

    #[test]
    fn test_unique_key() {
        let mut wrapped = WrappedMcRequest::new();
        wrapped.req.key = Bytes::from_static(b"k1");
        wrapped.seqno = 17;
        wrapped.construct_unique_key();
        assert_eq!(wrapped.unique_key, "k1-17");
    }
}
