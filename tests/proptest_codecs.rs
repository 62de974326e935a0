//! Property-based tests for the extras codecs and checkpoint documents.

use proptest::prelude::*;

use magnetite::checkpoints::{CheckpointRecord, CheckpointsDoc, MAX_CHECKPOINTS_PER_DOC};
use magnetite::wire::{
    decode_document_extras, decode_snapshot_extras, encode_document_extras,
    encode_snapshot_extras, UprEvent,
};

fn arb_event() -> impl Strategy<Value = UprEvent> {
    (
        any::<u32>(),
        any::<u32>(),
        any::<u64>(),
        any::<u64>(),
        any::<u64>(),
        any::<u64>(),
        any::<u64>(),
        any::<u32>(),
        any::<u16>(),
    )
        .prop_map(
            |(
                flags,
                expiry,
                rev_seqno,
                cas,
                seqno,
                snap_start_seqno,
                snap_end_seqno,
                snapshot_type,
                metadata_size,
            )| UprEvent {
                flags,
                expiry,
                rev_seqno,
                cas,
                seqno,
                snap_start_seqno,
                snap_end_seqno,
                snapshot_type,
                metadata_size,
                ..UprEvent::default()
            },
        )
}

fn arb_record() -> impl Strategy<Value = CheckpointRecord> {
    (any::<u64>(), any::<u64>(), any::<u64>(), any::<u64>(), any::<u64>()).prop_map(
        |(vbucket_uuid, seqno, snapshot_start_seqno, snapshot_end_seqno, target_timestamp)| {
            CheckpointRecord {
                vbucket_uuid,
                seqno,
                snapshot_start_seqno,
                snapshot_end_seqno,
                target_timestamp,
            }
        },
    )
}

proptest! {
    #[test]
    fn prop_document_extras_round_trip(event in arb_event()) {
        let extras = encode_document_extras(&event, false);
        prop_assert_eq!(extras.len(), 24);
        let decoded = decode_document_extras(&extras).expect("decode");
        prop_assert_eq!(decoded.flags, event.flags);
        prop_assert_eq!(decoded.expiry, event.expiry);
        prop_assert_eq!(decoded.rev_seqno, event.rev_seqno);
        prop_assert_eq!(decoded.cas, event.cas);
        prop_assert_eq!(decoded.metadata_size, None);
    }

    #[test]
    fn prop_document_extras_ext_metadata_round_trip(event in arb_event()) {
        let extras = encode_document_extras(&event, true);
        prop_assert_eq!(extras.len(), 26);
        let decoded = decode_document_extras(&extras).expect("decode");
        prop_assert_eq!(decoded.metadata_size, Some(event.metadata_size));
    }

    #[test]
    fn prop_snapshot_extras_round_trip(event in arb_event()) {
        let extras = encode_snapshot_extras(&event);
        prop_assert_eq!(extras.len(), 28);
        let decoded = decode_snapshot_extras(&extras).expect("decode");
        prop_assert_eq!(decoded.seq_start, event.seqno);
        prop_assert_eq!(decoded.snap_start, event.snap_start_seqno);
        prop_assert_eq!(decoded.snap_end, event.snap_end_seqno);
        prop_assert_eq!(decoded.snapshot_type, event.snapshot_type);
    }

    #[test]
    fn prop_checkpoint_doc_dedupes_and_bounds(seqnos in proptest::collection::vec(any::<u64>(), 0..40)) {
        let mut doc = CheckpointsDoc::new();
        for seqno in &seqnos {
            let record = CheckpointRecord {
                vbucket_uuid: 1,
                seqno: *seqno,
                snapshot_start_seqno: 0,
                snapshot_end_seqno: 0,
                target_timestamp: 0,
            };
            let head_before = doc.head().copied();
            let added = doc.add_record(record);
            // a record equal to the head is suppressed, anything else lands
            prop_assert_eq!(added, head_before != Some(record));
            if added {
                prop_assert_eq!(doc.head().copied(), Some(record));
            }
        }
        prop_assert!(doc.checkpoints.len() <= MAX_CHECKPOINTS_PER_DOC);
    }

    #[test]
    fn prop_checkpoint_doc_serialization_round_trip(records in proptest::collection::vec(arb_record(), 0..5)) {
        let mut doc = CheckpointsDoc::new();
        for record in records {
            doc.add_record(record);
        }
        let payload = serde_json::to_vec(&doc).expect("encode");
        let restored: CheckpointsDoc = serde_json::from_slice(&payload).expect("decode");
        prop_assert_eq!(restored.checkpoints, doc.checkpoints);
        prop_assert!(restored.revision.is_none());
    }

    #[test]
    fn prop_monotonic_inserts_stay_strictly_decreasing(increments in proptest::collection::vec(0u64..100, 1..30)) {
        let mut doc = CheckpointsDoc::new();
        let mut seqno = 0u64;
        for increment in increments {
            seqno += increment;
            doc.add_record(CheckpointRecord {
                vbucket_uuid: 1,
                seqno,
                snapshot_start_seqno: 0,
                snapshot_end_seqno: 0,
                target_timestamp: 0,
            });
        }
        for pair in doc.checkpoints.windows(2) {
            prop_assert!(pair[0].seqno > pair[1].seqno);
        }
    }
}
