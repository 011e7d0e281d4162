//! Property-based tests for segment and splitter invariants.
//!
//! These use proptest to verify invariants hold across randomly generated
//! inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;
use tokio_test::block_on;

use sluice_core::{Did, MemoryBackend, SegmentId};
use sluice_flow::segment::{calculate_total_size, Content, ContentStore, Segment};
use sluice_flow::splitter::{split_content, SplitParameters};

/// Raw segment descriptors: (object pool index, offset, size).
fn arb_segment_descriptors() -> impl Strategy<Value = Vec<(usize, u64, u64)>> {
    prop::collection::vec((0..3usize, 0..100u64, 1..50u64), 1..20)
}

proptest! {
    /// Total stored size never exceeds the naive sum of segment sizes, with
    /// equality exactly when no two same-object ranges overlap.
    #[test]
    fn total_size_bounded_by_naive_sum(descriptors in arb_segment_descriptors()) {
        let did = Did::generate();
        let pool = [
            SegmentId::generate(),
            SegmentId::generate(),
            SegmentId::generate(),
        ];

        let segments: Vec<Segment> = descriptors
            .iter()
            .map(|&(object, offset, size)| Segment::new(pool[object], offset, size, did))
            .collect();

        let total = calculate_total_size(&segments);
        let naive: u64 = segments.iter().map(|s| s.size).sum();
        prop_assert!(total <= naive);

        // Detect strict overlap within each object's ranges. Sorted by
        // start, any overlap shows up between consecutive ranges.
        let mut overlap = false;
        for object in &pool {
            let mut ranges: Vec<(u64, u64)> = segments
                .iter()
                .filter(|s| s.uuid == *object)
                .map(|s| (s.offset, s.offset + s.size))
                .collect();
            ranges.sort_unstable();
            if ranges.windows(2).any(|w| w[1].0 < w[0].1) {
                overlap = true;
            }
        }
        prop_assert_eq!(total == naive, !overlap);
    }

    /// A sub-reference reads exactly the bytes of the corresponding slice.
    #[test]
    fn subreference_matches_byte_slice(
        data in prop::collection::vec(any::<u8>(), 1..200),
        raw_offset in 0..200u64,
        raw_size in 0..200u64,
    ) {
        let len = data.len() as u64;
        let offset = raw_offset % len;
        let size = raw_size % (len - offset + 1);

        block_on(async {
            let store = ContentStore::new(Arc::new(MemoryBackend::new()));
            let content = store
                .save(Did::generate(), Bytes::from(data.clone()))
                .await
                .expect("save");

            let sliced = content
                .subreference(offset, size, None, None)
                .expect("subreference in range");
            let bytes = store.load(&sliced).await.expect("load");

            let start = usize::try_from(offset).unwrap();
            let end = usize::try_from(offset + size).unwrap();
            assert_eq!(&bytes[..], &data[start..end]);
        });
    }

    /// Without headers or comments, split chunks concatenate back to the
    /// original bytes.
    #[test]
    fn split_chunks_reassemble(
        lines in prop::collection::vec("[a-z0-9]{0,12}", 0..20),
        max_rows in 1..5usize,
    ) {
        let data: String = lines.iter().map(|l| format!("{l}\n")).collect();

        block_on(async {
            let store = ContentStore::new(Arc::new(MemoryBackend::new()));
            let content = if data.is_empty() {
                Content::default()
            } else {
                store
                    .save(Did::generate(), Bytes::from(data.clone()))
                    .await
                    .expect("save")
            };

            let params = SplitParameters {
                max_rows,
                ..SplitParameters::default()
            };
            let chunks =
                split_content(&content, &Bytes::from(data.clone()), &params).expect("split");

            for chunk in &chunks {
                let rows = store.load(chunk).await.expect("load chunk");
                let row_count = rows.iter().filter(|b| **b == b'\n').count();
                assert!(row_count <= max_rows);
            }

            let mut reassembled = Vec::new();
            for chunk in &chunks {
                reassembled.extend_from_slice(&store.load(chunk).await.expect("load chunk"));
            }
            assert_eq!(reassembled, data.as_bytes());
        });
    }
}
