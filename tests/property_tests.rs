//! Property-based tests for bundlecast
//!
//! These tests verify invariants that must hold for all inputs:
//! - Chunk planning covers every chapter exactly once, in order
//! - Encoding is deterministic
//! - The sync diff fetches exactly the positions that changed
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// CHUNK PLANNING
// ============================================================================

mod plan_tests {
    use super::*;
    use bundlecast::codec::ChunkCodec;

    proptest! {
        /// Invariant: ranges are contiguous, ordered and cover every unit
        #[test]
        fn ranges_partition_units(
            sizes in prop::collection::vec(1usize..5_000, 0..64),
            threshold in 1usize..10_000,
        ) {
            let ranges = ChunkCodec::new(threshold, 6).plan(&sizes);
            let mut next = 0;
            for range in &ranges {
                prop_assert_eq!(range.start, next);
                prop_assert!(range.end > range.start);
                next = range.end;
            }
            prop_assert_eq!(next, sizes.len());
        }

        /// Invariant: a chunk only exceeds the threshold when it holds a
        /// single oversized unit
        #[test]
        fn multi_unit_chunks_fit_threshold(
            sizes in prop::collection::vec(1usize..5_000, 1..64),
            threshold in 1usize..10_000,
        ) {
            for range in ChunkCodec::new(threshold, 6).plan(&sizes) {
                let total: usize = sizes[range.clone()].iter().sum();
                if range.len() > 1 {
                    prop_assert!(total <= threshold);
                }
            }
        }

        /// Invariant: reaching the threshold exactly does not start a new chunk
        #[test]
        fn exact_threshold_stays_in_one_chunk(unit in 1usize..1_000, count in 1usize..8) {
            let sizes = vec![unit; count];
            let ranges = ChunkCodec::new(unit * count, 6).plan(&sizes);
            prop_assert_eq!(ranges.len(), 1);
        }
    }
}

// ============================================================================
// ENCODING
// ============================================================================

mod encode_tests {
    use super::*;
    use bundlecast::codec::{self, ChunkCodec};
    use bundlecast::snapshot::{Block, Chapter, DocumentSnapshot, Section};

    fn snapshot(texts: &[String]) -> DocumentSnapshot {
        DocumentSnapshot {
            document_id: "doc".to_string(),
            title: "Doc".to_string(),
            revision: None,
            chapters: texts
                .iter()
                .enumerate()
                .map(|(i, text)| Chapter {
                    id: format!("c{}", i),
                    title: String::new(),
                    sections: vec![Section {
                        id: format!("c{}.1", i),
                        title: String::new(),
                        blocks: vec![Block::paragraph(text.as_str())],
                        subsections: vec![],
                    }],
                })
                .collect(),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Invariant: identical snapshots produce identical chunks
        #[test]
        fn encoding_is_deterministic(
            texts in prop::collection::vec("[a-z ]{0,200}", 1..12),
            threshold in 64usize..2_048,
        ) {
            let codec = ChunkCodec::new(threshold, 6);
            let doc = snapshot(&texts);
            let first = codec.encode(&doc).unwrap();
            let second = codec.encode(&doc).unwrap();
            prop_assert_eq!(first.len(), second.len());
            for (a, b) in first.iter().zip(&second) {
                prop_assert_eq!(&a.checksum, &b.checksum);
                prop_assert_eq!(&a.payload, &b.payload);
            }
        }

        /// Invariant: decoding every chunk yields the chapters in order
        #[test]
        fn chunks_decode_to_original_chapters(
            texts in prop::collection::vec("[a-z ]{0,200}", 1..12),
            threshold in 64usize..2_048,
        ) {
            let doc = snapshot(&texts);
            let chunks = ChunkCodec::new(threshold, 6).encode(&doc).unwrap();
            let mut decoded = Vec::new();
            for chunk in &chunks {
                prop_assert_eq!(codec::checksum(&chunk.payload), chunk.checksum.clone());
                decoded.extend(codec::decode_chunk(&chunk.payload).unwrap());
            }
            prop_assert_eq!(decoded, doc.chapters);
        }
    }
}

// ============================================================================
// SYNC DIFF
// ============================================================================

mod diff_tests {
    use super::*;
    use bundlecast::codec::manifest_checksum;
    use bundlecast::sync::plan_sync;
    use bundlecast::types::{CachedManifestReport, SyncKind};

    fn report(checksums: Vec<String>) -> CachedManifestReport {
        CachedManifestReport {
            bundle_id: "old".to_string(),
            version: "1.0.0".to_string(),
            manifest_checksum: manifest_checksum(&checksums),
            chunk_checksums: checksums,
            last_modified: None,
        }
    }

    proptest! {
        /// Invariant: with k changed positions and nothing reusable, exactly
        /// those k positions are fetched
        #[test]
        fn fetches_only_changed_positions(
            changed in prop::collection::vec(any::<bool>(), 1..40),
        ) {
            let local: Vec<String> = (0..changed.len()).map(|i| format!("a{}", i)).collect();
            let authoritative: Vec<String> = changed
                .iter()
                .enumerate()
                .map(|(i, &c)| if c { format!("b{}", i) } else { format!("a{}", i) })
                .collect();
            let expected: Vec<u32> = changed
                .iter()
                .enumerate()
                .filter(|(_, &c)| c)
                .map(|(i, _)| i as u32)
                .collect();

            let plan = plan_sync(
                &manifest_checksum(&authoritative),
                &authoritative,
                Some(&report(local)),
            );

            prop_assert!(plan.reuse.is_empty());
            prop_assert_eq!(&plan.fetch, &expected);
            let kind = if expected.is_empty() {
                SyncKind::None
            } else if expected.len() == changed.len() {
                SyncKind::Full
            } else {
                SyncKind::Incremental
            };
            prop_assert_eq!(plan.kind, kind);
        }

        /// Invariant: every authoritative position is either already held,
        /// fetched or reused, never two of these
        #[test]
        fn positions_are_accounted_once(
            local in prop::collection::vec(0u8..6, 0..20),
            authoritative in prop::collection::vec(0u8..6, 1..20),
        ) {
            let local: Vec<String> = local.iter().map(|c| format!("c{}", c)).collect();
            let authoritative: Vec<String> =
                authoritative.iter().map(|c| format!("c{}", c)).collect();
            let reported = report(local.clone());

            let plan = plan_sync(
                &manifest_checksum(&authoritative),
                &authoritative,
                Some(&reported),
            );
            if plan.kind == SyncKind::None {
                prop_assert_eq!(&local, &authoritative);
                return Ok(());
            }

            for (i, checksum) in authoritative.iter().enumerate() {
                let i = i as u32;
                let held = local.get(i as usize) == Some(checksum);
                let fetched = plan.fetch.contains(&i);
                let reused = plan.reuse.iter().find(|r| r.target_index == i);
                let count = [held && plan.kind != SyncKind::Full, fetched, reused.is_some()]
                    .iter()
                    .filter(|&&b| b)
                    .count();
                prop_assert_eq!(count, 1, "position {} of {:?}", i, plan);
                if let Some(reuse) = reused {
                    prop_assert_eq!(&local[reuse.source_index as usize], checksum);
                }
            }
        }
    }
}
