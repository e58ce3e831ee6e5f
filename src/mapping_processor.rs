// Post-processing over the shared per-reference mapping containers: sorting,
// PCR-duplicate removal, Tn5 shifting, and multi-mapping allocation against
// an implicit augmented interval tree over the uniquely mapped records.

use std::marker::PhantomData;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::mappings::MappingRecord;
use crate::utils;

/// MAPQ (without the strand bit) at and above which a mapping counts as
/// unique for allocation and statistics.
const UNIQUE_MAPPING_MAPQ: u8 = 30;

pub struct MappingProcessor<R> {
    multi_mapping_allocation_distance: u32,
    multi_mapping_allocation_seed: u64,
    _marker: PhantomData<R>,
}

/// Implicit interval tree node layout bookkeeping for one reference.
struct AugmentedTree {
    /// max fragment end over each node's subtree.
    extras: Vec<u32>,
    max_level: i32,
}

impl<R: MappingRecord> MappingProcessor<R> {
    pub fn new(multi_mapping_allocation_distance: u32, multi_mapping_allocation_seed: u64) -> Self {
        MappingProcessor {
            multi_mapping_allocation_distance,
            multi_mapping_allocation_seed,
            _marker: PhantomData,
        }
    }

    /// Move each batch's thread-local buckets into the shared container.
    /// Contents are moved, not copied; the buffers come back empty with
    /// their capacity intact. Returns the number of records moved.
    pub fn move_mappings_in_buffers_to_mapping_container(
        &self,
        num_reference_sequences: u32,
        buffers: &mut [Vec<Vec<R>>],
        container: &mut [Vec<R>],
    ) -> u64 {
        let start_time = utils::realtime();
        let mut num_moved: u64 = 0;
        for thread_buffers in buffers.iter_mut() {
            for rid in 0..num_reference_sequences as usize {
                num_moved += thread_buffers[rid].len() as u64;
                container[rid].append(&mut thread_buffers[rid]);
            }
        }
        log::debug!(
            "Moved {} mappings in {:.2}s",
            num_moved,
            utils::realtime() - start_time
        );
        num_moved
    }

    pub fn sort_output_mappings(&self, container: &mut [Vec<R>]) {
        let start_time = utils::realtime();
        let mut num_mappings = 0usize;
        for bucket in container.iter_mut() {
            bucket.sort();
            num_mappings += bucket.len();
        }
        log::info!(
            "Sorted {} mappings in {:.2}s",
            num_mappings,
            utils::realtime() - start_time
        );
    }

    /// Per-reference sorts run in parallel; references are independent.
    pub fn parallel_sort_output_mappings(&self, container: &mut [Vec<R>]) {
        let start_time = utils::realtime();
        container.par_iter_mut().for_each(|bucket| bucket.sort());
        let num_mappings: usize = container.iter().map(|b| b.len()).sum();
        log::info!(
            "Sorted {} mappings in {:.2}s",
            num_mappings,
            utils::realtime() - start_time
        );
    }

    /// Sort, then collapse runs of records equal under the dedupe relation,
    /// keeping the first of each run.
    pub fn remove_pcr_duplicates(&self, container: &mut [Vec<R>]) {
        let start_time = utils::realtime();
        container.par_iter_mut().for_each(|bucket| bucket.sort());
        let mut num_mappings = 0usize;
        for bucket in container.iter_mut() {
            bucket.dedup_by(|current, kept| current.is_dup_of(kept));
            num_mappings += bucket.len();
        }
        log::info!(
            "{} mappings left after dedupe in {:.2}s",
            num_mappings,
            utils::realtime() - start_time
        );
    }

    pub fn apply_tn5_shift_on_mappings(&self, container: &mut [Vec<R>]) {
        let mut num_shifted_mappings: u64 = 0;
        for bucket in container.iter_mut() {
            for mapping in bucket.iter_mut() {
                mapping.apply_tn5_shift();
                num_shifted_mappings += 1;
            }
        }
        log::info!("Shifted {} mappings", num_shifted_mappings);
    }

    pub fn output_mapping_statistics(&self, container: &[Vec<R>]) {
        let mut num_uni_mappings: u64 = 0;
        let mut num_multi_mappings: u64 = 0;
        for bucket in container {
            for mapping in bucket {
                if mapping.mapping_quality() >= UNIQUE_MAPPING_MAPQ {
                    num_uni_mappings += 1;
                } else {
                    num_multi_mappings += 1;
                }
            }
        }
        log::info!(
            "# uni-mappings: {}, # multi-mappings: {}, total: {}",
            num_uni_mappings,
            num_multi_mappings,
            num_uni_mappings + num_multi_mappings
        );
    }

    /// Keep, for each multi-mapped read, exactly one placement, sampled with
    /// probability proportional to the number of uniquely mapped fragments
    /// overlapping it (within the allocation distance). Placements of reads
    /// that overlap no unique fragment anywhere are dropped. The container
    /// must be sorted; the surviving records are left in the container and
    /// the caller re-sorts.
    pub fn allocate_multi_mappings(&self, container: &mut [Vec<R>]) {
        let start_time = utils::realtime();
        let num_reference_sequences = container.len();
        let mut multi_mappings: Vec<(u32, R)> = Vec::new();
        let mut trees: Vec<AugmentedTree> = Vec::with_capacity(num_reference_sequences);

        for (rid, bucket) in container.iter_mut().enumerate() {
            let mut unique_mappings = Vec::with_capacity(bucket.len());
            for mapping in bucket.drain(..) {
                if mapping.mapping_quality() < UNIQUE_MAPPING_MAPQ {
                    multi_mappings.push((rid as u32, mapping));
                } else {
                    unique_mappings.push(mapping);
                }
            }
            *bucket = unique_mappings;
            trees.push(build_augmented_tree(bucket));
        }
        log::info!("Got all {} multi-mappings", multi_mappings.len());
        if multi_mappings.is_empty() {
            return;
        }
        multi_mappings.sort_by_key(|(_, mapping)| mapping.read_id());

        let mut generator = StdRng::seed_from_u64(self.multi_mapping_allocation_seed);
        let mut num_allocated_multi_mappings: u64 = 0;
        let mut num_multi_mappings_without_overlapping_unique_mappings: u64 = 0;

        let mut group_start = 0usize;
        while group_start < multi_mappings.len() {
            let read_id = multi_mappings[group_start].1.read_id();
            let mut group_end = group_start + 1;
            while group_end < multi_mappings.len()
                && multi_mappings[group_end].1.read_id() == read_id
            {
                group_end += 1;
            }
            let weights: Vec<u32> = multi_mappings[group_start..group_end]
                .iter()
                .map(|(rid, mapping)| {
                    count_overlapped_mappings(
                        &container[*rid as usize],
                        &trees[*rid as usize],
                        mapping,
                        self.multi_mapping_allocation_distance,
                    )
                })
                .collect();
            let sum_weight: u64 = weights.iter().map(|&w| w as u64).sum();
            if sum_weight == 0 {
                num_multi_mappings_without_overlapping_unique_mappings += 1;
            } else {
                let distribution = WeightedIndex::new(&weights).unwrap();
                let chosen = group_start + distribution.sample(&mut generator);
                let (rid, mapping) = multi_mappings[chosen].clone();
                container[rid as usize].push(mapping);
                num_allocated_multi_mappings += 1;
            }
            group_start = group_end;
        }
        log::info!(
            "Allocated {} multi-mappings in {:.2}s",
            num_allocated_multi_mappings,
            utils::realtime() - start_time
        );
        log::info!(
            "# multi-mappings that have no uni-mapping overlaps: {}",
            num_multi_mappings_without_overlapping_unique_mappings
        );
    }
}

/// Bottom-up max-end computation over the implicit complete-binary layout
/// (node i at level k has children i +/- 2^(k-1)).
fn build_augmented_tree<R: MappingRecord>(mappings: &[R]) -> AugmentedTree {
    let num_nodes = mappings.len();
    let mut extras = vec![0u32; num_nodes];
    if num_nodes == 0 {
        return AugmentedTree {
            extras,
            max_level: -1,
        };
    }
    let mut last_i = 0usize;
    let mut last = 0u32;
    let mut i = 0usize;
    while i < num_nodes {
        last_i = i;
        extras[i] =
            mappings[i].fragment_start_position() + mappings[i].fragment_length() as u32;
        last = extras[i];
        i += 2;
    }
    let mut k = 1;
    while (1usize << k) <= num_nodes {
        let x = 1usize << (k - 1);
        let i0 = (x << 1) - 1;
        let step = x << 2;
        let mut i = i0;
        while i < num_nodes {
            let end_left = extras[i - x];
            let end_right = if i + x < num_nodes { extras[i + x] } else { last };
            let mut end =
                mappings[i].fragment_start_position() + mappings[i].fragment_length() as u32;
            end = end.max(end_left).max(end_right);
            extras[i] = end;
            i += step;
        }
        last_i = if (last_i >> k) & 1 == 1 {
            last_i - x
        } else {
            last_i + x
        };
        if last_i < num_nodes && extras[last_i] > last {
            last = extras[last_i];
        }
        k += 1;
    }
    AugmentedTree {
        extras,
        max_level: k as i32 - 1,
    }
}

/// Count unique fragments overlapping `mapping`'s interval extended by the
/// allocation distance. Iterative top-down traversal with an explicit stack.
fn count_overlapped_mappings<R: MappingRecord>(
    mappings: &[R],
    tree: &AugmentedTree,
    mapping: &R,
    allocation_distance: u32,
) -> u32 {
    if tree.max_level < 0 {
        return 0;
    }
    let num_tree_nodes = mappings.len();
    let interval_start = mapping
        .fragment_start_position()
        .saturating_sub(allocation_distance);
    let interval_end = mapping.fragment_start_position()
        + mapping.fragment_length() as u32
        + allocation_distance;

    // (level, node index, left child processed)
    let mut stack: Vec<(i32, usize, bool)> = Vec::with_capacity(64);
    let mut num_overlapped_mappings = 0u32;
    stack.push((tree.max_level, (1usize << tree.max_level) - 1, false));
    while let Some((k, x, left_processed)) = stack.pop() {
        if k <= 3 {
            // Small subtree: scan it linearly.
            let i0 = (x >> k) << k;
            let mut i1 = i0 + (1usize << (k + 1)) - 1;
            if i1 >= num_tree_nodes {
                i1 = num_tree_nodes;
            }
            let mut i = i0;
            while i < i1 && mappings[i].fragment_start_position() < interval_end {
                if interval_start
                    < mappings[i].fragment_start_position() + mappings[i].fragment_length() as u32
                {
                    num_overlapped_mappings += 1;
                }
                i += 1;
            }
        } else if !left_processed {
            let y = x - (1usize << (k - 1));
            stack.push((k, x, true));
            if y >= num_tree_nodes || tree.extras[y] > interval_start {
                stack.push((k - 1, y, false));
            }
        } else if x < num_tree_nodes && mappings[x].fragment_start_position() < interval_end {
            if interval_start
                < mappings[x].fragment_start_position() + mappings[x].fragment_length() as u32
            {
                num_overlapped_mappings += 1;
            }
            stack.push((k - 1, x + (1usize << (k - 1)), false));
        }
    }
    num_overlapped_mappings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappings::MappingWithoutBarcode;

    fn record(read_id: u32, start: u32, length: u16, mapping_quality: u8) -> MappingWithoutBarcode {
        MappingWithoutBarcode {
            read_id,
            fragment_start_position: start,
            fragment_length: length,
            mapq: mapping_quality << 1,
        }
    }

    fn processor() -> MappingProcessor<MappingWithoutBarcode> {
        MappingProcessor::new(0, 11)
    }

    #[test]
    fn test_sort_is_idempotent() {
        let mut container = vec![vec![record(2, 50, 40, 60), record(1, 10, 40, 60)]];
        let processor = processor();
        processor.sort_output_mappings(&mut container);
        let once = container.clone();
        processor.sort_output_mappings(&mut container);
        assert_eq!(container, once);
        assert_eq!(container[0][0].fragment_start_position, 10);
    }

    #[test]
    fn test_dedupe_collapses_equal_records() {
        let mut container = vec![vec![
            record(1, 10, 40, 60),
            record(2, 10, 40, 55),
            record(3, 99, 40, 60),
        ]];
        let processor = processor();
        processor.remove_pcr_duplicates(&mut container);
        assert_eq!(container[0].len(), 2);
        // Dedupe of an already-deduped bucket is a no-op.
        let once = container.clone();
        processor.remove_pcr_duplicates(&mut container);
        assert_eq!(container, once);
    }

    #[test]
    fn test_augmented_tree_max_end_invariant() {
        let mappings: Vec<MappingWithoutBarcode> = (0..13)
            .map(|i| record(i, i * 10, (20 + (i % 3) * 25) as u16, 60))
            .collect();
        let tree = build_augmented_tree(&mappings);
        // In the implicit layout, node i sits at level trailing_ones(i) and
        // its subtree spans [i - (2^k - 1), i + (2^k - 1)]. The stored value
        // must cover the in-range subtree's max end exactly when the subtree
        // is fully materialized, and at least that max when truncated.
        for (node, &stored) in tree.extras.iter().enumerate() {
            let k = (node as u64).trailing_ones();
            let half = (1usize << k) - 1;
            let lo = node - half;
            let hi_untruncated = node + half;
            let hi = hi_untruncated.min(mappings.len() - 1);
            let expected = mappings[lo..=hi]
                .iter()
                .map(|m| m.fragment_start_position + m.fragment_length as u32)
                .max()
                .unwrap();
            if hi_untruncated < mappings.len() {
                assert_eq!(stored, expected, "node {}", node);
            } else {
                assert!(stored >= expected, "node {}", node);
            }
        }
    }

    #[test]
    fn test_count_overlaps_matches_linear_scan() {
        let mappings: Vec<MappingWithoutBarcode> = (0..57)
            .map(|i| record(i, i * 7, (15 + (i % 5) * 20) as u16, 60))
            .collect();
        let tree = build_augmented_tree(&mappings);
        for start in (0..420).step_by(13) {
            let query = record(1000, start, 30, 10);
            let expected = mappings
                .iter()
                .filter(|m| {
                    m.fragment_start_position < start + 30
                        && start < m.fragment_start_position + m.fragment_length as u32
                })
                .count() as u32;
            let counted = count_overlapped_mappings(&mappings, &tree, &query, 0);
            assert_eq!(counted, expected, "query start {}", start);
        }
    }

    #[test]
    fn test_allocation_drops_zero_overlap_reads() {
        // One unique mapping near 100; a multi-read with placements at 100
        // and far away must land near 100; a multi-read with no overlap at
        // all disappears.
        let mut container = vec![vec![
            record(1, 100, 50, 60),
            record(2, 110, 50, 3),
            record(2, 5000, 50, 3),
            record(3, 9000, 50, 3),
        ]];
        let processor = processor();
        processor.allocate_multi_mappings(&mut container);
        let starts: Vec<u32> = container[0]
            .iter()
            .map(|m| m.fragment_start_position)
            .collect();
        assert!(starts.contains(&100));
        assert!(starts.contains(&110));
        assert!(!starts.contains(&5000));
        assert!(!starts.contains(&9000));
        assert_eq!(container[0].len(), 2);
    }

    #[test]
    fn test_allocation_is_deterministic_for_fixed_seed() {
        let build = || {
            vec![vec![
                record(1, 100, 50, 60),
                record(1, 300, 50, 60),
                record(2, 110, 50, 3),
                record(2, 310, 50, 3),
            ]]
        };
        let processor = processor();
        let mut first = build();
        processor.allocate_multi_mappings(&mut first);
        let mut second = build();
        processor.allocate_multi_mappings(&mut second);
        assert_eq!(first, second);
    }
}
