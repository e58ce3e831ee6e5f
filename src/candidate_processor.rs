// Candidate generation: project minimizer hits onto the reference and
// cluster them by diagonal, plus the paired-end candidate reduction and the
// mate supplementation fallback.

use crate::index::{self, Index};
use crate::mapping_metadata::{MappingMetadata, PairedEndMappingMetadata};
use crate::minimizer::Minimizer;

/// A clustered reference anchor: packed `(reference_id << 32) | position`
/// plus the number of supporting minimizers. Positive-strand candidates
/// store the projected read start, negative-strand candidates the projected
/// read end (both on the forward reference strand).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub position: u64,
    pub count: u32,
}

impl Candidate {
    #[inline]
    pub fn reference_id(&self) -> u32 {
        (self.position >> 32) as u32
    }

    #[inline]
    pub fn reference_position(&self) -> u32 {
        self.position as u32
    }
}

pub struct CandidateProcessor {
    min_num_seeds_required_for_mapping: u32,
    max_seed_frequencies: [usize; 2],
}

impl CandidateProcessor {
    pub fn new(min_num_seeds_required_for_mapping: u32, max_seed_frequencies: [usize; 2]) -> Self {
        CandidateProcessor {
            min_num_seeds_required_for_mapping,
            max_seed_frequencies,
        }
    }

    /// Populate the metadata's candidate lists from its minimizers using the
    /// normal seed-frequency cap.
    pub fn generate_candidates(
        &self,
        error_threshold: i32,
        index: &Index,
        metadata: &mut MappingMetadata,
    ) {
        metadata.positive_hits.clear();
        metadata.negative_hits.clear();
        metadata.positive_candidates.clear();
        metadata.negative_candidates.clear();
        let mut repetitive_seed_length = 0;
        Self::collect_hits(
            index,
            &metadata.minimizers,
            self.max_seed_frequencies[0],
            &mut metadata.positive_hits,
            &mut metadata.negative_hits,
            &mut repetitive_seed_length,
        );
        metadata.repetitive_seed_length = repetitive_seed_length;
        self.generate_candidates_on_one_direction(
            error_threshold,
            &mut metadata.positive_hits,
            &mut metadata.positive_candidates,
        );
        self.generate_candidates_on_one_direction(
            error_threshold,
            &mut metadata.negative_hits,
            &mut metadata.negative_candidates,
        );
    }

    /// Project every hit of every minimizer under the frequency cap.
    /// Capped minimizers contribute to `repetitive_seed_length` instead:
    /// the covered span saturates at one k-mer per seed so overlapping
    /// repetitive seeds are not double counted.
    fn collect_hits(
        index: &Index,
        minimizers: &[Minimizer],
        seed_frequency_cap: usize,
        positive_hits: &mut Vec<u64>,
        negative_hits: &mut Vec<u64>,
        repetitive_seed_length: &mut u32,
    ) {
        let kmer_size = index.get_kmer_size() as u32;
        let mut previous_repetitive_position: Option<u32> = None;
        for minimizer in minimizers {
            let occurrences = index.lookup(minimizer.hash);
            if occurrences.is_empty() {
                continue;
            }
            if occurrences.len() > seed_frequency_cap {
                let position = minimizer.position();
                let contribution = match previous_repetitive_position {
                    Some(previous) => (position - previous).min(kmer_size),
                    None => kmer_size,
                };
                *repetitive_seed_length += contribution;
                previous_repetitive_position = Some(position);
                continue;
            }
            let read_position = minimizer.position();
            for &occurrence in occurrences {
                let reference_id = index::hit_reference_id(occurrence);
                let reference_position = index::hit_position(occurrence);
                if minimizer.is_reverse() == index::hit_is_reverse(occurrence) {
                    // Same strand: anchor at the projected read start.
                    if reference_position >= read_position {
                        let anchor = reference_position - read_position;
                        positive_hits.push(((reference_id as u64) << 32) | anchor as u64);
                    }
                } else {
                    // Opposite strand: anchor at the projected read end on
                    // the forward reference strand.
                    let anchor =
                        reference_position as u64 + read_position as u64 + 1 - kmer_size as u64;
                    negative_hits.push(((reference_id as u64) << 32) | anchor);
                }
            }
        }
    }

    /// Sort projected hits and emit one candidate per maximal cluster whose
    /// support reaches the seed minimum. Hits belong to the same cluster
    /// while consecutive anchors stay within twice the error threshold.
    fn generate_candidates_on_one_direction(
        &self,
        error_threshold: i32,
        hits: &mut Vec<u64>,
        candidates: &mut Vec<Candidate>,
    ) {
        if hits.is_empty() {
            return;
        }
        hits.sort_unstable();
        let window = 2 * error_threshold as u64;
        let mut cluster_start_hit = hits[0];
        let mut previous_hit = hits[0];
        let mut count: u32 = 1;
        for &hit in hits.iter().skip(1) {
            let same_reference = (hit >> 32) == (previous_hit >> 32);
            if !same_reference || hit > previous_hit + window {
                if count >= self.min_num_seeds_required_for_mapping {
                    candidates.push(Candidate {
                        position: cluster_start_hit,
                        count,
                    });
                }
                cluster_start_hit = hit;
                count = 0;
            }
            count += 1;
            previous_hit = hit;
        }
        if count >= self.min_num_seeds_required_for_mapping {
            candidates.push(Candidate {
                position: cluster_start_hit,
                count,
            });
        }
    }

    /// When exactly one end produced candidates, retry the bare end with the
    /// relaxed frequency cap and keep only candidates near the mapped mate.
    /// Returns nonzero when supplementation ran; the caller forces MAPQ to
    /// zero for such pairs.
    pub fn supplement_candidates(
        &self,
        error_threshold: i32,
        search_range: u32,
        index: &Index,
        paired_metadata: &mut PairedEndMappingMetadata,
    ) -> i32 {
        let n1 = paired_metadata.mapping_metadata1.get_num_candidates();
        let n2 = paired_metadata.mapping_metadata2.get_num_candidates();
        if (n1 == 0) == (n2 == 0) {
            return 0;
        }
        let (bare, anchored) = if n1 == 0 {
            (
                &mut paired_metadata.mapping_metadata1,
                &paired_metadata.mapping_metadata2,
            )
        } else {
            (
                &mut paired_metadata.mapping_metadata2,
                &paired_metadata.mapping_metadata1,
            )
        };

        let mut mate_positions: Vec<u64> = anchored
            .positive_candidates
            .iter()
            .chain(anchored.negative_candidates.iter())
            .map(|c| c.position)
            .collect();
        mate_positions.sort_unstable();

        let mut repetitive_seed_length = bare.repetitive_seed_length;
        bare.positive_hits.clear();
        bare.negative_hits.clear();
        Self::collect_hits(
            index,
            &bare.minimizers,
            self.max_seed_frequencies[1],
            &mut bare.positive_hits,
            &mut bare.negative_hits,
            &mut repetitive_seed_length,
        );
        bare.repetitive_seed_length = repetitive_seed_length;
        retain_hits_near(&mut bare.positive_hits, &mate_positions, search_range);
        retain_hits_near(&mut bare.negative_hits, &mate_positions, search_range);
        self.generate_candidates_on_one_direction(
            error_threshold,
            &mut bare.positive_hits,
            &mut bare.positive_candidates,
        );
        self.generate_candidates_on_one_direction(
            error_threshold,
            &mut bare.negative_hits,
            &mut bare.negative_candidates,
        );
        if bare.get_num_candidates() > 0 { 1 } else { 0 }
    }

    /// Drop candidates with no mate candidate within the insert-size bound.
    /// Reads its inputs from the candidate buffers (filled by
    /// `move_candidates_to_buffer`) and rebuilds the primary lists.
    pub fn reduce_candidates_for_paired_end_read(
        &self,
        max_insert_size: u32,
        paired_metadata: &mut PairedEndMappingMetadata,
    ) {
        let (end1, end2) = (
            &mut paired_metadata.mapping_metadata1,
            &mut paired_metadata.mapping_metadata2,
        );
        Self::reduce_candidates_on_one_direction(
            max_insert_size,
            &end1.positive_candidates_buffer,
            &end2.negative_candidates_buffer,
            &mut end1.positive_candidates,
            &mut end2.negative_candidates,
        );
        Self::reduce_candidates_on_one_direction(
            max_insert_size,
            &end1.negative_candidates_buffer,
            &end2.positive_candidates_buffer,
            &mut end1.negative_candidates,
            &mut end2.positive_candidates,
        );
    }

    /// Two-pointer sweep over sorted candidate lists. The rolling
    /// `previous_end_i2` pointer prevents re-emitting a mate candidate that
    /// was already covered by an earlier window.
    fn reduce_candidates_on_one_direction(
        max_insert_size: u32,
        candidates1: &[Candidate],
        candidates2: &[Candidate],
        filtered_candidates1: &mut Vec<Candidate>,
        filtered_candidates2: &mut Vec<Candidate>,
    ) {
        let distance = max_insert_size as u64;
        let mut i1 = 0;
        let mut i2 = 0;
        let mut previous_end_i2 = 0;
        while i1 < candidates1.len() && i2 < candidates2.len() {
            if candidates1[i1].position > candidates2[i2].position + distance {
                i2 += 1;
            } else if candidates2[i2].position > candidates1[i1].position + distance {
                i1 += 1;
            } else {
                filtered_candidates1.push(candidates1[i1]);
                let mut current_i2 = i2;
                while current_i2 < candidates2.len()
                    && candidates2[current_i2].position <= candidates1[i1].position + distance
                {
                    if current_i2 >= previous_end_i2 {
                        filtered_candidates2.push(candidates2[current_i2]);
                    }
                    current_i2 += 1;
                }
                previous_end_i2 = current_i2;
                i1 += 1;
            }
        }
    }
}

/// Keep only hits that have a mate anchor within `range` on the same
/// reference sequence.
fn retain_hits_near(hits: &mut Vec<u64>, sorted_mate_positions: &[u64], range: u32) {
    if sorted_mate_positions.is_empty() {
        hits.clear();
        return;
    }
    let range = range as u64;
    hits.retain(|&hit| {
        // Clamp the window to this hit's reference sequence so the search
        // cannot slide into the previous sequence's position space.
        let low = hit.saturating_sub(range).max(hit & !0xffff_ffffu64);
        let i = sorted_mate_positions.partition_point(|&p| p < low);
        match sorted_mate_positions.get(i) {
            Some(&mate) => mate <= hit + range && (mate >> 32) == (hit >> 32),
            None => false,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(position: u64) -> Candidate {
        Candidate { position, count: 2 }
    }

    #[test]
    fn test_clustering_requires_min_seeds() {
        let processor = CandidateProcessor::new(2, [1000, 5000]);
        let mut hits = vec![100u64, 103, 500];
        let mut candidates = Vec::new();
        processor.generate_candidates_on_one_direction(3, &mut hits, &mut candidates);
        // 100/103 cluster (gap 3 <= 6) with two seeds; 500 stands alone.
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].position, 100);
        assert_eq!(candidates[0].count, 2);
    }

    #[test]
    fn test_clustering_breaks_on_reference_boundary() {
        let processor = CandidateProcessor::new(1, [1000, 5000]);
        let rid1 = 1u64 << 32;
        let mut hits = vec![rid1 | 10, rid1 | 12, (2u64 << 32) | 11];
        let mut candidates = Vec::new();
        processor.generate_candidates_on_one_direction(3, &mut hits, &mut candidates);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].reference_id(), 1);
        assert_eq!(candidates[1].reference_id(), 2);
        assert_eq!(candidates[0].count, 2);
        assert_eq!(candidates[1].count, 1);
    }

    #[test]
    fn test_reduction_keeps_only_paired_candidates() {
        let candidates1 = vec![candidate(100), candidate(5000)];
        let candidates2 = vec![candidate(300)];
        let mut filtered1 = Vec::new();
        let mut filtered2 = Vec::new();
        CandidateProcessor::reduce_candidates_on_one_direction(
            400,
            &candidates1,
            &candidates2,
            &mut filtered1,
            &mut filtered2,
        );
        assert_eq!(filtered1.len(), 1);
        assert_eq!(filtered1[0].position, 100);
        assert_eq!(filtered2.len(), 1);
    }

    #[test]
    fn test_reduction_does_not_duplicate_shared_mates() {
        // Both candidates on end1 are within range of the same mate; the
        // mate must be emitted once.
        let candidates1 = vec![candidate(100), candidate(150)];
        let candidates2 = vec![candidate(200), candidate(260)];
        let mut filtered1 = Vec::new();
        let mut filtered2 = Vec::new();
        CandidateProcessor::reduce_candidates_on_one_direction(
            400,
            &candidates1,
            &candidates2,
            &mut filtered1,
            &mut filtered2,
        );
        assert_eq!(filtered1.len(), 2);
        assert_eq!(filtered2.len(), 2);
    }

    #[test]
    fn test_retain_hits_near() {
        let mates = vec![1000u64, (1u64 << 32) | 50];
        let mut hits = vec![900u64, 5000, (1u64 << 32) | 60, (2u64 << 32) | 1000];
        retain_hits_near(&mut hits, &mates, 200);
        assert_eq!(hits, vec![900u64, (1u64 << 32) | 60]);
    }
}
