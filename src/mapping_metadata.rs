// Per-read and per-pair working sets.
//
// One `MappingMetadata` per read end lives in each worker's scratch and is
// recycled across reads with clear-not-free so the per-read hot loop never
// allocates in the steady state.

use crate::candidate_processor::Candidate;
use crate::minimizer::Minimizer;

/// A candidate that survived verification: error count plus the packed
/// `(reference_id << 32) | end_position` of the alignment on the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DraftMapping {
    pub num_errors: i32,
    pub position: u64,
}

impl DraftMapping {
    #[inline]
    pub fn reference_id(&self) -> u32 {
        (self.position >> 32) as u32
    }

    #[inline]
    pub fn reference_position(&self) -> u32 {
        self.position as u32
    }
}

#[derive(Default)]
pub struct MappingMetadata {
    pub minimizers: Vec<Minimizer>,
    pub positive_hits: Vec<u64>,
    pub negative_hits: Vec<u64>,
    pub positive_candidates: Vec<Candidate>,
    pub negative_candidates: Vec<Candidate>,
    /// Staging area: reduction reads the previous candidate lists from here
    /// while writing the filtered lists back into the primary vectors.
    pub positive_candidates_buffer: Vec<Candidate>,
    pub negative_candidates_buffer: Vec<Candidate>,
    pub positive_mappings: Vec<DraftMapping>,
    pub negative_mappings: Vec<DraftMapping>,
    /// Total read span covered by minimizers whose index frequency exceeded
    /// the seed cap. Feeds the MAPQ repetitive-seed penalty.
    pub repetitive_seed_length: u32,
    pub min_num_errors: i32,
    pub num_best_mappings: usize,
    pub second_min_num_errors: i32,
    pub num_second_best_mappings: usize,
}

impl MappingMetadata {
    pub fn prepare_for_mapping_next_read(&mut self, reserve_size: usize) {
        self.minimizers.clear();
        self.positive_hits.clear();
        self.negative_hits.clear();
        self.positive_candidates.clear();
        self.negative_candidates.clear();
        self.positive_candidates_buffer.clear();
        self.negative_candidates_buffer.clear();
        self.positive_mappings.clear();
        self.negative_mappings.clear();
        self.positive_hits.reserve(reserve_size);
        self.negative_hits.reserve(reserve_size);
        self.positive_candidates.reserve(reserve_size);
        self.negative_candidates.reserve(reserve_size);
        self.repetitive_seed_length = 0;
        self.min_num_errors = 0;
        self.num_best_mappings = 0;
        self.second_min_num_errors = 0;
        self.num_second_best_mappings = 0;
    }

    #[inline]
    pub fn get_num_candidates(&self) -> usize {
        self.positive_candidates.len() + self.negative_candidates.len()
    }

    #[inline]
    pub fn get_num_draft_mappings(&self) -> usize {
        self.positive_mappings.len() + self.negative_mappings.len()
    }

    /// Stash the current candidate lists so a reduction pass can rebuild the
    /// primary lists in place.
    pub fn move_candidates_to_buffer(&mut self) {
        std::mem::swap(
            &mut self.positive_candidates,
            &mut self.positive_candidates_buffer,
        );
        std::mem::swap(
            &mut self.negative_candidates,
            &mut self.negative_candidates_buffer,
        );
        self.positive_candidates.clear();
        self.negative_candidates.clear();
    }

    /// The pair sweep requires draft mappings sorted by reference position.
    pub fn sort_mappings_by_positions(&mut self) {
        self.positive_mappings.sort_by_key(|m| m.position);
        self.negative_mappings.sort_by_key(|m| m.position);
    }
}

#[derive(Default)]
pub struct PairedEndMappingMetadata {
    pub mapping_metadata1: MappingMetadata,
    pub mapping_metadata2: MappingMetadata,
    /// Index pairs (into end1/end2 draft lists) for each orientation.
    pub f1r2_best_mappings: Vec<(u32, u32)>,
    pub f2r1_best_mappings: Vec<(u32, u32)>,
    pub min_sum_errors: i32,
    pub num_best_mappings: usize,
    pub second_min_sum_errors: i32,
    pub num_second_best_mappings: usize,
}

impl PairedEndMappingMetadata {
    pub fn prepare_for_mapping_next_read_pair(&mut self, reserve_size: usize) {
        self.mapping_metadata1
            .prepare_for_mapping_next_read(reserve_size);
        self.mapping_metadata2
            .prepare_for_mapping_next_read(reserve_size);
        self.f1r2_best_mappings.clear();
        self.f2r1_best_mappings.clear();
        self.min_sum_errors = 0;
        self.num_best_mappings = 0;
        self.second_min_sum_errors = 0;
        self.num_second_best_mappings = 0;
    }

    #[inline]
    pub fn both_ends_have_minimizers(&self) -> bool {
        !self.mapping_metadata1.minimizers.is_empty()
            && !self.mapping_metadata2.minimizers.is_empty()
    }

    #[inline]
    pub fn get_num_best_mappings(&self) -> usize {
        self.num_best_mappings
    }

    pub fn move_candidates_to_buffer(&mut self) {
        self.mapping_metadata1.move_candidates_to_buffer();
        self.mapping_metadata2.move_candidates_to_buffer();
    }

    pub fn sort_mappings_by_positions(&mut self) {
        self.mapping_metadata1.sort_mappings_by_positions();
        self.mapping_metadata2.sort_mappings_by_positions();
    }
}
