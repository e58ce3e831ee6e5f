// Best-mapping selection and MAPQ scoring.
//
// Draft mappings rank by error count (sum of both ends for pairs). Ties
// beyond `max_num_best_mappings` are resolved by reservoir sampling with an
// RNG seeded per read from the run seed, so output is reproducible across
// runs and thread counts. Chosen mappings are traced back to their start
// positions and emitted as concrete records into per-reference buckets.

use std::marker::PhantomData;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::draft_mapping_generator::Direction;
use crate::edit_distance::banded_traceback;
use crate::mapping_metadata::{DraftMapping, MappingMetadata, PairedEndMappingMetadata};
use crate::mapping_parameters::MappingParameters;
use crate::mappings::{PairedEndRecord, SingleEndRecord};
use crate::sequence_batch::SequenceBatch;
use crate::utils::hash_64;

pub struct MappingGenerator<R> {
    error_threshold: i32,
    min_read_length: usize,
    max_insert_size: u32,
    max_num_best_mappings: usize,
    drop_repetitive_reads: usize,
    run_seed: u64,
    _marker: PhantomData<R>,
}

/// Shared traceback-window helper: the window spans
/// `[end + 1 - read_len - e, end + 1 + e)` and is clamped to the contig by
/// N padding, mirroring how the verifier formed its window.
fn traceback_window<'a>(
    reference_sequence: &'a [u8],
    end_position: i64,
    read_length: usize,
    error_threshold: i32,
    buffer: &'a mut Vec<u8>,
) -> (&'a [u8], i64) {
    let e = error_threshold as i64;
    let window_start = end_position + 1 - read_length as i64 - e;
    let window_length = read_length as i64 + 2 * e;
    let reference_length = reference_sequence.len() as i64;
    if window_start >= 0 && window_start + window_length <= reference_length {
        (
            &reference_sequence[window_start as usize..(window_start + window_length) as usize],
            window_start,
        )
    } else {
        buffer.clear();
        for position in window_start..window_start + window_length {
            if position < 0 || position >= reference_length {
                buffer.push(b'N');
            } else {
                buffer.push(reference_sequence[position as usize]);
            }
        }
        (buffer.as_slice(), window_start)
    }
}

impl<R> MappingGenerator<R> {
    pub fn new(mapping_parameters: &MappingParameters) -> Self {
        MappingGenerator {
            error_threshold: mapping_parameters.error_threshold,
            min_read_length: mapping_parameters.min_read_length,
            max_insert_size: mapping_parameters.max_insert_size,
            max_num_best_mappings: mapping_parameters.max_num_best_mappings,
            drop_repetitive_reads: mapping_parameters.drop_repetitive_reads,
            run_seed: mapping_parameters.run_seed,
            _marker: PhantomData,
        }
    }

    /// Phred-like confidence that the reported mapping is correct, shifted
    /// left one bit so the caller can OR in the strand/orientation flag.
    #[allow(clippy::too_many_arguments)]
    fn get_mapq(
        &self,
        num_positive_candidates: usize,
        num_negative_candidates: usize,
        alignment_length: u32,
        min_num_errors: i32,
        num_best_mappings: usize,
        second_min_num_errors: i32,
        num_second_best_mappings: usize,
        repetitive_seed_length: u32,
        read_length: u32,
        force_mapq: i32,
    ) -> u8 {
        let alignment_identity = 1.0 - min_num_errors as f64 / alignment_length.max(1) as f64;
        let mut mapq: i32;
        if num_best_mappings > 1 {
            mapq = (-4.343 * (1.0 - 1.0 / num_best_mappings as f64).ln()) as i32;
        } else {
            let mut second_min_num_errors = second_min_num_errors;
            if second_min_num_errors > self.error_threshold {
                second_min_num_errors = 2 * self.error_threshold + 1;
            }
            mapq = (60.0 * (1.0 - min_num_errors as f64 / second_min_num_errors as f64) + 0.499)
                as i32;
            if alignment_identity < 0.98 {
                let mut tmp = alignment_identity * alignment_identity;
                tmp *= tmp;
                tmp *= tmp;
                mapq = (mapq as f64 * tmp + 0.499) as i32;
            }
        }
        if num_second_best_mappings > 0 {
            mapq -= (4.343 * ((num_second_best_mappings + 1) as f64).ln() + 0.499) as i32;
        }
        if num_positive_candidates > 1 || num_negative_candidates > 1 {
            mapq -= (4.343 * ((num_positive_candidates + num_negative_candidates) as f64).ln()
                + 0.499) as i32;
        }
        mapq = mapq.clamp(0, 60);
        if repetitive_seed_length > 0 && read_length > 0 {
            let repetitive_fraction =
                (repetitive_seed_length as f64 / read_length as f64).min(0.999);
            mapq = (mapq as f64 * (1.0 - repetitive_fraction) + 0.499) as i32;
        }
        if force_mapq >= 0 {
            mapq = force_mapq.clamp(0, 60);
        }
        (mapq << 1) as u8
    }

    /// Reservoir-sample `max_num_best_mappings` indices out of
    /// `num_best_mappings` equally good ones, deterministically for this
    /// read. Returned indices are sorted so emission can stream past them.
    fn pick_best_mapping_indices(&self, read_id: u32, num_best_mappings: usize) -> Vec<usize> {
        let mut best_mapping_indices: Vec<usize> = (0..self.max_num_best_mappings).collect();
        if num_best_mappings > self.max_num_best_mappings {
            let mut generator = StdRng::seed_from_u64(self.run_seed ^ hash_64(read_id as u64));
            for i in self.max_num_best_mappings..num_best_mappings {
                let j = generator.gen_range(0..=i);
                if j < self.max_num_best_mappings {
                    best_mapping_indices[j] = i;
                }
            }
            best_mapping_indices.sort_unstable();
        }
        best_mapping_indices
    }
}

impl<R: SingleEndRecord> MappingGenerator<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn generate_best_mappings_for_single_end_read(
        &self,
        read_batch: &SequenceBatch,
        read_index: usize,
        reference: &SequenceBatch,
        barcode_key: u64,
        metadata: &MappingMetadata,
        mappings_on_diff_ref_seqs: &mut [Vec<R>],
    ) {
        if metadata.num_best_mappings > self.drop_repetitive_reads {
            return;
        }
        let best_mapping_indices =
            self.pick_best_mapping_indices(
                read_batch.get_sequence_id_at(read_index),
                metadata.num_best_mappings,
            );
        let mut best_mapping_index = 0usize;
        let mut num_best_mappings_reported = 0usize;
        self.process_best_mappings_for_single_end_read_on_one_direction(
            Direction::Positive,
            read_batch,
            read_index,
            reference,
            barcode_key,
            metadata,
            &metadata.positive_mappings,
            &best_mapping_indices,
            &mut best_mapping_index,
            &mut num_best_mappings_reported,
            mappings_on_diff_ref_seqs,
        );
        if num_best_mappings_reported
            != self.max_num_best_mappings.min(metadata.num_best_mappings)
        {
            self.process_best_mappings_for_single_end_read_on_one_direction(
                Direction::Negative,
                read_batch,
                read_index,
                reference,
                barcode_key,
                metadata,
                &metadata.negative_mappings,
                &best_mapping_indices,
                &mut best_mapping_index,
                &mut num_best_mappings_reported,
                mappings_on_diff_ref_seqs,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_best_mappings_for_single_end_read_on_one_direction(
        &self,
        direction: Direction,
        read_batch: &SequenceBatch,
        read_index: usize,
        reference: &SequenceBatch,
        barcode_key: u64,
        metadata: &MappingMetadata,
        mappings: &[DraftMapping],
        best_mapping_indices: &[usize],
        best_mapping_index: &mut usize,
        num_best_mappings_reported: &mut usize,
        mappings_on_diff_ref_seqs: &mut [Vec<R>],
    ) {
        let read_length = read_batch.get_sequence_length_at(read_index) as usize;
        let read_id = read_batch.get_sequence_id_at(read_index);
        let read_name = read_batch.get_sequence_name_at(read_index);
        let mut window_buffer = Vec::new();

        for mapping in mappings {
            if mapping.num_errors != metadata.min_num_errors {
                continue;
            }
            if *best_mapping_index == best_mapping_indices[*num_best_mappings_reported] {
                let rid = mapping.reference_id();
                let position = mapping.reference_position() as i64;
                let sequence = reference.get_sequence_at(rid as usize);
                let text = match direction {
                    Direction::Positive => read_batch.get_sequence_at(read_index),
                    Direction::Negative => read_batch.get_negative_sequence_at(read_index),
                };
                let (window, window_start) = traceback_window(
                    sequence,
                    position,
                    read_length,
                    self.error_threshold,
                    &mut window_buffer,
                );
                let mapping_start_position =
                    banded_traceback(mapping.num_errors, window, text, self.error_threshold);
                let fragment_start_position =
                    (window_start + mapping_start_position as i64).max(0) as u32;
                let fragment_length = (position - fragment_start_position as i64 + 1) as u16;
                // Candidate counts stay out of the single-end penalty term:
                // with one fragment there is no mate evidence to distinguish
                // a crowded locus from a clean multi-mapper, and the
                // num_best term already prices the tie.
                let mut mapq = self.get_mapq(
                    0,
                    0,
                    fragment_length as u32,
                    metadata.min_num_errors,
                    metadata.num_best_mappings,
                    metadata.second_min_num_errors,
                    metadata.num_second_best_mappings,
                    metadata.repetitive_seed_length,
                    read_length as u32,
                    -1,
                );
                if direction == Direction::Positive {
                    mapq |= 1;
                }
                mappings_on_diff_ref_seqs[rid as usize].push(R::new_single_end(
                    read_id,
                    read_name,
                    read_length as u16,
                    barcode_key,
                    fragment_start_position,
                    fragment_length,
                    mapq,
                ));
                *num_best_mappings_reported += 1;
                if *num_best_mappings_reported
                    == self.max_num_best_mappings.min(metadata.num_best_mappings)
                {
                    break;
                }
            }
            *best_mapping_index += 1;
        }
    }
}

impl<R: PairedEndRecord> MappingGenerator<R> {
    /// Sweep both orientations, then emit the sampled best pairs.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_best_mappings_for_paired_end_read(
        &self,
        pair_index: usize,
        read_batch1: &SequenceBatch,
        read_batch2: &SequenceBatch,
        barcode_key: u64,
        reference: &SequenceBatch,
        force_mapq: i32,
        paired_metadata: &mut PairedEndMappingMetadata,
        mappings_on_diff_ref_seqs: &mut [Vec<R>],
    ) {
        paired_metadata.min_sum_errors = 2 * self.error_threshold + 1;
        paired_metadata.num_best_mappings = 0;
        paired_metadata.second_min_sum_errors = paired_metadata.min_sum_errors;
        paired_metadata.num_second_best_mappings = 0;

        let read1_length = read_batch1.get_sequence_length_at(pair_index) as i64;
        let read2_length = read_batch2.get_sequence_length_at(pair_index) as i64;

        let positive_mappings1 =
            std::mem::take(&mut paired_metadata.mapping_metadata1.positive_mappings);
        let negative_mappings1 =
            std::mem::take(&mut paired_metadata.mapping_metadata1.negative_mappings);
        let positive_mappings2 =
            std::mem::take(&mut paired_metadata.mapping_metadata2.positive_mappings);
        let negative_mappings2 =
            std::mem::take(&mut paired_metadata.mapping_metadata2.negative_mappings);
        let mut f1r2_best_mappings = std::mem::take(&mut paired_metadata.f1r2_best_mappings);
        let mut f2r1_best_mappings = std::mem::take(&mut paired_metadata.f2r1_best_mappings);
        self.generate_best_mappings_on_one_direction(
            Direction::Positive,
            read1_length,
            read2_length,
            &positive_mappings1,
            &negative_mappings2,
            &mut f1r2_best_mappings,
            paired_metadata,
        );
        self.generate_best_mappings_on_one_direction(
            Direction::Negative,
            read1_length,
            read2_length,
            &negative_mappings1,
            &positive_mappings2,
            &mut f2r1_best_mappings,
            paired_metadata,
        );
        paired_metadata.mapping_metadata1.positive_mappings = positive_mappings1;
        paired_metadata.mapping_metadata1.negative_mappings = negative_mappings1;
        paired_metadata.mapping_metadata2.positive_mappings = positive_mappings2;
        paired_metadata.mapping_metadata2.negative_mappings = negative_mappings2;
        paired_metadata.f1r2_best_mappings = f1r2_best_mappings;
        paired_metadata.f2r1_best_mappings = f2r1_best_mappings;

        if paired_metadata.num_best_mappings > self.drop_repetitive_reads {
            return;
        }

        let best_mapping_indices = self.pick_best_mapping_indices(
            read_batch1.get_sequence_id_at(pair_index),
            paired_metadata.num_best_mappings,
        );
        let mut best_mapping_index = 0usize;
        let mut num_best_mappings_reported = 0usize;
        self.process_best_mappings_on_one_direction(
            Direction::Positive,
            pair_index,
            read_batch1,
            read_batch2,
            barcode_key,
            reference,
            force_mapq,
            paired_metadata,
            &best_mapping_indices,
            &mut best_mapping_index,
            &mut num_best_mappings_reported,
            mappings_on_diff_ref_seqs,
        );
        if num_best_mappings_reported
            != self
                .max_num_best_mappings
                .min(paired_metadata.num_best_mappings)
        {
            self.process_best_mappings_on_one_direction(
                Direction::Negative,
                pair_index,
                read_batch1,
                read_batch2,
                barcode_key,
                reference,
                force_mapq,
                paired_metadata,
                &best_mapping_indices,
                &mut best_mapping_index,
                &mut num_best_mappings_reported,
                mappings_on_diff_ref_seqs,
            );
        }
    }

    /// Two-pointer scan over two sorted draft lists. A pair is compatible
    /// when the fragment fits under the insert-size cap and the ends overlap
    /// by at least the minimum read length.
    #[allow(clippy::too_many_arguments)]
    fn generate_best_mappings_on_one_direction(
        &self,
        first_read_direction: Direction,
        read1_length: i64,
        read2_length: i64,
        mappings1: &[DraftMapping],
        mappings2: &[DraftMapping],
        best_mappings: &mut Vec<(u32, u32)>,
        paired_metadata: &mut PairedEndMappingMetadata,
    ) {
        let max_insert_size = self.max_insert_size as i64;
        let min_overlap_length = self.min_read_length as i64;
        let mut i1 = 0usize;
        let mut i2 = 0usize;
        while i1 < mappings1.len() && i2 < mappings2.len() {
            let position1 = mappings1[i1].position as i64;
            let position2 = mappings2[i2].position as i64;
            let advance_i2 = match first_read_direction {
                Direction::Negative => position1 > position2 + max_insert_size - read1_length,
                Direction::Positive => position1 > position2 + read2_length - min_overlap_length,
            };
            if advance_i2 {
                i2 += 1;
                continue;
            }
            let advance_i1 = match first_read_direction {
                Direction::Positive => position2 > position1 + max_insert_size - read2_length,
                Direction::Negative => position2 > position1 + read1_length - min_overlap_length,
            };
            if advance_i1 {
                i1 += 1;
                continue;
            }
            let mut current_i2 = i2;
            while current_i2 < mappings2.len() {
                let current_position2 = mappings2[current_i2].position as i64;
                let in_range = match first_read_direction {
                    Direction::Positive => {
                        current_position2 <= position1 + max_insert_size - read2_length
                    }
                    Direction::Negative => {
                        current_position2 <= position1 + read1_length - min_overlap_length
                    }
                };
                if !in_range {
                    break;
                }
                let current_sum_errors =
                    mappings1[i1].num_errors + mappings2[current_i2].num_errors;
                if current_sum_errors < paired_metadata.min_sum_errors {
                    paired_metadata.second_min_sum_errors = paired_metadata.min_sum_errors;
                    paired_metadata.num_second_best_mappings = paired_metadata.num_best_mappings;
                    paired_metadata.min_sum_errors = current_sum_errors;
                    paired_metadata.num_best_mappings = 1;
                    best_mappings.push((i1 as u32, current_i2 as u32));
                } else if current_sum_errors == paired_metadata.min_sum_errors {
                    paired_metadata.num_best_mappings += 1;
                    best_mappings.push((i1 as u32, current_i2 as u32));
                } else if current_sum_errors == paired_metadata.second_min_sum_errors {
                    paired_metadata.num_second_best_mappings += 1;
                }
                current_i2 += 1;
            }
            i1 += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_best_mappings_on_one_direction(
        &self,
        first_read_direction: Direction,
        pair_index: usize,
        read_batch1: &SequenceBatch,
        read_batch2: &SequenceBatch,
        barcode_key: u64,
        reference: &SequenceBatch,
        force_mapq: i32,
        paired_metadata: &PairedEndMappingMetadata,
        best_mapping_indices: &[usize],
        best_mapping_index: &mut usize,
        num_best_mappings_reported: &mut usize,
        mappings_on_diff_ref_seqs: &mut [Vec<R>],
    ) {
        let metadata1 = &paired_metadata.mapping_metadata1;
        let metadata2 = &paired_metadata.mapping_metadata2;
        let (mappings1, mappings2, best_mappings, num_candidates1, num_candidates2) =
            match first_read_direction {
                Direction::Positive => (
                    &metadata1.positive_mappings,
                    &metadata2.negative_mappings,
                    &paired_metadata.f1r2_best_mappings,
                    metadata1.positive_candidates.len(),
                    metadata2.negative_candidates.len(),
                ),
                Direction::Negative => (
                    &metadata1.negative_mappings,
                    &metadata2.positive_mappings,
                    &paired_metadata.f2r1_best_mappings,
                    metadata1.negative_candidates.len(),
                    metadata2.positive_candidates.len(),
                ),
            };
        let read1_length = read_batch1.get_sequence_length_at(pair_index) as usize;
        let read2_length = read_batch2.get_sequence_length_at(pair_index) as usize;
        let read_id = read_batch1.get_sequence_id_at(pair_index);
        let repetitive_seed_length =
            metadata1.repetitive_seed_length + metadata2.repetitive_seed_length;
        let total_read_length = (read1_length + read2_length) as u32;
        let mut window_buffer1 = Vec::new();
        let mut window_buffer2 = Vec::new();

        for &(i1, i2) in best_mappings {
            let mapping1 = &mappings1[i1 as usize];
            let mapping2 = &mappings2[i2 as usize];
            let current_sum_errors = mapping1.num_errors + mapping2.num_errors;
            if current_sum_errors != paired_metadata.min_sum_errors {
                continue;
            }
            if *best_mapping_index == best_mapping_indices[*num_best_mappings_reported] {
                let rid1 = mapping1.reference_id();
                let rid2 = mapping2.reference_id();
                let position1 = mapping1.reference_position() as i64;
                let position2 = mapping2.reference_position() as i64;
                let (text1, text2) = match first_read_direction {
                    Direction::Positive => (
                        read_batch1.get_sequence_at(pair_index),
                        read_batch2.get_negative_sequence_at(pair_index),
                    ),
                    Direction::Negative => (
                        read_batch1.get_negative_sequence_at(pair_index),
                        read_batch2.get_sequence_at(pair_index),
                    ),
                };
                let (window1, window_start1) = traceback_window(
                    reference.get_sequence_at(rid1 as usize),
                    position1,
                    read1_length,
                    self.error_threshold,
                    &mut window_buffer1,
                );
                let (window2, window_start2) = traceback_window(
                    reference.get_sequence_at(rid2 as usize),
                    position2,
                    read2_length,
                    self.error_threshold,
                    &mut window_buffer2,
                );
                let start1 = window_start1
                    + banded_traceback(mapping1.num_errors, window1, text1, self.error_threshold)
                        as i64;
                let start2 = window_start2
                    + banded_traceback(mapping2.num_errors, window2, text2, self.error_threshold)
                        as i64;

                let (fragment_start_position, fragment_length, positive_alignment_length,
                    negative_alignment_length) = match first_read_direction {
                    Direction::Positive => {
                        let fragment_start = start1.max(0);
                        (
                            fragment_start as u32,
                            (position2 - fragment_start + 1) as u16,
                            (position1 + 1 - fragment_start) as u16,
                            (position2 + 1 - start2) as u16,
                        )
                    }
                    Direction::Negative => {
                        let fragment_start = start2.max(0);
                        (
                            fragment_start as u32,
                            (position1 - fragment_start + 1) as u16,
                            (position2 + 1 - fragment_start) as u16,
                            (position1 + 1 - start1) as u16,
                        )
                    }
                };

                let alignment_length =
                    positive_alignment_length as u32 + negative_alignment_length as u32;
                let mut mapq = self.get_mapq(
                    num_candidates1,
                    num_candidates2,
                    alignment_length,
                    paired_metadata.min_sum_errors,
                    paired_metadata.num_best_mappings,
                    paired_metadata.second_min_sum_errors,
                    paired_metadata.num_second_best_mappings,
                    repetitive_seed_length,
                    total_read_length,
                    force_mapq,
                );
                if first_read_direction == Direction::Positive {
                    mapq |= 1;
                }
                mappings_on_diff_ref_seqs[rid1 as usize].push(R::new_paired_end(
                    read_id,
                    read_batch1.get_sequence_name_at(pair_index),
                    read_batch2.get_sequence_name_at(pair_index),
                    read1_length as u16,
                    read2_length as u16,
                    barcode_key,
                    fragment_start_position,
                    fragment_length,
                    mapq,
                    positive_alignment_length,
                    negative_alignment_length,
                ));
                *num_best_mappings_reported += 1;
                if *num_best_mappings_reported
                    == self
                        .max_num_best_mappings
                        .min(paired_metadata.num_best_mappings)
                {
                    break;
                }
            }
            *best_mapping_index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappings::MappingWithoutBarcode;

    fn generator() -> MappingGenerator<MappingWithoutBarcode> {
        MappingGenerator::new(&MappingParameters::default())
    }

    #[test]
    fn test_mapq_unique_exact_mapping_is_60() {
        let generator = generator();
        let mapq = generator.get_mapq(1, 0, 32, 0, 1, 4, 0, 0, 32, -1);
        assert_eq!(mapq >> 1, 60);
    }

    #[test]
    fn test_mapq_two_way_tie_is_three() {
        let generator = generator();
        let mapq = generator.get_mapq(1, 1, 100, 0, 2, 4, 0, 0, 100, -1);
        assert_eq!(mapq >> 1, 3);
    }

    #[test]
    fn test_mapq_single_substitution_stays_high() {
        let generator = generator();
        let mapq = generator.get_mapq(1, 0, 32, 1, 1, 4, 0, 0, 32, -1);
        assert!(mapq >> 1 >= 40, "mapq {} too low", mapq >> 1);
    }

    #[test]
    fn test_mapq_second_best_penalty() {
        let generator = generator();
        let without = generator.get_mapq(1, 0, 100, 1, 1, 2, 0, 0, 100, -1);
        let with = generator.get_mapq(1, 0, 100, 1, 1, 2, 3, 0, 100, -1);
        assert!(with < without);
    }

    #[test]
    fn test_mapq_repetitive_seed_penalty() {
        let generator = generator();
        let clean = generator.get_mapq(1, 0, 100, 0, 1, 4, 0, 0, 100, -1);
        let repetitive = generator.get_mapq(1, 0, 100, 0, 1, 4, 0, 50, 100, -1);
        assert!(repetitive < clean);
    }

    #[test]
    fn test_force_mapq_overrides() {
        let generator = generator();
        let mapq = generator.get_mapq(1, 0, 100, 0, 1, 4, 0, 0, 100, 0);
        assert_eq!(mapq, 0);
    }

    #[test]
    fn test_reservoir_sampling_is_deterministic_per_read() {
        let generator = generator();
        let first = generator.pick_best_mapping_indices(42, 100);
        let second = generator.pick_best_mapping_indices(42, 100);
        assert_eq!(first, second);
        assert_eq!(first.len(), 10);
        assert!(first.windows(2).all(|w| w[0] < w[1]));
        let other_read = generator.pick_best_mapping_indices(43, 100);
        assert_ne!(first, other_read);
    }

    #[test]
    fn test_reservoir_indices_within_range() {
        let generator = generator();
        for read_id in 0..50u32 {
            let indices = generator.pick_best_mapping_indices(read_id, 37);
            for &index in &indices {
                assert!(index < 37);
            }
        }
    }
}
