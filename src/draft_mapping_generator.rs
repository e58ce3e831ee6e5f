// Candidate verification: run the banded verifier over each candidate's
// reference window and keep the ones under the error threshold, tracking the
// best and second-best error counts in the same pass.

use crate::candidate_processor::Candidate;
use crate::edit_distance::banded_align;
use crate::mapping_metadata::{DraftMapping, MappingMetadata};
use crate::sequence_batch::SequenceBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Positive,
    Negative,
}

pub struct DraftMappingGenerator {
    error_threshold: i32,
}

impl DraftMappingGenerator {
    pub fn new(error_threshold: i32) -> Self {
        DraftMappingGenerator { error_threshold }
    }

    /// Verify all candidates of one read. Resets and then maintains the
    /// metadata's best/second-best error statistics.
    pub fn generate_draft_mappings(
        &self,
        read_batch: &SequenceBatch,
        read_index: usize,
        reference: &SequenceBatch,
        metadata: &mut MappingMetadata,
    ) {
        metadata.min_num_errors = self.error_threshold + 1;
        metadata.num_best_mappings = 0;
        metadata.second_min_num_errors = self.error_threshold + 1;
        metadata.num_second_best_mappings = 0;

        let read = read_batch.get_sequence_at(read_index);
        let negative_read = read_batch.get_negative_sequence_at(read_index);

        let positive_candidates = std::mem::take(&mut metadata.positive_candidates);
        let negative_candidates = std::mem::take(&mut metadata.negative_candidates);
        self.verify_candidates_on_one_direction(
            Direction::Positive,
            read,
            &positive_candidates,
            reference,
            metadata,
        );
        self.verify_candidates_on_one_direction(
            Direction::Negative,
            negative_read,
            &negative_candidates,
            reference,
            metadata,
        );
        metadata.positive_candidates = positive_candidates;
        metadata.negative_candidates = negative_candidates;
    }

    fn verify_candidates_on_one_direction(
        &self,
        direction: Direction,
        text: &[u8],
        candidates: &[Candidate],
        reference: &SequenceBatch,
        metadata: &mut MappingMetadata,
    ) {
        let e = self.error_threshold;
        let read_length = text.len() as i64;
        let mut window_buffer: Vec<u8> = Vec::new();

        for candidate in candidates {
            let rid = candidate.reference_id();
            if rid >= reference.get_num_sequences() {
                continue;
            }
            let reference_length = reference.get_sequence_length_at(rid as usize) as i64;
            let anchor = candidate.reference_position() as i64;
            // Positive candidates anchor the projected read start, negative
            // ones the projected read end.
            let read_start = match direction {
                Direction::Positive => anchor,
                Direction::Negative => anchor + 1 - read_length,
            };
            // A placement hanging off the contig by more than the band can
            // never verify.
            if read_start < -(e as i64) || read_start > reference_length - read_length + e as i64 {
                continue;
            }
            let window_start = read_start - e as i64;
            let window_length = read_length + 2 * e as i64;
            let sequence = reference.get_sequence_at(rid as usize);

            let (num_errors, end_in_window) =
                if window_start >= 0 && window_start + window_length <= reference_length {
                    let window =
                        &sequence[window_start as usize..(window_start + window_length) as usize];
                    banded_align(window, text, e)
                } else {
                    // Clamp at the contig boundary by padding with N, which
                    // always mismatches, so no alignment can reach past the
                    // contig without paying for it.
                    window_buffer.clear();
                    for position in window_start..window_start + window_length {
                        if position < 0 || position >= reference_length {
                            window_buffer.push(b'N');
                        } else {
                            window_buffer.push(sequence[position as usize]);
                        }
                    }
                    banded_align(&window_buffer, text, e)
                };

            if num_errors > e {
                continue;
            }
            let end_position = window_start + end_in_window as i64;
            if end_position < read_length - e as i64 - 1 || end_position >= reference_length {
                continue;
            }

            if num_errors < metadata.min_num_errors {
                metadata.second_min_num_errors = metadata.min_num_errors;
                metadata.num_second_best_mappings = metadata.num_best_mappings;
                metadata.min_num_errors = num_errors;
                metadata.num_best_mappings = 1;
            } else if num_errors == metadata.min_num_errors {
                metadata.num_best_mappings += 1;
            } else if num_errors == metadata.second_min_num_errors {
                metadata.num_second_best_mappings += 1;
            }

            let draft = DraftMapping {
                num_errors,
                position: ((rid as u64) << 32) | end_position as u64,
            };
            match direction {
                Direction::Positive => metadata.positive_mappings.push(draft),
                Direction::Negative => metadata.negative_mappings.push(draft),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence_batch::{SequenceEffectiveRange, complement_char};

    fn make_reference(sequence: &[u8]) -> SequenceBatch {
        let mut reference = SequenceBatch::new(1, SequenceEffectiveRange::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.fa");
        let mut fasta = b">chr1\n".to_vec();
        fasta.extend_from_slice(sequence);
        fasta.push(b'\n');
        std::fs::write(&path, fasta).unwrap();
        reference.load_all_sequences(&path);
        reference
    }

    fn make_read_batch(sequence: &[u8]) -> SequenceBatch {
        let mut batch = SequenceBatch::new(1, SequenceEffectiveRange::default());
        // Populate slot 0 by hand the way a loader would.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reads.fq");
        let mut fastq = b"@read0\n".to_vec();
        fastq.extend_from_slice(sequence);
        fastq.extend_from_slice(b"\n+\n");
        fastq.extend_from_slice(&vec![b'I'; sequence.len()]);
        fastq.push(b'\n');
        std::fs::write(&path, fastq).unwrap();
        batch.initialize_loading(&path);
        assert!(batch.load_one_sequence_and_save_at(0));
        batch.prepare_negative_sequence_at(0);
        batch.finalize_loading();
        batch
    }

    #[test]
    fn test_exact_match_at_contig_start_verifies() {
        // Window would start before the contig; N padding clamps it.
        let reference = make_reference(b"TTACGGATCAGCTTAGCGGATCGATTACGGAT");
        let read_batch = make_read_batch(b"TTACGGATCAGCTTAGCGGATCGATTACGGAT");
        let generator = DraftMappingGenerator::new(3);
        let mut metadata = MappingMetadata::default();
        metadata.positive_candidates.push(Candidate {
            position: 0,
            count: 2,
        });
        generator.generate_draft_mappings(&read_batch, 0, &reference, &mut metadata);
        assert_eq!(metadata.num_best_mappings, 1);
        assert_eq!(metadata.min_num_errors, 0);
        assert_eq!(metadata.positive_mappings.len(), 1);
        assert_eq!(metadata.positive_mappings[0].reference_position(), 31);
    }

    #[test]
    fn test_substitution_counts_one_error() {
        let reference = make_reference(b"TTACGGATCAGCTTAGCGGATCGATTACGGAT");
        let mut read = b"TTACGGATCAGCTTAGCGGATCGATTACGGAT".to_vec();
        read[10] = b'A';
        let read_batch = make_read_batch(&read);
        let generator = DraftMappingGenerator::new(3);
        let mut metadata = MappingMetadata::default();
        metadata.positive_candidates.push(Candidate {
            position: 0,
            count: 2,
        });
        generator.generate_draft_mappings(&read_batch, 0, &reference, &mut metadata);
        assert_eq!(metadata.min_num_errors, 1);
        assert_eq!(metadata.num_best_mappings, 1);
    }

    #[test]
    fn test_negative_strand_candidate_verifies() {
        let reference = make_reference(b"TTACGGATCAGCTTAGCGGATCGATTACGGAT");
        let reverse: Vec<u8> = b"TTACGGATCAGCTTAGCGGATCGATTACGGAT"
            .iter()
            .rev()
            .map(|&c| complement_char(c))
            .collect();
        let read_batch = make_read_batch(&reverse);
        let generator = DraftMappingGenerator::new(3);
        let mut metadata = MappingMetadata::default();
        // Negative candidates anchor the projected read end.
        metadata.negative_candidates.push(Candidate {
            position: 31,
            count: 2,
        });
        generator.generate_draft_mappings(&read_batch, 0, &reference, &mut metadata);
        assert_eq!(metadata.min_num_errors, 0);
        assert_eq!(metadata.negative_mappings.len(), 1);
        assert_eq!(metadata.negative_mappings[0].reference_position(), 31);
    }

    #[test]
    fn test_best_and_second_best_tracking() {
        // Two copies of the same 32-mer, one of them mutated by one base.
        let mut sequence = Vec::new();
        sequence.extend_from_slice(b"TTACGGATCAGCTTAGCGGATCGATTACGGAT");
        sequence.extend_from_slice(b"CCCCC");
        let mut mutated = b"TTACGGATCAGCTTAGCGGATCGATTACGGAT".to_vec();
        mutated[16] = b'T';
        sequence.extend_from_slice(&mutated);
        let reference = make_reference(&sequence);
        let read_batch = make_read_batch(b"TTACGGATCAGCTTAGCGGATCGATTACGGAT");
        let generator = DraftMappingGenerator::new(3);
        let mut metadata = MappingMetadata::default();
        metadata.positive_candidates.push(Candidate {
            position: 0,
            count: 2,
        });
        metadata.positive_candidates.push(Candidate {
            position: 37,
            count: 2,
        });
        generator.generate_draft_mappings(&read_batch, 0, &reference, &mut metadata);
        assert_eq!(metadata.min_num_errors, 0);
        assert_eq!(metadata.num_best_mappings, 1);
        assert_eq!(metadata.second_min_num_errors, 1);
        assert_eq!(metadata.num_second_best_mappings, 1);
        assert_eq!(metadata.get_num_draft_mappings(), 2);
    }
}
