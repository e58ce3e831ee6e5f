// Batched sequence loading for references, reads and barcodes.
//
// A batch either holds an entire reference (FASTA, loaded once and read-only
// for the run) or a sliding window of up to `max_num_sequences` reads
// (FASTQ). Read batches are double-buffered by the mapping drivers: one batch
// is being mapped while the loader fills the other.

use std::io::{BufReader, Read};
use std::path::Path;

use bio::io::{fasta, fastq};
use rayon::prelude::*;

use crate::utils::{self, exit_with_message};

/// {A,C,G,T,N} -> {0,1,2,3,4}. N never matches anything in the verifier.
#[inline(always)]
pub const fn char_to_uint8(c: u8) -> u8 {
    match c {
        b'A' | b'a' => 0,
        b'C' | b'c' => 1,
        b'G' | b'g' => 2,
        b'T' | b't' => 3,
        _ => 4,
    }
}

#[inline(always)]
pub const fn uint8_to_char(c: u8) -> u8 {
    match c {
        0 => b'A',
        1 => b'C',
        2 => b'G',
        3 => b'T',
        _ => b'N',
    }
}

#[inline(always)]
pub const fn complement_char(c: u8) -> u8 {
    match c {
        b'A' | b'a' => b'T',
        b'C' | b'c' => b'G',
        b'G' | b'g' => b'C',
        b'T' | b't' => b'A',
        _ => b'N',
    }
}

/// Effective base range for one input stream: 0-based inclusive start/end
/// (end -1 means "to the end of the read") and a strand sign for barcode
/// streams sequenced in reverse.
#[derive(Debug, Clone, Copy)]
pub struct SequenceEffectiveRange {
    pub start: usize,
    pub end: i64,
    pub strand: i8,
}

impl Default for SequenceEffectiveRange {
    fn default() -> Self {
        SequenceEffectiveRange {
            start: 0,
            end: -1,
            strand: 1,
        }
    }
}

impl SequenceEffectiveRange {
    fn is_full(&self) -> bool {
        self.start == 0 && self.end == -1 && self.strand == 1
    }

    /// Restrict a freshly loaded sequence (and its qualities) to this range.
    fn apply(&self, sequence: &mut Vec<u8>, qualities: &mut Vec<u8>) {
        if self.is_full() {
            return;
        }
        let end = if self.end < 0 {
            sequence.len()
        } else {
            ((self.end + 1) as usize).min(sequence.len())
        };
        let start = self.start.min(end);
        if start > 0 || end < sequence.len() {
            sequence.drain(end..);
            sequence.drain(..start);
            if !qualities.is_empty() {
                qualities.drain(end.min(qualities.len())..);
                qualities.drain(..start.min(qualities.len()));
            }
        }
        if self.strand < 0 {
            sequence.reverse();
            for base in sequence.iter_mut() {
                *base = complement_char(*base);
            }
            qualities.reverse();
        }
    }
}

/// Parse a read-format string such as "r1:0:49,bc:0:15" into per-stream
/// effective ranges. Unknown stream tags are a configuration error.
pub fn parse_read_format(
    read_format: &str,
) -> Result<
    (
        SequenceEffectiveRange,
        SequenceEffectiveRange,
        SequenceEffectiveRange,
    ),
    String,
> {
    let mut r1 = SequenceEffectiveRange::default();
    let mut r2 = SequenceEffectiveRange::default();
    let mut bc = SequenceEffectiveRange::default();
    if read_format.is_empty() {
        return Ok((r1, r2, bc));
    }
    for field in read_format.split(',') {
        let parts: Vec<&str> = field.split(':').collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(format!("Invalid read format field: {}", field));
        }
        let start = parts[1]
            .parse::<usize>()
            .map_err(|_| format!("Invalid read format start: {}", field))?;
        let end = parts[2]
            .parse::<i64>()
            .map_err(|_| format!("Invalid read format end: {}", field))?;
        let strand = if parts.len() == 4 {
            match parts[3] {
                "+" => 1,
                "-" => -1,
                _ => return Err(format!("Invalid read format strand: {}", field)),
            }
        } else {
            1
        };
        let range = SequenceEffectiveRange { start, end, strand };
        match parts[0] {
            "r1" => r1 = range,
            "r2" => r2 = range,
            "bc" => bc = range,
            _ => return Err(format!("Unknown read format stream: {}", field)),
        }
    }
    Ok((r1, r2, bc))
}

type FastqRecords = fastq::Records<BufReader<Box<dyn Read + Send + Sync>>>;

pub struct SequenceBatch {
    max_num_sequences: usize,
    effective_range: SequenceEffectiveRange,
    names: Vec<String>,
    sequences: Vec<Vec<u8>>,
    qualities: Vec<Vec<u8>>,
    negative_sequences: Vec<Vec<u8>>,
    /// Global id of the first sequence in this batch.
    base_sequence_id: u32,
    num_loaded: usize,
    total_loaded: u64,
    reader: Option<FastqRecords>,
}

impl SequenceBatch {
    pub fn new(max_num_sequences: usize, effective_range: SequenceEffectiveRange) -> Self {
        SequenceBatch {
            max_num_sequences,
            effective_range,
            names: vec![String::new(); max_num_sequences],
            sequences: vec![Vec::new(); max_num_sequences],
            qualities: vec![Vec::new(); max_num_sequences],
            negative_sequences: vec![Vec::new(); max_num_sequences],
            base_sequence_id: 0,
            num_loaded: 0,
            total_loaded: 0,
            reader: None,
        }
    }

    /// Open a FASTQ stream for incremental batch loading.
    pub fn initialize_loading(&mut self, path: &Path) {
        let inner = match utils::xzopen(path) {
            Ok(inner) => inner,
            Err(e) => exit_with_message(&format!("Cannot open {}: {}", path.display(), e)),
        };
        self.reader = Some(fastq::Reader::from_bufread(BufReader::new(inner)).records());
    }

    pub fn finalize_loading(&mut self) {
        self.reader = None;
    }

    /// Load one sequence into slot `i`. Returns false when the input is
    /// exhausted. Malformed records are fatal: a truncated FASTQ stream is an
    /// input desynchronisation, not a recoverable per-read anomaly.
    pub fn load_one_sequence_and_save_at(&mut self, i: usize) -> bool {
        debug_assert!(i < self.max_num_sequences);
        let record = match self.reader.as_mut() {
            Some(records) => match records.next() {
                Some(Ok(record)) => record,
                Some(Err(e)) => exit_with_message(&format!("Failed to parse read: {}", e)),
                None => return false,
            },
            None => return false,
        };
        self.names[i].clear();
        self.names[i].push_str(record.id());
        self.sequences[i].clear();
        self.sequences[i].extend_from_slice(record.seq());
        self.qualities[i].clear();
        self.qualities[i].extend_from_slice(record.qual());
        self.negative_sequences[i].clear();
        self.effective_range
            .apply(&mut self.sequences[i], &mut self.qualities[i]);
        if i >= self.num_loaded {
            self.num_loaded = i + 1;
        }
        self.total_loaded += 1;
        true
    }

    /// Mark the start of a fresh batch: slot 0 will carry global id
    /// `total_loaded_so_far`.
    pub fn begin_batch(&mut self) {
        self.base_sequence_id = self.total_loaded as u32;
        self.num_loaded = 0;
    }

    /// Load an entire FASTA reference. Returns the number of sequences.
    pub fn load_all_sequences(&mut self, path: &Path) -> u32 {
        let inner = match utils::xzopen(path) {
            Ok(inner) => inner,
            Err(e) => exit_with_message(&format!("Cannot open {}: {}", path.display(), e)),
        };
        let records = fasta::Reader::from_bufread(BufReader::new(inner)).records();
        self.names.clear();
        self.sequences.clear();
        self.qualities.clear();
        self.negative_sequences.clear();
        for record in records {
            let record = match record {
                Ok(record) => record,
                Err(e) => exit_with_message(&format!("Failed to parse reference: {}", e)),
            };
            self.names.push(record.id().to_string());
            self.sequences.push(record.seq().to_vec());
            self.qualities.push(Vec::new());
            self.negative_sequences.push(Vec::new());
        }
        self.num_loaded = self.sequences.len();
        self.total_loaded = self.num_loaded as u64;
        self.num_loaded as u32
    }

    pub fn get_num_sequences(&self) -> u32 {
        self.num_loaded as u32
    }

    #[inline]
    pub fn get_sequence_at(&self, i: usize) -> &[u8] {
        &self.sequences[i]
    }

    #[inline]
    pub fn get_sequence_length_at(&self, i: usize) -> u32 {
        self.sequences[i].len() as u32
    }

    #[inline]
    pub fn get_sequence_name_at(&self, i: usize) -> &str {
        &self.names[i]
    }

    #[inline]
    pub fn get_sequence_qual_at(&self, i: usize) -> &[u8] {
        &self.qualities[i]
    }

    #[inline]
    pub fn get_sequence_id_at(&self, i: usize) -> u32 {
        self.base_sequence_id + i as u32
    }

    /// Build the reverse complement for slot `i`. Idempotent per load; the
    /// verifier requires it before any negative-strand work.
    pub fn prepare_negative_sequence_at(&mut self, i: usize) {
        let sequence = &self.sequences[i];
        let negative = &mut self.negative_sequences[i];
        negative.clear();
        negative.reserve(sequence.len());
        for &base in sequence.iter().rev() {
            negative.push(complement_char(base));
        }
    }

    #[inline]
    pub fn get_negative_sequence_at(&self, i: usize) -> &[u8] {
        &self.negative_sequences[i]
    }

    /// 2-bit seed over bases [start, end). N collapses onto A so that seeds
    /// remain comparable; callers that must distinguish Ns inspect the raw
    /// sequence.
    pub fn generate_seed_from_sequence_at(&self, i: usize, start: usize, end: usize) -> u64 {
        let sequence = &self.sequences[i];
        let mut seed: u64 = 0;
        for position in start..end.min(sequence.len()) {
            seed = (seed << 2) | (char_to_uint8(sequence[position]) & 3) as u64;
        }
        seed
    }

    /// Truncate the read (3' adapter removal) to `length_after_trim` bases.
    pub fn trim_sequence_at(&mut self, i: usize, length_after_trim: usize) {
        if length_after_trim < self.sequences[i].len() {
            self.sequences[i].truncate(length_after_trim);
            if !self.qualities[i].is_empty() {
                self.qualities[i].truncate(length_after_trim);
            }
            self.prepare_negative_sequence_at(i);
        }
    }

    /// Build reverse complements for the whole batch in parallel, so the
    /// per-read mapping loop can borrow the batch immutably.
    pub fn prepare_negative_sequences(&mut self, num_loaded: usize) {
        let sequences = &self.sequences[..num_loaded];
        self.negative_sequences[..num_loaded]
            .par_iter_mut()
            .zip(sequences.par_iter())
            .for_each(|(negative, sequence)| {
                negative.clear();
                negative.reserve(sequence.len());
                for &base in sequence.iter().rev() {
                    negative.push(complement_char(base));
                }
            });
    }

    /// Permute reference sequences so that sequence `i` moves to
    /// `ranks[i]`.
    pub fn reorder_sequences(&mut self, ranks: &[usize]) {
        debug_assert_eq!(ranks.len(), self.num_loaded);
        let mut names = vec![String::new(); self.num_loaded];
        let mut sequences = vec![Vec::new(); self.num_loaded];
        for (i, &rank) in ranks.iter().enumerate() {
            names[rank] = std::mem::take(&mut self.names[i]);
            sequences[rank] = std::mem::take(&mut self.sequences[i]);
        }
        self.names = names;
        self.sequences = sequences;
        self.negative_sequences = vec![Vec::new(); self.num_loaded];
        self.qualities = vec![Vec::new(); self.num_loaded];
    }

    /// Exchange loaded contents with another batch. The reader handle stays
    /// with `self` so a loading batch keeps its stream across swaps.
    pub fn swap_sequence_batch(&mut self, other: &mut SequenceBatch) {
        std::mem::swap(&mut self.names, &mut other.names);
        std::mem::swap(&mut self.sequences, &mut other.sequences);
        std::mem::swap(&mut self.qualities, &mut other.qualities);
        std::mem::swap(&mut self.negative_sequences, &mut other.negative_sequences);
        std::mem::swap(&mut self.base_sequence_id, &mut other.base_sequence_id);
        std::mem::swap(&mut self.num_loaded, &mut other.num_loaded);
    }
}

/// Locate a 3' adapter overlap between read1 and the reverse complement of
/// read2. Returns the merged fragment length when the overlap seed extends
/// across both reads with at most one mismatch; the caller trims both reads
/// to that length.
pub fn find_adapter_overlap(
    read1: &[u8],
    negative_read2: &[u8],
    min_overlap_length: usize,
) -> Option<usize> {
    let seed_length = min_overlap_length / 2;
    if seed_length == 0 {
        return None;
    }
    let read2_length = negative_read2.len();
    let error_threshold_for_merging = 1usize;
    for si in 0..=error_threshold_for_merging {
        let seed_offset = si * seed_length;
        if seed_offset + seed_length > read1.len() {
            break;
        }
        let seed = &read1[seed_offset..seed_offset + seed_length];
        let mut search_from = 0usize;
        while let Some(seed_start_position) =
            find_subsequence(negative_read2, seed, search_from)
        {
            search_from = seed_start_position + 1;
            if read2_length - seed_start_position + seed_offset < min_overlap_length
                || seed_start_position < seed_offset
            {
                continue;
            }
            let mut num_errors = 0usize;
            let mut can_merge = true;
            for i in 0..seed_offset {
                if negative_read2[seed_start_position - seed_offset + i] != read1[i] {
                    num_errors += 1;
                }
                if num_errors > error_threshold_for_merging {
                    can_merge = false;
                    break;
                }
            }
            if can_merge {
                let mut i = seed_length;
                while i + seed_start_position < read2_length {
                    if seed_offset + i >= read1.len()
                        || negative_read2[seed_start_position + i] != read1[seed_offset + i]
                    {
                        num_errors += 1;
                    }
                    if num_errors > error_threshold_for_merging {
                        can_merge = false;
                        break;
                    }
                    i += 1;
                }
            }
            if can_merge {
                return Some(read2_length - seed_start_position + seed_offset);
            }
        }
    }
    None
}

fn find_subsequence(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_with_read(sequence: &[u8]) -> SequenceBatch {
        let mut batch = SequenceBatch::new(4, SequenceEffectiveRange::default());
        batch.names[0] = "read0".to_string();
        batch.sequences[0] = sequence.to_vec();
        batch.qualities[0] = vec![b'I'; sequence.len()];
        batch.num_loaded = 1;
        batch
    }

    #[test]
    fn test_char_encoding_round_trip() {
        for &c in b"ACGTN" {
            assert_eq!(uint8_to_char(char_to_uint8(c)), c);
        }
        assert_eq!(char_to_uint8(b'X'), 4);
    }

    #[test]
    fn test_negative_sequence_is_reverse_complement() {
        let mut batch = batch_with_read(b"ACGTNA");
        batch.prepare_negative_sequence_at(0);
        assert_eq!(batch.get_negative_sequence_at(0), b"TNACGT");
        // Encoding the reverse complement twice yields the original.
        let negative = batch.get_negative_sequence_at(0).to_vec();
        let double: Vec<u8> = negative.iter().rev().map(|&c| complement_char(c)).collect();
        assert_eq!(double, b"ACGTNA");
    }

    #[test]
    fn test_seed_generation() {
        let batch = batch_with_read(b"ACGT");
        // A=0 C=1 G=2 T=3 -> 0b00011011
        assert_eq!(batch.generate_seed_from_sequence_at(0, 0, 4), 0b00011011);
        assert_eq!(batch.generate_seed_from_sequence_at(0, 2, 4), 0b1011);
    }

    #[test]
    fn test_trim_sequence() {
        let mut batch = batch_with_read(b"ACGTACGT");
        batch.trim_sequence_at(0, 5);
        assert_eq!(batch.get_sequence_at(0), b"ACGTA");
        assert_eq!(batch.get_sequence_qual_at(0).len(), 5);
        assert_eq!(batch.get_negative_sequence_at(0), b"TACGT");
    }

    #[test]
    fn test_effective_range_trims_and_flips() {
        let range = SequenceEffectiveRange {
            start: 1,
            end: 4,
            strand: -1,
        };
        let mut sequence = b"GACGTT".to_vec();
        let mut qualities = b"IIIIII".to_vec();
        range.apply(&mut sequence, &mut qualities);
        // Bases 1..=4 are ACGT; minus strand flips to ACGT's revcomp.
        assert_eq!(sequence, b"ACGT");
        assert_eq!(qualities.len(), 4);
    }

    #[test]
    fn test_parse_read_format() {
        let (r1, _r2, bc) = parse_read_format("r1:0:49,bc:0:15").unwrap();
        assert_eq!(r1.start, 0);
        assert_eq!(r1.end, 49);
        assert_eq!(bc.end, 15);
        assert!(parse_read_format("zz:0:1").is_err());
        assert!(parse_read_format("r1:0").is_err());
    }

    #[test]
    fn test_adapter_overlap_full_readthrough() {
        // Fragment of 40bp, reads of 50bp: both reads read through the
        // fragment into adapter. Read1 starts with the fragment; the reverse
        // complement of read2 IS the fragment plus junk on the left.
        let fragment = b"ACGTACGGTTACGATCAGTTACGGATCGATTACGGTACCA";
        let mut read1 = fragment.to_vec();
        read1.extend_from_slice(b"GGGGGGGGGG");
        let mut negative_read2 = b"TTTTTTTTTT".to_vec();
        negative_read2.extend_from_slice(fragment);
        // negative_read2 = junk + fragment, so the overlap region sits at
        // offset 10 and runs 40bp to the end.
        let overlap = find_adapter_overlap(&read1, &negative_read2, 30);
        assert_eq!(overlap, Some(40));
    }

    #[test]
    fn test_adapter_overlap_requires_min_length() {
        let read1 = b"ACGTACGGTTACGATCAGTTACGGATCGATTA".to_vec();
        let negative_read2 = b"TTTTTTTTTTTTTTTTTTTTTTTTTTTTTTTT".to_vec();
        assert_eq!(find_adapter_overlap(&read1, &negative_read2, 30), None);
    }

    #[test]
    fn test_prepare_negative_sequences_matches_single() {
        let mut batch = SequenceBatch::new(2, SequenceEffectiveRange::default());
        batch.sequences[0] = b"ACGTN".to_vec();
        batch.sequences[1] = b"GGCC".to_vec();
        batch.num_loaded = 2;
        batch.prepare_negative_sequences(2);
        assert_eq!(batch.get_negative_sequence_at(0), b"NACGT");
        assert_eq!(batch.get_negative_sequence_at(1), b"GGCC");
    }

    #[test]
    fn test_reorder_sequences() {
        let mut batch = SequenceBatch::new(2, SequenceEffectiveRange::default());
        batch.names = vec!["chr1".into(), "chr2".into()];
        batch.sequences = vec![b"AAAA".to_vec(), b"CCCC".to_vec()];
        batch.qualities = vec![Vec::new(), Vec::new()];
        batch.negative_sequences = vec![Vec::new(), Vec::new()];
        batch.num_loaded = 2;
        batch.reorder_sequences(&[1, 0]);
        assert_eq!(batch.get_sequence_name_at(0), "chr2");
        assert_eq!(batch.get_sequence_at(1), b"AAAA");
    }
}
