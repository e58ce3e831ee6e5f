// Cell-barcode whitelist handling and correction.
//
// A barcode either matches the whitelist exactly, is correctable onto it
// with at most two substitutions, or is dropped. Substitution candidates are
// ranked by a posterior proportional to the whitelist barcode's observed
// abundance times the sequencing-error probability of the substituted bases,
// with per-base qualities clamped into [3, 40].

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::mapping_parameters::MappingParameters;
use crate::sequence_batch::{SequenceBatch, char_to_uint8};
use crate::utils::{self, exit_with_message};

const MIN_ADJUSTED_QUALITY: f64 = 3.0;
const MAX_ADJUSTED_QUALITY: f64 = 40.0;

/// Fraction of sampled barcodes that must hit the whitelist exactly; below
/// this the run aborts unless the check is explicitly skipped.
const MIN_WHITELIST_HIT_FRACTION: f64 = 0.05;

pub struct BarcodeCorrector {
    /// seed -> abundance weight (sampled exact-match count + 1).
    whitelist: HashMap<u64, u64>,
    barcode_length: u32,
    correction_error_threshold: usize,
    correction_probability_threshold: f64,
}

#[derive(Debug, Clone, Copy)]
struct CorrectionCandidate {
    /// Up to two (position, base_code) substitutions.
    substitutions: [(usize, u8); 2],
    num_substitutions: usize,
    posterior: f64,
}

impl BarcodeCorrector {
    pub fn new(mapping_parameters: &MappingParameters) -> Self {
        BarcodeCorrector {
            whitelist: HashMap::new(),
            barcode_length: 0,
            correction_error_threshold: mapping_parameters.barcode_correction_error_threshold,
            correction_probability_threshold: mapping_parameters
                .barcode_correction_probability_threshold,
        }
    }

    #[inline]
    pub fn is_whitelist_loaded(&self) -> bool {
        !self.whitelist.is_empty()
    }

    #[inline]
    pub fn barcode_length(&self) -> u32 {
        self.barcode_length
    }

    fn seed_of(barcode: &[u8]) -> u64 {
        let mut seed = 0u64;
        for &base in barcode {
            seed = (seed << 2) | (char_to_uint8(base) & 3) as u64;
        }
        seed
    }

    /// Load a whitelist file (one barcode per line, optionally gzipped). All
    /// barcodes must share one length; a truncated or ragged whitelist is
    /// fatal.
    pub fn load_barcode_whitelist(&mut self, path: &Path) {
        let start_time = utils::realtime();
        let reader = match utils::xzopen(path) {
            Ok(reader) => reader,
            Err(e) => exit_with_message(&format!(
                "Cannot open barcode whitelist {}: {}",
                path.display(),
                e
            )),
        };
        for line in BufReader::new(reader).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => exit_with_message(&format!("Failed to read barcode whitelist: {}", e)),
            };
            let barcode = line.trim();
            if barcode.is_empty() {
                continue;
            }
            if self.barcode_length == 0 {
                self.barcode_length = barcode.len() as u32;
            } else if barcode.len() as u32 != self.barcode_length {
                exit_with_message(&format!(
                    "Barcode whitelist is ragged: expected length {}, got {} ({})",
                    self.barcode_length,
                    barcode.len(),
                    barcode
                ));
            }
            self.whitelist.insert(Self::seed_of(barcode.as_bytes()), 1);
        }
        if self.whitelist.is_empty() {
            exit_with_message("Barcode whitelist is empty");
        }
        log::info!(
            "Loaded {} whitelist barcodes (length {}) in {:.2}s",
            self.whitelist.len(),
            self.barcode_length,
            utils::realtime() - start_time
        );
    }

    /// First pass over the barcode files: count exact whitelist matches from
    /// up to `max_num_sample_barcodes` barcodes to estimate per-barcode
    /// abundance, and sanity-check that the data matches the whitelist.
    pub fn compute_barcode_abundance(
        &mut self,
        barcode_batch: &mut SequenceBatch,
        barcode_file_paths: &[std::path::PathBuf],
        max_num_sample_barcodes: u64,
        skip_barcode_check: bool,
    ) {
        let start_time = utils::realtime();
        let mut num_sampled: u64 = 0;
        let mut num_in_whitelist: u64 = 0;
        'files: for path in barcode_file_paths {
            barcode_batch.initialize_loading(path);
            loop {
                if num_sampled >= max_num_sample_barcodes {
                    barcode_batch.finalize_loading();
                    break 'files;
                }
                if !barcode_batch.load_one_sequence_and_save_at(0) {
                    break;
                }
                num_sampled += 1;
                let barcode = barcode_batch.get_sequence_at(0);
                if let Some(abundance) = self.whitelist.get_mut(&Self::seed_of(barcode)) {
                    *abundance += 1;
                    num_in_whitelist += 1;
                }
            }
            barcode_batch.finalize_loading();
        }
        let hit_fraction = num_in_whitelist as f64 / num_sampled.max(1) as f64;
        log::info!(
            "Sampled {} barcodes, {:.2}% in whitelist, in {:.2}s",
            num_sampled,
            hit_fraction * 100.0,
            utils::realtime() - start_time
        );
        if hit_fraction < MIN_WHITELIST_HIT_FRACTION && !skip_barcode_check {
            exit_with_message(
                "Less than 5% of sampled barcodes match the whitelist. The barcode file and whitelist likely disagree; rerun with --skip-barcode-check to proceed anyway",
            );
        }
    }

    /// Decide accept / correct / drop for one barcode. Returns the seed of
    /// the accepted (possibly corrected) whitelist barcode; `None` means the
    /// barcode could not be placed on the whitelist. The batch itself is
    /// never written, so concurrent workers can correct different indices of
    /// one shared batch.
    pub fn correct_barcode_at(
        &self,
        barcode_index: usize,
        barcode_batch: &SequenceBatch,
        num_barcode_in_whitelist: &mut u64,
        num_corrected_barcode: &mut u64,
    ) -> Option<u64> {
        let barcode = barcode_batch.get_sequence_at(barcode_index);
        let num_ns = barcode.iter().filter(|&&c| char_to_uint8(c) == 4).count();
        let base_seed = Self::seed_of(barcode);
        if num_ns <= self.correction_error_threshold && self.whitelist.contains_key(&base_seed) {
            *num_barcode_in_whitelist += 1;
            return Some(base_seed);
        }

        let qualities = barcode_batch.get_sequence_qual_at(barcode_index);
        let positions: Vec<usize> = if num_ns > 0 {
            barcode
                .iter()
                .enumerate()
                .filter(|(_, &c)| char_to_uint8(c) == 4)
                .map(|(i, _)| i)
                .collect()
        } else {
            (0..barcode.len()).collect()
        };
        if num_ns > self.correction_error_threshold {
            return None;
        }

        let mut candidates: Vec<CorrectionCandidate> = Vec::new();
        let barcode_length = barcode.len();
        for (pi, &position) in positions.iter().enumerate() {
            let current_code = char_to_uint8(barcode[position]) & 3;
            for substituted_code in 0..4u8 {
                if substituted_code == current_code && num_ns == 0 {
                    continue;
                }
                let seed =
                    substitute_seed(base_seed, barcode_length, position, substituted_code);
                if let Some(&abundance) = self.whitelist.get(&seed) {
                    candidates.push(CorrectionCandidate {
                        substitutions: [(position, substituted_code), (0, 0)],
                        num_substitutions: 1,
                        posterior: abundance as f64
                            * error_probability(qualities, position),
                    });
                }
                if self.correction_error_threshold < 2 {
                    continue;
                }
                for &second_position in positions.iter().skip(pi + 1) {
                    let second_current = char_to_uint8(barcode[second_position]) & 3;
                    for second_code in 0..4u8 {
                        if second_code == second_current && num_ns == 0 {
                            continue;
                        }
                        let seed2 =
                            substitute_seed(seed, barcode_length, second_position, second_code);
                        if let Some(&abundance) = self.whitelist.get(&seed2) {
                            candidates.push(CorrectionCandidate {
                                substitutions: [
                                    (position, substituted_code),
                                    (second_position, second_code),
                                ],
                                num_substitutions: 2,
                                posterior: abundance as f64
                                    * error_probability(qualities, position)
                                    * error_probability(qualities, second_position),
                            });
                        }
                    }
                }
            }
        }

        if candidates.is_empty() {
            return None;
        }
        let chosen = if candidates.len() == 1 {
            candidates[0]
        } else {
            let total: f64 = candidates.iter().map(|c| c.posterior).sum();
            let best = candidates
                .iter()
                .copied()
                .max_by(|a, b| a.posterior.partial_cmp(&b.posterior).unwrap())
                .unwrap();
            if best.posterior / total <= self.correction_probability_threshold {
                return None;
            }
            best
        };
        let mut corrected_seed = base_seed;
        for &(position, code) in chosen.substitutions.iter().take(chosen.num_substitutions) {
            corrected_seed = substitute_seed(corrected_seed, barcode_length, position, code);
        }
        *num_barcode_in_whitelist += 1;
        *num_corrected_barcode += 1;
        Some(corrected_seed)
    }
}

/// Replace one 2-bit base inside a packed barcode seed.
fn substitute_seed(seed: u64, barcode_length: usize, position: usize, code: u8) -> u64 {
    let shift = 2 * (barcode_length - 1 - position);
    (seed & !(3u64 << shift)) | ((code as u64 & 3) << shift)
}

/// 10^(-q/10) with q clamped into the usable range; missing qualities fall
/// back to the minimum confidence.
fn error_probability(qualities: &[u8], position: usize) -> f64 {
    let quality = qualities
        .get(position)
        .map(|&q| (q as f64 - 33.0).clamp(MIN_ADJUSTED_QUALITY, MAX_ADJUSTED_QUALITY))
        .unwrap_or(MIN_ADJUSTED_QUALITY);
    10f64.powf(-quality / 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence_batch::SequenceEffectiveRange;

    fn corrector_with_whitelist(barcodes: &[&str]) -> BarcodeCorrector {
        let mut corrector = BarcodeCorrector::new(&MappingParameters::default());
        for barcode in barcodes {
            corrector.barcode_length = barcode.len() as u32;
            corrector
                .whitelist
                .insert(BarcodeCorrector::seed_of(barcode.as_bytes()), 1);
        }
        corrector
    }

    fn batch_with_barcode(barcode: &[u8], quality: &[u8]) -> SequenceBatch {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bc.fq");
        let mut fastq = b"@bc0\n".to_vec();
        fastq.extend_from_slice(barcode);
        fastq.extend_from_slice(b"\n+\n");
        fastq.extend_from_slice(quality);
        fastq.push(b'\n');
        std::fs::write(&path, fastq).unwrap();
        let mut batch = SequenceBatch::new(1, SequenceEffectiveRange::default());
        batch.initialize_loading(&path);
        assert!(batch.load_one_sequence_and_save_at(0));
        batch.finalize_loading();
        batch
    }

    #[test]
    fn test_exact_match_accepts_without_correction() {
        let corrector = corrector_with_whitelist(&["AAAAAAAAAAAAAAAA"]);
        let batch = batch_with_barcode(b"AAAAAAAAAAAAAAAA", &[b'I'; 16]);
        let mut in_whitelist = 0;
        let mut corrected = 0;
        let seed = corrector.correct_barcode_at(0, &batch, &mut in_whitelist, &mut corrected);
        assert_eq!(seed, Some(BarcodeCorrector::seed_of(b"AAAAAAAAAAAAAAAA")));
        assert_eq!(in_whitelist, 1);
        assert_eq!(corrected, 0);
    }

    #[test]
    fn test_one_substitution_corrects() {
        let corrector = corrector_with_whitelist(&["AAAAAAAAAAAAAAAA"]);
        let batch = batch_with_barcode(b"AAAAAAAAACAAAAAA", &[b'I'; 16]);
        let mut in_whitelist = 0;
        let mut corrected = 0;
        let seed = corrector.correct_barcode_at(0, &batch, &mut in_whitelist, &mut corrected);
        assert_eq!(seed, Some(BarcodeCorrector::seed_of(b"AAAAAAAAAAAAAAAA")));
        assert_eq!(in_whitelist, 1);
        assert_eq!(corrected, 1);
    }

    #[test]
    fn test_unrelated_barcode_is_dropped() {
        let corrector = corrector_with_whitelist(&["AAAAAAAAAAAAAAAA"]);
        let batch = batch_with_barcode(b"CCCCCCCCCCCCCCCC", &[b'I'; 16]);
        let mut in_whitelist = 0;
        let mut corrected = 0;
        assert!(corrector
            .correct_barcode_at(0, &batch, &mut in_whitelist, &mut corrected)
            .is_none());
        assert_eq!(in_whitelist, 0);
    }

    #[test]
    fn test_ambiguous_correction_requires_posterior_margin() {
        // Two whitelist entries one substitution away with equal abundance
        // and equal quality: neither clears the probability threshold.
        let corrector = corrector_with_whitelist(&["AAAAAAAAAAAAAAAA", "CCAAAAAAAAAAAAAA"]);
        let batch = batch_with_barcode(b"ACAAAAAAAAAAAAAA", &[b'I'; 16]);
        let mut in_whitelist = 0;
        let mut corrected = 0;
        assert!(corrector
            .correct_barcode_at(0, &batch, &mut in_whitelist, &mut corrected)
            .is_none());
    }

    #[test]
    fn test_n_position_drives_correction() {
        let corrector = corrector_with_whitelist(&["ACGTACGTACGTACGT"]);
        let batch = batch_with_barcode(b"ACGTACGTNCGTACGT", &[b'I'; 16]);
        let mut in_whitelist = 0;
        let mut corrected = 0;
        let seed = corrector.correct_barcode_at(0, &batch, &mut in_whitelist, &mut corrected);
        assert_eq!(seed, Some(BarcodeCorrector::seed_of(b"ACGTACGTACGTACGT")));
    }

    #[test]
    fn test_two_substitutions_correct_when_allowed() {
        let mut parameters = MappingParameters::default();
        parameters.barcode_correction_error_threshold = 2;
        let mut corrector = BarcodeCorrector::new(&parameters);
        corrector.barcode_length = 16;
        corrector
            .whitelist
            .insert(BarcodeCorrector::seed_of(b"AAAAAAAAAAAAAAAA"), 1);
        let batch = batch_with_barcode(b"AACAAAAAAACAAAAA", &[b'I'; 16]);
        let mut in_whitelist = 0;
        let mut corrected = 0;
        let seed = corrector.correct_barcode_at(0, &batch, &mut in_whitelist, &mut corrected);
        assert_eq!(seed, Some(BarcodeCorrector::seed_of(b"AAAAAAAAAAAAAAAA")));
    }

    #[test]
    fn test_substitute_seed() {
        let seed = BarcodeCorrector::seed_of(b"ACGT");
        assert_eq!(substitute_seed(seed, 4, 0, 3), BarcodeCorrector::seed_of(b"TCGT"));
        assert_eq!(substitute_seed(seed, 4, 3, 0), BarcodeCorrector::seed_of(b"ACGA"));
    }
}
