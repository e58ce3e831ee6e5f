// Parameter structures for index construction and read mapping.

use std::path::PathBuf;

/// Output format selection. One concrete mapping record type is instantiated
/// per format/barcode combination; there is no dynamic dispatch on the
/// per-read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingOutputFormat {
    Bed,
    TagAlign,
    Paf,
}

/// Parameters for building the minimizer index.
#[derive(Debug, Clone)]
pub struct IndexParameters {
    pub kmer_size: usize,
    pub window_size: usize,
    pub num_threads: usize,
    pub reference_file_path: PathBuf,
    pub index_output_file_path: PathBuf,
}

impl Default for IndexParameters {
    fn default() -> Self {
        IndexParameters {
            kmer_size: 17,
            window_size: 5,
            num_threads: 1,
            reference_file_path: PathBuf::new(),
            index_output_file_path: PathBuf::new(),
        }
    }
}

impl IndexParameters {
    pub fn validate(&self) -> Result<(), String> {
        if self.kmer_size < 1 || self.kmer_size > 28 {
            return Err(format!(
                "K-mer size {} out of range (1..=28, two bits per base in a 56-bit key)",
                self.kmer_size
            ));
        }
        if self.window_size < 1 {
            return Err("Window size must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Mapping options. Defaults match the documented command-line defaults.
#[derive(Debug, Clone)]
pub struct MappingParameters {
    // Scoring / verification
    pub error_threshold: i32,
    pub match_score: i32,
    pub mismatch_penalty: i32,
    pub gap_open_penalties: [i32; 2],
    pub gap_extension_penalties: [i32; 2],

    // Seeding
    pub min_num_seeds_required_for_mapping: u32,
    /// [0] is the normal per-seed hit cap, [1] the relaxed cap used when
    /// supplementing a mate that produced no candidates.
    pub max_seed_frequencies: [usize; 2],

    // Selection
    pub max_num_best_mappings: usize,
    pub max_insert_size: u32,
    pub min_read_length: usize,
    pub drop_repetitive_reads: usize,
    pub multi_mapping_allocation_distance: u32,
    pub multi_mapping_allocation_seed: u64,

    // Post-processing toggles
    pub trim_adapters: bool,
    pub remove_pcr_duplicates: bool,
    pub allocate_multi_mappings: bool,
    pub only_output_unique_mappings: bool,
    pub tn5_shift: bool,
    pub low_memory_mode: bool,

    // Input-level identical-pair dedupe. Off by default.
    pub dedupe_identical_pairs: bool,

    // Cache
    pub cache_size: usize,
    pub cache_update_param: f64,

    // Barcodes
    pub is_bulk_data: bool,
    pub barcode_whitelist_file_path: Option<PathBuf>,
    pub barcode_correction_error_threshold: usize,
    pub barcode_correction_probability_threshold: f64,
    pub output_mappings_not_in_whitelist: bool,
    pub skip_barcode_check: bool,

    // Summary metadata
    pub summary_metadata_file_path: Option<PathBuf>,
    pub output_num_uniq_cache_slots: bool,
    pub k_for_minhash: usize,

    // Reproducibility: seeds the per-read reservoir RNG.
    pub run_seed: u64,

    // Threads / batches
    pub num_threads: usize,
    pub read_batch_size: usize,

    // Inputs / outputs
    pub reference_file_path: PathBuf,
    pub index_file_path: PathBuf,
    pub read_file1_paths: Vec<PathBuf>,
    pub read_file2_paths: Vec<PathBuf>,
    pub barcode_file_paths: Vec<PathBuf>,
    pub custom_rid_order_file_path: Option<PathBuf>,
    pub mapping_output_file_path: PathBuf,
    pub mapping_output_format: MappingOutputFormat,

    /// Read stream trimming spec, e.g. "r1:0:49,bc:0:15" (see
    /// `SequenceEffectiveRange`). Empty string means full-length everything.
    pub read_format: String,
}

impl Default for MappingParameters {
    fn default() -> Self {
        MappingParameters {
            error_threshold: 3,
            match_score: 1,
            mismatch_penalty: 4,
            gap_open_penalties: [6, 6],
            gap_extension_penalties: [1, 1],
            min_num_seeds_required_for_mapping: 2,
            max_seed_frequencies: [1000, 5000],
            max_num_best_mappings: 10,
            max_insert_size: 400,
            min_read_length: 30,
            drop_repetitive_reads: 500_000,
            multi_mapping_allocation_distance: 0,
            multi_mapping_allocation_seed: 11,
            trim_adapters: false,
            remove_pcr_duplicates: false,
            allocate_multi_mappings: false,
            only_output_unique_mappings: false,
            tn5_shift: false,
            low_memory_mode: false,
            dedupe_identical_pairs: false,
            cache_size: 2_000_003,
            cache_update_param: 0.01,
            is_bulk_data: true,
            barcode_whitelist_file_path: None,
            barcode_correction_error_threshold: 1,
            barcode_correction_probability_threshold: 0.9,
            output_mappings_not_in_whitelist: false,
            skip_barcode_check: false,
            summary_metadata_file_path: None,
            output_num_uniq_cache_slots: false,
            k_for_minhash: 8,
            run_seed: 11,
            num_threads: 1,
            read_batch_size: 500_000,
            reference_file_path: PathBuf::new(),
            index_file_path: PathBuf::new(),
            read_file1_paths: Vec::new(),
            read_file2_paths: Vec::new(),
            barcode_file_paths: Vec::new(),
            custom_rid_order_file_path: None,
            mapping_output_file_path: PathBuf::new(),
            mapping_output_format: MappingOutputFormat::Bed,
            read_format: String::new(),
        }
    }
}

impl MappingParameters {
    /// Reject configurations the mapper cannot run. The band of the
    /// bit-parallel verifier lives in a single 32-bit word, so 2e+1 must not
    /// exceed 31 diagonals.
    pub fn validate(&self) -> Result<(), String> {
        if self.error_threshold < 0 || 2 * self.error_threshold + 1 > 31 {
            return Err(format!(
                "Error threshold {} is not supported: the alignment band 2e+1 must fit in 31 diagonals",
                self.error_threshold
            ));
        }
        if self.min_read_length < 2 * self.error_threshold as usize + 1 {
            return Err(format!(
                "Min read length {} is shorter than the alignment band",
                self.min_read_length
            ));
        }
        if self.max_seed_frequencies[0] == 0 {
            return Err("Max seed frequency must be positive".to_string());
        }
        if self.allocate_multi_mappings && self.only_output_unique_mappings {
            return Err(
                "--allocate-multi-mappings and --unique-mappings are mutually exclusive"
                    .to_string(),
            );
        }
        if self.max_num_best_mappings > self.drop_repetitive_reads {
            return Err(format!(
                "--max-num-best-mappings {} exceeds --drop-repetitive-reads {}",
                self.max_num_best_mappings, self.drop_repetitive_reads
            ));
        }
        if !(0.0..=1.0).contains(&self.cache_update_param) {
            return Err("Cache update parameter must be within [0,1]".to_string());
        }
        if self.barcode_correction_error_threshold > 2 {
            return Err("Barcode correction supports at most 2 substitutions".to_string());
        }
        if !self.read_file2_paths.is_empty()
            && self.read_file1_paths.len() != self.read_file2_paths.len()
        {
            return Err("Numbers of read1 and read2 files don't match".to_string());
        }
        if !self.is_bulk_data && self.barcode_file_paths.len() != self.read_file1_paths.len() {
            return Err("Numbers of read and barcode files don't match".to_string());
        }
        Ok(())
    }

    /// Parse "INT" or "INT,INT" penalty pairs; a single value applies to both
    /// deletions and insertions.
    pub fn parse_penalty_pair(s: &str) -> Result<[i32; 2], String> {
        let parts: Vec<&str> = s.split(',').collect();
        match parts.len() {
            1 => {
                let val = parts[0]
                    .parse::<i32>()
                    .map_err(|_| format!("Invalid penalty value: {}", s))?;
                Ok([val, val])
            }
            2 => {
                let del = parts[0]
                    .parse::<i32>()
                    .map_err(|_| format!("Invalid deletion penalty: {}", parts[0]))?;
                let ins = parts[1]
                    .parse::<i32>()
                    .map_err(|_| format!("Invalid insertion penalty: {}", parts[1]))?;
                Ok([del, ins])
            }
            _ => Err(format!("Penalty must be INT or INT,INT: {}", s)),
        }
    }

    /// Parse "INT" or "INT,INT" seed-frequency caps.
    pub fn parse_seed_frequencies(s: &str) -> Result<[usize; 2], String> {
        let parts: Vec<&str> = s.split(',').collect();
        match parts.len() {
            1 => {
                let val = parts[0]
                    .parse::<usize>()
                    .map_err(|_| format!("Invalid seed frequency: {}", s))?;
                Ok([val, val * 5])
            }
            2 => {
                let lo = parts[0]
                    .parse::<usize>()
                    .map_err(|_| format!("Invalid seed frequency: {}", parts[0]))?;
                let hi = parts[1]
                    .parse::<usize>()
                    .map_err(|_| format!("Invalid supplement seed frequency: {}", parts[1]))?;
                Ok([lo, hi])
            }
            _ => Err(format!("Seed frequencies must be INT or INT,INT: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters_are_valid() {
        let params = MappingParameters::default();
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_band_capacity_check() {
        let mut params = MappingParameters::default();
        params.error_threshold = 15;
        // 2*15+1 = 31 still fits.
        assert!(params.validate().is_ok());
        params.error_threshold = 16;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_exclusive_flags_rejected() {
        let mut params = MappingParameters::default();
        params.allocate_multi_mappings = true;
        params.only_output_unique_mappings = true;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_parse_penalty_pair() {
        assert_eq!(MappingParameters::parse_penalty_pair("6").unwrap(), [6, 6]);
        assert_eq!(
            MappingParameters::parse_penalty_pair("6,4").unwrap(),
            [6, 4]
        );
        assert!(MappingParameters::parse_penalty_pair("a,b").is_err());
        assert!(MappingParameters::parse_penalty_pair("1,2,3").is_err());
    }

    #[test]
    fn test_parse_seed_frequencies() {
        assert_eq!(
            MappingParameters::parse_seed_frequencies("1000,5000").unwrap(),
            [1000, 5000]
        );
        assert_eq!(
            MappingParameters::parse_seed_frequencies("500").unwrap(),
            [500, 2500]
        );
    }
}
