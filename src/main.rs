use clap::{Parser, Subcommand};
use std::path::PathBuf;

use chromalign::index::Index;
use chromalign::mapping_parameters::{
    IndexParameters, MappingOutputFormat, MappingParameters,
};
use chromalign::mappings::{
    MappingWithBarcode, MappingWithoutBarcode, PafMapping, PairedEndMappingWithBarcode,
    PairedEndMappingWithoutBarcode, PairedPafMapping,
};
use chromalign::pipeline;
use chromalign::sequence_batch::{SequenceBatch, SequenceEffectiveRange};

#[derive(Parser)]
#[command(name = "chromalign")]
#[command(about = "ChromAlign - chromatin-assay short-read aligner (ATAC-seq, ChIP-seq)", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the minimizer index for a reference genome
    Index {
        /// Reference FASTA file
        #[arg(short = 'r', long, value_name = "REF.FA")]
        reference: PathBuf,

        /// Output index file
        #[arg(short = 'o', long, value_name = "FILE")]
        output: PathBuf,

        /// K-mer length
        #[arg(short = 'k', long, value_name = "INT", default_value = "17")]
        kmer: usize,

        /// Minimizer window size
        #[arg(short = 'w', long, value_name = "INT", default_value = "5")]
        window: usize,

        /// Number of threads
        #[arg(short = 't', long, value_name = "INT")]
        threads: Option<usize>,
    },

    /// Map reads against a pre-built index
    Map {
        // ===== Inputs =====
        /// Reference FASTA file
        #[arg(short = 'r', long, value_name = "REF.FA")]
        reference: PathBuf,

        /// Index file built with the `index` command
        #[arg(short = 'x', long, value_name = "FILE")]
        index: PathBuf,

        /// Single-end read file(s), or read1 file(s) for paired-end
        #[arg(short = '1', long = "read1", value_name = "FQ", value_delimiter = ',', required = true)]
        read1: Vec<PathBuf>,

        /// Read2 file(s) for paired-end mapping
        #[arg(short = '2', long = "read2", value_name = "FQ", value_delimiter = ',')]
        read2: Vec<PathBuf>,

        /// Cell barcode file(s)
        #[arg(short = 'b', long = "barcode", value_name = "FQ", value_delimiter = ',')]
        barcode: Vec<PathBuf>,

        /// Barcode whitelist file (one barcode per line)
        #[arg(long, value_name = "FILE")]
        barcode_whitelist: Option<PathBuf>,

        /// Read trimming spec, e.g. "r1:0:49,bc:0:15"
        #[arg(long, value_name = "STR", default_value = "")]
        read_format: String,

        /// Custom reference order file (one reference name per row)
        #[arg(long, value_name = "FILE")]
        chr_order: Option<PathBuf>,

        // ===== Algorithm options =====
        /// Max # errors allowed to map a read
        #[arg(short = 'e', long, value_name = "INT", default_value = "3")]
        error_threshold: i32,

        /// Match score
        #[arg(short = 'A', long, value_name = "INT", default_value = "1")]
        match_score: i32,

        /// Mismatch penalty
        #[arg(short = 'B', long, value_name = "INT", default_value = "4")]
        mismatch_penalty: i32,

        /// Gap open penalties for deletions and insertions [6,6]
        #[arg(short = 'O', long, value_name = "INT[,INT]", default_value = "6,6")]
        gap_open: String,

        /// Gap extension penalties for deletions and insertions [1,1]
        #[arg(short = 'E', long, value_name = "INT[,INT]", default_value = "1,1")]
        gap_extend: String,

        /// Min # seeds to try to map a read
        #[arg(short = 's', long, value_name = "INT", default_value = "2")]
        min_num_seeds: u32,

        /// Max seed frequencies for a seed to be selected [1000,5000]
        #[arg(short = 'f', long, value_name = "INT[,INT]", default_value = "1000,5000")]
        max_seed_frequencies: String,

        /// Only report up to INT best mappings
        #[arg(short = 'n', long, value_name = "INT", default_value = "10")]
        max_num_best_mappings: usize,

        /// Max insert size, paired-end only
        #[arg(short = 'l', long, value_name = "INT", default_value = "400")]
        max_insert_size: u32,

        /// Min read length
        #[arg(long, value_name = "INT", default_value = "30")]
        min_read_length: usize,

        /// Uni-mappings within this distance from any end of a multi-mapping
        /// are used for allocation
        #[arg(long, value_name = "INT", default_value = "0")]
        multi_mapping_allocation_distance: u32,

        /// Seed for the multi-mapping allocation RNG
        #[arg(long, value_name = "INT", default_value = "11")]
        multi_mapping_allocation_seed: u64,

        /// Drop reads with more than INT best mappings
        #[arg(long, value_name = "INT", default_value = "500000")]
        drop_repetitive_reads: usize,

        // ===== Cache =====
        /// Minimizer cache capacity (entries)
        #[arg(long, value_name = "INT", default_value = "2000003")]
        cache_size: usize,

        /// Fraction of each batch offered as cache updates once warm
        #[arg(long, value_name = "FLOAT", default_value = "0.01")]
        cache_update_param: f64,

        // ===== Barcode correction =====
        /// Max substitutions when correcting a barcode (0-2)
        #[arg(long, value_name = "INT", default_value = "1")]
        bc_error_threshold: usize,

        /// Min posterior share to accept an ambiguous correction
        #[arg(long, value_name = "FLOAT", default_value = "0.9")]
        bc_probability_threshold: f64,

        /// Proceed even if <5% of sampled barcodes match the whitelist
        #[arg(long)]
        skip_barcode_check: bool,

        /// Keep mappings whose barcode is not in the whitelist
        #[arg(long)]
        output_mappings_not_in_whitelist: bool,

        // ===== Post-processing =====
        /// Try to trim adapters on 3'
        #[arg(long)]
        trim_adapters: bool,

        /// Remove PCR duplicates
        #[arg(long)]
        remove_pcr_duplicates: bool,

        /// Allocate multi-mappings to unique-mapping-rich placements
        #[arg(long)]
        allocate_multi_mappings: bool,

        /// Only output unique mappings
        #[arg(long = "unique-mappings")]
        only_output_unique_mappings: bool,

        /// Apply the Tn5 transposase coordinate shift
        #[arg(long = "Tn5-shift")]
        tn5_shift: bool,

        /// Drop identical read pairs at load time
        #[arg(long)]
        dedupe_identical_pairs: bool,

        /// Bound memory by spilling sorted mappings to temp files
        #[arg(long = "low-mem")]
        low_memory_mode: bool,

        // ===== Output =====
        /// Output file ("-" for stdout)
        #[arg(short = 'o', long, value_name = "FILE", required = true)]
        output: PathBuf,

        /// Output mappings in BED/BEDPE format (default)
        #[arg(long = "BED")]
        output_bed: bool,

        /// Output mappings in TagAlign/PairedTagAlign format
        #[arg(long = "TagAlign")]
        output_tagalign: bool,

        /// Output mappings in PAF format
        #[arg(long = "PAF")]
        output_paf: bool,

        /// Per-barcode summary metadata file
        #[arg(long, value_name = "FILE")]
        summary: Option<PathBuf>,

        /// Add the estimated number of unique cache slots per barcode to the
        /// summary
        #[arg(long)]
        output_num_uniq_cache_slots: bool,

        /// Sketch size for the unique-cache-slot estimator
        #[arg(long, value_name = "INT", default_value = "8")]
        k_for_minhash: usize,

        // ===== Processing =====
        /// Number of threads
        #[arg(short = 't', long, value_name = "INT")]
        threads: Option<usize>,

        /// Verbose level: 1=error, 2=warning, 3=message, 4+=debugging
        #[arg(short = 'v', long, value_name = "INT", default_value = "3")]
        verbosity: i32,
    },
}

fn init_logger(verbosity: i32) {
    let log_level = match verbosity {
        v if v <= 1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn configure_threads(threads: Option<usize>) -> usize {
    let mut num_threads = threads.unwrap_or_else(num_cpus::get);
    if num_threads < 1 {
        log::warn!("Invalid thread count {}, using 1 thread", num_threads);
        num_threads = 1;
    }
    let max_threads = num_cpus::get() * 2;
    if num_threads > max_threads {
        log::warn!(
            "Thread count {} exceeds recommended maximum {}, capping at {}",
            num_threads,
            max_threads,
            max_threads
        );
        num_threads = max_threads;
    }
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()
    {
        log::warn!(
            "Failed to configure thread pool: {} (may already be initialized)",
            e
        );
    }
    log::info!(
        "Using {} thread{}",
        num_threads,
        if num_threads == 1 { "" } else { "s" }
    );
    num_threads
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Index {
            reference,
            output,
            kmer,
            window,
            threads,
        } => {
            init_logger(3);
            let index_parameters = IndexParameters {
                kmer_size: kmer,
                window_size: window,
                num_threads: threads.unwrap_or_else(num_cpus::get),
                reference_file_path: reference,
                index_output_file_path: output,
            };
            if let Err(e) = index_parameters.validate() {
                log::error!("{}", e);
                std::process::exit(1);
            }
            configure_threads(Some(index_parameters.num_threads));
            log::info!(
                "Building index: k-mer {}, window {}",
                index_parameters.kmer_size,
                index_parameters.window_size
            );
            let mut reference = SequenceBatch::new(1, SequenceEffectiveRange::default());
            reference.load_all_sequences(&index_parameters.reference_file_path);
            let mut index = Index::new(&index_parameters.index_output_file_path);
            index.construct(
                index_parameters.kmer_size,
                index_parameters.window_size,
                &reference,
            );
            if let Err(e) = index.save() {
                log::error!("Failed to save index: {}", e);
                std::process::exit(1);
            }
            log::info!(
                "Index written to {}",
                index_parameters.index_output_file_path.display()
            );
        }

        Commands::Map {
            reference,
            index,
            read1,
            read2,
            barcode,
            barcode_whitelist,
            read_format,
            chr_order,
            error_threshold,
            match_score,
            mismatch_penalty,
            gap_open,
            gap_extend,
            min_num_seeds,
            max_seed_frequencies,
            max_num_best_mappings,
            max_insert_size,
            min_read_length,
            multi_mapping_allocation_distance,
            multi_mapping_allocation_seed,
            drop_repetitive_reads,
            cache_size,
            cache_update_param,
            bc_error_threshold,
            bc_probability_threshold,
            skip_barcode_check,
            output_mappings_not_in_whitelist,
            trim_adapters,
            remove_pcr_duplicates,
            allocate_multi_mappings,
            only_output_unique_mappings,
            tn5_shift,
            dedupe_identical_pairs,
            low_memory_mode,
            output,
            output_bed,
            output_tagalign,
            output_paf,
            summary,
            output_num_uniq_cache_slots,
            k_for_minhash,
            threads,
            verbosity,
        } => {
            init_logger(verbosity);

            let mut mapping_parameters = MappingParameters {
                error_threshold,
                match_score,
                mismatch_penalty,
                min_num_seeds_required_for_mapping: min_num_seeds,
                max_num_best_mappings,
                max_insert_size,
                min_read_length,
                drop_repetitive_reads,
                multi_mapping_allocation_distance,
                multi_mapping_allocation_seed,
                trim_adapters,
                remove_pcr_duplicates,
                allocate_multi_mappings,
                only_output_unique_mappings,
                tn5_shift,
                low_memory_mode,
                dedupe_identical_pairs,
                cache_size,
                cache_update_param,
                is_bulk_data: barcode.is_empty(),
                barcode_whitelist_file_path: barcode_whitelist,
                barcode_correction_error_threshold: bc_error_threshold,
                barcode_correction_probability_threshold: bc_probability_threshold,
                output_mappings_not_in_whitelist,
                skip_barcode_check,
                summary_metadata_file_path: summary,
                output_num_uniq_cache_slots,
                k_for_minhash,
                reference_file_path: reference,
                index_file_path: index,
                read_file1_paths: read1,
                read_file2_paths: read2,
                barcode_file_paths: barcode,
                custom_rid_order_file_path: chr_order,
                mapping_output_file_path: output,
                read_format,
                ..MappingParameters::default()
            };

            match MappingParameters::parse_penalty_pair(&gap_open) {
                Ok(penalties) => mapping_parameters.gap_open_penalties = penalties,
                Err(e) => {
                    log::error!("{}", e);
                    std::process::exit(1);
                }
            }
            match MappingParameters::parse_penalty_pair(&gap_extend) {
                Ok(penalties) => mapping_parameters.gap_extension_penalties = penalties,
                Err(e) => {
                    log::error!("{}", e);
                    std::process::exit(1);
                }
            }
            match MappingParameters::parse_seed_frequencies(&max_seed_frequencies) {
                Ok(frequencies) => mapping_parameters.max_seed_frequencies = frequencies,
                Err(e) => {
                    log::error!("{}", e);
                    std::process::exit(1);
                }
            }

            mapping_parameters.mapping_output_format = match (output_bed, output_tagalign, output_paf)
            {
                (_, false, false) => MappingOutputFormat::Bed,
                (false, true, false) => MappingOutputFormat::TagAlign,
                (false, false, true) => MappingOutputFormat::Paf,
                _ => {
                    log::error!("--BED, --TagAlign and --PAF are mutually exclusive");
                    std::process::exit(1);
                }
            };

            if mapping_parameters.max_num_best_mappings
                > mapping_parameters.drop_repetitive_reads
            {
                log::warn!(
                    "Reads with more than {} best mappings are dropped, so at most {} best mappings will be output",
                    mapping_parameters.drop_repetitive_reads,
                    mapping_parameters.drop_repetitive_reads
                );
                mapping_parameters.max_num_best_mappings =
                    mapping_parameters.drop_repetitive_reads;
            }

            if let Err(e) = mapping_parameters.validate() {
                log::error!("{}", e);
                std::process::exit(1);
            }

            mapping_parameters.num_threads = configure_threads(threads);

            if verbosity >= 3 {
                log::info!(
                    "Error threshold: {}, min seeds: {}, seed frequency caps: {:?}",
                    mapping_parameters.error_threshold,
                    mapping_parameters.min_num_seeds_required_for_mapping,
                    mapping_parameters.max_seed_frequencies
                );
                log::info!(
                    "Match: {}, mismatch: {}, gap open: {:?}, gap extend: {:?}",
                    mapping_parameters.match_score,
                    mapping_parameters.mismatch_penalty,
                    mapping_parameters.gap_open_penalties,
                    mapping_parameters.gap_extension_penalties
                );
                log::info!(
                    "Max best mappings: {}, max insert size: {}, min read length: {}",
                    mapping_parameters.max_num_best_mappings,
                    mapping_parameters.max_insert_size,
                    mapping_parameters.min_read_length
                );
                if mapping_parameters.is_bulk_data {
                    log::info!("Analyzing bulk data");
                } else {
                    log::info!("Analyzing single-cell data");
                }
            }

            let is_paired_end = !mapping_parameters.read_file2_paths.is_empty();
            let has_barcode = !mapping_parameters.is_bulk_data;
            let is_paf = mapping_parameters.mapping_output_format == MappingOutputFormat::Paf;

            // One concrete record type per mode; the whole pipeline
            // monomorphizes on it.
            match (is_paired_end, is_paf, has_barcode) {
                (false, true, _) => {
                    pipeline::map_single_end_reads::<PafMapping>(&mapping_parameters)
                }
                (false, false, true) => {
                    pipeline::map_single_end_reads::<MappingWithBarcode>(&mapping_parameters)
                }
                (false, false, false) => {
                    pipeline::map_single_end_reads::<MappingWithoutBarcode>(&mapping_parameters)
                }
                (true, true, _) => {
                    pipeline::map_paired_end_reads::<PairedPafMapping>(&mapping_parameters)
                }
                (true, false, true) => pipeline::map_paired_end_reads::<PairedEndMappingWithBarcode>(
                    &mapping_parameters,
                ),
                (true, false, false) => pipeline::map_paired_end_reads::<
                    PairedEndMappingWithoutBarcode,
                >(&mapping_parameters),
            }
        }
    }
}
