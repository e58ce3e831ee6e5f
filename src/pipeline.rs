// Mapping drivers: the streaming concurrent pipeline for single-end and
// paired-end runs.
//
// One loader thread reads ahead over a bounded channel while the worker pool
// maps the active batch; drained batches are recycled back to the loader so
// buffers rotate between loading, active and saving roles without
// reallocation. Within a batch the per-read task loop runs on the rayon
// pool with an explicit grain; the cache-update pass and the bucket merge
// run after the loop's implicit barrier. No cross-read emission order is
// guaranteed; post-processing sorts restore positional order.

use std::path::PathBuf;

use crossbeam_channel::bounded;
use rayon::prelude::*;

use crate::barcode::BarcodeCorrector;
use crate::candidate_processor::{Candidate, CandidateProcessor};
use crate::draft_mapping_generator::DraftMappingGenerator;
use crate::dup_detector::DupDetector;
use crate::index::Index;
use crate::mapping_metadata::{MappingMetadata, PairedEndMappingMetadata};
use crate::mapping_parameters::{MappingOutputFormat, MappingParameters};
use crate::mapping_processor::MappingProcessor;
use crate::mapping_generator::MappingGenerator;
use crate::mapping_writer::{MappingWriter, TempMappingFileHandle};
use crate::mappings::{MappingRecord, PairedEndRecord, SingleEndRecord};
use crate::minimizer::{Minimizer, MinimizerGenerator};
use crate::mm_cache::MmCache;
use crate::sequence_batch::{self, SequenceBatch, SequenceEffectiveRange};
use crate::summary::{BarcodePeakMap, SummaryField, SummaryMetadata};
use crate::utils::{self, exit_with_message};

const SINGLE_END_GRAIN: usize = 10_000;
const PAIRED_END_GRAIN: usize = 5_000;
const INITIAL_NUM_SAMPLE_BARCODES: u64 = 20_000_000;
const BARCODE_LENGTH_SAMPLE: usize = 1_000;

/// Run-wide mapping counters, reduced from per-chunk partials at each merge.
#[derive(Debug, Default, Clone)]
pub struct MappingStats {
    pub num_reads: u64,
    pub num_short_reads: u64,
    pub num_candidates: u64,
    pub num_mappings: u64,
    pub num_mapped_reads: u64,
    pub num_uniquely_mapped_reads: u64,
    pub num_barcode_in_whitelist: u64,
    pub num_corrected_barcode: u64,
}

impl MappingStats {
    fn merge(&mut self, other: &MappingStats) {
        self.num_reads += other.num_reads;
        self.num_short_reads += other.num_short_reads;
        self.num_candidates += other.num_candidates;
        self.num_mappings += other.num_mappings;
        self.num_mapped_reads += other.num_mapped_reads;
        self.num_uniquely_mapped_reads += other.num_uniquely_mapped_reads;
        self.num_barcode_in_whitelist += other.num_barcode_in_whitelist;
        self.num_corrected_barcode += other.num_corrected_barcode;
    }

    fn output_mapping_statistics(&self) {
        log::info!("Number of reads: {}", self.num_reads);
        log::info!("Number of mapped reads: {}", self.num_mapped_reads);
        log::info!(
            "Number of uniquely mapped reads: {}",
            self.num_uniquely_mapped_reads
        );
        log::info!(
            "Number of reads have multi-mappings: {}",
            self.num_mapped_reads - self.num_uniquely_mapped_reads
        );
        log::info!("Number of candidates: {}", self.num_candidates);
        log::info!("Number of mappings: {}", self.num_mappings);
        if self.num_short_reads > 0 {
            log::info!("Number of reads dropped as too short: {}", self.num_short_reads);
        }
    }

    fn output_barcode_statistics(&self) {
        log::info!(
            "Number of barcodes in whitelist: {}",
            self.num_barcode_in_whitelist
        );
        log::info!("Number of corrected barcodes: {}", self.num_corrected_barcode);
    }
}

/// Candidate snapshot recorded during the mapping phase and offered to the
/// cache in the update phase.
struct MmHistory {
    minimizers: Vec<Minimizer>,
    positive_candidates: Vec<Candidate>,
    negative_candidates: Vec<Candidate>,
    repetitive_seed_length: u32,
    read_length: u32,
}

/// Deferred per-read summary-metadata update.
struct SummaryEvent {
    barcode_seed: u64,
    whitelisted: bool,
    mapped_with_cache_hit: bool,
}

struct PairBatch {
    reads1: SequenceBatch,
    reads2: SequenceBatch,
    barcodes: Option<SequenceBatch>,
    num_loaded: u32,
}

struct SingleBatch {
    reads: SequenceBatch,
    barcodes: Option<SequenceBatch>,
    num_loaded: u32,
}

fn effective_ranges(
    mapping_parameters: &MappingParameters,
) -> (
    SequenceEffectiveRange,
    SequenceEffectiveRange,
    SequenceEffectiveRange,
) {
    match sequence_batch::parse_read_format(&mapping_parameters.read_format) {
        Ok(ranges) => ranges,
        Err(e) => exit_with_message(&e),
    }
}

/// Load the custom reference ordering: one reference name per row; the row
/// number is the reference's new rank. References absent from the file keep
/// their relative order after the listed ones.
fn generate_custom_rid_ranks(
    path: &PathBuf,
    num_reference_sequences: u32,
    reference: &SequenceBatch,
) -> Vec<usize> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => exit_with_message(&format!(
            "Cannot open custom rid order file {}: {}",
            path.display(),
            e
        )),
    };
    let mut name_to_rank = std::collections::HashMap::new();
    for (rank, line) in contents.lines().enumerate() {
        let name = line.trim();
        if !name.is_empty() {
            name_to_rank.insert(name.to_string(), rank);
        }
    }
    let mut next_rank = name_to_rank.len();
    let mut rid_ranks = Vec::with_capacity(num_reference_sequences as usize);
    for rid in 0..num_reference_sequences as usize {
        match name_to_rank.get(reference.get_sequence_name_at(rid)) {
            Some(&rank) => rid_ranks.push(rank),
            None => {
                rid_ranks.push(next_rank);
                next_rank += 1;
            }
        }
    }
    if next_rank != num_reference_sequences as usize {
        exit_with_message("Custom rid order file names references that do not exist");
    }
    rid_ranks
}

/// Remap candidate reference ids onto their custom ranks and restore sorted
/// order for the downstream two-pointer sweeps.
fn rerank_candidates_rid(candidates: &mut [Candidate], rid_ranks: &[usize]) {
    for candidate in candidates.iter_mut() {
        let rid = (candidate.position >> 32) as usize;
        candidate.position =
            ((rid_ranks[rid] as u64) << 32) | (candidate.position & 0xffff_ffff);
    }
    candidates.sort_unstable_by_key(|candidate| candidate.position);
}

/// Determine the barcode length from a sample prefix of the first barcode
/// file. Ragged barcode lengths are fatal.
fn sample_input_barcodes_and_examine_length(
    barcode_file_paths: &[PathBuf],
    barcode_effective_range: SequenceEffectiveRange,
) -> u32 {
    if barcode_file_paths.is_empty() {
        exit_with_message("Single-cell run without barcode files");
    }
    let mut batch = SequenceBatch::new(1, barcode_effective_range);
    batch.initialize_loading(&barcode_file_paths[0]);
    let mut barcode_length = 0u32;
    for _ in 0..BARCODE_LENGTH_SAMPLE {
        if !batch.load_one_sequence_and_save_at(0) {
            break;
        }
        let length = batch.get_sequence_length_at(0);
        if barcode_length == 0 {
            barcode_length = length;
        } else if barcode_length != length {
            exit_with_message("Barcode lengths are not identical across reads");
        }
    }
    batch.finalize_loading();
    if barcode_length == 0 {
        exit_with_message("Barcode file is empty");
    }
    log::info!("Barcode length: {}", barcode_length);
    barcode_length
}

/// In-memory cap before a spill, matching a ~1 GiB record budget (halved
/// for the heavier name-carrying PAF records).
fn max_num_mappings_in_mem<R: MappingRecord>(format: MappingOutputFormat) -> u64 {
    let budget: u64 = match format {
        MappingOutputFormat::Paf => 1 << 29,
        _ => 1 << 30,
    };
    budget / (std::mem::size_of::<R>() as u64).max(1)
}

/// Grow the spill budget once the run starts producing very many temp
/// files, so file-handle pressure stays bounded.
fn maybe_grow_spill_budget(
    temp_mapping_file_handles: &[TempMappingFileHandle],
    max_num_mappings_in_mem: &mut u64,
) {
    if temp_mapping_file_handles.len() > 850 && temp_mapping_file_handles.len() % 10 == 1 {
        *max_num_mappings_in_mem <<= 1;
        log::info!(
            "Used {} temp files; doubling the in-memory mapping budget to {}",
            temp_mapping_file_handles.len(),
            max_num_mappings_in_mem
        );
    }
}

// ---------------------------------------------------------------------------
// Paired-end driver
// ---------------------------------------------------------------------------

struct PairedWorkerState<R> {
    paired_metadata: PairedEndMappingMetadata,
    buckets: Vec<Vec<R>>,
    stats: MappingStats,
    histories: Vec<MmHistory>,
    summary_events: Vec<SummaryEvent>,
}

impl<R> PairedWorkerState<R> {
    fn new(num_reference_sequences: usize) -> Self {
        PairedWorkerState {
            paired_metadata: PairedEndMappingMetadata::default(),
            buckets: (0..num_reference_sequences).map(|_| Vec::new()).collect(),
            stats: MappingStats::default(),
            histories: Vec::new(),
            summary_events: Vec::new(),
        }
    }
}

pub fn map_paired_end_reads<R: PairedEndRecord>(mapping_parameters: &MappingParameters) {
    let real_start_time = utils::realtime();
    let (read1_range, read2_range, barcode_range) = effective_ranges(mapping_parameters);

    let mut reference = SequenceBatch::new(1, SequenceEffectiveRange::default());
    let num_reference_sequences =
        reference.load_all_sequences(&mapping_parameters.reference_file_path);
    log::info!("Loaded {} reference sequences", num_reference_sequences);

    let custom_rid_ranks = mapping_parameters
        .custom_rid_order_file_path
        .as_ref()
        .map(|path| {
            let rid_ranks =
                generate_custom_rid_ranks(path, num_reference_sequences, &reference);
            reference.reorder_sequences(&rid_ranks);
            rid_ranks
        });

    let mut index = Index::new(&mapping_parameters.index_file_path);
    index.load();
    let kmer_size = index.get_kmer_size();
    let window_size = index.get_window_size();

    // Barcode preprocessing for single-cell data.
    let mut barcode_corrector = BarcodeCorrector::new(mapping_parameters);
    let mut barcode_length = 0u32;
    if !mapping_parameters.is_bulk_data {
        barcode_length = sample_input_barcodes_and_examine_length(
            &mapping_parameters.barcode_file_paths,
            barcode_range,
        );
        if let Some(whitelist_path) = &mapping_parameters.barcode_whitelist_file_path {
            barcode_corrector.load_barcode_whitelist(whitelist_path);
            if barcode_corrector.barcode_length() != barcode_length {
                exit_with_message("Barcode whitelist length does not match the barcode reads");
            }
            let mut sampling_batch = SequenceBatch::new(1, barcode_range);
            barcode_corrector.compute_barcode_abundance(
                &mut sampling_batch,
                &mapping_parameters.barcode_file_paths,
                INITIAL_NUM_SAMPLE_BARCODES,
                mapping_parameters.skip_barcode_check,
            );
        }
    }

    let minimizer_generator = MinimizerGenerator::new(kmer_size, window_size);
    let candidate_processor = CandidateProcessor::new(
        mapping_parameters.min_num_seeds_required_for_mapping,
        mapping_parameters.max_seed_frequencies,
    );
    let draft_mapping_generator = DraftMappingGenerator::new(mapping_parameters.error_threshold);
    let mapping_generator: MappingGenerator<R> = MappingGenerator::new(mapping_parameters);
    let mapping_processor: MappingProcessor<R> = MappingProcessor::new(
        mapping_parameters.multi_mapping_allocation_distance,
        mapping_parameters.multi_mapping_allocation_seed,
    );
    let mut mapping_writer: MappingWriter<R> =
        match MappingWriter::new(mapping_parameters, barcode_length) {
            Ok(writer) => writer,
            Err(e) => exit_with_message(&format!("Cannot open output: {}", e)),
        };
    mapping_writer.output_header(num_reference_sequences, &reference);

    let cache = MmCache::new(mapping_parameters.cache_size);
    log::info!("Cache size: {}", mapping_parameters.cache_size);

    let summary = mapping_parameters
        .summary_metadata_file_path
        .as_ref()
        .map(|_| SummaryMetadata::new());
    let output_num_cache_slots_info =
        mapping_parameters.output_num_uniq_cache_slots && summary.is_some();
    let barcode_peak_map = output_num_cache_slots_info.then(|| {
        BarcodePeakMap::new(mapping_parameters.k_for_minhash, mapping_parameters.cache_size)
    });

    let mut mappings_on_diff_ref_seqs: Vec<Vec<R>> = (0..num_reference_sequences)
        .map(|_| Vec::new())
        .collect();
    let mut temp_mapping_file_handles: Vec<TempMappingFileHandle> = Vec::new();
    let mut num_mappings_in_mem: u64 = 0;
    let mut max_mappings_in_mem =
        max_num_mappings_in_mem::<R>(mapping_parameters.mapping_output_format);

    // Loader thread: fills batches ahead of the workers; batch shells are
    // recycled through the `empty` channel so vectors keep their capacity.
    let (filled_sender, filled_receiver) = bounded::<PairBatch>(1);
    let (empty_sender, empty_receiver) = bounded::<PairBatch>(2);
    let batch_size = mapping_parameters.read_batch_size;
    for _ in 0..2 {
        empty_sender
            .send(PairBatch {
                reads1: SequenceBatch::new(batch_size, read1_range),
                reads2: SequenceBatch::new(batch_size, read2_range),
                barcodes: (!mapping_parameters.is_bulk_data)
                    .then(|| SequenceBatch::new(batch_size, barcode_range)),
                num_loaded: 0,
            })
            .unwrap();
    }

    let loader_parameters = mapping_parameters.clone();
    let loader = std::thread::spawn(move || {
        let mut loading1 = SequenceBatch::new(batch_size, read1_range);
        let mut loading2 = SequenceBatch::new(batch_size, read2_range);
        let mut loading_barcodes = (!loader_parameters.is_bulk_data)
            .then(|| SequenceBatch::new(batch_size, barcode_range));
        let mut dup_detector = loader_parameters
            .dedupe_identical_pairs
            .then(DupDetector::new);
        let parallel_parsing =
            loader_parameters.num_threads >= 3 && dup_detector.is_none();
        for file_index in 0..loader_parameters.read_file1_paths.len() {
            loading1.initialize_loading(&loader_parameters.read_file1_paths[file_index]);
            loading2.initialize_loading(&loader_parameters.read_file2_paths[file_index]);
            if let Some(barcodes) = loading_barcodes.as_mut() {
                barcodes.initialize_loading(&loader_parameters.barcode_file_paths[file_index]);
            }
            loop {
                let load_start_time = utils::realtime();
                let num_loaded = load_pair_batch(
                    &mut loading1,
                    &mut loading2,
                    loading_barcodes.as_mut(),
                    batch_size,
                    parallel_parsing,
                    dup_detector.as_mut(),
                );
                if num_loaded == 0 {
                    log::info!("No more reads in {}", loader_parameters.read_file1_paths[file_index].display());
                    break;
                }
                log::info!(
                    "Loaded {} pairs in {:.2}s",
                    num_loaded,
                    utils::realtime() - load_start_time
                );
                let mut batch = match empty_receiver.recv() {
                    Ok(batch) => batch,
                    Err(_) => return,
                };
                loading1.swap_sequence_batch(&mut batch.reads1);
                loading2.swap_sequence_batch(&mut batch.reads2);
                if let (Some(loading), Some(shipped)) =
                    (loading_barcodes.as_mut(), batch.barcodes.as_mut())
                {
                    loading.swap_sequence_batch(shipped);
                }
                batch.num_loaded = num_loaded;
                if filled_sender.send(batch).is_err() {
                    return;
                }
            }
            loading1.finalize_loading();
            loading2.finalize_loading();
            if let Some(barcodes) = loading_barcodes.as_mut() {
                barcodes.finalize_loading();
            }
        }
    });

    let mut stats = MappingStats::default();
    let real_start_mapping_time = utils::realtime();

    while let Ok(mut batch) = filled_receiver.recv() {
        let real_batch_start_time = utils::realtime();
        let num_loaded = batch.num_loaded as usize;
        stats.num_reads += 2 * num_loaded as u64;

        // Whole-batch reverse-complement preparation, then adapter trimming,
        // so the per-read loop can borrow the batches immutably.
        batch.reads1.prepare_negative_sequences(num_loaded);
        batch.reads2.prepare_negative_sequences(num_loaded);
        if mapping_parameters.trim_adapters {
            let overlaps: Vec<Option<usize>> = (0..num_loaded)
                .into_par_iter()
                .map(|pair_index| {
                    sequence_batch::find_adapter_overlap(
                        batch.reads1.get_sequence_at(pair_index),
                        batch.reads2.get_negative_sequence_at(pair_index),
                        mapping_parameters.min_read_length,
                    )
                })
                .collect();
            for (pair_index, overlap) in overlaps.iter().enumerate() {
                if let Some(overlap_length) = overlap {
                    batch.reads1.trim_sequence_at(pair_index, *overlap_length);
                    batch.reads2.trim_sequence_at(pair_index, *overlap_length);
                }
            }
        }

        let history_update_threshold = cache.get_update_threshold(
            batch.num_loaded,
            stats.num_reads,
            true,
            mapping_parameters.cache_update_param,
        ) as usize;

        let reads1 = &batch.reads1;
        let reads2 = &batch.reads2;
        let barcodes = batch.barcodes.as_ref();
        let reference_ref = &reference;
        let index_ref = &index;
        let cache_ref = &cache;
        let corrector_ref = &barcode_corrector;
        let peak_map_ref = barcode_peak_map.as_ref();
        let rid_ranks_ref = custom_rid_ranks.as_ref();
        let summary_enabled = summary.is_some();

        let worker_states: Vec<PairedWorkerState<R>> = (0..num_loaded)
            .into_par_iter()
            .with_min_len(PAIRED_END_GRAIN)
            .fold(
                || PairedWorkerState::new(num_reference_sequences as usize),
                |mut state, pair_index| {
                    map_one_pair(
                        pair_index,
                        reads1,
                        reads2,
                        barcodes,
                        reference_ref,
                        index_ref,
                        cache_ref,
                        corrector_ref,
                        peak_map_ref,
                        rid_ranks_ref,
                        &minimizer_generator,
                        &candidate_processor,
                        &draft_mapping_generator,
                        &mapping_generator,
                        mapping_parameters,
                        history_update_threshold,
                        summary_enabled,
                        &mut state,
                    );
                    state
                },
            )
            .collect();

        // Barrier reached: merge worker partials, update the cache over the
        // recorded history prefix, then move buckets into the shared
        // container (and spill when over budget).
        let mut bucket_sets: Vec<Vec<Vec<R>>> = Vec::with_capacity(worker_states.len());
        let mut histories: Vec<MmHistory> = Vec::new();
        let mut summary_events: Vec<SummaryEvent> = Vec::new();
        for state in worker_states {
            stats.merge(&state.stats);
            bucket_sets.push(state.buckets);
            histories.extend(state.histories);
            summary_events.extend(state.summary_events);
        }

        histories.par_iter().for_each(|history| {
            cache_ref.update(
                &history.minimizers,
                &history.positive_candidates,
                &history.negative_candidates,
                history.repetitive_seed_length,
                history.read_length,
            );
        });

        if let Some(summary) = &summary {
            if mapping_parameters.is_bulk_data {
                summary.update(0, SummaryField::Total, num_loaded as u64);
                let cache_hits = summary_events
                    .iter()
                    .filter(|event| event.mapped_with_cache_hit)
                    .count() as u64;
                summary.update(0, SummaryField::CacheHit, cache_hits);
            } else {
                for event in &summary_events {
                    if event.whitelisted {
                        summary.update(event.barcode_seed, SummaryField::Total, 1);
                    }
                    if event.mapped_with_cache_hit {
                        summary.update(event.barcode_seed, SummaryField::CacheHit, 1);
                    }
                }
            }
        }

        num_mappings_in_mem += mapping_processor.move_mappings_in_buffers_to_mapping_container(
            num_reference_sequences,
            &mut bucket_sets,
            &mut mappings_on_diff_ref_seqs,
        );
        if mapping_parameters.low_memory_mode && num_mappings_in_mem > max_mappings_in_mem {
            mapping_processor.parallel_sort_output_mappings(&mut mappings_on_diff_ref_seqs);
            if let Err(e) = mapping_writer.output_temp_mappings(
                num_reference_sequences,
                &mut mappings_on_diff_ref_seqs,
                &mut temp_mapping_file_handles,
            ) {
                exit_with_message(&format!("Failed to spill mappings: {}", e));
            }
            maybe_grow_spill_budget(&temp_mapping_file_handles, &mut max_mappings_in_mem);
            num_mappings_in_mem = 0;
        }

        log::info!(
            "Mapped {} read pairs in {:.2}s",
            num_loaded,
            utils::realtime() - real_batch_start_time
        );
        let _ = empty_sender.send(batch);
    }
    drop(empty_sender);
    if loader.join().is_err() {
        exit_with_message("Read loader thread panicked");
    }

    log::info!(
        "Mapped all reads in {:.2}s",
        utils::realtime() - real_start_mapping_time
    );
    stats.output_mapping_statistics();
    if !mapping_parameters.is_bulk_data {
        stats.output_barcode_statistics();
    }
    cache.print_stats();
    index.destroy();

    finalize_mappings(
        mapping_parameters,
        num_reference_sequences,
        &reference,
        &mapping_processor,
        &mut mapping_writer,
        &mut mappings_on_diff_ref_seqs,
        &mut temp_mapping_file_handles,
        num_mappings_in_mem,
    );

    if let (Some(summary), Some(path)) = (
        &summary,
        mapping_parameters.summary_metadata_file_path.as_ref(),
    ) {
        if let Some(peak_map) = &barcode_peak_map {
            peak_map.fold_into(summary);
        }
        if let Err(e) = summary.output(path, output_num_cache_slots_info) {
            log::error!("Failed to write summary metadata: {}", e);
        }
    }

    log::info!(
        "Total time: {:.2}s (CPU {:.2}s)",
        utils::realtime() - real_start_time,
        utils::cputime()
    );
}

/// Per-pair mapping kernel: barcode gate, sketch, cache or candidate
/// generation, mate supplementation, reduction, verification, selection.
#[allow(clippy::too_many_arguments)]
fn map_one_pair<R: PairedEndRecord>(
    pair_index: usize,
    reads1: &SequenceBatch,
    reads2: &SequenceBatch,
    barcodes: Option<&SequenceBatch>,
    reference: &SequenceBatch,
    index: &Index,
    cache: &MmCache,
    barcode_corrector: &BarcodeCorrector,
    barcode_peak_map: Option<&BarcodePeakMap>,
    custom_rid_ranks: Option<&Vec<usize>>,
    minimizer_generator: &MinimizerGenerator,
    candidate_processor: &CandidateProcessor,
    draft_mapping_generator: &DraftMappingGenerator,
    mapping_generator: &MappingGenerator<R>,
    mapping_parameters: &MappingParameters,
    history_update_threshold: usize,
    summary_enabled: bool,
    state: &mut PairedWorkerState<R>,
) {
    // Barcode gate.
    let mut barcode_seed = 0u64;
    let mut whitelisted = true;
    if let Some(barcode_batch) = barcodes {
        let raw_seed = barcode_batch.generate_seed_from_sequence_at(
            pair_index,
            0,
            barcode_batch.get_sequence_length_at(pair_index) as usize,
        );
        if barcode_corrector.is_whitelist_loaded() {
            match barcode_corrector.correct_barcode_at(
                pair_index,
                barcode_batch,
                &mut state.stats.num_barcode_in_whitelist,
                &mut state.stats.num_corrected_barcode,
            ) {
                Some(corrected_seed) => barcode_seed = corrected_seed,
                None => {
                    barcode_seed = raw_seed;
                    whitelisted = false;
                }
            }
        } else {
            barcode_seed = raw_seed;
        }
    }
    let mut summary_event = SummaryEvent {
        barcode_seed,
        whitelisted,
        mapped_with_cache_hit: false,
    };
    if !(whitelisted || mapping_parameters.output_mappings_not_in_whitelist) {
        if summary_enabled {
            state.summary_events.push(summary_event);
        }
        return;
    }

    if (reads1.get_sequence_length_at(pair_index) as usize) < mapping_parameters.min_read_length
        || (reads2.get_sequence_length_at(pair_index) as usize)
            < mapping_parameters.min_read_length
    {
        state.stats.num_short_reads += 2;
        if summary_enabled {
            state.summary_events.push(summary_event);
        }
        return;
    }

    let paired_metadata = &mut state.paired_metadata;
    paired_metadata
        .prepare_for_mapping_next_read_pair(mapping_parameters.max_seed_frequencies[0]);

    let read1_length = reads1.get_sequence_length_at(pair_index);
    let read2_length = reads2.get_sequence_length_at(pair_index);
    minimizer_generator.generate_minimizers(
        reads1.get_sequence_at(pair_index),
        &mut paired_metadata.mapping_metadata1.minimizers,
    );
    minimizer_generator.generate_minimizers(
        reads2.get_sequence_at(pair_index),
        &mut paired_metadata.mapping_metadata2.minimizers,
    );
    if !paired_metadata.both_ends_have_minimizers() {
        if summary_enabled {
            state.summary_events.push(summary_event);
        }
        return;
    }

    let mut cache_miss = 0;
    let cache_slot1 = cache.query(&mut paired_metadata.mapping_metadata1, read1_length);
    if cache_slot1.is_none() {
        candidate_processor.generate_candidates(
            mapping_parameters.error_threshold,
            index,
            &mut paired_metadata.mapping_metadata1,
        );
        cache_miss += 1;
    }
    let cache_slot2 = cache.query(&mut paired_metadata.mapping_metadata2, read2_length);
    if cache_slot2.is_none() {
        candidate_processor.generate_candidates(
            mapping_parameters.error_threshold,
            index,
            &mut paired_metadata.mapping_metadata2,
        );
        cache_miss += 1;
    }

    if let Some(peak_map) = barcode_peak_map {
        peak_map.add_slots(barcode_seed, cache_slot1, cache_slot2);
    }

    if pair_index < history_update_threshold {
        for (metadata, read_length) in [
            (&paired_metadata.mapping_metadata1, read1_length),
            (&paired_metadata.mapping_metadata2, read2_length),
        ] {
            state.histories.push(MmHistory {
                minimizers: metadata.minimizers.clone(),
                positive_candidates: metadata.positive_candidates.clone(),
                negative_candidates: metadata.negative_candidates.clone(),
                repetitive_seed_length: metadata.repetitive_seed_length,
                read_length,
            });
        }
    }

    // Mate supplementation, then the paired-end candidate filter.
    let supplement_candidate_result = candidate_processor.supplement_candidates(
        mapping_parameters.error_threshold,
        2 * mapping_parameters.max_insert_size,
        index,
        paired_metadata,
    );
    let mut num_candidates1 = paired_metadata.mapping_metadata1.get_num_candidates();
    let mut num_candidates2 = paired_metadata.mapping_metadata2.get_num_candidates();

    if num_candidates1 > 0 && num_candidates2 > 0 {
        paired_metadata.move_candidates_to_buffer();
        candidate_processor
            .reduce_candidates_for_paired_end_read(mapping_parameters.max_insert_size, paired_metadata);
        num_candidates1 = paired_metadata.mapping_metadata1.get_num_candidates();
        num_candidates2 = paired_metadata.mapping_metadata2.get_num_candidates();
    }

    if num_candidates1 > 0 && num_candidates2 > 0 {
        state.stats.num_candidates += (num_candidates1 + num_candidates2) as u64;

        if let Some(rid_ranks) = custom_rid_ranks {
            rerank_candidates_rid(
                &mut paired_metadata.mapping_metadata1.positive_candidates,
                rid_ranks,
            );
            rerank_candidates_rid(
                &mut paired_metadata.mapping_metadata1.negative_candidates,
                rid_ranks,
            );
            rerank_candidates_rid(
                &mut paired_metadata.mapping_metadata2.positive_candidates,
                rid_ranks,
            );
            rerank_candidates_rid(
                &mut paired_metadata.mapping_metadata2.negative_candidates,
                rid_ranks,
            );
        }

        draft_mapping_generator.generate_draft_mappings(
            reads1,
            pair_index,
            reference,
            &mut paired_metadata.mapping_metadata1,
        );
        draft_mapping_generator.generate_draft_mappings(
            reads2,
            pair_index,
            reference,
            &mut paired_metadata.mapping_metadata2,
        );

        if paired_metadata.mapping_metadata1.get_num_draft_mappings() > 0
            && paired_metadata.mapping_metadata2.get_num_draft_mappings() > 0
        {
            paired_metadata.sort_mappings_by_positions();
            let force_mapq = if supplement_candidate_result != 0 { 0 } else { -1 };
            mapping_generator.generate_best_mappings_for_paired_end_read(
                pair_index,
                reads1,
                reads2,
                barcode_seed,
                reference,
                force_mapq,
                paired_metadata,
                &mut state.buckets,
            );
            let num_best_mappings = paired_metadata.get_num_best_mappings();
            if num_best_mappings > 0
                && num_best_mappings <= mapping_parameters.drop_repetitive_reads
            {
                state.stats.num_mappings += 2 * num_best_mappings
                    .min(mapping_parameters.max_num_best_mappings)
                    as u64;
                state.stats.num_mapped_reads += 2;
                if num_best_mappings == 1 {
                    state.stats.num_uniquely_mapped_reads += 2;
                }
                summary_event.mapped_with_cache_hit = cache_miss < 2;
            }
        }
    }
    if summary_enabled {
        state.summary_events.push(summary_event);
    }
}

/// Fill one batch of read pairs (and barcodes). Serial loading checks
/// stream synchronisation per record; parallel loading fills each stream on
/// its own thread and cross-checks the counts.
fn load_pair_batch(
    reads1: &mut SequenceBatch,
    reads2: &mut SequenceBatch,
    mut barcodes: Option<&mut SequenceBatch>,
    batch_size: usize,
    parallel_parsing: bool,
    mut dup_detector: Option<&mut DupDetector>,
) -> u32 {
    reads1.begin_batch();
    reads2.begin_batch();
    if let Some(barcodes) = barcodes.as_mut() {
        barcodes.begin_batch();
    }
    if parallel_parsing {
        let (count1, count2, barcode_count) = std::thread::scope(|scope| {
            let handle1 = scope.spawn(|| fill_batch(reads1, batch_size));
            let handle2 = scope.spawn(|| fill_batch(reads2, batch_size));
            let barcode_count = barcodes
                .as_mut()
                .map(|barcodes| fill_batch(barcodes, batch_size));
            (handle1.join().unwrap(), handle2.join().unwrap(), barcode_count)
        });
        if count1 != count2 || barcode_count.is_some_and(|count| count != count1) {
            exit_with_message("Numbers of reads and barcodes don't match!");
        }
        count1
    } else {
        let mut num_loaded = 0u32;
        while (num_loaded as usize) < batch_size {
            let slot = num_loaded as usize;
            let more1 = reads1.load_one_sequence_and_save_at(slot);
            let more2 = reads2.load_one_sequence_and_save_at(slot);
            let more_barcode = match barcodes.as_mut() {
                Some(barcodes) => barcodes.load_one_sequence_and_save_at(slot),
                None => more2,
            };
            if more1 && more2 && more_barcode {
                if let Some(detector) = dup_detector.as_mut() {
                    if let Some(barcode_batch) = barcodes.as_deref() {
                        if detector.paired_end_read_with_barcode_is_duplicate(
                            slot,
                            barcode_batch,
                            reads1,
                            reads2,
                        ) {
                            continue;
                        }
                    }
                }
                num_loaded += 1;
            } else if !more1 && !more2 && !more_barcode {
                break;
            } else {
                exit_with_message("Numbers of reads and barcodes don't match!");
            }
        }
        num_loaded
    }
}

fn fill_batch(batch: &mut SequenceBatch, batch_size: usize) -> u32 {
    let mut num_loaded = 0u32;
    while (num_loaded as usize) < batch_size {
        if !batch.load_one_sequence_and_save_at(num_loaded as usize) {
            break;
        }
        num_loaded += 1;
    }
    num_loaded
}

// ---------------------------------------------------------------------------
// Single-end driver
// ---------------------------------------------------------------------------

struct SingleWorkerState<R> {
    metadata: MappingMetadata,
    buckets: Vec<Vec<R>>,
    stats: MappingStats,
    histories: Vec<MmHistory>,
    summary_events: Vec<SummaryEvent>,
}

impl<R> SingleWorkerState<R> {
    fn new(num_reference_sequences: usize) -> Self {
        SingleWorkerState {
            metadata: MappingMetadata::default(),
            buckets: (0..num_reference_sequences).map(|_| Vec::new()).collect(),
            stats: MappingStats::default(),
            histories: Vec::new(),
            summary_events: Vec::new(),
        }
    }
}

pub fn map_single_end_reads<R: SingleEndRecord>(mapping_parameters: &MappingParameters) {
    let real_start_time = utils::realtime();
    let (read1_range, _read2_range, barcode_range) = effective_ranges(mapping_parameters);

    let mut reference = SequenceBatch::new(1, SequenceEffectiveRange::default());
    let num_reference_sequences =
        reference.load_all_sequences(&mapping_parameters.reference_file_path);
    log::info!("Loaded {} reference sequences", num_reference_sequences);

    let custom_rid_ranks = mapping_parameters
        .custom_rid_order_file_path
        .as_ref()
        .map(|path| {
            let rid_ranks =
                generate_custom_rid_ranks(path, num_reference_sequences, &reference);
            reference.reorder_sequences(&rid_ranks);
            rid_ranks
        });

    let mut index = Index::new(&mapping_parameters.index_file_path);
    index.load();
    let kmer_size = index.get_kmer_size();
    let window_size = index.get_window_size();

    let mut barcode_corrector = BarcodeCorrector::new(mapping_parameters);
    let mut barcode_length = 0u32;
    if !mapping_parameters.is_bulk_data {
        barcode_length = sample_input_barcodes_and_examine_length(
            &mapping_parameters.barcode_file_paths,
            barcode_range,
        );
        if let Some(whitelist_path) = &mapping_parameters.barcode_whitelist_file_path {
            barcode_corrector.load_barcode_whitelist(whitelist_path);
            if barcode_corrector.barcode_length() != barcode_length {
                exit_with_message("Barcode whitelist length does not match the barcode reads");
            }
            let mut sampling_batch = SequenceBatch::new(1, barcode_range);
            barcode_corrector.compute_barcode_abundance(
                &mut sampling_batch,
                &mapping_parameters.barcode_file_paths,
                INITIAL_NUM_SAMPLE_BARCODES,
                mapping_parameters.skip_barcode_check,
            );
        }
    }

    let minimizer_generator = MinimizerGenerator::new(kmer_size, window_size);
    let candidate_processor = CandidateProcessor::new(
        mapping_parameters.min_num_seeds_required_for_mapping,
        mapping_parameters.max_seed_frequencies,
    );
    let draft_mapping_generator = DraftMappingGenerator::new(mapping_parameters.error_threshold);
    let mapping_generator: MappingGenerator<R> = MappingGenerator::new(mapping_parameters);
    let mapping_processor: MappingProcessor<R> = MappingProcessor::new(
        mapping_parameters.multi_mapping_allocation_distance,
        mapping_parameters.multi_mapping_allocation_seed,
    );
    let mut mapping_writer: MappingWriter<R> =
        match MappingWriter::new(mapping_parameters, barcode_length) {
            Ok(writer) => writer,
            Err(e) => exit_with_message(&format!("Cannot open output: {}", e)),
        };
    mapping_writer.output_header(num_reference_sequences, &reference);

    let cache = MmCache::new(mapping_parameters.cache_size);
    let summary = mapping_parameters
        .summary_metadata_file_path
        .as_ref()
        .map(|_| SummaryMetadata::new());

    let mut mappings_on_diff_ref_seqs: Vec<Vec<R>> = (0..num_reference_sequences)
        .map(|_| Vec::new())
        .collect();
    let mut temp_mapping_file_handles: Vec<TempMappingFileHandle> = Vec::new();
    let mut num_mappings_in_mem: u64 = 0;
    let mut max_mappings_in_mem =
        max_num_mappings_in_mem::<R>(mapping_parameters.mapping_output_format);

    let (filled_sender, filled_receiver) = bounded::<SingleBatch>(1);
    let (empty_sender, empty_receiver) = bounded::<SingleBatch>(2);
    let batch_size = mapping_parameters.read_batch_size;
    for _ in 0..2 {
        empty_sender
            .send(SingleBatch {
                reads: SequenceBatch::new(batch_size, read1_range),
                barcodes: (!mapping_parameters.is_bulk_data)
                    .then(|| SequenceBatch::new(batch_size, barcode_range)),
                num_loaded: 0,
            })
            .unwrap();
    }

    let loader_parameters = mapping_parameters.clone();
    let loader = std::thread::spawn(move || {
        let mut loading = SequenceBatch::new(batch_size, read1_range);
        let mut loading_barcodes = (!loader_parameters.is_bulk_data)
            .then(|| SequenceBatch::new(batch_size, barcode_range));
        let parallel_parsing = loader_parameters.num_threads >= 3;
        for file_index in 0..loader_parameters.read_file1_paths.len() {
            loading.initialize_loading(&loader_parameters.read_file1_paths[file_index]);
            if let Some(barcodes) = loading_barcodes.as_mut() {
                barcodes.initialize_loading(&loader_parameters.barcode_file_paths[file_index]);
            }
            loop {
                let load_start_time = utils::realtime();
                let num_loaded = load_single_batch(
                    &mut loading,
                    loading_barcodes.as_mut(),
                    batch_size,
                    parallel_parsing,
                );
                if num_loaded == 0 {
                    break;
                }
                log::info!(
                    "Loaded {} reads in {:.2}s",
                    num_loaded,
                    utils::realtime() - load_start_time
                );
                let mut batch = match empty_receiver.recv() {
                    Ok(batch) => batch,
                    Err(_) => return,
                };
                loading.swap_sequence_batch(&mut batch.reads);
                if let (Some(loading), Some(shipped)) =
                    (loading_barcodes.as_mut(), batch.barcodes.as_mut())
                {
                    loading.swap_sequence_batch(shipped);
                }
                batch.num_loaded = num_loaded;
                if filled_sender.send(batch).is_err() {
                    return;
                }
            }
            loading.finalize_loading();
            if let Some(barcodes) = loading_barcodes.as_mut() {
                barcodes.finalize_loading();
            }
        }
    });

    let mut stats = MappingStats::default();
    let real_start_mapping_time = utils::realtime();

    while let Ok(mut batch) = filled_receiver.recv() {
        let real_batch_start_time = utils::realtime();
        let num_loaded = batch.num_loaded as usize;
        stats.num_reads += num_loaded as u64;
        batch.reads.prepare_negative_sequences(num_loaded);

        let history_update_threshold = cache.get_update_threshold(
            batch.num_loaded,
            stats.num_reads,
            false,
            mapping_parameters.cache_update_param,
        ) as usize;

        let reads = &batch.reads;
        let barcodes = batch.barcodes.as_ref();
        let reference_ref = &reference;
        let index_ref = &index;
        let cache_ref = &cache;
        let corrector_ref = &barcode_corrector;
        let rid_ranks_ref = custom_rid_ranks.as_ref();
        let summary_enabled = summary.is_some();

        let worker_states: Vec<SingleWorkerState<R>> = (0..num_loaded)
            .into_par_iter()
            .with_min_len(SINGLE_END_GRAIN)
            .fold(
                || SingleWorkerState::new(num_reference_sequences as usize),
                |mut state, read_index| {
                    map_one_read(
                        read_index,
                        reads,
                        barcodes,
                        reference_ref,
                        index_ref,
                        cache_ref,
                        corrector_ref,
                        rid_ranks_ref,
                        &minimizer_generator,
                        &candidate_processor,
                        &draft_mapping_generator,
                        &mapping_generator,
                        mapping_parameters,
                        history_update_threshold,
                        summary_enabled,
                        &mut state,
                    );
                    state
                },
            )
            .collect();

        let mut bucket_sets: Vec<Vec<Vec<R>>> = Vec::with_capacity(worker_states.len());
        let mut histories: Vec<MmHistory> = Vec::new();
        let mut summary_events: Vec<SummaryEvent> = Vec::new();
        for state in worker_states {
            stats.merge(&state.stats);
            bucket_sets.push(state.buckets);
            histories.extend(state.histories);
            summary_events.extend(state.summary_events);
        }

        histories.par_iter().for_each(|history| {
            cache_ref.update(
                &history.minimizers,
                &history.positive_candidates,
                &history.negative_candidates,
                history.repetitive_seed_length,
                history.read_length,
            );
        });

        if let Some(summary) = &summary {
            if mapping_parameters.is_bulk_data {
                summary.update(0, SummaryField::Total, num_loaded as u64);
            } else {
                let mut nonwhitelisted = 0u64;
                for event in &summary_events {
                    if event.whitelisted {
                        summary.update(event.barcode_seed, SummaryField::Total, 1);
                    } else {
                        nonwhitelisted += 1;
                    }
                }
                if nonwhitelisted > 0 {
                    summary.update(0, SummaryField::Total, nonwhitelisted);
                }
            }
        }

        num_mappings_in_mem += mapping_processor.move_mappings_in_buffers_to_mapping_container(
            num_reference_sequences,
            &mut bucket_sets,
            &mut mappings_on_diff_ref_seqs,
        );
        if mapping_parameters.low_memory_mode && num_mappings_in_mem > max_mappings_in_mem {
            mapping_processor.parallel_sort_output_mappings(&mut mappings_on_diff_ref_seqs);
            if let Err(e) = mapping_writer.output_temp_mappings(
                num_reference_sequences,
                &mut mappings_on_diff_ref_seqs,
                &mut temp_mapping_file_handles,
            ) {
                exit_with_message(&format!("Failed to spill mappings: {}", e));
            }
            maybe_grow_spill_budget(&temp_mapping_file_handles, &mut max_mappings_in_mem);
            num_mappings_in_mem = 0;
        }

        log::info!(
            "Mapped {} reads in {:.2}s",
            num_loaded,
            utils::realtime() - real_batch_start_time
        );
        let _ = empty_sender.send(batch);
    }
    drop(empty_sender);
    if loader.join().is_err() {
        exit_with_message("Read loader thread panicked");
    }

    log::info!(
        "Mapped all reads in {:.2}s",
        utils::realtime() - real_start_mapping_time
    );
    stats.output_mapping_statistics();
    if !mapping_parameters.is_bulk_data {
        stats.output_barcode_statistics();
    }
    cache.print_stats();
    index.destroy();

    finalize_mappings(
        mapping_parameters,
        num_reference_sequences,
        &reference,
        &mapping_processor,
        &mut mapping_writer,
        &mut mappings_on_diff_ref_seqs,
        &mut temp_mapping_file_handles,
        num_mappings_in_mem,
    );

    if let (Some(summary), Some(path)) = (
        &summary,
        mapping_parameters.summary_metadata_file_path.as_ref(),
    ) {
        if let Err(e) = summary.output(path, false) {
            log::error!("Failed to write summary metadata: {}", e);
        }
    }

    log::info!(
        "Total time: {:.2}s (CPU {:.2}s)",
        utils::realtime() - real_start_time,
        utils::cputime()
    );
}

#[allow(clippy::too_many_arguments)]
fn map_one_read<R: SingleEndRecord>(
    read_index: usize,
    reads: &SequenceBatch,
    barcodes: Option<&SequenceBatch>,
    reference: &SequenceBatch,
    index: &Index,
    cache: &MmCache,
    barcode_corrector: &BarcodeCorrector,
    custom_rid_ranks: Option<&Vec<usize>>,
    minimizer_generator: &MinimizerGenerator,
    candidate_processor: &CandidateProcessor,
    draft_mapping_generator: &DraftMappingGenerator,
    mapping_generator: &MappingGenerator<R>,
    mapping_parameters: &MappingParameters,
    history_update_threshold: usize,
    summary_enabled: bool,
    state: &mut SingleWorkerState<R>,
) {
    let mut barcode_seed = 0u64;
    let mut whitelisted = true;
    if let Some(barcode_batch) = barcodes {
        let raw_seed = barcode_batch.generate_seed_from_sequence_at(
            read_index,
            0,
            barcode_batch.get_sequence_length_at(read_index) as usize,
        );
        if barcode_corrector.is_whitelist_loaded() {
            match barcode_corrector.correct_barcode_at(
                read_index,
                barcode_batch,
                &mut state.stats.num_barcode_in_whitelist,
                &mut state.stats.num_corrected_barcode,
            ) {
                Some(corrected_seed) => barcode_seed = corrected_seed,
                None => {
                    barcode_seed = raw_seed;
                    whitelisted = false;
                }
            }
        } else {
            barcode_seed = raw_seed;
        }
    }
    let summary_event = SummaryEvent {
        barcode_seed,
        whitelisted,
        mapped_with_cache_hit: false,
    };
    if summary_enabled {
        state.summary_events.push(summary_event);
    }
    if !(whitelisted || mapping_parameters.output_mappings_not_in_whitelist) {
        return;
    }

    let read_length = reads.get_sequence_length_at(read_index);
    if (read_length as usize) < mapping_parameters.min_read_length {
        state.stats.num_short_reads += 1;
        return;
    }

    let metadata = &mut state.metadata;
    metadata.prepare_for_mapping_next_read(mapping_parameters.max_seed_frequencies[0]);
    minimizer_generator.generate_minimizers(
        reads.get_sequence_at(read_index),
        &mut metadata.minimizers,
    );
    if metadata.minimizers.is_empty() {
        return;
    }

    if cache.query(metadata, read_length).is_none() {
        candidate_processor.generate_candidates(
            mapping_parameters.error_threshold,
            index,
            metadata,
        );
    }

    if read_index < history_update_threshold {
        state.histories.push(MmHistory {
            minimizers: metadata.minimizers.clone(),
            positive_candidates: metadata.positive_candidates.clone(),
            negative_candidates: metadata.negative_candidates.clone(),
            repetitive_seed_length: metadata.repetitive_seed_length,
            read_length,
        });
    }

    if let Some(rid_ranks) = custom_rid_ranks {
        rerank_candidates_rid(&mut metadata.positive_candidates, rid_ranks);
        rerank_candidates_rid(&mut metadata.negative_candidates, rid_ranks);
    }

    let num_candidates = metadata.get_num_candidates();
    if num_candidates == 0 {
        return;
    }
    state.stats.num_candidates += num_candidates as u64;

    draft_mapping_generator.generate_draft_mappings(reads, read_index, reference, metadata);
    if metadata.get_num_draft_mappings() == 0 {
        return;
    }

    mapping_generator.generate_best_mappings_for_single_end_read(
        reads,
        read_index,
        reference,
        barcode_seed,
        metadata,
        &mut state.buckets,
    );
    if metadata.num_best_mappings > 0
        && metadata.num_best_mappings <= mapping_parameters.drop_repetitive_reads
    {
        state.stats.num_mappings += metadata
            .num_best_mappings
            .min(mapping_parameters.max_num_best_mappings) as u64;
        state.stats.num_mapped_reads += 1;
        if metadata.num_best_mappings == 1 {
            state.stats.num_uniquely_mapped_reads += 1;
        }
    }
}

fn load_single_batch(
    reads: &mut SequenceBatch,
    mut barcodes: Option<&mut SequenceBatch>,
    batch_size: usize,
    parallel_parsing: bool,
) -> u32 {
    reads.begin_batch();
    if let Some(barcodes) = barcodes.as_mut() {
        barcodes.begin_batch();
    }
    if parallel_parsing && barcodes.is_some() {
        let (read_count, barcode_count) = std::thread::scope(|scope| {
            let handle = scope.spawn(|| fill_batch(reads, batch_size));
            let barcode_count = fill_batch(barcodes.as_mut().unwrap(), batch_size);
            (handle.join().unwrap(), barcode_count)
        });
        if read_count != barcode_count {
            exit_with_message("Numbers of reads and barcodes don't match!");
        }
        read_count
    } else {
        let mut num_loaded = 0u32;
        while (num_loaded as usize) < batch_size {
            let slot = num_loaded as usize;
            let more_read = reads.load_one_sequence_and_save_at(slot);
            let more_barcode = match barcodes.as_mut() {
                Some(barcodes) => barcodes.load_one_sequence_and_save_at(slot),
                None => more_read,
            };
            if more_read && more_barcode {
                num_loaded += 1;
            } else if !more_read && !more_barcode {
                break;
            } else {
                exit_with_message("Numbers of reads and barcodes don't match!");
            }
        }
        num_loaded
    }
}

// ---------------------------------------------------------------------------
// Shared finalization
// ---------------------------------------------------------------------------

/// Post-processing hand-off after input exhaustion: either the low-memory
/// spill-and-merge path, or the in-memory Tn5/dedupe/allocation pipeline
/// followed by output.
#[allow(clippy::too_many_arguments)]
fn finalize_mappings<R: MappingRecord>(
    mapping_parameters: &MappingParameters,
    num_reference_sequences: u32,
    reference: &SequenceBatch,
    mapping_processor: &MappingProcessor<R>,
    mapping_writer: &mut MappingWriter<R>,
    mappings_on_diff_ref_seqs: &mut Vec<Vec<R>>,
    temp_mapping_file_handles: &mut Vec<TempMappingFileHandle>,
    num_mappings_in_mem: u64,
) {
    if mapping_parameters.low_memory_mode {
        if num_mappings_in_mem > 0 {
            mapping_processor.parallel_sort_output_mappings(mappings_on_diff_ref_seqs);
            if let Err(e) = mapping_writer.output_temp_mappings(
                num_reference_sequences,
                mappings_on_diff_ref_seqs,
                temp_mapping_file_handles,
            ) {
                exit_with_message(&format!("Failed to spill mappings: {}", e));
            }
        }
        if let Err(e) = mapping_writer.process_and_output_mappings_in_low_memory(
            num_reference_sequences,
            reference,
            temp_mapping_file_handles,
        ) {
            exit_with_message(&format!("Failed to merge spilled mappings: {}", e));
        }
        return;
    }

    if mapping_parameters.tn5_shift {
        mapping_processor.apply_tn5_shift_on_mappings(mappings_on_diff_ref_seqs);
    }

    if mapping_parameters.remove_pcr_duplicates {
        mapping_processor.remove_pcr_duplicates(mappings_on_diff_ref_seqs);
        log::info!("After removing PCR duplicates:");
        mapping_processor.output_mapping_statistics(mappings_on_diff_ref_seqs);
    } else {
        mapping_processor.parallel_sort_output_mappings(mappings_on_diff_ref_seqs);
    }

    if mapping_parameters.allocate_multi_mappings {
        mapping_processor.allocate_multi_mappings(mappings_on_diff_ref_seqs);
        log::info!("After allocating multi-mappings:");
        mapping_processor.output_mapping_statistics(mappings_on_diff_ref_seqs);
        mapping_processor.sort_output_mappings(mappings_on_diff_ref_seqs);
    }

    if let Err(e) =
        mapping_writer.output_mappings(num_reference_sequences, reference, mappings_on_diff_ref_seqs)
    {
        exit_with_message(&format!("Failed to write mappings: {}", e));
    }
    if let Err(e) = mapping_writer.finalize() {
        exit_with_message(&format!("Failed to flush output: {}", e));
    }
}
