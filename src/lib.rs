//! ChromAlign: a chromatin-assay short-read aligner.
//!
//! Reads are sketched with minimizers, candidate reference positions come
//! from an on-disk minimizer index, and candidates are verified with a
//! banded bit-parallel edit-distance kernel. Paired ends are reduced and
//! selected jointly; post-processing sorts, deduplicates, Tn5-shifts and
//! allocates multi-mappings before the records leave through the
//! BED/TagAlign/PAF writers.

pub mod barcode;
pub mod candidate_processor;
pub mod draft_mapping_generator;
pub mod dup_detector;
pub mod edit_distance;
pub mod index;
pub mod mapping_generator;
pub mod mapping_metadata;
pub mod mapping_parameters;
pub mod mapping_processor;
pub mod mapping_writer;
pub mod mappings;
pub mod minimizer;
pub mod mm_cache;
pub mod pipeline;
pub mod sequence_batch;
pub mod summary;
pub mod utils;
