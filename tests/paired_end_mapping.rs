// End-to-end paired-end mapping scenarios.

use std::path::{Path, PathBuf};

use chromalign::index::Index;
use chromalign::mapping_parameters::{MappingOutputFormat, MappingParameters};
use chromalign::mappings::PairedEndMappingWithoutBarcode;
use chromalign::pipeline;
use chromalign::sequence_batch::{SequenceBatch, SequenceEffectiveRange, complement_char};

fn random_sequence(seed: u64, length: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).max(1);
    let mut sequence = Vec::with_capacity(length);
    for _ in 0..length {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        sequence.push(b"ACGT"[(state % 4) as usize]);
    }
    sequence
}

fn reverse_complement(sequence: &[u8]) -> Vec<u8> {
    sequence.iter().rev().map(|&c| complement_char(c)).collect()
}

fn write_fasta(path: &Path, name: &str, sequence: &[u8]) {
    let mut fasta = format!(">{}\n", name).into_bytes();
    fasta.extend_from_slice(sequence);
    fasta.push(b'\n');
    std::fs::write(path, fasta).unwrap();
}

fn write_fastq(path: &Path, reads: &[(&str, &[u8])]) {
    let mut fastq = Vec::new();
    for (name, sequence) in reads {
        fastq.extend_from_slice(format!("@{}\n", name).as_bytes());
        fastq.extend_from_slice(sequence);
        fastq.extend_from_slice(b"\n+\n");
        fastq.extend_from_slice(&vec![b'I'; sequence.len()]);
        fastq.push(b'\n');
    }
    std::fs::write(path, fastq).unwrap();
}

fn build_index(reference_path: &Path, index_path: &Path) {
    let mut reference = SequenceBatch::new(1, SequenceEffectiveRange::default());
    reference.load_all_sequences(reference_path);
    let mut index = Index::new(index_path);
    index.construct(17, 5, &reference);
    index.save().unwrap();
}

fn paired_parameters(dir: &Path) -> MappingParameters {
    MappingParameters {
        reference_file_path: dir.join("ref.fa"),
        index_file_path: dir.join("ref.index"),
        read_file1_paths: vec![dir.join("reads_1.fq")],
        read_file2_paths: vec![dir.join("reads_2.fq")],
        mapping_output_file_path: dir.join("out.bed"),
        mapping_output_format: MappingOutputFormat::Bed,
        ..MappingParameters::default()
    }
}

fn bed_lines(path: &PathBuf) -> Vec<Vec<String>> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| line.split('\t').map(str::to_string).collect())
        .collect()
}

/// 1 kb reference, read1 at [0,100), read2 reverse-complemented at
/// [200,300): one F1R2 fragment spanning [0,300).
fn f1r2_fixture(dir: &Path) {
    let reference = random_sequence(42, 1000);
    write_fasta(&dir.join("ref.fa"), "chr1", &reference);
    write_fastq(&dir.join("reads_1.fq"), &[("pair0/1", &reference[0..100])]);
    write_fastq(
        &dir.join("reads_2.fq"),
        &[("pair0/2", &reverse_complement(&reference[200..300]))],
    );
    build_index(&dir.join("ref.fa"), &dir.join("ref.index"));
}

#[test]
fn test_paired_f1r2_fragment() {
    let dir = tempfile::tempdir().unwrap();
    f1r2_fixture(dir.path());
    let params = paired_parameters(dir.path());
    pipeline::map_paired_end_reads::<PairedEndMappingWithoutBarcode>(&params);

    let lines = bed_lines(&dir.path().join("out.bed"));
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0][0], "chr1");
    assert_eq!(lines[0][1], "0");
    assert_eq!(lines[0][2], "300");
    // Unique proper pair at maximum quality.
    assert_eq!(lines[0][4], "60");
}

#[test]
fn test_tn5_shift_moves_fragment_ends() {
    let dir = tempfile::tempdir().unwrap();
    f1r2_fixture(dir.path());
    let mut params = paired_parameters(dir.path());
    params.tn5_shift = true;
    pipeline::map_paired_end_reads::<PairedEndMappingWithoutBarcode>(&params);

    let lines = bed_lines(&dir.path().join("out.bed"));
    assert_eq!(lines.len(), 1);
    // +4 on the start, -9 on the length.
    assert_eq!(lines[0][1], "4");
    assert_eq!(lines[0][2], "295");
}

#[test]
fn test_pcr_duplicate_collapse() {
    let dir = tempfile::tempdir().unwrap();
    let reference = random_sequence(43, 1000);
    write_fasta(&dir.path().join("ref.fa"), "chr1", &reference);
    let read1 = &reference[0..100];
    let read2 = reverse_complement(&reference[200..300]);
    write_fastq(
        &dir.path().join("reads_1.fq"),
        &[("pair0/1", read1), ("pair1/1", read1)],
    );
    write_fastq(
        &dir.path().join("reads_2.fq"),
        &[("pair0/2", &read2), ("pair1/2", &read2)],
    );
    build_index(&dir.path().join("ref.fa"), &dir.path().join("ref.index"));

    // Without dedupe both copies survive.
    let params = paired_parameters(dir.path());
    pipeline::map_paired_end_reads::<PairedEndMappingWithoutBarcode>(&params);
    assert_eq!(bed_lines(&dir.path().join("out.bed")).len(), 2);

    // With dedupe the records collapse to one.
    let mut params = paired_parameters(dir.path());
    params.remove_pcr_duplicates = true;
    params.mapping_output_file_path = dir.path().join("deduped.bed");
    pipeline::map_paired_end_reads::<PairedEndMappingWithoutBarcode>(&params);
    assert_eq!(bed_lines(&dir.path().join("deduped.bed")).len(), 1);
}

#[test]
fn test_low_memory_mode_matches_in_memory_output() {
    let dir = tempfile::tempdir().unwrap();
    let reference = random_sequence(44, 1000);
    write_fasta(&dir.path().join("ref.fa"), "chr1", &reference);
    let read1 = &reference[0..100];
    let read2 = reverse_complement(&reference[200..300]);
    let other1 = &reference[400..500];
    let other2 = reverse_complement(&reference[600..700]);
    write_fastq(
        &dir.path().join("reads_1.fq"),
        &[("pair0/1", read1), ("pair1/1", read1), ("pair2/1", other1)],
    );
    write_fastq(
        &dir.path().join("reads_2.fq"),
        &[("pair0/2", &read2), ("pair1/2", &read2), ("pair2/2", &other2)],
    );
    build_index(&dir.path().join("ref.fa"), &dir.path().join("ref.index"));

    let mut params = paired_parameters(dir.path());
    params.remove_pcr_duplicates = true;
    pipeline::map_paired_end_reads::<PairedEndMappingWithoutBarcode>(&params);
    let in_memory = std::fs::read_to_string(dir.path().join("out.bed")).unwrap();

    let mut params = paired_parameters(dir.path());
    params.remove_pcr_duplicates = true;
    params.low_memory_mode = true;
    params.mapping_output_file_path = dir.path().join("lowmem.bed");
    pipeline::map_paired_end_reads::<PairedEndMappingWithoutBarcode>(&params);
    let low_memory = std::fs::read_to_string(dir.path().join("lowmem.bed")).unwrap();

    assert_eq!(in_memory, low_memory);
    assert_eq!(in_memory.lines().count(), 2);
}

#[test]
fn test_identical_output_across_runs() {
    // Same inputs and seeds give byte-identical output.
    let dir = tempfile::tempdir().unwrap();
    f1r2_fixture(dir.path());
    let params = paired_parameters(dir.path());
    pipeline::map_paired_end_reads::<PairedEndMappingWithoutBarcode>(&params);
    let first = std::fs::read_to_string(dir.path().join("out.bed")).unwrap();

    let mut params = paired_parameters(dir.path());
    params.mapping_output_file_path = dir.path().join("again.bed");
    pipeline::map_paired_end_reads::<PairedEndMappingWithoutBarcode>(&params);
    let second = std::fs::read_to_string(dir.path().join("again.bed")).unwrap();
    assert_eq!(first, second);
}
