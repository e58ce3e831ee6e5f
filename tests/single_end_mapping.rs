// End-to-end single-end mapping scenarios over the public pipeline API.

use std::path::{Path, PathBuf};

use chromalign::index::Index;
use chromalign::mapping_parameters::{MappingOutputFormat, MappingParameters};
use chromalign::mappings::MappingWithoutBarcode;
use chromalign::pipeline;
use chromalign::sequence_batch::{SequenceBatch, SequenceEffectiveRange};

/// Deterministic pseudo-random DNA so fixtures are reproducible and free of
/// accidental repeats or reverse-complement symmetry.
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

fn write_fasta(path: &Path, sequences: &[(&str, &[u8])]) {
    let mut fasta = Vec::new();
    for (name, sequence) in sequences {
        fasta.extend_from_slice(format!(">{}\n", name).as_bytes());
        fasta.extend_from_slice(sequence);
        fasta.push(b'\n');
    }
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

fn build_index(reference_path: &Path, index_path: &Path, kmer_size: usize, window_size: usize) {
    let mut reference = SequenceBatch::new(1, SequenceEffectiveRange::default());
    reference.load_all_sequences(reference_path);
    let mut index = Index::new(index_path);
    index.construct(kmer_size, window_size, &reference);
    index.save().unwrap();
}

fn base_parameters(dir: &Path) -> MappingParameters {
    MappingParameters {
        reference_file_path: dir.join("ref.fa"),
        index_file_path: dir.join("ref.index"),
        read_file1_paths: vec![dir.join("reads.fq")],
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

#[test]
fn test_exact_single_end_match() {
    let dir = tempfile::tempdir().unwrap();
    let reference = random_sequence(1, 32);
    write_fasta(&dir.path().join("ref.fa"), &[("chr1", &reference)]);
    write_fastq(&dir.path().join("reads.fq"), &[("read0", &reference)]);
    build_index(&dir.path().join("ref.fa"), &dir.path().join("ref.index"), 7, 2);

    let params = base_parameters(dir.path());
    pipeline::map_single_end_reads::<MappingWithoutBarcode>(&params);

    let lines = bed_lines(&dir.path().join("out.bed"));
    assert_eq!(lines.len(), 1);
    // One unique exact mapping covering the whole contig on the forward
    // strand at the maximum quality.
    assert_eq!(lines[0][0], "chr1");
    assert_eq!(lines[0][1], "0");
    assert_eq!(lines[0][2], "32");
    assert_eq!(lines[0][4], "60");
    assert_eq!(lines[0][5], "+");
}

#[test]
fn test_one_substitution_still_maps_with_high_mapq() {
    let dir = tempfile::tempdir().unwrap();
    let reference = random_sequence(2, 32);
    let mut read = reference.clone();
    read[9] = if read[9] == b'A' { b'C' } else { b'A' };
    write_fasta(&dir.path().join("ref.fa"), &[("chr1", &reference)]);
    write_fastq(&dir.path().join("reads.fq"), &[("read0", &read)]);
    build_index(&dir.path().join("ref.fa"), &dir.path().join("ref.index"), 7, 2);

    let params = base_parameters(dir.path());
    pipeline::map_single_end_reads::<MappingWithoutBarcode>(&params);

    let lines = bed_lines(&dir.path().join("out.bed"));
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0][1], "0");
    assert_eq!(lines[0][2], "32");
    let mapq: u8 = lines[0][4].parse().unwrap();
    assert!((40..60).contains(&mapq), "mapq {} out of range", mapq);
}

#[test]
fn test_two_way_tie_reports_both_placements_at_low_mapq() {
    // Two identical 100bp blocks at reference offsets 100 and 500; a read
    // equal to the block has two equally good placements.
    let dir = tempfile::tempdir().unwrap();
    let block = random_sequence(3, 100);
    let mut reference = random_sequence(4, 100);
    reference.extend_from_slice(&block);
    reference.extend_from_slice(&random_sequence(5, 300));
    reference.extend_from_slice(&block);
    reference.extend_from_slice(&random_sequence(6, 100));
    write_fasta(&dir.path().join("ref.fa"), &[("chr1", &reference)]);
    write_fastq(&dir.path().join("reads.fq"), &[("read0", &block)]);
    build_index(&dir.path().join("ref.fa"), &dir.path().join("ref.index"), 17, 5);

    let params = base_parameters(dir.path());
    pipeline::map_single_end_reads::<MappingWithoutBarcode>(&params);

    let lines = bed_lines(&dir.path().join("out.bed"));
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0][1], "100");
    assert_eq!(lines[1][1], "500");
    for line in &lines {
        assert_eq!(line[2].parse::<u32>().unwrap() - line[1].parse::<u32>().unwrap(), 100);
        assert_eq!(line[4], "3");
    }
}

#[test]
fn test_min_read_length_boundary() {
    // A read exactly at the minimum length passes; one base shorter is
    // dropped.
    let dir = tempfile::tempdir().unwrap();
    let reference = random_sequence(7, 300);
    let passing = reference[0..30].to_vec();
    let dropped = reference[100..129].to_vec();
    write_fasta(&dir.path().join("ref.fa"), &[("chr1", &reference)]);
    write_fastq(
        &dir.path().join("reads.fq"),
        &[("read0", &passing), ("read1", &dropped)],
    );
    build_index(&dir.path().join("ref.fa"), &dir.path().join("ref.index"), 7, 2);

    let params = base_parameters(dir.path());
    pipeline::map_single_end_reads::<MappingWithoutBarcode>(&params);

    let lines = bed_lines(&dir.path().join("out.bed"));
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0][1], "0");
    assert_eq!(lines[0][2], "30");
}

#[test]
fn test_multi_mapping_allocation_follows_unique_coverage() {
    // A multi-mapping read (two identical blocks) plus a unique read that
    // overlaps only the first block: allocation must place the multi-read
    // at the covered block and drop nothing else.
    let dir = tempfile::tempdir().unwrap();
    let block = random_sequence(8, 100);
    let mut reference = random_sequence(9, 100);
    reference.extend_from_slice(&block);
    reference.extend_from_slice(&random_sequence(10, 300));
    reference.extend_from_slice(&block);
    reference.extend_from_slice(&random_sequence(11, 100));
    let unique_read = reference[150..250].to_vec();
    write_fasta(&dir.path().join("ref.fa"), &[("chr1", &reference)]);
    write_fastq(
        &dir.path().join("reads.fq"),
        &[("multi", &block), ("unique", &unique_read)],
    );
    build_index(&dir.path().join("ref.fa"), &dir.path().join("ref.index"), 17, 5);

    let mut params = base_parameters(dir.path());
    params.allocate_multi_mappings = true;
    pipeline::map_single_end_reads::<MappingWithoutBarcode>(&params);

    let lines = bed_lines(&dir.path().join("out.bed"));
    let starts: Vec<u32> = lines.iter().map(|l| l[1].parse().unwrap()).collect();
    assert_eq!(lines.len(), 2);
    assert!(starts.contains(&100), "multi-read not allocated to covered block: {:?}", starts);
    assert!(starts.contains(&150));
    assert!(!starts.contains(&500));
}
