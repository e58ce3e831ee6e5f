// Mapping output: BED/BEDPE, TagAlign, and PAF emission, temp-file spilling
// for low-memory mode, and the final k-way merge that deduplicates and
// Tn5-shifts while streaming spilled runs to the output.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use crate::mapping_parameters::{MappingOutputFormat, MappingParameters};
use crate::mappings::MappingRecord;
use crate::sequence_batch::{SequenceBatch, uint8_to_char};
use crate::utils;

const TEMP_MAGIC: &[u8; 8] = b"CHRTMP01";

/// One spilled run: a file holding, per reference, a length-prefixed block
/// of sorted records.
pub struct TempMappingFileHandle {
    pub file_path: PathBuf,
    pub num_mappings_per_ref: Vec<u64>,
}

/// Streaming reader over one spilled run, one reference block at a time.
struct TempMappingFileReader<R: MappingRecord> {
    reader: BufReader<File>,
    remaining_in_block: u64,
    current: Option<R>,
}

impl<R: MappingRecord> TempMappingFileReader<R> {
    fn open(handle: &TempMappingFileHandle) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(&handle.file_path)?);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != TEMP_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "corrupt temp mapping file",
            ));
        }
        Ok(TempMappingFileReader {
            reader,
            remaining_in_block: 0,
            current: None,
        })
    }

    fn start_block(&mut self, expected: u64) -> io::Result<()> {
        let mut count_buf = [0u8; 8];
        self.reader.read_exact(&mut count_buf)?;
        let count = u64::from_le_bytes(count_buf);
        if count != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "temp mapping block count mismatch",
            ));
        }
        self.remaining_in_block = count;
        self.advance()
    }

    fn advance(&mut self) -> io::Result<()> {
        self.current = if self.remaining_in_block > 0 {
            self.remaining_in_block -= 1;
            Some(R::read_from(&mut self.reader)?)
        } else {
            None
        };
        Ok(())
    }
}

pub struct MappingWriter<R: MappingRecord> {
    mapping_output_format: MappingOutputFormat,
    barcode_length: u32,
    remove_pcr_duplicates: bool,
    tn5_shift: bool,
    only_output_unique_mappings: bool,
    output_file_path: PathBuf,
    temp_file_dir: PathBuf,
    num_temp_files: usize,
    writer: BufWriter<Box<dyn Write + Send>>,
    _marker: std::marker::PhantomData<R>,
}

impl<R: MappingRecord> MappingWriter<R> {
    pub fn new(mapping_parameters: &MappingParameters, barcode_length: u32) -> io::Result<Self> {
        let output_file_path = mapping_parameters.mapping_output_file_path.clone();
        let sink: Box<dyn Write + Send> = if output_file_path.to_str() == Some("-") {
            Box::new(io::stdout())
        } else {
            Box::new(File::create(&output_file_path)?)
        };
        let temp_file_dir = output_file_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(MappingWriter {
            mapping_output_format: mapping_parameters.mapping_output_format,
            barcode_length,
            remove_pcr_duplicates: mapping_parameters.remove_pcr_duplicates,
            tn5_shift: mapping_parameters.tn5_shift,
            only_output_unique_mappings: mapping_parameters.only_output_unique_mappings,
            output_file_path,
            temp_file_dir,
            num_temp_files: 0,
            writer: BufWriter::new(sink),
            _marker: std::marker::PhantomData,
        })
    }

    /// BED, TagAlign and PAF are headerless.
    pub fn output_header(&mut self, _num_reference_sequences: u32, _reference: &SequenceBatch) {
        log::debug!("Output format carries no header");
    }

    fn decode_barcode(&self, barcode_seed: u64) -> String {
        let length = self.barcode_length as usize;
        let mut bases = vec![0u8; length];
        for i in 0..length {
            let shift = 2 * (length - 1 - i);
            bases[i] = uint8_to_char(((barcode_seed >> shift) & 3) as u8);
        }
        String::from_utf8(bases).unwrap_or_default()
    }

    pub fn append_mapping(
        &mut self,
        rid: u32,
        reference: &SequenceBatch,
        mapping: &R,
    ) -> io::Result<()> {
        let chrom = reference.get_sequence_name_at(rid as usize);
        let start = mapping.fragment_start_position();
        let end = start + mapping.fragment_length() as u32;
        let mapping_quality = mapping.mapping_quality();
        match self.mapping_output_format {
            MappingOutputFormat::Bed => {
                if R::IS_PAIRED {
                    if R::HAS_BARCODE {
                        let barcode = self.decode_barcode(mapping.barcode());
                        writeln!(self.writer, "{}\t{}\t{}\t{}\t1", chrom, start, end, barcode)
                    } else {
                        writeln!(
                            self.writer,
                            "{}\t{}\t{}\tN\t{}",
                            chrom, start, end, mapping_quality
                        )
                    }
                } else {
                    let strand = if mapping.mapq() & 1 == 1 { '+' } else { '-' };
                    writeln!(
                        self.writer,
                        "{}\t{}\t{}\tN\t{}\t{}",
                        chrom, start, end, mapping_quality, strand
                    )
                }
            }
            MappingOutputFormat::TagAlign => {
                if R::IS_PAIRED {
                    let positive_end = start + mapping.positive_alignment_length() as u32;
                    let negative_start = end - mapping.negative_alignment_length() as u32;
                    writeln!(self.writer, "{}\t{}\t{}\tN\t1000\t+", chrom, start, positive_end)?;
                    writeln!(self.writer, "{}\t{}\t{}\tN\t1000\t-", chrom, negative_start, end)
                } else {
                    let strand = if mapping.mapq() & 1 == 1 { '+' } else { '-' };
                    writeln!(
                        self.writer,
                        "{}\t{}\t{}\tN\t1000\t{}",
                        chrom, start, end, strand
                    )
                }
            }
            MappingOutputFormat::Paf => {
                let reference_length = reference.get_sequence_length_at(rid as usize);
                if R::IS_PAIRED {
                    let read1_name = mapping.read_name().unwrap_or("*");
                    let read2_name = mapping.mate_name().unwrap_or("*");
                    let positive_end = start + mapping.positive_alignment_length() as u32;
                    let negative_start = end - mapping.negative_alignment_length() as u32;
                    writeln!(
                        self.writer,
                        "{}\t{}\t0\t{}\t+\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                        read1_name,
                        mapping.read_length(),
                        mapping.read_length(),
                        chrom,
                        reference_length,
                        start,
                        positive_end,
                        mapping.positive_alignment_length(),
                        mapping.positive_alignment_length(),
                        mapping_quality
                    )?;
                    writeln!(
                        self.writer,
                        "{}\t{}\t0\t{}\t-\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                        read2_name,
                        mapping.mate_length(),
                        mapping.mate_length(),
                        chrom,
                        reference_length,
                        negative_start,
                        end,
                        mapping.negative_alignment_length(),
                        mapping.negative_alignment_length(),
                        mapping_quality
                    )
                } else {
                    let read_name = mapping.read_name().unwrap_or("*");
                    let strand = if mapping.mapq() & 1 == 1 { '+' } else { '-' };
                    writeln!(
                        self.writer,
                        "{}\t{}\t0\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                        read_name,
                        mapping.read_length(),
                        mapping.read_length(),
                        strand,
                        chrom,
                        reference_length,
                        start,
                        end,
                        mapping.read_length(),
                        mapping.fragment_length(),
                        mapping_quality
                    )
                }
            }
        }
    }

    /// Emit the whole container, honoring the unique-only filter.
    pub fn output_mappings(
        &mut self,
        num_reference_sequences: u32,
        reference: &SequenceBatch,
        container: &[Vec<R>],
    ) -> io::Result<()> {
        let mapq_threshold: u8 = if self.only_output_unique_mappings { 30 } else { 0 };
        for rid in 0..num_reference_sequences {
            for mapping in &container[rid as usize] {
                if mapping.mapping_quality() >= mapq_threshold {
                    self.append_mapping(rid, reference, mapping)?;
                }
            }
        }
        self.writer.flush()
    }

    /// Spill the (sorted) container to a fresh temp file and clear it.
    pub fn output_temp_mappings(
        &mut self,
        num_reference_sequences: u32,
        container: &mut [Vec<R>],
        temp_mapping_file_handles: &mut Vec<TempMappingFileHandle>,
    ) -> io::Result<()> {
        let start_time = utils::realtime();
        let file_path = self.temp_file_dir.join(format!(
            "{}.temp{}",
            self.output_file_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("chromalign"),
            self.num_temp_files
        ));
        self.num_temp_files += 1;
        let mut writer = BufWriter::new(File::create(&file_path)?);
        writer.write_all(TEMP_MAGIC)?;
        let mut num_mappings_per_ref = Vec::with_capacity(num_reference_sequences as usize);
        for bucket in container.iter_mut().take(num_reference_sequences as usize) {
            writer.write_all(&(bucket.len() as u64).to_le_bytes())?;
            for mapping in bucket.iter() {
                mapping.write_to(&mut writer)?;
            }
            num_mappings_per_ref.push(bucket.len() as u64);
            bucket.clear();
        }
        writer.flush()?;
        log::info!(
            "Spilled mappings to {} in {:.2}s",
            file_path.display(),
            utils::realtime() - start_time
        );
        temp_mapping_file_handles.push(TempMappingFileHandle {
            file_path,
            num_mappings_per_ref,
        });
        Ok(())
    }

    /// Low-memory finalization: k-way merge of all spilled runs, per
    /// reference, with streaming dedupe and Tn5 shift. Temp files are
    /// deleted afterwards.
    pub fn process_and_output_mappings_in_low_memory(
        &mut self,
        num_reference_sequences: u32,
        reference: &SequenceBatch,
        temp_mapping_file_handles: &[TempMappingFileHandle],
    ) -> io::Result<()> {
        let start_time = utils::realtime();
        let mapq_threshold: u8 = if self.only_output_unique_mappings { 30 } else { 0 };
        let mut readers: Vec<TempMappingFileReader<R>> = temp_mapping_file_handles
            .iter()
            .map(TempMappingFileReader::open)
            .collect::<io::Result<_>>()?;

        let mut num_output: u64 = 0;
        for rid in 0..num_reference_sequences {
            let mut heap: BinaryHeap<Reverse<(R, usize)>> = BinaryHeap::new();
            for (reader_index, reader) in readers.iter_mut().enumerate() {
                reader.start_block(
                    temp_mapping_file_handles[reader_index].num_mappings_per_ref[rid as usize],
                )?;
                if let Some(mapping) = reader.current.take() {
                    heap.push(Reverse((mapping, reader_index)));
                }
            }
            let mut last_kept: Option<R> = None;
            while let Some(Reverse((mapping, reader_index))) = heap.pop() {
                readers[reader_index].advance()?;
                if let Some(next) = readers[reader_index].current.take() {
                    heap.push(Reverse((next, reader_index)));
                }
                if self.remove_pcr_duplicates {
                    if let Some(kept) = &last_kept {
                        if mapping.is_dup_of(kept) {
                            continue;
                        }
                    }
                }
                last_kept = Some(mapping.clone());
                let mut mapping = mapping;
                if self.tn5_shift {
                    mapping.apply_tn5_shift();
                }
                if mapping.mapping_quality() >= mapq_threshold {
                    self.append_mapping(rid, reference, &mapping)?;
                    num_output += 1;
                }
            }
        }
        self.writer.flush()?;
        for handle in temp_mapping_file_handles {
            if let Err(e) = std::fs::remove_file(&handle.file_path) {
                log::warn!(
                    "Failed to remove temp file {}: {}",
                    handle.file_path.display(),
                    e
                );
            }
        }
        log::info!(
            "Merged {} temp files ({} mappings) in {:.2}s",
            temp_mapping_file_handles.len(),
            num_output,
            utils::realtime() - start_time
        );
        Ok(())
    }

    pub fn finalize(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappings::{MappingWithoutBarcode, PairedEndMappingWithBarcode};
    use crate::sequence_batch::SequenceEffectiveRange;

    fn reference() -> SequenceBatch {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.fa");
        std::fs::write(&path, b">chr1\nACGTACGTACGTACGTACGTACGTACGTACGT\n").unwrap();
        let mut batch = SequenceBatch::new(1, SequenceEffectiveRange::default());
        batch.load_all_sequences(&path);
        batch
    }

    fn writer_for<R: MappingRecord>(
        dir: &std::path::Path,
        format: MappingOutputFormat,
        barcode_length: u32,
    ) -> (MappingWriter<R>, PathBuf) {
        let mut parameters = MappingParameters::default();
        parameters.mapping_output_file_path = dir.join("out.bed");
        parameters.mapping_output_format = format;
        (
            MappingWriter::new(&parameters, barcode_length).unwrap(),
            dir.join("out.bed"),
        )
    }

    #[test]
    fn test_bed_single_end_line() {
        let dir = tempfile::tempdir().unwrap();
        let reference = reference();
        let (mut writer, path) =
            writer_for::<MappingWithoutBarcode>(dir.path(), MappingOutputFormat::Bed, 0);
        let record = MappingWithoutBarcode {
            read_id: 0,
            fragment_start_position: 0,
            fragment_length: 32,
            mapq: (60 << 1) | 1,
        };
        writer.append_mapping(0, &reference, &record).unwrap();
        writer.finalize().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "chr1\t0\t32\tN\t60\t+\n");
    }

    #[test]
    fn test_fragment_line_carries_decoded_barcode() {
        let dir = tempfile::tempdir().unwrap();
        let reference = reference();
        let (mut writer, path) =
            writer_for::<PairedEndMappingWithBarcode>(dir.path(), MappingOutputFormat::Bed, 4);
        let record = PairedEndMappingWithBarcode {
            read_id: 0,
            barcode: 0b00011011, // ACGT
            fragment_start_position: 0,
            fragment_length: 32,
            mapq: (60 << 1) | 1,
            positive_alignment_length: 16,
            negative_alignment_length: 16,
        };
        writer.append_mapping(0, &reference, &record).unwrap();
        writer.finalize().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "chr1\t0\t32\tACGT\t1\n");
    }

    #[test]
    fn test_spill_and_low_memory_merge_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let reference = reference();
        let mut parameters = MappingParameters::default();
        parameters.mapping_output_file_path = dir.path().join("out.bed");
        parameters.remove_pcr_duplicates = true;
        let mut writer: MappingWriter<MappingWithoutBarcode> =
            MappingWriter::new(&parameters, 0).unwrap();

        let record = |start: u32| MappingWithoutBarcode {
            read_id: 0,
            fragment_start_position: start,
            fragment_length: 10,
            mapq: (60 << 1) | 1,
        };
        let mut handles = Vec::new();
        // Two spills that share one duplicate record at start 4.
        let mut container = vec![vec![record(4), record(8)]];
        writer
            .output_temp_mappings(1, &mut container, &mut handles)
            .unwrap();
        let mut container = vec![vec![record(2), record(4)]];
        writer
            .output_temp_mappings(1, &mut container, &mut handles)
            .unwrap();
        writer
            .process_and_output_mappings_in_low_memory(1, &reference, &handles)
            .unwrap();
        let contents = std::fs::read_to_string(dir.path().join("out.bed")).unwrap();
        let starts: Vec<&str> = contents
            .lines()
            .map(|line| line.split('\t').nth(1).unwrap())
            .collect();
        assert_eq!(starts, vec!["2", "4", "8"]);
        // Temp files were deleted after the merge.
        assert!(!handles[0].file_path.exists());
        assert!(!handles[1].file_path.exists());
    }
}
