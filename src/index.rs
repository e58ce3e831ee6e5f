// Minimizer index: hash -> reference occurrence list.
//
// Construction sketches every reference sequence, then groups occurrences by
// hashed k-mer. The on-disk image is a little-endian stream read once at
// startup; the loaded index is immutable and shared read-only across worker
// threads for the whole mapping run.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::minimizer::{Minimizer, MinimizerGenerator};
use crate::sequence_batch::SequenceBatch;
use crate::utils;

const INDEX_MAGIC: &[u8; 8] = b"CHRALN01";

/// A reference occurrence of a minimizer:
/// `(reference_id << 33) | (position << 1) | strand`, where `position` is the
/// k-mer's last base on the forward strand.
#[inline]
pub fn pack_hit(reference_id: u32, position: u32, strand: u8) -> u64 {
    ((reference_id as u64) << 33) | ((position as u64) << 1) | strand as u64
}

#[inline]
pub fn hit_reference_id(hit: u64) -> u32 {
    (hit >> 33) as u32
}

#[inline]
pub fn hit_position(hit: u64) -> u32 {
    ((hit >> 1) & 0xffff_ffff) as u32
}

#[inline]
pub fn hit_is_reverse(hit: u64) -> bool {
    (hit & 1) != 0
}

pub struct Index {
    kmer_size: usize,
    window_size: usize,
    index_file_path: PathBuf,
    /// hash -> (offset, count) into `occurrences`.
    lookup_table: HashMap<u64, (u64, u32)>,
    occurrences: Vec<u64>,
}

impl Index {
    pub fn new(index_file_path: &Path) -> Self {
        Index {
            kmer_size: 0,
            window_size: 0,
            index_file_path: index_file_path.to_path_buf(),
            lookup_table: HashMap::new(),
            occurrences: Vec::new(),
        }
    }

    #[inline]
    pub fn get_kmer_size(&self) -> usize {
        self.kmer_size
    }

    #[inline]
    pub fn get_window_size(&self) -> usize {
        self.window_size
    }

    /// Occurrence list for a hashed k-mer; empty when the seed is absent.
    #[inline]
    pub fn lookup(&self, hash: u64) -> &[u64] {
        match self.lookup_table.get(&hash) {
            Some(&(offset, count)) => {
                &self.occurrences[offset as usize..offset as usize + count as usize]
            }
            None => &[],
        }
    }

    /// Sketch the reference and build the occurrence table. Per-sequence
    /// sketching is parallel; grouping is a single sequential pass.
    pub fn construct(&mut self, kmer_size: usize, window_size: usize, reference: &SequenceBatch) {
        let start_time = utils::realtime();
        self.kmer_size = kmer_size;
        self.window_size = window_size;
        let num_sequences = reference.get_num_sequences() as usize;

        let per_sequence: Vec<Vec<Minimizer>> = (0..num_sequences)
            .into_par_iter()
            .map(|rid| {
                let generator = MinimizerGenerator::new(kmer_size, window_size);
                let mut minimizers = Vec::new();
                generator.generate_minimizers(reference.get_sequence_at(rid), &mut minimizers);
                minimizers
            })
            .collect();

        let total: usize = per_sequence.iter().map(|v| v.len()).sum();
        let mut entries: Vec<(u64, u64)> = Vec::with_capacity(total);
        for (rid, minimizers) in per_sequence.iter().enumerate() {
            for minimizer in minimizers {
                let strand = if minimizer.is_reverse() { 1 } else { 0 };
                entries.push((
                    minimizer.hash,
                    pack_hit(rid as u32, minimizer.position(), strand),
                ));
            }
        }
        entries.par_sort_unstable();

        self.occurrences = Vec::with_capacity(entries.len());
        self.lookup_table = HashMap::with_capacity(entries.len() / 2 + 1);
        let mut i = 0;
        while i < entries.len() {
            let hash = entries[i].0;
            let offset = self.occurrences.len() as u64;
            let mut j = i;
            while j < entries.len() && entries[j].0 == hash {
                self.occurrences.push(entries[j].1);
                j += 1;
            }
            self.lookup_table.insert(hash, (offset, (j - i) as u32));
            i = j;
        }
        log::info!(
            "Built index with {} distinct minimizers ({} occurrences) in {:.2}s",
            self.lookup_table.len(),
            self.occurrences.len(),
            utils::realtime() - start_time
        );
    }

    pub fn save(&self) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(&self.index_file_path)?);
        writer.write_all(INDEX_MAGIC)?;
        writer.write_all(&(self.kmer_size as u32).to_le_bytes())?;
        writer.write_all(&(self.window_size as u32).to_le_bytes())?;
        writer.write_all(&(self.lookup_table.len() as u64).to_le_bytes())?;
        writer.write_all(&(self.occurrences.len() as u64).to_le_bytes())?;
        for (&hash, &(offset, count)) in &self.lookup_table {
            writer.write_all(&hash.to_le_bytes())?;
            writer.write_all(&offset.to_le_bytes())?;
            writer.write_all(&count.to_le_bytes())?;
        }
        for &occurrence in &self.occurrences {
            writer.write_all(&occurrence.to_le_bytes())?;
        }
        writer.flush()
    }

    pub fn load(&mut self) {
        let start_time = utils::realtime();
        if let Err(e) = self.load_inner() {
            utils::exit_with_message(&format!(
                "Cannot load index {}: {}",
                self.index_file_path.display(),
                e
            ));
        }
        log::info!(
            "Loaded index ({} distinct minimizers) in {:.2}s",
            self.lookup_table.len(),
            utils::realtime() - start_time
        );
    }

    fn load_inner(&mut self) -> io::Result<()> {
        let mut reader = BufReader::new(File::open(&self.index_file_path)?);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a chromalign index",
            ));
        }
        self.kmer_size = read_u32(&mut reader)? as usize;
        self.window_size = read_u32(&mut reader)? as usize;
        let num_keys = read_u64(&mut reader)? as usize;
        let num_occurrences = read_u64(&mut reader)? as usize;
        self.lookup_table = HashMap::with_capacity(num_keys);
        for _ in 0..num_keys {
            let hash = read_u64(&mut reader)?;
            let offset = read_u64(&mut reader)?;
            let count = read_u32(&mut reader)?;
            self.lookup_table.insert(hash, (offset, count));
        }
        self.occurrences = Vec::with_capacity(num_occurrences);
        for _ in 0..num_occurrences {
            self.occurrences.push(read_u64(&mut reader)?);
        }
        Ok(())
    }

    /// Release the occurrence table. The index is loaded once per run and
    /// destroyed before post-processing, which can need the memory.
    pub fn destroy(&mut self) {
        self.lookup_table = HashMap::new();
        self.occurrences = Vec::new();
    }
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
