// Per-barcode summary metadata.
//
// Tracks, keyed by the barcode seed, how many reads a barcode contributed,
// how many of them hit the minimizer cache, and the estimated number of
// distinct cache slots the barcode touched (a k-MinHash cardinality
// estimate). Both maps are lock-striped: barcode seeds hash across stripes,
// so concurrent workers rarely contend on one mutex.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

const NUM_STRIPES: usize = 1000;

/// k-MinHash sketch over observed cache slot ids. Keeps the k smallest
/// distinct values; cardinality is estimated as `k * range / max_kept - 1`.
pub struct KMinHash {
    k: usize,
    range: usize,
    heap: BinaryHeap<u64>,
    unique_slots: HashSet<u64>,
}

impl KMinHash {
    pub fn new(k: usize, range: usize) -> Self {
        KMinHash {
            k,
            range,
            heap: BinaryHeap::new(),
            unique_slots: HashSet::new(),
        }
    }

    pub fn add(&mut self, slot: u64) {
        if self.unique_slots.contains(&slot) {
            return;
        }
        self.unique_slots.insert(slot);
        self.heap.push(slot);
        if self.heap.len() > self.k {
            if let Some(evicted) = self.heap.pop() {
                self.unique_slots.remove(&evicted);
            }
        }
    }

    /// Zero until the sketch has seen at least k distinct slots; estimators
    /// on fewer samples are meaningless.
    pub fn compute_cardinality(&self) -> usize {
        if self.heap.len() < self.k {
            return 0;
        }
        match self.heap.peek() {
            Some(&max_kept) if max_kept > 0 => self.k * self.range / max_kept as usize - 1,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryField {
    Total,
    CacheHit,
    Cardinality,
}

#[derive(Default, Clone)]
struct SummaryCounts {
    total: u64,
    cache_hits: u64,
    cardinality: u64,
}

/// Lock-striped barcode seed -> counters map.
pub struct SummaryMetadata {
    stripes: Vec<Mutex<HashMap<u64, SummaryCounts>>>,
}

impl Default for SummaryMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl SummaryMetadata {
    pub fn new() -> Self {
        SummaryMetadata {
            stripes: (0..NUM_STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn update(&self, barcode_seed: u64, field: SummaryField, delta: u64) {
        let stripe = &self.stripes[(barcode_seed % NUM_STRIPES as u64) as usize];
        let mut map = stripe.lock().unwrap();
        let counts = map.entry(barcode_seed).or_default();
        match field {
            SummaryField::Total => counts.total += delta,
            SummaryField::CacheHit => counts.cache_hits += delta,
            SummaryField::Cardinality => counts.cardinality = delta,
        }
    }

    /// Write one CSV row per barcode seed.
    pub fn output(&self, path: &Path, include_cardinality: bool) -> io::Result<()> {
        let mut writer = BufWriter::new(std::fs::File::create(path)?);
        if include_cardinality {
            writeln!(writer, "barcode,total,cachehit,num_uniq_cache_slots")?;
        } else {
            writeln!(writer, "barcode,total,cachehit")?;
        }
        let mut rows: Vec<(u64, SummaryCounts)> = Vec::new();
        for stripe in &self.stripes {
            let map = stripe.lock().unwrap();
            rows.extend(map.iter().map(|(&seed, counts)| (seed, counts.clone())));
        }
        rows.sort_by_key(|(seed, _)| *seed);
        for (seed, counts) in rows {
            if include_cardinality {
                writeln!(
                    writer,
                    "{},{},{},{}",
                    seed, counts.total, counts.cache_hits, counts.cardinality
                )?;
            } else {
                writeln!(writer, "{},{},{}", seed, counts.total, counts.cache_hits)?;
            }
        }
        writer.flush()
    }
}

/// Lock-striped barcode seed -> k-MinHash sketch of cache slots hit.
pub struct BarcodePeakMap {
    k_for_minhash: usize,
    cache_size: usize,
    stripes: Vec<Mutex<HashMap<u64, KMinHash>>>,
}

impl BarcodePeakMap {
    pub fn new(k_for_minhash: usize, cache_size: usize) -> Self {
        BarcodePeakMap {
            k_for_minhash,
            cache_size,
            stripes: (0..NUM_STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Record the cache slots (either end of a pair) a barcode just hit.
    pub fn add_slots(&self, barcode_seed: u64, slot1: Option<usize>, slot2: Option<usize>) {
        if slot1.is_none() && slot2.is_none() {
            return;
        }
        let stripe = &self.stripes[(barcode_seed % NUM_STRIPES as u64) as usize];
        let mut map = stripe.lock().unwrap();
        let sketch = map
            .entry(barcode_seed)
            .or_insert_with(|| KMinHash::new(self.k_for_minhash, self.cache_size));
        if let Some(slot) = slot1 {
            sketch.add(slot as u64);
        }
        if let Some(slot) = slot2 {
            sketch.add(slot as u64);
        }
    }

    /// Fold every sketch's cardinality estimate into the summary metadata.
    pub fn fold_into(&self, summary: &SummaryMetadata) {
        for stripe in &self.stripes {
            let map = stripe.lock().unwrap();
            for (&seed, sketch) in map.iter() {
                summary.update(
                    seed,
                    SummaryField::Cardinality,
                    sketch.compute_cardinality() as u64,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kminhash_needs_k_samples() {
        let mut sketch = KMinHash::new(4, 1000);
        sketch.add(10);
        sketch.add(20);
        assert_eq!(sketch.compute_cardinality(), 0);
    }

    #[test]
    fn test_kminhash_tracks_distinct_slots_only() {
        let mut sketch = KMinHash::new(4, 1000);
        for _ in 0..100 {
            sketch.add(10);
        }
        assert_eq!(sketch.compute_cardinality(), 0);
        for slot in [20, 30, 40] {
            sketch.add(slot);
        }
        // max kept = 40 -> 4 * 1000 / 40 - 1 = 99.
        assert_eq!(sketch.compute_cardinality(), 99);
    }

    #[test]
    fn test_kminhash_keeps_smallest_k() {
        let mut sketch = KMinHash::new(2, 100);
        for slot in [90, 80, 10, 20] {
            sketch.add(slot);
        }
        // Smallest two are 10 and 20 -> 2 * 100 / 20 - 1 = 9.
        assert_eq!(sketch.compute_cardinality(), 9);
    }

    #[test]
    fn test_summary_accumulates_and_outputs() {
        let summary = SummaryMetadata::new();
        summary.update(5, SummaryField::Total, 2);
        summary.update(5, SummaryField::CacheHit, 1);
        summary.update(9, SummaryField::Total, 1);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        summary.output(&path, false).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("barcode,total,cachehit\n"));
        assert!(contents.contains("5,2,1"));
        assert!(contents.contains("9,1,0"));
    }

    #[test]
    fn test_peak_map_folds_cardinality() {
        let peak_map = BarcodePeakMap::new(2, 100);
        peak_map.add_slots(7, Some(10), Some(20));
        let summary = SummaryMetadata::new();
        peak_map.fold_into(&summary);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        summary.output(&path, true).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("7,0,0,9"));
    }
}
