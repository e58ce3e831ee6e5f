// Minimizer -> candidates cache.
//
// Chromatin libraries repeat fragments heavily, so many reads carry an
// identical minimizer sketch. The cache keys on a commutative fingerprint of
// the sketch plus the read length and stores the finished candidate lists,
// skipping index lookups and clustering entirely on a hit.
//
// Layout: the slot table is split into shards, each behind its own RwLock.
// The mapping phase only takes read locks; writes happen in the dedicated
// update phase after the per-batch barrier, so a slot id handed to a worker
// stays valid for the rest of its batch. Replacement is a saturating
// use-counter per slot (approximate LRU): an update colliding with a live
// entry decays it and only takes the slot once the counter reaches zero.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::candidate_processor::Candidate;
use crate::mapping_metadata::MappingMetadata;
use crate::minimizer::Minimizer;
use crate::utils::hash_64;

const NUM_SHARDS: usize = 256;
const ENTRY_FRESH_USES: u8 = 3;

#[derive(Default)]
struct CacheEntry {
    occupied: bool,
    fingerprint: u64,
    read_length: u32,
    minimizers: Vec<Minimizer>,
    positive_candidates: Vec<Candidate>,
    negative_candidates: Vec<Candidate>,
    repetitive_seed_length: u32,
    use_counter: u8,
}

pub struct MmCache {
    shard_capacity: usize,
    shards: Vec<RwLock<Vec<CacheEntry>>>,
    num_hits: AtomicU64,
    num_misses: AtomicU64,
    num_updates: AtomicU64,
}

impl MmCache {
    pub fn new(cache_size: usize) -> Self {
        let shard_capacity = cache_size.div_ceil(NUM_SHARDS).max(1);
        let mut shards = Vec::with_capacity(NUM_SHARDS);
        for _ in 0..NUM_SHARDS {
            let mut slots = Vec::with_capacity(shard_capacity);
            slots.resize_with(shard_capacity, CacheEntry::default);
            shards.push(RwLock::new(slots));
        }
        MmCache {
            shard_capacity,
            shards,
            num_hits: AtomicU64::new(0),
            num_misses: AtomicU64::new(0),
            num_updates: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shard_capacity * NUM_SHARDS
    }

    /// Order-independent digest of the minimizer multiset and read length.
    fn fingerprint(minimizers: &[Minimizer], read_length: u32) -> u64 {
        let mut digest: u64 = 0;
        for minimizer in minimizers {
            digest = digest.wrapping_add(hash_64(minimizer.hash ^ hash_64(minimizer.packed)));
        }
        hash_64(digest ^ read_length as u64)
    }

    #[inline]
    fn slot_for(&self, fingerprint: u64) -> (usize, usize) {
        let shard = (fingerprint % NUM_SHARDS as u64) as usize;
        let slot = ((fingerprint / NUM_SHARDS as u64) % self.shard_capacity as u64) as usize;
        (shard, slot)
    }

    /// On a hit, fill the metadata's candidate lists from the cached entry
    /// and return the stable slot id; `None` is an ordinary miss.
    pub fn query(&self, metadata: &mut MappingMetadata, read_length: u32) -> Option<usize> {
        let fingerprint = Self::fingerprint(&metadata.minimizers, read_length);
        let (shard_index, slot_index) = self.slot_for(fingerprint);
        let shard = self.shards[shard_index].read().unwrap();
        let entry = &shard[slot_index];
        if entry.occupied
            && entry.fingerprint == fingerprint
            && entry.read_length == read_length
            && entry.minimizers == metadata.minimizers
        {
            metadata.positive_candidates.clear();
            metadata.negative_candidates.clear();
            metadata
                .positive_candidates
                .extend_from_slice(&entry.positive_candidates);
            metadata
                .negative_candidates
                .extend_from_slice(&entry.negative_candidates);
            metadata.repetitive_seed_length = entry.repetitive_seed_length;
            self.num_hits.fetch_add(1, Ordering::Relaxed);
            Some(shard_index * self.shard_capacity + slot_index)
        } else {
            self.num_misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Insert or refresh an entry. Only called from the update phase, so
    /// writers never race with the mapping phase's readers on slot ids.
    pub fn update(
        &self,
        minimizers: &[Minimizer],
        positive_candidates: &[Candidate],
        negative_candidates: &[Candidate],
        repetitive_seed_length: u32,
        read_length: u32,
    ) {
        if minimizers.is_empty() {
            return;
        }
        let fingerprint = Self::fingerprint(minimizers, read_length);
        let (shard_index, slot_index) = self.slot_for(fingerprint);
        let mut shard = self.shards[shard_index].write().unwrap();
        let entry = &mut shard[slot_index];
        if entry.occupied && entry.fingerprint == fingerprint && entry.read_length == read_length {
            entry.use_counter = ENTRY_FRESH_USES;
            return;
        }
        if entry.occupied && entry.use_counter > 0 {
            entry.use_counter -= 1;
            return;
        }
        entry.occupied = true;
        entry.fingerprint = fingerprint;
        entry.read_length = read_length;
        entry.minimizers = minimizers.to_vec();
        entry.positive_candidates = positive_candidates.to_vec();
        entry.negative_candidates = negative_candidates.to_vec();
        entry.repetitive_seed_length = repetitive_seed_length;
        entry.use_counter = ENTRY_FRESH_USES;
        self.num_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// How many reads of the next batch should be offered to `update`.
    /// While the cache is still cold every read is offered; once the run has
    /// seen several times the cache capacity, updates throttle down to a
    /// tuning-controlled fraction of the batch so the update phase stays
    /// short.
    pub fn get_update_threshold(
        &self,
        batch_size: u32,
        total_reads_seen: u64,
        is_paired_end: bool,
        tuning_param: f64,
    ) -> u32 {
        let warm_up_factor = if is_paired_end { 8 } else { 4 };
        if total_reads_seen <= (warm_up_factor * self.capacity()) as u64 {
            return batch_size;
        }
        let floor = 1024.min(batch_size);
        let throttled = (batch_size as f64 * tuning_param).ceil() as u32;
        throttled.max(floor)
    }

    pub fn print_stats(&self) {
        let hits = self.num_hits.load(Ordering::Relaxed);
        let misses = self.num_misses.load(Ordering::Relaxed);
        let updates = self.num_updates.load(Ordering::Relaxed);
        log::info!(
            "Cache stats: {} hits, {} misses ({:.1}% hit rate), {} insertions",
            hits,
            misses,
            100.0 * hits as f64 / (hits + misses).max(1) as f64,
            updates
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sketch(seed: u64, n: usize) -> Vec<Minimizer> {
        (0..n)
            .map(|i| Minimizer {
                hash: hash_64(seed.wrapping_add(i as u64)),
                packed: (i as u64) << 1,
            })
            .collect()
    }

    fn metadata_with_sketch(minimizers: &[Minimizer]) -> MappingMetadata {
        let mut metadata = MappingMetadata::default();
        metadata.minimizers = minimizers.to_vec();
        metadata
    }

    #[test]
    fn test_miss_then_hit_round_trip() {
        let cache = MmCache::new(1024);
        let minimizers = sketch(7, 5);
        let candidates = vec![Candidate {
            position: 1000,
            count: 3,
        }];
        let mut metadata = metadata_with_sketch(&minimizers);
        assert!(cache.query(&mut metadata, 100).is_none());
        cache.update(&minimizers, &candidates, &[], 9, 100);
        let slot = cache.query(&mut metadata, 100);
        assert!(slot.is_some());
        assert_eq!(metadata.positive_candidates, candidates);
        assert_eq!(metadata.repetitive_seed_length, 9);
        // Same sketch at a different read length is a different key.
        let mut other = metadata_with_sketch(&minimizers);
        assert!(cache.query(&mut other, 101).is_none());
    }

    #[test]
    fn test_slot_id_is_stable_across_queries() {
        let cache = MmCache::new(1024);
        let minimizers = sketch(3, 4);
        cache.update(&minimizers, &[], &[], 0, 50);
        let mut metadata = metadata_with_sketch(&minimizers);
        let first = cache.query(&mut metadata, 50).unwrap();
        let second = cache.query(&mut metadata, 50).unwrap();
        assert_eq!(first, second);
        assert!(first < cache.capacity());
    }

    #[test]
    fn test_eviction_needs_repeated_pressure() {
        // Force both sketches into the same slot by using a capacity of one
        // slot per shard and sketches that share fingerprint shard/slot.
        let cache = MmCache::new(NUM_SHARDS);
        let resident = sketch(1, 3);
        cache.update(&resident, &[], &[], 0, 60);
        let mut resident_metadata = metadata_with_sketch(&resident);
        // A colliding update decays the counter instead of evicting...
        let mut intruder_seed = 2u64;
        let intruder = loop {
            let candidate_sketch = sketch(intruder_seed, 3);
            let f1 = MmCache::fingerprint(&resident, 60);
            let f2 = MmCache::fingerprint(&candidate_sketch, 60);
            if f1 % NUM_SHARDS as u64 == f2 % NUM_SHARDS as u64 {
                break candidate_sketch;
            }
            intruder_seed += 1;
        };
        cache.update(&intruder, &[], &[], 0, 60);
        assert!(cache.query(&mut resident_metadata, 60).is_some());
        // ...but sustained pressure eventually replaces the entry.
        for _ in 0..ENTRY_FRESH_USES + 1 {
            cache.update(&intruder, &[], &[], 0, 60);
        }
        assert!(cache.query(&mut resident_metadata, 60).is_none());
        let mut intruder_metadata = metadata_with_sketch(&intruder);
        assert!(cache.query(&mut intruder_metadata, 60).is_some());
    }

    #[test]
    fn test_update_threshold_schedule() {
        let cache = MmCache::new(100_000);
        let batch_size = 500_000u32;
        // Cold cache: offer the whole batch.
        assert_eq!(
            cache.get_update_threshold(batch_size, 100_000, true, 0.01),
            batch_size
        );
        // Warm cache: throttle to the tuned fraction.
        let throttled = cache.get_update_threshold(batch_size, 50_000_000, true, 0.01);
        assert!(throttled < batch_size);
        assert!(throttled >= 1024);
    }
}
