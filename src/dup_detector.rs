// Input-level identical-pair detection.
//
// Two-level hash: the barcode seed selects a per-barcode table, which maps
// the concatenated 16bp prefix seeds of both mates to their 16..32bp
// continuation seeds. A pair is a duplicate only when prefix and
// continuation both match, so reads differing after 32bp never collide.

use std::collections::HashMap;

use crate::sequence_batch::SequenceBatch;

const DEDUPE_SEED_LENGTH: usize = 16;

#[derive(Default)]
pub struct DupDetector {
    barcode_lookup_table: HashMap<u64, usize>,
    read_lookup_tables: Vec<HashMap<u64, (u64, u64)>>,
}

impl DupDetector {
    pub fn new() -> Self {
        DupDetector::default()
    }

    /// Check-and-insert: the first occurrence of a pair registers it and
    /// returns false; exact re-occurrences under the same barcode return
    /// true.
    pub fn paired_end_read_with_barcode_is_duplicate(
        &mut self,
        pair_index: usize,
        barcode_batch: &SequenceBatch,
        read_batch1: &SequenceBatch,
        read_batch2: &SequenceBatch,
    ) -> bool {
        let barcode_key =
            barcode_batch.generate_seed_from_sequence_at(pair_index, 0, DEDUPE_SEED_LENGTH);
        let read1_seed1 =
            read_batch1.generate_seed_from_sequence_at(pair_index, 0, DEDUPE_SEED_LENGTH);
        let read2_seed1 =
            read_batch2.generate_seed_from_sequence_at(pair_index, 0, DEDUPE_SEED_LENGTH);
        let read_seed_key = (read1_seed1 << (DEDUPE_SEED_LENGTH * 2)) | read2_seed1;
        let read1_seed2 = read_batch1.generate_seed_from_sequence_at(
            pair_index,
            DEDUPE_SEED_LENGTH,
            DEDUPE_SEED_LENGTH * 2,
        );
        let read2_seed2 = read_batch2.generate_seed_from_sequence_at(
            pair_index,
            DEDUPE_SEED_LENGTH,
            DEDUPE_SEED_LENGTH * 2,
        );

        match self.barcode_lookup_table.get(&barcode_key) {
            Some(&read_lookup_table_index) => {
                let read_lookup_table = &mut self.read_lookup_tables[read_lookup_table_index];
                match read_lookup_table.get(&read_seed_key) {
                    Some(&(continuation1, continuation2)) => {
                        continuation1 == read1_seed2 && continuation2 == read2_seed2
                    }
                    None => {
                        read_lookup_table.insert(read_seed_key, (read1_seed2, read2_seed2));
                        false
                    }
                }
            }
            None => {
                let mut read_lookup_table = HashMap::new();
                read_lookup_table.insert(read_seed_key, (read1_seed2, read2_seed2));
                self.barcode_lookup_table
                    .insert(barcode_key, self.read_lookup_tables.len());
                self.read_lookup_tables.push(read_lookup_table);
                false
            }
        }
    }
}
