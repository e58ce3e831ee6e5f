// Concrete mapping record types.
//
// One concrete type exists per output format / barcode combination and the
// whole pipeline is generic over it, so the per-read hot path never pays for
// dynamic dispatch or for fields a format does not carry.
//
// Sort order is the PCR-dedupe order: (fragment start, fragment length,
// barcode, read id). Two records are duplicates when they agree on
// everything except mapq and read id.

use std::cmp::Ordering;
use std::io::{self, Read, Write};

/// Behavior shared by every record variant. Records live in per-reference
/// buckets, so the reference id is not a field.
pub trait MappingRecord: Clone + Send + Sync + Ord + 'static {
    const HAS_BARCODE: bool;
    const IS_PAIRED: bool;

    fn read_id(&self) -> u32;
    fn barcode(&self) -> u64;
    fn fragment_start_position(&self) -> u32;
    fn fragment_length(&self) -> u16;
    fn mapq(&self) -> u8;

    /// MAPQ with the strand/orientation bit stripped.
    fn mapping_quality(&self) -> u8 {
        self.mapq() >> 1
    }

    /// Equality under the PCR-dedupe relation (mapq and read id excluded).
    fn is_dup_of(&self, other: &Self) -> bool;

    /// Tn5 transposase cut-site correction, applied in place.
    fn apply_tn5_shift(&mut self);

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()>;
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self>;

    // Paired-end geometry; zero for single-end records.
    fn positive_alignment_length(&self) -> u16 {
        0
    }
    fn negative_alignment_length(&self) -> u16 {
        0
    }

    // Name-carrying formats (PAF) override these.
    fn read_name(&self) -> Option<&str> {
        None
    }
    fn mate_name(&self) -> Option<&str> {
        None
    }
    fn read_length(&self) -> u16 {
        0
    }
    fn mate_length(&self) -> u16 {
        0
    }
}

/// Constructor used by the single-end emission path.
pub trait SingleEndRecord: MappingRecord {
    #[allow(clippy::too_many_arguments)]
    fn new_single_end(
        read_id: u32,
        read_name: &str,
        read_length: u16,
        barcode: u64,
        fragment_start_position: u32,
        fragment_length: u16,
        mapq: u8,
    ) -> Self;
}

/// Constructor used by the paired-end emission path.
pub trait PairedEndRecord: MappingRecord {
    #[allow(clippy::too_many_arguments)]
    fn new_paired_end(
        read_id: u32,
        read1_name: &str,
        read2_name: &str,
        read1_length: u16,
        read2_length: u16,
        barcode: u64,
        fragment_start_position: u32,
        fragment_length: u16,
        mapq: u8,
        positive_alignment_length: u16,
        negative_alignment_length: u16,
    ) -> Self;
}

// ---------------------------------------------------------------------------
// Single-end records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingWithoutBarcode {
    pub read_id: u32,
    pub fragment_start_position: u32,
    pub fragment_length: u16,
    pub mapq: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingWithBarcode {
    pub read_id: u32,
    pub barcode: u64,
    pub fragment_start_position: u32,
    pub fragment_length: u16,
    pub mapq: u8,
}

// ---------------------------------------------------------------------------
// Paired-end records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedEndMappingWithoutBarcode {
    pub read_id: u32,
    pub fragment_start_position: u32,
    pub fragment_length: u16,
    pub mapq: u8,
    pub positive_alignment_length: u16,
    pub negative_alignment_length: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedEndMappingWithBarcode {
    pub read_id: u32,
    pub barcode: u64,
    pub fragment_start_position: u32,
    pub fragment_length: u16,
    pub mapq: u8,
    pub positive_alignment_length: u16,
    pub negative_alignment_length: u16,
}

// ---------------------------------------------------------------------------
// PAF records (carry names and lengths for the writer)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PafMapping {
    pub read_id: u32,
    pub read_name: String,
    pub read_length: u16,
    pub fragment_start_position: u32,
    pub fragment_length: u16,
    pub mapq: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedPafMapping {
    pub read_id: u32,
    pub read1_name: String,
    pub read2_name: String,
    pub read1_length: u16,
    pub read2_length: u16,
    pub fragment_start_position: u32,
    pub fragment_length: u16,
    pub positive_alignment_length: u16,
    pub negative_alignment_length: u16,
    pub mapq: u8,
}

// ---------------------------------------------------------------------------
// IO helpers for the spill format
// ---------------------------------------------------------------------------

fn write_string<W: Write>(writer: &mut W, s: &str) -> io::Result<()> {
    writer.write_all(&(s.len() as u32).to_le_bytes())?;
    writer.write_all(s.as_bytes())
}

fn read_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let mut bytes = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

macro_rules! read_le {
    ($reader:expr, $ty:ty) => {{
        let mut buf = [0u8; std::mem::size_of::<$ty>()];
        $reader.read_exact(&mut buf)?;
        <$ty>::from_le_bytes(buf)
    }};
}

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

impl Ord for MappingWithoutBarcode {
    fn cmp(&self, other: &Self) -> Ordering {
        (
            self.fragment_start_position,
            self.fragment_length,
            self.read_id,
            self.mapq,
        )
            .cmp(&(
                other.fragment_start_position,
                other.fragment_length,
                other.read_id,
                other.mapq,
            ))
    }
}

impl PartialOrd for MappingWithoutBarcode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl MappingRecord for MappingWithoutBarcode {
    const HAS_BARCODE: bool = false;
    const IS_PAIRED: bool = false;

    fn read_id(&self) -> u32 {
        self.read_id
    }
    fn barcode(&self) -> u64 {
        0
    }
    fn fragment_start_position(&self) -> u32 {
        self.fragment_start_position
    }
    fn fragment_length(&self) -> u16 {
        self.fragment_length
    }
    fn mapq(&self) -> u8 {
        self.mapq
    }

    fn is_dup_of(&self, other: &Self) -> bool {
        self.fragment_start_position == other.fragment_start_position
            && self.fragment_length == other.fragment_length
    }

    fn apply_tn5_shift(&mut self) {
        if self.mapq & 1 == 1 {
            self.fragment_start_position += 4;
            self.fragment_length -= 4;
        } else {
            self.fragment_length -= 5;
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.read_id.to_le_bytes())?;
        writer.write_all(&self.fragment_start_position.to_le_bytes())?;
        writer.write_all(&self.fragment_length.to_le_bytes())?;
        writer.write_all(&[self.mapq])
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(MappingWithoutBarcode {
            read_id: read_le!(reader, u32),
            fragment_start_position: read_le!(reader, u32),
            fragment_length: read_le!(reader, u16),
            mapq: read_le!(reader, u8),
        })
    }
}

impl SingleEndRecord for MappingWithoutBarcode {
    fn new_single_end(
        read_id: u32,
        _read_name: &str,
        _read_length: u16,
        _barcode: u64,
        fragment_start_position: u32,
        fragment_length: u16,
        mapq: u8,
    ) -> Self {
        MappingWithoutBarcode {
            read_id,
            fragment_start_position,
            fragment_length,
            mapq,
        }
    }
}

impl Ord for MappingWithBarcode {
    fn cmp(&self, other: &Self) -> Ordering {
        (
            self.fragment_start_position,
            self.fragment_length,
            self.barcode,
            self.read_id,
            self.mapq,
        )
            .cmp(&(
                other.fragment_start_position,
                other.fragment_length,
                other.barcode,
                other.read_id,
                other.mapq,
            ))
    }
}

impl PartialOrd for MappingWithBarcode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl MappingRecord for MappingWithBarcode {
    const HAS_BARCODE: bool = true;
    const IS_PAIRED: bool = false;

    fn read_id(&self) -> u32 {
        self.read_id
    }
    fn barcode(&self) -> u64 {
        self.barcode
    }
    fn fragment_start_position(&self) -> u32 {
        self.fragment_start_position
    }
    fn fragment_length(&self) -> u16 {
        self.fragment_length
    }
    fn mapq(&self) -> u8 {
        self.mapq
    }

    fn is_dup_of(&self, other: &Self) -> bool {
        self.fragment_start_position == other.fragment_start_position
            && self.fragment_length == other.fragment_length
            && self.barcode == other.barcode
    }

    fn apply_tn5_shift(&mut self) {
        if self.mapq & 1 == 1 {
            self.fragment_start_position += 4;
            self.fragment_length -= 4;
        } else {
            self.fragment_length -= 5;
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.read_id.to_le_bytes())?;
        writer.write_all(&self.barcode.to_le_bytes())?;
        writer.write_all(&self.fragment_start_position.to_le_bytes())?;
        writer.write_all(&self.fragment_length.to_le_bytes())?;
        writer.write_all(&[self.mapq])
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(MappingWithBarcode {
            read_id: read_le!(reader, u32),
            barcode: read_le!(reader, u64),
            fragment_start_position: read_le!(reader, u32),
            fragment_length: read_le!(reader, u16),
            mapq: read_le!(reader, u8),
        })
    }
}

impl SingleEndRecord for MappingWithBarcode {
    fn new_single_end(
        read_id: u32,
        _read_name: &str,
        _read_length: u16,
        barcode: u64,
        fragment_start_position: u32,
        fragment_length: u16,
        mapq: u8,
    ) -> Self {
        MappingWithBarcode {
            read_id,
            barcode,
            fragment_start_position,
            fragment_length,
            mapq,
        }
    }
}

impl Ord for PairedEndMappingWithoutBarcode {
    fn cmp(&self, other: &Self) -> Ordering {
        (
            self.fragment_start_position,
            self.fragment_length,
            self.read_id,
            self.mapq,
        )
            .cmp(&(
                other.fragment_start_position,
                other.fragment_length,
                other.read_id,
                other.mapq,
            ))
    }
}

impl PartialOrd for PairedEndMappingWithoutBarcode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl MappingRecord for PairedEndMappingWithoutBarcode {
    const HAS_BARCODE: bool = false;
    const IS_PAIRED: bool = true;

    fn read_id(&self) -> u32 {
        self.read_id
    }
    fn barcode(&self) -> u64 {
        0
    }
    fn fragment_start_position(&self) -> u32 {
        self.fragment_start_position
    }
    fn fragment_length(&self) -> u16 {
        self.fragment_length
    }
    fn mapq(&self) -> u8 {
        self.mapq
    }
    fn positive_alignment_length(&self) -> u16 {
        self.positive_alignment_length
    }
    fn negative_alignment_length(&self) -> u16 {
        self.negative_alignment_length
    }

    fn is_dup_of(&self, other: &Self) -> bool {
        self.fragment_start_position == other.fragment_start_position
            && self.fragment_length == other.fragment_length
    }

    fn apply_tn5_shift(&mut self) {
        self.fragment_start_position += 4;
        self.positive_alignment_length -= 4;
        self.fragment_length -= 9;
        self.negative_alignment_length -= 5;
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.read_id.to_le_bytes())?;
        writer.write_all(&self.fragment_start_position.to_le_bytes())?;
        writer.write_all(&self.fragment_length.to_le_bytes())?;
        writer.write_all(&[self.mapq])?;
        writer.write_all(&self.positive_alignment_length.to_le_bytes())?;
        writer.write_all(&self.negative_alignment_length.to_le_bytes())
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(PairedEndMappingWithoutBarcode {
            read_id: read_le!(reader, u32),
            fragment_start_position: read_le!(reader, u32),
            fragment_length: read_le!(reader, u16),
            mapq: read_le!(reader, u8),
            positive_alignment_length: read_le!(reader, u16),
            negative_alignment_length: read_le!(reader, u16),
        })
    }
}

impl PairedEndRecord for PairedEndMappingWithoutBarcode {
    fn new_paired_end(
        read_id: u32,
        _read1_name: &str,
        _read2_name: &str,
        _read1_length: u16,
        _read2_length: u16,
        _barcode: u64,
        fragment_start_position: u32,
        fragment_length: u16,
        mapq: u8,
        positive_alignment_length: u16,
        negative_alignment_length: u16,
    ) -> Self {
        PairedEndMappingWithoutBarcode {
            read_id,
            fragment_start_position,
            fragment_length,
            mapq,
            positive_alignment_length,
            negative_alignment_length,
        }
    }
}

impl Ord for PairedEndMappingWithBarcode {
    fn cmp(&self, other: &Self) -> Ordering {
        (
            self.fragment_start_position,
            self.fragment_length,
            self.barcode,
            self.read_id,
            self.mapq,
        )
            .cmp(&(
                other.fragment_start_position,
                other.fragment_length,
                other.barcode,
                other.read_id,
                other.mapq,
            ))
    }
}

impl PartialOrd for PairedEndMappingWithBarcode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl MappingRecord for PairedEndMappingWithBarcode {
    const HAS_BARCODE: bool = true;
    const IS_PAIRED: bool = true;

    fn read_id(&self) -> u32 {
        self.read_id
    }
    fn barcode(&self) -> u64 {
        self.barcode
    }
    fn fragment_start_position(&self) -> u32 {
        self.fragment_start_position
    }
    fn fragment_length(&self) -> u16 {
        self.fragment_length
    }
    fn mapq(&self) -> u8 {
        self.mapq
    }
    fn positive_alignment_length(&self) -> u16 {
        self.positive_alignment_length
    }
    fn negative_alignment_length(&self) -> u16 {
        self.negative_alignment_length
    }

    fn is_dup_of(&self, other: &Self) -> bool {
        self.fragment_start_position == other.fragment_start_position
            && self.fragment_length == other.fragment_length
            && self.barcode == other.barcode
    }

    fn apply_tn5_shift(&mut self) {
        self.fragment_start_position += 4;
        self.positive_alignment_length -= 4;
        self.fragment_length -= 9;
        self.negative_alignment_length -= 5;
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.read_id.to_le_bytes())?;
        writer.write_all(&self.barcode.to_le_bytes())?;
        writer.write_all(&self.fragment_start_position.to_le_bytes())?;
        writer.write_all(&self.fragment_length.to_le_bytes())?;
        writer.write_all(&[self.mapq])?;
        writer.write_all(&self.positive_alignment_length.to_le_bytes())?;
        writer.write_all(&self.negative_alignment_length.to_le_bytes())
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(PairedEndMappingWithBarcode {
            read_id: read_le!(reader, u32),
            barcode: read_le!(reader, u64),
            fragment_start_position: read_le!(reader, u32),
            fragment_length: read_le!(reader, u16),
            mapq: read_le!(reader, u8),
            positive_alignment_length: read_le!(reader, u16),
            negative_alignment_length: read_le!(reader, u16),
        })
    }
}

impl PairedEndRecord for PairedEndMappingWithBarcode {
    fn new_paired_end(
        read_id: u32,
        _read1_name: &str,
        _read2_name: &str,
        _read1_length: u16,
        _read2_length: u16,
        barcode: u64,
        fragment_start_position: u32,
        fragment_length: u16,
        mapq: u8,
        positive_alignment_length: u16,
        negative_alignment_length: u16,
    ) -> Self {
        PairedEndMappingWithBarcode {
            read_id,
            barcode,
            fragment_start_position,
            fragment_length,
            mapq,
            positive_alignment_length,
            negative_alignment_length,
        }
    }
}

impl Ord for PafMapping {
    fn cmp(&self, other: &Self) -> Ordering {
        (
            self.fragment_start_position,
            self.fragment_length,
            self.read_id,
            self.mapq,
        )
            .cmp(&(
                other.fragment_start_position,
                other.fragment_length,
                other.read_id,
                other.mapq,
            ))
    }
}

impl PartialOrd for PafMapping {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl MappingRecord for PafMapping {
    const HAS_BARCODE: bool = false;
    const IS_PAIRED: bool = false;

    fn read_id(&self) -> u32 {
        self.read_id
    }
    fn barcode(&self) -> u64 {
        0
    }
    fn fragment_start_position(&self) -> u32 {
        self.fragment_start_position
    }
    fn fragment_length(&self) -> u16 {
        self.fragment_length
    }
    fn mapq(&self) -> u8 {
        self.mapq
    }
    fn read_name(&self) -> Option<&str> {
        Some(&self.read_name)
    }
    fn read_length(&self) -> u16 {
        self.read_length
    }

    fn is_dup_of(&self, other: &Self) -> bool {
        self.fragment_start_position == other.fragment_start_position
            && self.fragment_length == other.fragment_length
    }

    fn apply_tn5_shift(&mut self) {
        if self.mapq & 1 == 1 {
            self.fragment_start_position += 4;
            self.fragment_length -= 4;
        } else {
            self.fragment_length -= 5;
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.read_id.to_le_bytes())?;
        write_string(writer, &self.read_name)?;
        writer.write_all(&self.read_length.to_le_bytes())?;
        writer.write_all(&self.fragment_start_position.to_le_bytes())?;
        writer.write_all(&self.fragment_length.to_le_bytes())?;
        writer.write_all(&[self.mapq])
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(PafMapping {
            read_id: read_le!(reader, u32),
            read_name: read_string(reader)?,
            read_length: read_le!(reader, u16),
            fragment_start_position: read_le!(reader, u32),
            fragment_length: read_le!(reader, u16),
            mapq: read_le!(reader, u8),
        })
    }
}

impl SingleEndRecord for PafMapping {
    fn new_single_end(
        read_id: u32,
        read_name: &str,
        read_length: u16,
        _barcode: u64,
        fragment_start_position: u32,
        fragment_length: u16,
        mapq: u8,
    ) -> Self {
        PafMapping {
            read_id,
            read_name: read_name.to_string(),
            read_length,
            fragment_start_position,
            fragment_length,
            mapq,
        }
    }
}

impl Ord for PairedPafMapping {
    fn cmp(&self, other: &Self) -> Ordering {
        (
            self.fragment_start_position,
            self.fragment_length,
            self.read_id,
            self.mapq,
        )
            .cmp(&(
                other.fragment_start_position,
                other.fragment_length,
                other.read_id,
                other.mapq,
            ))
    }
}

impl PartialOrd for PairedPafMapping {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl MappingRecord for PairedPafMapping {
    const HAS_BARCODE: bool = false;
    const IS_PAIRED: bool = true;

    fn read_id(&self) -> u32 {
        self.read_id
    }
    fn barcode(&self) -> u64 {
        0
    }
    fn fragment_start_position(&self) -> u32 {
        self.fragment_start_position
    }
    fn fragment_length(&self) -> u16 {
        self.fragment_length
    }
    fn mapq(&self) -> u8 {
        self.mapq
    }
    fn positive_alignment_length(&self) -> u16 {
        self.positive_alignment_length
    }
    fn negative_alignment_length(&self) -> u16 {
        self.negative_alignment_length
    }
    fn read_name(&self) -> Option<&str> {
        Some(&self.read1_name)
    }
    fn mate_name(&self) -> Option<&str> {
        Some(&self.read2_name)
    }
    fn read_length(&self) -> u16 {
        self.read1_length
    }
    fn mate_length(&self) -> u16 {
        self.read2_length
    }

    fn is_dup_of(&self, other: &Self) -> bool {
        self.fragment_start_position == other.fragment_start_position
            && self.fragment_length == other.fragment_length
    }

    fn apply_tn5_shift(&mut self) {
        self.fragment_start_position += 4;
        self.positive_alignment_length -= 4;
        self.fragment_length -= 9;
        self.negative_alignment_length -= 5;
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.read_id.to_le_bytes())?;
        write_string(writer, &self.read1_name)?;
        write_string(writer, &self.read2_name)?;
        writer.write_all(&self.read1_length.to_le_bytes())?;
        writer.write_all(&self.read2_length.to_le_bytes())?;
        writer.write_all(&self.fragment_start_position.to_le_bytes())?;
        writer.write_all(&self.fragment_length.to_le_bytes())?;
        writer.write_all(&self.positive_alignment_length.to_le_bytes())?;
        writer.write_all(&self.negative_alignment_length.to_le_bytes())?;
        writer.write_all(&[self.mapq])
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(PairedPafMapping {
            read_id: read_le!(reader, u32),
            read1_name: read_string(reader)?,
            read2_name: read_string(reader)?,
            read1_length: read_le!(reader, u16),
            read2_length: read_le!(reader, u16),
            fragment_start_position: read_le!(reader, u32),
            fragment_length: read_le!(reader, u16),
            positive_alignment_length: read_le!(reader, u16),
            negative_alignment_length: read_le!(reader, u16),
            mapq: read_le!(reader, u8),
        })
    }
}

impl PairedEndRecord for PairedPafMapping {
    fn new_paired_end(
        read_id: u32,
        read1_name: &str,
        read2_name: &str,
        read1_length: u16,
        read2_length: u16,
        _barcode: u64,
        fragment_start_position: u32,
        fragment_length: u16,
        mapq: u8,
        positive_alignment_length: u16,
        negative_alignment_length: u16,
    ) -> Self {
        PairedPafMapping {
            read_id,
            read1_name: read1_name.to_string(),
            read2_name: read2_name.to_string(),
            read1_length,
            read2_length,
            fragment_start_position,
            fragment_length,
            positive_alignment_length,
            negative_alignment_length,
            mapq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_order_is_dedupe_order() {
        let a = MappingWithBarcode {
            read_id: 9,
            barcode: 5,
            fragment_start_position: 100,
            fragment_length: 50,
            mapq: 120,
        };
        let b = MappingWithBarcode {
            read_id: 1,
            barcode: 5,
            fragment_start_position: 100,
            fragment_length: 60,
            mapq: 120,
        };
        assert!(a < b);
        let mut records = vec![b.clone(), a.clone()];
        records.sort();
        assert_eq!(records[0], a);
    }

    #[test]
    fn test_dup_relation_ignores_read_id_and_mapq() {
        let a = PairedEndMappingWithBarcode {
            read_id: 1,
            barcode: 7,
            fragment_start_position: 10,
            fragment_length: 200,
            mapq: 120,
            positive_alignment_length: 100,
            negative_alignment_length: 100,
        };
        let mut b = a.clone();
        b.read_id = 2;
        b.mapq = 61;
        assert!(a.is_dup_of(&b));
        b.barcode = 8;
        assert!(!a.is_dup_of(&b));
    }

    #[test]
    fn test_paired_tn5_shift() {
        let mut record = PairedEndMappingWithoutBarcode {
            read_id: 0,
            fragment_start_position: 100,
            fragment_length: 300,
            mapq: 121,
            positive_alignment_length: 100,
            negative_alignment_length: 100,
        };
        record.apply_tn5_shift();
        assert_eq!(record.fragment_start_position, 104);
        assert_eq!(record.fragment_length, 291);
        assert_eq!(record.positive_alignment_length, 96);
        assert_eq!(record.negative_alignment_length, 95);
    }

    #[test]
    fn test_single_end_tn5_shift_depends_on_strand() {
        let mut positive = MappingWithoutBarcode {
            read_id: 0,
            fragment_start_position: 100,
            fragment_length: 50,
            mapq: (60 << 1) | 1,
        };
        positive.apply_tn5_shift();
        assert_eq!(positive.fragment_start_position, 104);
        assert_eq!(positive.fragment_length, 46);

        let mut negative = MappingWithoutBarcode {
            read_id: 0,
            fragment_start_position: 100,
            fragment_length: 50,
            mapq: 60 << 1,
        };
        negative.apply_tn5_shift();
        assert_eq!(negative.fragment_start_position, 100);
        assert_eq!(negative.fragment_length, 45);
    }

    #[test]
    fn test_spill_round_trip() {
        let record = PairedPafMapping {
            read_id: 3,
            read1_name: "r3/1".to_string(),
            read2_name: "r3/2".to_string(),
            read1_length: 100,
            read2_length: 100,
            fragment_start_position: 1234,
            fragment_length: 321,
            positive_alignment_length: 100,
            negative_alignment_length: 99,
            mapq: 121,
        };
        let mut buffer = Vec::new();
        record.write_to(&mut buffer).unwrap();
        let parsed = PairedPafMapping::read_from(&mut buffer.as_slice()).unwrap();
        assert_eq!(parsed, record);
    }
}
