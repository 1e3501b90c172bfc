//! The 40-byte read record (§3): five 64-bit words, the last one a packed bitfield.
//!
//! Mirrors `gkRead.H`'s field layout exactly, but writes the packed word as a single
//! explicit `u64` with documented bit assignments (byteorder little-endian) instead of
//! relying on C bitfield/compiler packing.

use byteorder::{ByteOrder, LittleEndian};

/// Fixed size of one [`ReadRecord`] on disk, in bytes. Five 64-bit words.
pub const SIZE_READ_RECORD: usize = 40;

const BITS_UNUSED: u32 = 6;
const BITS_C_EXISTS: u32 = 1;
const BITS_T_EXISTS: u32 = 1;
const BITS_M_SEGM: u32 = 13;
const BITS_M_BYTE: u32 = 30;
const BITS_M_PART: u32 = 13;

const _: () = assert!(
    BITS_UNUSED + BITS_C_EXISTS + BITS_T_EXISTS + BITS_M_SEGM + BITS_M_BYTE + BITS_M_PART == 64,
    "ReadRecord packed word bit widths must sum to 64"
);

const MAX_M_SEGM: u32 = (1 << BITS_M_SEGM) - 1;
const MAX_M_BYTE: u64 = (1 << BITS_M_BYTE) - 1;
const MAX_M_PART: u32 = (1 << BITS_M_PART) - 1;

/// Which derivative of a read's sequence is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadVersion {
    /// Trimmed if it exists, else corrected, else raw.
    #[default]
    Latest,
    Raw,
    Corrected,
    Trimmed,
}

/// One fixed-size metadata record, indexed by `rid` so that `reads[rid].rid == rid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadRecord {
    pub rid: u32,
    pub lid: u32,
    pub rseq_len: u32,
    pub cseq_len: u32,
    pub clear_bgn: u32,
    pub clear_end: u32,
    pub blob_len: u32,
    pub c_exists: bool,
    pub t_exists: bool,
    pub m_segm: u32,
    pub m_byte: u64,
    pub m_part: u32,
}

impl ReadRecord {
    /// An unpopulated record reserved by `add_empty_read`, carrying only `rid`/`lid`.
    #[must_use]
    pub fn empty(rid: u32, lid: u32) -> Self {
        Self {
            rid,
            lid,
            ..Default::default()
        }
    }

    /// Length of the read under `version`, following §4.2's `latest` resolution rule.
    #[must_use]
    pub fn sequence_length(&self, version: ReadVersion) -> u32 {
        match version {
            ReadVersion::Raw => self.rseq_len,
            ReadVersion::Corrected => self.cseq_len,
            ReadVersion::Trimmed => self.clear_end - self.clear_bgn,
            ReadVersion::Latest => {
                if self.t_exists {
                    self.clear_end - self.clear_bgn
                } else if self.c_exists {
                    self.cseq_len
                } else {
                    self.rseq_len
                }
            }
        }
    }

    /// Sets the blob pointer fields recorded at `stash_read_data` commit time.
    ///
    /// # Panics
    /// Panics if `segm`/`byte`/`part` exceed their bitfield widths: this is a
    /// programming error (segment/partition counts are bounded by `StoreConfig`),
    /// not an operator-facing condition.
    pub fn set_blob_location(&mut self, segm: u32, byte: u64, part: u32) {
        assert!(segm <= MAX_M_SEGM, "segment index {segm} exceeds 13 bits");
        assert!(byte <= MAX_M_BYTE, "segment byte offset {byte} exceeds 30 bits");
        assert!(part <= MAX_M_PART, "partition index {part} exceeds 13 bits");
        self.m_segm = segm;
        self.m_byte = byte;
        self.m_part = part;
    }

    pub fn to_bytes(self) -> [u8; SIZE_READ_RECORD] {
        let mut buf = [0u8; SIZE_READ_RECORD];
        LittleEndian::write_u32(&mut buf[0..4], self.rid);
        LittleEndian::write_u32(&mut buf[4..8], self.lid);
        LittleEndian::write_u32(&mut buf[8..12], self.rseq_len);
        LittleEndian::write_u32(&mut buf[12..16], self.cseq_len);
        LittleEndian::write_u32(&mut buf[16..20], self.clear_bgn);
        LittleEndian::write_u32(&mut buf[20..24], self.clear_end);
        LittleEndian::write_u32(&mut buf[24..28], self.blob_len);

        let mut packed: u64 = 0;
        let mut shift = 0u32;
        shift += BITS_UNUSED;
        packed |= u64::from(self.c_exists) << shift;
        shift += BITS_C_EXISTS;
        packed |= u64::from(self.t_exists) << shift;
        shift += BITS_T_EXISTS;
        packed |= u64::from(self.m_segm) << shift;
        shift += BITS_M_SEGM;
        packed |= self.m_byte << shift;
        shift += BITS_M_BYTE;
        packed |= u64::from(self.m_part) << shift;
        debug_assert_eq!(shift + BITS_M_PART, 64);

        LittleEndian::write_u64(&mut buf[32..40], packed);
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8; SIZE_READ_RECORD]) -> Self {
        let rid = LittleEndian::read_u32(&buf[0..4]);
        let lid = LittleEndian::read_u32(&buf[4..8]);
        let rseq_len = LittleEndian::read_u32(&buf[8..12]);
        let cseq_len = LittleEndian::read_u32(&buf[12..16]);
        let clear_bgn = LittleEndian::read_u32(&buf[16..20]);
        let clear_end = LittleEndian::read_u32(&buf[20..24]);
        let blob_len = LittleEndian::read_u32(&buf[24..28]);

        let packed = LittleEndian::read_u64(&buf[32..40]);
        let mut shift = 0u32;
        shift += BITS_UNUSED;
        let c_exists = (packed >> shift) & 1 != 0;
        shift += BITS_C_EXISTS;
        let t_exists = (packed >> shift) & 1 != 0;
        shift += BITS_T_EXISTS;
        let m_segm = ((packed >> shift) & u64::from(MAX_M_SEGM)) as u32;
        shift += BITS_M_SEGM;
        let m_byte = (packed >> shift) & MAX_M_BYTE;
        shift += BITS_M_BYTE;
        let m_part = ((packed >> shift) & u64::from(MAX_M_PART)) as u32;

        Self {
            rid,
            lid,
            rseq_len,
            cseq_len,
            clear_bgn,
            clear_end,
            blob_len,
            c_exists,
            t_exists,
            m_segm,
            m_byte,
            m_part,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut rec = ReadRecord::empty(3, 1);
        rec.rseq_len = 150;
        rec.cseq_len = 148;
        rec.clear_bgn = 2;
        rec.clear_end = 140;
        rec.blob_len = 256;
        rec.c_exists = true;
        rec.t_exists = true;
        rec.set_blob_location(5, (1 << 29) + 17, 9);

        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), SIZE_READ_RECORD);
        let back = ReadRecord::from_bytes(&bytes);
        assert_eq!(rec, back);
    }

    #[test]
    fn latest_prefers_trimmed_then_corrected_then_raw() {
        let mut rec = ReadRecord::empty(1, 0);
        rec.rseq_len = 100;
        assert_eq!(rec.sequence_length(ReadVersion::Latest), 100);

        rec.cseq_len = 90;
        rec.c_exists = true;
        assert_eq!(rec.sequence_length(ReadVersion::Latest), 90);

        rec.clear_bgn = 10;
        rec.clear_end = 80;
        rec.t_exists = true;
        assert_eq!(rec.sequence_length(ReadVersion::Latest), 70);
    }

    #[test]
    fn empty_record_is_a_valid_zero_length_slot() {
        let rec = ReadRecord::default();
        assert_eq!(rec.sequence_length(ReadVersion::Latest), 0);
        let bytes = rec.to_bytes();
        assert_eq!(ReadRecord::from_bytes(&bytes), rec);
    }
}
