//! `ReadData` (§4.2): the decoded view of a single read, bundling raw/corrected/trimmed
//! sequence and quality together with the name, as handed back by `load_read_data`.

use crate::blob::{BlobInput, DecodedBlob};
use crate::readstore::record::{ReadRecord, ReadVersion};

/// A read's decoded payload. `trimmed_seq`/`trimmed_qlt` borrow directly out of
/// `corrected_seq`/`corrected_qlt` (the clear range is always a sub-range of the
/// corrected sequence), so the borrow checker enforces the "trimmed never outlives
/// corrected" invariant instead of leaving it as a documented convention.
#[derive(Debug, Clone)]
pub struct ReadData {
    name: Vec<u8>,
    raw_seq: Vec<u8>,
    raw_qlt: Vec<u8>,
    corrected_seq: Option<Vec<u8>>,
    corrected_qlt: Option<Vec<u8>>,
    clear_bgn: u32,
    clear_end: u32,
    trim_exists: bool,
}

impl ReadData {
    /// Builds a fresh `ReadData` for a read not yet stashed, e.g. freshly parsed from
    /// FASTA/FASTQ. `clear_bgn`/`clear_end` are only meaningful when `corrected_seq` is
    /// `Some`.
    #[must_use]
    pub fn new(
        name: Vec<u8>,
        raw_seq: Vec<u8>,
        raw_qlt: Vec<u8>,
        corrected_seq: Option<Vec<u8>>,
        corrected_qlt: Option<Vec<u8>>,
        clear_bgn: u32,
        clear_end: u32,
    ) -> Self {
        let trim_exists = corrected_seq.is_some() && clear_end > clear_bgn;
        Self {
            name,
            raw_seq,
            raw_qlt,
            corrected_seq,
            corrected_qlt,
            clear_bgn,
            clear_end,
            trim_exists,
        }
    }

    #[must_use]
    pub fn clear_range(&self) -> (u32, u32) {
        (self.clear_bgn, self.clear_end)
    }

    /// Borrows this read's fields into the shape the blob codec encodes.
    #[must_use]
    pub fn as_blob_input(&self) -> BlobInput<'_> {
        BlobInput {
            name: &self.name,
            raw_seq: &self.raw_seq,
            raw_qlt: if self.raw_qlt.is_empty() { None } else { Some(&self.raw_qlt) },
            corrected_seq: self.corrected_seq.as_deref(),
            corrected_qlt: self.corrected_qlt.as_deref(),
        }
    }

    #[must_use]
    pub fn from_decoded(blob: DecodedBlob, record: &ReadRecord) -> Self {
        Self {
            name: blob.name.unwrap_or_default(),
            raw_seq: blob.raw_seq.unwrap_or_default(),
            raw_qlt: blob.raw_qlt.unwrap_or_default(),
            corrected_seq: blob.corrected_seq,
            corrected_qlt: blob.corrected_qlt,
            clear_bgn: record.clear_bgn,
            clear_end: record.clear_end,
            trim_exists: record.t_exists,
        }
    }

    #[must_use]
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    #[must_use]
    pub fn raw_seq(&self) -> &[u8] {
        &self.raw_seq
    }

    #[must_use]
    pub fn raw_qlt(&self) -> &[u8] {
        &self.raw_qlt
    }

    #[must_use]
    pub fn corrected_seq(&self) -> Option<&[u8]> {
        self.corrected_seq.as_deref()
    }

    #[must_use]
    pub fn corrected_qlt(&self) -> Option<&[u8]> {
        self.corrected_qlt.as_deref()
    }

    /// The clear-range slice of `corrected_seq`, or `None` if no trim has been applied
    /// (`t_exists` false, e.g. a corrected-but-untrimmed read with `clear_bgn == clear_end
    /// == 0`, which would otherwise slice to an empty, not missing, trim).
    #[must_use]
    pub fn trimmed_seq(&self) -> Option<&[u8]> {
        if !self.trim_exists {
            return None;
        }
        self.corrected_seq
            .as_deref()
            .map(|s| &s[self.clear_bgn as usize..self.clear_end as usize])
    }

    #[must_use]
    pub fn trimmed_qlt(&self) -> Option<&[u8]> {
        if !self.trim_exists {
            return None;
        }
        self.corrected_qlt
            .as_deref()
            .map(|q| &q[self.clear_bgn as usize..self.clear_end as usize])
    }

    /// Resolves `version` to a sequence slice, falling back toward raw when the
    /// requested derivative doesn't exist.
    #[must_use]
    pub fn sequence(&self, version: ReadVersion) -> &[u8] {
        match version {
            ReadVersion::Raw => &self.raw_seq,
            ReadVersion::Corrected => self.corrected_seq.as_deref().unwrap_or(&self.raw_seq),
            ReadVersion::Trimmed => self.trimmed_seq().unwrap_or(&self.raw_seq),
            ReadVersion::Latest => self
                .trimmed_seq()
                .or(self.corrected_seq.as_deref())
                .unwrap_or(&self.raw_seq),
        }
    }

    #[must_use]
    pub fn quality(&self, version: ReadVersion) -> &[u8] {
        match version {
            ReadVersion::Raw => &self.raw_qlt,
            ReadVersion::Corrected => self.corrected_qlt.as_deref().unwrap_or(&self.raw_qlt),
            ReadVersion::Trimmed => self.trimmed_qlt().unwrap_or(&self.raw_qlt),
            ReadVersion::Latest => self
                .trimmed_qlt()
                .or(self.corrected_qlt.as_deref())
                .unwrap_or(&self.raw_qlt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_clear(bgn: u32, end: u32) -> ReadRecord {
        let mut rec = ReadRecord::empty(1, 0);
        rec.clear_bgn = bgn;
        rec.clear_end = end;
        rec.c_exists = true;
        rec.t_exists = true;
        rec
    }

    #[test]
    fn trimmed_borrows_out_of_corrected() {
        let blob = DecodedBlob {
            name: Some(b"read1".to_vec()),
            raw_seq: Some(b"ACGTACGT".to_vec()),
            raw_qlt: Some(vec![30; 8]),
            corrected_seq: Some(b"ACGTACGT".to_vec()),
            corrected_qlt: Some(vec![35; 8]),
        };
        let record = record_with_clear(2, 6);
        let data = ReadData::from_decoded(blob, &record);

        assert_eq!(data.trimmed_seq(), Some(&b"GTAC"[..]));
        assert_eq!(data.sequence(ReadVersion::Latest), b"GTAC");
        assert_eq!(data.quality(ReadVersion::Latest), &[35u8; 4]);
    }

    #[test]
    fn latest_returns_full_corrected_sequence_when_untrimmed() {
        let blob = DecodedBlob {
            name: Some(b"read3".to_vec()),
            raw_seq: Some(b"ACGTACGT".to_vec()),
            raw_qlt: Some(vec![30; 8]),
            corrected_seq: Some(b"ACGTACGT".to_vec()),
            corrected_qlt: Some(vec![35; 8]),
        };
        // c_exists but not t_exists, clear range left at its zero default.
        let record = ReadRecord {
            c_exists: true,
            t_exists: false,
            ..ReadRecord::empty(3, 0)
        };
        let data = ReadData::from_decoded(blob, &record);

        assert_eq!(data.trimmed_seq(), None);
        assert_eq!(data.sequence(ReadVersion::Latest), b"ACGTACGT");
        assert_eq!(data.quality(ReadVersion::Latest), &[35u8; 8]);
    }

    #[test]
    fn falls_back_when_no_correction_exists() {
        let blob = DecodedBlob {
            name: Some(b"read2".to_vec()),
            raw_seq: Some(b"ACGT".to_vec()),
            raw_qlt: Some(vec![20; 4]),
            corrected_seq: None,
            corrected_qlt: None,
        };
        let record = ReadRecord::empty(2, 0);
        let data = ReadData::from_decoded(blob, &record);

        assert_eq!(data.sequence(ReadVersion::Latest), b"ACGT");
        assert_eq!(data.trimmed_seq(), None);
    }
}
