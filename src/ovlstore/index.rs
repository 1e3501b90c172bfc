//! Shared primary-index (`offt`) entry type, store info header, and the gap-filling
//! writer used identically by the sequential builder (§4.4) and the parallel builder's
//! merge stage (§4.5).

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{IoContext, OverlapStoreError, Result};

/// Size of one serialized [`OfftEntry`], in bytes.
pub const SIZE_OFFT_ENTRY: usize = 24;

/// One entry in the overlap store's primary index: maps `a_iid` to the segment and
/// record range holding that read's overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OfftEntry {
    pub a_iid: u32,
    pub fileno: u32,
    pub offset: u32,
    pub num_olaps: u32,
    pub overlap_id: u64,
}

impl OfftEntry {
    #[must_use]
    pub fn to_bytes(self) -> [u8; SIZE_OFFT_ENTRY] {
        let mut buf = [0u8; SIZE_OFFT_ENTRY];
        LittleEndian::write_u32(&mut buf[0..4], self.a_iid);
        LittleEndian::write_u32(&mut buf[4..8], self.fileno);
        LittleEndian::write_u32(&mut buf[8..12], self.offset);
        LittleEndian::write_u32(&mut buf[12..16], self.num_olaps);
        LittleEndian::write_u64(&mut buf[16..24], self.overlap_id);
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8; SIZE_OFFT_ENTRY]) -> Self {
        Self {
            a_iid: LittleEndian::read_u32(&buf[0..4]),
            fileno: LittleEndian::read_u32(&buf[4..8]),
            offset: LittleEndian::read_u32(&buf[8..12]),
            num_olaps: LittleEndian::read_u32(&buf[12..16]),
            overlap_id: LittleEndian::read_u64(&buf[16..24]),
        }
    }
}

/// Writes placeholder `offt` entries with `numOlaps = 0` for every `a_iid` in
/// `[from, to)`, carrying `fileno`/`offset` forward from the trailing real entry and
/// `overlap_id` fixed at the running cumulative count (so the universal invariant
/// `index[i].overlap_id + index[i].num_olaps == index[i+1].overlap_id` holds across the
/// gap: every placeholder contributes zero).
pub fn fill_gap<W: Write>(
    writer: &mut W,
    from: u32,
    to_exclusive: u32,
    fileno: u32,
    offset: u32,
    overlap_id: u64,
) -> Result<()> {
    for a_iid in from..to_exclusive {
        let entry = OfftEntry {
            a_iid,
            fileno,
            offset,
            num_olaps: 0,
            overlap_id,
        };
        writer.write_all(&entry.to_bytes())?;
    }
    Ok(())
}

/// Appends real and gap-filled `offt` entries to an index stream, keeping the running
/// state (last segment location, next expected `a_iid`, cumulative `overlapID`) needed
/// to fill gaps and renumber overlaps contiguously.
pub struct IndexWriter<W: Write> {
    writer: W,
    next_a_iid: u32,
    last_fileno: u32,
    last_offset: u32,
    running_overlap_id: u64,
}

impl<W: Write> IndexWriter<W> {
    #[must_use]
    pub fn new(writer: W, starting_a_iid: u32) -> Self {
        Self {
            writer,
            next_a_iid: starting_a_iid,
            last_fileno: 0,
            last_offset: 0,
            running_overlap_id: 0,
        }
    }

    /// Flushes one real `offt` entry, first filling any gap since the last entry. The
    /// entry's `overlap_id` is assigned here (contiguous numbering), overriding
    /// whatever the caller set.
    pub fn flush_entry(&mut self, mut entry: OfftEntry) -> Result<()> {
        if entry.a_iid < self.next_a_iid {
            return Err(OverlapStoreError::OutOfOrder {
                current: self.next_a_iid,
                got: entry.a_iid,
            }
            .into());
        }
        if entry.a_iid > self.next_a_iid {
            fill_gap(
                &mut self.writer,
                self.next_a_iid,
                entry.a_iid,
                self.last_fileno,
                self.last_offset,
                self.running_overlap_id,
            )?;
        }
        entry.overlap_id = self.running_overlap_id;
        self.writer.write_all(&entry.to_bytes())?;

        self.running_overlap_id += u64::from(entry.num_olaps);
        self.last_fileno = entry.fileno;
        self.last_offset = entry.offset;
        self.next_a_iid = entry.a_iid + 1;
        Ok(())
    }

    #[must_use]
    pub fn running_overlap_id(&self) -> u64 {
        self.running_overlap_id
    }

    #[must_use]
    pub fn next_a_iid(&self) -> u32 {
        self.next_a_iid
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Placeholder magic written at `create` time; only rewritten to [`MAGIC_SEALED`] when
/// the store closes successfully. A store whose `info` still carries the placeholder
/// is a half-built store.
pub const MAGIC_PLACEHOLDER: u32 = 0x0000_0000;
pub const MAGIC_SEALED: u32 = 0x4F56_4C31;
pub const FORMAT_VERSION: u32 = 1;

/// Size of one serialized [`OverlapStoreInfo`], in bytes.
pub const SIZE_INFO_RECORD: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlapStoreInfo {
    pub smallest_id: u32,
    pub largest_id: u32,
    pub num_overlaps: u64,
    pub magic: u32,
    pub version: u32,
    pub record_size: u32,
}

impl OverlapStoreInfo {
    #[must_use]
    pub fn placeholder(record_size: u32) -> Self {
        Self {
            smallest_id: 0,
            largest_id: 0,
            num_overlaps: 0,
            magic: MAGIC_PLACEHOLDER,
            version: FORMAT_VERSION,
            record_size,
        }
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.magic == MAGIC_SEALED
    }

    pub fn seal(&mut self) {
        self.magic = MAGIC_SEALED;
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; SIZE_INFO_RECORD] {
        let mut buf = [0u8; SIZE_INFO_RECORD];
        LittleEndian::write_u32(&mut buf[0..4], self.smallest_id);
        LittleEndian::write_u32(&mut buf[4..8], self.largest_id);
        LittleEndian::write_u64(&mut buf[8..16], self.num_overlaps);
        LittleEndian::write_u32(&mut buf[16..20], self.magic);
        LittleEndian::write_u32(&mut buf[20..24], self.record_size);
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8; SIZE_INFO_RECORD]) -> Self {
        Self {
            smallest_id: LittleEndian::read_u32(&buf[0..4]),
            largest_id: LittleEndian::read_u32(&buf[4..8]),
            num_overlaps: LittleEndian::read_u64(&buf[8..16]),
            magic: LittleEndian::read_u32(&buf[16..20]),
            version: FORMAT_VERSION,
            record_size: LittleEndian::read_u32(&buf[20..24]),
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.to_bytes())?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; SIZE_INFO_RECORD];
        r.read_exact(&mut buf)?;
        Ok(Self::from_bytes(&buf))
    }

    /// Renders the human-readable `info.txt` sibling of the binary `info` file.
    #[must_use]
    pub fn to_text(self) -> String {
        format!(
            "smallestID  {}\nlargestID   {}\nnumOverlaps {}\nsealed      {}\nrecordSize  {}\n",
            self.smallest_id,
            self.largest_id,
            self.num_overlaps,
            self.is_sealed(),
            self.record_size,
        )
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let mut file = std::fs::File::create(path).with_path(path)?;
        self.write_to(&mut file)?;
        let text_path = path.with_extension("txt");
        std::fs::write(&text_path, self.to_text()).with_path(&text_path)?;
        Ok(())
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let mut file = std::fs::File::open(path).with_path(path)?;
        Self::read_from(&mut file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_gaps_and_renumbers_contiguously() {
        let mut buf = Vec::new();
        let mut writer = IndexWriter::new(&mut buf, 1);

        writer
            .flush_entry(OfftEntry {
                a_iid: 1,
                fileno: 1,
                offset: 0,
                num_olaps: 2,
                overlap_id: 0,
            })
            .unwrap();
        writer
            .flush_entry(OfftEntry {
                a_iid: 3,
                fileno: 1,
                offset: 2,
                num_olaps: 2,
                overlap_id: 0,
            })
            .unwrap();
        writer
            .flush_entry(OfftEntry {
                a_iid: 5,
                fileno: 1,
                offset: 4,
                num_olaps: 1,
                overlap_id: 0,
            })
            .unwrap();

        assert_eq!(writer.running_overlap_id(), 5);
        drop(writer);

        let entries: Vec<OfftEntry> = buf
            .chunks(SIZE_OFFT_ENTRY)
            .map(|c| OfftEntry::from_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].a_iid, 1);
        assert_eq!(entries[0].overlap_id, 0);
        assert_eq!(entries[1].a_iid, 2);
        assert_eq!(entries[1].num_olaps, 0);
        assert_eq!(entries[1].overlap_id, 2);
        assert_eq!(entries[2].a_iid, 3);
        assert_eq!(entries[2].overlap_id, 2);
        assert_eq!(entries[3].a_iid, 4);
        assert_eq!(entries[3].overlap_id, 4);
        assert_eq!(entries[4].a_iid, 5);
        assert_eq!(entries[4].overlap_id, 4);
    }

    #[test]
    fn rejects_out_of_order_a_iid() {
        let mut buf = Vec::new();
        let mut writer = IndexWriter::new(&mut buf, 1);
        writer
            .flush_entry(OfftEntry {
                a_iid: 7,
                ..Default::default()
            })
            .unwrap();
        let err = writer.flush_entry(OfftEntry {
            a_iid: 5,
            ..Default::default()
        });
        assert!(err.is_err());
    }

    #[test]
    fn info_round_trips_and_seals() {
        let mut info = OverlapStoreInfo::placeholder(SIZE_OFFT_ENTRY as u32);
        assert!(!info.is_sealed());
        info.seal();
        info.largest_id = 10;
        info.num_overlaps = 42;

        let bytes = info.to_bytes();
        let back = OverlapStoreInfo::from_bytes(&bytes);
        assert_eq!(back.largest_id, 10);
        assert_eq!(back.num_overlaps, 42);
        assert!(back.is_sealed());
    }
}
