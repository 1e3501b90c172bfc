//! Overlap file (§4.3): a stream of fixed-width overlap records, optionally carrying
//! each record's owning read's metadata (`Full` mode, used by bucket files that fan
//! out across partitions) and optionally wrapped in a `zstd` stream.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{IoContext, OverlapFileError, Result};

/// Minimal overlap record: the two read identifiers, their alignment hangs, an error
/// rate, and the flip/orientation flag. Ordered by `(a_iid, b_iid)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OverlapRecord {
    pub a_iid: u32,
    pub b_iid: u32,
    pub a_hang: i32,
    pub b_hang: i32,
    pub evalue: f32,
    pub flipped: bool,
}

/// Size of a record in [`RecordMode::Normal`], in bytes.
pub const SIZE_NORMAL_RECORD: usize = 24;
/// Size of a record in [`RecordMode::Full`]: the normal fields plus the owning read's
/// library identifier, carried so a bucket file can be consumed without a join back to
/// the read store.
pub const SIZE_FULL_RECORD: usize = SIZE_NORMAL_RECORD + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    Normal,
    Full,
}

impl RecordMode {
    #[must_use]
    pub fn record_size(self) -> usize {
        match self {
            RecordMode::Normal => SIZE_NORMAL_RECORD,
            RecordMode::Full => SIZE_FULL_RECORD,
        }
    }
}

impl OverlapRecord {
    fn write_core(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.a_iid);
        LittleEndian::write_u32(&mut buf[4..8], self.b_iid);
        LittleEndian::write_i32(&mut buf[8..12], self.a_hang);
        LittleEndian::write_i32(&mut buf[12..16], self.b_hang);
        LittleEndian::write_f32(&mut buf[16..20], self.evalue);
        buf[20] = u8::from(self.flipped);
        buf[21..24].fill(0);
    }

    fn from_core(buf: &[u8]) -> Self {
        Self {
            a_iid: LittleEndian::read_u32(&buf[0..4]),
            b_iid: LittleEndian::read_u32(&buf[4..8]),
            a_hang: LittleEndian::read_i32(&buf[8..12]),
            b_hang: LittleEndian::read_i32(&buf[12..16]),
            evalue: LittleEndian::read_f32(&buf[16..20]),
            flipped: buf[20] != 0,
        }
    }

    /// Serializes `self` (and, in `Full` mode, `owner_lid`) to a fixed-width buffer.
    #[must_use]
    pub fn to_bytes(self, mode: RecordMode, owner_lid: u32) -> Vec<u8> {
        let mut buf = vec![0u8; mode.record_size()];
        self.write_core(&mut buf[..SIZE_NORMAL_RECORD]);
        if mode == RecordMode::Full {
            LittleEndian::write_u32(&mut buf[SIZE_NORMAL_RECORD..], owner_lid);
        }
        buf
    }

    /// Deserializes a record, returning the owner library id as well (`0` in `Normal`
    /// mode, where it isn't carried).
    #[must_use]
    pub fn from_bytes(buf: &[u8], mode: RecordMode) -> (Self, u32) {
        let record = Self::from_core(buf);
        let owner_lid = if mode == RecordMode::Full {
            LittleEndian::read_u32(&buf[SIZE_NORMAL_RECORD..])
        } else {
            0
        };
        (record, owner_lid)
    }
}

/// Per-read overlap-count histogram: a commutative monoid the store forwards and
/// merges, but never interprets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histogram {
    /// `counts[n]` = number of reads observed with exactly `n` overlaps, saturating the
    /// last bucket for counts beyond `counts.len() - 1`.
    counts: Vec<u64>,
}

const HISTOGRAM_BUCKETS: usize = 4096;

impl Histogram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counts: vec![0; HISTOGRAM_BUCKETS],
        }
    }

    pub fn record(&mut self, num_overlaps: usize) {
        let bucket = num_overlaps.min(self.counts.len() - 1);
        self.counts[bucket] += 1;
    }

    pub fn merge(&mut self, other: &Histogram) {
        if self.counts.len() < other.counts.len() {
            self.counts.resize(other.counts.len(), 0);
        }
        for (a, &b) in self.counts.iter_mut().zip(other.counts.iter()) {
            *a += b;
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, self.counts.len() as u32);
        writer.write_all(&len_buf)?;
        let mut buf = vec![0u8; self.counts.len() * 8];
        for (i, &c) in self.counts.iter().enumerate() {
            LittleEndian::write_u64(&mut buf[i * 8..i * 8 + 8], c);
        }
        writer.write_all(&buf)?;
        Ok(())
    }

    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let n = LittleEndian::read_u32(&len_buf) as usize;
        let mut buf = vec![0u8; n * 8];
        reader.read_exact(&mut buf)?;
        let counts = (0..n)
            .map(|i| LittleEndian::read_u64(&buf[i * 8..i * 8 + 8]))
            .collect();
        Ok(Self { counts })
    }
}

enum Sink {
    Plain(BufWriter<File>),
    Compressed(zstd::Encoder<'static, BufWriter<File>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Compressed(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Compressed(w) => w.flush(),
        }
    }
}

/// A write handle over one overlap file. Per-read overlap counts are the caller's
/// responsibility (the sequential and parallel builders each maintain their own
/// [`Histogram`] directly); this writer only owns the byte stream.
pub struct OverlapFileWriter {
    sink: Sink,
    mode: RecordMode,
    count: u64,
}

impl OverlapFileWriter {
    pub fn create(path: impl AsRef<Path>, mode: RecordMode, compression_level: Option<i32>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).with_path(path)?;
        let sink = match compression_level {
            Some(level) => Sink::Compressed(
                zstd::Encoder::new(BufWriter::new(file), level).with_path(path)?,
            ),
            None => Sink::Plain(BufWriter::new(file)),
        };
        Ok(Self { sink, mode, count: 0 })
    }

    pub fn write_overlap(&mut self, record: OverlapRecord, owner_lid: u32) -> Result<()> {
        let bytes = record.to_bytes(self.mode, owner_lid);
        self.sink
            .write_all(&bytes)
            .map_err(|_| OverlapFileError::ShortWrite)?;
        self.count += 1;
        Ok(())
    }

    #[must_use]
    pub fn record_size(&self) -> usize {
        self.mode.record_size()
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Flushes (and, for a compressed sink, finalizes) the underlying stream, consuming
    /// `self`.
    pub fn finish(self) -> Result<()> {
        match self.sink {
            Sink::Plain(mut w) => w.flush()?,
            Sink::Compressed(w) => {
                w.finish()?;
            }
        }
        Ok(())
    }
}

enum Source {
    Plain(BufReader<File>),
    Compressed(zstd::Decoder<'static, BufReader<File>>),
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Source::Plain(r) => r.read(buf),
            Source::Compressed(r) => r.read(buf),
        }
    }
}

/// A read handle over one overlap file.
pub struct OverlapFileReader {
    source: Source,
    mode: RecordMode,
}

impl OverlapFileReader {
    pub fn open(path: impl AsRef<Path>, mode: RecordMode, compressed: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_path(path)?;
        let source = if compressed {
            Source::Compressed(zstd::Decoder::new(file).with_path(path)?)
        } else {
            Source::Plain(BufReader::new(file))
        };
        Ok(Self { source, mode })
    }

    #[must_use]
    pub fn record_size(&self) -> usize {
        self.mode.record_size()
    }

    /// Reads the next record, or `None` at a clean EOF (no bytes read).
    pub fn read_overlap(&mut self) -> Result<Option<(OverlapRecord, u32)>> {
        let size = self.mode.record_size();
        let mut buf = vec![0u8; size];
        let mut read_total = 0;
        loop {
            let n = self.source.read(&mut buf[read_total..])?;
            if n == 0 {
                break;
            }
            read_total += n;
            if read_total == size {
                break;
            }
        }
        if read_total == 0 {
            return Ok(None);
        }
        if read_total != size {
            return Err(OverlapFileError::ShortRead {
                expected: size,
                got: read_total,
            }
            .into());
        }
        Ok(Some(OverlapRecord::from_bytes(&buf, self.mode)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result as AnyResult;

    #[test]
    fn writes_and_reads_back_normal_records() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("0001");

        let mut writer = OverlapFileWriter::create(&path, RecordMode::Normal, None)?;
        let records = [
            OverlapRecord {
                a_iid: 1,
                b_iid: 2,
                a_hang: 10,
                b_hang: -5,
                evalue: 0.01,
                flipped: false,
            },
            OverlapRecord {
                a_iid: 1,
                b_iid: 3,
                a_hang: -2,
                b_hang: 4,
                evalue: 0.02,
                flipped: true,
            },
        ];
        for r in records {
            writer.write_overlap(r, 0)?;
        }
        writer.finish()?;

        let mut reader = OverlapFileReader::open(&path, RecordMode::Normal, false)?;
        for expected in records {
            let (got, _) = reader.read_overlap()?.expect("record present");
            assert_eq!(got, expected);
        }
        assert!(reader.read_overlap()?.is_none());
        Ok(())
    }

    #[test]
    fn full_mode_round_trips_owner_lid() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bucket");

        let mut writer = OverlapFileWriter::create(&path, RecordMode::Full, None)?;
        let record = OverlapRecord {
            a_iid: 5,
            b_iid: 9,
            a_hang: 0,
            b_hang: 0,
            evalue: 0.1,
            flipped: false,
        };
        writer.write_overlap(record, 7)?;
        writer.finish()?;

        let mut reader = OverlapFileReader::open(&path, RecordMode::Full, false)?;
        let (got, owner_lid) = reader.read_overlap()?.expect("record present");
        assert_eq!(got, record);
        assert_eq!(owner_lid, 7);
        Ok(())
    }

    #[test]
    fn compressed_round_trips() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("0001.zst");

        let mut writer = OverlapFileWriter::create(&path, RecordMode::Normal, Some(3))?;
        let record = OverlapRecord {
            a_iid: 1,
            b_iid: 2,
            a_hang: 1,
            b_hang: 1,
            evalue: 0.05,
            flipped: false,
        };
        writer.write_overlap(record, 0)?;
        writer.finish()?;

        let mut reader = OverlapFileReader::open(&path, RecordMode::Normal, true)?;
        let (got, _) = reader.read_overlap()?.expect("record present");
        assert_eq!(got, record);
        Ok(())
    }

    #[test]
    fn histogram_merges_as_a_monoid() {
        let mut a = Histogram::new();
        a.record(2);
        a.record(2);
        let mut b = Histogram::new();
        b.record(2);
        b.record(5);
        a.merge(&b);
        assert_eq!(a.total(), 4);
    }
}
