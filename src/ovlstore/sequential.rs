//! Sequential overlap store builder (§4.4): consumes a globally sorted stream of
//! overlap records and emits data segments, a primary index, and an info header.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::{default_overlap_segment_records, StoreConfig};
use crate::error::{IoContext, OverlapStoreError, Result};
use crate::ovlfile::{Histogram, OverlapFileWriter, OverlapRecord, RecordMode, SIZE_NORMAL_RECORD};
use crate::ovlstore::index::{IndexWriter, OfftEntry, OverlapStoreInfo};

fn segment_name(fileno: u32) -> String {
    format!("{fileno:04}")
}

struct CurrentGroup {
    a_iid: u32,
    fileno: u32,
    offset: u32,
    count: u32,
}

/// Builds an overlap store from a single, totally ordered input stream.
pub struct SequentialOverlapBuilder {
    dir: PathBuf,
    record_mode: RecordMode,
    records_per_segment: usize,
    compression_level: Option<i32>,
    fileno: u32,
    records_in_segment: usize,
    segment_writer: Option<OverlapFileWriter>,
    group: Option<CurrentGroup>,
    index_writer: IndexWriter<BufWriter<File>>,
    histogram: Histogram,
    total_overlaps: u64,
    smallest_id: Option<u32>,
    largest_id: u32,
}

impl SequentialOverlapBuilder {
    /// Creates a new overlap store at `dir`, which must not already exist.
    pub fn create(dir: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if dir.exists() {
            return Err(OverlapStoreError::StoreExists(dir).into());
        }
        fs::create_dir_all(&dir).with_path(&dir)?;

        let record_mode = RecordMode::Normal;
        let placeholder = OverlapStoreInfo::placeholder(record_mode.record_size() as u32);
        let info_path = dir.join("info");
        placeholder.save(&info_path)?;

        let index_path = dir.join("index");
        let index_file = File::create(&index_path).with_path(&index_path)?;
        let index_writer = IndexWriter::new(BufWriter::new(index_file), 1);

        Ok(Self {
            dir,
            record_mode,
            records_per_segment: default_overlap_segment_records(SIZE_NORMAL_RECORD),
            compression_level: config.compression_level(),
            fileno: 0,
            records_in_segment: 0,
            segment_writer: None,
            group: None,
            index_writer,
            histogram: Histogram::new(),
            total_overlaps: 0,
            smallest_id: None,
            largest_id: 0,
        })
    }

    fn roll_segment(&mut self) -> Result<()> {
        if let Some(writer) = self.segment_writer.take() {
            writer.finish()?;
        }
        self.fileno += 1;
        self.records_in_segment = 0;
        let path = self.dir.join(segment_name(self.fileno));
        self.segment_writer = Some(OverlapFileWriter::create(&path, self.record_mode, self.compression_level)?);
        Ok(())
    }

    fn flush_group(&mut self) -> Result<()> {
        let Some(group) = self.group.take() else {
            return Ok(());
        };
        self.histogram.record(group.count as usize);
        self.index_writer.flush_entry(OfftEntry {
            a_iid: group.a_iid,
            fileno: group.fileno,
            offset: group.offset,
            num_olaps: group.count,
            overlap_id: 0,
        })?;
        self.total_overlaps += u64::from(group.count);
        self.largest_id = group.a_iid;
        Ok(())
    }

    /// Feeds one more overlap record. Records must arrive with non-decreasing `a_iid`.
    pub fn write_overlap(&mut self, record: OverlapRecord) -> Result<()> {
        if let Some(group) = &self.group {
            if record.a_iid < group.a_iid {
                return Err(OverlapStoreError::OutOfOrder {
                    current: group.a_iid,
                    got: record.a_iid,
                }
                .into());
            }
        }

        let starting_new_group = self.group.as_ref().map(|g| g.a_iid) != Some(record.a_iid);
        if starting_new_group {
            self.flush_group()?;
            if self.segment_writer.is_none() || self.records_in_segment >= self.records_per_segment {
                self.roll_segment()?;
            }
            self.smallest_id.get_or_insert(record.a_iid);
            self.group = Some(CurrentGroup {
                a_iid: record.a_iid,
                fileno: self.fileno,
                offset: self.records_in_segment as u32,
                count: 0,
            });
        }

        self.segment_writer
            .as_mut()
            .expect("segment opened by roll_segment")
            .write_overlap(record, 0)?;
        self.records_in_segment += 1;
        self.group.as_mut().expect("group just set").count += 1;
        Ok(())
    }

    /// Flushes the final group, writes the info header and histogram, and seals the
    /// store.
    pub fn close(mut self) -> Result<OverlapStoreInfo> {
        self.flush_group()?;
        if let Some(writer) = self.segment_writer.take() {
            writer.finish()?;
        }
        self.index_writer.into_inner().flush()?;

        let mut info = OverlapStoreInfo::placeholder(self.record_mode.record_size() as u32);
        info.smallest_id = self.smallest_id.unwrap_or(0);
        info.largest_id = self.largest_id;
        info.num_overlaps = self.total_overlaps;
        info.seal();
        info.save(&self.dir.join("info"))?;

        let hist_path = self.dir.join("histogram");
        let mut hist_file = File::create(&hist_path).with_path(&hist_path)?;
        self.histogram.write_bytes(&mut hist_file)?;

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result as AnyResult;

    fn overlap(a: u32, b: u32) -> OverlapRecord {
        OverlapRecord {
            a_iid: a,
            b_iid: b,
            a_hang: 0,
            b_hang: 0,
            evalue: 0.0,
            flipped: false,
        }
    }

    #[test]
    fn matches_the_worked_example() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let store_path = dir.path().join("store");
        let config = StoreConfig::default();
        let mut builder = SequentialOverlapBuilder::create(&store_path, &config)?;

        for (a, b) in [(1, 2), (1, 3), (3, 1), (3, 2), (5, 4)] {
            builder.write_overlap(overlap(a, b))?;
        }
        let info = builder.close()?;

        assert_eq!(info.smallest_id, 1);
        assert_eq!(info.largest_id, 5);
        assert_eq!(info.num_overlaps, 5);
        assert!(info.is_sealed());

        let index_bytes = fs::read(store_path.join("index"))?;
        use crate::ovlstore::index::SIZE_OFFT_ENTRY;
        let entries: Vec<OfftEntry> = index_bytes
            .chunks(SIZE_OFFT_ENTRY)
            .map(|c| OfftEntry::from_bytes(c.try_into().unwrap()))
            .collect();
        let nums: Vec<u32> = entries.iter().map(|e| e.num_olaps).collect();
        assert_eq!(nums, vec![2, 0, 2, 0, 1]);
        let overlap_ids: Vec<u64> = entries.iter().map(|e| e.overlap_id).collect();
        assert_eq!(overlap_ids, vec![0, 2, 2, 4, 4]);
        Ok(())
    }

    #[test]
    fn rejects_out_of_order_writes() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let config = StoreConfig::default();
        let mut builder = SequentialOverlapBuilder::create(dir.path().join("store"), &config)?;
        builder.write_overlap(overlap(7, 1))?;
        let err = builder.write_overlap(overlap(5, 1));
        assert!(err.is_err());
        Ok(())
    }
}
