//! Parallel overlap store builder (§4.5): bucket-shuffle, per-slice sort, and merge.
//!
//! Each stage here corresponds to one external process invocation in the original
//! pipeline; nothing in this module assumes they run in the same process, only that
//! a later stage observes the file-level effects of an earlier one (the pipeline's
//! happens-before is the job scheduler's, not ours).

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::{IoContext, OverlapStoreError, Result};
use crate::ovlfile::{Histogram, OverlapFileReader, OverlapFileWriter, OverlapRecord, RecordMode};
use crate::ovlstore::index::{IndexWriter, OfftEntry, OverlapStoreInfo, SIZE_OFFT_ENTRY};

fn bucket_dir(root: &Path, job_idx: u32) -> PathBuf {
    root.join(format!("bucket{job_idx}"))
}

fn slice_sizes_path(root: &Path, job_idx: u32) -> PathBuf {
    bucket_dir(root, job_idx).join("sliceSizes")
}

fn slice_bucket_path(root: &Path, job_idx: u32, slice: u32, compressed: bool) -> PathBuf {
    let name = format!("slice{slice}");
    let name = if compressed { format!("{name}.zst") } else { name };
    bucket_dir(root, job_idx).join(name)
}

fn segment_name(fileno: u32) -> String {
    format!("{fileno:04}")
}

// ------------------------------------------------------------------------------------
// Stage 1: bucket writer (one per producer job)
// ------------------------------------------------------------------------------------

/// Fans a producer's unsorted overlap stream out into one bucket file per destination
/// slice, plus the `sliceSizes` count table the sort stage relies on.
pub struct BucketWriter {
    root: PathBuf,
    job_idx: u32,
    file_limit: u32,
    compression_level: Option<i32>,
    writers: Vec<Option<OverlapFileWriter>>,
    counts: Vec<u64>,
}

impl BucketWriter {
    pub fn create(root: impl AsRef<Path>, job_idx: u32, file_limit: u32, config: &StoreConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let dir = bucket_dir(&root, job_idx);
        fs::create_dir_all(&dir).with_path(&dir)?;
        Ok(Self {
            root,
            job_idx,
            file_limit,
            compression_level: config.compression_level(),
            writers: (0..=file_limit).map(|_| None).collect(),
            counts: vec![0; (file_limit + 1) as usize],
        })
    }

    /// Appends one overlap record, tagged with its owning read's library id, to the
    /// bucket file for `slice`.
    pub fn write_overlap(&mut self, slice: u32, record: OverlapRecord, owner_lid: u32) -> Result<()> {
        assert!(slice >= 1 && slice <= self.file_limit, "slice out of range");
        if self.writers[slice as usize].is_none() {
            let path = slice_bucket_path(&self.root, self.job_idx, slice, self.compression_level.is_some());
            self.writers[slice as usize] =
                Some(OverlapFileWriter::create(&path, RecordMode::Full, self.compression_level)?);
        }
        self.writers[slice as usize]
            .as_mut()
            .expect("just created")
            .write_overlap(record, owner_lid)?;
        self.counts[slice as usize] += 1;
        Ok(())
    }

    /// Flushes every slice's bucket file and writes `sliceSizes`. Bucket files carry no
    /// histogram of their own; per-read overlap counts are only meaningful once a slice
    /// is sorted and assembled into its final segment (see `sort_and_emit_slice`).
    pub fn close(self) -> Result<()> {
        for writer in self.writers.into_iter().flatten() {
            writer.finish()?;
        }
        let sizes_path = slice_sizes_path(&self.root, self.job_idx);
        let mut file = File::create(&sizes_path).with_path(&sizes_path)?;
        let mut buf = vec![0u8; self.counts.len() * 8];
        for (i, &c) in self.counts.iter().enumerate() {
            LittleEndian::write_u64(&mut buf[i * 8..i * 8 + 8], c);
        }
        file.write_all(&buf)?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------
// Stage 2: per-slice sort
// ------------------------------------------------------------------------------------

fn load_one_bucket_size(root: &Path, job_idx: u32, slice: u32, file_limit: u32) -> Result<Option<u64>> {
    let path = slice_sizes_path(root, job_idx);
    if !path.exists() {
        return Ok(None);
    }
    let mut file = File::open(&path).with_path(&path)?;
    let mut buf = vec![0u8; 8 * (file_limit as usize + 1)];
    file.read_exact(&mut buf).with_path(&path)?;
    Ok(Some(LittleEndian::read_u64(
        &buf[slice as usize * 8..slice as usize * 8 + 8],
    )))
}

/// Sums every producer job's claimed record count for `slice`, tolerating a wholly
/// missing `sliceSizes` file as a zero contribution.
pub fn load_bucket_sizes(root: &Path, slice: u32, job_idx_max: u32, file_limit: u32) -> Result<u64> {
    let mut total = 0u64;
    for job_idx in 1..=job_idx_max {
        total += load_one_bucket_size(root, job_idx, slice, file_limit)?.unwrap_or(0);
    }
    Ok(total)
}

fn load_overlaps_from_slice(
    root: &Path,
    slice: u32,
    job_idx_max: u32,
    file_limit: u32,
) -> Result<Vec<(OverlapRecord, u32)>> {
    let mut out = Vec::new();
    for job_idx in 1..=job_idx_max {
        let Some(claimed) = load_one_bucket_size(root, job_idx, slice, file_limit)? else {
            continue;
        };
        if claimed == 0 {
            continue;
        }
        let plain = slice_bucket_path(root, job_idx, slice, false);
        let compressed = slice_bucket_path(root, job_idx, slice, true);
        let (path, is_compressed) = if plain.exists() {
            (plain, false)
        } else if compressed.exists() {
            (compressed, true)
        } else {
            return Err(OverlapStoreError::MissingBucket {
                slice,
                job: job_idx,
                claimed,
            }
            .into());
        };

        let mut reader = OverlapFileReader::open(&path, RecordMode::Full, is_compressed)?;
        let mut actual = 0u64;
        while let Some(entry) = reader.read_overlap()? {
            out.push(entry);
            actual += 1;
        }
        if actual != claimed {
            return Err(OverlapStoreError::BucketSizeMismatch {
                slice,
                job: job_idx,
                claimed,
                actual,
            }
            .into());
        }
    }
    Ok(out)
}

/// Splits `records` into `num_threads` contiguous chunks, sorts each chunk on its own
/// thread (the teacher's `process_parallel` division of work by `div_ceil`, here
/// applied to a slice instead of a record range), then merges the now-sorted chunks
/// with a k-way min-heap merge.
fn parallel_sort_by_key(records: &mut Vec<(OverlapRecord, u32)>, num_threads: usize) {
    let len = records.len();
    if len < 2 || num_threads <= 1 {
        records.sort_by_key(|(r, _)| (r.a_iid, r.b_iid));
        return;
    }
    let num_threads = num_threads.min(len);
    let chunk_len = len.div_ceil(num_threads);

    std::thread::scope(|scope| {
        for chunk in records.chunks_mut(chunk_len) {
            scope.spawn(move || chunk.sort_by_key(|(r, _)| (r.a_iid, r.b_iid)));
        }
    });

    *records = merge_sorted_chunks(records, chunk_len);
}

fn merge_sorted_chunks(records: &[(OverlapRecord, u32)], chunk_len: usize) -> Vec<(OverlapRecord, u32)> {
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    let chunks: Vec<&[(OverlapRecord, u32)]> = records.chunks(chunk_len).collect();
    let mut cursors = vec![0usize; chunks.len()];
    let mut heap: BinaryHeap<Reverse<((u32, u32), usize)>> = BinaryHeap::new();
    for (ci, chunk) in chunks.iter().enumerate() {
        if let Some((r, _)) = chunk.first() {
            heap.push(Reverse(((r.a_iid, r.b_iid), ci)));
        }
    }

    let mut out = Vec::with_capacity(records.len());
    while let Some(Reverse((_, ci))) = heap.pop() {
        let idx = cursors[ci];
        out.push(chunks[ci][idx]);
        cursors[ci] += 1;
        if let Some((r, _)) = chunks[ci].get(cursors[ci]) {
            heap.push(Reverse(((r.a_iid, r.b_iid), ci)));
        }
    }
    out
}

/// Loads, sorts, and emits one slice's data segment, per-slice index, and per-slice
/// info file. An all-empty slice still produces a valid (empty) segment and info
/// entry. The sort itself runs as a fork-join split across `config.reader_threads()`
/// threads, matching the teacher's `process_parallel` pool sizing.
pub fn sort_and_emit_slice(root: &Path, slice: u32, job_idx_max: u32, file_limit: u32, config: &StoreConfig) -> Result<()> {
    let mut records = load_overlaps_from_slice(root, slice, job_idx_max, file_limit)?;
    parallel_sort_by_key(&mut records, config.reader_threads());
    info!(slice, count = records.len(), "sorted slice");

    let segment_path = root.join(segment_name(slice));
    let mut segment_writer = OverlapFileWriter::create(&segment_path, RecordMode::Normal, config.compression_level())?;
    let index_path = root.join(format!("{}.index", segment_name(slice)));
    let index_file = File::create(&index_path).with_path(&index_path)?;
    let starting_a_iid = records.first().map_or(0, |(r, _)| r.a_iid);
    let mut index_writer = IndexWriter::new(BufWriter::new(index_file), starting_a_iid);

    let mut histogram = Histogram::new();
    let mut smallest = None;
    let mut largest = 0;
    let mut offset_in_segment = 0u32;
    let mut i = 0;
    while i < records.len() {
        let a_iid = records[i].0.a_iid;
        let group_start = offset_in_segment;
        let mut count = 0u32;
        while i < records.len() && records[i].0.a_iid == a_iid {
            segment_writer.write_overlap(records[i].0, 0)?;
            offset_in_segment += 1;
            count += 1;
            i += 1;
        }
        histogram.record(count as usize);
        index_writer.flush_entry(OfftEntry {
            a_iid,
            fileno: slice,
            offset: group_start,
            num_olaps: count,
            overlap_id: 0,
        })?;
        smallest.get_or_insert(a_iid);
        largest = a_iid;
    }

    index_writer.into_inner().flush()?;
    segment_writer.finish()?;

    let mut info = OverlapStoreInfo::placeholder(RecordMode::Normal.record_size() as u32);
    info.smallest_id = smallest.unwrap_or(0);
    info.largest_id = largest;
    info.num_overlaps = records.len() as u64;
    info.save(&root.join(format!("{}.info", segment_name(slice))))?;

    let hist_path = root.join(format!("{}.histogram", segment_name(slice)));
    let mut hist_file = File::create(&hist_path).with_path(&hist_path)?;
    histogram.write_bytes(&mut hist_file)?;

    Ok(())
}

// ------------------------------------------------------------------------------------
// Stage 3: merge
// ------------------------------------------------------------------------------------

/// Splices every slice's per-slice index into one global index, renumbering
/// `overlap_id` contiguously and padding inter-slice gaps, by streaming each slice's
/// already gap-filled entries through a single [`IndexWriter`].
pub fn merge_slices(root: &Path, file_limit: u32) -> Result<OverlapStoreInfo> {
    let index_path = root.join("index");
    let index_file = File::create(&index_path).with_path(&index_path)?;
    let mut writer = IndexWriter::new(BufWriter::new(index_file), 0);

    let mut histogram = Histogram::new();
    let mut merged_smallest = None;
    let mut merged_largest = 0u32;
    let mut merged_count = 0u64;

    for slice in 1..=file_limit {
        let info_path = root.join(format!("{}.info", segment_name(slice)));
        if !info_path.exists() {
            continue;
        }
        let slice_info = OverlapStoreInfo::load(&info_path)?;
        if slice_info.num_overlaps == 0 {
            continue;
        }
        merged_smallest.get_or_insert(slice_info.smallest_id);
        merged_largest = slice_info.largest_id;
        merged_count += slice_info.num_overlaps;

        let idx_path = root.join(format!("{}.index", segment_name(slice)));
        let mut idx_file = BufReader::new(File::open(&idx_path).with_path(&idx_path)?);
        let mut buf = [0u8; SIZE_OFFT_ENTRY];
        loop {
            match idx_file.read_exact(&mut buf) {
                Ok(()) => writer.flush_entry(OfftEntry::from_bytes(&buf))?,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }

        let hist_path = root.join(format!("{}.histogram", segment_name(slice)));
        if hist_path.exists() {
            let mut f = File::open(&hist_path).with_path(&hist_path)?;
            histogram.merge(&Histogram::from_reader(&mut f)?);
        }
    }

    writer.into_inner().flush()?;

    let mut info = OverlapStoreInfo::placeholder(RecordMode::Normal.record_size() as u32);
    info.smallest_id = merged_smallest.unwrap_or(0);
    info.largest_id = merged_largest;
    info.num_overlaps = merged_count;
    info.seal();
    info.save(&root.join("info"))?;

    let hist_path = root.join("histogram");
    let mut hist_file = File::create(&hist_path).with_path(&hist_path)?;
    histogram.write_bytes(&mut hist_file)?;

    Ok(info)
}

// ------------------------------------------------------------------------------------
// Stage 4: cleanup
// ------------------------------------------------------------------------------------

/// Deletes per-slice intermediates and the bucket tree. The bucket scan stops after
/// ten consecutive missing `bucket{N}` directories (buckets are 1-indexed and may have
/// gaps if a producer job failed cleanly without writing anything).
const CONSECUTIVE_MISSING_BUCKET_LIMIT: u32 = 10;

pub fn remove_all_intermediate_files(root: &Path, file_limit: u32) -> Result<()> {
    for slice in 1..=file_limit {
        let _ = fs::remove_file(root.join(format!("{}.info", segment_name(slice))));
        let _ = fs::remove_file(root.join(format!("{}.index", segment_name(slice))));
        let _ = fs::remove_file(root.join(format!("{}.histogram", segment_name(slice))));
    }

    let mut job_idx = 1u32;
    let mut consecutive_missing = 0u32;
    while consecutive_missing < CONSECUTIVE_MISSING_BUCKET_LIMIT {
        let dir = bucket_dir(root, job_idx);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_path(&dir)?;
            consecutive_missing = 0;
        } else {
            consecutive_missing += 1;
        }
        job_idx += 1;
    }
    Ok(())
}

// ------------------------------------------------------------------------------------
// Consistency check
// ------------------------------------------------------------------------------------

/// Walks the global `index`, checking that `a_iid` is contiguous from the first entry
/// and that `overlap_id` running totals agree with `numOlaps`. In fix mode, writes a
/// corrected copy to `index.fixed` instead of failing.
pub fn verify_index(path: &Path, fix: bool) -> Result<bool> {
    let bytes = fs::read(path).with_path(path)?;
    let entries: Vec<OfftEntry> = bytes
        .chunks(SIZE_OFFT_ENTRY)
        .map(|c| OfftEntry::from_bytes(c.try_into().expect("index file is a multiple of entry size")))
        .collect();

    let mut ok = true;
    let mut fixed = Vec::with_capacity(entries.len());
    let mut next_a_iid = entries.first().map_or(0, |e| e.a_iid);
    let mut running = 0u64;
    let mut last_fileno = 0;
    let mut last_offset = 0;

    for (i, entry) in entries.iter().enumerate() {
        if entry.a_iid != next_a_iid {
            ok = false;
            warn!(index = i, expected = next_a_iid, found = entry.a_iid, "index gap");
            if !fix {
                return Err(OverlapStoreError::IndexGap {
                    index: i as u32,
                    expected: next_a_iid,
                    found: entry.a_iid,
                }
                .into());
            }
        }
        if entry.overlap_id != running {
            ok = false;
            if !fix {
                return Err(OverlapStoreError::OverlapCountMismatch {
                    indexed: entry.overlap_id,
                    recorded: running,
                }
                .into());
            }
        }

        let (fileno, offset) = if entry.num_olaps > 0 {
            (entry.fileno, entry.offset)
        } else {
            (last_fileno, last_offset)
        };
        fixed.push(OfftEntry {
            a_iid: next_a_iid,
            fileno,
            offset,
            num_olaps: entry.num_olaps,
            overlap_id: running,
        });
        running += u64::from(entry.num_olaps);
        if entry.num_olaps > 0 {
            last_fileno = entry.fileno;
            last_offset = entry.offset;
        }
        next_a_iid += 1;
    }

    if fix {
        let fixed_path = path.with_extension("fixed");
        let mut file = File::create(&fixed_path).with_path(&fixed_path)?;
        for entry in fixed {
            file.write_all(&entry.to_bytes())?;
        }
    }

    Ok(ok)
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
    fn matches_the_empty_slice_worked_example() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        let file_limit = 3;
        let job_idx_max = 2;

        let config = StoreConfig::default();
        let mut bucket1 = BucketWriter::create(root, 1, file_limit, &config)?;
        for a in 1..=100u32 {
            bucket1.write_overlap(1, overlap(a, a + 1), 0)?;
        }
        bucket1.close()?;

        let mut bucket2 = BucketWriter::create(root, 2, file_limit, &config)?;
        for a in 200..250u32 {
            bucket2.write_overlap(3, overlap(a, a + 1), 0)?;
        }
        bucket2.close()?;

        for slice in 1..=file_limit {
            sort_and_emit_slice(root, slice, job_idx_max, file_limit, &config)?;
        }

        // slice 2 had no contributions from either bucket: still produces a valid,
        // empty segment + info entry.
        assert!(root.join("0002").exists());
        let info2 = OverlapStoreInfo::load(&root.join("0002.info"))?;
        assert_eq!(info2.num_overlaps, 0);

        let merged = merge_slices(root, file_limit)?;
        assert_eq!(merged.num_overlaps, 150);
        assert!(merged.is_sealed());

        assert!(verify_index(&root.join("index"), false)?);

        remove_all_intermediate_files(root, file_limit)?;
        assert!(!root.join("0001.index").exists());
        assert!(!root.join("bucket1").exists());
        assert!(!root.join("bucket2").exists());
        // final data segments are not intermediate and must survive cleanup.
        assert!(root.join("0001").exists());

        Ok(())
    }

    #[test]
    fn missing_bucket_file_with_nonzero_claim_is_an_error() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        let sizes_path = slice_sizes_path(root, 1);
        fs::create_dir_all(sizes_path.parent().unwrap())?;
        let mut buf = vec![0u8; 8 * 4];
        LittleEndian::write_u64(&mut buf[8..16], 5);
        fs::write(&sizes_path, buf)?;

        let err = sort_and_emit_slice(root, 1, 1, 3, &StoreConfig::default());
        assert!(err.is_err());
        Ok(())
    }

    #[test]
    fn parallel_sort_matches_sequential_sort_across_thread_counts() {
        let input: Vec<(OverlapRecord, u32)> = (0..500u32)
            .rev()
            .map(|a| (overlap(a % 37, a), 0))
            .collect();

        let mut sequential = input.clone();
        sequential.sort_by_key(|(r, _)| (r.a_iid, r.b_iid));

        for num_threads in [1, 2, 3, 8, 64] {
            let mut actual = input.clone();
            parallel_sort_by_key(&mut actual, num_threads);
            assert_eq!(actual, sequential, "mismatch at num_threads={num_threads}");
        }
    }
}
