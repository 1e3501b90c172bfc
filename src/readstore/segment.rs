//! Blob segment files (§4.1): `blobs.NNNN`, capped so that `m_byte` (30 bits) stays
//! valid. A segment is rolled over *before* a write would push it past the cap, so no
//! read's chunk group ever straddles a segment boundary.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use tracing::debug;

use crate::error::{IoContext, Result};

#[must_use]
pub fn segment_path(dir: &Path, segm: u32) -> PathBuf {
    dir.join(format!("blobs.{segm:04}"))
}

/// Append-only writer over a sequence of capped segment files.
pub struct SegmentWriter {
    dir: PathBuf,
    cap: u64,
    current_segm: u32,
    current_len: u64,
    file: Option<File>,
}

impl SegmentWriter {
    #[must_use]
    pub fn new(dir: PathBuf, cap: u64) -> Self {
        Self {
            dir,
            cap,
            current_segm: 0,
            current_len: 0,
            file: None,
        }
    }

    /// Writes `bytes` as a single, non-splittable unit, rolling to a new segment first
    /// if the current one would overflow. Returns `(segment, byte_offset)` for the
    /// caller to stash into the owning read record.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(u32, u64)> {
        let needed = bytes.len() as u64;
        if self.file.is_none() || self.current_len + needed > self.cap {
            self.roll()?;
        }
        let offset = self.current_len;
        let segm = self.current_segm;
        let path = segment_path(&self.dir, segm);
        self.file
            .as_mut()
            .expect("segment opened by roll()")
            .write_all(bytes)
            .with_path(&path)?;
        self.current_len += needed;
        Ok((segm, offset))
    }

    fn roll(&mut self) -> Result<()> {
        self.current_segm += 1;
        self.current_len = 0;
        let path = segment_path(&self.dir, self.current_segm);
        debug!(segment = self.current_segm, path = %path.display(), "rolling to new blob segment");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_path(&path)?;
        self.file = Some(file);
        Ok(())
    }

    #[must_use]
    pub fn segments_used(&self) -> u32 {
        self.current_segm
    }

    /// Resumes appending to the highest-numbered segment already present in `dir`
    /// (used by `extend` mode, where writes continue after a prior close).
    pub fn resume(dir: PathBuf, cap: u64) -> Result<Self> {
        let mut highest = 0u32;
        if dir.exists() {
            for entry in std::fs::read_dir(&dir).with_path(&dir)? {
                let entry = entry.with_path(&dir)?;
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(suffix) = name.strip_prefix("blobs.") {
                        if let Ok(n) = suffix.parse::<u32>() {
                            highest = highest.max(n);
                        }
                    }
                }
            }
        }
        if highest == 0 {
            return Ok(Self::new(dir, cap));
        }
        let path = segment_path(&dir, highest);
        let current_len = std::fs::metadata(&path).with_path(&path)?.len();
        let file = OpenOptions::new().append(true).open(&path).with_path(&path)?;
        Ok(Self {
            dir,
            cap,
            current_segm: highest,
            current_len,
            file: Some(file),
        })
    }
}

/// Thread-shared pool of memory-mapped segment views, opened lazily and cached, so
/// concurrent readers never re-map the same segment.
pub struct SegmentPool {
    dir: PathBuf,
    mmaps: Mutex<HashMap<u32, Arc<Mmap>>>,
}

impl SegmentPool {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            mmaps: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, segm: u32) -> Result<Arc<Mmap>> {
        let mut guard = self.mmaps.lock().expect("segment pool mutex poisoned");
        if let Some(mmap) = guard.get(&segm) {
            return Ok(Arc::clone(mmap));
        }
        let path = segment_path(&self.dir, segm);
        let file = File::open(&path).with_path(&path)?;
        // SAFETY: segment files are never truncated or mutated in place while mapped;
        // the store is the sole writer and only ever appends.
        let mmap = unsafe { Mmap::map(&file) }.with_path(&path)?;
        let mmap = Arc::new(mmap);
        guard.insert(segm, Arc::clone(&mmap));
        Ok(mmap)
    }

    pub fn read_at(&self, segm: u32, byte: u64, len: usize) -> Result<Vec<u8>> {
        let mmap = self.get(segm)?;
        let start = byte as usize;
        let end = start + len;
        if end > mmap.len() {
            return Err(crate::error::BlobError::ShortRead {
                expected: len,
                got: mmap.len().saturating_sub(start),
            }
            .into());
        }
        Ok(mmap[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolls_over_when_cap_would_be_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::new(dir.path().to_path_buf(), 10);
        let (s1, o1) = writer.write(&[1, 2, 3, 4]).unwrap();
        let (s2, o2) = writer.write(&[5, 6, 7, 8]).unwrap();
        // third write would push segment 1 to 12 bytes > cap of 10, so it rolls
        let (s3, o3) = writer.write(&[9, 10]).unwrap();

        assert_eq!((s1, o1), (1, 0));
        assert_eq!((s2, o2), (1, 4));
        assert_eq!((s3, o3), (2, 0));
        assert_eq!(writer.segments_used(), 2);
    }

    #[test]
    fn pool_reads_back_what_the_writer_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::new(dir.path().to_path_buf(), 1 << 20);
        let (segm, offset) = writer.write(b"hello-blob").unwrap();
        drop(writer);

        let pool = SegmentPool::new(dir.path().to_path_buf());
        let bytes = pool.read_at(segm, offset, b"hello-blob".len()).unwrap();
        assert_eq!(bytes, b"hello-blob");
    }
}
