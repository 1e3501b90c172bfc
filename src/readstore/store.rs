//! Read store (§4.2, §4.6): fixed-size metadata tables plus blob data, opened in one of
//! `{create, extend, read-all, read-partition, build-partitions}`.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use byteorder::{ByteOrder, LittleEndian};
use tracing::info;

use crate::blob::decode_blob;
use crate::config::StoreConfig;
use crate::error::{IoContext, ReadStoreError, Result};
use crate::readstore::data::ReadData;
use crate::readstore::library::Library;
use crate::readstore::record::{ReadRecord, ReadVersion, SIZE_READ_RECORD};
use crate::readstore::segment::{SegmentPool, SegmentWriter};

const MAGIC_PLACEHOLDER: u32 = 0x0000_0000;
const MAGIC_SEALED: u32 = 0x5245_4144; // "READ" read as a little-endian u32
const FORMAT_VERSION: u32 = 1;
const SIZE_INFO_RECORD: usize = 20;

/// Read store's `info` header: record counts plus the schema fingerprint the opener
/// checks against the compiled `SIZE_READ_RECORD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStoreInfo {
    pub num_reads: u32,
    pub num_libraries: u32,
    pub magic: u32,
    pub version: u32,
    pub record_size: u32,
}

impl ReadStoreInfo {
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            num_reads: 0,
            num_libraries: 0,
            magic: MAGIC_PLACEHOLDER,
            version: FORMAT_VERSION,
            record_size: SIZE_READ_RECORD as u32,
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
        LittleEndian::write_u32(&mut buf[0..4], self.num_reads);
        LittleEndian::write_u32(&mut buf[4..8], self.num_libraries);
        LittleEndian::write_u32(&mut buf[8..12], self.magic);
        LittleEndian::write_u32(&mut buf[12..16], self.version);
        LittleEndian::write_u32(&mut buf[16..20], self.record_size);
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8; SIZE_INFO_RECORD]) -> Self {
        Self {
            num_reads: LittleEndian::read_u32(&buf[0..4]),
            num_libraries: LittleEndian::read_u32(&buf[4..8]),
            magic: LittleEndian::read_u32(&buf[8..12]),
            version: LittleEndian::read_u32(&buf[12..16]),
            record_size: LittleEndian::read_u32(&buf[16..20]),
        }
    }

    #[must_use]
    pub fn to_text(self) -> String {
        format!(
            "numReads     {}\nnumLibraries {}\nsealed       {}\nrecordSize   {}\n",
            self.num_reads,
            self.num_libraries,
            self.is_sealed(),
            self.record_size,
        )
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_bytes()).with_path(path)?;
        let text_path = path.with_extension("txt");
        fs::write(&text_path, self.to_text()).with_path(&text_path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_path(path)?;
        let buf: [u8; SIZE_INFO_RECORD] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ReadStoreError::SchemaMismatch {
                path: path.to_path_buf(),
                on_disk: bytes.len(),
                compiled: SIZE_INFO_RECORD,
            })?;
        Ok(Self::from_bytes(&buf))
    }
}

/// Which mode a store was opened in; governs which operations are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Create,
    Extend,
    ReadAll,
    ReadPartition(u32),
    BuildPartitions,
}

impl Mode {
    fn is_mutating(self) -> bool {
        matches!(self, Mode::Create | Mode::Extend | Mode::BuildPartitions)
    }
}

fn registry() -> &'static Mutex<HashSet<PathBuf>> {
    static REGISTRY: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Releases a path's claim on the process-wide writer registry when the owning store
/// is dropped, so a later `create`/`extend` of the same path in the same process
/// succeeds once this one closes.
struct WriteGuard(PathBuf);

impl Drop for WriteGuard {
    fn drop(&mut self) {
        registry().lock().expect("registry mutex poisoned").remove(&self.0);
    }
}

/// Rejects a second mutating open of `path` within this process, rather than
/// reference-counting a shared singleton (see DESIGN.md's resolution of the
/// global-singleton-store open question).
fn claim_writer(path: &Path) -> Result<WriteGuard> {
    let canon = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mut set = registry().lock().expect("registry mutex poisoned");
    if !set.insert(canon.clone()) {
        return Err(ReadStoreError::AlreadyOpenForWriting(canon).into());
    }
    Ok(WriteGuard(canon))
}

/// A read store: the library and read-record tables in memory, plus blob segment
/// access (a writer when the store is mutating, a reader pool always).
pub struct ReadStore {
    dir: PathBuf,
    mode: Mode,
    config: StoreConfig,
    info: ReadStoreInfo,
    libraries: Vec<Library>,
    /// Index 0 is the reserved empty slot; `reads[rid]` is the record for `rid`.
    reads: Vec<ReadRecord>,
    segment_writer: Option<SegmentWriter>,
    segment_pool: SegmentPool,
    _write_guard: Option<WriteGuard>,
}

impl ReadStore {
    /// Creates a new, empty store at `dir`, which must not already exist.
    pub fn create(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if dir.exists() {
            return Err(ReadStoreError::StoreExists(dir).into());
        }
        fs::create_dir_all(&dir).with_path(&dir)?;
        let guard = claim_writer(&dir)?;

        let mut info = ReadStoreInfo::placeholder();
        info.save(&dir.join("info"))?;

        let segment_writer = SegmentWriter::new(dir.clone(), config_segment_bytes(&config));
        Ok(Self {
            dir: dir.clone(),
            mode: Mode::Create,
            config,
            info,
            libraries: Vec::new(),
            reads: vec![ReadRecord::default()],
            segment_writer: Some(segment_writer),
            segment_pool: SegmentPool::new(dir),
            _write_guard: Some(guard),
        })
    }

    /// Opens a sealed store read-only, with full metadata and random-access blob reads.
    pub fn open_read_all(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let (info, libraries, reads) = Self::load_metadata(&dir)?;
        Ok(Self {
            dir: dir.clone(),
            mode: Mode::ReadAll,
            config: StoreConfig::default(),
            info,
            libraries,
            reads,
            segment_writer: None,
            segment_pool: SegmentPool::new(dir),
            _write_guard: None,
        })
    }

    /// Reopens a sealed store for further writes, archiving the pre-extend metadata
    /// into `version.NNN/` first.
    pub fn open_extend(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let (info, libraries, reads) = Self::load_metadata(&dir)?;
        if !info.is_sealed() {
            return Err(ReadStoreError::NotSealed(dir).into());
        }
        let guard = claim_writer(&dir)?;

        let version_dir = dir.join(format!("version.{:03}", next_version_number(&dir)?));
        fs::create_dir_all(&version_dir).with_path(&version_dir)?;
        for name in ["info", "info.txt", "libraries", "reads"] {
            let src = dir.join(name);
            if src.exists() {
                fs::rename(&src, version_dir.join(name)).with_path(&src)?;
            }
        }

        let segment_writer = SegmentWriter::resume(dir.clone(), config_segment_bytes(&config))?;
        info!(dir = %dir.display(), "opened read store for extend");

        Ok(Self {
            dir: dir.clone(),
            mode: Mode::Extend,
            config,
            info,
            libraries,
            reads,
            segment_writer: Some(segment_writer),
            segment_pool: SegmentPool::new(dir),
            _write_guard: Some(guard),
        })
    }

    fn load_metadata(dir: &Path) -> Result<(ReadStoreInfo, Vec<Library>, Vec<ReadRecord>)> {
        let info_path = dir.join("info");
        if !info_path.exists() {
            return Err(ReadStoreError::StoreMissing(dir.to_path_buf()).into());
        }
        let info = ReadStoreInfo::load(&info_path)?;
        if info.record_size as usize != SIZE_READ_RECORD {
            return Err(ReadStoreError::SchemaMismatch {
                path: info_path,
                on_disk: info.record_size as usize,
                compiled: SIZE_READ_RECORD,
            }
            .into());
        }

        let mut libraries = Vec::with_capacity(info.num_libraries as usize);
        let lib_path = dir.join("libraries");
        if lib_path.exists() {
            let bytes = fs::read(&lib_path).with_path(&lib_path)?;
            let mut cursor = std::io::Cursor::new(bytes);
            for lid in 1..=info.num_libraries {
                libraries.push(Library::from_reader(&mut cursor, lid).with_path(&lib_path)?);
            }
        }

        let mut reads = vec![ReadRecord::default()];
        let reads_path = dir.join("reads");
        if reads_path.exists() {
            let bytes = fs::read(&reads_path).with_path(&reads_path)?;
            for chunk in bytes.chunks(SIZE_READ_RECORD) {
                let buf: [u8; SIZE_READ_RECORD] = chunk
                    .try_into()
                    .map_err(|_| ReadStoreError::SchemaMismatch {
                        path: reads_path.clone(),
                        on_disk: chunk.len(),
                        compiled: SIZE_READ_RECORD,
                    })?;
                reads.push(ReadRecord::from_bytes(&buf));
            }
        }

        Ok((info, libraries, reads))
    }

    #[must_use]
    pub fn num_reads(&self) -> u32 {
        self.reads.len() as u32 - 1
    }

    #[must_use]
    pub fn num_libraries(&self) -> u32 {
        self.libraries.len() as u32
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn add_library(&mut self, name: impl Into<String>) -> Result<u32> {
        self.require_mutating()?;
        let lid = self.libraries.len() as u32 + 1;
        self.libraries.push(Library::new(lid, name));
        Ok(lid)
    }

    pub fn add_empty_read(&mut self, lid: u32) -> Result<u32> {
        self.require_mutating()?;
        let rid = self.reads.len() as u32;
        self.reads.push(ReadRecord::empty(rid, lid));
        Ok(rid)
    }

    pub fn get_read(&self, rid: u32) -> Result<&ReadRecord> {
        self.reads
            .get(rid as usize)
            .filter(|_| rid != 0)
            .ok_or_else(|| ReadStoreError::UnknownRead(rid, self.num_reads()).into())
    }

    /// Returns a read's raw, still-encoded blob bytes, for callers (partitioning) that
    /// want to relocate a read's data without decoding and re-encoding it.
    pub fn read_raw_blob(&self, rid: u32) -> Result<Vec<u8>> {
        let record = self.get_read(rid)?;
        if record.blob_len == 0 {
            return Ok(Vec::new());
        }
        self.segment_pool.read_at(record.m_segm, record.m_byte, record.blob_len as usize)
    }

    /// Opens one partition of a store previously split by
    /// [`crate::readstore::partition::build_partitions`]. The partition's `reads` table
    /// and blob file are self-contained; no top-level `info`/`libraries` are loaded.
    pub fn open_read_partition(dir: impl AsRef<Path>, partition: u32) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let reads = crate::readstore::partition::load_partition_records(&dir, partition)?;
        let partitions_dir = dir.join("partitions");

        let mut info = ReadStoreInfo::placeholder();
        info.num_reads = reads.len() as u32 - 1;
        info.seal();

        Ok(Self {
            dir: dir.clone(),
            mode: Mode::ReadPartition(partition),
            config: StoreConfig::default(),
            info,
            libraries: Vec::new(),
            reads,
            segment_writer: None,
            segment_pool: SegmentPool::new(partitions_dir),
            _write_guard: None,
        })
    }

    /// Decodes a read's blob and returns its sequence/quality derivatives. `version` is
    /// only used to decide whether a fallback warning is worth logging; the decode
    /// itself always recovers every chunk present.
    pub fn load_read_data(&self, rid: u32, version: ReadVersion) -> Result<ReadData> {
        let record = self.get_read(rid)?;
        if record.blob_len == 0 {
            return Ok(ReadData::new(Vec::new(), Vec::new(), Vec::new(), None, None, 0, 0));
        }
        let bytes = self.segment_pool.read_at(record.m_segm, record.m_byte, record.blob_len as usize)?;
        let decoded = decode_blob(&bytes)?;
        let data = ReadData::from_decoded(decoded, record);
        if version == ReadVersion::Trimmed && data.trimmed_seq().is_none() {
            tracing::warn!(rid, "trimmed sequence requested but read {rid} has no trim recorded");
        }
        Ok(data)
    }

    /// Encodes `data` into the current segment and updates `rid`'s record in place.
    pub fn stash_read_data(&mut self, rid: u32, data: &ReadData) -> Result<()> {
        self.require_mutating()?;
        if rid == 0 || rid as usize >= self.reads.len() {
            return Err(ReadStoreError::UnknownRead(rid, self.num_reads()).into());
        }

        if self.config.base_policy() == crate::config::BasePolicy::Strict {
            crate::blob::validate_strict_bases(data.raw_seq())?;
            if let Some(cseq) = data.corrected_seq() {
                crate::blob::validate_strict_bases(cseq)?;
            }
        }
        let bytes = crate::blob::encode_blob(&data.as_blob_input());
        let writer = self
            .segment_writer
            .as_mut()
            .expect("mutating mode always carries a segment writer");
        let (segm, byte) = writer.write(&bytes)?;

        let record = &mut self.reads[rid as usize];
        let part = record.m_part;
        record.blob_len = bytes.len() as u32;
        record.rseq_len = data.raw_seq().len() as u32;
        record.c_exists = data.corrected_seq().is_some();
        record.cseq_len = data.corrected_seq().map_or(0, |s| s.len() as u32);
        let (clear_bgn, clear_end) = data.clear_range();
        record.t_exists = record.c_exists && clear_end > clear_bgn;
        record.clear_bgn = clear_bgn;
        record.clear_end = clear_end;
        record.set_blob_location(segm, byte, part);
        Ok(())
    }

    fn require_mutating(&self) -> Result<()> {
        if self.mode.is_mutating() {
            Ok(())
        } else {
            Err(ReadStoreError::BadMode(format!("store opened in {:?} is not writable", self.mode)).into())
        }
    }

    /// Flushes metadata tables and seals the store. Consumes `self` so no further
    /// writes are possible afterward.
    pub fn close(mut self) -> Result<ReadStoreInfo> {
        self.require_mutating()?;
        self.write_tables()?;
        self.info.num_reads = self.num_reads();
        self.info.num_libraries = self.num_libraries();
        self.info.seal();
        self.info.save(&self.dir.join("info"))?;
        Ok(self.info)
    }

    fn write_tables(&mut self) -> Result<()> {
        let lib_path = self.dir.join("libraries");
        let mut lib_file = BufWriter::new(File::create(&lib_path).with_path(&lib_path)?);
        for lib in &self.libraries {
            lib.write_bytes(&mut lib_file).with_path(&lib_path)?;
        }
        lib_file.flush().with_path(&lib_path)?;

        let reads_path = self.dir.join("reads");
        let mut reads_file = BufWriter::new(File::create(&reads_path).with_path(&reads_path)?);
        for record in self.reads.iter().skip(1) {
            reads_file.write_all(&record.to_bytes()).with_path(&reads_path)?;
        }
        reads_file.flush().with_path(&reads_path)?;
        Ok(())
    }
}

impl ReadStore {
    /// Splits a sealed store into per-partition clones under `dest`. A thin wrapper
    /// around [`crate::readstore::partition::build_partitions`] kept here so callers
    /// reach every read-store operation through one type.
    pub fn build_partitions(
        source: impl AsRef<Path>,
        dest: impl AsRef<Path>,
        assignment: &[u32],
    ) -> Result<crate::readstore::partition::PartitionMap> {
        crate::readstore::partition::build_partitions(source.as_ref(), dest.as_ref(), assignment)
    }
}

fn config_segment_bytes(config: &StoreConfig) -> u64 {
    config.segment_bytes()
}

fn next_version_number(dir: &Path) -> Result<u32> {
    let mut max_seen = 0u32;
    for entry in fs::read_dir(dir).with_path(dir)? {
        let entry = entry.with_path(dir)?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(suffix) = name.strip_prefix("version.") {
                if let Ok(n) = suffix.parse::<u32>() {
                    max_seen = max_seen.max(n);
                }
            }
        }
    }
    Ok(max_seen + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result as AnyResult;

    #[test]
    fn single_read_round_trip() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let store_path = dir.path().join("store");
        let mut store = ReadStore::create(&store_path, StoreConfig::default())?;
        let lid = store.add_library("prep-A")?;
        let rid = store.add_empty_read(lid)?;
        let data = ReadData::new(b"r0".to_vec(), b"ACGT".to_vec(), vec![20, 20, 20, 20], None, None, 0, 0);
        store.stash_read_data(rid, &data)?;
        let info = store.close()?;

        assert_eq!(info.num_reads, 1);
        assert!(info.is_sealed());

        let reopened = ReadStore::open_read_all(&store_path)?;
        let loaded = reopened.load_read_data(1, ReadVersion::Latest)?;
        assert_eq!(loaded.sequence(ReadVersion::Latest), b"ACGT");
        assert_eq!(reopened.get_read(1)?.rseq_len, 4);
        Ok(())
    }

    #[test]
    fn extend_preserves_prior_version() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let store_path = dir.path().join("store");
        let mut store = ReadStore::create(&store_path, StoreConfig::default())?;
        let lid = store.add_library("prep-A")?;
        store.add_empty_read(lid)?;
        store.close()?;

        let mut extended = ReadStore::open_extend(&store_path, StoreConfig::default())?;
        assert!(store_path.join("version.001/info").exists());
        extended.add_library("prep-B")?;
        extended.add_empty_read(1)?;
        let info = extended.close()?;
        assert_eq!(info.num_libraries, 2);
        assert_eq!(info.num_reads, 2);
        Ok(())
    }

    #[test]
    fn strict_base_policy_rejects_disallowed_byte() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let store_path = dir.path().join("store");
        let config = StoreConfig::builder().base_policy(crate::config::BasePolicy::Strict).build();
        let mut store = ReadStore::create(&store_path, config)?;
        let lid = store.add_library("prep-A")?;
        let rid = store.add_empty_read(lid)?;
        let data = ReadData::new(b"r0".to_vec(), b"ACGZ".to_vec(), vec![20; 4], None, None, 0, 0);
        assert!(store.stash_read_data(rid, &data).is_err());
        Ok(())
    }

    #[test]
    fn open_extend_rejects_unsealed_store() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let store_path = dir.path().join("store");
        let store = ReadStore::create(&store_path, StoreConfig::default())?;
        drop(store);

        let err = ReadStore::open_extend(&store_path, StoreConfig::default());
        assert!(err.is_err());
        Ok(())
    }

    #[test]
    fn rejects_double_open_for_writing() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let store_path = dir.path().join("store");
        let _store = ReadStore::create(&store_path, StoreConfig::default())?;
        let second = ReadStore::open_extend(&store_path, StoreConfig::default());
        assert!(second.is_err());
        Ok(())
    }

    #[test]
    fn different_paths_may_both_be_open_for_writing() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let _first = ReadStore::create(dir.path().join("a"), StoreConfig::default())?;
        let second = ReadStore::create(dir.path().join("b"), StoreConfig::default());
        assert!(second.is_ok());
        Ok(())
    }
}
