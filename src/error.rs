//! Crate-wide error types.
//!
//! Each subsystem gets its own error enum, mirroring the teacher's
//! `HeaderError`/`ReadError`/`WriteError` split, and all of them fold into a single
//! [`Error`] via `#[from]` so call sites can use `?` across subsystem boundaries.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("chunk length {length} exceeds {remaining} remaining bytes in blob")]
    BadChunkLength { length: u32, remaining: usize },

    #[error("decoded base count {decoded} disagrees with expected sequence length {expected}")]
    BadPacking { expected: u32, decoded: u32 },

    #[error("segment index {0} exceeds the 13-bit segment limit (8192)")]
    SegmentOverflow(u32),

    #[error("byte offset {0} exceeds the 30-bit per-segment limit (1 GiB)")]
    OffsetOverflow(u64),

    #[error("short read of blob data: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("quality value {0} exceeds the 5-bit packing range (0..=31)")]
    QualityOutOfRange(u8),

    #[error("byte {0:#04x} is outside ACGTN and the standard IUPAC ambiguity codes, rejected under strict base policy")]
    DisallowedBase(u8),
}

#[derive(Error, Debug)]
pub enum ReadStoreError {
    #[error("store already exists at {0}")]
    StoreExists(PathBuf),

    #[error("store does not exist at {0}")]
    StoreMissing(PathBuf),

    #[error("store at {path} has record size {on_disk}, binary expects {compiled}")]
    SchemaMismatch {
        path: PathBuf,
        on_disk: usize,
        compiled: usize,
    },

    #[error("invalid mode/partition combination: {0}")]
    BadMode(String),

    #[error("read identifier {0} is out of range (1..={1})")]
    UnknownRead(u32, u32),

    #[error("partition {0} was not found in partitions/map")]
    UnknownPartition(u32),

    #[error("trim range [{bgn}, {end}) is invalid for corrected length {cseq_len}")]
    BadTrim { bgn: u32, end: u32, cseq_len: u32 },

    #[error("store at {0} is already open for writing in this process")]
    AlreadyOpenForWriting(PathBuf),

    #[error("store at {0} is not sealed; only a sealed store may be opened in extend mode")]
    NotSealed(PathBuf),
}

#[derive(Error, Debug)]
pub enum OverlapFileError {
    #[error("short write of overlap record")]
    ShortWrite,

    #[error("short read of overlap record: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
}

#[derive(Error, Debug)]
pub enum OverlapStoreError {
    #[error("overlap store already exists at {0}")]
    StoreExists(PathBuf),

    #[error("overlap received out of order: a_iid {got} follows {current}")]
    OutOfOrder { current: u32, got: u32 },

    #[error(
        "bucket file for slice {slice} job {job} is missing but sliceSizes claims {claimed} records"
    )]
    MissingBucket { slice: u32, job: u32, claimed: u64 },

    #[error(
        "bucket file for slice {slice} job {job} contains {actual} records, sliceSizes claimed {claimed}"
    )]
    BucketSizeMismatch {
        slice: u32,
        job: u32,
        claimed: u64,
        actual: u64,
    },

    #[error("index entry {index} has a_iid gap: expected {expected}, found {found}")]
    IndexGap {
        index: u32,
        expected: u32,
        found: u32,
    },

    #[error("index total overlaps {indexed} disagrees with info.numOverlaps {recorded}")]
    OverlapCountMismatch { indexed: u64, recorded: u64 },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    ReadStore(#[from] ReadStoreError),

    #[error(transparent)]
    OverlapFile(#[from] OverlapFileError),

    #[error(transparent)]
    OverlapStore(#[from] OverlapStoreError),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::Io { path: None, source }
    }
}

/// Crate-wide result alias, matching the teacher's `error::Result<T>` convention.
pub type Result<T> = std::result::Result<T, Error>;

/// Attaches a path to an I/O error for operator-facing diagnostics.
pub(crate) trait IoContext<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: Some(path.into()),
            source,
        })
    }
}
