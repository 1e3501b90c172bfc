//! Tunables shared across the read store and overlap store, collected into a single
//! builder-constructed config rather than a free-standing config-file parser.

/// What to do with a non-ACGT base when stashing a read.
///
/// Checked by [`crate::readstore::store::ReadStore::stash_read_data`] before encoding;
/// the blob codec itself always falls back to 3-bit packing for whatever it's handed
/// and never rejects anything on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BasePolicy {
    /// Accept any byte; unrecognized bytes are packed as `N` in the 3-bit encoding.
    #[default]
    Lenient,
    /// Reject sequences containing a byte outside `ACGTN` and IUPAC ambiguity codes.
    Strict,
}

/// Upper bound on a blob segment file, in bytes, before rollover.
///
/// Keeps `ReadRecord::m_byte` (30 bits) valid: `1 << 30` bytes is exactly 1 GiB.
pub const DEFAULT_SEGMENT_BYTES: u64 = 1 << 30;

/// Upper bound on an overlap data segment, in records, before rollover.
pub fn default_overlap_segment_records(record_size: usize) -> usize {
    (DEFAULT_SEGMENT_BYTES as usize) / record_size
}

/// Runtime configuration for a store.
///
/// Constructed with [`StoreConfig::builder`], following the teacher's
/// `VBinseqWriterBuilder` fluent-builder idiom.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub(crate) segment_bytes: u64,
    pub(crate) reader_threads: usize,
    pub(crate) compression_level: Option<i32>,
    pub(crate) base_policy: BasePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            reader_threads: default_thread_count(),
            compression_level: None,
            base_policy: BasePolicy::default(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    #[must_use]
    pub fn segment_bytes(&self) -> u64 {
        self.segment_bytes
    }

    /// Thread count for `ovlstore::parallel::sort_and_emit_slice`'s fork-join per-slice
    /// sort. Named for the teacher's reader-pool-sizing convention (`process_parallel`'s
    /// thread count, resolved the same way by [`default_thread_count`]), not for a
    /// reader pool of our own — this crate's blob reads go through [`SegmentPool`](
    /// crate::readstore::segment::SegmentPool)'s mmap cache, which needs no thread
    /// count to size.
    #[must_use]
    pub fn reader_threads(&self) -> usize {
        self.reader_threads
    }

    #[must_use]
    pub fn compression_level(&self) -> Option<i32> {
        self.compression_level
    }

    #[must_use]
    pub fn base_policy(&self) -> BasePolicy {
        self.base_policy
    }
}

/// Resolves the default thread count for CPU-bound parallel work, mirroring the
/// teacher's `process_parallel` thread-count resolution: honor `OMP_NUM_THREADS` if set
/// and parseable, else fall back to the number of logical CPUs.
#[must_use]
pub fn default_thread_count() -> usize {
    std::env::var("OMP_NUM_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or_else(num_cpus::get)
}

#[derive(Debug, Clone, Default)]
pub struct StoreConfigBuilder {
    segment_bytes: Option<u64>,
    reader_threads: Option<usize>,
    compression_level: Option<i32>,
    base_policy: Option<BasePolicy>,
}

impl StoreConfigBuilder {
    #[must_use]
    pub fn segment_bytes(mut self, bytes: u64) -> Self {
        self.segment_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn reader_threads(mut self, threads: usize) -> Self {
        self.reader_threads = Some(threads);
        self
    }

    #[must_use]
    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self
    }

    #[must_use]
    pub fn base_policy(mut self, policy: BasePolicy) -> Self {
        self.base_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn build(self) -> StoreConfig {
        let defaults = StoreConfig::default();
        StoreConfig {
            segment_bytes: self.segment_bytes.unwrap_or(defaults.segment_bytes),
            reader_threads: self.reader_threads.unwrap_or(defaults.reader_threads),
            compression_level: self.compression_level.or(defaults.compression_level),
            base_policy: self.base_policy.unwrap_or(defaults.base_policy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_one_gib_segments() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.segment_bytes(), 1 << 30);
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = StoreConfig::builder()
            .segment_bytes(4096)
            .reader_threads(2)
            .compression_level(3)
            .base_policy(BasePolicy::Strict)
            .build();
        assert_eq!(cfg.segment_bytes(), 4096);
        assert_eq!(cfg.reader_threads(), 2);
        assert_eq!(cfg.compression_level(), Some(3));
        assert_eq!(cfg.base_policy(), BasePolicy::Strict);
    }
}
