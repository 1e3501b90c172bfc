//! Overlap store (§3, §4.3-4.5): fixed-width overlap records, a primary index keyed by
//! `a_iid`, and two ways to build one — a single sorted stream, or a bucket-shuffle and
//! per-slice sort suited to a cluster of producers.

pub mod index;
pub mod parallel;
pub mod sequential;

pub use index::{OfftEntry, OverlapStoreInfo};
pub use parallel::{BucketWriter, load_bucket_sizes, merge_slices, remove_all_intermediate_files, sort_and_emit_slice, verify_index};
pub use sequential::SequentialOverlapBuilder;
