#![allow(clippy::module_inception)]

pub mod blob;
pub mod config;
pub mod error;
pub mod ovlfile;
pub mod ovlstore;
pub mod readstore;
pub mod store;

pub use blob::{decode_blob, encode_blob, BlobInput, DecodedBlob};
pub use config::{BasePolicy, StoreConfig, StoreConfigBuilder};
pub use error::{Error, Result};
pub use ovlfile::{Histogram, OverlapFileReader, OverlapFileWriter, OverlapRecord, RecordMode};
pub use ovlstore::{
    BucketWriter, OfftEntry, OverlapStoreInfo, SequentialOverlapBuilder, load_bucket_sizes,
    merge_slices, remove_all_intermediate_files, sort_and_emit_slice, verify_index,
};
pub use readstore::{Mode as ReadStoreMode, ReadData, ReadRecord, ReadStore, ReadStoreInfo, ReadVersion};
pub use store::{open, RequestedMode};
