//! Store opener (§4.6): resolves `(storePath, mode, partitionID?)` into one of the
//! read store's five open modes, rejecting combinations the mode enum's own shape
//! already makes impossible to construct correctly (e.g. `create` paired with a
//! partition id) before they reach [`ReadStore`]'s constructors.

use std::path::Path;

use crate::config::StoreConfig;
use crate::error::{ReadStoreError, Result};
use crate::readstore::ReadStore;

/// The mode token as it would arrive from an external caller (CLI flag, RPC request):
/// flat, with partition id carried alongside rather than inside the matching variant.
/// [`open`] is where that flat shape gets validated down into `readstore::Mode`'s
/// illegal-states-unrepresentable one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedMode {
    Create,
    Extend,
    ReadAll,
    ReadPartition,
    BuildPartitions,
}

/// Opens a read store at `path` under `requested`, validating that `partition_id` is
/// present exactly when `requested` needs one.
pub fn open(
    path: impl AsRef<Path>,
    requested: RequestedMode,
    partition_id: Option<u32>,
    config: StoreConfig,
) -> Result<ReadStore> {
    let path = path.as_ref();
    match (requested, partition_id) {
        (RequestedMode::Create, None) => ReadStore::create(path, config),
        (RequestedMode::Extend, None) => ReadStore::open_extend(path, config),
        (RequestedMode::ReadAll, None) => ReadStore::open_read_all(path),
        (RequestedMode::ReadPartition, Some(p)) => ReadStore::open_read_partition(path, p),

        (RequestedMode::Create, Some(_)) => {
            Err(ReadStoreError::BadMode("create does not accept a partition id".into()).into())
        }
        (RequestedMode::Extend, Some(_)) => {
            Err(ReadStoreError::BadMode("extend does not accept a partition id".into()).into())
        }
        (RequestedMode::ReadAll, Some(_)) => {
            Err(ReadStoreError::BadMode("read-all does not accept a partition id".into()).into())
        }
        (RequestedMode::ReadPartition, None) => {
            Err(ReadStoreError::BadMode("read-partition requires a partition id".into()).into())
        }
        (RequestedMode::BuildPartitions, _) => Err(ReadStoreError::BadMode(
            "build-partitions is a one-shot transform, not an open mode (see ReadStore::build_partitions)".into(),
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result as AnyResult;

    #[test]
    fn rejects_create_with_a_partition_id() {
        let dir = tempfile::tempdir().unwrap();
        let err = open(dir.path().join("s"), RequestedMode::Create, Some(1), StoreConfig::default());
        assert!(err.is_err());
    }

    #[test]
    fn rejects_read_partition_without_a_partition_id() {
        let dir = tempfile::tempdir().unwrap();
        let err = open(dir.path().join("s"), RequestedMode::ReadPartition, None, StoreConfig::default());
        assert!(err.is_err());
    }

    #[test]
    fn create_then_read_all_round_trips() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("s");
        let store = open(&path, RequestedMode::Create, None, StoreConfig::default())?;
        store.close()?;
        let reopened = open(&path, RequestedMode::ReadAll, None, StoreConfig::default())?;
        assert_eq!(reopened.num_reads(), 0);
        Ok(())
    }
}
