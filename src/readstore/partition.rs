//! Partitioning (§4.2): splits a sealed read store into per-partition clones so a
//! downstream consumer can load only the slice it needs.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{IoContext, ReadStoreError, Result};
use crate::readstore::record::{ReadRecord, SIZE_READ_RECORD};
use crate::readstore::store::ReadStore;

fn partitions_dir(root: &Path) -> std::path::PathBuf {
    root.join("partitions")
}

fn reads_path(root: &Path, partition: u32) -> std::path::PathBuf {
    partitions_dir(root).join(format!("reads.{partition:04}"))
}

fn map_path(root: &Path) -> std::path::PathBuf {
    partitions_dir(root).join("map")
}

/// The translation table produced by [`build_partitions`]: which partition each
/// original `rid` landed in, and its index within that partition's own `rid` space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    pub num_partitions: u32,
    /// `reads_per_partition[p]` for `p` in `1..=num_partitions`; index 0 unused.
    pub reads_per_partition: Vec<u32>,
    /// Indexed by original `rid`; `0` means the read was dropped (unassigned).
    pub partition_of: Vec<u32>,
    /// Indexed by original `rid`; the read's `rid` within its destination partition.
    pub index_in_partition: Vec<u32>,
}

impl PartitionMap {
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = map_path(root);
        fs::create_dir_all(path.parent().expect("map has a parent dir")).with_path(&path)?;
        let mut file = BufWriter::new(File::create(&path).with_path(&path)?);

        let mut header = [0u8; 8];
        LittleEndian::write_u32(&mut header[0..4], self.num_partitions);
        LittleEndian::write_u32(&mut header[4..8], (self.partition_of.len() - 1) as u32);
        file.write_all(&header).with_path(&path)?;

        let mut counts = vec![0u8; self.num_partitions as usize * 4];
        for p in 1..=self.num_partitions as usize {
            LittleEndian::write_u32(&mut counts[(p - 1) * 4..p * 4], self.reads_per_partition[p]);
        }
        file.write_all(&counts).with_path(&path)?;

        for rid in 1..self.partition_of.len() {
            let mut entry = [0u8; 8];
            LittleEndian::write_u32(&mut entry[0..4], self.partition_of[rid]);
            LittleEndian::write_u32(&mut entry[4..8], self.index_in_partition[rid]);
            file.write_all(&entry).with_path(&path)?;
        }
        file.flush().with_path(&path)?;
        Ok(())
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = map_path(root);
        let bytes = fs::read(&path).with_path(&path)?;
        let num_partitions = LittleEndian::read_u32(&bytes[0..4]);
        let num_reads = LittleEndian::read_u32(&bytes[4..8]) as usize;

        let mut pos = 8;
        let mut reads_per_partition = vec![0u32; num_partitions as usize + 1];
        for p in 1..=num_partitions as usize {
            reads_per_partition[p] = LittleEndian::read_u32(&bytes[pos..pos + 4]);
            pos += 4;
        }

        let mut partition_of = vec![0u32; num_reads + 1];
        let mut index_in_partition = vec![0u32; num_reads + 1];
        for rid in 1..=num_reads {
            partition_of[rid] = LittleEndian::read_u32(&bytes[pos..pos + 4]);
            index_in_partition[rid] = LittleEndian::read_u32(&bytes[pos + 4..pos + 8]);
            pos += 8;
        }

        Ok(Self {
            num_partitions,
            reads_per_partition,
            partition_of,
            index_in_partition,
        })
    }
}

/// Reads `source`'s sealed metadata and blob data and writes a partitioned clone to
/// `dest`, which must not already hold a `partitions/` directory. `assignment[rid]`
/// gives the 1-based destination partition, or `0` to drop the read.
pub fn build_partitions(source: &Path, dest: &Path, assignment: &[u32]) -> Result<PartitionMap> {
    let store = ReadStore::open_read_all(source)?;
    let num_reads = store.num_reads();
    if assignment.len() != num_reads as usize + 1 {
        return Err(ReadStoreError::BadMode(format!(
            "assignment table has {} entries, store has {num_reads} reads",
            assignment.len()
        ))
        .into());
    }

    let num_partitions = assignment.iter().copied().max().unwrap_or(0);
    let dest_partitions = partitions_dir(dest);
    if dest_partitions.exists() {
        return Err(ReadStoreError::StoreExists(dest_partitions).into());
    }
    fs::create_dir_all(&dest_partitions).with_path(&dest_partitions)?;

    let mut reads_per_partition = vec![0u32; num_partitions as usize + 1];
    let mut partition_of = vec![0u32; num_reads as usize + 1];
    let mut index_in_partition = vec![0u32; num_reads as usize + 1];

    let mut partition_records: Vec<Vec<ReadRecord>> = (0..=num_partitions).map(|_| Vec::new()).collect();
    let mut partition_blob_offsets = vec![0u64; num_partitions as usize + 1];
    let mut blob_writers: Vec<Option<BufWriter<File>>> = (0..=num_partitions).map(|_| None).collect();

    for rid in 1..=num_reads {
        let p = assignment[rid as usize];
        if p == 0 {
            continue;
        }
        let source_record = store.get_read(rid)?;
        let blob = store.read_raw_blob(rid)?;

        let local_rid = partition_records[p as usize].len() as u32 + 1;
        partition_of[rid as usize] = p;
        index_in_partition[rid as usize] = local_rid;
        reads_per_partition[p as usize] += 1;

        let offset = partition_blob_offsets[p as usize];
        if !blob.is_empty() {
            let writer = blob_writers[p as usize].get_or_insert_with(|| {
                let path = crate::readstore::segment::segment_path(&dest_partitions, p);
                BufWriter::new(File::create(&path).expect("partition blob file create"))
            });
            writer.write_all(&blob).with_path(dest_partitions.join(format!("blobs.{p:04}")))?;
        }
        partition_blob_offsets[p as usize] += blob.len() as u64;

        let mut record = *source_record;
        record.rid = local_rid;
        record.blob_len = blob.len() as u32;
        record.set_blob_location(p, offset, p);
        partition_records[p as usize].push(record);
    }

    for writer in blob_writers.into_iter().flatten() {
        let mut writer = writer;
        writer.flush()?;
    }

    for p in 1..=num_partitions {
        let path = reads_path(dest, p);
        let mut file = BufWriter::new(File::create(&path).with_path(&path)?);
        for record in &partition_records[p as usize] {
            file.write_all(&record.to_bytes()).with_path(&path)?;
        }
        file.flush().with_path(&path)?;
    }

    let map = PartitionMap {
        num_partitions,
        reads_per_partition,
        partition_of,
        index_in_partition,
    };
    map.save(dest)?;
    Ok(map)
}

/// Loads a single partition's read records back from disk, for [`ReadStore::open_read_partition`].
pub fn load_partition_records(root: &Path, partition: u32) -> Result<Vec<ReadRecord>> {
    let path = reads_path(root, partition);
    if !path.exists() {
        return Err(ReadStoreError::UnknownPartition(partition).into());
    }
    let bytes = fs::read(&path).with_path(&path)?;
    let mut records = vec![ReadRecord::default()];
    for chunk in bytes.chunks(SIZE_READ_RECORD) {
        let buf: [u8; SIZE_READ_RECORD] = chunk.try_into().map_err(|_| {
            ReadStoreError::SchemaMismatch {
                path: path.clone(),
                on_disk: chunk.len(),
                compiled: SIZE_READ_RECORD,
            }
        })?;
        records.push(ReadRecord::from_bytes(&buf));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::readstore::data::ReadData;
    use anyhow::Result as AnyResult;

    #[test]
    fn splits_reads_across_two_partitions() -> AnyResult<()> {
        let dir = tempfile::tempdir()?;
        let source_path = dir.path().join("source");
        let mut store = ReadStore::create(&source_path, StoreConfig::default())?;
        let lid = store.add_library("prep")?;
        for seq in [&b"ACGT"[..], b"TTTT", b"GGGG"] {
            let rid = store.add_empty_read(lid)?;
            let data = ReadData::new(b"r".to_vec(), seq.to_vec(), vec![30; seq.len()], None, None, 0, 0);
            store.stash_read_data(rid, &data)?;
        }
        store.close()?;

        let dest_path = dir.path().join("dest");
        let assignment = [0u32, 1, 2, 1]; // rid 0 unused, rid1->p1, rid2->p2, rid3->p1
        let map = build_partitions(&source_path, &dest_path, &assignment)?;
        assert_eq!(map.num_partitions, 2);
        assert_eq!(map.reads_per_partition[1], 2);
        assert_eq!(map.reads_per_partition[2], 1);

        let p1_records = load_partition_records(&dest_path, 1)?;
        assert_eq!(p1_records.len(), 3); // slot 0 + 2 reads
        Ok(())
    }
}
