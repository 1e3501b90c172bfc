//! End-to-end walkthrough: build a read store, stash a handful of reads, close and
//! reopen it, then build a small overlap store over a few records between them.

use anyhow::Result;
use asmstore::{
    OverlapRecord, ReadData, ReadStore, ReadVersion, SequentialOverlapBuilder, StoreConfig,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let root = tempfile::tempdir()?;
    let read_store_path = root.path().join("reads");
    let overlap_store_path = root.path().join("overlaps");

    let mut store = ReadStore::create(&read_store_path, StoreConfig::default())?;
    let lid = store.add_library("demo-library")?;

    let reads: [(&[u8], &[u8]); 3] = [
        (b"ACGTACGTACGT", b"IIIIIIIIIIII"),
        (b"TTTTGGGGCCCC", b"IIIIIIIIIIII"),
        (b"AACCGGTTAACC", b"IIIIIIIIIIII"),
    ];
    let mut rids = Vec::new();
    for (seq, qlt) in reads {
        let rid = store.add_empty_read(lid)?;
        let data = ReadData::new(b"demo-read".to_vec(), seq.to_vec(), qlt.to_vec(), None, None, 0, seq.len() as u32);
        store.stash_read_data(rid, &data)?;
        rids.push(rid);
    }
    let info = store.close()?;
    tracing::info!(num_reads = info.num_reads, "closed read store");

    let reopened = ReadStore::open_read_all(&read_store_path)?;
    for rid in &rids {
        let data = reopened.load_read_data(*rid, ReadVersion::Raw)?;
        println!("read {rid}: {} bases", data.raw_seq().len());
    }

    let mut builder = SequentialOverlapBuilder::create(&overlap_store_path, &StoreConfig::default())?;
    builder.write_overlap(OverlapRecord {
        a_iid: 1,
        b_iid: 2,
        a_hang: 3,
        b_hang: -3,
        evalue: 0.01,
        flipped: false,
    })?;
    builder.write_overlap(OverlapRecord {
        a_iid: 1,
        b_iid: 3,
        a_hang: 5,
        b_hang: -5,
        evalue: 0.02,
        flipped: true,
    })?;
    let overlap_info = builder.close()?;
    tracing::info!(
        smallest = overlap_info.smallest_id,
        largest = overlap_info.largest_id,
        "closed overlap store"
    );

    println!(
        "built read store with {} reads and overlap store spanning iids {}..={}",
        info.num_reads, overlap_info.smallest_id, overlap_info.largest_id
    );

    Ok(())
}
