#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use idxcheck::primitives::pager::{FilePageStore, PageStore};
use idxcheck::storage::btree::{BTreeBuildOptions, BTreeBuilder, BTreeIndex};
use idxcheck::storage::compare::BytewiseComparator;
use idxcheck::storage::gist::{BoxKey, BoxOpClass, GistBuildOptions, GistBuilder, GistEntry, GistIndex};
use idxcheck::storage::heap::{CsvTable, HeapRow};
use idxcheck::types::{CorruptionKind, Result, RowId, TxId};
use idxcheck::verify;
use tempfile::tempdir;

const PAGE_SIZE: u32 = 4096;

fn rows(n: u32) -> Vec<HeapRow> {
    (0..n)
        .map(|i| HeapRow {
            row: RowId::new(i / 10, (i % 10 + 1) as u16),
            key: format!("user:{i:06}").into_bytes(),
            created_by: TxId(u64::from(i % 3) + 1),
        })
        .collect()
}

fn write_btree(path: &Path, rows: &[HeapRow]) -> Result<()> {
    let store = FilePageStore::create(path, PAGE_SIZE)?;
    let opts = BTreeBuildOptions {
        page_size: PAGE_SIZE,
        leaf_fanout: 32,
        internal_fanout: 8,
        ..Default::default()
    };
    let entries = rows.iter().map(|r| (r.key.clone(), r.row)).collect();
    BTreeBuilder::new(&store, opts)?.build(entries, &BytewiseComparator)?;
    Ok(())
}

fn flip_byte(path: &Path, offset: u64) -> std::io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut byte = [0u8; 1];
    std::io::Read::read_exact(&mut file, &mut byte)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&[byte[0] ^ 0x5a])
}

#[test]
fn reopened_btree_verifies_against_csv_table() -> Result<()> {
    let dir = tempdir()?;
    let index_path = dir.path().join("users_pkey.idx");
    let table_path = dir.path().join("users.csv");
    let rows = rows(1500);
    write_btree(&index_path, &rows)?;
    CsvTable::write(&table_path, &rows)?;

    let store: Arc<dyn PageStore> = Arc::new(FilePageStore::open(&index_path)?);
    assert_eq!(store.page_size(), PAGE_SIZE);
    let table = Arc::new(CsvTable::open(&table_path)?);
    let index = BTreeIndex::new("users_pkey", store, Arc::new(BytewiseComparator)).with_table(table);

    let report = verify::check_with_table(&index, true, true)?;
    assert_eq!(report.heap.map(|h| (h.table, h.rows_present)), Some(("users".to_owned(), 1500)));
    Ok(())
}

#[test]
fn flipped_byte_on_disk_fails_the_checksum() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("users_pkey.idx");
    write_btree(&path, &rows(500))?;
    flip_byte(&path, 3 * u64::from(PAGE_SIZE) + 700)?;

    let store: Arc<dyn PageStore> = Arc::new(FilePageStore::open(&path)?);
    let index = BTreeIndex::new("users_pkey", store, Arc::new(BytewiseComparator));
    let err = verify::check(&index, false).unwrap_err();
    let corruption = err.corruption().expect("corruption");
    assert_eq!(corruption.kind, CorruptionKind::Checksum);
    assert_eq!(corruption.page.map(|p| p.0), Some(3));
    Ok(())
}

#[test]
fn truncated_file_reports_missing_pages() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("users_pkey.idx");
    write_btree(&path, &rows(500))?;
    let file = OpenOptions::new().write(true).open(&path)?;
    let len = file.metadata()?.len();
    file.set_len(len - u64::from(PAGE_SIZE))?;
    drop(file);

    let store: Arc<dyn PageStore> = Arc::new(FilePageStore::open(&path)?);
    let index = BTreeIndex::new("users_pkey", store, Arc::new(BytewiseComparator));
    let err = verify::check(&index, false).unwrap_err();
    assert!(err.is_corruption());
    Ok(())
}

#[test]
fn gist_file_round_trips() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("parcels_gist.idx");
    {
        let store = FilePageStore::create(&path, PAGE_SIZE)?;
        let opts = GistBuildOptions {
            page_size: PAGE_SIZE,
            leaf_fanout: 16,
            internal_fanout: 4,
            ..Default::default()
        };
        let entries = (0..300u32)
            .map(|i| GistEntry {
                attrs: vec![Some(BoxKey::new(
                    f64::from(i),
                    f64::from(i % 17),
                    f64::from(i) + 2.5,
                    f64::from(i % 17) + 1.0,
                ))],
                row: RowId::new(i, 1),
            })
            .collect();
        GistBuilder::new(&store, &BoxOpClass, opts)?.build(entries)?;
    }
    let store: Arc<dyn PageStore> = Arc::new(FilePageStore::open(&path)?);
    let report = verify::check_graph(&GistIndex::new("parcels_gist", store, BoxOpClass))?;
    assert_eq!(report.tuples_checked, 300 + 19 + 5);
    Ok(())
}
