#![allow(missing_docs)]

use std::sync::Arc;

use idxcheck::primitives::pager::{LockMode, MemPageStore};
use idxcheck::storage::btree::page::flags;
use idxcheck::storage::btree::{edit, BTreeBuildOptions, BTreeBuilder, BTreeIndex, BTreeLayout};
use idxcheck::storage::compare::{BytewiseComparator, I64Comparator, KeyComparator};
use idxcheck::storage::heap::MemTable;
use idxcheck::types::{CheckError, CorruptionKind, ItemLocation, Result, RowId, TxId};
use idxcheck::verify::{self, CancelToken, CheckOptions, ConcernKind};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

struct Fixture {
    store: Arc<MemPageStore>,
    table: Arc<MemTable>,
    layout: BTreeLayout,
}

impl Fixture {
    fn index(&self) -> BTreeIndex {
        BTreeIndex::new("orders_pkey", self.store.clone(), Arc::new(BytewiseComparator))
            .with_table(self.table.clone())
    }
}

fn key(i: u32) -> Vec<u8> {
    format!("key{i:05}").into_bytes()
}

fn row(i: u32) -> RowId {
    RowId::new(i, 1)
}

fn load(keys: Vec<Vec<u8>>, leaf_fanout: usize, internal_fanout: usize) -> Result<Fixture> {
    let store = Arc::new(MemPageStore::new(1024)?);
    let table = Arc::new(MemTable::new("orders"));
    let mut entries = Vec::with_capacity(keys.len());
    for (i, k) in keys.into_iter().enumerate() {
        table.insert(row(i as u32), k.clone(), TxId(1));
        entries.push((k, row(i as u32)));
    }
    let opts = BTreeBuildOptions {
        page_size: 1024,
        leaf_fanout,
        internal_fanout,
        ..Default::default()
    };
    let layout = BTreeBuilder::new(store.as_ref(), opts)?.build(entries, &BytewiseComparator)?;
    Ok(Fixture {
        store,
        table,
        layout,
    })
}

/// 30 ascending keys: 8 leaves of 4, 3 internal pages, one root.
fn ascending() -> Result<Fixture> {
    load((0..30).map(key).collect(), 4, 3)
}

fn corruption_kind(err: CheckError) -> CorruptionKind {
    err.corruption().map(|c| c.kind).expect("expected corruption")
}

#[test]
fn valid_tree_passes_every_mode_without_concerns() -> Result<()> {
    let fx = ascending()?;
    let index = fx.index();
    for strict in [false, true] {
        let report = verify::check_with_table(&index, strict, true)?;
        assert!(report.concerns.is_empty());
        assert_eq!(report.levels_checked, 3);
        assert_eq!(report.pages_checked, 12);
        assert_eq!(report.leaf_tuples_fingerprinted, 30);
        let heap = report.heap.expect("heap summary");
        assert_eq!(heap.rows_present, 30);
        assert_eq!(heap.table, "orders");
    }
    assert_eq!(fx.store.locks_held(LockMode::Share), 0);
    assert_eq!(fx.store.locks_held(LockMode::AccessShare), 0);
    Ok(())
}

#[test]
fn swapped_keys_violate_item_order() -> Result<()> {
    let fx = ascending()?;
    let leaf = fx.layout.level(0)[1];
    edit::swap_keys(fx.store.as_ref(), leaf, 1, 2)?;
    let err = verify::check(&fx.index(), false).unwrap_err();
    let corruption = err.corruption().expect("corruption");
    assert_eq!(corruption.kind, CorruptionKind::ItemOrder);
    assert_eq!(corruption.page, Some(leaf));
    assert_eq!(
        corruption.items,
        vec![ItemLocation::new(leaf, 1), ItemLocation::new(leaf, 2)]
    );
    assert!(corruption.message.contains("orders_pkey"));
    Ok(())
}

#[test]
fn key_below_downlink_is_only_caught_by_strict_check() -> Result<()> {
    let fx = ascending()?;
    // Leaf 2 starts at key00008 under a downlink keyed key00008. Its new first
    // key still sorts after everything on leaf 1.
    let leaf = fx.layout.level(0)[2];
    edit::replace_key(fx.store.as_ref(), leaf, 0, b"key00007x")?;
    let index = fx.index();
    assert!(verify::check(&index, false).is_ok());
    let err = verify::check(&index, true).unwrap_err();
    let corruption = err.corruption().expect("corruption");
    assert_eq!(corruption.kind, CorruptionKind::DownlinkLowerBound);
    assert_eq!(corruption.page, Some(fx.layout.level(1)[0]));
    assert!(corruption.items.contains(&ItemLocation::new(leaf, 0)));
    Ok(())
}

#[test]
fn dropped_leaf_tuple_is_found_by_the_table_check() -> Result<()> {
    let fx = ascending()?;
    let leaf = fx.layout.level(0)[3];
    assert!(edit::remove_row(fx.store.as_ref(), leaf, row(13))?);
    let index = fx.index();
    assert!(verify::check(&index, false).is_ok());
    assert!(verify::check(&index, true).is_ok());

    let weak = verify::check_with_table(&index, false, true).unwrap_err();
    let corruption = weak.corruption().expect("corruption");
    assert_eq!(corruption.kind, CorruptionKind::HeapTupleMissing);
    assert!(corruption
        .message
        .contains("heap tuple (13,1) from table \"orders\" lacks matching index tuple"));
    assert!(corruption.hint.is_some());

    let strict = verify::check_with_table(&index, true, true).unwrap_err();
    assert_eq!(corruption_kind(strict), CorruptionKind::HeapTupleMissing);
    Ok(())
}

#[test]
fn weak_table_check_ignores_rows_newer_than_the_horizon() -> Result<()> {
    let fx = ascending()?;
    fx.table.set_horizon(TxId(5));
    fx.table.insert(RowId::new(900, 1), b"late".to_vec(), TxId(7));
    let index = fx.index();
    let report = verify::check_with_table(&index, false, true)?;
    let heap = report.heap.expect("heap summary");
    assert_eq!(heap.rows_present, 30);
    assert_eq!(heap.rows_skipped, 1);

    let err = verify::check_with_table(&index, true, true).unwrap_err();
    assert_eq!(corruption_kind(err), CorruptionKind::HeapTupleMissing);
    Ok(())
}

#[test]
fn table_check_without_a_table_is_refused() -> Result<()> {
    let fx = ascending()?;
    let index = BTreeIndex::new("bare", fx.store.clone(), Arc::new(BytewiseComparator));
    assert!(matches!(
        verify::check_with_table(&index, false, true),
        Err(CheckError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn concern_list_is_capped_but_counted() -> Result<()> {
    let fx = ascending()?;
    for leaf in &fx.layout.level(0)[1..4] {
        edit::set_flags(fx.store.as_ref(), *leaf, flags::HALF_DEAD, 0)?;
    }
    let opts = CheckOptions {
        max_concerns: 2,
        ..CheckOptions::new(false)
    };
    let report = verify::check_with_options(&fx.index(), &opts)?;
    assert_eq!(report.pages_ignored, 3);
    assert_eq!(report.concerns.len(), 2);
    assert!(report.concerns_total >= 4);
    assert!(report
        .concerns
        .iter()
        .all(|c| matches!(c.kind, ConcernKind::DeletedRightSibling | ConcernKind::IgnoredPage)));
    Ok(())
}

#[test]
fn strict_check_locks_out_writers_until_it_returns() -> Result<()> {
    let fx = ascending()?;
    let opts = CheckOptions::new(true).with_cancel(CancelToken::new());
    verify::check_with_options(&fx.index(), &opts)?;
    // The lock is gone, so damage can be planted again.
    edit::set_flags(fx.store.as_ref(), fx.layout.level(0)[0], 0, 0)?;
    Ok(())
}

#[test]
fn cancelled_check_returns_interrupted() -> Result<()> {
    let fx = ascending()?;
    let cancel = CancelToken::new();
    cancel.cancel();
    let opts = CheckOptions::new(true)
        .with_heapallindexed(true)
        .with_cancel(cancel);
    assert!(matches!(
        verify::check_with_options(&fx.index(), &opts),
        Err(CheckError::Interrupted)
    ));
    assert_eq!(fx.store.locks_held(LockMode::Share), 0);
    Ok(())
}

#[test]
fn comparator_decides_what_counts_as_ordered() -> Result<()> {
    let store = Arc::new(MemPageStore::new(1024)?);
    let cmp = I64Comparator;
    let entries = (-20i64..20)
        .map(|v| (v.to_be_bytes().to_vec(), RowId::new(v.unsigned_abs() as u32, 1)))
        .collect();
    let opts = BTreeBuildOptions {
        page_size: 1024,
        leaf_fanout: 5,
        internal_fanout: 4,
        ..Default::default()
    };
    BTreeBuilder::new(store.as_ref(), opts)?.build(entries, &cmp)?;

    let as_i64 = BTreeIndex::new("signed", store.clone(), Arc::new(I64Comparator));
    assert!(verify::check(&as_i64, true)?.concerns.is_empty());

    let as_bytes = BTreeIndex::new("signed", store, Arc::new(BytewiseComparator));
    let err = verify::check(&as_bytes, false).unwrap_err();
    assert!(err.is_corruption());
    assert_eq!(cmp.name(), "i64");
    Ok(())
}

#[test]
fn random_adjacent_swaps_are_always_detected() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0xa11ce);
    for _ in 0..20 {
        let mut keys: Vec<u32> = (0..400).map(|_| rng.gen_range(0..1_000_000)).collect();
        keys.sort_unstable();
        keys.dedup();
        keys.shuffle(&mut rng);
        let fx = load(keys.into_iter().map(key).collect(), 8, 6)?;
        let leaves = fx.layout.level(0);
        // Every leaf but the last is full.
        let leaf = leaves[rng.gen_range(0..leaves.len() - 1)];
        edit::swap_keys(fx.store.as_ref(), leaf, 0, 1)?;
        let err = verify::check(&fx.index(), false).unwrap_err();
        assert_eq!(corruption_kind(err), CorruptionKind::ItemOrder);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn bulk_loaded_trees_always_verify(
        keys in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..12), 0..300),
        leaf_fanout in 2usize..12,
        internal_fanout in 2usize..8,
    ) {
        let fx = load(keys, leaf_fanout, internal_fanout).unwrap();
        let index = fx.index();
        let weak = verify::check_with_table(&index, false, true).unwrap();
        let strict = verify::check_with_table(&index, true, true).unwrap();
        prop_assert!(weak.concerns.is_empty());
        prop_assert_eq!(weak.items_checked, strict.items_checked);
        prop_assert_eq!(strict.heap.map(|h| h.rows_present), Some(fx.table.rows().len() as u64));
    }
}
