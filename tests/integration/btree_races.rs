#![allow(missing_docs)]

//! Writers that act between two page fetches of a weak check.

use std::sync::Arc;

use idxcheck::primitives::pager::{LockMode, MemPageStore, PageStore};
use idxcheck::storage::btree::page::{flags, ImageItems};
use idxcheck::storage::btree::{edit, BTreeBuildOptions, BTreeBuilder, BTreeIndex, BTreeLayout};
use idxcheck::storage::compare::BytewiseComparator;
use idxcheck::types::{CorruptionKind, PageId, Result, RowId};
use idxcheck::verify::{self, ConcernKind};
use parking_lot::Mutex;

type Hook = Box<dyn FnOnce(&MemPageStore) -> Result<()> + Send>;

/// Runs a one-shot hook right before `trigger` is first read.
struct RacingStore {
    inner: Arc<MemPageStore>,
    trigger: PageId,
    hook: Mutex<Option<Hook>>,
}

impl PageStore for RacingStore {
    fn page_size(&self) -> u32 {
        self.inner.page_size()
    }

    fn page_count(&self) -> Result<u64> {
        self.inner.page_count()
    }

    fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        if id == self.trigger {
            let hook = self.hook.lock().take();
            if let Some(hook) = hook {
                hook(&self.inner)?;
            }
        }
        self.inner.read_page(id)
    }

    fn lock_relation(&self, mode: LockMode) -> Result<()> {
        self.inner.lock_relation(mode)
    }

    fn unlock_relation(&self, mode: LockMode) {
        self.inner.unlock_relation(mode)
    }
}

fn tree() -> Result<(Arc<MemPageStore>, BTreeLayout)> {
    let store = Arc::new(MemPageStore::new(1024)?);
    let opts = BTreeBuildOptions {
        page_size: 1024,
        leaf_fanout: 4,
        internal_fanout: 3,
        ..Default::default()
    };
    let entries = (0..30u32)
        .map(|i| (format!("key{i:05}").into_bytes(), RowId::new(i, 1)))
        .collect();
    let layout = BTreeBuilder::new(store.as_ref(), opts)?.build(entries, &BytewiseComparator)?;
    Ok((store, layout))
}

/// Moves a key from the target's range to the front of its right sibling,
/// below the target's last item.
fn merge_into_sibling(store: &MemPageStore, sibling: PageId) -> Result<()> {
    edit::rewrite(store, sibling, |image| {
        if let ImageItems::Leaf(items) = &mut image.items {
            items.insert(0, (b"key00009z".to_vec(), RowId::new(9, 2)));
        }
        Ok(())
    })
}

fn racing_index(store: &Arc<MemPageStore>, sibling: PageId, hook: Hook) -> BTreeIndex {
    let racing = Arc::new(RacingStore {
        inner: store.clone(),
        trigger: sibling,
        hook: Mutex::new(Some(hook)),
    });
    BTreeIndex::new("events_idx", racing, Arc::new(BytewiseComparator))
}

#[test]
fn deletion_during_cross_page_check_is_a_recovered_race() -> Result<()> {
    let (store, layout) = tree()?;
    let target = layout.level(0)[2];
    let sibling = layout.level(0)[3];
    let index = racing_index(
        &store,
        sibling,
        Box::new(move |inner: &MemPageStore| {
            edit::set_flags(inner, target, flags::HALF_DEAD, 0)?;
            merge_into_sibling(inner, sibling)
        }),
    );

    let report = verify::check(&index, false)?;
    let race = report
        .concerns
        .iter()
        .find(|c| c.kind == ConcernKind::RecoveredRace)
        .expect("recovered race concern");
    assert_eq!(race.page, Some(target));
    Ok(())
}

#[test]
fn same_merge_without_deletion_is_corruption() -> Result<()> {
    let (store, layout) = tree()?;
    let target = layout.level(0)[2];
    let sibling = layout.level(0)[3];
    let index = racing_index(
        &store,
        sibling,
        Box::new(move |inner: &MemPageStore| merge_into_sibling(inner, sibling)),
    );

    let err = verify::check(&index, false).unwrap_err();
    let corruption = err.corruption().expect("corruption");
    assert_eq!(corruption.kind, CorruptionKind::CrossPageOrder);
    assert_eq!(corruption.page, Some(target));
    Ok(())
}

#[test]
fn strict_check_reports_the_merge_outright() -> Result<()> {
    let (store, layout) = tree()?;
    let sibling = layout.level(0)[3];
    merge_into_sibling(&store, sibling)?;

    let index = BTreeIndex::new("events_idx", store.clone(), Arc::new(BytewiseComparator));
    let err = verify::check(&index, true).unwrap_err();
    assert_eq!(
        err.corruption().map(|c| c.kind),
        Some(CorruptionKind::CrossPageOrder)
    );
    Ok(())
}

#[test]
fn deleted_right_sibling_is_skipped_over() -> Result<()> {
    let (store, layout) = tree()?;
    let sibling = layout.level(0)[3];
    edit::set_flags(store.as_ref(), sibling, flags::DELETED, 0)?;
    let index = BTreeIndex::new("events_idx", store.clone(), Arc::new(BytewiseComparator));
    let report = verify::check(&index, false)?;
    assert!(report
        .concerns
        .iter()
        .any(|c| c.kind == ConcernKind::DeletedRightSibling && c.page == Some(sibling)));
    assert_eq!(report.pages_ignored, 1);
    Ok(())
}
