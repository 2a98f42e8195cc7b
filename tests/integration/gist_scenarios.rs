#![allow(missing_docs)]

use std::sync::Arc;

use idxcheck::primitives::pager::{LockMode, MemPageStore, PageStore, PageWrite};
use idxcheck::storage::gist::page::flags;
use idxcheck::storage::gist::{
    edit, BoxKey, BoxOpClass, GistBuildOptions, GistBuilder, GistEntry, GistIndex, GistLayout,
    GistOpClass, GistPageImage, GistPageKind, GistTupleImage,
};
use idxcheck::types::{CorruptionKind, Lsn, PageId, Result, RowId};
use idxcheck::verify::{self, ConcernKind};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const PAGE_SIZE: u32 = 2048;

fn boxed(key: BoxKey) -> Option<Vec<u8>> {
    Some(BoxOpClass.compress(0, &key))
}

fn everything() -> Option<Vec<u8>> {
    boxed(BoxKey::new(0.0, 0.0, 100.0, 100.0))
}

fn index(store: &Arc<MemPageStore>) -> GistIndex {
    GistIndex::new("shapes_gist", store.clone(), BoxOpClass)
}

fn build(entries: Vec<GistEntry<BoxKey>>) -> Result<(Arc<MemPageStore>, GistLayout)> {
    let store = Arc::new(MemPageStore::new(PAGE_SIZE)?);
    let opts = GistBuildOptions {
        page_size: PAGE_SIZE,
        leaf_fanout: 4,
        internal_fanout: 3,
        ..Default::default()
    };
    let layout = GistBuilder::new(store.as_ref(), &BoxOpClass, opts)?.build(entries)?;
    Ok((store, layout))
}

fn grid(n: u32) -> Vec<GistEntry<BoxKey>> {
    (0..n)
        .map(|i| GistEntry {
            attrs: vec![Some(BoxKey::point(f64::from(i % 10), f64::from(i / 10)))],
            row: RowId::new(i, 1),
        })
        .collect()
}

/// Writes hand-made pages in id order, starting at the root.
fn write_pages(pages: Vec<(GistPageKind, u8, Vec<GistTupleImage>)>) -> Result<Arc<MemPageStore>> {
    let store = Arc::new(MemPageStore::new(PAGE_SIZE)?);
    for (i, (kind, page_flags, tuples)) in pages.into_iter().enumerate() {
        let id = PageId(i as u64);
        let image = GistPageImage {
            id,
            lsn: Lsn(1),
            nsn: Lsn(0),
            kind,
            flags: page_flags,
            right: None,
            tuples,
        };
        store.write_page(id, image.encode(PAGE_SIZE)?)?;
    }
    Ok(store)
}

fn leaf_tuple(x: f64, y: f64) -> GistTupleImage {
    GistTupleImage::leaf(RowId::new(1, 1), vec![boxed(BoxKey::point(x, y))])
}

fn kind_of(store: &Arc<MemPageStore>) -> CorruptionKind {
    let err = verify::check_graph(&index(store)).unwrap_err();
    err.corruption().map(|c| c.kind).expect("expected corruption")
}

#[test]
fn built_box_index_passes() -> Result<()> {
    let (store, layout) = build(grid(40))?;
    assert_eq!(layout.root_level(), 3);
    let report = verify::check_graph(&index(&store))?;
    assert_eq!(report.index, "shapes_gist");
    assert_eq!(report.split_pages_followed, 0);
    assert!(report.concerns.is_empty());
    assert_eq!(store.locks_held(LockMode::Share), 0);
    Ok(())
}

#[test]
fn random_boxes_pass() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(77);
    let entries = (0..500u32)
        .map(|i| {
            let (x, y): (f64, f64) = (rng.gen_range(-1e3..1e3), rng.gen_range(-1e3..1e3));
            let (w, h): (f64, f64) = (rng.gen_range(0.0..50.0), rng.gen_range(0.0..50.0));
            GistEntry {
                attrs: vec![Some(BoxKey::new(x, y, x + w, y + h))],
                row: RowId::new(i, 1),
            }
        })
        .collect();
    let (store, _) = build(entries)?;
    let report = verify::check_graph(&index(&store))?;
    assert_eq!(report.opclass, "box_ops");
    assert!(report.tuples_checked >= 500);
    Ok(())
}

#[test]
fn child_box_escaping_its_parent_is_inconsistent() -> Result<()> {
    let (store, layout) = build(grid(40))?;
    let leaf = layout.level(0)[5];
    edit::rewrite(store.as_ref(), leaf, |image| {
        image.tuples[3].attrs[0] = boxed(BoxKey::new(-5.0, -5.0, -4.0, -4.0));
        Ok(())
    })?;
    let err = verify::check_graph(&index(&store)).unwrap_err();
    let corruption = err.corruption().expect("corruption");
    assert_eq!(corruption.kind, CorruptionKind::GistContainment);
    assert_eq!(corruption.page, Some(layout.level(1)[1]));
    assert!(corruption.message.contains("has inconsistent records"));
    Ok(())
}

#[test]
fn parent_referencing_both_leaves_and_inner_pages() -> Result<()> {
    let store = write_pages(vec![
        (
            GistPageKind::Internal,
            0,
            vec![
                GistTupleImage::downlink(PageId(1), vec![everything()]),
                GistTupleImage::downlink(PageId(2), vec![everything()]),
            ],
        ),
        (GistPageKind::Leaf, 0, vec![leaf_tuple(1.0, 1.0)]),
        (
            GistPageKind::Internal,
            0,
            vec![GistTupleImage::downlink(PageId(3), vec![everything()])],
        ),
        (GistPageKind::Leaf, 0, vec![leaf_tuple(2.0, 2.0)]),
    ])?;
    assert_eq!(kind_of(&store), CorruptionKind::GistMixedChildren);
    Ok(())
}

#[test]
fn internal_page_without_downlinks() -> Result<()> {
    let store = write_pages(vec![
        (
            GistPageKind::Internal,
            0,
            vec![GistTupleImage::downlink(PageId(1), vec![everything()])],
        ),
        (GistPageKind::Internal, 0, Vec::new()),
    ])?;
    let err = verify::check_graph(&index(&store)).unwrap_err();
    let corruption = err.corruption().expect("corruption");
    assert_eq!(corruption.kind, CorruptionKind::GistNoChildren);
    assert_eq!(corruption.page, Some(PageId(1)));
    Ok(())
}

#[test]
fn null_in_child_under_non_null_parent() -> Result<()> {
    let store = write_pages(vec![
        (
            GistPageKind::Internal,
            0,
            vec![GistTupleImage::downlink(PageId(1), vec![everything(), everything()])],
        ),
        (
            GistPageKind::Leaf,
            0,
            vec![GistTupleImage::leaf(
                RowId::new(1, 1),
                vec![boxed(BoxKey::point(1.0, 1.0)), None],
            )],
        ),
    ])?;
    assert_eq!(kind_of(&store), CorruptionKind::GistNullMismatch);
    Ok(())
}

#[test]
fn nulls_on_both_sides_are_consistent() -> Result<()> {
    let store = write_pages(vec![
        (
            GistPageKind::Internal,
            0,
            vec![GistTupleImage::downlink(PageId(1), vec![everything(), None])],
        ),
        (
            GistPageKind::Leaf,
            0,
            vec![GistTupleImage::leaf(
                RowId::new(1, 1),
                vec![boxed(BoxKey::point(1.0, 1.0)), None],
            )],
        ),
    ])?;
    let report = verify::check_graph(&index(&store))?;
    assert_eq!(report.tuples_checked, 1);
    Ok(())
}

#[test]
fn attribute_count_must_match_the_downlink() -> Result<()> {
    let store = write_pages(vec![
        (
            GistPageKind::Internal,
            0,
            vec![GistTupleImage::downlink(PageId(1), vec![everything()])],
        ),
        (
            GistPageKind::Leaf,
            0,
            vec![GistTupleImage::leaf(RowId::new(1, 1), vec![everything(), everything()])],
        ),
    ])?;
    assert_eq!(kind_of(&store), CorruptionKind::GistAttributeCount);
    Ok(())
}

#[test]
fn deleted_inner_child_is_a_concern() -> Result<()> {
    let store = write_pages(vec![
        (
            GistPageKind::Internal,
            0,
            vec![GistTupleImage::downlink(PageId(1), vec![everything()])],
        ),
        (GistPageKind::Internal, flags::DELETED, Vec::new()),
    ])?;
    let report = verify::check_graph(&index(&store))?;
    assert_eq!(report.concerns.len(), 1);
    assert_eq!(report.concerns[0].kind, ConcernKind::DeletedGistPage);
    Ok(())
}

#[test]
fn downlink_past_the_end_is_corruption() -> Result<()> {
    let store = write_pages(vec![(
        GistPageKind::Internal,
        0,
        vec![GistTupleImage::downlink(PageId(9), vec![everything()])],
    )])?;
    assert_eq!(kind_of(&store), CorruptionKind::PageFormat);
    Ok(())
}

/// Gives `page` a new right sibling, as a split that the parent has not
/// recorded yet would.
fn split_off(store: &MemPageStore, page: PageId, sibling: GistPageImage, mark: u8, nsn: Lsn) -> Result<PageId> {
    let right = edit::append(store, sibling)?;
    edit::rewrite(store, page, |image| {
        image.right = Some(right);
        image.flags |= mark;
        image.nsn = nsn;
        Ok(())
    })?;
    Ok(right)
}

fn empty_internal() -> GistPageImage {
    GistPageImage {
        id: PageId(0),
        lsn: Lsn(5),
        nsn: Lsn(0),
        kind: GistPageKind::Internal,
        flags: 0,
        right: None,
        tuples: Vec::new(),
    }
}

#[test]
fn split_after_parent_read_is_followed() -> Result<()> {
    let (store, layout) = build(grid(40))?;
    let x = layout.level(2)[0];
    // A split moved one downlink of a level 1 page into the new right half.
    let moved = GistPageImage::decode(&store.read_page(layout.level(1)[0])?)?.tuples[0].clone();
    let sibling = GistPageImage {
        tuples: vec![moved],
        ..empty_internal()
    };
    split_off(store.as_ref(), x, sibling, 0, Lsn(10))?;

    let report = verify::check_graph(&index(&store))?;
    assert_eq!(report.split_pages_followed, 1);
    Ok(())
}

#[test]
fn follow_right_flag_alone_schedules_the_sibling() -> Result<()> {
    let (store, layout) = build(grid(40))?;
    let x = layout.level(2)[0];
    let right = split_off(store.as_ref(), x, empty_internal(), flags::FOLLOW_RIGHT, Lsn(0))?;
    let err = verify::check_graph(&index(&store)).unwrap_err();
    let corruption = err.corruption().expect("corruption");
    assert_eq!(corruption.kind, CorruptionKind::GistNoChildren);
    assert_eq!(corruption.page, Some(right));
    Ok(())
}

#[test]
fn split_known_to_the_parent_is_not_followed() -> Result<()> {
    let (store, layout) = build(grid(40))?;
    let x = layout.level(2)[0];
    // nsn not past the parent's LSN: the parent already saw this split.
    split_off(store.as_ref(), x, empty_internal(), 0, Lsn(1))?;
    let report = verify::check_graph(&index(&store))?;
    assert_eq!(report.split_pages_followed, 0);
    Ok(())
}

#[test]
fn split_right_link_into_a_leaf_is_corruption() -> Result<()> {
    let (store, layout) = build(grid(40))?;
    let inner = layout.level(1)[0];
    let leaf = layout.level(0)[5];
    edit::rewrite(store.as_ref(), inner, |image| {
        image.right = Some(leaf);
        image.flags |= flags::FOLLOW_RIGHT;
        Ok(())
    })?;
    let err = verify::check_graph(&index(&store)).unwrap_err();
    let corruption = err.corruption().expect("corruption");
    assert_eq!(corruption.kind, CorruptionKind::GistSplitTarget);
    assert_eq!(corruption.page, Some(inner));
    assert!(corruption.message.contains(&format!("leaf block {leaf}")));
    Ok(())
}
