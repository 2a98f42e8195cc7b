//! B-Tree level walk.
//!
//! Levels are verified top to bottom starting from the true root, and pages
//! left to right along right links. Each live page is checked on its own
//! (item order, high key), against the first item of its right sibling, and,
//! in strict mode, against each of its children.

use std::cmp::Ordering;
use std::fmt;

use tracing::{debug, trace};

use super::bloom::BloomFilter;
use super::fetch::Fetcher;
use super::heapcheck;
use super::{BTreeReport, CancelToken, CheckOptions, ConcernKind, ConcernLog};
use crate::storage::btree::{BTreeIndex, BTreePage, Item, ItemTarget};
use crate::storage::compare::KeyComparator;
use crate::types::{CheckError, Corruption, CorruptionKind, ItemLocation, PageId, Result};

/// Where one level of the tree starts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BtreeLevel {
    pub level: u32,
    pub leftmost: PageId,
    pub is_true_root: bool,
}

#[derive(Default)]
struct Stats {
    levels_checked: u32,
    pages_checked: u64,
    pages_ignored: u64,
    items_checked: u64,
    downlinks_checked: u64,
    leaf_tuples_fingerprinted: u64,
}

/// State for one verification run.
struct BtreeCheckState<'a> {
    fetch: Fetcher<'a>,
    cmp: &'a dyn KeyComparator,
    strict: bool,
    cancel: &'a CancelToken,
    filter: Option<BloomFilter>,
    concerns: ConcernLog,
    stats: Stats,
}

struct Link(Option<PageId>);

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, "{id}"),
            None => f.write_str("none"),
        }
    }
}

/// Runs the full walk for [`check_with_options`](super::check_with_options).
/// The caller holds the relation lock.
pub(crate) fn check_every_level(index: &BTreeIndex, opts: &CheckOptions) -> Result<BTreeReport> {
    let fetch = Fetcher::new(index.store(), index.name());

    // The horizon must be taken before the walk: rows created later may
    // legitimately be missing from pages already visited.
    let table = if opts.heapallindexed {
        let table = index
            .table()
            .ok_or(CheckError::Invalid("cross-table verification needs the index's table"))?;
        let seed = opts.bloom_seed.unwrap_or_else(rand::random);
        let filter = BloomFilter::new(table.estimated_rows(), opts.bloom_work_mem_kb, seed);
        debug!(
            target: "idxcheck::verify::nbtree",
            bits = filter.bit_count(),
            hash_funcs = filter.hash_funcs(),
            seed,
            "bloom filter sized"
        );
        Some((table, table.snapshot_horizon(), filter))
    } else {
        None
    };

    let mut state = BtreeCheckState {
        fetch,
        cmp: index.comparator(),
        strict: opts.strict,
        cancel: &opts.cancel,
        filter: None,
        concerns: ConcernLog::new(opts.max_concerns),
        stats: Stats::default(),
    };
    let (table, horizon) = match table {
        Some((table, horizon, filter)) => {
            state.filter = Some(filter);
            (Some(table), Some(horizon))
        }
        None => (None, None),
    };

    let meta = state.fetch.btree_meta()?;
    if meta.fast_root != meta.root {
        state.concerns.record(
            ConcernKind::FastRootMismatch,
            None,
            format!(
                "harmless fast root mismatch in index \"{}\": fast root block {} (level {}) differs from true root block {} (level {})",
                index.name(),
                Link(meta.fast_root),
                meta.fast_level,
                Link(meta.root),
                meta.level
            ),
        );
    }

    let mut current = meta.root.map(|root| BtreeLevel {
        level: meta.level,
        leftmost: root,
        is_true_root: true,
    });
    while let Some(level) = current {
        state.stats.levels_checked += 1;
        current = state.check_level_from_leftmost(level)?;
    }

    let heap = match (table, horizon, state.filter.as_ref()) {
        (Some(table), Some(horizon), Some(filter)) => Some(heapcheck::verify_presence(
            index.name(),
            table,
            filter,
            horizon,
            opts.strict,
            &opts.cancel,
        )?),
        _ => None,
    };

    let concerns_total = state.concerns.total();
    Ok(BTreeReport {
        index: index.name().to_owned(),
        strict: opts.strict,
        heapallindexed: opts.heapallindexed,
        root: meta.root,
        root_level: meta.level,
        levels_checked: state.stats.levels_checked,
        pages_checked: state.stats.pages_checked,
        pages_ignored: state.stats.pages_ignored,
        items_checked: state.stats.items_checked,
        downlinks_checked: state.stats.downlinks_checked,
        leaf_tuples_fingerprinted: state.stats.leaf_tuples_fingerprinted,
        heap,
        concerns: state.concerns.into_vec(),
        concerns_total,
    })
}

impl BtreeCheckState<'_> {
    fn index(&self) -> &str {
        self.fetch.index()
    }

    fn corruption(&self, kind: CorruptionKind, page: &BTreePage, message: String) -> Corruption {
        Corruption::new(kind, self.index(), message).on_page(page.id, Some(page.lsn))
    }

    /// Walks one level from its leftmost page and returns where the next level
    /// starts, or `None` after the leaf level.
    ///
    /// A level cannot end without a live page: the walk stops only at a page
    /// with no right link, and an ignorable one there fails as `FellOffEnd`.
    fn check_level_from_leftmost(&mut self, level: BtreeLevel) -> Result<Option<BtreeLevel>> {
        debug!(
            target: "idxcheck::verify::nbtree",
            level = level.level,
            "verifying level{}",
            if level.is_true_root {
                " (true root level)"
            } else if level.level == 0 {
                " (leaf level)"
            } else {
                ""
            }
        );
        let page_limit = self.fetch.page_count()?;
        let mut next: Option<Option<BtreeLevel>> = None;
        let mut left_current: Option<PageId> = None;
        let mut current = Some(level.leftmost);
        let mut visited = 0u64;

        while let Some(id) = current {
            self.cancel.check()?;
            visited += 1;
            if visited > page_limit {
                return Err(Corruption::new(
                    CorruptionKind::CircularLink,
                    self.index(),
                    format!(
                        "right link chain of level {} in index \"{}\" is longer than the relation's {page_limit} pages",
                        level.level,
                        self.index()
                    ),
                )
                .on_page(id, None)
                .into());
            }

            let page = self.fetch.btree_page(id)?;
            if page.is_ignorable() {
                if page.is_rightmost() {
                    return Err(self
                        .corruption(
                            CorruptionKind::FellOffEnd,
                            &page,
                            format!("block {id} fell off the end of index \"{}\"", self.index()),
                        )
                        .into());
                }
                let message = format!("block {id} of index \"{}\" ignored", self.index());
                self.concerns
                    .record(ConcernKind::IgnoredPage, Some(id), message);
                self.stats.pages_ignored += 1;
            } else {
                if next.is_none() {
                    if self.strict {
                        if !page.is_leftmost() {
                            return Err(self
                                .corruption(
                                    CorruptionKind::NotLeftmost,
                                    &page,
                                    format!("block {id} is not leftmost in index \"{}\"", self.index()),
                                )
                                .into());
                        }
                        if level.is_true_root && !page.is_root() {
                            return Err(self
                                .corruption(
                                    CorruptionKind::NotTrueRoot,
                                    &page,
                                    format!("block {id} is not true root in index \"{}\"", self.index()),
                                )
                                .into());
                        }
                    }
                    next = Some(page.sentinel().map(|child| BtreeLevel {
                        level: page.level.saturating_sub(1),
                        leftmost: child,
                        is_true_root: false,
                    }));
                }

                if self.strict && page.left != left_current {
                    return Err(self
                        .corruption(
                            CorruptionKind::SiblingLinks,
                            &page,
                            format!(
                                "left link/right link pair in index \"{}\" not in agreement",
                                self.index()
                            ),
                        )
                        .with_detail(format!(
                            "Block={id} left block={} left link from block={}.",
                            Link(left_current),
                            Link(page.left)
                        ))
                        .into());
                }

                if level.level != page.level {
                    return Err(self
                        .corruption(
                            CorruptionKind::Level,
                            &page,
                            format!(
                                "leftmost down link for level points to block in index \"{}\" whose level is not one level down",
                                self.index()
                            ),
                        )
                        .with_detail(format!(
                            "Block pointed to={id} expected level={} level in pointed to block={}.",
                            level.level, page.level
                        ))
                        .into());
                }

                self.target_page_check(&page)?;
                self.stats.pages_checked += 1;
            }

            if Some(id) == left_current || Some(id) == page.left {
                return Err(self
                    .corruption(
                        CorruptionKind::CircularLink,
                        &page,
                        format!("circular link chain found in block {id} of index \"{}\"", self.index()),
                    )
                    .into());
            }
            left_current = Some(id);
            current = page.right;
        }

        Ok(next.flatten())
    }

    /// Checks every non-sentinel item of a live page.
    fn target_page_check(&mut self, page: &BTreePage) -> Result<()> {
        let items = page.items();
        trace!(
            target: "idxcheck::verify::nbtree",
            page = page.id.0,
            items = items.len(),
            "verifying items on {} block",
            page.kind_label()
        );
        for (pos, item) in items.iter().enumerate() {
            self.cancel.check()?;
            self.stats.items_checked += 1;
            let key = page.key(item);

            if page.is_leaf() {
                if let Some(filter) = self.filter.as_mut() {
                    filter.add(page.record(item));
                    self.stats.leaf_tuples_fingerprinted += 1;
                }
            }

            if let Some(high_key) = page.high_key() {
                if self.cmp.compare(key, high_key) == Ordering::Greater {
                    return Err(self
                        .corruption(
                            CorruptionKind::HighKey,
                            page,
                            format!("high key invariant violated for index \"{}\"", self.index()),
                        )
                        .with_item(ItemLocation::new(page.id, item.slot))
                        .with_detail(format!(
                            "Index tid=({},{}) points to {} page lsn={}.",
                            page.id,
                            item.slot,
                            describe_target(item),
                            page.lsn
                        ))
                        .into());
                }
            }

            if let Some(next_item) = items.get(pos + 1) {
                if self.cmp.compare(key, page.key(next_item)) == Ordering::Greater {
                    return Err(self
                        .corruption(
                            CorruptionKind::ItemOrder,
                            page,
                            format!("item order invariant violated for index \"{}\"", self.index()),
                        )
                        .with_item(ItemLocation::new(page.id, item.slot))
                        .with_item(ItemLocation::new(page.id, next_item.slot))
                        .with_detail(format!(
                            "Lower index tid=({},{}) (points to {}) higher index tid=({},{}) (points to {}) page lsn={}.",
                            page.id,
                            item.slot,
                            describe_target(item),
                            page.id,
                            next_item.slot,
                            describe_target(next_item),
                            page.lsn
                        ))
                        .into());
                }
            } else if let Some(right_key) = self.right_page_check_key(page)? {
                if self.cmp.compare(key, &right_key) == Ordering::Greater {
                    // Without a share lock the target may have been deleted and
                    // its key space merged right after we copied it.
                    if !self.strict {
                        let fresh = self.fetch.btree_page(page.id)?;
                        if fresh.is_ignorable() {
                            let message = format!(
                                "block {} of index \"{}\" was deleted while its right sibling was read; cross page check skipped",
                                page.id,
                                self.index()
                            );
                            self.concerns
                                .record(ConcernKind::RecoveredRace, Some(page.id), message);
                            return Ok(());
                        }
                    }
                    return Err(self
                        .corruption(
                            CorruptionKind::CrossPageOrder,
                            page,
                            format!(
                                "cross page item order invariant violated for index \"{}\"",
                                self.index()
                            ),
                        )
                        .with_item(ItemLocation::new(page.id, item.slot))
                        .with_detail(format!(
                            "Last item on page tid=({},{}) page lsn={}.",
                            page.id, item.slot, page.lsn
                        ))
                        .into());
                }
            }

            if self.strict {
                if let ItemTarget::Child(child) = item.target {
                    self.downlink_check(page, item, child)?;
                }
            }
        }
        Ok(())
    }

    /// First comparable key of the nearest live right sibling, if there is one.
    fn right_page_check_key(&mut self, page: &BTreePage) -> Result<Option<Vec<u8>>> {
        let Some(mut next) = page.right else {
            return Ok(None);
        };
        let limit = self.fetch.page_count()?;
        let mut hops = 0u64;
        let right = loop {
            self.cancel.check()?;
            let right = self.fetch.btree_page(next)?;
            let step = match right.right {
                Some(step) if right.is_ignorable() => step,
                _ => break right,
            };
            let message = format!(
                "level {} leftmost page of index \"{}\" was found deleted or half dead",
                right.level,
                self.index()
            );
            self.concerns
                .record(ConcernKind::DeletedRightSibling, Some(next), message);
            next = step;
            hops += 1;
            if hops > limit {
                return Err(Corruption::new(
                    CorruptionKind::CircularLink,
                    self.index(),
                    format!(
                        "right links of deleted pages after block {} in index \"{}\" never reach a live page",
                        page.id,
                        self.index()
                    ),
                )
                .on_page(page.id, Some(page.lsn))
                .into());
            }
        };

        match right.first_item() {
            Some(item) => Ok(Some(right.key(item).to_vec())),
            None => {
                let message = format!(
                    "{} block {next} of index \"{}\" has no first data item",
                    right.kind_label(),
                    self.index()
                );
                self.concerns
                    .record(ConcernKind::NoFirstItem, Some(next), message);
                Ok(None)
            }
        }
    }

    /// Checks that `parent_item`'s key is a lower bound for every key in `child`.
    fn downlink_check(&mut self, parent: &BTreePage, parent_item: &Item, child: PageId) -> Result<()> {
        // Without a share lock the child may be split or deleted concurrently,
        // and there is no way to tell that apart from corruption.
        if !self.strict {
            return Err(CheckError::Internal(
                "downlink check requires a share lock on the index",
            ));
        }
        let parent_key = parent.key(parent_item);
        let child_page = self.fetch.btree_page(child)?;
        self.stats.downlinks_checked += 1;
        for item in child_page.items() {
            if self.cmp.compare(parent_key, child_page.key(item)) == Ordering::Greater {
                return Err(self
                    .corruption(
                        CorruptionKind::DownlinkLowerBound,
                        parent,
                        format!(
                            "down-link lower bound invariant violated for index \"{}\"",
                            self.index()
                        ),
                    )
                    .with_item(ItemLocation::new(parent.id, parent_item.slot))
                    .with_item(ItemLocation::new(child, item.slot))
                    .with_detail(format!(
                        "Parent block={} child index tid=({child},{}) parent page lsn={}.",
                        parent.id, item.slot, parent.lsn
                    ))
                    .into());
            }
        }
        Ok(())
    }
}

fn describe_target(item: &Item) -> String {
    match item.target {
        ItemTarget::Row(row) => format!("heap tid={row}"),
        ItemTarget::Child(child) => format!("index tid=({child},1)"),
    }
}
