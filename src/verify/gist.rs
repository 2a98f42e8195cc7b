//! GiST graph walk.
//!
//! Depth-first from the root over an explicit work stack. Every internal
//! page is checked against each child it points at: the child's keys must
//! be contained in the downlink key, attribute by attribute, with matching
//! nullness. A right sibling produced by a split that the parent has not
//! seen yet is queued with the parent's LSN, so its keys are still checked
//! once its own downlinks are read.

use tracing::{debug, trace};

use super::fetch::Fetcher;
use super::{CancelToken, CheckOptions, ConcernKind, ConcernLog, GistReport};
use crate::storage::gist::{GistIndex, GistOpClass, GistPage, GistTuple, GIST_ROOT};
use crate::types::{CheckError, Corruption, CorruptionKind, ItemLocation, Lsn, PageId, Result};

/// A page waiting to be visited.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GistScanItem {
    pub page: PageId,
    /// LSN of the parent when its downlink was read; `None` for the root.
    pub parent_lsn: Option<Lsn>,
    /// Internal page whose right link queued this one after a split.
    pub split_from: Option<PageId>,
}

struct GistCheckState<'a, O: GistOpClass> {
    fetch: Fetcher<'a>,
    opclass: &'a O,
    cancel: &'a CancelToken,
    concerns: ConcernLog,
    pages_checked: u64,
    tuples_checked: u64,
    split_pages_followed: u64,
}

/// Walks the whole index. The caller holds the relation lock.
pub(crate) fn check_keys_consistency<O: GistOpClass>(
    index: &GistIndex<O>,
    opts: &CheckOptions,
) -> Result<GistReport> {
    let mut state = GistCheckState {
        fetch: Fetcher::new(index.store(), index.name()),
        opclass: index.opclass(),
        cancel: &opts.cancel,
        concerns: ConcernLog::new(opts.max_concerns),
        pages_checked: 0,
        tuples_checked: 0,
        split_pages_followed: 0,
    };
    debug!(target: "idxcheck::verify::gist", index = index.name(), opclass = index.opclass().name(), "verifying gist graph");

    let mut stack = vec![GistScanItem {
        page: GIST_ROOT,
        parent_lsn: None,
        split_from: None,
    }];
    let mut visited = 0u64;
    while let Some(item) = stack.pop() {
        state.cancel.check()?;
        visited += 1;
        let limit = state.fetch.page_count()?;
        if visited > limit {
            return Err(Corruption::new(
                CorruptionKind::CircularLink,
                index.name(),
                format!(
                    "index \"{}\" reaches more pages through its downlinks than the relation's {limit}",
                    index.name()
                ),
            )
            .on_page(item.page, None)
            .into());
        }

        let page = state.fetch.gist_page(item.page)?;
        state.pages_checked += 1;

        if page.is_deleted() {
            let message = format!("block {} of index \"{}\" is deleted", page.id, index.name());
            state
                .concerns
                .record(ConcernKind::DeletedGistPage, Some(page.id), message);
            continue;
        }
        if page.is_leaf() {
            // Leaves are checked from their parent; only a leaf root or a
            // damaged split right link gets here.
            if item.page == GIST_ROOT {
                continue;
            }
            if let Some(from) = item.split_from {
                return Err(Corruption::new(
                    CorruptionKind::GistSplitTarget,
                    index.name(),
                    format!(
                        "internal block {from} of index \"{}\" has a split right link to leaf block {}",
                        index.name(),
                        page.id
                    ),
                )
                .on_page(from, None)
                .with_detail(format!("Block={from} right link={}.", page.id))
                .into());
            }
            return Err(CheckError::Internal("gist leaf page queued for an inner visit"));
        }

        // The page split after its parent was read: the right half has no
        // downlink yet, so reach it through the right link.
        let split_since_parent = item
            .parent_lsn
            .is_some_and(|lsn| page.follow_right() || lsn < page.nsn);
        if item.page != GIST_ROOT && split_since_parent {
            if let Some(right) = page.right {
                trace!(target: "idxcheck::verify::gist", page = page.id.0, right = right.0, "following concurrent split");
                stack.push(GistScanItem {
                    page: right,
                    parent_lsn: item.parent_lsn,
                    split_from: Some(page.id),
                });
                state.split_pages_followed += 1;
            }
        }

        if state.check_internal_page(&page)? {
            for tuple in page.tuples() {
                stack.push(GistScanItem {
                    page: state.downlink(&page, tuple)?,
                    parent_lsn: Some(page.lsn),
                    split_from: None,
                });
            }
        }
    }

    let concerns_total = state.concerns.total();
    Ok(GistReport {
        index: index.name().to_owned(),
        opclass: index.opclass().name().to_owned(),
        pages_checked: state.pages_checked,
        tuples_checked: state.tuples_checked,
        split_pages_followed: state.split_pages_followed,
        concerns: state.concerns.into_vec(),
        concerns_total,
    })
}

impl<O: GistOpClass> GistCheckState<'_, O> {
    fn index(&self) -> &str {
        self.fetch.index()
    }

    fn corruption(&self, kind: CorruptionKind, page: &GistPage, message: String) -> Corruption {
        Corruption::new(kind, self.index(), message).on_page(page.id, Some(page.lsn))
    }

    fn downlink(&self, page: &GistPage, tuple: &GistTuple) -> Result<PageId> {
        tuple.child().map_err(|err| self.malformed(page, tuple, err))
    }

    fn malformed(&self, page: &GistPage, tuple: &GistTuple, err: CheckError) -> CheckError {
        match err {
            CheckError::Format(what) => self
                .corruption(
                    CorruptionKind::PageFormat,
                    page,
                    format!(
                        "tuple ({},{}) of index \"{}\" is malformed",
                        page.id,
                        tuple.slot,
                        self.index()
                    ),
                )
                .with_item(ItemLocation::new(page.id, tuple.slot))
                .with_detail(what)
                .into(),
            other => other,
        }
    }

    /// Checks every downlink of `page` against its child. Returns true when
    /// the children are internal pages, which then need a visit of their own.
    fn check_internal_page(&mut self, page: &GistPage) -> Result<bool> {
        let mut has_leaves = false;
        let mut has_internals = false;
        for tuple in page.tuples() {
            self.cancel.check()?;
            if tuple.invalid {
                let message = format!(
                    "index \"{}\" contains an inner tuple marked as invalid",
                    self.index()
                );
                self.concerns
                    .record(ConcernKind::InvalidGistTuple, Some(page.id), message);
            }
            let child = self.fetch.gist_page(self.downlink(page, tuple)?)?;
            if child.is_leaf() {
                has_leaves = true;
            } else {
                has_internals = true;
            }
            self.check_child_keys(page, tuple, &child)?;
        }

        if !has_leaves && !has_internals {
            return Err(self
                .corruption(
                    CorruptionKind::GistNoChildren,
                    page,
                    format!(
                        "index \"{}\" internal page has no downlink references",
                        self.index()
                    ),
                )
                .with_detail(format!("Block={}.", page.id))
                .into());
        }
        if has_leaves && has_internals {
            return Err(self
                .corruption(
                    CorruptionKind::GistMixedChildren,
                    page,
                    format!(
                        "index \"{}\" page references both internal and leaf pages",
                        self.index()
                    ),
                )
                .with_detail(format!("Block={}.", page.id))
                .into());
        }
        Ok(has_internals)
    }

    fn check_child_keys(&mut self, parent: &GistPage, downlink: &GistTuple, child: &GistPage) -> Result<()> {
        let parent_keys = (0..downlink.natts())
            .map(|attno| {
                parent
                    .attribute(downlink, attno)
                    .map(|raw| self.opclass.decompress(attno, raw))
                    .transpose()
                    .map_err(|err| self.malformed(parent, downlink, err))
            })
            .collect::<Result<Vec<_>>>()?;

        for tuple in child.tuples() {
            self.tuples_checked += 1;
            // Internal children report their own tuples when visited.
            if tuple.invalid && child.is_leaf() {
                let message = format!(
                    "index \"{}\" tuple ({},{}) is marked as invalid",
                    self.index(),
                    child.id,
                    tuple.slot
                );
                self.concerns
                    .record(ConcernKind::InvalidGistTuple, Some(child.id), message);
            }
            let tids = format!(
                "Parent tid=({},{}) child tid=({},{})",
                parent.id, downlink.slot, child.id, tuple.slot
            );
            if tuple.natts() != downlink.natts() {
                return Err(self
                    .corruption(
                        CorruptionKind::GistAttributeCount,
                        child,
                        format!(
                            "index \"{}\" tuple ({},{}) has {} attributes, its downlink has {}",
                            self.index(),
                            child.id,
                            tuple.slot,
                            tuple.natts(),
                            downlink.natts()
                        ),
                    )
                    .with_item(ItemLocation::new(parent.id, downlink.slot))
                    .with_item(ItemLocation::new(child.id, tuple.slot))
                    .into());
            }
            for (attno, parent_key) in parent_keys.iter().enumerate() {
                let raw = child.attribute(tuple, attno);
                let located = |c: Corruption| {
                    c.with_item(ItemLocation::new(parent.id, downlink.slot))
                        .with_item(ItemLocation::new(child.id, tuple.slot))
                        .with_detail(format!("{tids} attribute {attno}."))
                };
                match (parent_key, raw) {
                    (None, None) => {}
                    (Some(_), None) | (None, Some(_)) => {
                        return Err(located(self.corruption(
                            CorruptionKind::GistNullMismatch,
                            parent,
                            format!("index \"{}\" has inconsistent null records", self.index()),
                        ))
                        .into());
                    }
                    (Some(parent_key), Some(raw)) => {
                        let child_key = self
                            .opclass
                            .decompress(attno, raw)
                            .map_err(|err| self.malformed(child, tuple, err))?;
                        if !self.opclass.contained_by(attno, &child_key, parent_key) {
                            return Err(located(self.corruption(
                                CorruptionKind::GistContainment,
                                parent,
                                format!("index \"{}\" has inconsistent records", self.index()),
                            ))
                            .into());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
