#![forbid(unsafe_code)]
//! Online structural verification of B-Tree and GiST indexes.
//!
//! Every entry point walks the index one page at a time, working on owned
//! copies fetched through the index's [`PageStore`](crate::primitives::pager::PageStore),
//! and stops at the first confirmed corruption, which is returned as
//! [`CheckError::Corruption`]. Conditions that may be benign races or mere
//! oddities are *concerns*: they are logged at debug level and listed in the
//! returned report, but never fail the check.
//!
//! Two strengths are available for B-Trees:
//!
//! - weak (`strict = false`): holds an access-share lock, so writers keep
//!   running. Every page-local invariant is checked, plus the cross-page
//!   ordering between right siblings, which is rechecked before anything is
//!   reported.
//! - strict (`strict = true`): holds a share lock that excludes writers for the
//!   whole run, and additionally checks sibling link agreement and that every
//!   downlink key is a lower bound for its child page.
//!
//! Either strength can also confirm that every row of the backing table has a
//! matching leaf entry (`heapallindexed`), using a Bloom filter built while
//! the leaf level is walked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::primitives::pager::{LockMode, RelationLock};
use crate::storage::btree::BTreeIndex;
use crate::storage::gist::{GistIndex, GistOpClass};
use crate::types::{CheckError, PageId, Result};

/// Probabilistic fingerprint of leaf tuples.
pub mod bloom;
/// Page fetch and validation.
pub mod fetch;
/// GiST graph walk.
pub mod gist;
/// Cross-table presence check.
pub mod heapcheck;
/// B-Tree level walk, page invariants and downlink checks.
pub mod nbtree;

pub use bloom::BloomFilter;

/// Default Bloom filter budget, in KiB.
pub const DEFAULT_BLOOM_WORK_MEM_KB: u64 = 64 * 1024;
/// Default number of concerns kept in a report.
pub const DEFAULT_MAX_CONCERNS: usize = 32;

/// Cooperative cancellation flag, polled at least once per page.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; running checks return [`CheckError::Interrupted`].
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CheckError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Options controlling a verification run.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckOptions {
    /// Exclude writers and run the parent/child and sibling-link checks.
    pub strict: bool,
    /// Confirm that every table row has a matching leaf tuple.
    pub heapallindexed: bool,
    /// Memory budget for the Bloom filter, in KiB. The filter never goes below 1 MiB.
    pub bloom_work_mem_kb: u64,
    /// Fixed filter seed; a random seed is drawn when unset.
    pub bloom_seed: Option<u64>,
    /// Concerns kept in the report. Further concerns are only counted.
    pub max_concerns: usize,
    /// Cancellation handle.
    #[serde(skip)]
    pub cancel: CancelToken,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            strict: false,
            heapallindexed: false,
            bloom_work_mem_kb: DEFAULT_BLOOM_WORK_MEM_KB,
            bloom_seed: None,
            max_concerns: DEFAULT_MAX_CONCERNS,
            cancel: CancelToken::default(),
        }
    }
}

impl CheckOptions {
    /// Options for a weak or strict structural check.
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            ..Self::default()
        }
    }

    pub fn with_heapallindexed(mut self, enabled: bool) -> Self {
        self.heapallindexed = enabled;
        self
    }

    pub fn with_bloom_seed(mut self, seed: u64) -> Self {
        self.bloom_seed = Some(seed);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn lock_mode(&self) -> LockMode {
        if self.strict {
            LockMode::Share
        } else {
            LockMode::AccessShare
        }
    }
}

/// Category of a non-fatal finding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcernKind {
    /// The meta page's fast root differs from the true root.
    FastRootMismatch,
    /// A half-dead or deleted page was skipped on its level.
    IgnoredPage,
    /// A right sibling consulted for the cross-page check was deleted or half dead.
    DeletedRightSibling,
    /// A right sibling had no item to compare against.
    NoFirstItem,
    /// An apparent cross-page violation vanished because the page was deleted meanwhile.
    RecoveredRace,
    /// A GiST inner tuple left behind by an incomplete split.
    InvalidGistTuple,
    /// A deleted GiST page was reached through a downlink.
    DeletedGistPage,
}

/// A non-fatal finding.
#[derive(Clone, Debug, Serialize)]
pub struct Concern {
    pub kind: ConcernKind,
    pub page: Option<PageId>,
    pub message: String,
}

/// Bounded collector for concerns.
#[derive(Debug)]
pub(crate) struct ConcernLog {
    cap: usize,
    total: u64,
    kept: Vec<Concern>,
}

impl ConcernLog {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            cap,
            total: 0,
            kept: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, kind: ConcernKind, page: Option<PageId>, message: String) {
        debug!(target: "idxcheck::verify", ?kind, page = page.map(|p| p.0), "{message}");
        self.total += 1;
        if self.kept.len() < self.cap {
            self.kept.push(Concern {
                kind,
                page,
                message,
            });
        }
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    pub(crate) fn into_vec(self) -> Vec<Concern> {
        self.kept
    }
}

/// Outcome of the cross-table presence check.
#[derive(Clone, Debug, Default, Serialize)]
pub struct HeapCheckSummary {
    pub table: String,
    /// Rows looked up in the filter and found.
    pub rows_present: u64,
    /// Rows skipped because they are too recent for a weak check.
    pub rows_skipped: u64,
    pub bloom_bits: u64,
    pub bloom_hash_funcs: usize,
    pub proportion_bits_set: f64,
}

/// Result of a B-Tree check that found no corruption.
#[derive(Clone, Debug, Serialize)]
pub struct BTreeReport {
    pub index: String,
    pub strict: bool,
    pub heapallindexed: bool,
    /// True root, `None` for an empty index.
    pub root: Option<PageId>,
    pub root_level: u32,
    pub levels_checked: u32,
    pub pages_checked: u64,
    pub pages_ignored: u64,
    pub items_checked: u64,
    pub downlinks_checked: u64,
    pub leaf_tuples_fingerprinted: u64,
    pub heap: Option<HeapCheckSummary>,
    pub concerns: Vec<Concern>,
    /// Concerns seen, including those beyond `max_concerns`.
    pub concerns_total: u64,
}

/// Result of a GiST check that found no corruption.
#[derive(Clone, Debug, Serialize)]
pub struct GistReport {
    pub index: String,
    pub opclass: String,
    pub pages_checked: u64,
    pub tuples_checked: u64,
    /// Right siblings visited because a split happened after their parent was read.
    pub split_pages_followed: u64,
    pub concerns: Vec<Concern>,
    pub concerns_total: u64,
}

/// Checks a B-Tree's structure.
///
/// Weak checks cover page-local ordering, high keys and cross-page ordering;
/// strict checks add sibling-link agreement and downlink lower bounds.
pub fn check(index: &BTreeIndex, strict: bool) -> Result<BTreeReport> {
    check_with_options(index, &CheckOptions::new(strict))
}

/// Like [`check`], optionally also confirming every table row is indexed.
///
/// Fails with [`CheckError::Invalid`] when `cross_table` is requested for an
/// index without an attached table.
pub fn check_with_table(index: &BTreeIndex, strict: bool, cross_table: bool) -> Result<BTreeReport> {
    check_with_options(
        index,
        &CheckOptions::new(strict).with_heapallindexed(cross_table),
    )
}

/// Checks a B-Tree with full control over the run.
pub fn check_with_options(index: &BTreeIndex, opts: &CheckOptions) -> Result<BTreeReport> {
    if opts.heapallindexed && index.table().is_none() {
        return Err(CheckError::Invalid(
            "cross-table verification needs the index's table",
        ));
    }
    let _lock = RelationLock::acquire(index.store(), opts.lock_mode())?;
    let report = nbtree::check_every_level(index, opts)?;
    info!(
        target: "idxcheck::verify",
        index = %report.index,
        strict = report.strict,
        pages = report.pages_checked,
        items = report.items_checked,
        concerns = report.concerns_total,
        "btree check passed"
    );
    Ok(report)
}

/// Checks a GiST index's parent/child key consistency.
pub fn check_graph<O: GistOpClass>(index: &GistIndex<O>) -> Result<GistReport> {
    check_graph_with_options(index, &CheckOptions::default())
}

/// Like [`check_graph`], honoring the cancellation token and concern cap of `opts`.
///
/// GiST checks always hold a share lock; `strict` and `heapallindexed` are ignored.
pub fn check_graph_with_options<O: GistOpClass>(
    index: &GistIndex<O>,
    opts: &CheckOptions,
) -> Result<GistReport> {
    let _lock = RelationLock::acquire(index.store(), LockMode::Share)?;
    let report = gist::check_keys_consistency(index, opts)?;
    info!(
        target: "idxcheck::verify",
        index = %report.index,
        pages = report.pages_checked,
        tuples = report.tuples_checked,
        concerns = report.concerns_total,
        "gist check passed"
    );
    Ok(report)
}
