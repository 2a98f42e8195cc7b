#![forbid(unsafe_code)]

//! B-Tree index storage: page layout, meta page, bulk loading and rewrites.

use std::sync::Arc;

use crate::primitives::pager::PageStore;
use crate::storage::compare::KeyComparator;
use crate::storage::heap::TableScanner;

/// Bulk loader.
pub mod build;
/// Page rewrite helpers.
pub mod edit;
/// Meta page layout.
pub mod meta;
/// Page format and decoded page views.
pub mod page;

pub use build::{BTreeBuildOptions, BTreeBuilder, BTreeLayout};
pub use meta::{BTreeMeta, BTREE_MAGIC, BTREE_VERSION, META_PAGE};
pub use page::{BTreePage, IgnoreReason, Item, ItemTarget, PageBody};

/// Handle to one B-Tree index relation. Read-only for the verifier.
#[derive(Clone)]
pub struct BTreeIndex {
    name: String,
    store: Arc<dyn PageStore>,
    comparator: Arc<dyn KeyComparator>,
    table: Option<Arc<dyn TableScanner>>,
}

impl BTreeIndex {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn PageStore>,
        comparator: Arc<dyn KeyComparator>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            comparator,
            table: None,
        }
    }

    /// Attaches the table the index was built from.
    pub fn with_table(mut self, table: Arc<dyn TableScanner>) -> Self {
        self.table = Some(table);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &dyn PageStore {
        self.store.as_ref()
    }

    pub fn comparator(&self) -> &dyn KeyComparator {
        self.comparator.as_ref()
    }

    pub fn table(&self) -> Option<&dyn TableScanner> {
        self.table.as_deref()
    }
}
