#![forbid(unsafe_code)]

//! GiST index storage: page layout, operator classes, loader and rewrites.

use std::sync::Arc;

use crate::primitives::pager::PageStore;

/// Bottom-up loader.
pub mod build;
/// Page rewrite helpers.
pub mod edit;
/// Key semantics.
pub mod opclass;
/// Page format and decoded page views.
pub mod page;

pub use build::{GistBuildOptions, GistBuilder, GistEntry, GistLayout};
pub use opclass::{BoxKey, BoxOpClass, GistOpClass};
pub use page::{GistPage, GistPageImage, GistPageKind, GistTuple, GistTupleImage, GIST_ROOT};

/// Handle to one GiST index relation.
#[derive(Clone)]
pub struct GistIndex<O: GistOpClass = BoxOpClass> {
    name: String,
    store: Arc<dyn PageStore>,
    opclass: O,
}

impl<O: GistOpClass> GistIndex<O> {
    pub fn new(name: impl Into<String>, store: Arc<dyn PageStore>, opclass: O) -> Self {
        Self {
            name: name.into(),
            store,
            opclass,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &dyn PageStore {
        self.store.as_ref()
    }

    pub fn opclass(&self) -> &O {
        &self.opclass
    }
}
