#![forbid(unsafe_code)]
//! Page stores the verifier reads through, plus relation-level locking.
//!
//! A store hands out *copies* of pages: nothing the verifier inspects can
//! change underneath it, and no page-level lock outlives a single
//! [`PageStore::read_page`] call.

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{page::MIN_PAGE_SIZE, CheckError, PageId, Result};

mod file;
mod mem;

pub use file::FilePageStore;
pub use mem::MemPageStore;

/// Largest page size whose payload offsets still fit the u16 slot directory.
pub const MAX_PAGE_SIZE: u32 = 32 * 1024;

/// Strength of a relation-level lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Excludes only conflicting DDL; writers keep running.
    AccessShare,
    /// Excludes every writer for as long as it is held.
    Share,
}

/// Read access to the pages of one index relation.
pub trait PageStore: Send + Sync {
    /// Returns the page size in bytes.
    fn page_size(&self) -> u32;
    /// Number of pages currently allocated.
    fn page_count(&self) -> Result<u64>;
    /// Copies page `id` out of the store.
    fn read_page(&self, id: PageId) -> Result<Vec<u8>>;
    /// Takes a relation lock of the given strength.
    fn lock_relation(&self, mode: LockMode) -> Result<()>;
    /// Releases a lock taken with [`PageStore::lock_relation`].
    fn unlock_relation(&self, mode: LockMode);
}

/// Stores that can also be written, used by index builders and damage injection.
pub trait PageWrite: PageStore {
    /// Replaces or appends page `id`. The page CRC is recomputed before storing.
    fn write_page(&self, id: PageId, page: Vec<u8>) -> Result<()>;
}

/// Holds a relation lock until dropped.
pub struct RelationLock<'a> {
    store: &'a dyn PageStore,
    mode: LockMode,
}

impl<'a> RelationLock<'a> {
    /// Acquires `mode` on `store`.
    pub fn acquire(store: &'a dyn PageStore, mode: LockMode) -> Result<Self> {
        store.lock_relation(mode)?;
        trace!(target: "idxcheck::pager", ?mode, "relation lock acquired");
        Ok(Self { store, mode })
    }

    /// Strength of the held lock.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for RelationLock<'_> {
    fn drop(&mut self) {
        self.store.unlock_relation(self.mode);
        trace!(target: "idxcheck::pager", mode = ?self.mode, "relation lock released");
    }
}

#[derive(Default, Debug)]
struct LockCounts {
    access_share: usize,
    share: usize,
}

/// In-process lock table shared by the bundled stores.
#[derive(Default, Debug)]
pub(crate) struct RelationLocks {
    counts: Mutex<LockCounts>,
}

impl RelationLocks {
    pub(crate) fn acquire(&self, mode: LockMode) {
        let mut counts = self.counts.lock();
        match mode {
            LockMode::AccessShare => counts.access_share += 1,
            LockMode::Share => counts.share += 1,
        }
    }

    pub(crate) fn release(&self, mode: LockMode) {
        let mut counts = self.counts.lock();
        let slot = match mode {
            LockMode::AccessShare => &mut counts.access_share,
            LockMode::Share => &mut counts.share,
        };
        *slot = slot.saturating_sub(1);
    }

    /// Fails when a share lock currently excludes writers.
    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.counts.lock().share > 0 {
            return Err(CheckError::Invalid("relation is share-locked against writers"));
        }
        Ok(())
    }

    pub(crate) fn held(&self, mode: LockMode) -> usize {
        let counts = self.counts.lock();
        match mode {
            LockMode::AccessShare => counts.access_share,
            LockMode::Share => counts.share,
        }
    }
}

pub(crate) fn validate_page_size(page_size: u32) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(CheckError::Invalid("page size out of supported range"));
    }
    Ok(())
}
