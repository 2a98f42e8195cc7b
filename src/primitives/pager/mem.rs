use parking_lot::RwLock;

use super::{validate_page_size, LockMode, PageStore, PageWrite, RelationLocks};
use crate::types::{page, CheckError, PageId, Result};

/// Heap-backed page store.
///
/// Writes are refused while a [`LockMode::Share`] lock is held, which is how
/// strict checks exclude concurrent writers.
#[derive(Debug)]
pub struct MemPageStore {
    page_size: u32,
    pages: RwLock<Vec<Vec<u8>>>,
    locks: RelationLocks,
}

impl MemPageStore {
    /// Creates an empty store with fixed-size pages.
    pub fn new(page_size: u32) -> Result<Self> {
        validate_page_size(page_size)?;
        Ok(Self {
            page_size,
            pages: RwLock::new(Vec::new()),
            locks: RelationLocks::default(),
        })
    }

    /// Stores `bytes` verbatim, without recomputing the CRC.
    pub fn write_raw(&self, id: PageId, bytes: Vec<u8>) -> Result<()> {
        self.store(id, bytes)
    }

    /// Copies every page, in page order.
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.pages.read().clone()
    }

    /// Number of relation locks of `mode` currently held.
    pub fn locks_held(&self, mode: LockMode) -> usize {
        self.locks.held(mode)
    }

    fn store(&self, id: PageId, bytes: Vec<u8>) -> Result<()> {
        if bytes.len() != self.page_size as usize {
            return Err(CheckError::Invalid("page buffer length differs from page size"));
        }
        self.locks.check_writable()?;
        let mut pages = self.pages.write();
        let idx = usize::try_from(id.0).map_err(|_| CheckError::Invalid("page id overflow"))?;
        match idx.cmp(&pages.len()) {
            std::cmp::Ordering::Less => pages[idx] = bytes,
            std::cmp::Ordering::Equal => pages.push(bytes),
            std::cmp::Ordering::Greater => {
                return Err(CheckError::Invalid("page write would leave a gap"))
            }
        }
        Ok(())
    }
}

impl PageStore for MemPageStore {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> Result<u64> {
        Ok(self.pages.read().len() as u64)
    }

    fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        let pages = self.pages.read();
        usize::try_from(id.0)
            .ok()
            .and_then(|idx| pages.get(idx))
            .cloned()
            .ok_or(CheckError::Invalid("page id beyond end of relation"))
    }

    fn lock_relation(&self, mode: LockMode) -> Result<()> {
        self.locks.acquire(mode);
        Ok(())
    }

    fn unlock_relation(&self, mode: LockMode) {
        self.locks.release(mode);
    }
}

impl PageWrite for MemPageStore {
    fn write_page(&self, id: PageId, mut page_buf: Vec<u8>) -> Result<()> {
        page::seal(&mut page_buf)?;
        self.store(id, page_buf)
    }
}
