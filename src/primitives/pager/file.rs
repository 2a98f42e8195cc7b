use std::{fs::OpenOptions, path::Path, sync::Arc};

use tracing::debug;

use super::{validate_page_size, LockMode, PageStore, PageWrite, RelationLocks};
use crate::primitives::io::{eof_as_none, FileIo, StdFileIo};
use crate::types::{
    page::{self, PageHeader, PAGE_HDR_LEN},
    CheckError, PageId, Result,
};

/// Index relation stored as a flat file of fixed-size pages.
pub struct FilePageStore {
    io: Arc<dyn FileIo>,
    page_size: u32,
    locks: RelationLocks,
}

impl FilePageStore {
    /// Creates (or truncates) `path` as an empty relation.
    pub fn create(path: impl AsRef<Path>, page_size: u32) -> Result<Self> {
        validate_page_size(page_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        Ok(Self::with_io(Arc::new(StdFileIo::new(file)), page_size))
    }

    /// Opens an existing relation, taking the page size from page 0.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let io = StdFileIo::open_read_only(path.as_ref())?;
        let mut hdr = [0u8; PAGE_HDR_LEN];
        eof_as_none(io.read_at(0, &mut hdr))?
            .ok_or(CheckError::Invalid("relation file shorter than one page header"))?;
        let header = PageHeader::decode(&hdr)?;
        validate_page_size(header.page_size)?;
        debug!(
            target: "idxcheck::pager",
            path = %path.as_ref().display(),
            page_size = header.page_size,
            "opened relation file"
        );
        Ok(Self::with_io(Arc::new(io), header.page_size))
    }

    /// Wraps an arbitrary [`FileIo`] implementation.
    pub fn with_io(io: Arc<dyn FileIo>, page_size: u32) -> Self {
        Self {
            io,
            page_size,
            locks: RelationLocks::default(),
        }
    }

    fn offset(&self, id: PageId) -> Result<u64> {
        id.0.checked_mul(self.page_size as u64)
            .ok_or(CheckError::Invalid("page offset overflow"))
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> Result<u64> {
        Ok(self.io.len()? / self.page_size as u64)
    }

    fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size as usize];
        let off = self.offset(id)?;
        eof_as_none(self.io.read_at(off, &mut buf))?
            .ok_or(CheckError::Invalid("page id beyond end of relation"))?;
        Ok(buf)
    }

    fn lock_relation(&self, mode: LockMode) -> Result<()> {
        self.locks.acquire(mode);
        Ok(())
    }

    fn unlock_relation(&self, mode: LockMode) {
        self.locks.release(mode);
    }
}

impl PageWrite for FilePageStore {
    fn write_page(&self, id: PageId, mut page_buf: Vec<u8>) -> Result<()> {
        if page_buf.len() != self.page_size as usize {
            return Err(CheckError::Invalid("page buffer length differs from page size"));
        }
        self.locks.check_writable()?;
        page::seal(&mut page_buf)?;
        let off = self.offset(id)?;
        if off > self.io.len()? {
            return Err(CheckError::Invalid("page write would leave a gap"));
        }
        self.io.write_at(off, &page_buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{page::PageKind, Lsn};
    use tempfile::tempdir;

    #[test]
    fn create_write_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rel.idx");
        let store = FilePageStore::create(&path, 1024)?;
        let mut buf = vec![0u8; 1024];
        PageHeader::new(PageId(0), PageKind::Meta, 1024, Lsn(5))?.encode(&mut buf)?;
        store.write_page(PageId(0), buf)?;
        drop(store);

        let reopened = FilePageStore::open(&path)?;
        assert_eq!(reopened.page_size(), 1024);
        assert_eq!(reopened.page_count()?, 1);
        let page_buf = reopened.read_page(PageId(0))?;
        let header = PageHeader::decode(&page_buf)?;
        assert!(page::crc_matches(&page_buf, &header));
        assert!(reopened.read_page(PageId(1)).is_err());
        Ok(())
    }
}
