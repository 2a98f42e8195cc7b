//! Page rewrites for GiST images: simulated splits and planted damage.

use super::page::GistPageImage;
use crate::primitives::pager::PageWrite;
use crate::types::{Lsn, PageId, Result};

/// Decodes page `id`, applies `f`, bumps the LSN and writes it back.
pub fn rewrite<S, F>(store: &S, id: PageId, f: F) -> Result<()>
where
    S: PageWrite + ?Sized,
    F: FnOnce(&mut GistPageImage) -> Result<()>,
{
    let mut image = GistPageImage::decode(&store.read_page(id)?)?;
    f(&mut image)?;
    image.lsn = Lsn(image.lsn.0 + 1);
    store.write_page(id, image.encode(store.page_size())?)
}

/// Writes `image` at the end of the store and returns its page id.
pub fn append<S: PageWrite + ?Sized>(store: &S, mut image: GistPageImage) -> Result<PageId> {
    let id = PageId(store.page_count()?);
    image.id = id;
    store.write_page(id, image.encode(store.page_size())?)?;
    Ok(id)
}

/// Sets and clears page flag bits.
pub fn set_flags<S: PageWrite + ?Sized>(store: &S, id: PageId, set: u8, clear: u8) -> Result<()> {
    rewrite(store, id, |image| {
        image.flags = (image.flags | set) & !clear;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::pager::{MemPageStore, PageStore};
    use crate::storage::gist::page::{flags, GistPage, GistPageKind};

    #[test]
    fn append_assigns_next_id_and_flags_stick() -> Result<()> {
        let store = MemPageStore::new(512)?;
        let empty = GistPageImage {
            id: PageId(0),
            lsn: Lsn(2),
            nsn: Lsn(0),
            kind: GistPageKind::Leaf,
            flags: 0,
            right: None,
            tuples: Vec::new(),
        };
        assert_eq!(append(&store, empty.clone())?, PageId(0));
        assert_eq!(append(&store, empty)?, PageId(1));
        set_flags(&store, PageId(1), flags::DELETED, 0)?;
        let page = GistPage::decode(store.read_page(PageId(1))?)?;
        assert!(page.is_deleted());
        assert_eq!(page.lsn, Lsn(3));
        assert_eq!(store.page_count()?, 2);
        Ok(())
    }
}
