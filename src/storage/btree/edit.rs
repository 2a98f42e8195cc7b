//! In-place page rewrites. Used to simulate concurrent writers and to
//! plant damage when exercising the verifier.

use super::meta::{BTreeMeta, META_PAGE};
use super::page::PageImage;
use crate::primitives::pager::PageWrite;
use crate::types::{page::PageHeader, Lsn, PageId, Result, RowId};

/// Decodes page `id`, applies `f`, bumps the LSN and writes it back.
pub fn rewrite<S, F>(store: &S, id: PageId, f: F) -> Result<()>
where
    S: PageWrite + ?Sized,
    F: FnOnce(&mut PageImage) -> Result<()>,
{
    let mut image = PageImage::decode(&store.read_page(id)?)?;
    f(&mut image)?;
    image.lsn = Lsn(image.lsn.0 + 1);
    store.write_page(id, image.encode(store.page_size())?)
}

/// Swaps the keys stored in two slots of one page.
pub fn swap_keys<S: PageWrite + ?Sized>(store: &S, id: PageId, a: u16, b: u16) -> Result<()> {
    rewrite(store, id, |image| image.items.swap_keys(a as usize, b as usize))
}

/// Replaces the key stored in `slot`.
pub fn replace_key<S: PageWrite + ?Sized>(
    store: &S,
    id: PageId,
    slot: u16,
    key: &[u8],
) -> Result<()> {
    rewrite(store, id, |image| {
        let target = image
            .items
            .key_mut(slot as usize)
            .ok_or(crate::types::CheckError::Invalid("slot index out of bounds"))?;
        *target = key.to_vec();
        Ok(())
    })
}

/// Drops the item in `slot`.
pub fn remove_item<S: PageWrite + ?Sized>(store: &S, id: PageId, slot: u16) -> Result<()> {
    rewrite(store, id, |image| image.items.remove(slot as usize))
}

/// Removes the leaf entry pointing at `row`, returning whether one was found.
pub fn remove_row<S: PageWrite + ?Sized>(store: &S, id: PageId, row: RowId) -> Result<bool> {
    let image = PageImage::decode(&store.read_page(id)?)?;
    let slot = match &image.items {
        super::page::ImageItems::Leaf(items) => items.iter().position(|(_, r)| *r == row),
        super::page::ImageItems::Internal(_) => None,
    };
    match slot {
        Some(slot) => {
            remove_item(store, id, slot as u16)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Sets and clears flag bits.
pub fn set_flags<S: PageWrite + ?Sized>(store: &S, id: PageId, set: u8, clear: u8) -> Result<()> {
    rewrite(store, id, |image| {
        image.flags = (image.flags | set) & !clear;
        Ok(())
    })
}

/// Rewrites the meta page.
pub fn rewrite_meta<S, F>(store: &S, f: F) -> Result<()>
where
    S: PageWrite + ?Sized,
    F: FnOnce(&mut BTreeMeta),
{
    let buf = store.read_page(META_PAGE)?;
    let lsn = PageHeader::decode(&buf)?.lsn;
    let mut meta = BTreeMeta::decode(&buf)?;
    f(&mut meta);
    store.write_page(META_PAGE, meta.encode(store.page_size(), Lsn(lsn.0 + 1))?)
}
