//! Copies a page out of the store and validates it before any check looks at it.
//!
//! Decode failures are reported as corruption of the page they were found
//! on; store-level failures (I/O, cancellation) pass through unchanged.

use tracing::trace;

use crate::primitives::pager::PageStore;
use crate::storage::btree::{BTreeMeta, BTreePage, BTREE_MAGIC, BTREE_VERSION, META_PAGE};
use crate::storage::gist::GistPage;
use crate::types::{
    page::{crc_matches, PageHeader, PageKind},
    CheckError, Corruption, CorruptionKind, PageId, Result,
};

/// Page reader bound to one index.
#[derive(Clone, Copy)]
pub struct Fetcher<'a> {
    store: &'a dyn PageStore,
    index: &'a str,
}

impl<'a> Fetcher<'a> {
    pub fn new(store: &'a dyn PageStore, index: &'a str) -> Self {
        Self { store, index }
    }

    pub fn index(&self) -> &'a str {
        self.index
    }

    pub fn page_count(&self) -> Result<u64> {
        self.store.page_count()
    }

    /// Reads page `id` and checks its header, page number, size and CRC.
    pub fn raw(&self, id: PageId) -> Result<(PageHeader, Vec<u8>)> {
        if id.0 >= self.store.page_count()? {
            return Err(self
                .corrupt(
                    CorruptionKind::PageFormat,
                    id,
                    format!("block {id} is beyond the end of index \"{}\"", self.index),
                )
                .into());
        }
        let buf = self.store.read_page(id)?;
        let header = PageHeader::decode(&buf).map_err(|err| self.format_error(id, err))?;
        if header.page_no != id {
            return Err(self
                .corrupt(
                    CorruptionKind::PageFormat,
                    id,
                    format!(
                        "block {id} of index \"{}\" claims to be block {}",
                        self.index, header.page_no
                    ),
                )
                .into());
        }
        if header.page_size != self.store.page_size() || buf.len() != header.page_size as usize {
            return Err(self
                .corrupt(
                    CorruptionKind::PageFormat,
                    id,
                    format!(
                        "block {id} of index \"{}\" has page size {}, expected {}",
                        self.index,
                        header.page_size,
                        self.store.page_size()
                    ),
                )
                .into());
        }
        if !crc_matches(&buf, &header) {
            return Err(Corruption::new(
                CorruptionKind::Checksum,
                self.index,
                format!(
                    "page verification failed, calculated checksum does not match for block {id} in index \"{}\"",
                    self.index
                ),
            )
            .on_page(id, Some(header.lsn))
            .into());
        }
        trace!(target: "idxcheck::verify::fetch", page = id.0, kind = ?header.kind, lsn = header.lsn.0, "page fetched");
        Ok((header, buf))
    }

    /// Reads and validates the B-Tree meta page.
    pub fn btree_meta(&self) -> Result<BTreeMeta> {
        let (header, buf) = self.raw(META_PAGE)?;
        let meta = if header.kind == PageKind::Meta {
            Some(BTreeMeta::decode(&buf).map_err(|err| self.format_error(META_PAGE, err))?)
        } else {
            None
        };
        match meta {
            Some(meta) if meta.magic == BTREE_MAGIC => {
                if meta.version != BTREE_VERSION {
                    return Err(self
                        .corrupt(
                            CorruptionKind::MetaPage,
                            META_PAGE,
                            format!(
                                "version mismatch in index \"{}\": file version {}, code version {}",
                                self.index, meta.version, BTREE_VERSION
                            ),
                        )
                        .into());
                }
                Ok(meta)
            }
            _ => Err(self
                .corrupt(
                    CorruptionKind::MetaPage,
                    META_PAGE,
                    format!("index \"{}\" meta page is corrupt", self.index),
                )
                .into()),
        }
    }

    /// Reads and validates a non-meta B-Tree page.
    pub fn btree_page(&self, id: PageId) -> Result<BTreePage> {
        let (header, buf) = self.raw(id)?;
        match header.kind {
            PageKind::BTreeLeaf | PageKind::BTreeInternal => {}
            PageKind::Meta => {
                return Err(self
                    .corrupt(
                        CorruptionKind::MetaPage,
                        id,
                        format!("invalid meta page found at block {id} in index \"{}\"", self.index),
                    )
                    .into())
            }
            PageKind::GistLeaf | PageKind::GistInternal => {
                return Err(self
                    .corrupt(
                        CorruptionKind::PageFormat,
                        id,
                        format!("block {id} of index \"{}\" is not a B-Tree page", self.index),
                    )
                    .into())
            }
        }
        let page = BTreePage::decode(buf).map_err(|err| self.format_error(id, err))?;
        let at = |kind, message: String| -> CheckError {
            Corruption::new(kind, self.index, message)
                .on_page(id, Some(page.lsn))
                .into()
        };

        if page.is_leaf() && !page.is_deleted() && page.level != 0 {
            return Err(at(
                CorruptionKind::Level,
                format!(
                    "invalid leaf page level {} for block {id} in index \"{}\"",
                    page.level, self.index
                ),
            ));
        }
        if !page.is_leaf() && !page.is_deleted() && page.level == 0 {
            return Err(at(
                CorruptionKind::Level,
                format!("invalid internal page level 0 for block {id} in index \"{}\"", self.index),
            ));
        }
        if !page.is_leaf() && page.has_garbage() {
            return Err(at(
                CorruptionKind::PageFormat,
                format!("internal page block {id} in index \"{}\" has garbage items", self.index),
            ));
        }
        if !page.is_ignorable() && page.is_rightmost() != page.high_key().is_none() {
            return Err(at(
                CorruptionKind::PageFormat,
                format!(
                    "block {id} of index \"{}\" has a high key that disagrees with its right link",
                    self.index
                ),
            ));
        }
        Ok(page)
    }

    /// Reads and validates a GiST page.
    pub fn gist_page(&self, id: PageId) -> Result<GistPage> {
        let (header, buf) = self.raw(id)?;
        if !matches!(header.kind, PageKind::GistLeaf | PageKind::GistInternal) {
            return Err(self
                .corrupt(
                    CorruptionKind::PageFormat,
                    id,
                    format!("block {id} of index \"{}\" is not a GiST page", self.index),
                )
                .into());
        }
        GistPage::decode(buf).map_err(|err| self.format_error(id, err))
    }

    fn corrupt(&self, kind: CorruptionKind, id: PageId, message: String) -> Corruption {
        Corruption::new(kind, self.index, message).on_page(id, None)
    }

    fn format_error(&self, id: PageId, err: CheckError) -> CheckError {
        match err {
            CheckError::Format(what) => self
                .corrupt(
                    CorruptionKind::PageFormat,
                    id,
                    format!("block {id} of index \"{}\" is malformed", self.index),
                )
                .with_detail(what)
                .into(),
            other => other,
        }
    }
}
