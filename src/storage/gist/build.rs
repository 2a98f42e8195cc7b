//! Bottom-up GiST loader. The root is written last, at page 0.

use tracing::debug;

use super::opclass::GistOpClass;
use super::page::{GistPageImage, GistPageKind, GistTupleImage, GIST_ROOT};
use crate::primitives::pager::PageWrite;
use crate::types::{page::DEFAULT_PAGE_SIZE, CheckError, Lsn, PageId, Result, RowId};

/// Knobs for [`GistBuilder`].
#[derive(Clone, Debug)]
pub struct GistBuildOptions {
    pub page_size: u32,
    pub leaf_fanout: usize,
    pub internal_fanout: usize,
    pub lsn: Lsn,
}

impl Default for GistBuildOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            leaf_fanout: 64,
            internal_fanout: 64,
            lsn: Lsn(1),
        }
    }
}

/// One indexed row: a key per attribute (`None` for null) and its row id.
#[derive(Clone, Debug)]
pub struct GistEntry<K> {
    pub attrs: Vec<Option<K>>,
    pub row: RowId,
}

/// Page ids of a built index, leaf level first. The last level is `[GIST_ROOT]`.
#[derive(Clone, Debug, Default)]
pub struct GistLayout {
    pub levels: Vec<Vec<PageId>>,
}

impl GistLayout {
    pub fn root_level(&self) -> u32 {
        self.levels.len().saturating_sub(1) as u32
    }

    pub fn level(&self, level: u32) -> &[PageId] {
        self.levels
            .get(level as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Writes a complete GiST index into an empty store.
pub struct GistBuilder<'a, S: PageWrite + ?Sized, O: GistOpClass> {
    store: &'a S,
    opclass: &'a O,
    opts: GistBuildOptions,
}

type Summary<K> = (Vec<Option<K>>, PageId);

impl<'a, S: PageWrite + ?Sized, O: GistOpClass> GistBuilder<'a, S, O> {
    pub fn new(store: &'a S, opclass: &'a O, opts: GistBuildOptions) -> Result<Self> {
        if opts.leaf_fanout < 1 || opts.internal_fanout < 2 {
            return Err(CheckError::Invalid("gist fanout too small"));
        }
        if store.page_size() != opts.page_size {
            return Err(CheckError::Invalid("builder page size differs from store"));
        }
        Ok(Self {
            store,
            opclass,
            opts,
        })
    }

    /// Loads `entries` in the given order. Every entry must have the same
    /// number of attributes, and each attribute must be null in all entries
    /// or in none.
    pub fn build(&self, entries: Vec<GistEntry<O::Key>>) -> Result<GistLayout> {
        let natts = entries.first().map_or(1, |e| e.attrs.len());
        if natts == 0 {
            return Err(CheckError::Invalid("gist entries need at least one attribute"));
        }
        for entry in &entries {
            if entry.attrs.len() != natts {
                return Err(CheckError::Invalid("gist entries differ in attribute count"));
            }
            for (attno, attr) in entry.attrs.iter().enumerate() {
                if attr.is_some() != entries[0].attrs[attno].is_some() {
                    return Err(CheckError::Invalid("gist attribute nullness must be uniform"));
                }
            }
        }

        // Claim page 0 so later pages never leave a gap.
        self.write(GIST_ROOT, GistPageKind::Leaf, Vec::new())?;
        let mut layout = GistLayout::default();
        if entries.len() <= self.opts.leaf_fanout {
            let tuples = entries
                .iter()
                .map(|e| GistTupleImage::leaf(e.row, self.compress(&e.attrs)))
                .collect();
            self.write(GIST_ROOT, GistPageKind::Leaf, tuples)?;
            layout.levels.push(vec![GIST_ROOT]);
            return Ok(layout);
        }

        let mut next_id = 1u64;
        let mut pending: Vec<Summary<O::Key>> = Vec::new();
        let mut ids = Vec::new();
        for chunk in entries.chunks(self.opts.leaf_fanout) {
            let id = PageId(next_id);
            next_id += 1;
            let tuples = chunk
                .iter()
                .map(|e| GistTupleImage::leaf(e.row, self.compress(&e.attrs)))
                .collect();
            self.write(id, GistPageKind::Leaf, tuples)?;
            let attrs: Vec<&[Option<O::Key>]> = chunk.iter().map(|e| e.attrs.as_slice()).collect();
            pending.push((self.union(natts, &attrs), id));
            ids.push(id);
        }
        layout.levels.push(ids);

        while pending.len() > self.opts.internal_fanout {
            let mut next = Vec::new();
            let mut ids = Vec::new();
            for chunk in pending.chunks(self.opts.internal_fanout) {
                let id = PageId(next_id);
                next_id += 1;
                self.write(id, GistPageKind::Internal, self.downlinks(chunk))?;
                let attrs: Vec<&[Option<O::Key>]> = chunk.iter().map(|s| s.0.as_slice()).collect();
                next.push((self.union(natts, &attrs), id));
                ids.push(id);
            }
            layout.levels.push(ids);
            pending = next;
        }
        self.write(GIST_ROOT, GistPageKind::Internal, self.downlinks(&pending))?;
        layout.levels.push(vec![GIST_ROOT]);
        debug!(
            target: "idxcheck::gist::build",
            opclass = self.opclass.name(),
            height = layout.root_level(),
            pages = next_id,
            "gist load finished"
        );
        Ok(layout)
    }

    fn compress(&self, attrs: &[Option<O::Key>]) -> Vec<Option<Vec<u8>>> {
        attrs
            .iter()
            .enumerate()
            .map(|(attno, a)| a.as_ref().map(|k| self.opclass.compress(attno, k)))
            .collect()
    }

    fn union(&self, natts: usize, members: &[&[Option<O::Key>]]) -> Vec<Option<O::Key>> {
        (0..natts)
            .map(|attno| {
                let keys: Vec<O::Key> = members
                    .iter()
                    .filter_map(|attrs| attrs[attno].clone())
                    .collect();
                self.opclass.union(attno, &keys)
            })
            .collect()
    }

    fn downlinks(&self, children: &[Summary<O::Key>]) -> Vec<GistTupleImage> {
        children
            .iter()
            .map(|(attrs, id)| GistTupleImage::downlink(*id, self.compress(attrs)))
            .collect()
    }

    fn write(&self, id: PageId, kind: GistPageKind, tuples: Vec<GistTupleImage>) -> Result<()> {
        let image = GistPageImage {
            id,
            lsn: self.opts.lsn,
            nsn: Lsn(0),
            kind,
            flags: 0,
            right: None,
            tuples,
        };
        self.store.write_page(id, image.encode(self.opts.page_size)?)
    }
}
