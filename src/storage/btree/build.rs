//! Bottom-up bulk loader producing well-formed trees.

use tracing::debug;

use super::meta::{BTreeMeta, META_PAGE};
use super::page::{flags, ImageItems, PageImage, PAYLOAD_HEADER_LEN, SLOT_ENTRY_LEN};
use crate::primitives::pager::PageWrite;
use crate::storage::compare::KeyComparator;
use crate::types::{
    page::{DEFAULT_PAGE_SIZE, PAGE_HDR_LEN},
    CheckError, Lsn, PageId, Result, RowId,
};

/// Knobs for [`BTreeBuilder`].
#[derive(Clone, Debug)]
pub struct BTreeBuildOptions {
    pub page_size: u32,
    /// Maximum items per leaf.
    pub leaf_fanout: usize,
    /// Maximum downlinks per internal page, the sentinel included.
    pub internal_fanout: usize,
    /// LSN stamped on every written page.
    pub lsn: Lsn,
}

impl Default for BTreeBuildOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            leaf_fanout: 128,
            internal_fanout: 128,
            lsn: Lsn(1),
        }
    }
}

/// Page ids of a freshly built tree, leaf level first.
#[derive(Clone, Debug, Default)]
pub struct BTreeLayout {
    pub root: Option<PageId>,
    pub levels: Vec<Vec<PageId>>,
}

impl BTreeLayout {
    /// Level of the root page.
    pub fn root_level(&self) -> u32 {
        self.levels.len().saturating_sub(1) as u32
    }

    /// Pages of `level`, left to right.
    pub fn level(&self, level: u32) -> &[PageId] {
        self.levels
            .get(level as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Writes a complete tree (meta page included) into an empty store.
pub struct BTreeBuilder<'a, S: PageWrite + ?Sized> {
    store: &'a S,
    opts: BTreeBuildOptions,
}

struct Pending {
    id: PageId,
    low_key: Vec<u8>,
}

impl<'a, S: PageWrite + ?Sized> BTreeBuilder<'a, S> {
    pub fn new(store: &'a S, opts: BTreeBuildOptions) -> Result<Self> {
        if opts.leaf_fanout < 2 || opts.internal_fanout < 2 {
            return Err(CheckError::Invalid("fanout must be at least 2"));
        }
        if store.page_size() != opts.page_size {
            return Err(CheckError::Invalid("builder page size differs from store"));
        }
        Ok(Self { store, opts })
    }

    /// Sorts `entries` with `comparator` and loads them.
    pub fn build(
        &self,
        mut entries: Vec<(Vec<u8>, RowId)>,
        comparator: &dyn KeyComparator,
    ) -> Result<BTreeLayout> {
        if entries.iter().any(|(k, _)| k.is_empty()) {
            return Err(CheckError::Invalid("empty keys cannot be indexed"));
        }
        entries.sort_by(|a, b| comparator.compare(&a.0, &b.0).then(a.1.cmp(&b.1)));
        let reserve = entries.iter().map(|(k, _)| k.len()).max().unwrap_or(0);

        self.store.write_page(
            META_PAGE,
            BTreeMeta::new(None, 0).encode(self.opts.page_size, self.opts.lsn)?,
        )?;
        let mut layout = BTreeLayout::default();
        if entries.is_empty() {
            return Ok(layout);
        }

        let mut next_id = 1u64;
        let chunks = self.chunk(entries, reserve, self.opts.leaf_fanout, leaf_cost)?;
        let mut level = self.write_level(&mut next_id, 0, chunks, |items| {
            ImageItems::Leaf(items)
        })?;
        layout.levels.push(level.iter().map(|p| p.id).collect());

        let mut height = 0u32;
        while level.len() > 1 {
            height += 1;
            let downlinks: Vec<(Vec<u8>, PageId)> =
                level.into_iter().map(|p| (p.low_key, p.id)).collect();
            let chunks = self.chunk(downlinks, reserve, self.opts.internal_fanout, internal_cost)?;
            level = self.write_level(&mut next_id, height, chunks, ImageItems::Internal)?;
            layout.levels.push(level.iter().map(|p| p.id).collect());
        }

        let root = level[0].id;
        let mut root_image = PageImage::decode(&self.store.read_page(root)?)?;
        root_image.flags |= flags::ROOT;
        self.store
            .write_page(root, root_image.encode(self.opts.page_size)?)?;
        self.store.write_page(
            META_PAGE,
            BTreeMeta::new(Some(root), height).encode(self.opts.page_size, self.opts.lsn)?,
        )?;
        layout.root = Some(root);
        debug!(
            target: "idxcheck::btree::build",
            root = root.0,
            height,
            pages = next_id,
            "bulk load finished"
        );
        Ok(layout)
    }

    fn chunk<T>(
        &self,
        items: Vec<(Vec<u8>, T)>,
        reserve: usize,
        fanout: usize,
        cost: fn(&[u8]) -> usize,
    ) -> Result<Vec<Vec<(Vec<u8>, T)>>> {
        let capacity = self.opts.page_size as usize - PAGE_HDR_LEN - PAYLOAD_HEADER_LEN - reserve;
        let mut chunks = Vec::new();
        let mut current = Vec::new();
        let mut used = 0usize;
        for item in items {
            let need = cost(&item.0) + SLOT_ENTRY_LEN;
            if need > capacity {
                return Err(CheckError::Invalid("key too large for page size"));
            }
            if current.len() == fanout || used + need > capacity {
                chunks.push(std::mem::take(&mut current));
                used = 0;
            }
            used += need;
            current.push(item);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        Ok(chunks)
    }

    fn write_level<T>(
        &self,
        next_id: &mut u64,
        level: u32,
        chunks: Vec<Vec<(Vec<u8>, T)>>,
        wrap: impl Fn(Vec<(Vec<u8>, T)>) -> ImageItems,
    ) -> Result<Vec<Pending>> {
        let first_id = *next_id;
        let count = chunks.len() as u64;
        let low_keys: Vec<Vec<u8>> = chunks.iter().map(|c| c[0].0.clone()).collect();
        let mut out = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            let id = PageId(first_id + i as u64);
            let image = PageImage {
                id,
                lsn: self.opts.lsn,
                level,
                flags: 0,
                left: (i > 0).then(|| PageId(id.0 - 1)),
                right: ((i as u64) + 1 < count).then(|| PageId(id.0 + 1)),
                high_key: low_keys.get(i + 1).cloned(),
                items: wrap(chunk),
            };
            self.store.write_page(id, image.encode(self.opts.page_size)?)?;
            out.push(Pending {
                id,
                low_key: low_keys[i].clone(),
            });
        }
        *next_id += count;
        Ok(out)
    }
}

fn leaf_cost(key: &[u8]) -> usize {
    // Two one-or-two byte varints, the key, and the 8-byte row id.
    4 + key.len() + 8
}

fn internal_cost(key: &[u8]) -> usize {
    super::page::INTERNAL_RECORD_HEADER_LEN + key.len()
}
