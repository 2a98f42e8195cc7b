use crate::types::{
    page::{PageHeader, PageKind, PAGE_HDR_LEN},
    CheckError, Lsn, PageId, Result,
};

use super::page::decode_page_id;

/// Magic stored at the start of the meta payload.
pub const BTREE_MAGIC: [u8; 4] = *b"BTRE";
/// Tree format version understood by this build.
pub const BTREE_VERSION: u32 = 2;
/// The meta page always lives here.
pub const META_PAGE: PageId = PageId(0);

const MAGIC: core::ops::Range<usize> = 0..4;
const VERSION: core::ops::Range<usize> = 4..8;
const ROOT: core::ops::Range<usize> = 8..16;
const LEVEL: core::ops::Range<usize> = 16..20;
const FAST_ROOT: core::ops::Range<usize> = 20..28;
const FAST_LEVEL: core::ops::Range<usize> = 28..32;
const META_LEN: usize = 32;

/// Contents of page 0.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub struct BTreeMeta {
    pub magic: [u8; 4],
    pub version: u32,
    /// True root, or `None` for an empty index.
    pub root: Option<PageId>,
    /// Level of the true root.
    pub level: u32,
    /// Lowest page with more than one child, where searches begin.
    pub fast_root: Option<PageId>,
    pub fast_level: u32,
}

impl BTreeMeta {
    /// Meta page for a tree rooted at `root`, with the fast root equal to the true root.
    pub fn new(root: Option<PageId>, level: u32) -> Self {
        Self {
            magic: BTREE_MAGIC,
            version: BTREE_VERSION,
            root,
            level,
            fast_root: root,
            fast_level: level,
        }
    }

    /// Encodes a complete meta page; the store seals the CRC.
    pub fn encode(&self, page_size: u32, lsn: Lsn) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; page_size as usize];
        if buf.len() < PAGE_HDR_LEN + META_LEN {
            return Err(CheckError::Invalid("page too small for meta page"));
        }
        PageHeader::new(META_PAGE, PageKind::Meta, page_size, lsn)?.encode(&mut buf)?;
        let payload = &mut buf[PAGE_HDR_LEN..];
        payload[MAGIC].copy_from_slice(&self.magic);
        payload[VERSION].copy_from_slice(&self.version.to_be_bytes());
        payload[ROOT].copy_from_slice(&self.root.map_or(0, |p| p.0).to_be_bytes());
        payload[LEVEL].copy_from_slice(&self.level.to_be_bytes());
        payload[FAST_ROOT].copy_from_slice(&self.fast_root.map_or(0, |p| p.0).to_be_bytes());
        payload[FAST_LEVEL].copy_from_slice(&self.fast_level.to_be_bytes());
        Ok(buf)
    }

    /// Decodes the meta payload without judging magic or version.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let payload = buf
            .get(PAGE_HDR_LEN..PAGE_HDR_LEN + META_LEN)
            .ok_or(CheckError::Format("meta page truncated"))?;
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&payload[MAGIC]);
        Ok(Self {
            magic,
            version: be_u32(&payload[VERSION]),
            root: decode_page_id(be_u64(&payload[ROOT])),
            level: be_u32(&payload[LEVEL]),
            fast_root: decode_page_id(be_u64(&payload[FAST_ROOT])),
            fast_level: be_u32(&payload[FAST_LEVEL]),
        })
    }
}

fn be_u32(src: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(src);
    u32::from_be_bytes(raw)
}

fn be_u64(src: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(src);
    u64::from_be_bytes(raw)
}
