use std::ops::Range;

use crate::primitives::bytes::{buf::Cursor, var};
pub use crate::storage::slots::SLOT_ENTRY_LEN;
use crate::storage::slots::{write_records, SlotExtents};
use crate::types::{
    page::{PageHeader, PageKind, PAGE_HDR_LEN},
    CheckError, Lsn, PageId, Result, RowId, ROW_ID_LEN,
};

/// Number of bytes used by the B-Tree payload header (excluding the high key and slot directory).
pub const PAYLOAD_HEADER_LEN: usize = 40;

const KIND_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 1;
const NSLOTS_OFFSET: usize = 2;
const FREE_START_OFFSET: usize = 4;
const FREE_END_OFFSET: usize = 6;
const LEVEL_OFFSET: usize = 8;
const RESERVED_OFFSET: usize = 12;
const RIGHT_SIB_OFFSET: usize = 16;
const LEFT_SIB_OFFSET: usize = 24;
const HIGH_KEY_LEN_OFFSET: usize = 32;
const HIGH_KEY_OFFSET: usize = PAYLOAD_HEADER_LEN;

/// Internal record header length (`child:u64` + `sep_len:u16`).
pub const INTERNAL_RECORD_HEADER_LEN: usize = 10;

/// Page flag bits.
pub mod flags {
    /// Page is the true root.
    pub const ROOT: u8 = 0x01;
    /// Page was unlinked and awaits recycling.
    pub const DELETED: u8 = 0x02;
    /// Page deletion started but did not finish.
    pub const HALF_DEAD: u8 = 0x04;
    /// Leaf contains dead items awaiting cleanup; never legal on internal pages.
    pub const HAS_GARBAGE: u8 = 0x08;
    /// Every defined bit.
    pub const ALL: u8 = ROOT | DELETED | HALF_DEAD | HAS_GARBAGE;
}

/// Logical kind for a B-Tree page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BTreePageKind {
    /// Leaf page whose items point at table rows.
    Leaf = 1,
    /// Internal page whose items point at child pages.
    Internal = 2,
}

impl BTreePageKind {
    /// Converts a byte value to a `BTreePageKind`.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Leaf),
            2 => Ok(Self::Internal),
            _ => Err(CheckError::Format("unknown btree page kind")),
        }
    }

    fn page_kind(self) -> PageKind {
        match self {
            Self::Leaf => PageKind::BTreeLeaf,
            Self::Internal => PageKind::BTreeInternal,
        }
    }
}

/// Header metadata decoded from the payload region of a B-Tree page.
#[derive(Clone, Debug)]
pub struct Header {
    pub kind: BTreePageKind,
    pub flags: u8,
    pub slot_count: u16,
    pub free_start: u16,
    pub free_end: u16,
    /// Distance from the leaf level; leaves are level 0.
    pub level: u32,
    pub right_sibling: Option<PageId>,
    pub left_sibling: Option<PageId>,
    pub high_key_len: usize,
}

impl Header {
    /// Decodes and bounds-checks the payload header.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < PAYLOAD_HEADER_LEN {
            return Err(CheckError::Format("page payload shorter than header"));
        }
        let kind = BTreePageKind::from_u8(payload[KIND_OFFSET])?;
        let flags = payload[FLAGS_OFFSET];
        if flags & !flags::ALL != 0 {
            return Err(CheckError::Format("btree page carries unknown flag bits"));
        }
        if read_u32(payload, RESERVED_OFFSET) != 0 {
            return Err(CheckError::Format("btree page reserved field not zero"));
        }
        let slot_count = read_u16(payload, NSLOTS_OFFSET);
        let free_start = read_u16(payload, FREE_START_OFFSET);
        let free_end = read_u16(payload, FREE_END_OFFSET);
        let high_key_len = usize::try_from(read_u64(payload, HIGH_KEY_LEN_OFFSET))
            .map_err(|_| CheckError::Format("btree high key length overflow"))?;

        if free_start > free_end || free_end as usize > payload.len() {
            return Err(CheckError::Format(
                "btree page free space pointers out of range",
            ));
        }
        let high_key_end = HIGH_KEY_OFFSET
            .checked_add(high_key_len)
            .filter(|end| *end <= payload.len())
            .ok_or(CheckError::Format("btree high key exceeds payload"))?;
        if (free_start as usize) < high_key_end {
            return Err(CheckError::Format("btree free_start overlaps high key"));
        }
        let slot_bytes = slot_count as usize * SLOT_ENTRY_LEN;
        if slot_bytes > payload.len() || payload.len() - slot_bytes < free_end as usize {
            return Err(CheckError::Format("btree free_end overlaps slot directory"));
        }

        Ok(Self {
            kind,
            flags,
            slot_count,
            free_start,
            free_end,
            level: read_u32(payload, LEVEL_OFFSET),
            right_sibling: decode_page_id(read_u64(payload, RIGHT_SIB_OFFSET)),
            left_sibling: decode_page_id(read_u64(payload, LEFT_SIB_OFFSET)),
            high_key_len,
        })
    }

    fn records_start(&self) -> usize {
        HIGH_KEY_OFFSET + self.high_key_len
    }

    fn slots(&self, payload: &[u8]) -> Result<SlotExtents> {
        SlotExtents::build(
            payload,
            self.slot_count as usize,
            self.records_start(),
            self.free_start as usize,
        )
    }
}

/// Reference to a leaf record stored on-page (`varint key_len | varint val_len | key | row id`).
#[derive(Clone, Copy, Debug)]
pub struct LeafRecordRef<'a> {
    pub key: &'a [u8],
    pub row: RowId,
    key_offset: usize,
}

/// Reference to an internal record stored on-page.
#[derive(Clone, Copy, Debug)]
pub struct InternalRecordRef<'a> {
    pub separator: &'a [u8],
    pub child: PageId,
}

/// Encodes a leaf record into `dst`.
///
/// The verifier fingerprints these exact bytes, so the encoding must stay canonical.
pub fn encode_leaf_record(key: &[u8], row: RowId, dst: &mut Vec<u8>) -> Result<()> {
    if key.is_empty() {
        return Err(CheckError::Invalid("leaf key length must be non-zero"));
    }
    var::encode_u64(key.len() as u64, dst);
    var::encode_u64(ROW_ID_LEN as u64, dst);
    dst.extend_from_slice(key);
    dst.extend_from_slice(&row.to_bytes());
    Ok(())
}

/// Decodes a leaf record.
pub fn decode_leaf_record(buf: &[u8]) -> Result<LeafRecordRef<'_>> {
    let mut cursor = Cursor::new(buf);
    let key_len = cursor.read_var_u64()?;
    if key_len == 0 {
        return Err(CheckError::Format("leaf key length zero"));
    }
    let val_len = cursor.read_var_u64()?;
    if val_len != ROW_ID_LEN as u64 {
        return Err(CheckError::Format("leaf value is not a row id"));
    }
    // Fingerprints are taken over the stored bytes, so only the canonical
    // length encoding can match a re-encoded table row.
    if cursor.position() != var::encoded_len(key_len) + var::encoded_len(val_len) {
        return Err(CheckError::Format("leaf record lengths are not minimally encoded"));
    }
    let key_len =
        usize::try_from(key_len).map_err(|_| CheckError::Format("leaf key length overflow"))?;
    let key_offset = cursor.position();
    let key = cursor.take(key_len, "leaf key truncated")?;
    let row = RowId::from_bytes(cursor.take(ROW_ID_LEN, "leaf row id truncated")?)?;
    if cursor.remaining() != 0 {
        return Err(CheckError::Format("leaf record has trailing bytes"));
    }
    Ok(LeafRecordRef {
        key,
        row,
        key_offset,
    })
}

/// Encode an internal record as `[child_page_id:u64][sep_len:u16][sep bytes]`.
pub fn encode_internal_record(separator: &[u8], child: PageId, dst: &mut Vec<u8>) -> Result<()> {
    let key_len = u16::try_from(separator.len())
        .map_err(|_| CheckError::Invalid("separator longer than u16"))?;
    dst.extend_from_slice(&child.0.to_be_bytes());
    dst.extend_from_slice(&key_len.to_be_bytes());
    dst.extend_from_slice(separator);
    Ok(())
}

/// Decodes an internal record.
pub fn decode_internal_record(buf: &[u8]) -> Result<InternalRecordRef<'_>> {
    let mut cursor = Cursor::new(buf);
    let child = cursor.read_u64("internal record shorter than header")?;
    let key_len = cursor.read_u16("internal record shorter than header")? as usize;
    let separator = cursor.take(key_len, "internal record truncated")?;
    if cursor.remaining() != 0 {
        return Err(CheckError::Format("internal record has trailing bytes"));
    }
    let child = decode_page_id(child).ok_or(CheckError::Format("downlink to page 0"))?;
    Ok(InternalRecordRef { separator, child })
}

/// Why a page is skipped by the level walk.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Deletion began but the page is still linked in.
    HalfDead,
    /// Page is unlinked from its level.
    Deleted,
}

/// What an item points at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ItemTarget {
    /// Leaf item: a table row.
    Row(RowId),
    /// Internal item: a child page.
    Child(PageId),
}

/// A keyed item on a live page. Keys live in the owning [`BTreePage`]'s buffer.
#[derive(Clone, Debug)]
pub struct Item {
    /// Slot index on the page.
    pub slot: u16,
    pub target: ItemTarget,
    key: Range<usize>,
    record: Range<usize>,
}

/// Contents of a page, by kind.
#[derive(Clone, Debug)]
pub enum PageBody {
    /// Items in slot order.
    Leaf { items: Vec<Item> },
    /// The negative-infinity downlink in slot 0, then keyed downlinks.
    Internal { sentinel: PageId, items: Vec<Item> },
    /// Half-dead or deleted; contents are not examined.
    Ignorable(IgnoreReason),
}

/// Owned, decoded copy of one B-Tree page.
///
/// The copied buffer doubles as the per-visit arena: items hold ranges into
/// it, and everything is released when the page is dropped.
#[derive(Clone, Debug)]
pub struct BTreePage {
    pub id: PageId,
    pub lsn: Lsn,
    pub kind: BTreePageKind,
    pub level: u32,
    pub flags: u8,
    pub left: Option<PageId>,
    pub right: Option<PageId>,
    pub body: PageBody,
    high_key: Option<Range<usize>>,
    buf: Vec<u8>,
}

impl BTreePage {
    /// Decodes a page copied out of the store.
    pub fn decode(buf: Vec<u8>) -> Result<Self> {
        let page_header = PageHeader::decode(&buf)?;
        let payload = &buf[PAGE_HDR_LEN..];
        let header = Header::parse(payload)?;
        if header.kind.page_kind() != page_header.kind {
            return Err(CheckError::Format(
                "btree payload kind disagrees with page header",
            ));
        }
        let high_key = (header.high_key_len > 0).then(|| {
            let start = PAGE_HDR_LEN + HIGH_KEY_OFFSET;
            start..start + header.high_key_len
        });

        let body = if header.flags & flags::DELETED != 0 {
            PageBody::Ignorable(IgnoreReason::Deleted)
        } else if header.flags & flags::HALF_DEAD != 0 {
            PageBody::Ignorable(IgnoreReason::HalfDead)
        } else {
            decode_body(&header, payload)?
        };

        Ok(Self {
            id: page_header.page_no,
            lsn: page_header.lsn,
            kind: header.kind,
            level: header.level,
            flags: header.flags,
            left: header.left_sibling,
            right: header.right_sibling,
            body,
            high_key,
            buf,
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == BTreePageKind::Leaf
    }

    pub fn is_root(&self) -> bool {
        self.flags & flags::ROOT != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & flags::DELETED != 0
    }

    pub fn has_garbage(&self) -> bool {
        self.flags & flags::HAS_GARBAGE != 0
    }

    pub fn is_ignorable(&self) -> bool {
        matches!(self.body, PageBody::Ignorable(_))
    }

    pub fn is_leftmost(&self) -> bool {
        self.left.is_none()
    }

    pub fn is_rightmost(&self) -> bool {
        self.right.is_none()
    }

    /// Upper bound on the page's keys; `None` on the rightmost page of a level.
    pub fn high_key(&self) -> Option<&[u8]> {
        self.high_key.clone().map(|r| &self.buf[r])
    }

    /// Items that take part in comparisons (the sentinel is excluded).
    pub fn items(&self) -> &[Item] {
        match &self.body {
            PageBody::Leaf { items } | PageBody::Internal { items, .. } => items,
            PageBody::Ignorable(_) => &[],
        }
    }

    /// The negative-infinity downlink of a live internal page.
    pub fn sentinel(&self) -> Option<PageId> {
        match self.body {
            PageBody::Internal { sentinel, .. } => Some(sentinel),
            _ => None,
        }
    }

    /// First item usable as a comparison key.
    pub fn first_item(&self) -> Option<&Item> {
        self.items().first()
    }

    /// Key bytes of `item`.
    pub fn key(&self, item: &Item) -> &[u8] {
        &self.buf[item.key.clone()]
    }

    /// Encoded record bytes of `item`, as stored on the page.
    pub fn record(&self, item: &Item) -> &[u8] {
        &self.buf[item.record.clone()]
    }

    /// Kind label used in messages.
    pub fn kind_label(&self) -> &'static str {
        if self.is_leaf() {
            "leaf"
        } else {
            "internal"
        }
    }
}

fn decode_body(header: &Header, payload: &[u8]) -> Result<PageBody> {
    let extents = header.slots(payload)?;
    match header.kind {
        BTreePageKind::Leaf => {
            let mut items = Vec::with_capacity(extents.len());
            for idx in 0..extents.len() {
                let range = extents.extent(idx)?;
                let rec = decode_leaf_record(&payload[range.clone()])?;
                let key_start = PAGE_HDR_LEN + range.start + rec.key_offset;
                items.push(Item {
                    slot: idx as u16,
                    target: ItemTarget::Row(rec.row),
                    key: key_start..key_start + rec.key.len(),
                    record: PAGE_HDR_LEN + range.start..PAGE_HDR_LEN + range.end,
                });
            }
            Ok(PageBody::Leaf { items })
        }
        BTreePageKind::Internal => {
            if extents.is_empty() {
                return Err(CheckError::Format(
                    "internal page has no negative-infinity downlink",
                ));
            }
            let first = extents.extent(0)?;
            let sentinel = decode_internal_record(&payload[first])?.child;
            let mut items = Vec::with_capacity(extents.len() - 1);
            for idx in 1..extents.len() {
                let range = extents.extent(idx)?;
                let rec = decode_internal_record(&payload[range.clone()])?;
                let key_start = PAGE_HDR_LEN + range.start + INTERNAL_RECORD_HEADER_LEN;
                items.push(Item {
                    slot: idx as u16,
                    target: ItemTarget::Child(rec.child),
                    key: key_start..key_start + rec.separator.len(),
                    record: PAGE_HDR_LEN + range.start..PAGE_HDR_LEN + range.end,
                });
            }
            Ok(PageBody::Internal { sentinel, items })
        }
    }
}

/// Items of an editable page image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImageItems {
    /// `(key, row)` pairs in slot order.
    Leaf(Vec<(Vec<u8>, RowId)>),
    /// `(separator, child)` pairs; the separator of slot 0 is never written.
    Internal(Vec<(Vec<u8>, PageId)>),
}

impl ImageItems {
    pub fn len(&self) -> usize {
        match self {
            ImageItems::Leaf(v) => v.len(),
            ImageItems::Internal(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutable access to the key in `slot`.
    pub fn key_mut(&mut self, slot: usize) -> Option<&mut Vec<u8>> {
        match self {
            ImageItems::Leaf(v) => v.get_mut(slot).map(|(k, _)| k),
            ImageItems::Internal(v) => v.get_mut(slot).map(|(k, _)| k),
        }
    }

    /// Swaps the keys of two slots, leaving their targets in place.
    pub fn swap_keys(&mut self, a: usize, b: usize) -> Result<()> {
        if a >= self.len() || b >= self.len() {
            return Err(CheckError::Invalid("slot index out of bounds"));
        }
        match self {
            ImageItems::Leaf(v) => {
                let ka = std::mem::take(&mut v[a].0);
                v[a].0 = std::mem::replace(&mut v[b].0, ka);
            }
            ImageItems::Internal(v) => {
                let ka = std::mem::take(&mut v[a].0);
                v[a].0 = std::mem::replace(&mut v[b].0, ka);
            }
        }
        Ok(())
    }

    /// Removes the item in `slot`.
    pub fn remove(&mut self, slot: usize) -> Result<()> {
        if slot >= self.len() {
            return Err(CheckError::Invalid("slot index out of bounds"));
        }
        match self {
            ImageItems::Leaf(v) => {
                v.remove(slot);
            }
            ImageItems::Internal(v) => {
                v.remove(slot);
            }
        }
        Ok(())
    }
}

/// Writable description of a B-Tree page, used by the builder and by damage helpers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageImage {
    pub id: PageId,
    pub lsn: Lsn,
    pub level: u32,
    pub flags: u8,
    pub left: Option<PageId>,
    pub right: Option<PageId>,
    pub high_key: Option<Vec<u8>>,
    pub items: ImageItems,
}

impl PageImage {
    /// Bytes this image occupies in a payload, excluding free space.
    pub fn encoded_len(&self) -> usize {
        let high = self.high_key.as_ref().map_or(0, Vec::len);
        let records: usize = match &self.items {
            ImageItems::Leaf(v) => v
                .iter()
                .map(|(k, _)| {
                    var::encoded_len(k.len() as u64)
                        + var::encoded_len(ROW_ID_LEN as u64)
                        + k.len()
                        + ROW_ID_LEN
                })
                .sum(),
            ImageItems::Internal(v) => v
                .iter()
                .enumerate()
                .map(|(i, (k, _))| INTERNAL_RECORD_HEADER_LEN + if i == 0 { 0 } else { k.len() })
                .sum(),
        };
        PAYLOAD_HEADER_LEN + high + records + self.items.len() * SLOT_ENTRY_LEN
    }

    /// Encodes the image into a full page buffer. The CRC is left for the store to seal.
    pub fn encode(&self, page_size: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; page_size as usize];
        if self.encoded_len() > buf.len().saturating_sub(PAGE_HDR_LEN) {
            return Err(CheckError::Invalid("page image does not fit in page"));
        }
        let kind = match self.items {
            ImageItems::Leaf(_) => BTreePageKind::Leaf,
            ImageItems::Internal(_) => BTreePageKind::Internal,
        };
        PageHeader::new(self.id, kind.page_kind(), page_size, self.lsn)?.encode(&mut buf)?;

        let payload = &mut buf[PAGE_HDR_LEN..];
        let high = self.high_key.as_deref().unwrap_or(&[]);
        payload[KIND_OFFSET] = kind as u8;
        payload[FLAGS_OFFSET] = self.flags;
        payload[LEVEL_OFFSET..LEVEL_OFFSET + 4].copy_from_slice(&self.level.to_be_bytes());
        write_page_id(payload, RIGHT_SIB_OFFSET, self.right);
        write_page_id(payload, LEFT_SIB_OFFSET, self.left);
        payload[HIGH_KEY_LEN_OFFSET..HIGH_KEY_LEN_OFFSET + 8]
            .copy_from_slice(&(high.len() as u64).to_be_bytes());
        payload[HIGH_KEY_OFFSET..HIGH_KEY_OFFSET + high.len()].copy_from_slice(high);

        let mut records = Vec::with_capacity(self.items.len());
        match &self.items {
            ImageItems::Leaf(v) => {
                for (key, row) in v {
                    let mut record = Vec::new();
                    encode_leaf_record(key, *row, &mut record)?;
                    records.push(record);
                }
            }
            ImageItems::Internal(v) => {
                for (i, (sep, child)) in v.iter().enumerate() {
                    let sep: &[u8] = if i == 0 { &[] } else { sep.as_slice() };
                    let mut record = Vec::new();
                    encode_internal_record(sep, *child, &mut record)?;
                    records.push(record);
                }
            }
        }
        let written = write_records(payload, HIGH_KEY_OFFSET + high.len(), &records)?;
        write_u16(payload, NSLOTS_OFFSET, written.slot_count);
        write_u16(payload, FREE_START_OFFSET, written.free_start);
        write_u16(payload, FREE_END_OFFSET, written.free_end);
        Ok(buf)
    }

    /// Decodes any B-Tree page, including ignorable ones, into an editable image.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let page_header = PageHeader::decode(buf)?;
        let payload = &buf[PAGE_HDR_LEN..];
        let header = Header::parse(payload)?;
        let extents = header.slots(payload)?;
        let items = match header.kind {
            BTreePageKind::Leaf => {
                let mut v = Vec::with_capacity(extents.len());
                for idx in 0..extents.len() {
                    let rec = decode_leaf_record(&payload[extents.extent(idx)?])?;
                    v.push((rec.key.to_vec(), rec.row));
                }
                ImageItems::Leaf(v)
            }
            BTreePageKind::Internal => {
                let mut v = Vec::with_capacity(extents.len());
                for idx in 0..extents.len() {
                    let rec = decode_internal_record(&payload[extents.extent(idx)?])?;
                    v.push((rec.separator.to_vec(), rec.child));
                }
                ImageItems::Internal(v)
            }
        };
        let high_key = (header.high_key_len > 0)
            .then(|| payload[HIGH_KEY_OFFSET..HIGH_KEY_OFFSET + header.high_key_len].to_vec());
        Ok(Self {
            id: page_header.page_no,
            lsn: page_header.lsn,
            level: header.level,
            flags: header.flags,
            left: header.left_sibling,
            right: header.right_sibling,
            high_key,
            items,
        })
    }
}

pub(crate) fn decode_page_id(raw: u64) -> Option<PageId> {
    if raw == 0 {
        None
    } else {
        Some(PageId(raw))
    }
}

fn read_u16(payload: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([payload[offset], payload[offset + 1]])
}

fn read_u32(payload: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&payload[offset..offset + 4]);
    u32::from_be_bytes(raw)
}

fn read_u64(payload: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[offset..offset + 8]);
    u64::from_be_bytes(raw)
}

fn write_u16(payload: &mut [u8], offset: usize, value: u16) {
    payload[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_page_id(payload: &mut [u8], offset: usize, value: Option<PageId>) {
    let raw = value.map(|p| p.0).unwrap_or(0);
    payload[offset..offset + 8].copy_from_slice(&raw.to_be_bytes());
}
