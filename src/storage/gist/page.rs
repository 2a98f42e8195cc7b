use std::ops::Range;

use crate::primitives::bytes::buf::Cursor;
use crate::storage::btree::page::decode_page_id;
use crate::storage::slots::{write_records, SlotExtents};
use crate::types::{
    page::{PageHeader, PageKind, PAGE_HDR_LEN},
    CheckError, Lsn, PageId, Result, RowId,
};

/// Bytes in the GiST payload header.
pub const GIST_PAYLOAD_HEADER_LEN: usize = 32;

const KIND_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 1;
const NSLOTS_OFFSET: usize = 2;
const FREE_START_OFFSET: usize = 4;
const FREE_END_OFFSET: usize = 6;
const NSN_OFFSET: usize = 8;
const RIGHT_OFFSET: usize = 16;
const RESERVED_OFFSET: usize = 24;

/// Tuple header: pointer, flags, attribute count.
const TUPLE_HEADER_LEN: usize = 10;
/// Per-attribute header: null marker and length.
const ATTR_HEADER_LEN: usize = 3;

/// The root of a GiST index never moves.
pub const GIST_ROOT: PageId = PageId(0);

/// Page flag bits.
pub mod flags {
    /// A split finished on this page but the parent downlink was not yet inserted.
    pub const FOLLOW_RIGHT: u8 = 0x01;
    /// Page was removed from the tree.
    pub const DELETED: u8 = 0x02;
    /// Every defined bit.
    pub const ALL: u8 = FOLLOW_RIGHT | DELETED;
}

/// Tuple flag bits.
pub mod tuple_flags {
    /// Inner tuple left behind by an incomplete split.
    pub const INVALID: u8 = 0x01;
}

/// Leaf or internal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GistPageKind {
    Leaf = 1,
    Internal = 2,
}

impl GistPageKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Leaf),
            2 => Ok(Self::Internal),
            _ => Err(CheckError::Format("unknown gist page kind")),
        }
    }

    fn page_kind(self) -> PageKind {
        match self {
            Self::Leaf => PageKind::GistLeaf,
            Self::Internal => PageKind::GistInternal,
        }
    }
}

/// One tuple on a decoded page; attribute bytes live in the page buffer.
#[derive(Clone, Debug)]
pub struct GistTuple {
    pub slot: u16,
    /// Child page id on internal pages, packed row id on leaves.
    pub pointer: u64,
    pub invalid: bool,
    attrs: Vec<Option<Range<usize>>>,
}

impl GistTuple {
    /// Number of stored attributes.
    pub fn natts(&self) -> usize {
        self.attrs.len()
    }

    /// Child page of an internal tuple.
    pub fn child(&self) -> Result<PageId> {
        decode_page_id(self.pointer).ok_or(CheckError::Format("gist downlink to the root page"))
    }

    /// Table row of a leaf tuple.
    pub fn row(&self) -> Result<RowId> {
        RowId::from_bytes(&self.pointer.to_be_bytes())
    }
}

/// Owned snapshot of one GiST page.
#[derive(Clone, Debug)]
pub struct GistPage {
    pub id: PageId,
    pub lsn: Lsn,
    /// Node sequence number: LSN of the split that last moved tuples off this page.
    pub nsn: Lsn,
    pub kind: GistPageKind,
    pub flags: u8,
    pub right: Option<PageId>,
    tuples: Vec<GistTuple>,
    buf: Vec<u8>,
}

struct Header {
    kind: GistPageKind,
    flags: u8,
    slot_count: u16,
    free_start: u16,
    nsn: Lsn,
    right: Option<PageId>,
}

impl Header {
    fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < GIST_PAYLOAD_HEADER_LEN {
            return Err(CheckError::Format("gist payload shorter than header"));
        }
        let kind = GistPageKind::from_u8(payload[KIND_OFFSET])?;
        let flags = payload[FLAGS_OFFSET];
        if flags & !flags::ALL != 0 {
            return Err(CheckError::Format("gist page carries unknown flag bits"));
        }
        if read_u64(payload, RESERVED_OFFSET) != 0 {
            return Err(CheckError::Format("gist page reserved field not zero"));
        }
        let slot_count = read_u16(payload, NSLOTS_OFFSET);
        let free_start = read_u16(payload, FREE_START_OFFSET);
        let free_end = read_u16(payload, FREE_END_OFFSET);
        if (free_start as usize) < GIST_PAYLOAD_HEADER_LEN
            || free_start > free_end
            || free_end as usize > payload.len()
        {
            return Err(CheckError::Format("gist page free space pointers out of range"));
        }
        Ok(Self {
            kind,
            flags,
            slot_count,
            free_start,
            nsn: Lsn(read_u64(payload, NSN_OFFSET)),
            right: decode_page_id(read_u64(payload, RIGHT_OFFSET)),
        })
    }
}

struct RawTuple {
    pointer: u64,
    invalid: bool,
    /// Attribute ranges relative to the record.
    attrs: Vec<Option<Range<usize>>>,
}

fn decode_tuple(record: &[u8]) -> Result<RawTuple> {
    let mut cursor = Cursor::new(record);
    let pointer = cursor.read_u64("gist tuple shorter than header")?;
    let flags = cursor.read_u8("gist tuple shorter than header")?;
    if flags & !tuple_flags::INVALID != 0 {
        return Err(CheckError::Format("gist tuple carries unknown flag bits"));
    }
    let natts = cursor.read_u8("gist tuple shorter than header")?;
    let mut attrs = Vec::with_capacity(natts as usize);
    for _ in 0..natts {
        let null = cursor.read_u8("gist attribute header truncated")?;
        let len = cursor.read_u16("gist attribute header truncated")? as usize;
        match null {
            0 => {
                let start = cursor.position();
                cursor.take(len, "gist attribute truncated")?;
                attrs.push(Some(start..start + len));
            }
            1 if len == 0 => attrs.push(None),
            1 => return Err(CheckError::Format("null gist attribute carries bytes")),
            _ => return Err(CheckError::Format("invalid gist null marker")),
        }
    }
    if cursor.remaining() != 0 {
        return Err(CheckError::Format("gist tuple has trailing bytes"));
    }
    Ok(RawTuple {
        pointer,
        invalid: flags & tuple_flags::INVALID != 0,
        attrs,
    })
}

impl GistPage {
    /// Decodes a page copied out of the store. Deleted pages keep no tuples.
    pub fn decode(buf: Vec<u8>) -> Result<Self> {
        let page_header = PageHeader::decode(&buf)?;
        let payload = &buf[PAGE_HDR_LEN..];
        let header = Header::parse(payload)?;
        if header.kind.page_kind() != page_header.kind {
            return Err(CheckError::Format("gist payload kind disagrees with page header"));
        }
        let mut tuples = Vec::new();
        if header.flags & flags::DELETED == 0 {
            let extents = SlotExtents::build(
                payload,
                header.slot_count as usize,
                GIST_PAYLOAD_HEADER_LEN,
                header.free_start as usize,
            )?;
            tuples.reserve(extents.len());
            for idx in 0..extents.len() {
                let range = extents.extent(idx)?;
                let raw = decode_tuple(&payload[range.clone()])?;
                let base = PAGE_HDR_LEN + range.start;
                tuples.push(GistTuple {
                    slot: idx as u16,
                    pointer: raw.pointer,
                    invalid: raw.invalid,
                    attrs: raw
                        .attrs
                        .into_iter()
                        .map(|a| a.map(|r| base + r.start..base + r.end))
                        .collect(),
                });
            }
        }
        Ok(Self {
            id: page_header.page_no,
            lsn: page_header.lsn,
            nsn: header.nsn,
            kind: header.kind,
            flags: header.flags,
            right: header.right,
            tuples,
            buf,
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == GistPageKind::Leaf
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & flags::DELETED != 0
    }

    pub fn follow_right(&self) -> bool {
        self.flags & flags::FOLLOW_RIGHT != 0
    }

    pub fn tuples(&self) -> &[GistTuple] {
        &self.tuples
    }

    /// Bytes of attribute `attno`, or `None` when it is null.
    pub fn attribute(&self, tuple: &GistTuple, attno: usize) -> Option<&[u8]> {
        tuple
            .attrs
            .get(attno)
            .and_then(|a| a.clone())
            .map(|r| &self.buf[r])
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

/// Writable tuple.
#[derive(Clone, Debug, PartialEq)]
pub struct GistTupleImage {
    pub pointer: u64,
    pub invalid: bool,
    pub attrs: Vec<Option<Vec<u8>>>,
}

impl GistTupleImage {
    /// Internal tuple pointing at `child`.
    pub fn downlink(child: PageId, attrs: Vec<Option<Vec<u8>>>) -> Self {
        Self {
            pointer: child.0,
            invalid: false,
            attrs,
        }
    }

    /// Leaf tuple pointing at `row`.
    pub fn leaf(row: RowId, attrs: Vec<Option<Vec<u8>>>) -> Self {
        Self {
            pointer: u64::from_be_bytes(row.to_bytes()),
            invalid: false,
            attrs,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let natts = u8::try_from(self.attrs.len())
            .map_err(|_| CheckError::Invalid("too many gist attributes"))?;
        let mut out = Vec::with_capacity(TUPLE_HEADER_LEN + self.attrs.len() * ATTR_HEADER_LEN);
        out.extend_from_slice(&self.pointer.to_be_bytes());
        out.push(if self.invalid { tuple_flags::INVALID } else { 0 });
        out.push(natts);
        for attr in &self.attrs {
            match attr {
                Some(bytes) => {
                    let len = u16::try_from(bytes.len())
                        .map_err(|_| CheckError::Invalid("gist attribute longer than u16"))?;
                    out.push(0);
                    out.extend_from_slice(&len.to_be_bytes());
                    out.extend_from_slice(bytes);
                }
                None => {
                    out.push(1);
                    out.extend_from_slice(&0u16.to_be_bytes());
                }
            }
        }
        Ok(out)
    }
}

/// Writable description of a GiST page.
#[derive(Clone, Debug, PartialEq)]
pub struct GistPageImage {
    pub id: PageId,
    pub lsn: Lsn,
    pub nsn: Lsn,
    pub kind: GistPageKind,
    pub flags: u8,
    pub right: Option<PageId>,
    pub tuples: Vec<GistTupleImage>,
}

impl GistPageImage {
    /// Encodes into a full page buffer; the store seals the CRC.
    pub fn encode(&self, page_size: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; page_size as usize];
        if buf.len() < PAGE_HDR_LEN + GIST_PAYLOAD_HEADER_LEN {
            return Err(CheckError::Invalid("page too small for gist page"));
        }
        PageHeader::new(self.id, self.kind.page_kind(), page_size, self.lsn)?.encode(&mut buf)?;
        let records = self
            .tuples
            .iter()
            .map(GistTupleImage::encode)
            .collect::<Result<Vec<_>>>()?;
        let payload = &mut buf[PAGE_HDR_LEN..];
        payload[KIND_OFFSET] = self.kind as u8;
        payload[FLAGS_OFFSET] = self.flags;
        payload[NSN_OFFSET..NSN_OFFSET + 8].copy_from_slice(&self.nsn.0.to_be_bytes());
        payload[RIGHT_OFFSET..RIGHT_OFFSET + 8]
            .copy_from_slice(&self.right.map_or(0, |p| p.0).to_be_bytes());
        let written = write_records(payload, GIST_PAYLOAD_HEADER_LEN, &records)?;
        payload[NSLOTS_OFFSET..NSLOTS_OFFSET + 2].copy_from_slice(&written.slot_count.to_be_bytes());
        payload[FREE_START_OFFSET..FREE_START_OFFSET + 2]
            .copy_from_slice(&written.free_start.to_be_bytes());
        payload[FREE_END_OFFSET..FREE_END_OFFSET + 2]
            .copy_from_slice(&written.free_end.to_be_bytes());
        Ok(buf)
    }

    /// Decodes any GiST page, deleted ones included, into an editable image.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let page_header = PageHeader::decode(buf)?;
        let payload = &buf[PAGE_HDR_LEN..];
        let header = Header::parse(payload)?;
        let extents = SlotExtents::build(
            payload,
            header.slot_count as usize,
            GIST_PAYLOAD_HEADER_LEN,
            header.free_start as usize,
        )?;
        let mut tuples = Vec::with_capacity(extents.len());
        for idx in 0..extents.len() {
            let record = &payload[extents.extent(idx)?];
            let raw = decode_tuple(record)?;
            tuples.push(GistTupleImage {
                pointer: raw.pointer,
                invalid: raw.invalid,
                attrs: raw
                    .attrs
                    .into_iter()
                    .map(|a| a.map(|r| record[r].to_vec()))
                    .collect(),
            });
        }
        Ok(Self {
            id: page_header.page_no,
            lsn: page_header.lsn,
            nsn: header.nsn,
            kind: header.kind,
            flags: header.flags,
            right: header.right,
            tuples,
        })
    }
}

fn read_u16(payload: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([payload[offset], payload[offset + 1]])
}

fn read_u64(payload: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[offset..offset + 8]);
    u64::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> GistPageImage {
        GistPageImage {
            id: PageId(4),
            lsn: Lsn(9),
            nsn: Lsn(3),
            kind: GistPageKind::Internal,
            flags: flags::FOLLOW_RIGHT,
            right: Some(PageId(7)),
            tuples: vec![
                GistTupleImage::downlink(PageId(2), vec![Some(vec![1, 2, 3]), None]),
                GistTupleImage {
                    pointer: 5,
                    invalid: true,
                    attrs: vec![Some(vec![9]), Some(Vec::new())],
                },
            ],
        }
    }

    #[test]
    fn page_view_exposes_tuples_and_attributes() -> Result<()> {
        let page = GistPage::decode(image().encode(512)?)?;
        assert!(!page.is_leaf());
        assert!(page.follow_right());
        assert_eq!(page.nsn, Lsn(3));
        assert_eq!(page.right, Some(PageId(7)));
        let tuples = page.tuples();
        assert_eq!(tuples.len(), 2);
        assert_eq!(tuples[0].child()?, PageId(2));
        assert_eq!(page.attribute(&tuples[0], 0), Some(&[1u8, 2, 3][..]));
        assert_eq!(page.attribute(&tuples[0], 1), None);
        assert!(tuples[1].invalid);
        assert_eq!(page.attribute(&tuples[1], 1), Some(&[][..]));
        assert_eq!(GistPageImage::decode(&image().encode(512)?)?, image());
        Ok(())
    }

    #[test]
    fn leaf_tuples_carry_row_ids() -> Result<()> {
        let img = GistPageImage {
            id: PageId(0),
            lsn: Lsn(1),
            nsn: Lsn(0),
            kind: GistPageKind::Leaf,
            flags: 0,
            right: None,
            tuples: vec![GistTupleImage::leaf(RowId::new(12, 3), vec![Some(vec![0; 4])])],
        };
        let page = GistPage::decode(img.encode(256)?)?;
        assert_eq!(page.tuples()[0].row()?, RowId::new(12, 3));
        Ok(())
    }

    #[test]
    fn deleted_pages_hide_tuples() -> Result<()> {
        let mut img = image();
        img.flags = flags::DELETED;
        let page = GistPage::decode(img.encode(512)?)?;
        assert!(page.is_deleted());
        assert!(page.tuples().is_empty());
        Ok(())
    }

    #[test]
    fn null_marker_with_bytes_is_rejected() {
        let mut record = Vec::new();
        record.extend_from_slice(&2u64.to_be_bytes());
        record.extend_from_slice(&[0, 1, 1, 0, 1, 0xaa]);
        assert!(matches!(decode_tuple(&record), Err(CheckError::Format(_))));
    }
}
