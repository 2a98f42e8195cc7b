#![forbid(unsafe_code)]
//! Identifiers, the crate-wide error type and the shared page header layout.

use std::fmt;

pub mod checksum;
pub mod corruption;

pub use corruption::{Corruption, CorruptionKind, ItemLocation};

/// Page number inside an index relation.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize)]
pub struct PageId(pub u64);

/// Monotonic page stamp written by every modification of a page.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, serde::Serialize,
)]
pub struct Lsn(pub u64);

/// Identifier of the transaction that created a table row.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize)]
pub struct TxId(pub u64);

/// Physical location of a row in the backing table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize)]
pub struct RowId {
    /// Table block holding the row.
    pub block: u32,
    /// Line pointer within the block.
    pub offset: u16,
}

/// Encoded width of a [`RowId`] inside a leaf record.
pub const ROW_ID_LEN: usize = 8;

impl RowId {
    /// Creates a row id from its block and offset.
    pub const fn new(block: u32, offset: u16) -> Self {
        Self { block, offset }
    }

    /// Big-endian encoding stored as the value of a leaf record.
    pub fn to_bytes(self) -> [u8; ROW_ID_LEN] {
        let mut out = [0u8; ROW_ID_LEN];
        out[0..4].copy_from_slice(&self.block.to_be_bytes());
        out[4..6].copy_from_slice(&self.offset.to_be_bytes());
        out
    }

    /// Decodes a row id from leaf record value bytes.
    pub fn from_bytes(src: &[u8]) -> Result<Self> {
        if src.len() != ROW_ID_LEN {
            return Err(CheckError::Format("row id must be 8 bytes"));
        }
        if src[6..8] != [0, 0] {
            return Err(CheckError::Format("row id padding not zero"));
        }
        let block = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let offset = u16::from_be_bytes([src[4], src[5]]);
        Ok(Self { block, offset })
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.offset)
    }
}

/// Errors raised while reading or verifying an index.
#[derive(thiserror::Error, Debug)]
pub enum CheckError {
    /// Underlying storage failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A confirmed invariant violation.
    #[error("{0}")]
    Corruption(Box<Corruption>),
    /// Bytes that do not decode as the expected on-page structure.
    #[error("page format: {0}")]
    Format(&'static str),
    /// Caller misuse.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A state the locking protocol rules out was reached anyway.
    #[error("internal consistency assertion failed: {0}")]
    Internal(&'static str),
    /// Cancellation was requested through the check's token.
    #[error("verification interrupted")]
    Interrupted,
}

impl CheckError {
    /// Returns the corruption report when this error carries one.
    pub fn corruption(&self) -> Option<&Corruption> {
        match self {
            CheckError::Corruption(c) => Some(c),
            _ => None,
        }
    }

    /// True when the error is a confirmed corruption finding.
    pub fn is_corruption(&self) -> bool {
        matches!(self, CheckError::Corruption(_))
    }
}

impl From<Corruption> for CheckError {
    fn from(value: Corruption) -> Self {
        CheckError::Corruption(Box::new(value))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CheckError>;

pub mod page {
    //! Fixed 32-byte header that prefixes every index page.

    use core::convert::TryFrom;

    use super::{checksum, CheckError, Lsn, PageId, Result};

    /// Magic bytes at the start of every page.
    pub const PAGE_MAGIC: [u8; 4] = *b"IDXC";
    /// Page format understood by this build.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Page size used when none is configured.
    pub const DEFAULT_PAGE_SIZE: u32 = 8192;
    /// Smallest page size accepted by stores.
    pub const MIN_PAGE_SIZE: u32 = 256;
    /// Length of the common header.
    pub const PAGE_HDR_LEN: usize = 32;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        pub const MAGIC: Range<usize> = 0..4;
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        pub const PAGE_KIND: usize = 6;
        pub const RESERVED: usize = 7;
        pub const PAGE_SIZE: Range<usize> = 8..12;
        pub const PAGE_NO: Range<usize> = 12..20;
        pub const LSN: Range<usize> = 20..28;
        pub const CRC32: Range<usize> = 28..32;
    }

    /// Role of a page within its index.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum PageKind {
        /// B-Tree metadata page, always page 0.
        Meta = 1,
        /// B-Tree leaf.
        BTreeLeaf = 2,
        /// B-Tree internal page.
        BTreeInternal = 3,
        /// GiST leaf.
        GistLeaf = 4,
        /// GiST internal page.
        GistInternal = 5,
    }

    impl PageKind {
        /// Raw tag stored in the header.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = CheckError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::Meta),
                2 => Ok(PageKind::BTreeLeaf),
                3 => Ok(PageKind::BTreeInternal),
                4 => Ok(PageKind::GistLeaf),
                5 => Ok(PageKind::GistInternal),
                _ => Err(CheckError::Format("unknown page kind")),
            }
        }
    }

    /// Decoded page header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        pub format_version: u16,
        pub kind: PageKind,
        pub page_size: u32,
        pub page_no: PageId,
        pub lsn: Lsn,
        pub crc32: u32,
    }

    impl PageHeader {
        pub fn new(page_no: PageId, kind: PageKind, page_size: u32, lsn: Lsn) -> Result<Self> {
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(CheckError::Invalid("page size smaller than header"));
            }
            Ok(Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_size,
                page_no,
                lsn,
                crc32: 0,
            })
        }

        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(CheckError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
            hdr[header::LSN].copy_from_slice(&self.lsn.0.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            Ok(())
        }

        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(CheckError::Format("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            if hdr[header::MAGIC] != PAGE_MAGIC {
                return Err(CheckError::Format("invalid page magic"));
            }
            let format_version = read_u16(hdr, header::FORMAT_VERSION.start);
            if format_version != PAGE_FORMAT_VERSION {
                return Err(CheckError::Format("unsupported page format version"));
            }
            if hdr[header::RESERVED] != 0 {
                return Err(CheckError::Format("page header reserved byte not zero"));
            }
            let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
            let page_size = read_u32(hdr, header::PAGE_SIZE.start);
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(CheckError::Format("page size smaller than header"));
            }
            Ok(Self {
                format_version,
                kind,
                page_size,
                page_no: PageId(read_u64(hdr, header::PAGE_NO.start)),
                lsn: Lsn(read_u64(hdr, header::LSN.start)),
                crc32: read_u32(hdr, header::CRC32.start),
            })
        }
    }

    /// Writes the CRC of `buf` into its header. The rest of the header must already be encoded.
    pub fn seal(buf: &mut [u8]) -> Result<()> {
        let header = PageHeader::decode(buf)?;
        let crc = checksum::page_crc32(header.page_no.0, header.lsn.0, &buf[PAGE_HDR_LEN..]);
        buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Recomputes the CRC over `buf` and compares it with the stored value.
    pub fn crc_matches(buf: &[u8], header: &PageHeader) -> bool {
        buf.len() >= PAGE_HDR_LEN
            && checksum::page_crc32(header.page_no.0, header.lsn.0, &buf[PAGE_HDR_LEN..])
                == header.crc32
    }

    fn read_u16(src: &[u8], at: usize) -> u16 {
        u16::from_be_bytes([src[at], src[at + 1]])
    }

    fn read_u32(src: &[u8], at: usize) -> u32 {
        u32::from_be_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
    }

    fn read_u64(src: &[u8], at: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&src[at..at + 8]);
        u64::from_be_bytes(raw)
    }
}
