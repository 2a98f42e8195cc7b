#![forbid(unsafe_code)]
//! Slot directory shared by the B-Tree and GiST page layouts.
//!
//! Records grow upward from the end of the fixed header; the directory of
//! `(offset:u16, len:u16)` entries sits at the tail of the payload, slot 0
//! first.

use std::ops::Range;

use smallvec::SmallVec;

use crate::types::{CheckError, Result};

/// Size in bytes of a single slot directory entry (offset + length).
pub const SLOT_ENTRY_LEN: usize = 4;

const INLINE_SLOT_EXTENTS: usize = 32;

/// Payload-relative record extents for every slot, validated for overlap.
pub struct SlotExtents {
    extents: SmallVec<[Range<usize>; INLINE_SLOT_EXTENTS]>,
}

impl SlotExtents {
    /// Reads `slot_count` entries from the tail of `payload`. Records must lie
    /// inside `records_start..free_start` and must not overlap.
    pub fn build(
        payload: &[u8],
        slot_count: usize,
        records_start: usize,
        free_start: usize,
    ) -> Result<Self> {
        let dir_bytes = slot_count * SLOT_ENTRY_LEN;
        if dir_bytes > payload.len() {
            return Err(CheckError::Format("slot directory larger than payload"));
        }
        let dir_start = payload.len() - dir_bytes;
        let mut extents = SmallVec::with_capacity(slot_count);
        let mut ordered: SmallVec<[(usize, usize); INLINE_SLOT_EXTENTS]> =
            SmallVec::with_capacity(slot_count);
        for idx in 0..slot_count {
            let at = dir_start + idx * SLOT_ENTRY_LEN;
            let start = u16::from_be_bytes([payload[at], payload[at + 1]]) as usize;
            let len = u16::from_be_bytes([payload[at + 2], payload[at + 3]]) as usize;
            if len == 0 {
                return Err(CheckError::Format("record length zero"));
            }
            if start < records_start {
                return Err(CheckError::Format("record overlaps page header"));
            }
            let end = start + len;
            if end > free_start {
                return Err(CheckError::Format("record extent beyond free_start"));
            }
            extents.push(start..end);
            ordered.push((start, end));
        }
        ordered.sort_unstable_by_key(|entry| entry.0);
        let mut prev_end = records_start;
        for (start, end) in ordered {
            if start < prev_end {
                return Err(CheckError::Format("record extents overlap"));
            }
            prev_end = end;
        }
        Ok(Self { extents })
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// True when the page holds no records.
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Payload-relative range of `slot_idx`.
    pub fn extent(&self, slot_idx: usize) -> Result<Range<usize>> {
        self.extents
            .get(slot_idx)
            .cloned()
            .ok_or(CheckError::Invalid("slot index out of bounds"))
    }
}

/// Result of [`write_records`]: where free space begins and ends.
pub struct WrittenRecords {
    pub slot_count: u16,
    pub free_start: u16,
    pub free_end: u16,
}

/// Copies `records` into `payload` starting at `records_start` and writes the
/// slot directory at the tail.
pub fn write_records(
    payload: &mut [u8],
    records_start: usize,
    records: &[Vec<u8>],
) -> Result<WrittenRecords> {
    let body: usize = records.iter().map(Vec::len).sum();
    let dir_start = payload
        .len()
        .checked_sub(records.len() * SLOT_ENTRY_LEN)
        .ok_or(CheckError::Invalid("records do not fit in page"))?;
    if records_start + body > dir_start {
        return Err(CheckError::Invalid("records do not fit in page"));
    }
    let mut at = records_start;
    for (idx, record) in records.iter().enumerate() {
        payload[at..at + record.len()].copy_from_slice(record);
        let slot = dir_start + idx * SLOT_ENTRY_LEN;
        payload[slot..slot + 2].copy_from_slice(&to_u16(at)?.to_be_bytes());
        payload[slot + 2..slot + 4].copy_from_slice(&to_u16(record.len())?.to_be_bytes());
        at += record.len();
    }
    Ok(WrittenRecords {
        slot_count: to_u16(records.len())?,
        free_start: to_u16(at)?,
        free_end: to_u16(dir_start)?,
    })
}

fn to_u16(value: usize) -> Result<u16> {
    u16::try_from(value).map_err(|_| CheckError::Invalid("payload offset exceeds u16"))
}
