#![forbid(unsafe_code)]

/// CRC32 of a page payload, salted with the page number and LSN so that a
/// page written to the wrong slot or with a stale stamp fails the check.
pub fn page_crc32(page_no: u64, lsn: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(&lsn.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
