#![forbid(unsafe_code)]

use std::cmp::Ordering;

/// Total order over encoded index keys.
///
/// The verifier only ever calls [`KeyComparator::compare`]; it never
/// interprets key bytes itself. The order must be consistent across every
/// page of one index for the ordering invariants to mean anything.
pub trait KeyComparator: Send + Sync {
    /// Short name used in logs and reports.
    fn name(&self) -> &'static str;
    /// Three-way comparison of two encoded keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Lexicographic byte order.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        "bytewise"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Keys holding a big-endian two's complement `i64`.
///
/// Keys of any other width sort after every 8-byte key, bytewise among
/// themselves, so the order stays total on damaged pages.
#[derive(Clone, Copy, Debug, Default)]
pub struct I64Comparator;

impl I64Comparator {
    fn decode(key: &[u8]) -> Option<i64> {
        let raw: [u8; 8] = key.try_into().ok()?;
        Some(i64::from_be_bytes(raw))
    }
}

impl KeyComparator for I64Comparator {
    fn name(&self) -> &'static str {
        "i64"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (Self::decode(a), Self::decode(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    }
}
