//! Operator classes: how GiST keys are stored, combined and compared.

use crate::types::{CheckError, Result};

/// Per-attribute key semantics of a GiST index.
///
/// The verifier only needs `decompress` and `contained_by`; `compress` and
/// `union` are used when building images.
pub trait GistOpClass: Send + Sync {
    /// Decompressed key.
    type Key: Clone;

    fn name(&self) -> &'static str;

    /// Turns stored attribute bytes into a key. Malformed bytes are a format error.
    fn decompress(&self, attno: usize, raw: &[u8]) -> Result<Self::Key>;

    /// Encodes a key for storage.
    fn compress(&self, attno: usize, key: &Self::Key) -> Vec<u8>;

    /// True when `child` lies within `parent`.
    fn contained_by(&self, attno: usize, child: &Self::Key, parent: &Self::Key) -> bool;

    /// Smallest key containing all of `keys`; `None` when `keys` is empty.
    fn union(&self, attno: usize, keys: &[Self::Key]) -> Option<Self::Key>;
}

/// Axis-aligned 2-D box, inclusive on every edge.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct BoxKey {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl BoxKey {
    /// Box spanning both corners, whatever order they come in.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            xmin: x1.min(x2),
            ymin: y1.min(y2),
            xmax: x1.max(x2),
            ymax: y1.max(y2),
        }
    }

    /// Degenerate box at a point.
    pub fn point(x: f64, y: f64) -> Self {
        Self::new(x, y, x, y)
    }

    pub fn contains(&self, other: &BoxKey) -> bool {
        self.xmin <= other.xmin
            && self.ymin <= other.ymin
            && self.xmax >= other.xmax
            && self.ymax >= other.ymax
    }

    pub fn merge(&self, other: &BoxKey) -> BoxKey {
        BoxKey {
            xmin: self.xmin.min(other.xmin),
            ymin: self.ymin.min(other.ymin),
            xmax: self.xmax.max(other.xmax),
            ymax: self.ymax.max(other.ymax),
        }
    }
}

const BOX_LEN: usize = 32;

/// Box operator class: every attribute is a [`BoxKey`] stored as four big-endian f64.
#[derive(Clone, Copy, Debug, Default)]
pub struct BoxOpClass;

impl GistOpClass for BoxOpClass {
    type Key = BoxKey;

    fn name(&self) -> &'static str {
        "box_ops"
    }

    fn decompress(&self, _attno: usize, raw: &[u8]) -> Result<BoxKey> {
        if raw.len() != BOX_LEN {
            return Err(CheckError::Format("box key is not 32 bytes"));
        }
        let mut coords = [0f64; 4];
        for (i, coord) in coords.iter_mut().enumerate() {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&raw[i * 8..i * 8 + 8]);
            *coord = f64::from_be_bytes(bytes);
        }
        if coords.iter().any(|c| c.is_nan()) {
            return Err(CheckError::Format("box key holds NaN"));
        }
        let [xmin, ymin, xmax, ymax] = coords;
        if xmin > xmax || ymin > ymax {
            return Err(CheckError::Format("box key corners out of order"));
        }
        Ok(BoxKey {
            xmin,
            ymin,
            xmax,
            ymax,
        })
    }

    fn compress(&self, _attno: usize, key: &BoxKey) -> Vec<u8> {
        let mut out = Vec::with_capacity(BOX_LEN);
        for coord in [key.xmin, key.ymin, key.xmax, key.ymax] {
            out.extend_from_slice(&coord.to_be_bytes());
        }
        out
    }

    fn contained_by(&self, _attno: usize, child: &BoxKey, parent: &BoxKey) -> bool {
        parent.contains(child)
    }

    fn union(&self, _attno: usize, keys: &[BoxKey]) -> Option<BoxKey> {
        let (first, rest) = keys.split_first()?;
        Some(rest.iter().fold(*first, |acc, k| acc.merge(k)))
    }
}
