//! Structured description of a confirmed corruption finding.

use std::fmt;

use serde::Serialize;

use super::{Lsn, PageId};

/// Which invariant a corruption finding violates.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionKind {
    /// Page bytes failed to decode.
    PageFormat,
    /// Stored CRC does not match the page contents.
    Checksum,
    /// Meta page missing, misplaced or of an unsupported version.
    MetaPage,
    /// Page level disagrees with its position in the tree.
    Level,
    /// First live page of a level still has a left sibling.
    NotLeftmost,
    /// First live page of the root level is not flagged as root.
    NotTrueRoot,
    /// A page's left link does not name the page visited before it.
    SiblingLinks,
    /// A right-link chain revisits a page.
    CircularLink,
    /// An ignorable page ends a level.
    FellOffEnd,
    /// An item sorts after its page's high key.
    HighKey,
    /// Two adjacent items on a page are out of order.
    ItemOrder,
    /// A page's last item sorts after the first item of its right sibling.
    CrossPageOrder,
    /// A child holds a key below its parent's downlink.
    DownlinkLowerBound,
    /// A table row has no matching leaf entry.
    HeapTupleMissing,
    /// Parent and child disagree on attribute nullness.
    GistNullMismatch,
    /// A child key escapes its parent key.
    GistContainment,
    /// Parent and child carry different attribute counts.
    GistAttributeCount,
    /// An internal GiST page has no downlinks.
    GistNoChildren,
    /// An internal GiST page points at leaves and internal pages at once.
    GistMixedChildren,
    /// A split right link leads from an internal GiST page to a leaf.
    GistSplitTarget,
}

/// `(page, slot)` location of an item named by a finding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ItemLocation {
    pub page: PageId,
    pub slot: u16,
}

impl ItemLocation {
    pub const fn new(page: PageId, slot: u16) -> Self {
        Self { page, slot }
    }
}

impl fmt::Display for ItemLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.page, self.slot)
    }
}

/// A confirmed corruption finding. Verification stops at the first one.
#[derive(Clone, Debug, Serialize)]
pub struct Corruption {
    pub kind: CorruptionKind,
    pub index: String,
    pub page: Option<PageId>,
    pub lsn: Option<Lsn>,
    pub items: Vec<ItemLocation>,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl Corruption {
    pub fn new(kind: CorruptionKind, index: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            index: index.to_owned(),
            page: None,
            lsn: None,
            items: Vec::new(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    pub fn on_page(mut self, page: PageId, lsn: Option<Lsn>) -> Self {
        self.page = Some(page);
        self.lsn = lsn;
        self
    }

    pub fn with_item(mut self, item: ItemLocation) -> Self {
        self.items.push(item);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, "; {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {hint})")?;
        }
        Ok(())
    }
}
