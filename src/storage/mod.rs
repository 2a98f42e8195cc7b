//! On-page index formats, key ordering and the table scanning seam.

/// B-Tree page layout, meta page, bulk loader and damage helpers.
pub mod btree;

/// Key ordering policies.
pub mod compare;

/// GiST page layout, operator classes and builder.
pub mod gist;

/// Slot directory shared by the page layouts.
pub mod slots;

/// Backing-table row sources for cross-table verification.
pub mod heap;
