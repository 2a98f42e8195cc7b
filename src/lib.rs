//! Online integrity checks for paged B-Tree and GiST indexes.
//!
//! The verifier walks index pages one at a time, copying each page out of the
//! store before inspecting it, and reports the first confirmed invariant
//! violation as a [`types::Corruption`]. Benign anomalies caused by concurrent
//! writers are recorded as concerns instead.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;
pub mod verify;
