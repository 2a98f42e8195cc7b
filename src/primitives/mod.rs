//! Low-level primitives shared by the index formats and the verifier.
//!
//! Includes byte utilities, positioned file I/O and the page store
//! abstraction the verifier reads through.

/// Byte-level utilities and encoding/decoding.
pub mod bytes;

/// Positioned file I/O.
pub mod io;

/// Page stores and relation-level locking.
pub mod pager;
