#![deny(missing_docs)]
#![deny(unsafe_code)]
//! SQRL "S4" identity storage container format.
//!
//! An S4 document is an ordered concatenation of self-describing blocks:
//!
//! ```text
//! u16 length (LE, total block size including this 4-byte header)
//! u16 type   (LE)
//! ...        (length - 4 payload bytes)
//! ```
//!
//! [`Block`] is both the parser and the serializer: it owns the full wire
//! image of one block and exposes a random-access cursor with little-endian
//! integer and raw byte accessors. [`Storage`] holds a whole document and
//! handles the two export encodings:
//!
//! - binary, prefixed with the ASCII signature `sqrldata`
//! - text armor, prefixed with `SQRLDATA` and followed by the url-safe
//!   unpadded base64 of the block stream (line-wrapped input is accepted)
//!
//! The defined identity block types (1 — password-protected master keys,
//! 2 — rescue-code-protected unlock key, 3 — previous unlock keys) are
//! interpreted by the identity layer; this crate treats every type alike,
//! so unknown blocks survive a load/save cycle untouched.

mod error;
pub use error::*;

mod block;
pub use block::*;

mod storage;
pub use storage::*;
