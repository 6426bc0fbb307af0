//! Wire protocol for the Cumulus drive.
//!
//! Every request and response is a single frame: a fixed preamble, a text
//! header block, and an opaque body.
//!
//! # Wire format
//!
//! ```text
//! [4 bytes BE: magic 0x45434452]
//! [2 bytes BE: version]
//! [2 bytes BE: header_len]
//! [4 bytes BE: body_len]
//! [header_len bytes: "key=value\n" entries, final newline optional]
//! [body_len bytes: raw payload]
//! ```
//!
//! Header keys and values are opaque strings; `=` and `\n` must not appear
//! in values (producers are responsible). One frame carries one logical
//! message; there is no multiplexing within a connection.

pub mod frame;
pub mod message;

pub use frame::{FrameDecoder, WireError, encode};
pub use message::Message;

/// Frame magic, "ECDR" as a big-endian u32.
pub const MAGIC: u32 = 0x4543_4452;

/// Current protocol version.
pub const VERSION: u16 = 1;

/// Fixed preamble length: magic + version + header_len + body_len.
pub const PREAMBLE_LEN: usize = 12;

/// Largest header block a frame can carry (the length field is a u16).
pub const MAX_HEADER_BYTES: usize = u16::MAX as usize;
