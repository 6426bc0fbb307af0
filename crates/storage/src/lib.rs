//! On-disk storage engine for the Cumulus drive.
//!
//! Each user owns a directory under the storage root; every path a client
//! supplies is normalized and sanitized so it cannot escape that directory.
//! Uploads are resumable: bytes land in a hidden checkpoint area keyed by
//! the declared content digest, and a small meta file tracks progress so an
//! interrupted transfer can continue after a crash or disconnect.

pub mod checkpoint;
pub mod digest;
pub mod engine;
pub mod paths;

pub use checkpoint::UploadCheckpoint;
pub use engine::{DirEntry, StorageEngine};
pub use paths::normalize_relative;

/// Errors produced by the storage engine.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path escapes the user root: {path}")]
    PathTraversal { path: String },
}
