//! The Cumulus drive server.
//!
//! A single listener accepts framed-protocol connections; each connection
//! gets a reader task that decodes and dispatches commands against shared
//! state, and a write pump that drains an outbox channel back onto the
//! socket. Long-running work (upload finalization) runs on a fixed worker
//! pool and delivers its reply through the same outbox, so slow digests
//! never stall other connections.

pub mod config;
mod dispatch;
pub mod server;
mod session;
pub mod tasks;

pub use config::DriveConfig;
pub use server::DriveServer;

/// Errors raised while starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] cumulus_storage::StorageError),

    #[error(transparent)]
    Catalog(#[from] cumulus_catalog::CatalogError),

    #[error(transparent)]
    Auth(#[from] cumulus_auth::AuthError),
}
