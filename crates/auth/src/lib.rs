//! Accounts and bearer tokens for the Cumulus drive.
//!
//! [`UserStore`] keeps usernames and salted password hashes in SQLite;
//! [`TokenService`] turns a validated username into a signed bearer token
//! and later recovers the subject from it. The rest of the system treats
//! both as opaque: a token either verifies to a subject or it does not.

pub mod password;
pub mod tokens;
pub mod users;

pub use tokens::{Claims, TokenError, TokenService};
pub use users::UserStore;

/// Errors produced by the user store.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
