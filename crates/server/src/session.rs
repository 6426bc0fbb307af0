//! Per-connection session state.

use std::path::PathBuf;

use cumulus_storage::UploadCheckpoint;

/// In-flight upload attached to a session.
///
/// At most one per connection; a fresh `FILE_UPLOAD_INIT` replaces any
/// previous one (the on-disk checkpoint survives for a later resume).
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub checkpoint: UploadCheckpoint,
    pub expected_total: u64,
    pub declared_md5: String,
    pub logical: PathBuf,
}

/// State the dispatcher keeps for one connection.
///
/// Owned exclusively by the connection's reader task; workers only ever see
/// a by-value snapshot of the upload slot.
#[derive(Debug)]
pub struct Session {
    /// Peer address, for diagnostics only.
    pub peer: String,
    /// Authenticated subject; empty until `LOGIN` or `TOKEN_AUTH` succeeds.
    pub username: String,
    /// Working directory relative to the user's root.
    pub cwd: PathBuf,
    pub upload: Option<UploadSession>,
}

impl Session {
    pub fn new(peer: String) -> Self {
        Self {
            peer,
            username: String::new(),
            cwd: PathBuf::from("."),
            upload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_is_anonymous_at_root() {
        let session = Session::new("127.0.0.1:9999".into());
        assert!(session.username.is_empty());
        assert_eq!(session.cwd, PathBuf::from("."));
        assert!(session.upload.is_none());
    }
}
