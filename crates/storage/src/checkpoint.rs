//! Upload checkpoints: the on-disk state that lets an interrupted upload
//! resume.
//!
//! A checkpoint is a pair of files in the user's hidden `.resume` directory,
//! keyed by the declared content digest:
//!
//! - `<digest>.part` holds received bytes at their final offsets
//! - `<digest>.meta` holds `key=value` lines recording the target path, the
//!   expected total and the byte count received so far
//!
//! The meta file is the source of truth after a restart. It is rewritten
//! only after the corresponding part-file write has completed, so a crash
//! leaves `received` at or below the bytes actually on disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// In-memory handle for one resumable upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCheckpoint {
    /// Expected size of the complete file.
    pub total: u64,
    /// Bytes received so far.
    pub received: u64,
    /// Where the file lands once finalized.
    pub final_path: PathBuf,
    /// The part file accumulating bytes.
    pub part_path: PathBuf,
    /// The progress meta file.
    pub meta_path: PathBuf,
}

pub(crate) struct CheckpointMeta {
    pub total: u64,
    pub received: u64,
}

pub(crate) fn write_meta(checkpoint: &UploadCheckpoint) -> io::Result<()> {
    let contents = format!(
        "path={}\ntotal={}\nreceived={}\n",
        checkpoint.final_path.display(),
        checkpoint.total,
        checkpoint.received,
    );
    fs::write(&checkpoint.meta_path, contents)
}

pub(crate) fn read_meta(meta_path: &Path) -> io::Result<CheckpointMeta> {
    let contents = fs::read_to_string(meta_path)?;
    let mut meta = CheckpointMeta {
        total: 0,
        received: 0,
    };
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "total" => meta.total = value.parse().unwrap_or(0),
            "received" => meta.received = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint_in(dir: &Path) -> UploadCheckpoint {
        UploadCheckpoint {
            total: 4096,
            received: 1024,
            final_path: dir.join("docs/report.bin"),
            part_path: dir.join(".resume/abc.part"),
            meta_path: dir.join(".resume/abc.meta"),
        }
    }

    #[test]
    fn meta_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join(".resume")).unwrap();
        let checkpoint = checkpoint_in(tmp.path());

        write_meta(&checkpoint).unwrap();
        let meta = read_meta(&checkpoint.meta_path).unwrap();
        assert_eq!(meta.total, 4096);
        assert_eq!(meta.received, 1024);
    }

    #[test]
    fn read_meta_skips_malformed_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.meta");
        fs::write(&path, "garbage\ntotal=10\nreceived=not_a_number\n").unwrap();

        let meta = read_meta(&path).unwrap();
        assert_eq!(meta.total, 10);
        assert_eq!(meta.received, 0);
    }

    #[test]
    fn read_meta_missing_file_errors() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_meta(&tmp.path().join("absent.meta")).is_err());
    }
}
