//! The storage engine: all byte- and directory-level operations beneath a
//! single storage root.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::checkpoint::{self, UploadCheckpoint};
use crate::digest;
use crate::paths;
use crate::StorageError;

/// Files at or above this size are read through a memory map.
const MMAP_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Hidden per-user directory holding upload checkpoints.
const RESUME_DIR: &str = ".resume";

/// One directory-listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
    /// Byte size; zero for directories.
    pub size: u64,
    /// Modification time in whole seconds since the Unix epoch.
    pub modified: i64,
}

/// Storage engine rooted at a single directory, one subdirectory per user.
///
/// The engine exclusively owns the bytes under its root. All operations take
/// a username and a logical path relative to that user's root; realized
/// paths are checked against symlink escapes before any I/O happens.
#[derive(Debug)]
pub struct StorageEngine {
    root: PathBuf,
}

impl StorageEngine {
    /// Opens (and creates if needed) the storage root.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The user's private directory, created on first use.
    pub fn user_root(&self, username: &str) -> Result<PathBuf, StorageError> {
        let path = self.root.join(username);
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Resolves a logical path to its absolute location under the user root.
    ///
    /// Fails with [`StorageError::PathTraversal`] if the realized path would
    /// escape the root after symlink resolution. Works for paths that do not
    /// exist yet (upload targets).
    pub fn resolve(&self, username: &str, relative: &Path) -> Result<PathBuf, StorageError> {
        let base = self.user_root(username)?;
        paths::sanitize(&base, relative)
    }

    /// Lists directory contents; a missing target yields the empty list.
    pub fn list(&self, username: &str, relative: &Path) -> Result<Vec<DirEntry>, StorageError> {
        let target = self.resolve(username, relative)?;
        if !target.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&target)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_directory: metadata.is_dir(),
                size: if metadata.is_file() { metadata.len() } else { 0 },
                modified,
            });
        }
        Ok(entries)
    }

    /// Idempotently creates a directory chain; returns whether the directory
    /// exists afterwards.
    pub fn ensure_directory(&self, username: &str, relative: &Path) -> Result<bool, StorageError> {
        let target = self.resolve(username, relative)?;
        if fs::create_dir_all(&target).is_err() {
            return Ok(false);
        }
        Ok(target.is_dir())
    }

    /// Removes a file or recursively removes a directory; returns whether
    /// anything was removed.
    pub fn remove(&self, username: &str, relative: &Path) -> Result<bool, StorageError> {
        let target = self.resolve(username, relative)?;
        if !target.exists() {
            return Ok(false);
        }
        if target.is_dir() {
            fs::remove_dir_all(&target)?;
        } else {
            fs::remove_file(&target)?;
        }
        Ok(true)
    }

    /// Creates or resumes an upload checkpoint keyed by the declared digest.
    ///
    /// An existing meta file caps reported progress at
    /// `min(meta.received, total)`. A part file without meta counts its own
    /// length and gets a fresh meta file. Otherwise progress starts at zero.
    pub fn prepare_upload(
        &self,
        username: &str,
        md5: &str,
        logical: &Path,
        total: u64,
    ) -> Result<UploadCheckpoint, StorageError> {
        let final_path = self.resolve(username, logical)?;
        let resume_dir = self.checkpoint_dir(username)?;

        let mut checkpoint = UploadCheckpoint {
            total,
            received: 0,
            final_path,
            part_path: resume_dir.join(format!("{md5}.part")),
            meta_path: resume_dir.join(format!("{md5}.meta")),
        };

        if let Some(parent) = checkpoint.final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if checkpoint.meta_path.exists() {
            let meta = checkpoint::read_meta(&checkpoint.meta_path)?;
            checkpoint.received = meta.received.min(total);
            debug!(
                md5,
                received = checkpoint.received,
                "resuming upload from checkpoint"
            );
        } else if checkpoint.part_path.exists() {
            checkpoint.received = fs::metadata(&checkpoint.part_path)?.len().min(total);
            checkpoint::write_meta(&checkpoint)?;
        } else {
            checkpoint::write_meta(&checkpoint)?;
        }
        Ok(checkpoint)
    }

    /// Positional write into the part file.
    ///
    /// The caller guarantees `offset` equals the checkpoint's current
    /// `received`; out-of-order chunks are a protocol error handled upstream.
    pub fn write_chunk(
        &self,
        checkpoint: &UploadCheckpoint,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&checkpoint.part_path)?;
        file.write_all_at(data, offset)?;
        Ok(())
    }

    /// Rewrites the meta file with a new received count.
    ///
    /// Must be ordered after the matching [`write_chunk`](Self::write_chunk)
    /// so a crash leaves `received` at or below the bytes on disk.
    pub fn update_progress(
        &self,
        checkpoint: &UploadCheckpoint,
        received: u64,
    ) -> Result<(), StorageError> {
        let mut updated = checkpoint.clone();
        updated.received = received;
        checkpoint::write_meta(&updated)?;
        Ok(())
    }

    /// Atomically moves the part file to its final path and drops the meta
    /// file.
    pub fn finalize_upload(&self, checkpoint: &UploadCheckpoint) -> Result<PathBuf, StorageError> {
        if let Some(parent) = checkpoint.final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&checkpoint.part_path, &checkpoint.final_path)?;
        remove_if_present(&checkpoint.meta_path)?;
        Ok(checkpoint.final_path.clone())
    }

    /// Removes both checkpoint files; used on digest mismatch or cancel.
    pub fn discard_checkpoint(&self, checkpoint: &UploadCheckpoint) -> Result<(), StorageError> {
        remove_if_present(&checkpoint.part_path)?;
        remove_if_present(&checkpoint.meta_path)?;
        Ok(())
    }

    /// Removes a single stored file; missing files are not an error.
    pub fn remove_file(&self, absolute: &Path) -> Result<(), StorageError> {
        remove_if_present(absolute)?;
        Ok(())
    }

    /// Reads up to `length` bytes starting at `offset`.
    ///
    /// Returns empty bytes at or past end-of-file. Large files go through a
    /// memory map; small ones use a positional read.
    pub fn read_chunk(
        &self,
        absolute: &Path,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>, StorageError> {
        let size = self.file_size(absolute);
        if offset >= size {
            return Ok(Vec::new());
        }
        let to_read = length.min((size - offset) as usize);

        let file = File::open(absolute)?;
        if size >= MMAP_THRESHOLD {
            // Safety: the map is private and dropped before returning.
            let map = unsafe { memmap2::Mmap::map(&file)? };
            let start = offset as usize;
            Ok(map[start..start + to_read].to_vec())
        } else {
            let mut buf = vec![0u8; to_read];
            file.read_exact_at(&mut buf, offset)?;
            Ok(buf)
        }
    }

    /// Streaming MD5 of the file's current contents.
    pub fn compute_md5(&self, absolute: &Path) -> Result<String, StorageError> {
        Ok(digest::file_md5(absolute)?)
    }

    /// File size in bytes; zero if the file does not exist.
    pub fn file_size(&self, absolute: &Path) -> u64 {
        fs::metadata(absolute).map(|m| m.len()).unwrap_or(0)
    }

    /// Copies already-stored bytes to a new physical location (instant
    /// transfer from a dedup source).
    pub fn clone_file(&self, source: &Path, dest: &Path) -> Result<(), StorageError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, dest)?;
        Ok(())
    }

    fn checkpoint_dir(&self, username: &str) -> Result<PathBuf, StorageError> {
        let dir = self.user_root(username)?.join(RESUME_DIR);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (tempfile::TempDir, StorageEngine) {
        let tmp = tempfile::tempdir().unwrap();
        let engine = StorageEngine::new(tmp.path().join("storage")).unwrap();
        (tmp, engine)
    }

    #[test]
    fn resolve_stays_under_user_root() {
        let (_tmp, engine) = engine();
        let resolved = engine.resolve("alice", Path::new("docs/a.txt")).unwrap();
        assert!(resolved.ends_with("alice/docs/a.txt"));
    }

    #[test]
    fn resolve_isolates_users() {
        let (_tmp, engine) = engine();
        let alice = engine.resolve("alice", Path::new("f")).unwrap();
        let bob = engine.resolve("bob", Path::new("f")).unwrap();
        assert_ne!(alice, bob);
    }

    #[test]
    fn list_missing_directory_is_empty() {
        let (_tmp, engine) = engine();
        let entries = engine.list("alice", Path::new("nope")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn list_reports_kind_and_size() {
        let (_tmp, engine) = engine();
        let root = engine.user_root("alice").unwrap();
        fs::write(root.join("file.bin"), b"12345").unwrap();
        fs::create_dir(root.join("sub")).unwrap();

        let mut entries = engine.list("alice", Path::new(".")).unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "file.bin");
        assert!(!entries[0].is_directory);
        assert_eq!(entries[0].size, 5);
        assert!(entries[0].modified > 0);
        assert_eq!(entries[1].name, "sub");
        assert!(entries[1].is_directory);
        assert_eq!(entries[1].size, 0);
    }

    #[test]
    fn ensure_directory_is_idempotent() {
        let (_tmp, engine) = engine();
        assert!(engine.ensure_directory("alice", Path::new("a/b/c")).unwrap());
        assert!(engine.ensure_directory("alice", Path::new("a/b/c")).unwrap());
    }

    #[test]
    fn ensure_directory_over_file_fails() {
        let (_tmp, engine) = engine();
        let root = engine.user_root("alice").unwrap();
        fs::write(root.join("taken"), b"x").unwrap();
        assert!(!engine.ensure_directory("alice", Path::new("taken")).unwrap());
    }

    #[test]
    fn remove_file_and_directory() {
        let (_tmp, engine) = engine();
        let root = engine.user_root("alice").unwrap();
        fs::write(root.join("f"), b"x").unwrap();
        fs::create_dir_all(root.join("d/inner")).unwrap();
        fs::write(root.join("d/inner/g"), b"y").unwrap();

        assert!(engine.remove("alice", Path::new("f")).unwrap());
        assert!(engine.remove("alice", Path::new("d")).unwrap());
        assert!(!engine.remove("alice", Path::new("f")).unwrap());
        assert!(!root.join("d").exists());
    }

    #[test]
    fn upload_flow_writes_progresses_finalizes() {
        let (_tmp, engine) = engine();
        let checkpoint = engine
            .prepare_upload("alice", "cafebabe", Path::new("out/data.bin"), 10)
            .unwrap();
        assert_eq!(checkpoint.received, 0);

        engine.write_chunk(&checkpoint, 0, b"hello").unwrap();
        engine.update_progress(&checkpoint, 5).unwrap();
        engine.write_chunk(&checkpoint, 5, b"world").unwrap();
        engine.update_progress(&checkpoint, 10).unwrap();

        let final_path = engine.finalize_upload(&checkpoint).unwrap();
        assert_eq!(fs::read(&final_path).unwrap(), b"helloworld");
        assert!(!checkpoint.part_path.exists());
        assert!(!checkpoint.meta_path.exists());
    }

    #[test]
    fn prepare_resumes_from_meta() {
        let (_tmp, engine) = engine();
        let first = engine
            .prepare_upload("alice", "feed", Path::new("big.bin"), 100)
            .unwrap();
        engine.write_chunk(&first, 0, &[1u8; 40]).unwrap();
        engine.update_progress(&first, 40).unwrap();

        let resumed = engine
            .prepare_upload("alice", "feed", Path::new("big.bin"), 100)
            .unwrap();
        assert_eq!(resumed.received, 40);
    }

    #[test]
    fn prepare_resumes_from_orphan_part_file() {
        let (_tmp, engine) = engine();
        let first = engine
            .prepare_upload("alice", "0ddba11", Path::new("orphan.bin"), 64)
            .unwrap();
        engine.write_chunk(&first, 0, &[9u8; 24]).unwrap();
        // Simulate a crash before any progress write survived.
        fs::remove_file(&first.meta_path).unwrap();

        let resumed = engine
            .prepare_upload("alice", "0ddba11", Path::new("orphan.bin"), 64)
            .unwrap();
        assert_eq!(resumed.received, 24);
        assert!(resumed.meta_path.exists());
    }

    #[test]
    fn prepare_caps_received_at_total() {
        let (_tmp, engine) = engine();
        let first = engine
            .prepare_upload("alice", "beef", Path::new("shrunk.bin"), 100)
            .unwrap();
        engine.write_chunk(&first, 0, &[0u8; 80]).unwrap();
        engine.update_progress(&first, 80).unwrap();

        // The client re-declares a smaller total for the same digest.
        let resumed = engine
            .prepare_upload("alice", "beef", Path::new("shrunk.bin"), 50)
            .unwrap();
        assert_eq!(resumed.received, 50);
    }

    #[test]
    fn progress_never_exceeds_part_size() {
        let (_tmp, engine) = engine();
        let checkpoint = engine
            .prepare_upload("alice", "abad1dea", Path::new("inv.bin"), 32)
            .unwrap();
        engine.write_chunk(&checkpoint, 0, &[7u8; 16]).unwrap();
        engine.update_progress(&checkpoint, 16).unwrap();

        let meta_received = checkpoint::read_meta(&checkpoint.meta_path).unwrap().received;
        let part_size = fs::metadata(&checkpoint.part_path).unwrap().len();
        assert!(meta_received <= part_size);
        assert!(part_size <= checkpoint.total);
    }

    #[test]
    fn discard_removes_both_files() {
        let (_tmp, engine) = engine();
        let checkpoint = engine
            .prepare_upload("alice", "dead", Path::new("drop.bin"), 8)
            .unwrap();
        engine.write_chunk(&checkpoint, 0, &[1u8; 8]).unwrap();

        engine.discard_checkpoint(&checkpoint).unwrap();
        assert!(!checkpoint.part_path.exists());
        assert!(!checkpoint.meta_path.exists());
        // Discarding again is harmless.
        engine.discard_checkpoint(&checkpoint).unwrap();
    }

    #[test]
    fn read_chunk_ranges() {
        let (_tmp, engine) = engine();
        let root = engine.user_root("alice").unwrap();
        let path = root.join("r.bin");
        fs::write(&path, b"0123456789").unwrap();

        assert_eq!(engine.read_chunk(&path, 0, 4).unwrap(), b"0123");
        assert_eq!(engine.read_chunk(&path, 6, 100).unwrap(), b"6789");
        assert!(engine.read_chunk(&path, 10, 4).unwrap().is_empty());
        assert!(engine.read_chunk(&path, 99, 4).unwrap().is_empty());
    }

    #[test]
    fn file_size_of_missing_file_is_zero() {
        let (_tmp, engine) = engine();
        assert_eq!(engine.file_size(Path::new("/no/such/file")), 0);
    }

    #[test]
    fn clone_file_copies_bytes() {
        let (_tmp, engine) = engine();
        let root = engine.user_root("alice").unwrap();
        let src = root.join("src.bin");
        fs::write(&src, b"shared bytes").unwrap();

        let dest = engine.user_root("bob").unwrap().join("nested/copy.bin");
        engine.clone_file(&src, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"shared bytes");
    }
}
