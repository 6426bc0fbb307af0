//! Metadata catalog for the Cumulus drive.
//!
//! A single SQLite table maps `(owner, logical_path)` to the stored file's
//! digest, physical location and size, with a secondary index on the digest
//! for dedup lookups (instant transfer). The catalog never assumes it is in
//! lockstep with the bytes on disk: a row without a file surfaces as
//! `notfound` on the next access, a file without a row merely forfeits
//! instant transfer.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

/// Errors produced by the catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One catalog row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub owner: String,
    pub logical_path: String,
    pub md5: String,
    pub storage_path: String,
    pub size: u64,
}

/// SQLite-backed catalog.
///
/// The connection sits behind a mutex: worker threads upsert after
/// finalization while the dispatcher reads, and SQLite wants one writer at a
/// time on a shared handle.
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Opens (creating if needed) the catalog database and its schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.create_tables()?;
        Ok(catalog)
    }

    /// In-memory catalog for tests.
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        let catalog = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        catalog.create_tables()?;
        Ok(catalog)
    }

    fn create_tables(&self) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS user_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                logical_path TEXT NOT NULL,
                md5 TEXT NOT NULL,
                storage_path TEXT NOT NULL,
                size INTEGER NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(owner, logical_path)
            );
            CREATE INDEX IF NOT EXISTS idx_user_files_md5 ON user_files(md5);",
        )?;
        Ok(())
    }

    /// Looks up the row for one logical path.
    pub fn find_by_path(
        &self,
        owner: &str,
        logical_path: &str,
    ) -> Result<Option<FileRecord>, CatalogError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT owner, logical_path, md5, storage_path, size
                 FROM user_files WHERE owner = ?1 AND logical_path = ?2",
                params![owner, logical_path],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Returns any one row carrying this digest; the dedup source for
    /// instant transfers.
    pub fn find_by_md5(&self, md5: &str) -> Result<Option<FileRecord>, CatalogError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT owner, logical_path, md5, storage_path, size
                 FROM user_files WHERE md5 = ?1 LIMIT 1",
                params![md5],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Inserts or updates the row for `(owner, logical_path)` in one atomic
    /// step.
    pub fn upsert(&self, record: &FileRecord) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_files (owner, logical_path, md5, storage_path, size)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(owner, logical_path)
             DO UPDATE SET md5 = excluded.md5,
                           storage_path = excluded.storage_path,
                           size = excluded.size,
                           updated_at = CURRENT_TIMESTAMP",
            params![
                record.owner,
                record.logical_path,
                record.md5,
                record.storage_path,
                record.size as i64,
            ],
        )?;
        Ok(())
    }

    /// Deletes the row for `(owner, logical_path)`; no-op when absent.
    pub fn remove(&self, owner: &str, logical_path: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM user_files WHERE owner = ?1 AND logical_path = ?2",
            params![owner, logical_path],
        )?;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        owner: row.get(0)?,
        logical_path: row.get(1)?,
        md5: row.get(2)?,
        storage_path: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: &str, path: &str, md5: &str) -> FileRecord {
        FileRecord {
            owner: owner.into(),
            logical_path: path.into(),
            md5: md5.into(),
            storage_path: format!("/srv/storage/{owner}/{path}"),
            size: 1024,
        }
    }

    #[test]
    fn upsert_then_find_by_path() {
        let catalog = Catalog::open_in_memory().unwrap();
        let rec = record("alice", "docs/a.txt", "aaa");
        catalog.upsert(&rec).unwrap();

        let found = catalog.find_by_path("alice", "docs/a.txt").unwrap();
        assert_eq!(found, Some(rec));
    }

    #[test]
    fn find_missing_is_none() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert!(catalog.find_by_path("alice", "nope").unwrap().is_none());
        assert!(catalog.find_by_md5("ffff").unwrap().is_none());
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.upsert(&record("alice", "a.txt", "old")).unwrap();

        let mut newer = record("alice", "a.txt", "new");
        newer.size = 2048;
        catalog.upsert(&newer).unwrap();

        let found = catalog.find_by_path("alice", "a.txt").unwrap().unwrap();
        assert_eq!(found.md5, "new");
        assert_eq!(found.size, 2048);
    }

    #[test]
    fn find_by_md5_returns_a_match() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.upsert(&record("alice", "one.bin", "shared")).unwrap();
        catalog.upsert(&record("bob", "two.bin", "shared")).unwrap();

        let found = catalog.find_by_md5("shared").unwrap().unwrap();
        assert_eq!(found.md5, "shared");
    }

    #[test]
    fn remove_deletes_and_tolerates_absence() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.upsert(&record("alice", "gone.txt", "abc")).unwrap();

        catalog.remove("alice", "gone.txt").unwrap();
        assert!(catalog.find_by_path("alice", "gone.txt").unwrap().is_none());

        // Removing again is a no-op.
        catalog.remove("alice", "gone.txt").unwrap();
    }

    #[test]
    fn owners_do_not_collide() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.upsert(&record("alice", "same.txt", "a1")).unwrap();
        catalog.upsert(&record("bob", "same.txt", "b1")).unwrap();

        let alice = catalog.find_by_path("alice", "same.txt").unwrap().unwrap();
        let bob = catalog.find_by_path("bob", "same.txt").unwrap().unwrap();
        assert_eq!(alice.md5, "a1");
        assert_eq!(bob.md5, "b1");
    }

    #[test]
    fn persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("data/catalog.db");

        {
            let catalog = Catalog::open(&db).unwrap();
            catalog.upsert(&record("alice", "keep.txt", "k1")).unwrap();
        }

        let reopened = Catalog::open(&db).unwrap();
        let found = reopened.find_by_path("alice", "keep.txt").unwrap();
        assert!(found.is_some());
    }
}
