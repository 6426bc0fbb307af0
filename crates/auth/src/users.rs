//! User accounts over SQLite.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::password;
use crate::AuthError;

struct UserRecord {
    password_hash: String,
    salt: String,
}

/// Account store: registration and credential checks.
///
/// Shares a database file with the catalog but owns its own connection,
/// serialized behind a mutex.
pub struct UserStore {
    conn: Mutex<Connection>,
}

impl UserStore {
    /// Opens (creating if needed) the accounts database and its schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, AuthError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), AuthError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );",
        )?;
        Ok(())
    }

    /// Creates an account. Returns `false` when the username is taken or
    /// either field is blank.
    pub fn register(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        if username.is_empty() || password.is_empty() {
            return Ok(false);
        }

        let salt = password::generate_salt();
        let hash = password::hash_password(password, &salt);

        // Existence check and insert under one lock acquisition, so two
        // connections racing to register the same name cannot both pass the
        // check and turn the UNIQUE constraint into an error reply.
        let conn = self.conn.lock();
        let taken = conn
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1",
                params![username],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if taken {
            return Ok(false);
        }

        let inserted = conn.execute(
            "INSERT INTO users (username, password_hash, salt) VALUES (?1, ?2, ?3)",
            params![username, hash, salt],
        )?;
        debug!(username, "account registered");
        Ok(inserted == 1)
    }

    /// Checks a username/password pair against the stored hash.
    pub fn validate(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        let Some(record) = self.find(username)? else {
            return Ok(false);
        };
        let attempted = password::hash_password(password, &record.salt);
        Ok(attempted == record.password_hash)
    }

    fn find(&self, username: &str) -> Result<Option<UserRecord>, AuthError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT password_hash, salt FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(UserRecord {
                        password_hash: row.get(0)?,
                        salt: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}
