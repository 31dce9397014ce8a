//! SQLite-backed account and session-audit store.
//!
//! Tables:
//! - `accounts`: username, password_hash, registration_time
//! - `sessions`: user_id, authorization_time
//!
//! Rows are append-only: the console registers accounts and records
//! authorization events, nothing here is updated or deleted.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// A registered account.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub registration_time: i64,
}

/// An authorization event recorded for an account.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: i64,
    pub account_id: i64,
    pub authorization_time: i64,
}

/// SQLite-backed store for accounts and their authorization history.
pub struct AccountStore {
    conn: Mutex<rusqlite::Connection>,
}

impl AccountStore {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        // WAL mode for crash safety; FK enforcement keeps every session
        // row pointing at a real account.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                registration_time INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES accounts(id),
                authorization_time INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Accounts ────────────────────────────────────────────────────

    /// Insert a newly registered account. Returns the account id.
    pub fn insert_account(&self, username: &str, password_hash: &str) -> Result<i64> {
        let trimmed = username.trim();
        if trimmed.is_empty() {
            bail!("Username cannot be empty");
        }

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO accounts (username, password_hash, registration_time)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![trimmed, password_hash, epoch_secs()],
        );

        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                bail!("Username '{trimmed}' is already registered")
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All registered accounts, oldest first, for the selection menu.
    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, username, registration_time FROM accounts ORDER BY id",
        )?;
        let accounts = stmt
            .query_map([], |row| {
                Ok(Account {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    registration_time: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    /// Look up an account by username.
    pub fn find_account(&self, username: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT id, username, registration_time FROM accounts WHERE username = ?1",
            rusqlite::params![username.trim()],
            |row| {
                Ok(Account {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    registration_time: row.get(2)?,
                })
            },
        );

        match row {
            Ok(account) => Ok(Some(account)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Count registered accounts.
    pub fn account_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Record that an account authorized. Returns the session row id.
    ///
    /// Fails if `account_id` does not reference an existing account;
    /// the FK constraint rejects the row.
    pub fn record_session(&self, account_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (user_id, authorization_time) VALUES (?1, ?2)",
            rusqlite::params![account_id, epoch_secs()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All recorded authorization events for one account, newest first.
    pub fn sessions_for(&self, account_id: i64) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, authorization_time FROM sessions
             WHERE user_id = ?1 ORDER BY id DESC",
        )?;
        let records = stmt
            .query_map(rusqlite::params![account_id], |row| {
                Ok(SessionRecord {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    authorization_time: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Count recorded authorization events.
    pub fn session_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// Hash an operator secret (SHA-256, hex-encoded).
///
/// The schema carries no salt column; the hash only ever compares against
/// itself and the plaintext is what the external site actually verifies.
pub fn hash_secret(secret: &str) -> String {
    let mut h = Sha256::new();
    h.update(secret.as_bytes());
    hex::encode(h.finalize())
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, AccountStore) {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("webreg.db");
        let store = AccountStore::open(&db_path).unwrap();
        (tmp, store)
    }

    #[test]
    fn insert_and_list_accounts() {
        let (_tmp, store) = test_store();

        let id = store.insert_account("alice", &hash_secret("pw")).unwrap();
        assert!(id > 0);

        let accounts = store.list_accounts().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].username, "alice");
        assert_eq!(accounts[0].id, id);
        assert!(accounts[0].registration_time > 0);
    }

    #[test]
    fn insert_duplicate_username_fails() {
        let (_tmp, store) = test_store();

        store.insert_account("alice", "h1").unwrap();
        let result = store.insert_account("alice", "h2");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("already registered"));
    }

    #[test]
    fn insert_empty_username_fails() {
        let (_tmp, store) = test_store();

        let result = store.insert_account("   ", "h");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn insert_trims_username() {
        let (_tmp, store) = test_store();

        store.insert_account("  bob  ", "h").unwrap();
        let found = store.find_account("bob").unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().username, "bob");
    }

    #[test]
    fn find_missing_account_returns_none() {
        let (_tmp, store) = test_store();
        assert!(store.find_account("ghost").unwrap().is_none());
    }

    #[test]
    fn schema_creation_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("webreg.db");

        let store = AccountStore::open(&db_path).unwrap();
        store.insert_account("alice", "h").unwrap();
        drop(store);

        // Reopening must not clobber existing rows.
        let store = AccountStore::open(&db_path).unwrap();
        assert_eq!(store.account_count().unwrap(), 1);
    }

    #[test]
    fn record_session_for_existing_account() {
        let (_tmp, store) = test_store();

        let id = store.insert_account("alice", "h").unwrap();
        let session_id = store.record_session(id).unwrap();
        assert!(session_id > 0);

        let records = store.sessions_for(id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].account_id, id);
        assert!(records[0].authorization_time > 0);
    }

    #[test]
    fn record_session_for_missing_account_fails() {
        let (_tmp, store) = test_store();

        // FK constraint: no account 999 exists.
        let result = store.record_session(999);
        assert!(result.is_err());
        assert_eq!(store.session_count().unwrap(), 0);
    }

    #[test]
    fn counts_track_inserts() {
        let (_tmp, store) = test_store();

        assert_eq!(store.account_count().unwrap(), 0);
        let a = store.insert_account("alice", "h").unwrap();
        let b = store.insert_account("bob", "h").unwrap();
        assert_eq!(store.account_count().unwrap(), 2);

        store.record_session(a).unwrap();
        store.record_session(b).unwrap();
        store.record_session(a).unwrap();
        assert_eq!(store.session_count().unwrap(), 3);
    }

    #[test]
    fn list_accounts_oldest_first() {
        let (_tmp, store) = test_store();

        store.insert_account("first", "h").unwrap();
        store.insert_account("second", "h").unwrap();
        let accounts = store.list_accounts().unwrap();
        assert_eq!(accounts[0].username, "first");
        assert_eq!(accounts[1].username, "second");
    }

    #[test]
    fn hash_secret_is_stable_hex() {
        let h = hash_secret("correct horse");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_secret("correct horse"));
        assert_ne!(h, hash_secret("wrong horse"));
    }
}
