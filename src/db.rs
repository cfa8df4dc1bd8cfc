// 🗄️ Database - shared SQLite handle and schema
//
// One connection behind a mutex. Every multi-statement write goes through
// `Database::transaction` so a state change and its audit entry commit or
// roll back together.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file and make sure the schema exists
    pub fn open(path: &Path) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        setup_database(&conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Fresh in-memory database (tests, demos)
    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Database {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Storage("database connection lock poisoned".to_string()))
    }

    /// Run read-only or single-statement work against the connection
    pub(crate) fn with_conn<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Connection) -> CoreResult<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside a transaction; any error rolls everything back
    pub(crate) fn transaction<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> CoreResult<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

pub fn setup_database(conn: &Connection) -> rusqlite::Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Accounts (owned by AccountStore; soft-unlink only)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            account_number TEXT PRIMARY KEY,
            ssn_digest TEXT NOT NULL,
            linked INTEGER NOT NULL DEFAULT 0,
            linked_user TEXT,
            verified_at TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Users (logically deleted through `active`, never purged)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            username TEXT UNIQUE NOT NULL,
            credential_hash TEXT NOT NULL,
            email TEXT NOT NULL,
            role TEXT NOT NULL,
            delivery_preference TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Audit log (append-only; ids are the ordering key)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log (
            log_id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            subject TEXT,
            actor TEXT NOT NULL,
            details TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS audit_log_no_update
         BEFORE UPDATE ON audit_log
         BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END",
        [],
    )?;

    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
         BEFORE DELETE ON audit_log
         BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END",
        [],
    )?;

    // ==========================================================================
    // Notifications
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications (
            notification_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            notification_type TEXT NOT NULL,
            sent_at TEXT NOT NULL,
            read INTEGER NOT NULL DEFAULT 0,
            delivery_status TEXT NOT NULL,
            delivery_error TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Statements (written by the external generator, immutable afterwards)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS statements (
            statement_id TEXT PRIMARY KEY,
            account_number TEXT NOT NULL,
            statement_date TEXT NOT NULL,
            document_ref TEXT NOT NULL,
            statement_type TEXT NOT NULL,
            issued_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS statements_no_update
         BEFORE UPDATE ON statements
         BEGIN SELECT RAISE(ABORT, 'statements are immutable'); END",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_linked_user ON accounts(linked_user)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_log(subject)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_statements_account_date
         ON statements(account_number, statement_date)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// COLUMN HELPERS
// ============================================================================

/// Fixed-precision RFC 3339 so stored timestamps sort lexicographically
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_date(idx: usize, raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Error for a TEXT column holding a value no enum variant matches
pub(crate) fn unknown_value(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unknown {}: {}", what, raw).into(),
    )
}
