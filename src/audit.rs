// 📜 Audit Log - append-only trail of state-changing actions
//
// Entries are never updated or deleted (enforced by triggers in the schema).
// Ordering is by the assigned log id, never by wall-clock, so concurrent
// appends cannot tie.

use crate::db::{format_timestamp, parse_timestamp, unknown_value, Database};
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;

/// Actor recorded when no user is behind an action
pub const SYSTEM_ACTOR: &str = "system";

const DEFAULT_PAGE_SIZE: usize = 100;

// ============================================================================
// AUDIT ACTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Verify,
    Link,
    Unlink,
    View,
    Send,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Verify => "VERIFY",
            AuditAction::Link => "LINK",
            AuditAction::Unlink => "UNLINK",
            AuditAction::View => "VIEW",
            AuditAction::Send => "SEND",
        }
    }
}

impl FromStr for AuditAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "VERIFY" => Ok(AuditAction::Verify),
            "LINK" => Ok(AuditAction::Link),
            "UNLINK" => Ok(AuditAction::Unlink),
            "VIEW" => Ok(AuditAction::View),
            "SEND" => Ok(AuditAction::Send),
            _ => Err(CoreError::validation("action", format!("unknown audit action: {}", s))),
        }
    }
}

// ============================================================================
// LOG ENTRY
// ============================================================================

/// Immutable audit record. Details are free text and never carry secrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub log_id: i64,
    pub action: AuditAction,
    pub timestamp: DateTime<Utc>,
    /// Account number, statement id or notification id the action touched
    pub subject: Option<String>,
    pub actor: String,
    pub details: String,
}

/// An entry waiting to be appended; id and timestamp are assigned on write
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub action: AuditAction,
    pub subject: Option<String>,
    pub actor: String,
    pub details: String,
}

impl NewLogEntry {
    pub fn new(action: AuditAction, details: impl Into<String>) -> Self {
        NewLogEntry {
            action,
            subject: None,
            actor: SYSTEM_ACTOR.to_string(),
            details: details.into(),
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

/// Append an entry on an open connection or transaction.
///
/// Stores call this inside their own transaction so the audit row and the
/// state change commit together.
pub(crate) fn append(conn: &Connection, entry: &NewLogEntry) -> CoreResult<LogEntry> {
    let timestamp = Utc::now();

    conn.execute(
        "INSERT INTO audit_log (action, timestamp, subject, actor, details)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.action.as_str(),
            format_timestamp(&timestamp),
            entry.subject,
            entry.actor,
            entry.details,
        ],
    )?;

    Ok(LogEntry {
        log_id: conn.last_insert_rowid(),
        action: entry.action,
        timestamp,
        subject: entry.subject.clone(),
        actor: entry.actor.clone(),
        details: entry.details.clone(),
    })
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let action_str: String = row.get(1)?;
    let timestamp_str: String = row.get(2)?;

    Ok(LogEntry {
        log_id: row.get(0)?,
        action: action_str
            .parse()
            .map_err(|_| unknown_value(1, "audit action", &action_str))?,
        timestamp: parse_timestamp(2, &timestamp_str)?,
        subject: row.get(3)?,
        actor: row.get(4)?,
        details: row.get(5)?,
    })
}

// ============================================================================
// FILTER
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    pub action: Option<AuditAction>,
    /// Inclusive lower bound
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound
    pub to: Option<DateTime<Utc>>,
    /// Account number (or other subject) the entries refer to
    pub subject: Option<String>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn account(mut self, account_number: impl Into<String>) -> Self {
        self.subject = Some(account_number.into());
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }
}

// ============================================================================
// AUDIT LOGGER
// ============================================================================

#[derive(Clone)]
pub struct AuditLogger {
    db: Database,
    page_size: usize,
}

impl AuditLogger {
    pub fn new(db: Database) -> Self {
        AuditLogger {
            db,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Append a system entry. Fails only when storage is unavailable.
    pub fn create(&self, action: AuditAction, details: &str) -> CoreResult<LogEntry> {
        self.record(NewLogEntry::new(action, details))
    }

    /// Append an entry carrying subject and actor
    pub fn record(&self, entry: NewLogEntry) -> CoreResult<LogEntry> {
        self.db.with_conn(|conn| append(conn, &entry))
    }

    /// Lazy, restartable query; nothing is read until iteration starts
    pub fn query(&self, filter: AuditFilter) -> AuditQuery {
        AuditQuery {
            db: self.db.clone(),
            filter,
            page_size: self.page_size,
        }
    }

    /// Total number of entries
    pub fn count(&self) -> CoreResult<i64> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?)
        })
    }
}

/// A reusable audit query. Each `iter()` starts a fresh pass from the
/// beginning of the log.
#[derive(Clone)]
pub struct AuditQuery {
    db: Database,
    filter: AuditFilter,
    page_size: usize,
}

impl AuditQuery {
    pub fn iter(&self) -> AuditCursor {
        AuditCursor {
            db: self.db.clone(),
            filter: self.filter.clone(),
            page_size: self.page_size,
            last_id: 0,
            upper_id: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Drain the whole query into memory
    pub fn collect_all(&self) -> CoreResult<Vec<LogEntry>> {
        self.iter().collect()
    }

    pub fn filter(&self) -> &AuditFilter {
        &self.filter
    }
}

impl<'a> IntoIterator for &'a AuditQuery {
    type Item = CoreResult<LogEntry>;
    type IntoIter = AuditCursor;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Keyset-paginated cursor over the audit log.
///
/// The highest log id is captured on the first fetch, so entries appended
/// while iterating are not seen and the sequence is always finite.
pub struct AuditCursor {
    db: Database,
    filter: AuditFilter,
    page_size: usize,
    last_id: i64,
    upper_id: Option<i64>,
    buffer: VecDeque<LogEntry>,
    exhausted: bool,
}

impl AuditCursor {
    fn fetch_page(&mut self) -> CoreResult<()> {
        let filter = &self.filter;
        let last_id = self.last_id;
        let page_size = self.page_size;
        let known_upper = self.upper_id;

        let (upper, rows) = self.db.with_conn(|conn| {
            let upper = match known_upper {
                Some(id) => id,
                None => conn.query_row(
                    "SELECT COALESCE(MAX(log_id), 0) FROM audit_log",
                    [],
                    |row| row.get(0),
                )?,
            };

            let mut stmt = conn.prepare(
                "SELECT log_id, action, timestamp, subject, actor, details
                 FROM audit_log
                 WHERE log_id > ?1 AND log_id <= ?2
                   AND (?3 IS NULL OR action = ?3)
                   AND (?4 IS NULL OR timestamp >= ?4)
                   AND (?5 IS NULL OR timestamp <= ?5)
                   AND (?6 IS NULL OR subject = ?6)
                 ORDER BY log_id ASC
                 LIMIT ?7",
            )?;

            let rows = stmt
                .query_map(
                    params![
                        last_id,
                        upper,
                        filter.action.map(|a| a.as_str()),
                        filter.from.as_ref().map(format_timestamp),
                        filter.to.as_ref().map(format_timestamp),
                        filter.subject,
                        page_size as i64,
                    ],
                    row_to_entry,
                )?
                .collect::<Result<Vec<_>, _>>()?;

            Ok((upper, rows))
        })?;

        self.upper_id = Some(upper);
        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.last_id = last.log_id;
        }
        self.buffer.extend(rows);
        Ok(())
    }
}

impl Iterator for AuditCursor {
    type Item = CoreResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
