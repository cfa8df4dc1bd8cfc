// 📄 Statement Entity - read-only view of generated statements
//
// Statements are produced by an external generator (rendering and document
// storage live there). This core records them once and serves them to the
// account holder; every view or download is audited.

use crate::audit::{self, AuditAction, NewLogEntry};
use crate::db::{format_timestamp, parse_date, parse_timestamp, unknown_value, Database};
use crate::entities::account::validate_account_number;
use crate::entities::user::{load_user, User};
use crate::error::{is_constraint_violation, CoreError, CoreResult};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementType {
    Monthly,
    Quarterly,
    Annual,
    Tax,
}

impl StatementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementType::Monthly => "monthly",
            StatementType::Quarterly => "quarterly",
            StatementType::Annual => "annual",
            StatementType::Tax => "tax",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "monthly" => Some(StatementType::Monthly),
            "quarterly" => Some(StatementType::Quarterly),
            "annual" => Some(StatementType::Annual),
            "tax" => Some(StatementType::Tax),
            _ => None,
        }
    }
}

/// Opaque handle into the external document store (URL, object key, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentRef(pub String);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub statement_id: String,
    pub account_number: String,
    pub statement_date: NaiveDate,
    pub document_ref: DocumentRef,
    pub statement_type: StatementType,
    pub issued_at: DateTime<Utc>,
}

/// What the generator hands over; also the CSV row shape
#[derive(Debug, Clone, Deserialize)]
pub struct NewStatement {
    pub statement_id: String,
    pub account_number: String,
    pub statement_date: NaiveDate,
    pub document_ref: String,
    pub statement_type: StatementType,
}

const STATEMENT_COLUMNS: &str =
    "statement_id, account_number, statement_date, document_ref, statement_type, issued_at";

fn row_to_statement(row: &Row<'_>) -> rusqlite::Result<Statement> {
    let date_str: String = row.get(2)?;
    let type_str: String = row.get(4)?;
    let issued_at: String = row.get(5)?;

    Ok(Statement {
        statement_id: row.get(0)?,
        account_number: row.get(1)?,
        statement_date: parse_date(2, &date_str)?,
        document_ref: DocumentRef(row.get(3)?),
        statement_type: StatementType::parse(&type_str)
            .ok_or_else(|| unknown_value(4, "statement type", &type_str))?,
        issued_at: parse_timestamp(5, &issued_at)?,
    })
}

fn load_statement(conn: &Connection, statement_id: &str) -> CoreResult<Statement> {
    conn.query_row(
        &format!(
            "SELECT {} FROM statements WHERE statement_id = ?1",
            STATEMENT_COLUMNS
        ),
        [statement_id],
        row_to_statement,
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found("statement", statement_id))
}

/// Viewer must be active and either hold the account or be an admin.
/// `viewer` is the row as read on `conn`, never a caller-held copy.
fn authorize(conn: &Connection, viewer: &User, statement: &Statement) -> CoreResult<()> {
    viewer.ensure_active()?;
    if viewer.is_admin() {
        return Ok(());
    }

    let holder: Option<Option<String>> = conn
        .query_row(
            "SELECT linked_user FROM accounts WHERE account_number = ?1 AND linked = 1",
            [&statement.account_number],
            |row| row.get(0),
        )
        .optional()?;

    if holder.flatten().as_deref() == Some(viewer.user_id.as_str()) {
        Ok(())
    } else {
        Err(CoreError::permission_denied(format!(
            "statement {} does not belong to a linked account",
            statement.statement_id
        )))
    }
}

#[derive(Clone)]
pub struct StatementStore {
    db: Database,
}

impl StatementStore {
    pub fn new(db: Database) -> Self {
        StatementStore { db }
    }

    /// Record an issued statement; it cannot be changed afterwards
    pub fn record(&self, new: NewStatement) -> CoreResult<Statement> {
        if new.statement_id.trim().is_empty() {
            return Err(CoreError::validation("statement_id", "must not be empty"));
        }
        if new.document_ref.trim().is_empty() {
            return Err(CoreError::validation("document_ref", "must not be empty"));
        }
        validate_account_number(&new.account_number)?;

        let statement = Statement {
            statement_id: new.statement_id,
            account_number: new.account_number,
            statement_date: new.statement_date,
            document_ref: DocumentRef(new.document_ref),
            statement_type: new.statement_type,
            issued_at: Utc::now(),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO statements ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    STATEMENT_COLUMNS
                ),
                params![
                    statement.statement_id,
                    statement.account_number,
                    statement.statement_date.format("%Y-%m-%d").to_string(),
                    statement.document_ref.0,
                    statement.statement_type.as_str(),
                    format_timestamp(&statement.issued_at),
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    CoreError::Conflict(format!(
                        "statement {} already issued",
                        statement.statement_id
                    ))
                } else {
                    e.into()
                }
            })
        })?;

        Ok(statement)
    }

    /// Load generator output from CSV; already-issued statements are skipped
    pub fn import_csv(&self, csv_path: &Path) -> anyhow::Result<usize> {
        let mut rdr =
            csv::Reader::from_path(csv_path).context("Failed to open statement CSV")?;

        let mut inserted = 0;
        let mut duplicates = 0;

        for result in rdr.deserialize() {
            let new: NewStatement = result.context("Failed to deserialize statement")?;
            match self.record(new) {
                Ok(_) => inserted += 1,
                Err(CoreError::Conflict(_)) => duplicates += 1,
                Err(e) => return Err(e).context("Failed to record statement"),
            }
        }

        info!(inserted, duplicates, "statement import finished");
        Ok(inserted)
    }

    pub fn view(&self, viewer_id: &str, statement_id: &str) -> CoreResult<Statement> {
        self.audited_access(viewer_id, statement_id, "viewed")
    }

    pub fn download(&self, viewer_id: &str, statement_id: &str) -> CoreResult<DocumentRef> {
        Ok(self
            .audited_access(viewer_id, statement_id, "downloaded")?
            .document_ref)
    }

    fn audited_access(&self, viewer_id: &str, statement_id: &str, what: &str) -> CoreResult<Statement> {
        self.db.transaction(|tx| {
            let viewer = load_user(tx, viewer_id)?;
            let statement = load_statement(tx, statement_id)?;
            authorize(tx, &viewer, &statement)?;

            audit::append(
                tx,
                &NewLogEntry::new(AuditAction::View, what)
                    .subject(statement_id)
                    .actor(viewer.user_id.as_str()),
            )?;
            Ok(statement)
        })
    }

    /// Statements of the viewer's linked accounts dated within `from..=to`
    pub fn search_by_date(
        &self,
        viewer_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> CoreResult<Vec<Statement>> {
        if from > to {
            return Err(CoreError::validation("from", "must not be after `to`"));
        }

        self.db.with_conn(|conn| {
            let viewer = load_user(conn, viewer_id)?;
            viewer.ensure_active()?;
            let mut stmt = conn.prepare(
                "SELECT s.statement_id, s.account_number, s.statement_date, s.document_ref,
                        s.statement_type, s.issued_at
                 FROM statements s
                 JOIN accounts a ON a.account_number = s.account_number
                 WHERE a.linked = 1 AND a.linked_user = ?1
                   AND s.statement_date >= ?2 AND s.statement_date <= ?3
                 ORDER BY s.statement_date ASC, s.statement_id ASC",
            )?;
            let statements = stmt
                .query_map(
                    params![
                        viewer.user_id,
                        from.format("%Y-%m-%d").to_string(),
                        to.format("%Y-%m-%d").to_string(),
                    ],
                    row_to_statement,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(statements)
        })
    }
}
