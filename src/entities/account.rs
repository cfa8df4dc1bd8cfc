// 💳 Account Entity - linkable bank account with verification gate
//
// "Account number is IDENTITY (never changes), linked state is a VALUE"
//
// - Account number is the primary key and never changes
// - The last-4 SSN fragment is stored only as SHA-256("account_number:last4");
//   this keeps it out of serialized output but is not brute-force resistant
//   (10^4 candidates per account), so the table stays server-side
// - Linking requires a fresh, unconsumed verification
// - Accounts are never deleted; unlink is a soft state change
// - Every linked-state change commits together with its audit entry

use crate::audit::{self, AuditAction, NewLogEntry, SYSTEM_ACTOR};
use crate::db::{format_timestamp, parse_timestamp, Database};
use crate::error::{is_constraint_violation, CoreError, CoreResult};
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Placeholder written wherever the SSN fragment would be serialized
pub const REDACTED: &str = "****";

const MAX_ACCOUNT_NUMBER_LEN: usize = 34;

// ============================================================================
// SSN FRAGMENT (caller input) & DIGEST (stored form)
// ============================================================================

/// Last four digits of an SSN as supplied by a caller.
///
/// Has no `Serialize` impl and a redacted `Debug`, so it cannot leak through
/// logs or API responses.
#[derive(Clone, PartialEq, Eq)]
pub struct SsnFragment(String);

impl SsnFragment {
    pub fn parse(raw: &str) -> CoreResult<Self> {
        if raw.len() != 4 || !raw.chars().all(|c| c.is_ascii_digit()) {
            return Err(CoreError::validation(
                "last4_ssn",
                "must be exactly four digits",
            ));
        }
        Ok(SsnFragment(raw.to_string()))
    }
}

impl fmt::Debug for SsnFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SsnFragment({})", REDACTED)
    }
}

/// Stored form of the fragment: SHA-256 over `account_number:last4`.
///
/// This is the single serialization boundary for the fragment; every
/// serialized `Account` goes through the `Serialize` impl below.
#[derive(Clone, PartialEq, Eq)]
pub struct SsnDigest(String);

impl SsnDigest {
    pub fn compute(account_number: &str, fragment: &SsnFragment) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}", account_number, fragment.0));
        SsnDigest(format!("{:x}", hasher.finalize()))
    }

    /// Constant-time comparison
    pub fn matches(&self, other: &SsnDigest) -> bool {
        let a = self.0.as_bytes();
        let b = other.0.as_bytes();
        a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }

    fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SsnDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SsnDigest({})", REDACTED)
    }
}

impl Serialize for SsnDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

// ============================================================================
// ACCOUNT ENTITY
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    /// Opaque identifier, unique and immutable
    pub account_number: String,

    /// Always serialized as `****`
    #[serde(rename = "last4_ssn")]
    ssn_digest: SsnDigest,

    pub linked: bool,

    /// Non-owning reference to the user the account is linked to
    pub linked_user: Option<String>,

    /// Set by a successful verify, consumed by link
    pub verified_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Mask account number (show only last 4 characters)
    ///
    /// Example: "1234567890" → "*7890"
    pub fn mask_account_number(full_number: &str) -> String {
        let chars: Vec<char> = full_number.chars().collect();
        if chars.len() <= 4 {
            return full_number.to_string();
        }
        let last4: String = chars[chars.len() - 4..].iter().collect();
        format!("*{}", last4)
    }

    pub fn masked_number(&self) -> String {
        Self::mask_account_number(&self.account_number)
    }

    pub fn is_linked_to(&self, user_id: &str) -> bool {
        self.linked && self.linked_user.as_deref() == Some(user_id)
    }

    /// True when a verification exists and is younger than `ttl`
    pub fn has_fresh_verification(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.verified_at
            .map(|at| now - at <= ttl)
            .unwrap_or(false)
    }
}

/// Reject empty, oversized or non-alphanumeric account numbers
pub fn validate_account_number(raw: &str) -> CoreResult<()> {
    if raw.is_empty() {
        return Err(CoreError::validation("account_number", "must not be empty"));
    }
    if raw.len() > MAX_ACCOUNT_NUMBER_LEN {
        return Err(CoreError::validation(
            "account_number",
            format!("must be at most {} characters", MAX_ACCOUNT_NUMBER_LEN),
        ));
    }
    if !raw.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(CoreError::validation(
            "account_number",
            "must contain only letters and digits",
        ));
    }
    Ok(())
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    let verified_at: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;

    Ok(Account {
        account_number: row.get(0)?,
        ssn_digest: SsnDigest(row.get(1)?),
        linked: row.get(2)?,
        linked_user: row.get(3)?,
        verified_at: verified_at
            .map(|s| parse_timestamp(4, &s))
            .transpose()?,
        created_at: parse_timestamp(5, &created_at)?,
    })
}

const ACCOUNT_COLUMNS: &str =
    "account_number, ssn_digest, linked, linked_user, verified_at, created_at";

fn load_account(conn: &Connection, account_number: &str) -> CoreResult<Option<Account>> {
    let sql = format!(
        "SELECT {} FROM accounts WHERE account_number = ?1",
        ACCOUNT_COLUMNS
    );
    Ok(conn
        .query_row(&sql, [account_number], row_to_account)
        .optional()?)
}

/// Row shape of the account seed CSV
#[derive(Debug, Deserialize)]
struct AccountRecord {
    account_number: String,
    last4_ssn: String,
}

enum LinkAttempt {
    Linked,
    AlreadyLinked,
    NotVerified,
    Conflict,
}

// ============================================================================
// ACCOUNT STORE
// ============================================================================

/// Exclusive owner of account records
#[derive(Clone)]
pub struct AccountStore {
    db: Database,
    verification_ttl: Duration,
}

impl AccountStore {
    pub fn new(db: Database, verification_ttl: Duration) -> Self {
        AccountStore {
            db,
            verification_ttl,
        }
    }

    /// Create an account record (registration by the bank side)
    pub fn register(&self, account_number: &str, last4_ssn: &str) -> CoreResult<Account> {
        validate_account_number(account_number)?;
        let fragment = SsnFragment::parse(last4_ssn)?;

        let account = Account {
            account_number: account_number.to_string(),
            ssn_digest: SsnDigest::compute(account_number, &fragment),
            linked: false,
            linked_user: None,
            verified_at: None,
            created_at: Utc::now(),
        };

        let result = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO accounts (account_number, ssn_digest, linked, created_at)
                 VALUES (?1, ?2, 0, ?3)",
                params![
                    account.account_number,
                    account.ssn_digest.as_str(),
                    format_timestamp(&account.created_at),
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    CoreError::Conflict(format!(
                        "account {} already registered",
                        account.masked_number()
                    ))
                } else {
                    e.into()
                }
            })
        });

        result?;
        debug!(account = %account.masked_number(), "account registered");
        Ok(account)
    }

    /// Bulk registration from CSV (`account_number,last4_ssn`); duplicates are skipped
    pub fn import_csv(&self, csv_path: &Path) -> anyhow::Result<usize> {
        let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open account CSV")?;

        let mut inserted = 0;
        let mut duplicates = 0;

        for result in rdr.deserialize() {
            let record: AccountRecord = result.context("Failed to deserialize account record")?;

            match self.register(&record.account_number, &record.last4_ssn) {
                Ok(_) => inserted += 1,
                Err(CoreError::Conflict(_)) => duplicates += 1,
                Err(e) => return Err(e).context("Failed to register account"),
            }
        }

        info!(inserted, duplicates, "account import finished");
        Ok(inserted)
    }

    pub fn get(&self, account_number: &str) -> CoreResult<Option<Account>> {
        self.db.with_conn(|conn| load_account(conn, account_number))
    }

    /// Accounts currently linked to a user
    pub fn linked_to(&self, user_id: &str) -> CoreResult<Vec<Account>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM accounts WHERE linked = 1 AND linked_user = ?1
                 ORDER BY account_number",
                ACCOUNT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let accounts = stmt
                .query_map([user_id], row_to_account)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(accounts)
        })
    }

    /// Check a caller-supplied fragment against the stored record.
    ///
    /// Unknown accounts and mismatches both return `false`. Every attempt
    /// writes exactly one VERIFY entry.
    pub fn verify(&self, account_number: &str, last4_ssn: &str) -> CoreResult<bool> {
        self.verify_as(SYSTEM_ACTOR, account_number, last4_ssn)
    }

    pub(crate) fn verify_as(
        &self,
        actor: &str,
        account_number: &str,
        last4_ssn: &str,
    ) -> CoreResult<bool> {
        validate_account_number(account_number)?;
        let fragment = SsnFragment::parse(last4_ssn)?;
        let supplied = SsnDigest::compute(account_number, &fragment);

        let matched = self.db.transaction(|tx| {
            let stored = load_account(tx, account_number)?;
            let matched = stored
                .as_ref()
                .map(|a| a.ssn_digest.matches(&supplied))
                .unwrap_or(false);

            let verified_at = matched.then(|| format_timestamp(&Utc::now()));
            tx.execute(
                "UPDATE accounts SET verified_at = ?1 WHERE account_number = ?2",
                params![verified_at, account_number],
            )?;

            audit::append(
                tx,
                &NewLogEntry::new(AuditAction::Verify, if matched { "verified" } else { "failed" })
                    .subject(account_number)
                    .actor(actor),
            )?;

            Ok(matched)
        })?;

        if matched {
            debug!(account = %Account::mask_account_number(account_number), "verification succeeded");
        } else {
            warn!(account = %Account::mask_account_number(account_number), "verification failed");
        }
        Ok(matched)
    }

    /// Link an account to a user.
    ///
    /// Requires a fresh verification, which the link consumes. Linking an
    /// account already linked to the same user is a no-op returning `true`;
    /// linking one held by another user is a `Conflict`.
    pub fn link(&self, user_id: &str, account_number: &str) -> CoreResult<bool> {
        validate_account_number(account_number)?;
        if user_id.trim().is_empty() {
            return Err(CoreError::validation("user_id", "must not be empty"));
        }

        let ttl = self.verification_ttl;
        let attempt = self.db.transaction(|tx| {
            let account = load_account(tx, account_number)?
                .ok_or_else(|| CoreError::not_found("account", account_number))?;

            if account.linked {
                if account.is_linked_to(user_id) {
                    return Ok(LinkAttempt::AlreadyLinked);
                }
                audit::append(
                    tx,
                    &NewLogEntry::new(AuditAction::Link, "failed: linked to another user")
                        .subject(account_number)
                        .actor(user_id),
                )?;
                return Ok(LinkAttempt::Conflict);
            }

            if !account.has_fresh_verification(ttl, Utc::now()) {
                audit::append(
                    tx,
                    &NewLogEntry::new(AuditAction::Link, "failed: not verified")
                        .subject(account_number)
                        .actor(user_id),
                )?;
                return Ok(LinkAttempt::NotVerified);
            }

            tx.execute(
                "UPDATE accounts SET linked = 1, linked_user = ?1, verified_at = NULL
                 WHERE account_number = ?2",
                params![user_id, account_number],
            )?;
            audit::append(
                tx,
                &NewLogEntry::new(AuditAction::Link, "linked")
                    .subject(account_number)
                    .actor(user_id),
            )?;

            Ok(LinkAttempt::Linked)
        })?;

        let masked = Account::mask_account_number(account_number);
        match attempt {
            LinkAttempt::Linked => {
                info!(account = %masked, user_id, "account linked");
                Ok(true)
            }
            LinkAttempt::AlreadyLinked => Ok(true),
            LinkAttempt::NotVerified => {
                warn!(account = %masked, user_id, "link refused: no fresh verification");
                Ok(false)
            }
            LinkAttempt::Conflict => Err(CoreError::Conflict(format!(
                "account {} is linked to another user",
                masked
            ))),
        }
    }

    /// Drop a pending verification without linking
    pub(crate) fn clear_verification(&self, account_number: &str) -> CoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE accounts SET verified_at = NULL WHERE account_number = ?1",
                [account_number],
            )?;
            Ok(())
        })
    }

    /// Soft-unlink; returns `false` when the account is not linked
    pub fn unlink(&self, account_number: &str) -> CoreResult<bool> {
        self.unlink_as(SYSTEM_ACTOR, account_number)
    }

    pub(crate) fn unlink_as(&self, actor: &str, account_number: &str) -> CoreResult<bool> {
        validate_account_number(account_number)?;

        let unlinked = self.db.transaction(|tx| {
            let account = load_account(tx, account_number)?
                .ok_or_else(|| CoreError::not_found("account", account_number))?;

            if !account.linked {
                audit::append(
                    tx,
                    &NewLogEntry::new(AuditAction::Unlink, "failed: not linked")
                        .subject(account_number)
                        .actor(actor),
                )?;
                return Ok(false);
            }

            tx.execute(
                "UPDATE accounts SET linked = 0, linked_user = NULL, verified_at = NULL
                 WHERE account_number = ?1",
                [account_number],
            )?;
            audit::append(
                tx,
                &NewLogEntry::new(AuditAction::Unlink, "unlinked")
                    .subject(account_number)
                    .actor(actor),
            )?;
            Ok(true)
        })?;

        if unlinked {
            info!(account = %Account::mask_account_number(account_number), "account unlinked");
        }
        Ok(unlinked)
    }
}

// ============================================================================
// TESTS
// ============================================================================
