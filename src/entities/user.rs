// 👤 User Entity - platform user composed of role capabilities
//
// A user is not an EndUser *and* a ClientAdmin by inheritance. It holds an
// EndUser capability always and a ClientAdmin capability only when created
// with the admin role. ClientAdmin cannot be constructed outside this crate,
// so holding a `&ClientAdmin` proves the caller is an admin.
//
// Users are deactivated, never purged.

use crate::db::{format_timestamp, parse_timestamp, unknown_value, Database};
use crate::error::{is_constraint_violation, CoreError, CoreResult};
use crate::password::{hash_password, is_strong_password, is_valid_email, CredentialHash};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const MAX_USERNAME_LEN: usize = 64;

// ============================================================================
// ROLE & CAPABILITIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    EndUser,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::EndUser => "end_user",
            Role::Admin => "admin",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "end_user" => Some(Role::EndUser),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPreference {
    #[default]
    OptedIn,
    OptedOut,
}

impl DeliveryPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryPreference::OptedIn => "opted_in",
            DeliveryPreference::OptedOut => "opted_out",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "opted_in" => Some(DeliveryPreference::OptedIn),
            "opted_out" => Some(DeliveryPreference::OptedOut),
            _ => None,
        }
    }
}

/// Capabilities every user has
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndUser {
    pub delivery_preference: DeliveryPreference,
}

impl EndUser {
    /// Informational notifications respect the opt-out; security ones do not
    pub fn accepts_informational(&self) -> bool {
        self.delivery_preference == DeliveryPreference::OptedIn
    }
}

/// Administrative capability, only handed out for `Role::Admin`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientAdmin {
    admin_id: String,
}

impl ClientAdmin {
    pub fn admin_id(&self) -> &str {
        &self.admin_id
    }
}

// ============================================================================
// USER ENTITY
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub user_id: String,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    credential_hash: CredentialHash,
    pub role: Role,
    active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub end_user: EndUser,
    #[serde(skip_serializing_if = "Option::is_none")]
    admin: Option<ClientAdmin>,
}

impl User {
    #[allow(clippy::too_many_arguments)]
    fn compose(
        user_id: String,
        username: String,
        email: String,
        credential_hash: CredentialHash,
        role: Role,
        delivery_preference: DeliveryPreference,
        active: bool,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let admin = match role {
            Role::Admin => Some(ClientAdmin {
                admin_id: user_id.clone(),
            }),
            Role::EndUser => None,
        };

        User {
            user_id,
            username,
            email,
            credential_hash,
            role,
            active,
            created_at,
            updated_at,
            end_user: EndUser {
                delivery_preference,
            },
            admin,
        }
    }

    /// Borrow the admin capability or fail with PermissionDenied
    pub fn admin(&self) -> CoreResult<&ClientAdmin> {
        self.admin
            .as_ref()
            .ok_or_else(|| CoreError::permission_denied("administrative capability required"))
    }

    pub fn is_admin(&self) -> bool {
        self.admin.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn ensure_active(&self) -> CoreResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(CoreError::permission_denied(format!(
                "user {} is deactivated",
                self.user_id
            )))
        }
    }

    pub fn credential_hash(&self) -> &CredentialHash {
        &self.credential_hash
    }
}

/// Registration input; the password is hashed before storage
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub role: Role,
}

const USER_COLUMNS: &str = "user_id, username, email, credential_hash, role, \
                            delivery_preference, active, created_at, updated_at";

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    let role_str: String = row.get(4)?;
    let pref_str: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(User::compose(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        CredentialHash::from_stored(row.get(3)?),
        Role::parse(&role_str).ok_or_else(|| unknown_value(4, "role", &role_str))?,
        DeliveryPreference::parse(&pref_str)
            .ok_or_else(|| unknown_value(5, "delivery preference", &pref_str))?,
        row.get(6)?,
        parse_timestamp(7, &created_at)?,
        parse_timestamp(8, &updated_at)?,
    ))
}

/// Current row for `user_id`; callers inside a transaction see its view
pub(crate) fn load_user(conn: &Connection, user_id: &str) -> CoreResult<User> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE user_id = ?1", USER_COLUMNS),
        [user_id],
        row_to_user,
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found("user", user_id))
}

fn validate_username(username: &str) -> CoreResult<()> {
    if username.is_empty() {
        return Err(CoreError::validation("username", "must not be empty"));
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(CoreError::validation(
            "username",
            format!("must be at most {} characters", MAX_USERNAME_LEN),
        ));
    }
    if username.chars().any(char::is_whitespace) {
        return Err(CoreError::validation("username", "must not contain whitespace"));
    }
    Ok(())
}

// ============================================================================
// USER STORE
// ============================================================================

#[derive(Clone)]
pub struct UserStore {
    db: Database,
    min_password_length: usize,
}

impl UserStore {
    pub fn new(db: Database, min_password_length: usize) -> Self {
        UserStore {
            db,
            min_password_length,
        }
    }

    pub fn register(&self, new_user: NewUser) -> CoreResult<User> {
        validate_username(&new_user.username)?;
        if !is_valid_email(&new_user.email) {
            return Err(CoreError::validation("email", "not a valid email address"));
        }
        if !is_strong_password(&new_user.password, self.min_password_length) {
            return Err(CoreError::validation(
                "password",
                format!(
                    "must be at least {} characters with one uppercase letter and one digit",
                    self.min_password_length
                ),
            ));
        }

        let now = Utc::now();
        let user = User::compose(
            uuid::Uuid::new_v4().to_string(),
            new_user.username,
            new_user.email,
            hash_password(&new_user.password)?,
            new_user.role,
            DeliveryPreference::OptedIn,
            true,
            now,
            now,
        );

        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO users ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    USER_COLUMNS
                ),
                params![
                    user.user_id,
                    user.username,
                    user.email,
                    user.credential_hash.as_str(),
                    user.role.as_str(),
                    user.end_user.delivery_preference.as_str(),
                    user.active,
                    format_timestamp(&user.created_at),
                    format_timestamp(&user.updated_at),
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    CoreError::Conflict(format!("username {} is taken", user.username))
                } else {
                    e.into()
                }
            })
        })?;

        info!(user_id = %user.user_id, role = user.role.as_str(), "user registered");
        Ok(user)
    }

    pub fn get(&self, user_id: &str) -> CoreResult<User> {
        self.db.with_conn(|conn| load_user(conn, user_id))
    }

    pub fn find_by_username(&self, username: &str) -> CoreResult<Option<User>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
                    [username],
                    row_to_user,
                )
                .optional()?)
        })
    }

    /// Returns `false` and changes nothing when the address is invalid
    pub fn update_email(&self, user_id: &str, new_email: &str) -> CoreResult<bool> {
        if !is_valid_email(new_email) {
            debug!(user_id, "email update rejected");
            return Ok(false);
        }
        self.update_column(user_id, "email", new_email)?;
        Ok(true)
    }

    /// Replace the credential. Returns `false` and changes nothing when the
    /// password is weak or equal to the current one.
    pub fn reset_password(&self, user_id: &str, new_password: &str) -> CoreResult<bool> {
        let user = self.get(user_id)?;

        if !is_strong_password(new_password, self.min_password_length) {
            debug!(user_id, "password reset rejected: weak password");
            return Ok(false);
        }
        if user.credential_hash.verify(new_password)? {
            debug!(user_id, "password reset rejected: unchanged password");
            return Ok(false);
        }

        let hash = hash_password(new_password)?;
        self.update_column(user_id, "credential_hash", hash.as_str())?;
        info!(user_id, "password reset");
        Ok(true)
    }

    pub fn opt_in(&self, user_id: &str) -> CoreResult<()> {
        self.update_column(
            user_id,
            "delivery_preference",
            DeliveryPreference::OptedIn.as_str(),
        )
    }

    pub fn opt_out(&self, user_id: &str) -> CoreResult<()> {
        self.update_column(
            user_id,
            "delivery_preference",
            DeliveryPreference::OptedOut.as_str(),
        )
    }

    /// Logical delete; requires the administrative capability
    pub fn deactivate(&self, admin: &ClientAdmin, user_id: &str) -> CoreResult<()> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE users SET active = 0, updated_at = ?1 WHERE user_id = ?2",
                params![format_timestamp(&Utc::now()), user_id],
            )?)
        })?;
        if changed == 0 {
            return Err(CoreError::not_found("user", user_id));
        }
        info!(user_id, admin_id = admin.admin_id(), "user deactivated");
        Ok(())
    }

    // `column` is always one of the literals above, never caller input
    fn update_column(&self, user_id: &str, column: &str, value: &str) -> CoreResult<()> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                &format!(
                    "UPDATE users SET {} = ?1, updated_at = ?2 WHERE user_id = ?3",
                    column
                ),
                params![value, format_timestamp(&Utc::now()), user_id],
            )?)
        })?;
        if changed == 0 {
            return Err(CoreError::not_found("user", user_id));
        }
        Ok(())
    }
}
