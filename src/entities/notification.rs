// 🔔 Notification Entity
//
// Created on a send event, mutated only by mark-read (false → true, never
// back) and by recording the delivery outcome.

use crate::audit::{self, AuditAction, NewLogEntry};
use crate::db::{format_timestamp, parse_timestamp, unknown_value, Database};
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

// ============================================================================
// NOTIFICATION TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    AccountLinked,
    AccountUnlinked,
    PasswordReset,
    EmailChanged,
    StatementAvailable,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::AccountLinked => "account_linked",
            NotificationType::AccountUnlinked => "account_unlinked",
            NotificationType::PasswordReset => "password_reset",
            NotificationType::EmailChanged => "email_changed",
            NotificationType::StatementAvailable => "statement_available",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "account_linked" => Some(NotificationType::AccountLinked),
            "account_unlinked" => Some(NotificationType::AccountUnlinked),
            "password_reset" => Some(NotificationType::PasswordReset),
            "email_changed" => Some(NotificationType::EmailChanged),
            "statement_available" => Some(NotificationType::StatementAvailable),
            _ => None,
        }
    }

    /// Informational types honour the user's opt-out; the rest are security
    /// relevant and always delivered
    pub fn is_informational(&self) -> bool {
        matches!(self, NotificationType::StatementAvailable)
    }

    pub fn subject(&self) -> &'static str {
        match self {
            NotificationType::AccountLinked => "Bank Account Linked",
            NotificationType::AccountUnlinked => "Bank Account Unlinked",
            NotificationType::PasswordReset => "Password Reset Confirmation",
            NotificationType::EmailChanged => "Email Address Updated",
            NotificationType::StatementAvailable => "New Statement Available",
        }
    }

    pub fn body(&self) -> &'static str {
        match self {
            NotificationType::AccountLinked => {
                "A bank account has been linked to your Doc Inc profile."
            }
            NotificationType::AccountUnlinked => {
                "A bank account has been unlinked from your Doc Inc profile."
            }
            NotificationType::PasswordReset => {
                "Your password for Doc Inc has been successfully reset."
            }
            NotificationType::EmailChanged => {
                "The email address on your Doc Inc profile has been changed."
            }
            NotificationType::StatementAvailable => {
                "A new statement is available in your Doc Inc account."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Recorded, transport not yet attempted
    Pending,
    Delivered,
    /// Transport error or timeout; see `delivery_error`
    Failed,
    /// User opted out of this informational type
    Suppressed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Suppressed => "suppressed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(DeliveryStatus::Pending),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            "suppressed" => Some(DeliveryStatus::Suppressed),
            _ => None,
        }
    }
}

// ============================================================================
// NOTIFICATION ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub notification_id: String,
    pub user_id: String,
    pub notification_type: NotificationType,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
    pub delivery: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_error: Option<String>,
}

const NOTIFICATION_COLUMNS: &str =
    "notification_id, user_id, notification_type, sent_at, read, delivery_status, delivery_error";

fn row_to_notification(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let type_str: String = row.get(2)?;
    let sent_at: String = row.get(3)?;
    let status_str: String = row.get(5)?;

    Ok(Notification {
        notification_id: row.get(0)?,
        user_id: row.get(1)?,
        notification_type: NotificationType::parse(&type_str)
            .ok_or_else(|| unknown_value(2, "notification type", &type_str))?,
        sent_at: parse_timestamp(3, &sent_at)?,
        read: row.get(4)?,
        delivery: DeliveryStatus::parse(&status_str)
            .ok_or_else(|| unknown_value(5, "delivery status", &status_str))?,
        delivery_error: row.get(6)?,
    })
}

// ============================================================================
// NOTIFICATION STORE
// ============================================================================

#[derive(Clone)]
pub struct NotificationStore {
    db: Database,
}

impl NotificationStore {
    pub fn new(db: Database) -> Self {
        NotificationStore { db }
    }

    /// Record a pending notification together with its SEND audit entry
    pub fn create(&self, user_id: &str, notification_type: NotificationType) -> CoreResult<Notification> {
        let notification = Notification {
            notification_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            notification_type,
            sent_at: Utc::now(),
            read: false,
            delivery: DeliveryStatus::Pending,
            delivery_error: None,
        };

        self.db.transaction(|tx| {
            tx.execute(
                &format!(
                    "INSERT INTO notifications ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    NOTIFICATION_COLUMNS
                ),
                params![
                    notification.notification_id,
                    notification.user_id,
                    notification.notification_type.as_str(),
                    format_timestamp(&notification.sent_at),
                    notification.read,
                    notification.delivery.as_str(),
                    notification.delivery_error,
                ],
            )?;

            audit::append(
                tx,
                &NewLogEntry::new(
                    AuditAction::Send,
                    format!("{} to user {}", notification_type.as_str(), user_id),
                )
                .subject(notification.notification_id.as_str()),
            )?;
            Ok(())
        })?;

        Ok(notification)
    }

    pub fn record_delivery(
        &self,
        notification_id: &str,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> CoreResult<()> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE notifications SET delivery_status = ?1, delivery_error = ?2
                 WHERE notification_id = ?3",
                params![status.as_str(), error, notification_id],
            )?)
        })?;
        if changed == 0 {
            return Err(CoreError::not_found("notification", notification_id));
        }
        Ok(())
    }

    /// Idempotent; NotFound for unknown ids
    pub fn mark_read(&self, notification_id: &str) -> CoreResult<bool> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE notifications SET read = 1 WHERE notification_id = ?1",
                [notification_id],
            )?)
        })?;
        if changed == 0 {
            return Err(CoreError::not_found("notification", notification_id));
        }
        Ok(true)
    }

    pub fn get(&self, notification_id: &str) -> CoreResult<Notification> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM notifications WHERE notification_id = ?1",
                    NOTIFICATION_COLUMNS
                ),
                [notification_id],
                row_to_notification,
            )
            .optional()?
            .ok_or_else(|| CoreError::not_found("notification", notification_id))
        })
    }

    /// Newest first
    pub fn list_for_user(&self, user_id: &str) -> CoreResult<Vec<Notification>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM notifications WHERE user_id = ?1 ORDER BY sent_at DESC, rowid DESC",
                NOTIFICATION_COLUMNS
            ))?;
            let notifications = stmt
                .query_map([user_id], row_to_notification)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(notifications)
        })
    }
}
