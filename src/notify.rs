// 📬 Notification dispatch
//
// A send records the notification first (with its SEND audit entry) and only
// then hands a message to the transport. Delivery is bounded by a timeout and
// its failure is recorded on the notification, never returned as an error.

use crate::entities::notification::{
    DeliveryStatus, Notification, NotificationStore, NotificationType,
};
use crate::entities::user::UserStore;
use crate::error::CoreResult;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Rendered message handed to a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationMessage {
    pub notification_id: String,
    pub user_id: String,
    /// Recipient email address
    pub to: String,
    pub notification_type: NotificationType,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn deliver(&self, message: &NotificationMessage) -> Result<(), DeliveryError>;
}

/// Writes messages to the tracing log instead of sending them
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn deliver(&self, message: &NotificationMessage) -> Result<(), DeliveryError> {
        info!(
            notification_id = %message.notification_id,
            user_id = %message.user_id,
            subject = %message.subject,
            "notification delivered to log transport"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    store: NotificationStore,
    users: UserStore,
    transport: Arc<dyn NotificationTransport>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        store: NotificationStore,
        users: UserStore,
        transport: Arc<dyn NotificationTransport>,
        timeout: Duration,
    ) -> Self {
        NotificationDispatcher {
            store,
            users,
            transport,
            timeout,
        }
    }

    /// Record and deliver a notification.
    ///
    /// Errors only when the user is unknown or storage fails; the delivery
    /// outcome is reported through `Notification::delivery`.
    pub async fn send(
        &self,
        user_id: &str,
        notification_type: NotificationType,
    ) -> CoreResult<Notification> {
        let user = self.users.get(user_id)?;
        let mut notification = self.store.create(user_id, notification_type)?;

        if notification_type.is_informational() && !user.end_user.accepts_informational() {
            self.store.record_delivery(
                &notification.notification_id,
                DeliveryStatus::Suppressed,
                None,
            )?;
            notification.delivery = DeliveryStatus::Suppressed;
            return Ok(notification);
        }

        let message = NotificationMessage {
            notification_id: notification.notification_id.clone(),
            user_id: user.user_id.clone(),
            to: user.email.clone(),
            notification_type,
            subject: notification_type.subject().to_string(),
            body: notification_type.body().to_string(),
        };

        let outcome = match tokio::time::timeout(self.timeout, self.transport.deliver(&message)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.timeout)),
        };

        match outcome {
            Ok(()) => {
                self.store.record_delivery(
                    &notification.notification_id,
                    DeliveryStatus::Delivered,
                    None,
                )?;
                notification.delivery = DeliveryStatus::Delivered;
            }
            Err(e) => {
                warn!(
                    notification_id = %notification.notification_id,
                    user_id,
                    error = %e,
                    "notification delivery failed"
                );
                let reason = e.to_string();
                self.store.record_delivery(
                    &notification.notification_id,
                    DeliveryStatus::Failed,
                    Some(&reason),
                )?;
                notification.delivery = DeliveryStatus::Failed;
                notification.delivery_error = Some(reason);
            }
        }

        Ok(notification)
    }

    pub fn mark_read(&self, notification_id: &str) -> CoreResult<bool> {
        self.store.mark_read(notification_id)
    }

    pub fn get(&self, notification_id: &str) -> CoreResult<Notification> {
        self.store.get(notification_id)
    }

    pub fn list_for_user(&self, user_id: &str) -> CoreResult<Vec<Notification>> {
        self.store.list_for_user(user_id)
    }
}
