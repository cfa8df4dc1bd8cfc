// 🪪 Profile Service - credential and contact changes with confirmation
//
// A successful change sends the matching notification to the user. A rejected
// change sends nothing.

use crate::entities::notification::NotificationType;
use crate::entities::user::UserStore;
use crate::error::CoreResult;
use crate::notify::NotificationDispatcher;
use tracing::warn;

#[derive(Clone)]
pub struct ProfileService {
    users: UserStore,
    dispatcher: NotificationDispatcher,
}

impl ProfileService {
    pub fn new(users: UserStore, dispatcher: NotificationDispatcher) -> Self {
        ProfileService { users, dispatcher }
    }

    /// `false` for a weak or unchanged password
    pub async fn reset_password(&self, user_id: &str, new_password: &str) -> CoreResult<bool> {
        self.users.get(user_id)?.ensure_active()?;

        if !self.users.reset_password(user_id, new_password)? {
            return Ok(false);
        }
        self.confirm(user_id, NotificationType::PasswordReset).await;
        Ok(true)
    }

    /// `false` for an invalid address
    pub async fn update_email(&self, user_id: &str, new_email: &str) -> CoreResult<bool> {
        self.users.get(user_id)?.ensure_active()?;

        if !self.users.update_email(user_id, new_email)? {
            return Ok(false);
        }
        self.confirm(user_id, NotificationType::EmailChanged).await;
        Ok(true)
    }

    async fn confirm(&self, user_id: &str, kind: NotificationType) {
        if let Err(e) = self.dispatcher.send(user_id, kind).await {
            warn!(user_id, kind = kind.as_str(), error = %e, "confirmation not recorded");
        }
    }
}
