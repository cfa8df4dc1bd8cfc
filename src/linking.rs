// 🔗 Linking Service - verify → link orchestration
//
// Per attempt:   UNVERIFIED → VERIFIED → LINKED     (success)
//                UNVERIFIED → REJECTED              (verify failed)
//                VERIFIED   → REJECTED              (link refused)
// Unlink is a separate single step: LINKED → UNVERIFIED.
//
// verify and link for one account run under that account's lock stripe, so
// two callers can never both observe VERIFIED. The lock is released before
// any notification is awaited.

use crate::audit::{AuditFilter, AuditLogger, AuditQuery, SYSTEM_ACTOR};
use crate::entities::account::{validate_account_number, Account, AccountStore};
use crate::entities::notification::{Notification, NotificationType};
use crate::entities::user::UserStore;
use crate::error::{CoreError, CoreResult};
use crate::notify::NotificationDispatcher;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Unverified,
    Verified,
    Linked,
    Rejected,
}

impl LinkState {
    /// Next state after a step that either succeeded or failed.
    /// Terminal states absorb every step.
    pub fn advance(self, step_succeeded: bool) -> LinkState {
        match (self, step_succeeded) {
            (LinkState::Unverified, true) => LinkState::Verified,
            (LinkState::Verified, true) => LinkState::Linked,
            (LinkState::Unverified, false) | (LinkState::Verified, false) => LinkState::Rejected,
            (terminal, _) => terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Linked | LinkState::Rejected)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkOutcome {
    pub account_number: String,
    pub state: LinkState,
    /// Present when a notification was recorded; its `delivery` tells
    /// whether the transport accepted it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<Notification>,
}

impl LinkOutcome {
    pub fn is_linked(&self) -> bool {
        self.state == LinkState::Linked
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnlinkOutcome {
    pub account_number: String,
    pub unlinked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<Notification>,
}

const LOCK_STRIPES: usize = 64;

/// Fixed set of mutexes; an account number always hashes to the same one
struct AccountLocks {
    stripes: Vec<Mutex<()>>,
}

impl Default for AccountLocks {
    fn default() -> Self {
        AccountLocks {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }
}

impl AccountLocks {
    fn stripe_index(&self, account_number: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        account_number.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    fn lock(&self, account_number: &str) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_index(account_number)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

enum Attempt {
    /// Verified, but already linked to this user; the verification is dropped
    Unchanged,
    Finished(LinkState),
}

#[derive(Clone)]
pub struct LinkingService {
    accounts: AccountStore,
    users: UserStore,
    dispatcher: NotificationDispatcher,
    audit: AuditLogger,
    locks: Arc<AccountLocks>,
}

impl LinkingService {
    pub fn new(
        accounts: AccountStore,
        users: UserStore,
        dispatcher: NotificationDispatcher,
        audit: AuditLogger,
    ) -> Self {
        LinkingService {
            accounts,
            users,
            dispatcher,
            audit,
            locks: Arc::new(AccountLocks::default()),
        }
    }

    /// Verify the SSN fragment and link the account to an active user.
    ///
    /// A failed verify or a missing verification ends in `Rejected`; an
    /// account held by another user is a `Conflict`. On success the user is
    /// sent `AccountLinked`, whose failure never undoes the link.
    pub async fn link_account(
        &self,
        user_id: &str,
        account_number: &str,
        last4_ssn: &str,
    ) -> CoreResult<LinkOutcome> {
        let user = self.users.get(user_id)?;
        user.ensure_active()?;

        let attempt = self.verify_and_link(user_id, account_number, last4_ssn)?;

        let (state, notification) = match attempt {
            Attempt::Unchanged => (LinkState::Linked, None),
            Attempt::Finished(LinkState::Linked) => {
                info!(account = %Account::mask_account_number(account_number), user_id, "link completed");
                let notification = self.notify(user_id, NotificationType::AccountLinked).await;
                (LinkState::Linked, notification)
            }
            Attempt::Finished(state) => (state, None),
        };

        Ok(LinkOutcome {
            account_number: account_number.to_string(),
            state,
            notification,
        })
    }

    fn verify_and_link(
        &self,
        user_id: &str,
        account_number: &str,
        last4_ssn: &str,
    ) -> CoreResult<Attempt> {
        validate_account_number(account_number)?;
        let _guard = self.locks.lock(account_number);

        let mut state = LinkState::Unverified;
        state = state.advance(self.accounts.verify_as(user_id, account_number, last4_ssn)?);
        if state != LinkState::Verified {
            return Ok(Attempt::Finished(state));
        }

        let already_held = self
            .accounts
            .get(account_number)?
            .map(|account| account.is_linked_to(user_id))
            .unwrap_or(false);
        if already_held {
            self.accounts.clear_verification(account_number)?;
            return Ok(Attempt::Unchanged);
        }

        state = state.advance(self.accounts.link(user_id, account_number)?);
        Ok(Attempt::Finished(state))
    }

    /// Unlink an account and tell the previous holder.
    ///
    /// `actor` is recorded in the audit trail; `None` means the system.
    pub async fn unlink_account(
        &self,
        account_number: &str,
        actor: Option<&str>,
    ) -> CoreResult<UnlinkOutcome> {
        validate_account_number(account_number)?;
        let (unlinked, previous_user) = {
            let _guard = self.locks.lock(account_number);

            let account = self
                .accounts
                .get(account_number)?
                .ok_or_else(|| CoreError::not_found("account", account_number))?;
            let unlinked = self
                .accounts
                .unlink_as(actor.unwrap_or(SYSTEM_ACTOR), account_number)?;
            (unlinked, account.linked_user)
        };

        let notification = match (unlinked, previous_user) {
            (true, Some(user_id)) => self.notify(&user_id, NotificationType::AccountUnlinked).await,
            _ => None,
        };

        Ok(UnlinkOutcome {
            account_number: account_number.to_string(),
            unlinked,
            notification,
        })
    }

    /// Full audit trail of one account, oldest first
    pub fn history(&self, account_number: &str) -> AuditQuery {
        self.audit.query(AuditFilter::new().account(account_number))
    }

    async fn notify(&self, user_id: &str, kind: NotificationType) -> Option<Notification> {
        match self.dispatcher.send(user_id, kind).await {
            Ok(notification) => Some(notification),
            Err(e) => {
                warn!(user_id, kind = kind.as_str(), error = %e, "could not record notification");
                None
            }
        }
    }
}
