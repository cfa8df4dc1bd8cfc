// 🧩 Service wiring
//
// Builds every store and service over one shared database handle.

use crate::audit::AuditLogger;
use crate::config::CoreConfig;
use crate::db::Database;
use crate::entities::account::AccountStore;
use crate::entities::notification::{Notification, NotificationStore, NotificationType};
use crate::entities::statement::{NewStatement, Statement, StatementStore};
use crate::entities::user::UserStore;
use crate::error::CoreResult;
use crate::linking::LinkingService;
use crate::notify::{NotificationDispatcher, NotificationTransport};
use crate::profile::ProfileService;
use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// A recorded statement and the availability notice sent to its holder
#[derive(Debug, Clone, Serialize)]
pub struct IssuedStatement {
    pub statement: Statement,
    /// `None` when the account has no linked holder
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<Notification>,
}

#[derive(Clone)]
pub struct CoreServices {
    pub db: Database,
    pub accounts: AccountStore,
    pub users: UserStore,
    pub statements: StatementStore,
    pub audit: AuditLogger,
    pub dispatcher: NotificationDispatcher,
    pub linking: LinkingService,
    pub profile: ProfileService,
}

impl CoreServices {
    pub fn new(db: Database, config: &CoreConfig, transport: Arc<dyn NotificationTransport>) -> Self {
        let accounts = AccountStore::new(db.clone(), config.verification_ttl());
        let users = UserStore::new(db.clone(), config.min_password_length);
        let statements = StatementStore::new(db.clone());
        let audit = AuditLogger::new(db.clone()).with_page_size(config.audit_page_size);
        let dispatcher = NotificationDispatcher::new(
            NotificationStore::new(db.clone()),
            users.clone(),
            transport,
            config.notification_timeout(),
        );
        let linking = LinkingService::new(
            accounts.clone(),
            users.clone(),
            dispatcher.clone(),
            audit.clone(),
        );
        let profile = ProfileService::new(users.clone(), dispatcher.clone());

        CoreServices {
            db,
            accounts,
            users,
            statements,
            audit,
            dispatcher,
            linking,
            profile,
        }
    }

    /// Record a statement from the generator and notify the linked holder.
    ///
    /// `StatementAvailable` is informational, so holders who opted out get a
    /// suppressed record instead of a delivery.
    pub async fn issue_statement(&self, new: NewStatement) -> CoreResult<IssuedStatement> {
        let statement = self.statements.record(new)?;

        let holder = self
            .accounts
            .get(&statement.account_number)?
            .filter(|account| account.linked)
            .and_then(|account| account.linked_user);

        let notification = match holder {
            Some(user_id) => match self
                .dispatcher
                .send(&user_id, NotificationType::StatementAvailable)
                .await
            {
                Ok(notification) => Some(notification),
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "statement notice not recorded");
                    None
                }
            },
            None => None,
        };

        Ok(IssuedStatement {
            statement,
            notification,
        })
    }

    /// Load the seed CSVs named in the config, if any
    pub fn seed(&self, config: &CoreConfig) -> anyhow::Result<()> {
        if let Some(path) = &config.seed_accounts_csv {
            let count = self
                .accounts
                .import_csv(path)
                .with_context(|| format!("Failed to seed accounts from {}", path.display()))?;
            info!(count, path = %path.display(), "accounts seeded");
        }
        if let Some(path) = &config.seed_statements_csv {
            let count = self
                .statements
                .import_csv(path)
                .with_context(|| format!("Failed to seed statements from {}", path.display()))?;
            info!(count, path = %path.display(), "statements seeded");
        }
        Ok(())
    }
}
