// Doc Inc Core - Library
// Account linking, audit trail, notifications and statements.
// Exposes all modules for use in the API server and tests

pub mod app;
pub mod audit;          // Append-only audit trail
pub mod config;
pub mod db;
pub mod entities;       // Account, User, Notification, Statement
pub mod error;
pub mod linking;        // verify → link orchestration
pub mod notify;         // Transport + dispatcher
pub mod password;
pub mod profile;

// Re-export commonly used types
pub use app::{CoreServices, IssuedStatement};
pub use audit::{AuditAction, AuditFilter, AuditLogger, AuditQuery, LogEntry, NewLogEntry};
pub use config::CoreConfig;
pub use db::{setup_database, Database};
pub use entities::{
    Account, AccountStore,
    ClientAdmin, EndUser, NewUser, Role, User, UserStore,
    DeliveryStatus, Notification, NotificationStore, NotificationType,
    DocumentRef, NewStatement, Statement, StatementStore, StatementType,
};
pub use error::{CoreError, CoreResult};
pub use linking::{LinkOutcome, LinkState, LinkingService, UnlinkOutcome};
pub use notify::{
    DeliveryError, LogTransport, NotificationDispatcher, NotificationMessage,
    NotificationTransport,
};
pub use profile::ProfileService;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
