// Entity Models
// "Identity persists, values change"
//
// Each entity has:
// - Stable identity (account number, UUID or issuer id) that NEVER changes
// - A store that exclusively owns its rows
// - State changes committed together with their audit entry

pub mod account;
pub mod notification;
pub mod statement;
pub mod user;

pub use account::{Account, AccountStore, SsnDigest, SsnFragment};
pub use notification::{DeliveryStatus, Notification, NotificationStore, NotificationType};
pub use statement::{DocumentRef, NewStatement, Statement, StatementStore, StatementType};
pub use user::{ClientAdmin, DeliveryPreference, EndUser, NewUser, Role, User, UserStore};
