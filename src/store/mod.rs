//! SQLite-backed stores shared by every correlation key.
//!
//! All tables live in one database file (`<workspace>/state/duocast.db`);
//! each store opens its own short-lived connection per call.

pub(crate) mod db;
pub mod records;
pub mod subscriptions;

pub use db::state_db_path;
pub use records::{MessageRecordStore, SqliteMessageRecordStore};
pub use subscriptions::{SqliteSubscriptionStore, SubscriptionStore};
