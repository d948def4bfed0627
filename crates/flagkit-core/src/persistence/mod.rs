//! SQLite persistence for the flagging ledger and its counters

mod counts;
pub mod schema;
mod sqlite_store;

pub use schema::{Schema, SCHEMA_VERSION};
pub use sqlite_store::SqliteLedgerStore;
