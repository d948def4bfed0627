//! Flagkit Core - flag definitions, the flagging ledger and its counters
//!
//! - **Definition / Registry**: administrator-defined flags (scope, texts, link type)
//! - **Ledger**: idempotent flag/unflag per (flag, target, owner), with admin deletes
//! - **Counter**: denormalized counts kept in the same atomic unit as the ledger rows
//! - **Access**: permission checks and the flag/unflag affordance a user should see
//! - **Cascade**: cleanup when a user, an entity or a flag is deleted
//! - **Persistence**: SQLite backend with a schema version table
//!
//! # Owners
//!
//! ```text
//! personal flag: (flag, target, user:<uid>)   one row per user
//! global flag:   (flag, target, global)       one row for everyone
//! ```

pub mod access;
pub mod cascade;
pub mod config;
pub mod counter;
pub mod definition;
pub mod error;
pub mod event;
pub mod flagging;
pub mod ledger;
pub mod link;
pub mod memory_store;
pub mod registry;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod persistence;

pub use access::{AccessGate, ActionState, FlagPermissions, PermissionCheck, PermissionTable, RenderedAction};
pub use cascade::{CascadeHandler, CascadeReport};
pub use config::{CounterConfig, FlagkitConfig, PermissionsConfig, ServerConfig, StorageBackend, StorageConfig};
pub use counter::CounterAggregator;
pub use definition::{FlagDefinition, FlagScope, FlagTexts, ADMINISTER_FLAGGINGS};
pub use error::{FlagError, Result};
pub use event::{EventChannel, FlagEvent};
pub use flagging::{FlagCount, FlagId, Flagging, FlaggingId, FlaggingPatch, OwnerKey, TargetRef, UserId, ANONYMOUS};
pub use ledger::{BulkFailure, BulkOutcome, FlaggingLedger};
pub use link::{ActionLink, LinkAction, LinkRenderStrategy, LinkTypeRegistry};
pub use memory_store::MemoryLedgerStore;
pub use registry::{FlagRegistry, SharedRegistry};
pub use store::{FlaggingFilter, Insertion, LedgerKey, LedgerStore, OwnerMatch};

#[cfg(feature = "sqlite")]
pub use persistence::SqliteLedgerStore;
