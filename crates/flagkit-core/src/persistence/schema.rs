//! SQLite schema for the flagging ledger

/// Schema version written to new databases
pub const SCHEMA_VERSION: u32 = 1;

/// SQLite schema definition
pub struct Schema;

impl Schema {
    /// Get the complete schema SQL (latest version)
    pub fn create_tables() -> &'static str {
        r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Flagging ledger. owner_key is 'user:<uid>' for personal flags and
-- 'global' for global flags, so the unique index enforces at most one
-- active row per (flag, target, owner).
CREATE TABLE IF NOT EXISTS flaggings (
    id TEXT PRIMARY KEY,
    flag_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    owner_key TEXT NOT NULL,
    uid INTEGER NOT NULL,
    created INTEGER NOT NULL,
    fields TEXT NOT NULL DEFAULT '{}'
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_flaggings_owner
    ON flaggings(flag_id, entity_type, entity_id, owner_key);
CREATE INDEX IF NOT EXISTS idx_flaggings_target ON flaggings(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_flaggings_owner_key ON flaggings(owner_key);
CREATE INDEX IF NOT EXISTS idx_flaggings_created ON flaggings(created);

-- Denormalized counts, rebuilt from flaggings on demand
CREATE TABLE IF NOT EXISTS flag_counts (
    flag_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    count INTEGER NOT NULL CHECK (count >= 0),
    last_updated INTEGER NOT NULL,
    PRIMARY KEY (flag_id, entity_type, entity_id)
);
"#
    }

}
