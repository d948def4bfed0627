//! Cleanup of flaggings when their owner or target goes away.
//!
//! Every affected row is deleted in its own atomic unit (row and count
//! together). Flags whose rows hit a count desync are rebuilt and the
//! failed rows retried once.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{FlagError, Result};
use crate::flagging::{FlagId, Flagging, FlaggingId, TargetRef, UserId};
use crate::ledger::{BulkFailure, FlaggingLedger};
use crate::store::FlaggingFilter;

/// What a cascade did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeReport {
    pub removed: usize,
    pub failed: Vec<BulkFailure>,
    /// Flags whose counts were rebuilt during the cascade
    pub rebuilt_flags: Vec<FlagId>,
}

impl CascadeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct CascadeHandler {
    ledger: Arc<FlaggingLedger>,
}

impl CascadeHandler {
    pub fn new(ledger: Arc<FlaggingLedger>) -> Self {
        Self { ledger }
    }

    /// Remove the user's personal flaggings. Global flaggings they created stay.
    pub fn on_user_deleted(&self, user: UserId) -> Result<CascadeReport> {
        let rows = self.ledger.list_by(&FlaggingFilter::PersonalOwner(user))?;
        let report = self.remove(rows);
        tracing::info!(user, removed = report.removed, failed = report.failed.len(), "user cascade");
        Ok(report)
    }

    /// Remove every flagging of any flag on the entity.
    pub fn on_entity_deleted(&self, target: &TargetRef) -> Result<CascadeReport> {
        let rows = self.ledger.list_by(&FlaggingFilter::Target(target.clone()))?;
        let report = self.remove(rows);
        tracing::info!(target = %target, removed = report.removed, failed = report.failed.len(), "entity cascade");
        Ok(report)
    }

    /// Purge all flaggings of a flag, then drop its definition.
    ///
    /// The definition (and its file) is only removed once every row is gone;
    /// an incomplete report leaves it registered so the call can be repeated.
    /// A flag already missing from the registry can still be purged if rows
    /// remain.
    pub fn on_flag_deleted(&self, flag_id: &str) -> Result<CascadeReport> {
        let known = self
            .ledger
            .registry()
            .read()
            .map_err(|e| FlagError::Storage(format!("registry lock: {}", e)))?
            .get(flag_id)
            .is_some();
        if !known
            && self
                .ledger
                .list_by(&FlaggingFilter::Flag(flag_id.to_string()))?
                .is_empty()
        {
            return Err(FlagError::UnknownFlagDefinition(flag_id.to_string()));
        }

        let outcome = self.ledger.purge_by_flag(flag_id)?;
        let report = CascadeReport {
            removed: outcome.deleted,
            failed: outcome.failed,
            rebuilt_flags: vec![flag_id.to_string()],
        };
        if !report.is_complete() {
            tracing::warn!(
                flag_id = %flag_id,
                failed = report.failed.len(),
                "flag definition kept until its flaggings are purged"
            );
            return Ok(report);
        }

        if known {
            self.ledger
                .registry()
                .write()
                .map_err(|e| FlagError::Storage(format!("registry lock: {}", e)))?
                .delete(flag_id)?;
        }
        tracing::info!(flag_id = %flag_id, removed = report.removed, "deleted flag");
        Ok(report)
    }

    fn remove(&self, rows: Vec<Flagging>) -> CascadeReport {
        let mut report = CascadeReport::default();
        let mut retry: Vec<(FlaggingId, FlagId)> = Vec::new();

        for row in rows {
            match self.ledger.delete_by_id(row.id) {
                Ok(_) => report.removed += 1,
                // Deleted concurrently; nothing left to clean up.
                Err(FlagError::FlaggingNotFound(_)) => {}
                Err(e) if e.needs_rebuild() => retry.push((row.id, row.flag_id)),
                Err(e) => report.failed.push(BulkFailure {
                    id: row.id,
                    error: e.to_string(),
                }),
            }
        }

        if retry.is_empty() {
            return report;
        }

        let flags: BTreeSet<FlagId> = retry.iter().map(|(_, flag)| flag.clone()).collect();
        for flag_id in flags {
            match self.ledger.store().rebuild_counts(&flag_id) {
                Ok(_) => report.rebuilt_flags.push(flag_id),
                Err(e) => tracing::error!(flag_id = %flag_id, error = %e, "count rebuild failed during cascade"),
            }
        }
        for (id, _) in retry {
            match self.ledger.delete_by_id(id) {
                Ok(_) => report.removed += 1,
                Err(FlagError::FlaggingNotFound(_)) => {}
                Err(e) => report.failed.push(BulkFailure {
                    id,
                    error: e.to_string(),
                }),
            }
        }
        if !report.is_complete() {
            tracing::warn!(failed = report.failed.len(), "cascade left flaggings behind");
        }
        report
    }
}
