//! The flagging ledger.
//!
//! Records which (flag, target, owner) tuples are currently flagged. All row
//! changes go through a [`LedgerStore`], which applies the matching counter
//! change in the same atomic unit.

use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::counter::CounterAggregator;
use crate::definition::FlagDefinition;
use crate::error::{FlagError, Result};
use crate::event::{EventChannel, FlagEvent};
use crate::flagging::{Flagging, FlaggingId, FlaggingPatch, TargetRef, UserId};
use crate::registry::SharedRegistry;
use crate::store::{FlaggingFilter, LedgerKey, LedgerStore, OwnerMatch};

/// A row that could not be deleted during a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkFailure {
    pub id: FlaggingId,
    pub error: String,
}

/// Result of deleting several flaggings, one atomic unit per row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub deleted: usize,
    /// Ids that did not exist (already deleted counts as done)
    pub missing: Vec<FlaggingId>,
    pub failed: Vec<BulkFailure>,
}

impl BulkOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Records flag/unflag actions and answers "is this flagged?".
pub struct FlaggingLedger {
    store: Arc<dyn LedgerStore>,
    registry: SharedRegistry,
    events: Arc<EventChannel>,
    repair_on_desync: bool,
}

impl FlaggingLedger {
    pub fn new(store: Arc<dyn LedgerStore>, registry: SharedRegistry) -> Self {
        Self {
            store,
            registry,
            events: Arc::new(EventChannel::new()),
            repair_on_desync: false,
        }
    }

    /// Rebuild a flag's counts whenever a desync is detected.
    pub fn with_repair_on_desync(mut self, repair: bool) -> Self {
        self.repair_on_desync = repair;
        self
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Counter view over the same store and event channel.
    pub fn counter(&self) -> CounterAggregator {
        CounterAggregator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.events),
        )
    }

    /// Take the event receiver. Only one subscriber is supported.
    pub fn subscribe(&self) -> Result<Receiver<FlagEvent>> {
        self.events.subscribe()
    }

    fn definition(&self, flag_id: &str) -> Result<FlagDefinition> {
        let registry = self
            .registry
            .read()
            .map_err(|e| FlagError::Storage(format!("registry lock: {}", e)))?;
        registry.require(flag_id).cloned()
    }

    /// Ledger key for an acting user. Global flags match any row so that
    /// rows written before a scope change still count.
    fn key_for(flag: &FlagDefinition, target: &TargetRef, user: UserId) -> LedgerKey {
        let owner = if flag.is_global() {
            OwnerMatch::Any
        } else {
            OwnerMatch::Exact(flag.scope.owner_for(user))
        };
        LedgerKey::new(flag.id.clone(), target.clone(), owner)
    }

    /// Log a detected desync and repair it if configured. Returns the error.
    fn desync(&self, err: FlagError) -> FlagError {
        if let FlagError::InvariantViolation { flag_id, detail } = &err {
            tracing::error!(flag_id = %flag_id, detail = %detail, "flagging ledger and counts out of sync");
            if self.repair_on_desync {
                match self.store.rebuild_counts(flag_id) {
                    Ok(counts) => {
                        tracing::info!(flag_id = %flag_id, counts, "rebuilt counts after desync");
                        self.events.emit(FlagEvent::CountsRebuilt {
                            flag_id: flag_id.clone(),
                            counts,
                        });
                    }
                    Err(e) => {
                        tracing::error!(flag_id = %flag_id, error = %e, "count rebuild failed");
                    }
                }
            }
        }
        err
    }

    /// Flag a target for a user. Returns the id of the new or existing flagging.
    pub fn flag(&self, flag_id: &str, target: &TargetRef, user: UserId) -> Result<FlaggingId> {
        self.flag_with_fields(flag_id, target, None, user, BTreeMap::new())
            .map(|flagging| flagging.id)
    }

    /// Flag a target and attach fields to the flagging if it is created.
    ///
    /// `bundle` is the target's bundle when the host knows it; a flag limited
    /// to other bundles rejects it. An existing flagging is returned unchanged.
    pub fn flag_with_fields(
        &self,
        flag_id: &str,
        target: &TargetRef,
        bundle: Option<&str>,
        user: UserId,
        fields: BTreeMap<String, serde_json::Value>,
    ) -> Result<Flagging> {
        let flag = self.definition(flag_id)?;
        if flag.entity_type != target.entity_type {
            return Err(FlagError::TargetTypeMismatch {
                flag_id: flag.id,
                expected: flag.entity_type,
                actual: target.entity_type.clone(),
            });
        }
        if let Some(bundle) = bundle {
            if !flag.applies_to(&target.entity_type, Some(bundle)) {
                return Err(FlagError::BundleNotAllowed {
                    flag_id: flag.id,
                    bundle: bundle.to_string(),
                });
            }
        }

        let mut candidate = Flagging::new(flag.id.clone(), target.clone(), flag.scope.owner_for(user), user);
        candidate.fields = fields;

        let insertion = self
            .store
            .insert_if_absent(&Self::key_for(&flag, target, user), candidate)?;
        if insertion.created() {
            tracing::debug!(flag_id = %flag.id, target = %target, user, "flagged");
            self.events
                .emit(FlagEvent::Flagged(Box::new(insertion.flagging().clone())));
        }
        Ok(insertion.into_flagging())
    }

    /// Remove the user's flagging (or the shared one for global flags).
    /// Unflagging something that is not flagged does nothing.
    pub fn unflag(&self, flag_id: &str, target: &TargetRef, user: UserId) -> Result<()> {
        let flag = self.definition(flag_id)?;
        let removed = self
            .store
            .delete_matching(&Self::key_for(&flag, target, user))
            .map_err(|e| self.desync(e))?;

        for flagging in removed {
            tracing::debug!(flag_id = %flag.id, target = %target, user, "unflagged");
            self.events.emit(FlagEvent::Unflagged(Box::new(flagging)));
        }
        Ok(())
    }

    /// Whether the target is flagged from the user's point of view.
    pub fn is_flagged(&self, flag_id: &str, target: &TargetRef, user: UserId) -> Result<bool> {
        let flag = self.definition(flag_id)?;
        let rows = self.store.find(&Self::key_for(&flag, target, user))?;
        Ok(!rows.is_empty())
    }

    /// Every flagging of a flag on a target, oldest first.
    pub fn list_flaggings(&self, flag_id: &str, target: &TargetRef) -> Result<Vec<Flagging>> {
        let flag = self.definition(flag_id)?;
        self.store
            .find(&LedgerKey::new(flag.id, target.clone(), OwnerMatch::Any))
    }

    /// Flaggings selected by a filter, oldest first. Does not consult the registry.
    pub fn list_by(&self, filter: &FlaggingFilter) -> Result<Vec<Flagging>> {
        self.store.list(filter)
    }

    pub fn get(&self, id: FlaggingId) -> Result<Flagging> {
        self.store.get(id)?.ok_or(FlagError::FlaggingNotFound(id))
    }

    /// Delete one flagging through the same counted path as `unflag`.
    pub fn delete_by_id(&self, id: FlaggingId) -> Result<Flagging> {
        let removed = self
            .store
            .delete_by_id(id)
            .map_err(|e| self.desync(e))?
            .ok_or(FlagError::FlaggingNotFound(id))?;
        tracing::debug!(flagging = %id, flag_id = %removed.flag_id, "deleted flagging");
        self.events
            .emit(FlagEvent::Unflagged(Box::new(removed.clone())));
        Ok(removed)
    }

    /// Delete several flaggings, each in its own atomic unit.
    ///
    /// A failing row does not undo the rows deleted before it.
    pub fn delete_many(&self, ids: &[FlaggingId]) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for &id in ids {
            match self.delete_by_id(id) {
                Ok(_) => outcome.deleted += 1,
                Err(FlagError::FlaggingNotFound(_)) => outcome.missing.push(id),
                Err(e) => outcome.failed.push(BulkFailure {
                    id,
                    error: e.to_string(),
                }),
            }
        }
        if !outcome.is_complete() {
            tracing::warn!(
                deleted = outcome.deleted,
                failed = outcome.failed.len(),
                "bulk flagging delete partially failed"
            );
        }
        outcome
    }

    /// Edit a flagging's fields. The target can never change.
    pub fn update_flagging(&self, id: FlaggingId, patch: FlaggingPatch) -> Result<Flagging> {
        let current = self.get(id)?;
        if let Some(target) = &patch.target {
            current.bind_target(target)?;
        }

        let mut fields = current.fields;
        for (name, value) in patch.fields {
            if value.is_null() {
                fields.remove(&name);
            } else {
                fields.insert(name, value);
            }
        }

        let updated = self.store.update_fields(id, fields)?;
        tracing::debug!(flagging = %id, "updated flagging fields");
        self.events
            .emit(FlagEvent::FlaggingUpdated(Box::new(updated.clone())));
        Ok(updated)
    }

    /// Delete every flagging of a flag, then rebuild its counts.
    ///
    /// Works for flags already removed from the registry.
    pub fn purge_by_flag(&self, flag_id: &str) -> Result<BulkOutcome> {
        let ids: Vec<FlaggingId> = self
            .store
            .list(&FlaggingFilter::Flag(flag_id.to_string()))?
            .into_iter()
            .map(|f| f.id)
            .collect();
        let outcome = self.delete_many(&ids);

        let counts = self.store.rebuild_counts(flag_id)?;
        self.events.emit(FlagEvent::CountsRebuilt {
            flag_id: flag_id.to_string(),
            counts,
        });
        tracing::info!(flag_id = %flag_id, deleted = outcome.deleted, "purged flaggings");
        Ok(outcome)
    }
}
