//! Read and repair side of the denormalized flag counts.
//!
//! Increments and decrements happen inside the store, in the same atomic
//! unit as the ledger row they account for. This type only reads counts and
//! rebuilds them from the ledger.

use std::sync::Arc;

use crate::error::{FlagError, Result};
use crate::event::{EventChannel, FlagEvent};
use crate::flagging::{FlagCount, TargetRef};
use crate::registry::SharedRegistry;
use crate::store::LedgerStore;

pub struct CounterAggregator {
    store: Arc<dyn LedgerStore>,
    registry: SharedRegistry,
    events: Arc<EventChannel>,
}

impl CounterAggregator {
    pub fn new(store: Arc<dyn LedgerStore>, registry: SharedRegistry, events: Arc<EventChannel>) -> Self {
        Self {
            store,
            registry,
            events,
        }
    }

    fn ensure_known(&self, flag_id: &str) -> Result<()> {
        let registry = self
            .registry
            .read()
            .map_err(|e| FlagError::Storage(format!("registry lock: {}", e)))?;
        registry.require(flag_id).map(|_| ())
    }

    /// Number of active flaggings for a (flag, target) pair. 0 if never flagged.
    pub fn get_count(&self, flag_id: &str, target: &TargetRef) -> Result<u64> {
        self.ensure_known(flag_id)?;
        self.store.count(flag_id, target)
    }

    /// Every non-zero count of a flag.
    pub fn counts_for_flag(&self, flag_id: &str) -> Result<Vec<FlagCount>> {
        self.ensure_known(flag_id)?;
        self.store.counts_for_flag(flag_id)
    }

    /// Recompute every count of a flag from the ledger rows.
    pub fn rebuild(&self, flag_id: &str) -> Result<usize> {
        self.ensure_known(flag_id)?;
        let counts = self.store.rebuild_counts(flag_id)?;
        tracing::info!(flag_id = %flag_id, counts, "rebuilt flag counts");
        self.events.emit(FlagEvent::CountsRebuilt {
            flag_id: flag_id.to_string(),
            counts,
        });
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::FlagDefinition;
    use crate::ledger::FlaggingLedger;
    use crate::memory_store::MemoryLedgerStore;
    use crate::registry::FlagRegistry;

    fn ledger() -> (FlaggingLedger, Arc<MemoryLedgerStore>) {
        let mut registry = FlagRegistry::new();
        registry
            .register(FlagDefinition::new("like", "Likes", "comment"))
            .unwrap();
        let store = Arc::new(MemoryLedgerStore::new());
        (FlaggingLedger::new(store.clone(), registry.into_shared()), store)
    }

    #[test]
    fn untouched_pair_counts_zero() {
        let (ledger, _) = ledger();
        let counter = ledger.counter();
        assert_eq!(counter.get_count("like", &TargetRef::new("comment", "9")).unwrap(), 0);
        assert!(matches!(
            counter.get_count("nope", &TargetRef::new("comment", "9")),
            Err(FlagError::UnknownFlagDefinition(_))
        ));
    }

    #[test]
    fn rebuild_restores_drifted_counts() {
        let (ledger, store) = ledger();
        let target = TargetRef::new("comment", "9");
        for uid in 1..=3 {
            ledger.flag("like", &target, uid).unwrap();
        }
        store.corrupt_count("like", &target, 17);
        let rx = ledger.subscribe().unwrap();

        let counter = ledger.counter();
        assert_eq!(counter.rebuild("like").unwrap(), 1);
        assert_eq!(counter.get_count("like", &target).unwrap(), 3);
        assert_eq!(
            counter.counts_for_flag("like").unwrap(),
            vec![FlagCount {
                flag_id: "like".to_string(),
                target,
                count: 3
            }]
        );
        // Flagged events from before the subscription are not queued.
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events.last(),
            Some(FlagEvent::CountsRebuilt { counts: 1, .. })
        ));
    }
}
