//! In-process ledger backend.
//!
//! All state lives behind one mutex, so every trait method is a single
//! atomic unit. Suitable for tests and single-process hosts only.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{FlagError, Result};
use crate::flagging::{FlagCount, FlagId, Flagging, FlaggingId, TargetRef};
use crate::store::{FlaggingFilter, Insertion, LedgerKey, LedgerStore};

#[derive(Default)]
struct MemoryState {
    /// Rows in insertion order.
    rows: Vec<Flagging>,
    counts: BTreeMap<(FlagId, TargetRef), u64>,
}

impl MemoryState {
    fn increment(&mut self, flag_id: &str, target: &TargetRef) {
        *self
            .counts
            .entry((flag_id.to_string(), target.clone()))
            .or_insert(0) += 1;
    }

    /// Check that `n` can be taken off the count before anything changes.
    fn check_decrement(&self, flag_id: &str, target: &TargetRef, n: u64) -> Result<()> {
        let current = self
            .counts
            .get(&(flag_id.to_string(), target.clone()))
            .copied()
            .unwrap_or(0);
        if current < n {
            return Err(FlagError::InvariantViolation {
                flag_id: flag_id.to_string(),
                detail: format!(
                    "count for {} is {} but {} flagging(s) are being removed",
                    target, current, n
                ),
            });
        }
        Ok(())
    }

    fn decrement(&mut self, flag_id: &str, target: &TargetRef, n: u64) {
        let key = (flag_id.to_string(), target.clone());
        if let Some(count) = self.counts.get_mut(&key) {
            *count -= n;
            if *count == 0 {
                self.counts.remove(&key);
            }
        }
    }

    fn sorted(mut rows: Vec<Flagging>) -> Vec<Flagging> {
        rows.sort_by_key(|f| f.created_at);
        rows
    }
}

/// Ledger store held entirely in memory.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| FlagError::Storage(e.to_string()))
    }

    /// Force a count out of line with the rows, to exercise repair paths.
    #[cfg(test)]
    pub(crate) fn corrupt_count(&self, flag_id: &str, target: &TargetRef, count: u64) {
        let mut state = self.state.lock().unwrap();
        let key = (flag_id.to_string(), target.clone());
        if count == 0 {
            state.counts.remove(&key);
        } else {
            state.counts.insert(key, count);
        }
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn insert_if_absent(&self, key: &LedgerKey, candidate: Flagging) -> Result<Insertion> {
        let mut state = self.lock()?;
        if let Some(existing) = state.rows.iter().find(|f| key.matches(f)) {
            return Ok(Insertion::Existing(existing.clone()));
        }
        state.increment(&candidate.flag_id, &candidate.target);
        state.rows.push(candidate.clone());
        Ok(Insertion::Created(candidate))
    }

    fn delete_matching(&self, key: &LedgerKey) -> Result<Vec<Flagging>> {
        let mut state = self.lock()?;
        let n = state.rows.iter().filter(|f| key.matches(f)).count() as u64;
        if n == 0 {
            return Ok(Vec::new());
        }
        state.check_decrement(&key.flag_id, &key.target, n)?;

        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut state.rows).into_iter().partition(|f| key.matches(f));
        state.rows = kept;
        state.decrement(&key.flag_id, &key.target, n);
        Ok(MemoryState::sorted(removed))
    }

    fn delete_by_id(&self, id: FlaggingId) -> Result<Option<Flagging>> {
        let mut state = self.lock()?;
        let Some(pos) = state.rows.iter().position(|f| f.id == id) else {
            return Ok(None);
        };
        let (flag_id, target) = {
            let row = &state.rows[pos];
            (row.flag_id.clone(), row.target.clone())
        };
        state.check_decrement(&flag_id, &target, 1)?;
        let removed = state.rows.remove(pos);
        state.decrement(&flag_id, &target, 1);
        Ok(Some(removed))
    }

    fn get(&self, id: FlaggingId) -> Result<Option<Flagging>> {
        let state = self.lock()?;
        Ok(state.rows.iter().find(|f| f.id == id).cloned())
    }

    fn find(&self, key: &LedgerKey) -> Result<Vec<Flagging>> {
        let state = self.lock()?;
        let rows = state.rows.iter().filter(|f| key.matches(f)).cloned().collect();
        Ok(MemoryState::sorted(rows))
    }

    fn list(&self, filter: &FlaggingFilter) -> Result<Vec<Flagging>> {
        let state = self.lock()?;
        let rows = state
            .rows
            .iter()
            .filter(|f| filter.matches(f))
            .cloned()
            .collect();
        Ok(MemoryState::sorted(rows))
    }

    fn update_fields(
        &self,
        id: FlaggingId,
        fields: BTreeMap<String, serde_json::Value>,
    ) -> Result<Flagging> {
        let mut state = self.lock()?;
        let row = state
            .rows
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or(FlagError::FlaggingNotFound(id))?;
        row.fields = fields;
        Ok(row.clone())
    }

    fn count(&self, flag_id: &str, target: &TargetRef) -> Result<u64> {
        let state = self.lock()?;
        Ok(state
            .counts
            .get(&(flag_id.to_string(), target.clone()))
            .copied()
            .unwrap_or(0))
    }

    fn counts_for_flag(&self, flag_id: &str) -> Result<Vec<FlagCount>> {
        let state = self.lock()?;
        Ok(state
            .counts
            .iter()
            .filter(|((fid, _), _)| fid == flag_id)
            .map(|((fid, target), count)| FlagCount {
                flag_id: fid.clone(),
                target: target.clone(),
                count: *count,
            })
            .collect())
    }

    fn rebuild_counts(&self, flag_id: &str) -> Result<usize> {
        let mut state = self.lock()?;
        let mut rebuilt: BTreeMap<(FlagId, TargetRef), u64> = BTreeMap::new();
        for row in state.rows.iter().filter(|f| f.flag_id == flag_id) {
            *rebuilt
                .entry((row.flag_id.clone(), row.target.clone()))
                .or_insert(0) += 1;
        }
        state.counts.retain(|(fid, _), _| fid != flag_id);
        let written = rebuilt.len();
        state.counts.extend(rebuilt);
        Ok(written)
    }
}
