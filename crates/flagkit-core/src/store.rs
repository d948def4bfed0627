use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::flagging::{FlagCount, FlagId, Flagging, FlaggingId, OwnerKey, TargetRef, UserId};

/// Which owners a ledger key matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerMatch {
    /// Only rows with exactly this owner key
    Exact(OwnerKey),
    /// Any row for the (flag, target) pair
    Any,
}

/// Address of the active flagging(s) a flag/unflag operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerKey {
    pub flag_id: FlagId,
    pub target: TargetRef,
    pub owner: OwnerMatch,
}

impl LedgerKey {
    pub fn new(flag_id: impl Into<FlagId>, target: TargetRef, owner: OwnerMatch) -> Self {
        Self {
            flag_id: flag_id.into(),
            target,
            owner,
        }
    }

    pub fn matches(&self, flagging: &Flagging) -> bool {
        flagging.flag_id == self.flag_id
            && flagging.target == self.target
            && match self.owner {
                OwnerMatch::Exact(owner) => flagging.owner == owner,
                OwnerMatch::Any => true,
            }
    }
}

/// Selection of flaggings for listing and cascades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlaggingFilter {
    /// Every flagging of one flag
    Flag(FlagId),
    /// Every flagging of any flag on one target
    Target(TargetRef),
    /// Personal flaggings owned by one user
    PersonalOwner(UserId),
}

impl FlaggingFilter {
    pub fn matches(&self, flagging: &Flagging) -> bool {
        match self {
            FlaggingFilter::Flag(flag_id) => &flagging.flag_id == flag_id,
            FlaggingFilter::Target(target) => &flagging.target == target,
            FlaggingFilter::PersonalOwner(uid) => flagging.owner == OwnerKey::User(*uid),
        }
    }
}

/// Outcome of an insert-if-absent.
#[derive(Debug, Clone, PartialEq)]
pub enum Insertion {
    /// The candidate row was inserted and its count incremented
    Created(Flagging),
    /// A matching row already existed; nothing changed
    Existing(Flagging),
}

impl Insertion {
    pub fn flagging(&self) -> &Flagging {
        match self {
            Insertion::Created(f) | Insertion::Existing(f) => f,
        }
    }

    pub fn into_flagging(self) -> Flagging {
        match self {
            Insertion::Created(f) | Insertion::Existing(f) => f,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, Insertion::Created(_))
    }
}

/// The trait that all ledger storage backends implement.
///
/// Each mutating method is one atomic unit: the ledger row change and the
/// matching counter change commit together or not at all. Backends shared
/// between processes must perform the check-then-act inside the persistence
/// layer, not behind an in-process lock.
pub trait LedgerStore: Send + Sync {
    /// Insert `candidate` unless a row matching `key` exists.
    fn insert_if_absent(&self, key: &LedgerKey, candidate: Flagging) -> Result<Insertion>;

    /// Delete every row matching `key` and decrement counts accordingly.
    /// Returns the deleted rows (empty if none matched).
    fn delete_matching(&self, key: &LedgerKey) -> Result<Vec<Flagging>>;

    /// Delete one row by id, decrementing its count. `None` if absent.
    fn delete_by_id(&self, id: FlaggingId) -> Result<Option<Flagging>>;

    /// Get a flagging by id.
    fn get(&self, id: FlaggingId) -> Result<Option<Flagging>>;

    /// Rows matching `key`, oldest first.
    fn find(&self, key: &LedgerKey) -> Result<Vec<Flagging>>;

    /// Rows matching `filter`, oldest first.
    fn list(&self, filter: &FlaggingFilter) -> Result<Vec<Flagging>>;

    /// Replace a flagging's fields.
    fn update_fields(
        &self,
        id: FlaggingId,
        fields: BTreeMap<String, serde_json::Value>,
    ) -> Result<Flagging>;

    /// Current count for a (flag, target) pair; 0 if untouched.
    fn count(&self, flag_id: &str, target: &TargetRef) -> Result<u64>;

    /// All non-zero counts of a flag.
    fn counts_for_flag(&self, flag_id: &str) -> Result<Vec<FlagCount>>;

    /// Recompute every count of a flag from its rows in one atomic unit.
    /// Returns the number of non-zero counts written.
    fn rebuild_counts(&self, flag_id: &str) -> Result<usize>;
}
