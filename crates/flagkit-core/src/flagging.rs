//! The flagging ledger row and the keys that address it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FlagError, Result};

/// Machine name of a flag definition.
pub type FlagId = String;

/// Host user identifier. `0` is the anonymous user.
pub type UserId = u64;

/// The anonymous user.
pub const ANONYMOUS: UserId = 0;

/// Identifier of one flagging row (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlaggingId(pub Uuid);

impl FlaggingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for FlaggingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlaggingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The content item being flagged. Opaque to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl TargetRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Who a flagging belongs to once the flag's scope is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKey {
    /// Personal scope: owned by one user
    User(UserId),
    /// Global scope: one shared row for everyone
    Global,
}

impl OwnerKey {
    /// Storage form used in the uniqueness key.
    pub fn as_key(&self) -> String {
        match self {
            OwnerKey::User(uid) => format!("user:{}", uid),
            OwnerKey::Global => "global".to_string(),
        }
    }

    pub fn parse_key(s: &str) -> Option<Self> {
        if s == "global" {
            return Some(OwnerKey::Global);
        }
        s.strip_prefix("user:")
            .and_then(|uid| uid.parse().ok())
            .map(OwnerKey::User)
    }

    pub fn user(&self) -> Option<UserId> {
        match self {
            OwnerKey::User(uid) => Some(*uid),
            OwnerKey::Global => None,
        }
    }
}

/// One flag applied to one target, optionally owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flagging {
    pub id: FlaggingId,
    pub flag_id: FlagId,
    pub target: TargetRef,
    pub owner: OwnerKey,
    /// The user who performed the flag action (also recorded for global rows).
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    /// Extra data collected by field-entry style links.
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl Flagging {
    pub fn new(flag_id: impl Into<FlagId>, target: TargetRef, owner: OwnerKey, created_by: UserId) -> Self {
        Self {
            id: FlaggingId::new(),
            flag_id: flag_id.into(),
            target,
            owner,
            created_by,
            created_at: now_millis(),
            fields: BTreeMap::new(),
        }
    }

    /// Check a requested target against the one this flagging is bound to.
    ///
    /// A flagging can never be moved to another entity.
    pub fn bind_target(&self, requested: &TargetRef) -> Result<()> {
        if &self.target != requested {
            return Err(FlagError::ImmutableRelationViolation {
                id: self.id,
                bound: self.target.clone(),
                requested: requested.clone(),
            });
        }
        Ok(())
    }
}

/// Edit applied to an existing flagging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlaggingPatch {
    /// If present, must equal the flagging's current target.
    #[serde(default)]
    pub target: Option<TargetRef>,
    /// Fields to set; a JSON null removes the field.
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// Denormalized count of active flaggings for one (flag, target) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagCount {
    pub flag_id: FlagId,
    pub target: TargetRef,
    pub count: u64,
}

/// Current time truncated to the millisecond precision the stores keep.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
