//! Access gate: who may flag or unflag, and what affordance to render.
//!
//! The rendered state is a function of two booleans. At most one of
//! `can_flag` and `can_unflag` is true for any user and target, and nothing
//! is rendered when both are false.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::definition::{FlagDefinition, ADMINISTER_FLAGGINGS};
use crate::error::{FlagError, Result};
use crate::flagging::{FlagId, TargetRef, UserId, ANONYMOUS};
use crate::ledger::FlaggingLedger;
use crate::link::{ActionLink, LinkAction, LinkRenderStrategy, ReloadLink};

/// Host permission lookup.
pub trait PermissionCheck: Send + Sync {
    fn has_permission(&self, user: UserId, permission: &str) -> bool;
}

impl<F> PermissionCheck for F
where
    F: Fn(UserId, &str) -> bool + Send + Sync,
{
    fn has_permission(&self, user: UserId, permission: &str) -> bool {
        self(user, permission)
    }
}

bitflags! {
    /// Per-flag grants held by a role or user.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FlagPermissions: u8 {
        const FLAG = 0b01;
        const UNFLAG = 0b10;
    }
}

impl FlagPermissions {
    pub const BOTH: FlagPermissions = FlagPermissions::FLAG.union(FlagPermissions::UNFLAG);
}

enum Grant {
    Flag(FlagId, FlagPermissions),
    Administer,
}

fn parse_grant(permission: &str) -> Option<Grant> {
    if permission == ADMINISTER_FLAGGINGS {
        return Some(Grant::Administer);
    }
    if let Some(id) = permission.strip_prefix("flag ") {
        return Some(Grant::Flag(id.to_string(), FlagPermissions::FLAG));
    }
    permission
        .strip_prefix("unflag ")
        .map(|id| Grant::Flag(id.to_string(), FlagPermissions::UNFLAG))
}

#[derive(Debug, Clone, Default)]
struct GrantSet {
    flags: HashMap<FlagId, FlagPermissions>,
    administer: bool,
}

impl GrantSet {
    fn add(&mut self, grant: Grant) {
        match grant {
            Grant::Flag(id, bits) => {
                *self.flags.entry(id).or_insert(FlagPermissions::empty()) |= bits
            }
            Grant::Administer => self.administer = true,
        }
    }

    fn allows(&self, grant: &Grant) -> bool {
        match grant {
            Grant::Flag(id, bits) => self.flags.get(id).is_some_and(|held| held.contains(*bits)),
            Grant::Administer => self.administer,
        }
    }
}

/// Configured permissions: grants for every authenticated user plus
/// per-user grants. The anonymous user holds nothing.
#[derive(Debug, Clone, Default)]
pub struct PermissionTable {
    authenticated: GrantSet,
    users: HashMap<UserId, GrantSet>,
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a permission (`flag <id>`, `unflag <id>` or
    /// `administer flaggings`) to every authenticated user.
    pub fn grant_authenticated(&mut self, permission: &str) -> Result<()> {
        self.authenticated.add(Self::parse(permission)?);
        Ok(())
    }

    pub fn grant_user(&mut self, user: UserId, permission: &str) -> Result<()> {
        if user == ANONYMOUS {
            return Err(FlagError::Config(
                "permissions cannot be granted to the anonymous user".to_string(),
            ));
        }
        let grant = Self::parse(permission)?;
        self.users.entry(user).or_default().add(grant);
        Ok(())
    }

    /// Grants a user holds for one flag, including role grants.
    pub fn flag_permissions(&self, user: UserId, flag_id: &str) -> FlagPermissions {
        if user == ANONYMOUS {
            return FlagPermissions::empty();
        }
        let role = self
            .authenticated
            .flags
            .get(flag_id)
            .copied()
            .unwrap_or(FlagPermissions::empty());
        let own = self
            .users
            .get(&user)
            .and_then(|set| set.flags.get(flag_id))
            .copied()
            .unwrap_or(FlagPermissions::empty());
        role | own
    }

    fn parse(permission: &str) -> Result<Grant> {
        parse_grant(permission)
            .ok_or_else(|| FlagError::Config(format!("unknown permission '{}'", permission)))
    }
}

impl PermissionCheck for PermissionTable {
    fn has_permission(&self, user: UserId, permission: &str) -> bool {
        if user == ANONYMOUS {
            return false;
        }
        let Some(grant) = parse_grant(permission) else {
            return false;
        };
        self.authenticated.allows(&grant)
            || self.users.get(&user).is_some_and(|set| set.allows(&grant))
    }
}

/// The three facts the rendered affordance depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionState {
    /// Flagged from the user's point of view
    pub flagged: bool,
    pub can_flag: bool,
    pub can_unflag: bool,
}

/// What to show a user for a flag on a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderedAction {
    /// A flag or unflag link
    Link(ActionLink),
    /// Flagged, unflagging not allowed; show the flag's denied text
    Denied { text: String },
    /// Nothing
    Hidden,
}

/// Decides which flag actions a user may perform.
pub struct AccessGate {
    ledger: Arc<FlaggingLedger>,
    permissions: Arc<dyn PermissionCheck>,
}

impl AccessGate {
    pub fn new(ledger: Arc<FlaggingLedger>, permissions: Arc<dyn PermissionCheck>) -> Self {
        Self { ledger, permissions }
    }

    pub fn has_permission(&self, user: UserId, permission: &str) -> bool {
        self.permissions.has_permission(user, permission)
    }

    fn definition(&self, flag_id: &str) -> Result<FlagDefinition> {
        let registry = self
            .ledger
            .registry()
            .read()
            .map_err(|e| FlagError::Storage(format!("registry lock: {}", e)))?;
        registry.require(flag_id).cloned()
    }

    fn state_for(
        &self,
        user: UserId,
        flag: &FlagDefinition,
        target: &TargetRef,
        bundle: Option<&str>,
    ) -> Result<ActionState> {
        if !flag.applies_to(&target.entity_type, bundle) {
            return Ok(ActionState {
                flagged: false,
                can_flag: false,
                can_unflag: false,
            });
        }
        let flagged = self.ledger.is_flagged(&flag.id, target, user)?;
        if user == ANONYMOUS || !flag.enabled {
            return Ok(ActionState {
                flagged,
                can_flag: false,
                can_unflag: false,
            });
        }
        Ok(ActionState {
            flagged,
            can_flag: !flagged && self.has_permission(user, &flag.flag_permission()),
            can_unflag: flagged && self.has_permission(user, &flag.unflag_permission()),
        })
    }

    /// `bundle` is the target's bundle when the host knows it. A flag
    /// limited to other bundles offers no action on it.
    pub fn state(
        &self,
        user: UserId,
        flag_id: &str,
        target: &TargetRef,
        bundle: Option<&str>,
    ) -> Result<ActionState> {
        let flag = self.definition(flag_id)?;
        self.state_for(user, &flag, target, bundle)
    }

    /// The user holds the flag permission and has not flagged the target.
    pub fn can_flag(&self, user: UserId, flag_id: &str, target: &TargetRef, bundle: Option<&str>) -> Result<bool> {
        Ok(self.state(user, flag_id, target, bundle)?.can_flag)
    }

    /// The user holds the unflag permission and the target is flagged for them.
    pub fn can_unflag(&self, user: UserId, flag_id: &str, target: &TargetRef, bundle: Option<&str>) -> Result<bool> {
        Ok(self.state(user, flag_id, target, bundle)?.can_unflag)
    }

    pub fn render(
        &self,
        user: UserId,
        flag_id: &str,
        target: &TargetRef,
        bundle: Option<&str>,
    ) -> Result<RenderedAction> {
        Ok(self.status(user, flag_id, target, bundle)?.1)
    }

    /// State and rendered affordance from a single ledger read, so the two
    /// always agree.
    pub fn status(
        &self,
        user: UserId,
        flag_id: &str,
        target: &TargetRef,
        bundle: Option<&str>,
    ) -> Result<(ActionState, RenderedAction)> {
        let flag = self.definition(flag_id)?;
        let state = self.state_for(user, &flag, target, bundle)?;
        let rendered = self.render_state(user, &flag, target, state)?;
        Ok((state, rendered))
    }

    fn render_state(
        &self,
        user: UserId,
        flag: &FlagDefinition,
        target: &TargetRef,
        state: ActionState,
    ) -> Result<RenderedAction> {
        let action = if state.can_unflag {
            LinkAction::Unflag
        } else if state.can_flag {
            LinkAction::Flag
        } else {
            let denied = &flag.texts.unflag_denied_text;
            if state.flagged
                && !denied.is_empty()
                && user != ANONYMOUS
                && flag.enabled
                && self.has_permission(user, &flag.flag_permission())
            {
                return Ok(RenderedAction::Denied {
                    text: denied.clone(),
                });
            }
            return Ok(RenderedAction::Hidden);
        };

        let registry = self
            .ledger
            .registry()
            .read()
            .map_err(|e| FlagError::Storage(format!("registry lock: {}", e)))?;
        let link = match registry.link_types().get(&flag.link_type) {
            Some(strategy) => strategy.build_action(action, flag, target),
            None => {
                tracing::warn!(flag_id = %flag.id, link_type = %flag.link_type, "unknown link type, using reload");
                ReloadLink.build_action(action, flag, target)
            }
        };
        Ok(RenderedAction::Link(link))
    }
}
