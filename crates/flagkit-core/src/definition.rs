//! Flag definitions: what a flag applies to, its scope and its texts.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::flagging::{FlagId, OwnerKey, UserId};

/// Maximum length of a flag machine name.
pub const MAX_ID_LEN: usize = 32;

/// Maximum length of a flag label.
pub const MAX_LABEL_LEN: usize = 255;

/// Permission that allows administrative flagging deletion.
pub const ADMINISTER_FLAGGINGS: &str = "administer flaggings";

/// Whether flaggings are per user or shared by everyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagScope {
    /// Each user has individual flags on entities.
    #[default]
    Personal,
    /// The entity is either flagged or not for all users.
    Global,
}

impl FlagScope {
    /// Resolve the ledger owner key for an acting user.
    pub fn owner_for(&self, user: UserId) -> OwnerKey {
        match self {
            FlagScope::Personal => OwnerKey::User(user),
            FlagScope::Global => OwnerKey::Global,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, FlagScope::Global)
    }
}

/// Link and message texts shown for a flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagTexts {
    pub flag_short: String,
    pub flag_long: String,
    pub flag_message: String,
    pub unflag_short: String,
    pub unflag_long: String,
    pub unflag_message: String,
    /// Shown to a user who may flag but not unflag, once they have flagged.
    pub unflag_denied_text: String,
}

impl Default for FlagTexts {
    fn default() -> Self {
        Self {
            flag_short: "Flag this item".to_string(),
            flag_long: String::new(),
            flag_message: String::new(),
            unflag_short: "Unflag this item".to_string(),
            unflag_long: String::new(),
            unflag_message: String::new(),
            unflag_denied_text: String::new(),
        }
    }
}

fn default_link_type() -> String {
    "reload".to_string()
}

fn default_enabled() -> bool {
    true
}

/// An administrator-defined category of marking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagDefinition {
    pub id: FlagId,
    pub label: String,
    pub entity_type: String,
    /// Bundles this flag may be used on. Empty means all bundles.
    #[serde(default)]
    pub bundles: BTreeSet<String>,
    #[serde(default)]
    pub scope: FlagScope,
    #[serde(default)]
    pub texts: FlagTexts,
    #[serde(default = "default_link_type")]
    pub link_type: String,
    #[serde(default)]
    pub link_config: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl FlagDefinition {
    /// New personal flag with default texts and the `reload` link type.
    pub fn new(id: impl Into<FlagId>, label: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            entity_type: entity_type.into(),
            bundles: BTreeSet::new(),
            scope: FlagScope::Personal,
            texts: FlagTexts::default(),
            link_type: default_link_type(),
            link_config: BTreeMap::new(),
            enabled: true,
        }
    }

    pub fn with_scope(mut self, scope: FlagScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_bundles<I, S>(mut self, bundles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bundles = bundles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_texts(mut self, texts: FlagTexts) -> Self {
        self.texts = texts;
        self
    }

    pub fn with_link_type(mut self, link_type: impl Into<String>) -> Self {
        self.link_type = link_type.into();
        self
    }

    pub fn is_global(&self) -> bool {
        self.scope.is_global()
    }

    /// Name of the permission needed to flag with this flag.
    pub fn flag_permission(&self) -> String {
        format!("flag {}", self.id)
    }

    /// Name of the permission needed to unflag with this flag.
    pub fn unflag_permission(&self) -> String {
        format!("unflag {}", self.id)
    }

    /// Whether the flag can be used on an entity of this type and bundle.
    pub fn applies_to(&self, entity_type: &str, bundle: Option<&str>) -> bool {
        if self.entity_type != entity_type {
            return false;
        }
        match bundle {
            Some(b) if !self.bundles.is_empty() => self.bundles.contains(b),
            _ => true,
        }
    }

    /// Field-level problems with this definition. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !is_machine_name(&self.id) {
            issues.push(format!(
                "id must be 1-{} lowercase letters, digits or underscores",
                MAX_ID_LEN
            ));
        }
        if self.label.trim().is_empty() {
            issues.push("label is required".to_string());
        } else if self.label.chars().count() > MAX_LABEL_LEN {
            issues.push(format!("label may be at most {} characters", MAX_LABEL_LEN));
        }
        if self.entity_type.trim().is_empty() {
            issues.push("entity_type is required".to_string());
        }
        if self.texts.flag_short.trim().is_empty() {
            issues.push("flag link text is required".to_string());
        }
        if self.texts.unflag_short.trim().is_empty() {
            issues.push("unflag link text is required".to_string());
        }
        issues
    }
}

/// Lowercase letters, digits and underscores, at most [`MAX_ID_LEN`] long.
pub fn is_machine_name(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_names() {
        assert!(is_machine_name("bookmark"));
        assert!(is_machine_name("offensive_2"));
        assert!(!is_machine_name(""));
        assert!(!is_machine_name("Bookmark"));
        assert!(!is_machine_name("book-mark"));
        assert!(!is_machine_name(&"a".repeat(33)));
    }

    #[test]
    fn permission_names() {
        let flag = FlagDefinition::new("bookmark", "Bookmarks", "node");
        assert_eq!(flag.flag_permission(), "flag bookmark");
        assert_eq!(flag.unflag_permission(), "unflag bookmark");
    }

    #[test]
    fn scope_resolves_owner() {
        assert_eq!(FlagScope::Personal.owner_for(7), OwnerKey::User(7));
        assert_eq!(FlagScope::Global.owner_for(7), OwnerKey::Global);
    }

    #[test]
    fn applies_to_bundles() {
        let any = FlagDefinition::new("bookmark", "Bookmarks", "node");
        assert!(any.applies_to("node", Some("article")));
        assert!(any.applies_to("node", None));
        assert!(!any.applies_to("user", None));

        let articles = any.clone().with_bundles(["article"]);
        assert!(articles.applies_to("node", Some("article")));
        assert!(!articles.applies_to("node", Some("page")));
    }

    #[test]
    fn validate_reports_each_problem() {
        let mut flag = FlagDefinition::new("Bad Id", "", "node");
        flag.texts.unflag_short.clear();
        let issues = flag.validate();
        assert_eq!(issues.len(), 3);
        assert!(FlagDefinition::new("bookmark", "Bookmarks", "node")
            .validate()
            .is_empty());
    }

    #[test]
    fn toml_defaults_fill_in() {
        let flag: FlagDefinition = toml::from_str(
            r#"
            id = "featured"
            label = "Featured"
            entity_type = "node"
            scope = "global"
            "#,
        )
        .unwrap();
        assert!(flag.is_global());
        assert!(flag.enabled);
        assert_eq!(flag.link_type, "reload");
        assert_eq!(flag.texts.flag_short, "Flag this item");
        assert!(flag.bundles.is_empty());
    }
}
