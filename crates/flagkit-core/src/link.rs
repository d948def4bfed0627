//! Link render strategies.
//!
//! A flag stores a link type id; the strategy registered under that id turns
//! an allowed action into an [`ActionLink`] and validates the flag's
//! strategy-specific configuration.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::definition::FlagDefinition;
use crate::flagging::TargetRef;

/// Strategy-specific configuration stored on a flag definition.
pub type LinkConfig = BTreeMap<String, serde_json::Value>;

/// The action a link performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkAction {
    Flag,
    Unflag,
}

impl LinkAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkAction::Flag => "flag",
            LinkAction::Unflag => "unflag",
        }
    }
}

impl fmt::Display for LinkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rendered flag or unflag affordance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLink {
    pub action: LinkAction,
    pub strategy: String,
    pub text: String,
    pub title: String,
    pub href: String,
    pub css_classes: Vec<String>,
    /// Message to show once the action has been carried out.
    pub message: String,
}

/// A problem with a strategy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub key: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link config '{}': {}", self.key, self.message)
    }
}

/// A way of presenting flag actions to users.
pub trait LinkRenderStrategy: Send + Sync {
    /// Identifier stored on flag definitions.
    fn id(&self) -> &'static str;

    fn label(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Build the link for an action the user is allowed to perform.
    fn build_action(&self, action: LinkAction, flag: &FlagDefinition, target: &TargetRef) -> ActionLink;

    /// Check the flag's strategy configuration.
    fn validate_config(&self, config: &LinkConfig) -> Result<(), Vec<ConfigIssue>>;
}

/// Route of the action endpoint for a flag and target.
pub fn action_path(flag: &FlagDefinition, target: &TargetRef) -> String {
    format!(
        "/flags/{}/targets/{}/{}/flag",
        flag.id, target.entity_type, target.entity_id
    )
}

/// Text, title and message from the flag's texts for an action.
fn texts_for(action: LinkAction, flag: &FlagDefinition) -> (String, String, String) {
    let t = &flag.texts;
    match action {
        LinkAction::Flag => (t.flag_short.clone(), t.flag_long.clone(), t.flag_message.clone()),
        LinkAction::Unflag => (
            t.unflag_short.clone(),
            t.unflag_long.clone(),
            t.unflag_message.clone(),
        ),
    }
}

fn css_classes(action: LinkAction, flag: &FlagDefinition) -> Vec<String> {
    vec![
        "flag".to_string(),
        format!("flag-{}", flag.id.replace('_', "-")),
        format!("{}-action", action.as_str()),
    ]
}

fn build_link(
    strategy: &'static str,
    action: LinkAction,
    flag: &FlagDefinition,
    href: String,
) -> ActionLink {
    let (text, title, message) = texts_for(action, flag);
    ActionLink {
        action,
        strategy: strategy.to_string(),
        text,
        title,
        href,
        css_classes: css_classes(action, flag),
        message,
    }
}

fn require_string(config: &LinkConfig, key: &str, issues: &mut Vec<ConfigIssue>) {
    match config.get(key) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {}
        Some(serde_json::Value::String(_)) | None => issues.push(ConfigIssue {
            key: key.to_string(),
            message: "a non-empty string is required".to_string(),
        }),
        Some(_) => issues.push(ConfigIssue {
            key: key.to_string(),
            message: "must be a string".to_string(),
        }),
    }
}

fn optional_string(config: &LinkConfig, key: &str, issues: &mut Vec<ConfigIssue>) {
    if let Some(value) = config.get(key) {
        if !value.is_string() {
            issues.push(ConfigIssue {
                key: key.to_string(),
                message: "must be a string".to_string(),
            });
        }
    }
}

fn config_str<'a>(config: &'a LinkConfig, key: &str) -> Option<&'a str> {
    config.get(key).and_then(|v| v.as_str())
}

/// Plain link that performs the action and returns to the page.
pub struct ReloadLink;

impl LinkRenderStrategy for ReloadLink {
    fn id(&self) -> &'static str {
        "reload"
    }

    fn label(&self) -> &'static str {
        "Normal link"
    }

    fn description(&self) -> &'static str {
        "A normal non-JavaScript request will be made and the current page will be reloaded."
    }

    fn build_action(&self, action: LinkAction, flag: &FlagDefinition, target: &TargetRef) -> ActionLink {
        let href = format!("{}?action={}", action_path(flag, target), action);
        build_link(self.id(), action, flag, href)
    }

    fn validate_config(&self, _config: &LinkConfig) -> Result<(), Vec<ConfigIssue>> {
        Ok(())
    }
}

/// Link to a confirmation step before the action is carried out.
pub struct ConfirmLink;

impl LinkRenderStrategy for ConfirmLink {
    fn id(&self) -> &'static str {
        "confirm"
    }

    fn label(&self) -> &'static str {
        "Confirmation form"
    }

    fn description(&self) -> &'static str {
        "The user will be taken to a confirmation form on a separate page to confirm the flag."
    }

    fn build_action(&self, action: LinkAction, flag: &FlagDefinition, target: &TargetRef) -> ActionLink {
        let href = format!("{}/confirm?action={}", action_path(flag, target), action);
        let mut link = build_link(self.id(), action, flag, href);
        let question_key = match action {
            LinkAction::Flag => "flag_confirmation",
            LinkAction::Unflag => "unflag_confirmation",
        };
        if let Some(question) = config_str(&flag.link_config, question_key) {
            link.title = question.to_string();
        }
        link
    }

    fn validate_config(&self, config: &LinkConfig) -> Result<(), Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        require_string(config, "flag_confirmation", &mut issues);
        require_string(config, "unflag_confirmation", &mut issues);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Link to a form that collects flagging fields.
pub struct FieldEntryLink;

impl LinkRenderStrategy for FieldEntryLink {
    fn id(&self) -> &'static str {
        "field_entry"
    }

    fn label(&self) -> &'static str {
        "Field entry form"
    }

    fn description(&self) -> &'static str {
        "The user will be taken to a form to enter values for the flagging's fields."
    }

    fn build_action(&self, action: LinkAction, flag: &FlagDefinition, target: &TargetRef) -> ActionLink {
        let base = action_path(flag, target);
        let href = match action {
            LinkAction::Flag => format!("{}/entry", base),
            LinkAction::Unflag => format!("{}/entry/delete", base),
        };
        let mut link = build_link(self.id(), action, flag, href);
        if action == LinkAction::Flag {
            if let Some(question) = config_str(&flag.link_config, "flag_question") {
                link.title = question.to_string();
            }
        }
        link
    }

    fn validate_config(&self, config: &LinkConfig) -> Result<(), Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        require_string(config, "flag_question", &mut issues);
        optional_string(config, "edit_flagging_title", &mut issues);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Link strategies available to flag definitions, keyed by id.
pub struct LinkTypeRegistry {
    strategies: HashMap<&'static str, Box<dyn LinkRenderStrategy>>,
}

impl LinkTypeRegistry {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registry holding `reload`, `confirm` and `field_entry`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ReloadLink));
        registry.register(Box::new(ConfirmLink));
        registry.register(Box::new(FieldEntryLink));
        registry
    }

    /// Add a strategy, replacing one with the same id.
    pub fn register(&mut self, strategy: Box<dyn LinkRenderStrategy>) {
        self.strategies.insert(strategy.id(), strategy);
    }

    pub fn get(&self, id: &str) -> Option<&dyn LinkRenderStrategy> {
        self.strategies.get(id).map(|s| s.as_ref())
    }

    /// `(id, label)` pairs sorted by id.
    pub fn all(&self) -> Vec<(&'static str, &'static str)> {
        let mut all: Vec<_> = self
            .strategies
            .values()
            .map(|s| (s.id(), s.label()))
            .collect();
        all.sort();
        all
    }

    /// Validate a flag's link type and its configuration.
    pub fn validate(&self, flag: &FlagDefinition) -> Vec<String> {
        match self.get(&flag.link_type) {
            None => vec![format!("unknown link type '{}'", flag.link_type)],
            Some(strategy) => match strategy.validate_config(&flag.link_config) {
                Ok(()) => Vec::new(),
                Err(issues) => issues.iter().map(ToString::to_string).collect(),
            },
        }
    }
}

impl Default for LinkTypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
