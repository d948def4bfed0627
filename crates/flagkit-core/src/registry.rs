//! Registry of flag definitions.
//!
//! Every other component reads flag configuration from here. Definitions can
//! be registered programmatically, inline from configuration, or loaded from a
//! directory of `*.toml` files (one flag per file). [`FlagRegistry::save`] and
//! [`FlagRegistry::delete`] keep that directory in step with runtime edits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::definition::FlagDefinition;
use crate::error::{FlagError, Result};
use crate::link::LinkTypeRegistry;

/// Registry shared between the ledger, the access gate and the host.
pub type SharedRegistry = Arc<RwLock<FlagRegistry>>;

/// Registry of flag definitions keyed by id.
pub struct FlagRegistry {
    flags: HashMap<String, FlagDefinition>,
    link_types: LinkTypeRegistry,
    definitions_dir: Option<PathBuf>,
}

impl FlagRegistry {
    /// Empty registry using the builtin link strategies.
    pub fn new() -> Self {
        Self::with_link_types(LinkTypeRegistry::with_builtins())
    }

    pub fn with_link_types(link_types: LinkTypeRegistry) -> Self {
        Self {
            flags: HashMap::new(),
            link_types,
            definitions_dir: None,
        }
    }

    /// Directory that [`save`](Self::save) and [`delete`](Self::delete) write to.
    pub fn with_definitions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.definitions_dir = Some(dir.into());
        self
    }

    pub fn definitions_dir(&self) -> Option<&Path> {
        self.definitions_dir.as_deref()
    }

    /// Wrap into the shared form used by the other components.
    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    pub fn link_types(&self) -> &LinkTypeRegistry {
        &self.link_types
    }

    /// Register a new flag. Fails if the id is taken or the definition is invalid.
    pub fn register(&mut self, flag: FlagDefinition) -> Result<()> {
        if self.flags.contains_key(&flag.id) {
            return Err(FlagError::AlreadyRegistered(flag.id));
        }
        self.check(&flag)?;
        tracing::debug!(flag_id = %flag.id, scope = ?flag.scope, "registered flag");
        self.flags.insert(flag.id.clone(), flag);
        Ok(())
    }

    /// Replace an existing flag's definition.
    ///
    /// Changing the scope does not migrate existing flaggings.
    pub fn update(&mut self, flag: FlagDefinition) -> Result<FlagDefinition> {
        let previous = self
            .flags
            .get(&flag.id)
            .ok_or_else(|| FlagError::UnknownFlagDefinition(flag.id.clone()))?;
        self.check(&flag)?;
        if previous.scope != flag.scope {
            tracing::warn!(
                flag_id = %flag.id,
                from = ?previous.scope,
                to = ?flag.scope,
                "flag scope changed; existing flaggings keep their owners"
            );
        }
        if previous.entity_type != flag.entity_type {
            tracing::warn!(
                flag_id = %flag.id,
                from = %previous.entity_type,
                to = %flag.entity_type,
                "flag entity type changed; existing flaggings keep their targets"
            );
        }
        let previous = self.flags.insert(flag.id.clone(), flag);
        previous.ok_or_else(|| FlagError::Storage("flag vanished during update".to_string()))
    }

    /// Register or replace. Returns true if the flag was new.
    pub fn upsert(&mut self, flag: FlagDefinition) -> Result<bool> {
        if self.flags.contains_key(&flag.id) {
            self.update(flag)?;
            Ok(false)
        } else {
            self.register(flag)?;
            Ok(true)
        }
    }

    pub fn get(&self, id: &str) -> Option<&FlagDefinition> {
        self.flags.get(id)
    }

    /// Like [`get`](Self::get) but an unknown id is an error.
    pub fn require(&self, id: &str) -> Result<&FlagDefinition> {
        self.flags
            .get(id)
            .ok_or_else(|| FlagError::UnknownFlagDefinition(id.to_string()))
    }

    /// Register or replace a flag and write it to the definitions directory.
    ///
    /// Without a directory this is [`upsert`](Self::upsert). The file is
    /// written before the registry changes, so a failed write leaves both
    /// untouched.
    pub fn save(&mut self, flag: FlagDefinition) -> Result<bool> {
        self.check(&flag)?;
        if let Some(dir) = &self.definitions_dir {
            write_definition(dir, &flag)?;
        }
        self.upsert(flag)
    }

    /// Remove a flag and its definition file. Its flaggings must be purged
    /// by the caller.
    pub fn delete(&mut self, id: &str) -> Result<Option<FlagDefinition>> {
        if let Some(dir) = &self.definitions_dir {
            let path = definition_path(dir, id);
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed flag definition file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(FlagError::Config(format!("{}: {}", path.display(), e))),
            }
        }
        Ok(self.flags.remove(id))
    }

    /// All flags sorted by id.
    pub fn list(&self) -> Vec<&FlagDefinition> {
        let mut flags: Vec<_> = self.flags.values().collect();
        flags.sort_by(|a, b| a.id.cmp(&b.id));
        flags
    }

    /// Flags applicable to an entity type, sorted by id.
    pub fn flags_for_entity_type(&self, entity_type: &str) -> Vec<&FlagDefinition> {
        self.list()
            .into_iter()
            .filter(|f| f.entity_type == entity_type)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Load every `*.toml` file in a directory as one flag definition.
    ///
    /// Files are processed in name order; a flag already registered is replaced.
    pub fn load_from_directory(&mut self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            return Ok(0);
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| FlagError::Config(e.to_string()))? {
            let path = entry.map_err(|e| FlagError::Config(e.to_string()))?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            let content = std::fs::read_to_string(path)
                .map_err(|e| FlagError::Config(format!("{}: {}", path.display(), e)))?;
            let flag: FlagDefinition = toml::from_str(&content)
                .map_err(|e| FlagError::Config(format!("{}: {}", path.display(), e)))?;
            self.upsert(flag)?;
        }

        Ok(paths.len())
    }

    fn check(&self, flag: &FlagDefinition) -> Result<()> {
        let mut issues = flag.validate();
        issues.extend(self.link_types.validate(flag));
        if issues.is_empty() {
            Ok(())
        } else {
            Err(FlagError::InvalidDefinition {
                flag_id: flag.id.clone(),
                issues,
            })
        }
    }
}

fn definition_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.toml", id))
}

/// Write through a temporary file so readers never see half a definition.
fn write_definition(dir: &Path, flag: &FlagDefinition) -> Result<()> {
    let content = toml::to_string_pretty(flag)
        .map_err(|e| FlagError::Config(format!("flag '{}': {}", flag.id, e)))?;
    std::fs::create_dir_all(dir).map_err(|e| FlagError::Config(format!("{}: {}", dir.display(), e)))?;

    let path = definition_path(dir, &flag.id);
    let tmp = dir.join(format!(".{}.toml.tmp", flag.id));
    std::fs::write(&tmp, content).map_err(|e| FlagError::Config(format!("{}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, &path).map_err(|e| FlagError::Config(format!("{}: {}", path.display(), e)))?;
    tracing::debug!(path = %path.display(), "wrote flag definition file");
    Ok(())
}

impl Default for FlagRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::FlagScope;

    fn bookmark() -> FlagDefinition {
        FlagDefinition::new("bookmark", "Bookmarks", "node")
    }

    #[test]
    fn register_and_get() {
        let mut reg = FlagRegistry::new();
        reg.register(bookmark()).unwrap();
        assert!(reg.get("bookmark").is_some());
        assert!(reg.get("nonexistent").is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn register_duplicate_fails() {
        let mut reg = FlagRegistry::new();
        reg.register(bookmark()).unwrap();
        let err = reg.register(bookmark()).unwrap_err();
        assert!(matches!(err, FlagError::AlreadyRegistered(_)));
    }

    #[test]
    fn require_unknown_flag() {
        let reg = FlagRegistry::new();
        let err = reg.require("missing").unwrap_err();
        assert!(matches!(err, FlagError::UnknownFlagDefinition(id) if id == "missing"));
    }

    #[test]
    fn register_validates_link_config() {
        let mut reg = FlagRegistry::new();
        let err = reg
            .register(bookmark().with_link_type("confirm"))
            .unwrap_err();
        match err {
            FlagError::InvalidDefinition { issues, .. } => assert_eq!(issues.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn update_allows_scope_change() {
        let mut reg = FlagRegistry::new();
        reg.register(bookmark()).unwrap();
        let previous = reg
            .update(bookmark().with_scope(FlagScope::Global))
            .unwrap();
        assert_eq!(previous.scope, FlagScope::Personal);
        assert!(reg.get("bookmark").unwrap().is_global());
    }

    #[test]
    fn update_unknown_fails() {
        let mut reg = FlagRegistry::new();
        assert!(matches!(
            reg.update(bookmark()),
            Err(FlagError::UnknownFlagDefinition(_))
        ));
    }

    #[test]
    fn upsert_reports_new() {
        let mut reg = FlagRegistry::new();
        assert!(reg.upsert(bookmark()).unwrap());
        assert!(!reg.upsert(bookmark()).unwrap());
    }

    #[test]
    fn list_sorted_and_filtered() {
        let mut reg = FlagRegistry::new();
        reg.register(FlagDefinition::new("spam", "Spam", "comment")).unwrap();
        reg.register(bookmark()).unwrap();
        reg.register(FlagDefinition::new("featured", "Featured", "node")).unwrap();
        let ids: Vec<_> = reg.list().iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["bookmark", "featured", "spam"]);
        assert_eq!(reg.flags_for_entity_type("node").len(), 2);
        assert!(reg.delete("spam").unwrap().is_some());
        assert!(reg.flags_for_entity_type("comment").is_empty());
    }

    #[test]
    fn load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bookmark.toml"),
            r#"
            id = "bookmark"
            label = "Bookmarks"
            entity_type = "node"
            bundles = ["article"]

            [texts]
            flag_short = "Bookmark this"
            unflag_short = "Remove bookmark"
            "#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut reg = FlagRegistry::new();
        assert_eq!(reg.load_from_directory(dir.path()).unwrap(), 1);
        let flag = reg.get("bookmark").unwrap();
        assert_eq!(flag.texts.flag_short, "Bookmark this");
        assert!(flag.applies_to("node", Some("article")));
    }

    #[test]
    fn missing_directory_loads_nothing() {
        let mut reg = FlagRegistry::new();
        let n = reg
            .load_from_directory(Path::new("/nonexistent/flagkit/flags"))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn saved_definitions_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = FlagRegistry::new().with_definitions_dir(dir.path());
        assert!(reg.save(bookmark().with_bundles(["article"])).unwrap());
        assert!(reg.save(FlagDefinition::new("spam", "Spam", "comment")).unwrap());
        assert!(!reg
            .save(bookmark().with_bundles(["article"]).with_scope(FlagScope::Global))
            .unwrap());

        let mut reloaded = FlagRegistry::new();
        assert_eq!(reloaded.load_from_directory(dir.path()).unwrap(), 2);
        let flag = reloaded.get("bookmark").unwrap();
        assert!(flag.is_global());
        assert!(flag.applies_to("node", Some("article")));
        assert!(!flag.applies_to("node", Some("page")));

        assert!(reg.delete("spam").unwrap().is_some());
        assert!(reg.delete("spam").unwrap().is_none());
        let mut reloaded = FlagRegistry::new();
        assert_eq!(reloaded.load_from_directory(dir.path()).unwrap(), 1);
        assert!(reloaded.get("spam").is_none());
    }

    #[test]
    fn invalid_definition_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = FlagRegistry::new().with_definitions_dir(dir.path());
        assert!(reg.save(FlagDefinition::new("Bad Id", "", "node")).is_err());
        assert!(reg.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
