//! Configuration for flagkit
//!
//! Storage, counter repair, server and permission settings, plus flag
//! definitions given inline or as a directory of TOML files.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access::PermissionTable;
use crate::definition::FlagDefinition;
use crate::error::{FlagError, Result};
use crate::memory_store::MemoryLedgerStore;
use crate::registry::FlagRegistry;
use crate::store::LedgerStore;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FLAGKIT_CONFIG";

/// Service-wide configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagkitConfig {
    /// Directory of `*.toml` flag definitions. Files there override inline
    /// `flags` with the same id, and flags saved at runtime are written there.
    /// Defaults to `<database_path>.flags/` for the sqlite backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags_dir: Option<PathBuf>,
    pub storage: StorageConfig,
    pub counters: CounterConfig,
    pub server: ServerConfig,
    pub permissions: PermissionsConfig,
    /// Inline flag definitions
    pub flags: Vec<FlagDefinition>,
}

/// Ledger storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// SQLite database file
    pub database_path: PathBuf,
    /// How long a writer waits on a locked database before giving up
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_path: PathBuf::from("flagkit.db"),
            busy_timeout_ms: 5000,
        }
    }
}

/// Counter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Rebuild a flag's counts as soon as a desync is detected
    pub repair_on_desync: bool,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            repair_on_desync: true,
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Permission grants. Users are keyed by their id as a string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Granted to every authenticated (non-anonymous) user
    pub authenticated: Vec<String>,
    pub users: BTreeMap<String, Vec<String>>,
}

impl FlagkitConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize configuration to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| FlagError::Config(e.to_string()))
    }

    /// Load configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str).map_err(|e| FlagError::Config(e.to_string()))
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a config file; `.json` files are JSON, anything else TOML.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FlagError::Config(format!("{}: {}", path.display(), e)))?;
        let config = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            Self::from_json(&content)?
        } else {
            Self::from_toml(&content)?
        };
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Candidate config files in lookup order.
    pub fn standard_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("flagkit.toml"));
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".flagkit").join("config.toml"));
        }
        paths
    }

    /// Load from `$FLAGKIT_CONFIG`, `./flagkit.toml` or
    /// `~/.flagkit/config.toml`, whichever exists first. Defaults otherwise.
    pub fn load_standard() -> Result<Self> {
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            // An explicit path that does not exist is an error, not a fallback.
            return Self::load_from_path(Path::new(&explicit));
        }
        for path in Self::standard_paths() {
            if path.is_file() {
                return Self::load_from_path(&path);
            }
        }
        tracing::debug!("no configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.busy_timeout_ms)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .map_err(|e| FlagError::Config(format!("server.bind_addr '{}': {}", self.server.bind_addr, e)))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.storage.busy_timeout_ms == 0 {
            return Err(FlagError::Config(
                "storage.busy_timeout_ms must be positive".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Sqlite
            && self.storage.database_path.as_os_str().is_empty()
        {
            return Err(FlagError::Config(
                "storage.database_path is required for the sqlite backend".to_string(),
            ));
        }
        self.bind_addr()?;
        self.permission_table()?;

        for flag in &self.flags {
            let issues = flag.validate();
            if !issues.is_empty() {
                return Err(FlagError::InvalidDefinition {
                    flag_id: flag.id.clone(),
                    issues,
                });
            }
        }
        Ok(())
    }

    /// Where flag definitions are read from and saved to, if anywhere.
    pub fn definitions_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.flags_dir {
            return Some(dir.clone());
        }
        match self.storage.backend {
            StorageBackend::Sqlite => Some(self.storage.database_path.with_extension("flags")),
            StorageBackend::Memory => None,
        }
    }

    /// Registry holding the inline flags, overridden by the definitions
    /// directory, which also receives runtime edits.
    pub fn build_registry(&self) -> Result<FlagRegistry> {
        let mut registry = FlagRegistry::new();
        for flag in &self.flags {
            registry.upsert(flag.clone())?;
        }
        if let Some(dir) = self.definitions_dir() {
            let loaded = registry.load_from_directory(&dir)?;
            tracing::info!(dir = %dir.display(), loaded, "loaded flag definitions");
            registry = registry.with_definitions_dir(dir);
        }
        Ok(registry)
    }

    pub fn permission_table(&self) -> Result<PermissionTable> {
        let mut table = PermissionTable::new();
        for permission in &self.permissions.authenticated {
            table.grant_authenticated(permission)?;
        }
        for (user, permissions) in &self.permissions.users {
            let uid = user
                .parse()
                .map_err(|_| FlagError::Config(format!("permissions.users: bad user id '{}'", user)))?;
            for permission in permissions {
                table.grant_user(uid, permission)?;
            }
        }
        Ok(table)
    }

    /// Open the configured ledger backend.
    pub fn open_store(&self) -> Result<Arc<dyn LedgerStore>> {
        match self.storage.backend {
            StorageBackend::Memory => Ok(Arc::new(MemoryLedgerStore::new())),
            #[cfg(feature = "sqlite")]
            StorageBackend::Sqlite => {
                let store = crate::persistence::SqliteLedgerStore::open(
                    &self.storage.database_path,
                    self.busy_timeout(),
                )?;
                tracing::info!(path = %self.storage.database_path.display(), "opened sqlite ledger");
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "sqlite"))]
            StorageBackend::Sqlite => Err(FlagError::Config(
                "sqlite backend requires the `sqlite` feature".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::PermissionCheck;
    use crate::definition::FlagScope;

    const SAMPLE: &str = r#"
flags_dir = "/nonexistent/flagkit/flags"

[storage]
backend = "memory"
busy_timeout_ms = 250

[counters]
repair_on_desync = false

[server]
bind_addr = "0.0.0.0:9000"

[permissions]
authenticated = ["flag bookmark", "unflag bookmark"]

[permissions.users]
"1" = ["administer flaggings", "flag featured", "unflag featured"]

[[flags]]
id = "bookmark"
label = "Bookmarks"
entity_type = "node"

[[flags]]
id = "featured"
label = "Featured"
entity_type = "node"
scope = "global"
"#;

    #[test]
    fn test_default_config() {
        let config = FlagkitConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.counters.repair_on_desync);
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_toml_sample() {
        let config = FlagkitConfig::from_toml(SAMPLE).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(!config.counters.repair_on_desync);
        assert_eq!(config.bind_addr().unwrap().port(), 9000);

        let registry = config.build_registry().unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("featured").unwrap().scope, FlagScope::Global);

        let table = config.permission_table().unwrap();
        assert!(table.has_permission(5, "flag bookmark"));
        assert!(!table.has_permission(5, "flag featured"));
        assert!(table.has_permission(1, "administer flaggings"));
    }

    #[test]
    fn test_json_serialization() {
        let config = FlagkitConfig::from_toml(SAMPLE).unwrap();
        let json = config.to_json().unwrap();
        let parsed = FlagkitConfig::from_json(&json).unwrap();
        assert_eq!(parsed.flags.len(), 2);
        assert_eq!(parsed.storage.busy_timeout_ms, 250);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = FlagkitConfig::from_toml(SAMPLE).unwrap();
        let toml = config.to_toml().unwrap();
        let parsed = FlagkitConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(parsed.permissions.users["1"].len(), 3);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = FlagkitConfig::default();
        config.storage.busy_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = FlagkitConfig::default();
        config.server.bind_addr = "not an address".to_string();
        assert!(config.validate().is_err());

        let mut config = FlagkitConfig::default();
        config
            .permissions
            .users
            .insert("alice".to_string(), vec!["flag bookmark".to_string()]);
        assert!(config.validate().is_err());

        let mut config = FlagkitConfig::default();
        config.flags.push(FlagDefinition::new("Bad Id", "", "node"));
        assert!(matches!(
            config.validate(),
            Err(FlagError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flagkit.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = FlagkitConfig::load_from_path(&path).unwrap();
        assert_eq!(config.flags.len(), 2);

        let store = config.open_store().unwrap();
        assert_eq!(
            store
                .count("bookmark", &crate::flagging::TargetRef::new("node", "1"))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_definitions_dir() {
        let config = FlagkitConfig::default();
        assert_eq!(config.definitions_dir(), Some(PathBuf::from("flagkit.flags")));

        let mut config = FlagkitConfig::default();
        config.storage.backend = StorageBackend::Memory;
        assert_eq!(config.definitions_dir(), None);

        let config = FlagkitConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(
            config.definitions_dir(),
            Some(PathBuf::from("/nonexistent/flagkit/flags"))
        );
    }

    #[test]
    fn test_saved_definitions_override_inline() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FlagkitConfig::from_toml(SAMPLE).unwrap();
        config.flags_dir = Some(dir.path().join("flags"));

        let mut registry = config.build_registry().unwrap();
        let mut bookmark = registry.require("bookmark").unwrap().clone();
        bookmark.label = "Saved for later".to_string();
        registry.save(bookmark).unwrap();
        registry
            .save(FlagDefinition::new("spam", "Spam", "comment"))
            .unwrap();

        let rebuilt = config.build_registry().unwrap();
        assert_eq!(rebuilt.len(), 3);
        assert_eq!(rebuilt.get("bookmark").unwrap().label, "Saved for later");
        assert!(rebuilt.get("spam").is_some());
        assert_eq!(rebuilt.definitions_dir(), Some(dir.path().join("flags").as_path()));
    }
}
