//! Layered configuration for certpilot
//!
//! Sources are merged in the order they are loaded, later ones winning:
//! a config file, a `.env` file, then `CERTPILOT_*` environment variables.
//! The merged map is deserialized into [`Settings`] and validated.
//!
//! ```
//! use certpilot_config::{ConfigManager, FileFormat, Settings};
//!
//! let manager = ConfigManager::new();
//! manager
//!     .load_str(
//!         r#"
//!         directory_url = "https://localhost:14000/dir"
//!         domains = ["example.com"]
//!         contacts = ["admin@example.com"]
//!         accept_tos = true
//!         "#,
//!         FileFormat::Toml,
//!     )
//!     .unwrap();
//!
//! let settings: Settings = manager.load_validated().unwrap();
//! assert_eq!(settings.poll_attempts, 30);
//! ```

pub mod env;
pub mod error;
pub mod loader;
pub mod settings;
pub mod validation;

pub use env::{ENV_PREFIX, EnvLoader};
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use settings::Settings;
pub use validation::{ConfigValidator, Validate};

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Merged key/value configuration
#[derive(Clone, Debug)]
pub struct ConfigManager {
    config: Arc<RwLock<HashMap<String, Value>>>,
    env_prefix: Option<String>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(HashMap::new())),
            env_prefix: None,
        }
    }

    /// Manager that reads `PREFIX_*` environment variables
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            config: Arc::new(RwLock::new(HashMap::new())),
            env_prefix: Some(prefix.into()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Value>> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overlay environment variables
    pub fn load_env(&self) -> Result<()> {
        let loader = EnvLoader::new(self.env_prefix.clone());
        let vars = loader.load()?;
        tracing::debug!(count = vars.len(), "Loaded configuration from environment");

        let mut config = self.write();
        for (key, value) in vars {
            config.insert(key, env::env_value(&value));
        }

        Ok(())
    }

    /// Export a `.env` file into the process environment, then overlay it.
    ///
    /// Without a path a missing `.env` in the working directory is not an error.
    pub fn load_dotenv(&self, path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) => {
                dotenvy::from_path(path).map_err(|e| ConfigError::LoadError {
                    source_name: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            }
            None => allow_missing_dotenv(dotenvy::dotenv(), ".env")?,
        }
        self.load_env()
    }

    /// Overlay a file, detecting the format from its name
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = ConfigLoader::auto(path)?.load_file(path)?;
        self.overlay(data);
        Ok(())
    }

    /// Overlay configuration text in a known format
    pub fn load_str(&self, content: &str, format: FileFormat) -> Result<()> {
        let data = ConfigLoader::new(format).parse(content)?;
        self.overlay(data);
        Ok(())
    }

    fn overlay(&self, data: Value) {
        if let Value::Object(map) = data {
            let mut config = self.write();
            for (key, value) in map {
                config.insert(key, value);
            }
        }
    }

    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let json_value = serde_json::to_value(value)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        self.write().insert(key.to_string(), json_value);
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let config = self.read();
        let value = config
            .get(key)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))?;

        serde_json::from_value(value.clone())
            .map_err(|e| ConfigError::DeserializationError(format!("{}: {}", key, e)))
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn has(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Copy every key of `other` over this manager
    pub fn merge(&self, other: &ConfigManager) {
        let entries: Vec<(String, Value)> = other
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut config = self.write();
        config.extend(entries);
    }

    /// Deserialize the merged map and run its validation
    pub fn load_validated<T: DeserializeOwned + Validate>(&self) -> Result<T> {
        let json_value = Value::Object(
            self.read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );

        let validated: T = serde_json::from_value(json_value)
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))?;
        validated.validate()?;

        Ok(validated)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Treat an absent `.env` as empty, but report one that fails to parse
fn allow_missing_dotenv<T>(result: dotenvy::Result<T>, source_name: &str) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.not_found() => Ok(()),
        Err(err) => Err(ConfigError::LoadError {
            source_name: source_name.to_string(),
            reason: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let manager = ConfigManager::new();
        manager.set("listen_addr", "127.0.0.1:8443").unwrap();

        let value: String = manager.get("listen_addr").unwrap();
        assert_eq!(value, "127.0.0.1:8443");
    }

    #[test]
    fn test_get_or_default() {
        let manager = ConfigManager::new();
        assert_eq!(manager.get_or("poll_attempts", 30u32), 30);
        assert!(matches!(
            manager.get::<u32>("poll_attempts"),
            Err(ConfigError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_later_source_wins() {
        let manager = ConfigManager::new();
        manager
            .load_str(r#"{"poll_attempts": 10, "accept_tos": false}"#, FileFormat::Json)
            .unwrap();
        manager
            .load_str("POLL_ATTEMPTS=12", FileFormat::Env)
            .unwrap();

        assert_eq!(manager.get::<u32>("poll_attempts").unwrap(), 12);
        assert!(!manager.get::<bool>("accept_tos").unwrap());
    }

    #[test]
    fn test_merge() {
        let base = ConfigManager::new();
        base.set("domains", vec!["a.example"]).unwrap();
        let overrides = ConfigManager::new();
        overrides.set("domains", vec!["b.example"]).unwrap();
        overrides.set("accept_tos", true).unwrap();

        base.merge(&overrides);

        assert_eq!(base.get::<Vec<String>>("domains").unwrap(), vec!["b.example"]);
        assert!(base.has("accept_tos"));
        assert_eq!(base.keys().len(), 2);
    }

    #[test]
    fn test_missing_dotenv_is_ignored() {
        let result = dotenvy::from_path("/nonexistent/certpilot/.env");
        assert!(allow_missing_dotenv(result, ".env").is_ok());
    }

    #[test]
    fn test_malformed_dotenv_is_reported() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this line has no assignment").unwrap();

        let result = dotenvy::from_path(file.path());
        assert!(matches!(
            allow_missing_dotenv(result, ".env"),
            Err(ConfigError::LoadError { ref source_name, .. }) if source_name == ".env"
        ));
    }
}
