//! Configuration file loaders

use crate::env::env_value;
use crate::{ConfigError, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
    Env,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(FileFormat::Json),
            "toml" => Some(FileFormat::Toml),
            "env" => Some(FileFormat::Env),
            _ => None,
        }
    }

    /// Detect the format of a path, treating a bare `.env` file as `Env`
    pub fn detect(path: &Path) -> Result<Self> {
        if path.file_name().is_some_and(|name| name == ".env") {
            return Ok(FileFormat::Env);
        }

        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigError::UnsupportedFormat(path.display().to_string()))?;

        Self::from_extension(ext).ok_or_else(|| ConfigError::UnsupportedFormat(ext.to_string()))
    }
}

/// Reads one configuration file into a flat JSON object
pub struct ConfigLoader {
    format: FileFormat,
}

impl ConfigLoader {
    pub fn new(format: FileFormat) -> Self {
        Self { format }
    }

    /// Pick the format from the file name
    pub fn auto(path: &Path) -> Result<Self> {
        FileFormat::detect(path).map(Self::new)
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    pub fn load_file(&self, path: &Path) -> Result<Value> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::LoadError {
            source_name: path.display().to_string(),
            reason: e.to_string(),
        })?;

        tracing::debug!(path = %path.display(), format = ?self.format, "Loaded configuration file");
        self.parse(&content)
    }

    pub fn parse(&self, content: &str) -> Result<Value> {
        let value = match self.format {
            FileFormat::Json => serde_json::from_str(content)
                .map_err(|e| ConfigError::ParseError(format!("JSON parse error: {}", e)))?,
            FileFormat::Toml => {
                let table: toml::Table = toml::from_str(content)
                    .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;
                serde_json::to_value(table)
                    .map_err(|e| ConfigError::SerializationError(e.to_string()))?
            }
            FileFormat::Env => parse_env(content),
        };

        if !value.is_object() {
            return Err(ConfigError::ParseError(
                "Top level of a configuration file must be a table".to_string(),
            ));
        }
        Ok(value)
    }
}

/// `KEY=value` lines; keys are lowercased and an optional `CERTPILOT_` prefix dropped
fn parse_env(content: &str) -> Value {
    let mut map = serde_json::Map::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().trim_start_matches("export ").trim();
            let key = key
                .strip_prefix(crate::env::ENV_PREFIX)
                .and_then(|rest| rest.strip_prefix('_'))
                .unwrap_or(key);
            let value = value.trim().trim_matches('"').trim_matches('\'');
            map.insert(key.to_lowercase(), env_value(value));
        }
    }

    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json() {
        let loader = ConfigLoader::new(FileFormat::Json);
        let result = loader
            .parse(r#"{"domains": ["example.com"], "poll_attempts": 10}"#)
            .unwrap();
        assert_eq!(result["poll_attempts"], 10);
    }

    #[test]
    fn test_parse_toml() {
        let loader = ConfigLoader::new(FileFormat::Toml);
        let toml = r#"
            directory_url = "https://localhost:14000/dir"
            domains = ["example.com", "www.example.com"]
            accept_tos = true
        "#;

        let result = loader.parse(toml).unwrap();
        assert_eq!(result["domains"][1], "www.example.com");
        assert_eq!(result["accept_tos"], true);
    }

    #[test]
    fn test_parse_env() {
        let loader = ConfigLoader::new(FileFormat::Env);
        let env = r#"
            CERTPILOT_DOMAINS=example.com
            export POLL_ATTEMPTS=42
            # Comment
            CONTACTS="admin@example.com"
        "#;

        let result = loader.parse(env).unwrap();
        assert_eq!(result["domains"], "example.com");
        assert_eq!(result["poll_attempts"], 42);
        assert_eq!(result["contacts"], "admin@example.com");
    }

    #[test]
    fn test_non_table_rejected() {
        let loader = ConfigLoader::new(FileFormat::Json);
        assert!(matches!(
            loader.parse("[1, 2]"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(FileFormat::from_extension("JSON"), Some(FileFormat::Json));
        assert_eq!(FileFormat::from_extension("unknown"), None);
        assert_eq!(
            FileFormat::detect(Path::new("/etc/certpilot/.env")).unwrap(),
            FileFormat::Env
        );
        assert_eq!(
            FileFormat::detect(Path::new("certpilot.toml")).unwrap(),
            FileFormat::Toml
        );
        assert!(FileFormat::detect(Path::new("certpilot")).is_err());
    }
}
