//! Prefixed environment variable loading

use crate::{ConfigError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::env;

/// Prefix for every variable certpilot reads
pub const ENV_PREFIX: &str = "CERTPILOT";

/// Reads `PREFIX_NAME` variables into lowercase `name` keys
pub struct EnvLoader {
    prefix: Option<String>,
}

impl EnvLoader {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    /// Loader for the `CERTPILOT_` namespace
    pub fn certpilot() -> Self {
        Self::new(Some(ENV_PREFIX.to_string()))
    }

    /// Collect the matching variables from the process environment
    pub fn load(&self) -> Result<HashMap<String, String>> {
        Ok(self.collect(env::vars()))
    }

    /// Filter and rename an arbitrary set of variables
    pub fn collect<I>(&self, vars: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        vars.into_iter()
            .filter_map(|(key, value)| {
                let name = match &self.prefix {
                    Some(prefix) => key.strip_prefix(prefix.as_str())?.strip_prefix('_')?,
                    None => key.as_str(),
                };
                (!name.is_empty()).then(|| (name.to_lowercase(), value))
            })
            .collect()
    }

    /// Load a specific variable by its unprefixed name
    pub fn load_var(&self, key: &str) -> Result<String> {
        env::var(self.full_key(key)).map_err(ConfigError::EnvError)
    }

    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix, key.to_uppercase()),
            None => key.to_uppercase(),
        }
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::certpilot()
    }
}

/// Interpret a raw variable value as a typed JSON scalar.
///
/// Booleans and integers are recognised so numeric settings can come from the
/// environment; anything else stays a string.
pub fn env_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => trimmed
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(trimmed.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_prefix_is_stripped() {
        let loader = EnvLoader::certpilot();
        let found = loader.collect(vars(&[
            ("CERTPILOT_DOMAINS", "example.com"),
            ("CERTPILOT_POLL_ATTEMPTS", "5"),
            ("PATH", "/usr/bin"),
        ]));

        assert_eq!(found.len(), 2);
        assert_eq!(found["domains"], "example.com");
        assert_eq!(found["poll_attempts"], "5");
    }

    #[test]
    fn test_prefix_requires_separator() {
        let loader = EnvLoader::certpilot();
        let found = loader.collect(vars(&[
            ("CERTPILOTX_DOMAINS", "example.com"),
            ("CERTPILOT_", "empty"),
        ]));

        assert!(found.is_empty());
    }

    #[test]
    fn test_missing_var_uses_default() {
        let loader = EnvLoader::new(Some("CERTPILOT_TEST".to_string()));
        assert!(loader.load_var("MISSING_VAR_67890").is_err());
        assert_eq!(loader.load_var_or("MISSING_VAR_67890", "fallback"), "fallback");
    }

    #[test]
    fn test_env_value_typing() {
        assert_eq!(env_value("true"), Value::Bool(true));
        assert_eq!(env_value(" 30 "), Value::from(30u64));
        assert_eq!(
            env_value("admin@example.com"),
            Value::String("admin@example.com".to_string())
        );
        assert_eq!(env_value("-1"), Value::String("-1".to_string()));
    }
}
