//! Configuration validation

use crate::{ConfigError, Result};

/// Implemented by settings types that can check themselves after loading
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Reusable field rules
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn not_empty(value: &str, field: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::invalid(field, "cannot be empty"));
        }
        Ok(())
    }

    /// At least one entry, none of them blank
    pub fn non_empty_list(values: &[String], field: &str) -> Result<()> {
        if values.is_empty() {
            return Err(ConfigError::invalid(field, "needs at least one entry"));
        }
        values
            .iter()
            .try_for_each(|value| Self::not_empty(value, field))
    }

    pub fn in_range<T: PartialOrd + std::fmt::Display>(
        value: T,
        min: T,
        max: T,
        field: &str,
    ) -> Result<()> {
        if value < min || value > max {
            return Err(ConfigError::invalid(
                field,
                format!("{} is outside {}..={}", value, min, max),
            ));
        }
        Ok(())
    }

    pub fn one_of(value: &str, allowed: &[&str], field: &str) -> Result<()> {
        if !allowed.iter().any(|a| a.eq_ignore_ascii_case(value)) {
            return Err(ConfigError::invalid(
                field,
                format!("'{}' is not one of {}", value, allowed.join(", ")),
            ));
        }
        Ok(())
    }

    pub fn is_url(value: &str, field: &str) -> Result<()> {
        if !value.starts_with("http://") && !value.starts_with("https://") {
            return Err(ConfigError::invalid(field, format!("'{}' is not a URL", value)));
        }
        Ok(())
    }

    /// Accepts a bare address or a `mailto:` URI
    pub fn is_email(value: &str, field: &str) -> Result<()> {
        let address = value.strip_prefix("mailto:").unwrap_or(value);
        match address.split_once('@') {
            Some((local, host)) if !local.is_empty() && host.contains('.') => Ok(()),
            _ => Err(ConfigError::invalid(
                field,
                format!("'{}' is not an email address", value),
            )),
        }
    }

    pub fn is_port(value: u16, field: &str) -> Result<()> {
        if value == 0 {
            return Err(ConfigError::invalid(field, "port 0 is not usable"));
        }
        Ok(())
    }

    pub fn is_socket_addr(value: &str, field: &str) -> Result<()> {
        value
            .parse::<std::net::SocketAddr>()
            .map(|_| ())
            .map_err(|e| ConfigError::invalid(field, format!("'{}': {}", value, e)))
    }
}
