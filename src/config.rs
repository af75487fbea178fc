//! Environment configuration
//!
//! Read once at startup after `dotenvy` has loaded any `.env` file.

use crate::{IncentiveError, Result};

pub const DEFAULT_PORT: u16 = 8083;
pub const DEFAULT_CURRENCY: &str = "SEK";
pub const DEFAULT_SUBJECT_PREFIX: &str = "storefront.incentives";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    /// Postgres holding the rule catalog. The library runs without one.
    pub database_url: Option<String>,
    pub nats_url: Option<String>,
    pub port: u16,
    pub default_currency: String,
    pub nats_subject_prefix: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> { Self::from_lookup(|key| std::env::var(key).ok()) }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = match get("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| IncentiveError::Config(format!("PORT is not a valid port: {raw}")))?,
            None => DEFAULT_PORT,
        };
        let default_currency = get("DEFAULT_CURRENCY").unwrap_or_else(|| DEFAULT_CURRENCY.to_string()).to_uppercase();
        if default_currency.len() != 3 || !default_currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(IncentiveError::Config(format!("DEFAULT_CURRENCY is not an ISO 4217 code: {default_currency}")));
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            nats_url: get("NATS_URL"),
            port,
            default_currency,
            nats_subject_prefix: get("NATS_SUBJECT_PREFIX").unwrap_or_else(|| DEFAULT_SUBJECT_PREFIX.to_string()),
        })
    }

    pub fn bind_addr(&self) -> String { format!("0.0.0.0:{}", self.port) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from(&[]).unwrap();
        assert_eq!(config.port, 8083);
        assert_eq!(config.default_currency, "SEK");
        assert_eq!(config.nats_subject_prefix, "storefront.incentives");
        assert!(config.database_url.is_none());
        assert_eq!(config.bind_addr(), "0.0.0.0:8083");
    }

    #[test]
    fn test_overrides() {
        let config = from(&[("PORT", "9000"), ("DEFAULT_CURRENCY", "usd"), ("NATS_URL", "nats://localhost:4222"), ("DATABASE_URL", " ")]).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.default_currency, "USD");
        assert_eq!(config.nats_url.as_deref(), Some("nats://localhost:4222"));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(from(&[("PORT", "eighty")]).is_err());
        assert!(from(&[("DEFAULT_CURRENCY", "KRONA")]).is_err());
    }
}
