//! Colon-separated `key: value` configuration file, per spec §6.
//!
//! The parser itself is explicitly out of scope (spec.md §1 names
//! `archdb.c`/config parsing as an external collaborator), but the typed
//! struct every binary needs to actually run is not; this is the thinnest
//! possible reading of that boundary.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(String, std::io::Error),
    #[error("missing required config key '{0}'")]
    MissingKey(String),
    #[error("invalid value for config key '{0}': {1}")]
    InvalidValue(String, String),
}

/// Typed view over the recognised keys of §6.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_server: String,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub nr_user: Option<String>,
    pub nr_password: Option<String>,
    pub nr_server: Option<String>,
    pub debug: bool,
    pub huyton_alerts: Option<String>,
    pub public_url: Option<String>,
    pub live_server: Option<String>,
    pub trustdb_no_deduce_act: bool,
    raw: HashMap<String, String>,
}

impl Config {
    /// Parse a config file of `key: value` lines. Blank lines and lines
    /// starting with `#` are ignored.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut raw = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            raw.insert(key.trim().to_string(), value.trim().to_string());
        }

        let required = |raw: &HashMap<String, String>, key: &str| {
            raw.get(key)
                .cloned()
                .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
        };
        let bool_flag = |raw: &HashMap<String, String>, key: &str| {
            raw.get(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };

        Ok(Self {
            db_server: required(&raw, "db_server")?,
            db_name: required(&raw, "db_name")?,
            db_user: required(&raw, "db_user")?,
            db_password: required(&raw, "db_password")?,
            nr_user: raw.get("nr_user").cloned(),
            nr_password: raw.get("nr_password").cloned(),
            nr_server: raw.get("nr_server").cloned(),
            debug: bool_flag(&raw, "debug"),
            huyton_alerts: raw.get("huyton_alerts").cloned(),
            public_url: raw.get("public_url").cloned(),
            live_server: raw.get("live_server").cloned(),
            trustdb_no_deduce_act: bool_flag(&raw, "trustdb_no_deduce_act"),
            raw,
        })
    }

    /// Escape hatch for keys this repo doesn't model explicitly.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(|s| s.as_str())
    }

    pub fn db_connect_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}/{}",
            self.db_user, self.db_password, self.db_server, self.db_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognised_keys() {
        let cfg = Config::parse(
            "db_server: localhost\n\
             db_name: openrail\n\
             db_user: openrail\n\
             db_password: secret\n\
             debug: true\n\
             # a comment\n\
             \n\
             public_url: https://example.org\n",
        )
        .unwrap();
        assert_eq!(cfg.db_server, "localhost");
        assert!(cfg.debug);
        assert_eq!(cfg.public_url.as_deref(), Some("https://example.org"));
        assert!(!cfg.trustdb_no_deduce_act);
    }

    #[test]
    fn missing_required_key_errors() {
        let err = Config::parse("db_server: localhost\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(k) if k == "db_name"));
    }
}
