//! Engine configuration.

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::Error;

const DEFAULT_FAN_OUT_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest `first`/`last`/`limit` a request may ask for. `None` leaves
    /// page sizes uncapped.
    pub max_page_size: Option<u64>,

    /// Upper bound on concurrent adapter calls when a relation is resolved
    /// per source (paged relation queries, aggregate fallback).
    pub fan_out_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_page_size: None,
            fan_out_concurrency: DEFAULT_FAN_OUT_CONCURRENCY,
        }
    }
}

impl EngineConfig {
    pub fn with_max_page_size(mut self, max_page_size: u64) -> Self {
        self.max_page_size = Some(max_page_size);
        self
    }

    pub fn with_fan_out_concurrency(mut self, concurrency: usize) -> Self {
        self.fan_out_concurrency = concurrency.max(1);
        self
    }

    /// Reads `TAXIS_MAX_PAGE_SIZE` and `TAXIS_FAN_OUT_CONCURRENCY`, falling
    /// back to the defaults for unset variables.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(raw) = lookup("TAXIS_MAX_PAGE_SIZE") {
            let max = raw.trim().parse::<u64>().map_err(|_| {
                Error::Config(format!("TAXIS_MAX_PAGE_SIZE must be a valid u64, got {raw:?}"))
            })?;
            config.max_page_size = Some(max);
        }

        if let Some(raw) = lookup("TAXIS_FAN_OUT_CONCURRENCY") {
            let concurrency = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "TAXIS_FAN_OUT_CONCURRENCY must be a positive integer, got {raw:?}"
                    ))
                })?;
            config.fan_out_concurrency = concurrency;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.fan_out_concurrency, 8);
        assert_eq!(config.max_page_size, None);
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("TAXIS_MAX_PAGE_SIZE", "100"),
            ("TAXIS_FAN_OUT_CONCURRENCY", " 4 "),
        ]))
        .unwrap();
        assert_eq!(config.max_page_size, Some(100));
        assert_eq!(config.fan_out_concurrency, 4);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("TAXIS_FAN_OUT_CONCURRENCY", "0")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("TAXIS_MAX_PAGE_SIZE", "lots")])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_page_size": 50}"#).unwrap();
        assert_eq!(config.max_page_size, Some(50));
        assert_eq!(config.fan_out_concurrency, 8);
    }
}
