//! Configuration for the failover manager and reconfiguration agent
//!
//! Settings load from TOML or JSON files, then environment variables with the
//! `STRATA_` prefix override individual keys. Durations are stored as
//! milliseconds and exposed as [`std::time::Duration`] accessors.

macro_rules! overlay {
    ($target:expr, $other:expr, $defaults:expr, [$($field:ident),* $(,)?]) => {
        $(
            if $other.$field != $defaults.$field {
                $target.$field = $other.$field;
            }
        )*
    };
}

mod failover;
mod reconfiguration;

pub use failover::FailoverConfig;
pub use reconfiguration::ReconfigurationConfig;

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::errors::{Result, StrataError};

/// Core trait for strata configuration sections
pub trait StrataConfig: Clone + Default + Send + Sync + 'static {
    /// Environment prefix for this section, e.g. `STRATA_FM_`
    const ENV_PREFIX: &'static str;

    /// Load configuration from a `.toml` or `.json` file
    fn load_from_file(path: &Path) -> Result<Self>
    where
        Self: DeserializeOwned,
    {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some("toml") | None => Ok(toml::from_str(&content)?),
            Some(other) => Err(StrataError::invalid(format!(
                "Unsupported config format: {other}"
            ))),
        }
    }

    /// Apply every `ENV_PREFIX` variable from the process environment
    fn merge_with_env(&mut self) -> Result<()> {
        self.merge_with_vars(std::env::vars())
    }

    /// Apply prefixed key/value pairs; unprefixed pairs are ignored
    fn merge_with_vars<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(name) = key.strip_prefix(Self::ENV_PREFIX) {
                self.set_from_string(&name.to_lowercase(), &value)?;
            }
        }
        Ok(())
    }

    /// Overlay fields of `other` that differ from the defaults
    fn merge_with(&mut self, other: &Self);

    /// Validate the configuration
    fn validate(&self) -> Result<()>;

    /// Set a single value by its field name
    fn set_from_string(&mut self, key: &str, value: &str) -> Result<()>;
}

pub(crate) fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StrataError::invalid(format!("Invalid value for {key}: {value}")))
}

pub(crate) fn unknown_key(key: &str) -> StrataError {
    StrataError::invalid(format!("Unknown configuration key: {key}"))
}
