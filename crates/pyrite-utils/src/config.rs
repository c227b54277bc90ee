//! # Inspector Configuration
//!
//! Safety bounds and timeouts shared by the inspection engine and the
//! command-line tool.
//!
//! Values start from [`InspectorConfig::default`], are overridden by
//! `PYRITE_*` environment variables via [`InspectorConfig::from_env`], and
//! finally by whatever the caller sets explicitly (usually CLI flags).
//!
//! ## Environment Variables
//!
//! | variable | field | default |
//! |---|---|---|
//! | `PYRITE_INJECT_TIMEOUT_MS` | `inject_timeout` | 10000 |
//! | `PYRITE_MAX_FRAMES` | `max_frames` | 4096 |
//! | `PYRITE_MAX_THREADS` | `max_threads` | 1024 |
//! | `PYRITE_MAX_STRING_BYTES` | `max_string_bytes` | 65536 |
//! | `PYRITE_MAX_CONTAINER_ENTRIES` | `max_container_entries` | 100000 |
//! | `PYRITE_SYMBOL_FILE` | `symbol_file` | unset |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Tunables for one inspection session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectorConfig
{
    /// How long a single inferior call may run before the injection is
    /// declared stalled
    pub inject_timeout: Duration,
    /// Hard cap on frame-chain traversal per thread
    pub max_frames: usize,
    /// Hard cap on interpreter and thread-state chain traversal
    pub max_threads: usize,
    /// Upper bound on bytes copied out of a single string or bytes object
    pub max_string_bytes: usize,
    /// Upper bound on entries materialised from a single mapping
    pub max_container_entries: usize,
    /// Separate debug-symbol file for the runtime image (e.g. from a
    /// `-dbg` package)
    pub symbol_file: Option<PathBuf>,
}

impl Default for InspectorConfig
{
    fn default() -> Self
    {
        Self {
            inject_timeout: Duration::from_secs(10),
            max_frames: 4096,
            max_threads: 1024,
            max_string_bytes: 64 * 1024,
            max_container_entries: 100_000,
            symbol_file: None,
        }
    }
}

impl InspectorConfig
{
    /// Defaults overridden by any `PYRITE_*` variables present in the
    /// environment
    ///
    /// ## Errors
    ///
    /// Returns [`ConfigError`] if a variable is set but does not parse as a
    /// positive integer.
    pub fn from_env() -> Result<Self, ConfigError>
    {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from an arbitrary
    /// source
    ///
    /// ## Errors
    ///
    /// Returns [`ConfigError`] on unparsable or zero values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = positive::<u64>(&lookup, "PYRITE_INJECT_TIMEOUT_MS")? {
            config.inject_timeout = Duration::from_millis(ms);
        }
        if let Some(value) = positive(&lookup, "PYRITE_MAX_FRAMES")? {
            config.max_frames = value;
        }
        if let Some(value) = positive(&lookup, "PYRITE_MAX_THREADS")? {
            config.max_threads = value;
        }
        if let Some(value) = positive(&lookup, "PYRITE_MAX_STRING_BYTES")? {
            config.max_string_bytes = value;
        }
        if let Some(value) = positive(&lookup, "PYRITE_MAX_CONTAINER_ENTRIES")? {
            config.max_container_entries = value;
        }
        if let Some(path) = lookup("PYRITE_SYMBOL_FILE").filter(|p| !p.is_empty()) {
            config.symbol_file = Some(PathBuf::from(path));
        }

        Ok(config)
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let value = raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        var,
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    if value == T::default() {
        return Err(ConfigError::Zero { var });
    }
    Ok(Some(value))
}

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError
{
    /// A variable is set but could not be parsed
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue
    {
        /// Variable name
        var: &'static str,
        /// Raw value as found
        value: String,
        /// Parser message
        reason: String,
    },

    /// A limit was set to zero
    #[error("{var} must be greater than zero")]
    Zero
    {
        /// Variable name
        var: &'static str,
    },
}
