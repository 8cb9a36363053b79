//! Relay configuration read from the process environment.
//!
//! All functions take their values from `VDI_RELAY_*` variables. Unset
//! variables fall back to defaults; set but unparsable ones are errors.
//!
//! # Environment Variables
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `VDI_RELAY_COLOR_CAPACITY` | `capacities.color` | `0` |
//! | `VDI_RELAY_DEPTH_CAPACITY` | `capacities.depth` | `0` |
//! | `VDI_RELAY_PREFIX_CAPACITY` | `capacities.prefix` | `0` |
//! | `VDI_RELAY_STRICT` | `policy` | `Truncate` |
//! | `VDI_RELAY_THREAD_LEVEL` | `thread_level` | `serialized` |

use std::env;
use std::str::FromStr;

use crate::buffer::Capacities;
use crate::error::{Error, Result};
use crate::ThreadLevel;

/// Color region capacity in bytes.
pub const COLOR_CAPACITY_VAR: &str = "VDI_RELAY_COLOR_CAPACITY";
/// Depth region capacity in bytes.
pub const DEPTH_CAPACITY_VAR: &str = "VDI_RELAY_DEPTH_CAPACITY";
/// Prefix region capacity in bytes.
pub const PREFIX_CAPACITY_VAR: &str = "VDI_RELAY_PREFIX_CAPACITY";
/// Switch to [`TruncationPolicy::Strict`].
pub const STRICT_VAR: &str = "VDI_RELAY_STRICT";
/// Thread support level requested when this library starts MPI.
pub const THREAD_LEVEL_VAR: &str = "VDI_RELAY_THREAD_LEVEL";

/// What to do when an exchange does not fit its tables or its region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TruncationPolicy {
    /// Cut over-long tables, overflowing receives and uneven splits, logging
    /// a warning. Views are never longer than their region.
    #[default]
    Truncate,
    /// Reject every mismatch before the collective is entered.
    Strict,
}

impl TruncationPolicy {
    /// Whether mismatches are rejected.
    pub fn is_strict(self) -> bool {
        self == TruncationPolicy::Strict
    }
}

impl FromStr for ThreadLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(ThreadLevel::Single),
            "funneled" => Ok(ThreadLevel::Funneled),
            "serialized" => Ok(ThreadLevel::Serialized),
            "multiple" => Ok(ThreadLevel::Multiple),
            other => Err(Error::Config(format!("unknown thread level '{other}'"))),
        }
    }
}

/// Settings for a relay handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Region sizes.
    pub capacities: Capacities,
    /// Mismatch handling.
    pub policy: TruncationPolicy,
    /// Thread level requested from MPI when the relay starts it. The JVM
    /// calls in from arbitrary threads, hence `Serialized` by default.
    pub thread_level: ThreadLevel,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            capacities: Capacities::default(),
            policy: TruncationPolicy::Truncate,
            thread_level: ThreadLevel::Serialized,
        }
    }
}

impl RelayConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RelayConfig::default();
        let capacity = |key: &str, default: usize| -> Result<usize> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("{key}='{raw}' is not a byte count"))),
            }
        };

        let capacities = Capacities {
            color: capacity(COLOR_CAPACITY_VAR, defaults.capacities.color)?,
            depth: capacity(DEPTH_CAPACITY_VAR, defaults.capacities.depth)?,
            prefix: capacity(PREFIX_CAPACITY_VAR, defaults.capacities.prefix)?,
        };
        let policy = match lookup(STRICT_VAR) {
            None => defaults.policy,
            Some(raw) => {
                if parse_flag(STRICT_VAR, &raw)? {
                    TruncationPolicy::Strict
                } else {
                    TruncationPolicy::Truncate
                }
            }
        };
        let thread_level = match lookup(THREAD_LEVEL_VAR) {
            None => defaults.thread_level,
            Some(raw) => raw.parse()?,
        };

        Ok(RelayConfig {
            capacities,
            policy,
            thread_level,
        })
    }

    /// Same settings with different region sizes.
    pub fn with_capacities(mut self, capacities: Capacities) -> Self {
        self.capacities = capacities;
        self
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::Config(format!("{key}='{raw}' is not a boolean"))),
    }
}
