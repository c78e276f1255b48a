//! Configuration management for Turnstile.
//!
//! Process-wide settings are loaded once at startup and never mutated.
//! Rules themselves live in a separate YAML document (see
//! [`crate::ratelimit::RuleSetSpec`]) referenced by `rules_path`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::ratelimit::RuleSetSpec;

/// Main configuration for the Turnstile engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Process-wide limit defaults
    #[serde(default)]
    pub limits: LimitDefaults,

    /// Counting store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Path to the rules file
    #[serde(default)]
    pub rules_path: Option<String>,
}

/// Defaults applied whenever a rule does not override a value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitDefaults {
    /// Quota used when neither the rule nor a resolver supplies one
    #[serde(default = "default_max")]
    pub max: u64,

    /// Denial body used when a rule has no message of its own
    #[serde(default)]
    pub message: Option<String>,

    /// Denial status used when a rule has no code of its own
    #[serde(default = "default_code")]
    pub code: u16,

    /// Leading namespace of every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Namespace of cached quota entries
    #[serde(default = "default_limit_prefix")]
    pub limit_prefix: String,

    /// Optional segment placed after the key prefix in counter keys
    #[serde(default)]
    pub count_prefix: Option<String>,

    /// Denial body when none of a rule's identity candidates are present
    #[serde(default = "default_missing_identity_message")]
    pub missing_identity_message: String,

    /// Response header carrying the resolved quota
    #[serde(default = "default_limit_header")]
    pub limit_header: String,

    /// Response header carrying the remaining count
    #[serde(default = "default_remaining_header")]
    pub remaining_header: String,

    /// Include the window bucket in counter keys
    #[serde(default = "default_partition_keys")]
    pub partition_keys: bool,
}

impl Default for LimitDefaults {
    fn default() -> Self {
        Self {
            max: default_max(),
            message: None,
            code: default_code(),
            key_prefix: default_key_prefix(),
            limit_prefix: default_limit_prefix(),
            count_prefix: None,
            missing_identity_message: default_missing_identity_message(),
            limit_header: default_limit_header(),
            remaining_header: default_remaining_header(),
            partition_keys: default_partition_keys(),
        }
    }
}

fn default_max() -> u64 {
    1000
}

fn default_code() -> u16 {
    403
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_limit_prefix() -> String {
    "ratelimit:limit".to_string()
}

fn default_missing_identity_message() -> String {
    "403 Forbidden (client identifier required)".to_string()
}

fn default_limit_header() -> String {
    "X-RackLimit-Limit".to_string()
}

fn default_remaining_header() -> String {
    "X-RackLimit-Remaining".to_string()
}

fn default_partition_keys() -> bool {
    true
}

/// Counting store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How window counters are incremented
    #[serde(default)]
    pub kind: StoreKind,
}

/// Increment strategy, chosen by what the deployment's store can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Server-side atomic increment, TTL set on key creation
    #[default]
    Atomic,
    /// Emulated increment via read then write
    GetThenSet,
}

impl TurnstileConfig {
    /// Load configuration from a file path, with `TURNSTILE_*` environment
    /// overrides (nested keys separated by `__`, e.g. `TURNSTILE_LIMITS__MAX`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading turnstile configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load the rules referenced by `rules_path`, or an empty rule list.
    pub fn load_rules(&self) -> Result<RuleSetSpec> {
        match &self.rules_path {
            Some(path) => RuleSetSpec::from_file(path),
            None => Ok(RuleSetSpec::default()),
        }
    }
}
