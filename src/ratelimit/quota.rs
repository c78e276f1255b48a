//! Quota specifications and external quota lookup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, TurnstileError};

/// Key of the fallback entry in a tiered quota mapping.
const DEFAULT_TIER: &str = "default";

/// A quota as written in a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuotaSpec {
    /// `max: 100`
    Count(u64),
    /// `max: "100"`
    Text(String),
    /// `max: { default: 10, pro: 100 }`, keyed by identity suffix
    Tiers(BTreeMap<String, u64>),
}

/// A compiled quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quota {
    Flat(u64),
    Tiered {
        /// Suffix entries, longest suffix first
        tiers: Vec<(String, u64)>,
        default: Option<u64>,
    },
}

impl Quota {
    /// Compile a quota spec. Non-numeric text is a configuration error.
    pub fn compile(spec: &QuotaSpec) -> Result<Self> {
        match spec {
            QuotaSpec::Count(n) => Ok(Quota::Flat(*n)),
            QuotaSpec::Text(text) => text.trim().parse().map(Quota::Flat).map_err(|_| {
                TurnstileError::Config(format!("max must be a non-negative integer, got `{}`", text))
            }),
            QuotaSpec::Tiers(map) => {
                let mut tiers: Vec<(String, u64)> = map
                    .iter()
                    .filter(|(suffix, _)| suffix.as_str() != DEFAULT_TIER)
                    .map(|(suffix, n)| (suffix.clone(), *n))
                    .collect();
                if tiers.iter().any(|(suffix, _)| suffix.is_empty()) {
                    return Err(TurnstileError::Config(
                        "quota tier suffixes must not be empty".to_string(),
                    ));
                }
                // Stable sort keeps map order among equal lengths.
                tiers.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
                Ok(Quota::Tiered {
                    tiers,
                    default: map.get(DEFAULT_TIER).copied(),
                })
            }
        }
    }

    /// Quota configured for an identity value, if the rule has one.
    ///
    /// `None` means the process-wide default applies.
    pub fn for_identity(&self, value: &str) -> Option<u64> {
        match self {
            Quota::Flat(n) => Some(*n),
            Quota::Tiered { tiers, default } => tiers
                .iter()
                .find(|(suffix, _)| value.ends_with(suffix.as_str()))
                .map(|(_, n)| *n)
                .or(*default),
        }
    }
}

/// External lookup of a per-identity quota, e.g. from an accounts service.
///
/// Results are cached in the counting store, so an implementation is called
/// at most once per cache period per identity while the store is healthy.
#[async_trait]
pub trait QuotaResolver: Send + Sync {
    /// Quota for `identity`, or `None` if the resolver has no opinion.
    async fn resolve(&self, identity: &str) -> Option<u64>;
}

#[async_trait]
impl<F> QuotaResolver for F
where
    F: Fn(&str) -> Option<u64> + Send + Sync,
{
    async fn resolve(&self, identity: &str) -> Option<u64> {
        self(identity)
    }
}
