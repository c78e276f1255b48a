//! Core admission engine.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::backend::{counting_backend, quota_key, window_key, CachedQuota, CountingBackend};
use super::identity::Identity;
use super::quota::QuotaResolver;
use super::request::Request;
use super::response::{RateHeaders, Response, ResponseComposer};
use super::rules::{Rule, RuleSet};
use super::store::CounterStore;
use super::window::{Clock, SystemClock, QUOTA_CACHE_TTL};
use crate::config::{LimitDefaults, TurnstileConfig};
use crate::error::Result;

/// What the limiter decided for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// No rule applies; forwarded untouched
    NoRule,
    /// A required field or identity was absent
    MissingRequirement { message: String },
    Denylisted,
    /// Exempt from counting
    Allowlisted,
    /// The resolved quota is zero
    Revoked,
    Admitted { limit: u64, remaining: u64 },
    OverLimit { limit: u64, count: u64 },
    /// The counting store failed; forwarded without counting
    FailOpen { error: String },
}

impl Outcome {
    /// Whether the request is forwarded to the backend.
    pub fn is_admitted(&self) -> bool {
        matches!(
            self,
            Outcome::NoRule
                | Outcome::Allowlisted
                | Outcome::Admitted { .. }
                | Outcome::FailOpen { .. }
        )
    }
}

/// Per-request state, created for one evaluation and then dropped.
#[derive(Debug, Default)]
pub struct RequestContext<'r> {
    pub rule: Option<&'r Rule>,
    pub identity: Option<Identity>,
    pub quota: Option<u64>,
    pub count: Option<u64>,
    pub missing: Option<String>,
}

/// A decision together with the context it was made in.
#[derive(Debug)]
pub struct Decision<'r> {
    pub outcome: Outcome,
    pub context: RequestContext<'r>,
}

/// The admission engine.
///
/// Rules and defaults are immutable after construction, so a `Limiter` can
/// be shared across any number of request handlers behind an `Arc`. The
/// only shared mutable state is the counting store.
pub struct Limiter {
    rules: Arc<RuleSet>,
    defaults: Arc<LimitDefaults>,
    backend: Arc<dyn CountingBackend>,
    resolver: Option<Arc<dyn QuotaResolver>>,
    clock: Arc<dyn Clock>,
    composer: ResponseComposer,
}

impl Limiter {
    /// Create a limiter over compiled rules and a counting backend.
    pub fn new(
        rules: RuleSet,
        defaults: LimitDefaults,
        backend: Arc<dyn CountingBackend>,
    ) -> Result<Self> {
        let composer = ResponseComposer::new(&defaults)?;
        Ok(Self {
            rules: Arc::new(rules),
            defaults: Arc::new(defaults),
            backend,
            resolver: None,
            clock: Arc::new(SystemClock),
            composer,
        })
    }

    /// Create a limiter from loaded configuration and a store client.
    pub fn from_config<S>(config: &TurnstileConfig, store: S) -> Result<Self>
    where
        S: CounterStore + 'static,
    {
        let rules = config.load_rules()?.compile()?;
        let backend = counting_backend(config.store.kind, store);
        Self::new(rules, config.limits.clone(), backend)
    }

    /// Use an external quota resolver for rules with `dynamic_quota`.
    pub fn with_resolver(mut self, resolver: Arc<dyn QuotaResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Evaluate a request and, if admitted, forward it with `next`.
    ///
    /// Never fails: store errors admit the request.
    pub async fn call<F, Fut>(&self, request: Request, next: F) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let Decision { outcome, context } = self.decide(&request).await;
        let rule = context.rule;

        match outcome {
            Outcome::NoRule | Outcome::Allowlisted | Outcome::FailOpen { .. } => {
                next(request).await
            }
            Outcome::Admitted { limit, remaining } => {
                let mut response = next(request).await;
                self.composer
                    .annotate(&mut response, RateHeaders { limit, remaining });
                response
            }
            Outcome::MissingRequirement { message } => self.composer.missing(&message),
            Outcome::Denylisted | Outcome::Revoked => self.composer.deny(rule, None),
            Outcome::OverLimit { limit, count } => self
                .composer
                .deny(rule, Some(RateHeaders::new(limit, count))),
        }
    }

    /// Decide whether a request may proceed, without forwarding it.
    pub async fn decide(&self, request: &Request) -> Decision<'_> {
        let mut context = RequestContext::default();

        let Some(rule) = self.rules.find(request) else {
            trace!(path = %request.path, "No rule matched");
            return Decision {
                outcome: Outcome::NoRule,
                context,
            };
        };
        context.rule = Some(rule);

        trace!(
            path = %request.path,
            rule = rule.index,
            "Rule matched"
        );

        if let Some(requirement) = rule.missing_requirement(request) {
            debug!(rule = rule.index, field = ?requirement.field, "Required field missing");
            return missing(context, requirement.message.clone());
        }

        let identity = match rule.limit_by.resolve(request) {
            Ok(identity) => identity,
            Err(err) => {
                debug!(rule = rule.index, error = %err, "Identity unresolved");
                let message = rule
                    .missing_identity_message
                    .clone()
                    .unwrap_or_else(|| self.defaults.missing_identity_message.clone());
                return missing(context, message);
            }
        };
        context.identity = Some(identity.clone());

        if rule.is_denylisted(&identity.value) {
            debug!(rule = rule.index, identity = %identity, "Identity denylisted");
            return Decision {
                outcome: Outcome::Denylisted,
                context,
            };
        }

        if rule.is_allowlisted(&identity.value) {
            trace!(rule = rule.index, identity = %identity, "Identity allowlisted");
            return Decision {
                outcome: Outcome::Allowlisted,
                context,
            };
        }

        let quota = self.resolve_quota(rule, &identity).await;
        context.quota = Some(quota);

        if quota == 0 {
            debug!(rule = rule.index, identity = %identity, "Quota is zero, denying");
            return Decision {
                outcome: Outcome::Revoked,
                context,
            };
        }

        let key = self.counter_key(rule, &identity);
        let outcome = match self.backend.increment(&key, rule.strategy.duration()).await {
            Ok(count) => {
                context.count = Some(count);
                if count <= quota {
                    trace!(key = %key, count = count, limit = quota, "Admitted");
                    Outcome::Admitted {
                        limit: quota,
                        remaining: quota.saturating_sub(count),
                    }
                } else {
                    debug!(key = %key, count = count, limit = quota, "Rate limit exceeded");
                    Outcome::OverLimit {
                        limit: quota,
                        count,
                    }
                }
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Counting store failed, admitting request");
                Outcome::FailOpen {
                    error: err.to_string(),
                }
            }
        };

        Decision { outcome, context }
    }

    /// Counter key for an identity under a rule, in the current window.
    pub fn counter_key(&self, rule: &Rule, identity: &Identity) -> String {
        let bucket = self
            .defaults
            .partition_keys
            .then(|| rule.strategy.bucket(self.clock.now()));
        window_key(
            rule.key_prefix.as_deref().unwrap_or(&self.defaults.key_prefix),
            rule.count_prefix
                .as_deref()
                .or(self.defaults.count_prefix.as_deref()),
            bucket.as_deref(),
            &identity.counter_segment(),
        )
    }

    /// Resolve the quota for an identity.
    ///
    /// Precedence: cached dynamic quota, fresh resolver lookup (both only for
    /// rules with `dynamic_quota`), the rule's suffix tiers, the rule's flat
    /// or default quota, then the process default.
    async fn resolve_quota(&self, rule: &Rule, identity: &Identity) -> u64 {
        if rule.dynamic_quota {
            if let Some(quota) = self.dynamic_quota(rule, identity).await {
                return quota;
            }
        }
        rule.quota
            .as_ref()
            .and_then(|quota| quota.for_identity(&identity.value))
            .unwrap_or(self.defaults.max)
    }

    async fn dynamic_quota(&self, rule: &Rule, identity: &Identity) -> Option<u64> {
        let key = quota_key(
            rule.limit_prefix
                .as_deref()
                .unwrap_or(&self.defaults.limit_prefix),
            &identity.value,
        );

        match self.backend.cached_quota(&key).await {
            Ok(Some(CachedQuota::Limit(quota))) => {
                trace!(key = %key, quota = quota, "Using cached quota");
                return Some(quota);
            }
            Ok(Some(CachedQuota::Unresolved)) => {
                trace!(key = %key, "Cached quota lookup found nothing");
                return None;
            }
            Ok(None) => {}
            Err(err) => warn!(key = %key, error = %err, "Quota cache read failed"),
        }

        let resolver = self.resolver.as_ref()?;
        let quota = resolver.resolve(&identity.value).await;
        debug!(key = %key, quota = ?quota, "Resolved quota");

        let cached = CachedQuota::from(quota);
        if let Err(err) = self.backend.cache_quota(&key, cached, QUOTA_CACHE_TTL).await {
            warn!(key = %key, error = %err, "Quota cache write failed");
        }
        quota
    }
}

fn missing(mut context: RequestContext<'_>, message: String) -> Decision<'_> {
    context.missing = Some(message.clone());
    Decision {
        outcome: Outcome::MissingRequirement { message },
        context,
    }
}
