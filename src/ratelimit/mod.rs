//! Rule matching, identity resolution and window counting.

mod backend;
mod identity;
mod limiter;
mod quota;
mod request;
mod response;
mod rules;
mod store;
mod window;

pub use backend::{
    counting_backend, quota_key, window_key, AtomicCounting, CachedQuota, CountingBackend,
    GetSetCounting,
};
pub use identity::{Identity, LimitSource, MissingIdentity, SourceKind};
pub use limiter::{Decision, Limiter, Outcome, RequestContext};
pub use quota::{Quota, QuotaResolver, QuotaSpec};
pub use request::Request;
pub use response::{RateHeaders, Response, ResponseComposer};
pub use rules::{
    FieldSource, KeySpec, LimitByField, LimitBySpec, ListEntry, PathMatcher, RequiredField,
    RequiredSpec, Requirement, Rule, RuleSet, RuleSetSpec, RuleSpec, WholeSource,
};
pub use store::{CounterStore, MemoryStore, StoreError, StoreResult};
pub use window::{Clock, ManualClock, SystemClock, WindowStrategy, QUOTA_CACHE_TTL};
