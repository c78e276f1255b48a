//! Rule configuration and matching.
//!
//! Rules are written in YAML as an ordered list and compiled once into a
//! [`RuleSet`]. Compilation compiles path patterns, coerces list entries to
//! strings and parses header names, so that a compiled rule set is immutable
//! and can be shared by any number of concurrent evaluations.

use http::header::HeaderName;
use http::StatusCode;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

use super::identity::LimitSource;
use super::quota::{Quota, QuotaSpec};
use super::request::Request;
use super::window::WindowStrategy;
use crate::error::{Result, TurnstileError};

/// An ordered list of rule specifications.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSetSpec {
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// A rule as written in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    /// Exact path, or a regular expression when `regex` is set
    pub path: String,
    #[serde(default)]
    pub regex: bool,
    /// Exact host the rule is restricted to
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub limit_by: Option<LimitBySpec>,
    #[serde(default)]
    pub required: Option<RequiredSpec>,
    #[serde(default)]
    pub allowlist: Vec<ListEntry>,
    #[serde(default)]
    pub denylist: Vec<ListEntry>,
    #[serde(default)]
    pub max: Option<QuotaSpec>,
    #[serde(default)]
    pub strategy: WindowStrategy,
    /// Consult the quota cache and external resolver for this rule
    #[serde(default)]
    pub dynamic_quota: bool,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub count_prefix: Option<String>,
    #[serde(default)]
    pub limit_prefix: Option<String>,
    /// Denial status code
    #[serde(default)]
    pub code: Option<u16>,
    /// Denial body
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub missing_identity_message: Option<String>,
}

/// Where a rule takes its identity from, as written in configuration.
///
/// Either `{ source: params, key: api_key }`, a list of candidate keys
/// (`key: [token, api_key]`), or one of the bare words `path` and `ip`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LimitBySpec {
    Field(LimitByField),
    Whole(WholeSource),
}

/// A named request field, or a list of candidate fields, to limit by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitByField {
    pub source: FieldSource,
    pub key: KeySpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldSource {
    Params,
    Header,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WholeSource {
    Path,
    Ip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySpec {
    One(String),
    Many(Vec<String>),
}

impl KeySpec {
    fn keys(&self) -> Vec<String> {
        match self {
            KeySpec::One(key) => vec![key.clone()],
            KeySpec::Many(keys) => keys.clone(),
        }
    }
}

/// Fields that must be present, each with its denial message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequiredSpec {
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// An allow or deny list entry. Numbers and booleans are accepted and
/// compared by their string form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListEntry {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for ListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListEntry::Text(s) => write!(f, "{}", s),
            ListEntry::Integer(n) => write!(f, "{}", n),
            ListEntry::Float(n) => write!(f, "{}", n),
            ListEntry::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl RuleSetSpec {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string, either `rules: [...]` or a bare list.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        if document.is_sequence() {
            let rules = serde_yaml::from_value(document)?;
            return Ok(Self { rules });
        }
        Ok(serde_yaml::from_value(document)?)
    }

    /// Compile into a matchable rule set.
    pub fn compile(&self) -> Result<RuleSet> {
        RuleSet::compile(&self.rules)
    }
}

/// How a rule matches the request path.
#[derive(Debug, Clone)]
pub enum PathMatcher {
    Exact(String),
    Pattern(Regex),
}

impl PathMatcher {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Exact(exact) => exact == path,
            PathMatcher::Pattern(pattern) => pattern.is_match(path),
        }
    }
}

impl fmt::Display for PathMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathMatcher::Exact(exact) => write!(f, "{}", exact),
            PathMatcher::Pattern(pattern) => write!(f, "~{}", pattern.as_str()),
        }
    }
}

/// A request field that must be present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequiredField {
    Param(String),
    Header(HeaderName),
}

impl RequiredField {
    fn is_present(&self, request: &Request) -> bool {
        match self {
            RequiredField::Param(name) => request.params.contains_key(name),
            RequiredField::Header(name) => request.headers.contains_key(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub field: RequiredField,
    pub message: String,
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Position in the rule set
    pub index: usize,
    pub path: PathMatcher,
    pub domain: Option<String>,
    pub limit_by: LimitSource,
    pub requirements: Vec<Requirement>,
    pub allowlist: HashSet<String>,
    pub denylist: HashSet<String>,
    pub quota: Option<Quota>,
    pub strategy: WindowStrategy,
    pub dynamic_quota: bool,
    pub key_prefix: Option<String>,
    pub count_prefix: Option<String>,
    pub limit_prefix: Option<String>,
    pub code: Option<StatusCode>,
    pub message: Option<String>,
    pub missing_identity_message: Option<String>,
}

/// Parse a configured header name.
pub(crate) fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| TurnstileError::Config(format!("invalid header name `{}`", name)))
}

impl Rule {
    /// Compile one rule specification.
    pub fn compile(index: usize, spec: &RuleSpec) -> Result<Self> {
        let path = if spec.regex {
            let pattern = Regex::new(&spec.path).map_err(|source| TurnstileError::InvalidPattern {
                pattern: spec.path.clone(),
                source,
            })?;
            PathMatcher::Pattern(pattern)
        } else {
            PathMatcher::Exact(spec.path.clone())
        };

        let limit_by = match &spec.limit_by {
            None | Some(LimitBySpec::Whole(WholeSource::Ip)) => LimitSource::RemoteAddr,
            Some(LimitBySpec::Whole(WholeSource::Path)) => LimitSource::Path,
            Some(LimitBySpec::Field(LimitByField { source, key })) => {
                let keys = key.keys();
                if keys.is_empty() || keys.iter().any(|k| k.is_empty()) {
                    return Err(TurnstileError::Config(format!(
                        "rule {} (`{}`): limit_by keys must be non-empty",
                        index, spec.path
                    )));
                }
                match source {
                    FieldSource::Params => LimitSource::Params(keys),
                    FieldSource::Header => LimitSource::Header(
                        keys.iter()
                            .map(|k| header_name(k))
                            .collect::<Result<Vec<_>>>()?,
                    ),
                }
            }
        };

        let mut requirements = Vec::new();
        if let Some(required) = &spec.required {
            for (name, message) in &required.params {
                requirements.push(Requirement {
                    field: RequiredField::Param(name.clone()),
                    message: message.clone(),
                });
            }
            for (name, message) in &required.headers {
                requirements.push(Requirement {
                    field: RequiredField::Header(header_name(name)?),
                    message: message.clone(),
                });
            }
        }

        let code = spec
            .code
            .map(|code| {
                StatusCode::from_u16(code).map_err(|_| {
                    TurnstileError::Config(format!(
                        "rule {} (`{}`): invalid status code {}",
                        index, spec.path, code
                    ))
                })
            })
            .transpose()?;

        let quota = spec.max.as_ref().map(Quota::compile).transpose()?;

        let rule = Self {
            index,
            path,
            domain: spec.domain.clone(),
            limit_by,
            requirements,
            allowlist: spec.allowlist.iter().map(ToString::to_string).collect(),
            denylist: spec.denylist.iter().map(ToString::to_string).collect(),
            quota,
            strategy: spec.strategy,
            dynamic_quota: spec.dynamic_quota,
            key_prefix: spec.key_prefix.clone(),
            count_prefix: spec.count_prefix.clone(),
            limit_prefix: spec.limit_prefix.clone(),
            code,
            message: spec.message.clone(),
            missing_identity_message: spec.missing_identity_message.clone(),
        };

        debug!(
            index = index,
            path = %rule.path,
            domain = ?rule.domain,
            source = ?rule.limit_by.kind(),
            strategy = ?rule.strategy,
            "Compiled rule"
        );

        Ok(rule)
    }

    /// Whether the rule applies to the request's path and host.
    pub fn matches(&self, request: &Request) -> bool {
        if !self.path.matches(&request.path) {
            return false;
        }
        match &self.domain {
            Some(domain) => request.host.as_deref() == Some(domain.as_str()),
            None => true,
        }
    }

    /// The first required field the request lacks.
    pub fn missing_requirement(&self, request: &Request) -> Option<&Requirement> {
        self.requirements
            .iter()
            .find(|requirement| !requirement.field.is_present(request))
    }

    pub fn is_denylisted(&self, identity: &str) -> bool {
        self.denylist.contains(identity)
    }

    pub fn is_allowlisted(&self, identity: &str) -> bool {
        self.allowlist.contains(identity)
    }
}

/// An ordered, immutable set of compiled rules. The first match wins.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Compile rule specifications, preserving their order.
    ///
    /// Any invalid rule fails the whole set.
    pub fn compile(specs: &[RuleSpec]) -> Result<Self> {
        let rules = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| Rule::compile(index, spec))
            .collect::<Result<Vec<_>>>()?;

        info!(rules = rules.len(), "Rule set compiled");
        Ok(Self { rules })
    }

    /// Find the first rule that applies to the request.
    pub fn find(&self, request: &Request) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(request))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(yaml: &str) -> RuleSet {
        RuleSetSpec::from_yaml(yaml).unwrap().compile().unwrap()
    }

    #[test]
    fn test_parse_simple_config() {
        let yaml = r#"
rules:
  - path: /api
    strategy: hourly
    max: 2
"#;
        let spec = RuleSetSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.rules.len(), 1);
        assert_eq!(spec.rules[0].strategy, WindowStrategy::Hourly);
        assert_eq!(spec.rules[0].max, Some(QuotaSpec::Count(2)));
    }

    #[test]
    fn test_parse_bare_list() {
        let yaml = r#"
- path: /a
- path: /b
"#;
        let spec = RuleSetSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.rules.len(), 2);
    }

    #[test]
    fn test_parse_limit_by_forms() {
        let yaml = r#"
rules:
  - path: /one
    limit_by: { source: params, key: api_key }
  - path: /many
    limit_by: { source: header, key: [X-Api-Key, X-Token] }
  - path: /path
    limit_by: path
  - path: /ip
    limit_by: ip
"#;
        let set = compile(yaml);
        let rules: Vec<_> = set.iter().collect();

        assert_eq!(rules[0].limit_by, LimitSource::Params(vec!["api_key".to_string()]));
        assert_eq!(
            rules[1].limit_by,
            LimitSource::Header(vec![
                HeaderName::from_static("x-api-key"),
                HeaderName::from_static("x-token"),
            ])
        );
        assert_eq!(rules[2].limit_by, LimitSource::Path);
        assert_eq!(rules[3].limit_by, LimitSource::RemoteAddr);
    }

    #[test]
    fn test_default_limit_source_is_remote_addr() {
        let set = compile("rules: [{ path: /api }]");
        assert_eq!(set.iter().next().unwrap().limit_by, LimitSource::RemoteAddr);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
rules:
  - path: /api
    maximum: 10
"#;
        assert!(RuleSetSpec::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_limit_by_field_rejected() {
        let yaml = r#"
rules:
  - path: /api
    limit_by: { source: params, key: k, keyy: typo }
"#;
        assert!(RuleSetSpec::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_bare_list_error_is_reported() {
        let yaml = r#"
- path: /api
  maximum: 10
"#;
        let err = RuleSetSpec::from_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("maximum"), "{}", err);
        assert!(!err.contains("RuleSetSpec"), "{}", err);
    }

    #[test]
    fn test_invalid_pattern_is_fatal() {
        let yaml = r#"
rules:
  - path: /ok
  - path: "/api/(unclosed"
    regex: true
"#;
        let err = RuleSetSpec::from_yaml(yaml).unwrap().compile().unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidPattern { .. }));
    }

    #[test]
    fn test_invalid_status_code_rejected() {
        let err = RuleSetSpec::from_yaml("rules: [{ path: /a, code: 42 }]")
            .unwrap()
            .compile()
            .unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_empty_limit_by_keys_rejected() {
        let yaml = r#"
rules:
  - path: /a
    limit_by: { source: params, key: [] }
"#;
        assert!(RuleSetSpec::from_yaml(yaml).unwrap().compile().is_err());
    }

    #[test]
    fn test_invalid_required_header_rejected() {
        let yaml = r#"
rules:
  - path: /a
    required:
      headers: { "bad header": "nope" }
"#;
        assert!(RuleSetSpec::from_yaml(yaml).unwrap().compile().is_err());
    }

    #[test]
    fn test_exact_and_pattern_matching() {
        let yaml = r#"
rules:
  - path: /api
  - path: "^/v[0-9]+/"
    regex: true
"#;
        let set = compile(yaml);

        assert_eq!(set.find(&Request::get("/api")).unwrap().index, 0);
        assert!(set.find(&Request::get("/api/users")).is_none());
        assert_eq!(set.find(&Request::get("/v2/users")).unwrap().index, 1);
        assert!(set.find(&Request::get("/health")).is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let yaml = r#"
rules:
  - path: "^/api"
    regex: true
    max: 1
  - path: /api/special
    max: 100
"#;
        let set = compile(yaml);
        assert_eq!(set.find(&Request::get("/api/special")).unwrap().index, 0);
    }

    #[test]
    fn test_domain_restriction() {
        let yaml = r#"
rules:
  - path: /api
    domain: api.example.com
"#;
        let set = compile(yaml);

        assert!(set.find(&Request::get("/api").with_host("api.example.com")).is_some());
        assert!(set.find(&Request::get("/api").with_host("www.example.com")).is_none());
        assert!(set.find(&Request::get("/api")).is_none());
    }

    #[test]
    fn test_lists_are_coerced_to_strings() {
        let yaml = r#"
rules:
  - path: /api
    limit_by: { source: params, key: user_id }
    allowlist: [42, "admin", true]
    denylist: [7, 1.5]
"#;
        let set = compile(yaml);
        let rule = set.iter().next().unwrap();

        assert!(rule.is_allowlisted("42"));
        assert!(rule.is_allowlisted("admin"));
        assert!(rule.is_allowlisted("true"));
        assert!(rule.is_denylisted("7"));
        assert!(rule.is_denylisted("1.5"));
        assert!(!rule.is_denylisted("42"));
    }

    #[test]
    fn test_missing_requirement() {
        let yaml = r#"
rules:
  - path: /api
    required:
      params: { api_key: "403 Forbidden (api key required)" }
      headers: { X-Client: "client header required" }
"#;
        let set = compile(yaml);
        let rule = set.iter().next().unwrap();

        let missing = rule.missing_requirement(&Request::get("/api")).unwrap();
        assert_eq!(missing.message, "403 Forbidden (api key required)");

        let request = Request::get("/api").with_param("api_key", "1");
        let missing = rule.missing_requirement(&request).unwrap();
        assert_eq!(missing.message, "client header required");

        let request = request.with_header("x-client", "web");
        assert!(rule.missing_requirement(&request).is_none());
    }

    #[test]
    fn test_recompile_is_equivalent() {
        let yaml = r#"
rules:
  - path: "^/api/"
    regex: true
    domain: example.com
  - path: /login
"#;
        let spec = RuleSetSpec::from_yaml(yaml).unwrap();
        let first = spec.compile().unwrap();
        let second = spec.compile().unwrap();

        let requests = [
            Request::get("/api/x").with_host("example.com"),
            Request::get("/api/x").with_host("other.com"),
            Request::get("/login"),
            Request::get("/logout"),
        ];
        for request in &requests {
            assert_eq!(
                first.find(request).map(|r| r.index),
                second.find(request).map(|r| r.index)
            );
        }
    }
}
