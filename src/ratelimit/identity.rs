//! Client identity resolution.
//!
//! The identity is the string a request is listed and counted under. It is
//! taken from a request parameter, a header, the path, or the client address,
//! depending on the matched rule's `limit_by`.

use http::header::HeaderName;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use super::request::Request;

/// Identity value used when the host supplied no client address.
const UNKNOWN_ADDR: &str = "unknown";

/// Where a rule takes its identity from, after compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitSource {
    /// Candidate parameter names, tried in order
    Params(Vec<String>),
    /// Candidate header names, tried in order
    Header(Vec<HeaderName>),
    /// The request path itself
    Path,
    /// The client network address
    RemoteAddr,
}

/// Tag of the source an identity was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Params,
    Header,
    Path,
    RemoteAddr,
}

/// A resolved client identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub source: SourceKind,
    /// The parameter or header name the value came from
    pub key: Option<String>,
    /// The value used for list membership and quota lookups
    pub value: String,
}

impl Identity {
    /// Segment identifying this client inside a counter key.
    ///
    /// Named sources are qualified with their key so that two parameters
    /// carrying the same value never share a counter.
    pub fn counter_segment(&self) -> String {
        match &self.key {
            Some(key) => format!("{}:{}", key, self.value),
            None => self.value.clone(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.counter_segment())
    }
}

/// None of a rule's candidate identity fields were present.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("none of the identity fields [{}] are present", .candidates.join(", "))]
pub struct MissingIdentity {
    pub candidates: Vec<String>,
}

impl LimitSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            LimitSource::Params(_) => SourceKind::Params,
            LimitSource::Header(_) => SourceKind::Header,
            LimitSource::Path => SourceKind::Path,
            LimitSource::RemoteAddr => SourceKind::RemoteAddr,
        }
    }

    /// Resolve the identity of `request`.
    pub fn resolve(&self, request: &Request) -> Result<Identity, MissingIdentity> {
        match self {
            LimitSource::Params(keys) => resolve_param(keys, request),
            LimitSource::Header(names) => resolve_header(names, request),
            LimitSource::Path => Ok(Identity {
                source: SourceKind::Path,
                key: None,
                value: request.path.clone(),
            }),
            LimitSource::RemoteAddr => Ok(Identity {
                source: SourceKind::RemoteAddr,
                key: None,
                value: request
                    .remote_addr
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|| UNKNOWN_ADDR.to_string()),
            }),
        }
    }
}

fn resolve_param(keys: &[String], request: &Request) -> Result<Identity, MissingIdentity> {
    keys.iter()
        .find_map(|key| {
            request.param(key).map(|value| Identity {
                source: SourceKind::Params,
                key: Some(key.clone()),
                value: value.to_string(),
            })
        })
        .ok_or_else(|| MissingIdentity {
            candidates: keys.to_vec(),
        })
}

fn resolve_header(names: &[HeaderName], request: &Request) -> Result<Identity, MissingIdentity> {
    names
        .iter()
        .find_map(|name| {
            request.header(name).map(|value| Identity {
                source: SourceKind::Header,
                key: Some(name.as_str().to_string()),
                value: value.to_string(),
            })
        })
        .ok_or_else(|| MissingIdentity {
            candidates: names.iter().map(|n| n.as_str().to_string()).collect(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_addr_identity() {
        let request = Request::get("/api").with_remote_addr("127.0.0.1".parse().unwrap());
        let identity = LimitSource::RemoteAddr.resolve(&request).unwrap();

        assert_eq!(identity.source, SourceKind::RemoteAddr);
        assert_eq!(identity.key, None);
        assert_eq!(identity.value, "127.0.0.1");
        assert_eq!(identity.counter_segment(), "127.0.0.1");
    }

    #[test]
    fn test_remote_addr_unknown() {
        let identity = LimitSource::RemoteAddr.resolve(&Request::get("/")).unwrap();
        assert_eq!(identity.value, "unknown");
    }

    #[test]
    fn test_param_identity_is_qualified() {
        let request = Request::get("/api").with_param("api_key", "123");
        let source = LimitSource::Params(vec!["api_key".to_string()]);
        let identity = source.resolve(&request).unwrap();

        assert_eq!(identity.value, "123");
        assert_eq!(identity.key.as_deref(), Some("api_key"));
        assert_eq!(identity.counter_segment(), "api_key:123");
        assert_eq!(identity.to_string(), "api_key:123");
    }

    #[test]
    fn test_first_present_candidate_wins() {
        let source = LimitSource::Params(vec!["token".to_string(), "api_key".to_string()]);

        let request = Request::get("/").with_param("api_key", "k").with_param("token", "t");
        assert_eq!(source.resolve(&request).unwrap().value, "t");

        let request = Request::get("/").with_param("api_key", "k");
        let identity = source.resolve(&request).unwrap();
        assert_eq!(identity.key.as_deref(), Some("api_key"));
        assert_eq!(identity.value, "k");
    }

    #[test]
    fn test_missing_candidates_fail() {
        let source = LimitSource::Params(vec!["token".to_string(), "api_key".to_string()]);
        let request = Request::get("/").with_remote_addr("10.0.0.1".parse().unwrap());

        let err = source.resolve(&request).unwrap_err();
        assert_eq!(err.candidates, vec!["token", "api_key"]);
        assert_eq!(
            err.to_string(),
            "none of the identity fields [token, api_key] are present"
        );
    }

    #[test]
    fn test_header_identity() {
        let source = LimitSource::Header(vec![HeaderName::from_static("x-api-key")]);
        let request = Request::get("/").with_header("X-Api-Key", "secret");
        let identity = source.resolve(&request).unwrap();

        assert_eq!(identity.source, SourceKind::Header);
        assert_eq!(identity.counter_segment(), "x-api-key:secret");

        assert!(source.resolve(&Request::get("/")).is_err());
    }

    #[test]
    fn test_path_identity() {
        let identity = LimitSource::Path
            .resolve(&Request::get("/reports/daily"))
            .unwrap();
        assert_eq!(identity.source, SourceKind::Path);
        assert_eq!(identity.value, "/reports/daily");
        assert_eq!(LimitSource::Path.kind(), SourceKind::Path);
    }
}
