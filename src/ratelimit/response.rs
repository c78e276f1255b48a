//! Denial responses and rate headers.

use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use serde::Serialize;

use super::rules::{header_name, Rule};
use crate::config::LimitDefaults;
use crate::error::{Result, TurnstileError};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// A status/headers/body triple.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// A 200 response with the given body.
    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Quota and remaining count reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateHeaders {
    pub limit: u64,
    pub remaining: u64,
}

impl RateHeaders {
    pub fn new(limit: u64, count: u64) -> Self {
        Self {
            limit,
            remaining: limit.saturating_sub(count),
        }
    }
}

/// Builds denial responses and annotates admitted ones.
#[derive(Debug, Clone)]
pub struct ResponseComposer {
    limit_header: HeaderName,
    remaining_header: HeaderName,
    default_code: StatusCode,
    default_message: Option<String>,
}

impl ResponseComposer {
    pub fn new(defaults: &LimitDefaults) -> Result<Self> {
        Ok(Self {
            limit_header: header_name(&defaults.limit_header)?,
            remaining_header: header_name(&defaults.remaining_header)?,
            default_code: StatusCode::from_u16(defaults.code).map_err(|_| {
                TurnstileError::Config(format!("invalid default status code {}", defaults.code))
            })?,
            default_message: defaults.message.clone(),
        })
    }

    /// A plain-text error. Without a message the body is the status line,
    /// e.g. `403 Forbidden`.
    pub fn error(status: StatusCode, message: Option<&str>) -> Response {
        let body = match message {
            Some(message) => format!("{}\n", message),
            None => match status.canonical_reason() {
                Some(reason) => format!("{} {}\n", status.as_u16(), reason),
                None => format!("{}\n", status.as_u16()),
            },
        };
        let mut response = Response::new(status, body);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
        response
    }

    /// Rejection for a missing required field or identity.
    pub fn missing(&self, message: &str) -> Response {
        Self::error(StatusCode::FORBIDDEN, Some(message))
    }

    /// Rejection by a rule: denylisted, revoked or over quota.
    pub fn deny(&self, rule: Option<&Rule>, rate: Option<RateHeaders>) -> Response {
        let status = rule.and_then(|r| r.code).unwrap_or(self.default_code);
        let message = rule
            .and_then(|r| r.message.as_deref())
            .or(self.default_message.as_deref());
        let mut response = Self::error(status, message);
        if let Some(rate) = rate {
            self.annotate(&mut response, rate);
        }
        response
    }

    /// Add rate headers without replacing headers the backend already set.
    pub fn annotate(&self, response: &mut Response, rate: RateHeaders) {
        response
            .headers
            .entry(self.limit_header.clone())
            .or_insert_with(|| HeaderValue::from(rate.limit));
        response
            .headers
            .entry(self.remaining_header.clone())
            .or_insert_with(|| HeaderValue::from(rate.remaining));
    }
}
