//! Turnstile - Request Admission Engine
//!
//! This crate decides, per incoming request, whether it may reach the
//! protected backend. Requests are matched against an ordered list of
//! rules, a client identity is resolved from the request, and a fixed-window
//! counter in a shared store is consulted. Store failures admit the request.

pub mod config;
pub mod error;
pub mod ratelimit;
