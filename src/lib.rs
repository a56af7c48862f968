//! Gatekeeper - Request Admission Rate Limiting
//!
//! This crate implements a per-client, per-operation-class fixed-window rate
//! limiter for axum services. Routes declare an operation class through a
//! tower layer; each request is identified, checked against the class policy
//! and either admitted with quota headers or rejected with a 429. Violations
//! are logged and, for known users, written to an audit sink.

pub mod audit;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod ratelimit;
