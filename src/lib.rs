//! # activity-rs
//!
//! Event-sourced project activity log.
//!
//! Domain events are appended to one stream per project, replayed per
//! project to answer history queries, and fanned out through a persistent
//! subscription to a processor with ack/retry/park semantics.

pub mod api;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod log;
pub mod store;
pub mod telemetry;
