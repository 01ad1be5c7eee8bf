//! Tollgate - Distributed Admission Control
//!
//! This crate decides whether an incoming API request should be throttled.
//! Each decision fans out to every deployed throttling rule, collects their
//! verdicts and aggregates them. Throttle state is global: served requests are
//! reported to a central rate authority, which pushes back the keys that must
//! be throttled across the whole cluster.

pub mod config;
pub mod engine;
pub mod error;
pub mod grpc;
pub mod sync;
pub mod throttle;

pub use engine::Throttler;
