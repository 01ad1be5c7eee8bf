//! Global synchronization with the rate authority.
//!
//! Served requests flow out to the authority through a bounded queue and a
//! reconnecting gRPC stream; throttle state flows back in as pushed updates.
//! The cache is seeded once at startup from a bootstrap source.

mod backoff;
mod bootstrap;
mod client;
mod queue;

pub use backoff::Backoff;
pub use bootstrap::{bootstrap_cache, BootstrapSource, JsonFileSource, StaticSource};
pub use client::{AuthInterceptor, GlobalSyncClient};
pub use queue::ServedQueue;
