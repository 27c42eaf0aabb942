//! AgentHub AICP — Agent Identity & Authorization Control Plane
//!
//! Issues, attenuates, verifies, and revokes machine credentials for
//! autonomous agents operating under human-principal authority, and
//! enforces every mutating request through a tenant-scoped policy and
//! idempotency pipeline.
//!
//! # Core guarantees
//!
//! - **Delegation chains**: cryptographically-verifiable, bounded depth,
//!   scope attenuation at every edge.
//! - **Cascading revocation**: one kill switch covers credentials,
//!   delegation tokens, and leases atomically.
//! - **At-most-once mutation**: durable idempotency reservations keyed by
//!   `(tenant, actor, method, route, key)`.
//! - **Fail-closed authorization**: API-key identity, bearer-token scopes,
//!   delegation-token chains, tenant scoping, and per-route classification
//!   all combine before any handler runs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod cli;
pub mod clock;
pub mod config;
pub mod delegation;
pub mod diagnostics;
pub mod error;
pub mod idempotency;
pub mod identity;
pub mod lease;
pub mod reliability;
pub mod runtime;
pub mod secrets;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
