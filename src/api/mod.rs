//! HTTP surface: request pipeline middleware, route handlers, and the
//! server assembly.
//!
//! Every request traverses a fixed chain:
//! CORS → rate limiter → request-id → timeout → access policy →
//! idempotency → handler. The access-policy and idempotency stages are the
//! two innermost gates; both must pass before any handler observes the
//! request.

pub mod auth;
pub mod envelope;
pub mod idempotency;
pub mod middleware;
pub mod policy;
pub mod rate_limit;
pub mod routes;
pub mod server;

pub use server::AppState;
