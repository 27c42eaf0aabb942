//! Runtime enforcement registries: capability quotas, IP rules, and
//! scope-narrowed tokens. All three are bounded in-process stores checked
//! from the authorization pipeline.

pub mod ip_rules;
pub mod narrowing;
pub mod quotas;

/// Bound applied to every runtime registry; oldest records evict first.
pub(crate) const MAX_RECORDS: usize = 10_000;
