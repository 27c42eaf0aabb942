//! Route handlers grouped by domain.

pub mod auth;
pub mod delegation;
pub mod identity;
pub mod lease;
pub mod reliability;
pub mod runtime;
pub mod system;

/// The full route table, used by the operator route-policy map.
pub const ROUTE_TABLE: &[(&str, &str)] = &[
    ("GET", "/healthz"),
    ("POST", "/v1/auth/tokens"),
    ("POST", "/v1/identity/agents"),
    ("GET", "/v1/identity/agents"),
    ("GET", "/v1/identity/agents/{agent_id}"),
    ("PATCH", "/v1/identity/agents/{agent_id}"),
    ("POST", "/v1/identity/agents/{agent_id}/credentials"),
    ("POST", "/v1/identity/agents/{agent_id}/revoke"),
    ("POST", "/v1/identity/credentials/verify"),
    ("POST", "/v1/identity/credentials/{credential_id}/rotate"),
    ("DELETE", "/v1/identity/credentials/{credential_id}"),
    ("POST", "/v1/identity/delegation-tokens"),
    ("POST", "/v1/identity/delegation-tokens/verify"),
    ("GET", "/v1/identity/delegation-tokens/{token_id}/chain"),
    ("DELETE", "/v1/identity/delegation-tokens/{token_id}"),
    ("POST", "/v1/identity/revocations/bulk"),
    ("GET", "/v1/identity/revocations"),
    ("POST", "/v1/identity/domains"),
    ("GET", "/v1/identity/domains"),
    ("PATCH", "/v1/identity/domains/{domain_id}"),
    ("POST", "/v1/identity/attestations"),
    ("POST", "/v1/identity/attestations/{attestation_id}/verify"),
    ("POST", "/v1/delegations"),
    ("GET", "/v1/delegations/contract"),
    ("GET", "/v1/delegations/metering"),
    ("GET", "/v1/delegations/{delegation_id}/status"),
    ("GET", "/v1/reliability/slo"),
    ("POST", "/v1/leases"),
    ("GET", "/v1/leases/{lease_id}"),
    ("POST", "/v1/leases/{lease_id}/promote"),
    ("GET", "/v1/installs/{install_id}"),
    ("POST", "/v1/installs/{install_id}/rollback"),
    ("POST", "/v1/runtime/quotas"),
    ("GET", "/v1/runtime/quotas"),
    ("GET", "/v1/runtime/quotas/usage"),
    ("GET", "/v1/runtime/quotas/violations"),
    ("GET", "/v1/runtime/quotas/stats"),
    ("POST", "/v1/runtime/quotas/check"),
    ("PATCH", "/v1/runtime/quotas/{quota_id}"),
    ("POST", "/v1/runtime/ip-rules"),
    ("GET", "/v1/runtime/ip-rules"),
    ("GET", "/v1/runtime/ip-rules/log"),
    ("GET", "/v1/runtime/ip-rules/stats"),
    ("POST", "/v1/runtime/ip-rules/check"),
    ("POST", "/v1/runtime/ip-rules/{rule_id}/disable"),
    ("POST", "/v1/runtime/scope-narrowing"),
    ("GET", "/v1/runtime/scope-narrowing"),
    ("GET", "/v1/runtime/scope-narrowing/log"),
    ("GET", "/v1/runtime/scope-narrowing/stats"),
    ("POST", "/v1/runtime/scope-narrowing/validate"),
    ("DELETE", "/v1/runtime/scope-narrowing/{token_id}"),
    ("POST", "/v1/runtime/jit-credentials"),
    ("POST", "/v1/runtime/jit-credentials/{credential_id}/revoke"),
    ("POST", "/v1/runtime/sandboxes/{sandbox_id}/sweep"),
    ("GET", "/v1/system/startup-diagnostics"),
    ("GET", "/v1/system/route-policy"),
];
