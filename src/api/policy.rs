//! Route access policy: classification, idempotency requirement, and the
//! access evaluation that combines them with the resolved owner and tenant.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::config::Config;

/// Access classification of a `(method, path)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// No authentication required.
    Public,
    /// Any resolved owner suffices.
    Authenticated,
    /// Owner must be allowed for the request tenant.
    TenantScoped,
    /// Owner must hold the admin role.
    AdminScoped,
}

impl Classification {
    /// Lowercase label used in the route policy map.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Authenticated => "authenticated",
            Self::TenantScoped => "tenant_scoped",
            Self::AdminScoped => "admin_scoped",
        }
    }
}

/// Owners holding the admin role.
pub const ADMIN_OWNERS: &[&str] = &["owner-dev", "owner-platform"];

/// Exact-match public endpoints.
const PUBLIC_ROUTES: &[(&str, &str)] = &[("GET", "/healthz")];

static TENANT_SCOPED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^/v1/identity/agents$",
        r"^/v1/identity/agents/[^/]+$",
        r"^/v1/delegations/[^/]+/status$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static route pattern"))
    .collect()
});

static ADMIN_SCOPED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^/v1/system/startup-diagnostics$",
        r"^/v1/system/route-policy$",
        r"^/v1/identity/revocations/bulk$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static route pattern"))
    .collect()
});

// Endpoints with local write semantics where idempotency is intentionally
// optional. Delegation keeps its own durable reservation contract.
static IDEMPOTENCY_OPTIONAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^/v1/auth/tokens$",
        r"^/v1/delegations$",
        r"^/v1/identity/credentials/verify$",
        r"^/v1/identity/delegation-tokens/verify$",
        r"^/v1/identity/attestations/[^/]+/verify$",
        r"^/v1/runtime/quotas/check$",
        r"^/v1/runtime/ip-rules/check$",
        r"^/v1/runtime/scope-narrowing/validate$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static route pattern"))
    .collect()
});

/// Classify a route. Pure: exact public table, then admin patterns, then
/// tenant patterns, then `/v1/*` → authenticated, else public.
#[must_use]
pub fn classify_route(method: &str, path: &str) -> Classification {
    let method = method.to_ascii_uppercase();
    if PUBLIC_ROUTES
        .iter()
        .any(|(m, p)| *m == method && *p == path)
    {
        return Classification::Public;
    }
    if ADMIN_SCOPED_PATTERNS.iter().any(|p| p.is_match(path)) {
        return Classification::AdminScoped;
    }
    if TENANT_SCOPED_PATTERNS.iter().any(|p| p.is_match(path)) {
        return Classification::TenantScoped;
    }
    if path.starts_with("/v1/") {
        return Classification::Authenticated;
    }
    Classification::Public
}

/// Whether a route requires an idempotency key: mutating methods on `/v1/*`
/// minus the explicit opt-out list.
#[must_use]
pub fn requires_idempotency(method: &str, path: &str) -> bool {
    let method = method.to_ascii_uppercase();
    if !matches!(method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE") {
        return false;
    }
    if !path.starts_with("/v1/") {
        return false;
    }
    !IDEMPOTENCY_OPTIONAL_PATTERNS.iter().any(|p| p.is_match(path))
}

/// An access violation with its stable envelope code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessViolation {
    /// Stable envelope code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: &'static str,
}

/// Evaluate access for a classified route against the resolved owner and
/// the request tenant. `None` means the request may proceed.
#[must_use]
pub fn evaluate_access(
    config: &Config,
    classification: Classification,
    owner: Option<&str>,
    tenant_id: &str,
) -> Option<AccessViolation> {
    if classification == Classification::Public {
        return None;
    }
    let Some(owner) = owner else {
        return Some(AccessViolation {
            code: "auth.required",
            message: "authentication required",
        });
    };
    if classification == Classification::AdminScoped && !ADMIN_OWNERS.contains(&owner) {
        return Some(AccessViolation {
            code: "auth.admin_required",
            message: "admin role required",
        });
    }
    if classification == Classification::TenantScoped && !config.tenant_allowed(owner, tenant_id) {
        return Some(AccessViolation {
            code: "tenant.forbidden",
            message: "owner is not allowed for tenant scope",
        });
    }
    None
}

/// Resolve the effective tenant from the `X-Tenant-ID` header value.
#[must_use]
pub fn resolve_tenant_id(header: Option<&str>) -> String {
    header
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("tenant-default")
        .to_string()
}

/// One row of the operator route-policy map.
#[derive(Debug, Clone, Serialize)]
pub struct RoutePolicyRow {
    /// HTTP method.
    pub method: &'static str,
    /// Route path (axum template form).
    pub path: &'static str,
    /// Access classification.
    pub classification: &'static str,
    /// Whether an idempotency key is required.
    pub requires_idempotency: bool,
}

/// Enumerate the classification and idempotency requirement per route.
#[must_use]
pub fn route_policy_map(routes: &[(&'static str, &'static str)]) -> Vec<RoutePolicyRow> {
    let mut rows: Vec<RoutePolicyRow> = routes
        .iter()
        .map(|(method, path)| RoutePolicyRow {
            method,
            path,
            classification: classify_route(method, path).as_str(),
            requires_idempotency: requires_idempotency(method, path),
        })
        .collect();
    rows.sort_by(|a, b| (a.path, a.method).cmp(&(b.path, b.method)));
    rows
}
