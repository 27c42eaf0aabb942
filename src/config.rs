//! Configuration management
//!
//! All runtime configuration comes from `AGENTHUB_*` environment variables.
//! Scalar settings are extracted through figment's `Env` provider; the JSON
//! blob variables (`AGENTHUB_API_KEYS_JSON`, `AGENTHUB_OWNER_TENANTS_JSON`,
//! `AGENTHUB_FEDERATION_DOMAIN_TOKENS_JSON`) are parsed during resolution.

use std::collections::BTreeMap;
use std::path::PathBuf;

use figment::{
    Figment,
    providers::Env,
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default owner → allowed-tenants map used when
/// `AGENTHUB_OWNER_TENANTS_JSON` is absent or unusable.
fn default_owner_tenants() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([
        ("owner-platform".to_string(), vec!["*".to_string()]),
        ("owner-dev".to_string(), vec!["*".to_string()]),
        (
            "owner-partner".to_string(),
            vec!["tenant-default".to_string(), "tenant-partner".to_string()],
        ),
    ])
}

/// Access enforcement mode for the request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Violations short-circuit with the stable error envelope.
    Enforce,
    /// Violations append a `Warning` header and let the request proceed.
    Warn,
}

impl AccessMode {
    /// Lowercase label used in reports and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enforce => "enforce",
            Self::Warn => "warn",
        }
    }
}

/// Raw environment view extracted by figment before resolution.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawEnv {
    api_keys_json: Option<String>,
    owner_tenants_json: Option<String>,
    federation_domain_tokens_json: Option<String>,
    access_enforcement_mode: Option<String>,
    request_timeout_seconds: Option<u64>,
    cors_origins: Option<String>,
    rate_limit_default: Option<u32>,
    identity_db_path: Option<String>,
    delegation_db_path: Option<String>,
    idempotency_db_path: Option<String>,
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Opaque API key → owner principal.
    pub api_keys: BTreeMap<String, String>,
    /// Owner → allowed tenant ids (`"*"` = all tenants).
    pub owner_tenants: BTreeMap<String, Vec<String>>,
    /// Federation domain → shared domain token (collaborator contract).
    pub federation_domain_tokens: BTreeMap<String, String>,
    /// Enforcement mode (default enforce).
    pub access_mode: AccessMode,
    /// Request timeout for the cross-cutting 504 middleware.
    pub request_timeout_seconds: u64,
    /// Allowed CORS origins (empty = none).
    pub cors_origins: Vec<String>,
    /// Default rate limit in requests per minute.
    pub rate_limit_per_minute: u32,
    /// Identity-scope SQLite path.
    pub identity_db_path: PathBuf,
    /// Delegation-scope SQLite path.
    pub delegation_db_path: PathBuf,
    /// Idempotency-scope SQLite path.
    pub idempotency_db_path: PathBuf,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the environment cannot be extracted or
    /// when a required JSON variable is present but unusable in enforce mode.
    pub fn load() -> Result<Self> {
        let raw: RawEnv = Figment::new()
            .merge(Env::prefixed("AGENTHUB_"))
            .extract()
            .map_err(|e| Error::Config(format!("environment extraction failed: {e}")))?;
        Self::resolve(raw)
    }

    fn resolve(raw: RawEnv) -> Result<Self> {
        let access_mode = match raw.access_enforcement_mode.as_deref() {
            Some(mode) if mode.trim().eq_ignore_ascii_case("warn") => AccessMode::Warn,
            _ => AccessMode::Enforce,
        };

        let api_keys = parse_string_map(raw.api_keys_json.as_deref()).unwrap_or_default();
        let federation_domain_tokens =
            parse_string_map(raw.federation_domain_tokens_json.as_deref()).unwrap_or_default();

        // Unknown identities fall back to the built-in map; a malformed
        // override must not silently widen tenant access.
        let owner_tenants = parse_owner_tenants(raw.owner_tenants_json.as_deref())
            .unwrap_or_else(default_owner_tenants);

        let cors_origins = raw
            .cors_origins
            .as_deref()
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            api_keys,
            owner_tenants,
            federation_domain_tokens,
            access_mode,
            request_timeout_seconds: raw.request_timeout_seconds.unwrap_or(30),
            cors_origins,
            rate_limit_per_minute: raw.rate_limit_default.unwrap_or(100),
            identity_db_path: raw
                .identity_db_path
                .map_or_else(|| PathBuf::from("data/identity/identity.db"), PathBuf::from),
            delegation_db_path: raw
                .delegation_db_path
                .map_or_else(
                    || PathBuf::from("data/delegations/delegation.db"),
                    PathBuf::from,
                ),
            idempotency_db_path: raw
                .idempotency_db_path
                .map_or_else(
                    || PathBuf::from("data/idempotency/idempotency.db"),
                    PathBuf::from,
                ),
        })
    }

    /// Owner for an opaque API key, if registered.
    #[must_use]
    pub fn owner_for_api_key(&self, api_key: &str) -> Option<&str> {
        self.api_keys.get(api_key).map(String::as_str)
    }

    /// Whether `owner` may act within `tenant_id`.
    ///
    /// Unknown owners are constrained to `tenant-default` unless explicitly
    /// mapped.
    #[must_use]
    pub fn tenant_allowed(&self, owner: &str, tenant_id: &str) -> bool {
        match self.owner_tenants.get(owner) {
            Some(allowed) if !allowed.is_empty() => {
                allowed.iter().any(|t| t == "*" || t == tenant_id)
            }
            _ => tenant_id == "tenant-default",
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(RawEnv::default()).expect("default resolution is infallible")
    }
}

/// Parse a JSON object of string → string, dropping empty keys/values.
fn parse_string_map(raw: Option<&str>) -> Option<BTreeMap<String, String>> {
    let text = raw?.trim();
    if text.is_empty() {
        return None;
    }
    let parsed: serde_json::Value = serde_json::from_str(text).ok()?;
    let object = parsed.as_object()?;
    let mut out = BTreeMap::new();
    for (key, value) in object {
        let key = key.trim();
        let Some(value) = value.as_str().map(str::trim) else {
            continue;
        };
        if !key.is_empty() && !value.is_empty() {
            out.insert(key.to_string(), value.to_string());
        }
    }
    if out.is_empty() { None } else { Some(out) }
}

/// Parse the owner → tenants JSON object, dropping malformed entries.
fn parse_owner_tenants(raw: Option<&str>) -> Option<BTreeMap<String, Vec<String>>> {
    let text = raw?.trim();
    if text.is_empty() {
        return None;
    }
    let parsed: serde_json::Value = serde_json::from_str(text).ok()?;
    let object = parsed.as_object()?;
    let mut out = BTreeMap::new();
    for (owner, tenants) in object {
        let Some(items) = tenants.as_array() else {
            continue;
        };
        let normalized: Vec<String> = items
            .iter()
            .filter_map(|item| item.as_str())
            .map(str::trim)
            .filter(|tenant| !tenant.is_empty())
            .map(ToString::to_string)
            .collect();
        if !normalized.is_empty() {
            out.insert(owner.clone(), normalized);
        }
    }
    if out.is_empty() { None } else { Some(out) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_fail_safe() {
        let config = Config::default();
        assert_eq!(config.access_mode, AccessMode::Enforce);
        assert_eq!(config.request_timeout_seconds, 30);
        assert_eq!(config.rate_limit_per_minute, 100);
        assert!(config.api_keys.is_empty());
        assert!(config.owner_tenants.contains_key("owner-platform"));
    }

    #[test]
    fn load_reads_prefixed_environment() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(
                "AGENTHUB_API_KEYS_JSON",
                r#"{"dev-owner-key": "owner-dev", "partner-owner-key": "owner-partner"}"#,
            );
            jail.set_env("AGENTHUB_ACCESS_ENFORCEMENT_MODE", "warn");
            jail.set_env("AGENTHUB_REQUEST_TIMEOUT_SECONDS", "12");
            jail.set_env("AGENTHUB_CORS_ORIGINS", "https://a.example, https://b.example");
            let config = Config::load().expect("load");
            assert_eq!(config.owner_for_api_key("dev-owner-key"), Some("owner-dev"));
            assert_eq!(config.access_mode, AccessMode::Warn);
            assert_eq!(config.request_timeout_seconds, 12);
            assert_eq!(config.cors_origins.len(), 2);
            Ok(())
        });
    }

    #[test]
    fn malformed_owner_tenants_falls_back_to_defaults() {
        let raw = RawEnv {
            owner_tenants_json: Some("{not-json".to_string()),
            ..RawEnv::default()
        };
        let config = Config::resolve(raw).expect("resolve");
        assert!(config.owner_tenants.contains_key("owner-dev"));
    }

    #[test]
    fn tenant_check_honors_wildcard_and_default() {
        let config = Config::default();
        assert!(config.tenant_allowed("owner-platform", "tenant-anything"));
        assert!(config.tenant_allowed("owner-partner", "tenant-partner"));
        assert!(!config.tenant_allowed("owner-partner", "tenant-other"));
        // Unknown owners are pinned to tenant-default.
        assert!(config.tenant_allowed("owner-unknown", "tenant-default"));
        assert!(!config.tenant_allowed("owner-unknown", "tenant-partner"));
    }

    #[test]
    fn string_map_drops_empty_entries() {
        let parsed = parse_string_map(Some(r#"{"k": "v", " ": "x", "empty": ""}"#))
            .expect("one valid entry");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get("k").map(String::as_str), Some("v"));
    }
}
