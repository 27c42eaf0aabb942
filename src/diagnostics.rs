//! Startup diagnostics: environment checks and filesystem probes.
//!
//! A pure function over an environment snapshot plus filesystem probes
//! produces a structured readiness report. In enforce mode a critical check
//! failure refuses startup; the same report backs the admin diagnostics
//! endpoint and the `check-readiness` CLI probe.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::clock::utc_now_iso;
use crate::config::AccessMode;

/// Environment variables required in enforce mode.
pub const REQUIRED_ENV_VARS: &[&str] = &[
    "AGENTHUB_API_KEYS_JSON",
    "AGENTHUB_AUTH_TOKEN_SECRET",
    "AGENTHUB_IDENTITY_SIGNING_SECRET",
    "AGENTHUB_PROVENANCE_SIGNING_SECRET",
    "AGENTHUB_POLICY_SIGNING_SECRET",
    "AGENTHUB_FEDERATION_DOMAIN_TOKENS_JSON",
];

/// Data-path variables probed for a writable nearest-parent.
pub const PATH_PROBES: &[&str] = &[
    "AGENTHUB_IDENTITY_DB_PATH",
    "AGENTHUB_DELEGATION_DB_PATH",
    "AGENTHUB_IDEMPOTENCY_DB_PATH",
];

/// One environment-variable check.
#[derive(Debug, Clone, Serialize)]
pub struct EnvCheck {
    /// Subsystem the variable belongs to.
    pub component: &'static str,
    /// Variable name.
    pub env_var: &'static str,
    /// Variable is set at all.
    pub present: bool,
    /// Variable is set and structurally valid.
    pub valid: bool,
    /// Failure description or `ok`.
    pub message: String,
    /// `critical` when invalid, `info` otherwise.
    pub severity: &'static str,
}

/// One filesystem probe.
#[derive(Debug, Clone, Serialize)]
pub struct PathProbe {
    /// Variable probed.
    pub probe: &'static str,
    /// Variable is configured.
    pub configured: bool,
    /// Configured path, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// `pass`, `fail`, or `skipped`.
    pub status: &'static str,
    /// Failure description or `ok`.
    pub message: String,
    /// `high` on failure, `info` on pass, `low` when skipped.
    pub severity: &'static str,
}

/// Summary block of the report.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSummary {
    /// Failed env checks.
    pub check_failures: usize,
    /// Failed path probes.
    pub probe_failures: usize,
    /// Startup ready and all probes passing.
    pub overall_ready: bool,
    /// Counts per severity label.
    pub severity_counts: BTreeMap<&'static str, usize>,
}

/// The full readiness report.
#[derive(Debug, Clone, Serialize)]
pub struct StartupDiagnostics {
    /// RFC 3339 generation timestamp.
    pub generated_at: String,
    /// Enforcement mode in force.
    pub access_enforcement_mode: &'static str,
    /// Required variables considered.
    pub required_env_vars: Vec<&'static str>,
    /// Env checks in order.
    pub checks: Vec<EnvCheck>,
    /// All critical env checks passed.
    pub startup_ready: bool,
    /// Path probes in order.
    pub probes: Vec<PathProbe>,
    /// Probe names that failed.
    pub probe_failures: Vec<&'static str>,
    /// `startup_ready` and no probe failures.
    pub overall_ready: bool,
    /// Summary block.
    pub summary: DiagnosticsSummary,
    /// Env vars that are missing or invalid.
    pub missing_or_invalid: Vec<&'static str>,
}

fn check_non_empty(
    env: &BTreeMap<String, String>,
    component: &'static str,
    key: &'static str,
) -> EnvCheck {
    let raw = env.get(key);
    let present = raw.is_some();
    let valid = raw.is_some_and(|value| !value.trim().is_empty());
    EnvCheck {
        component,
        env_var: key,
        present,
        valid,
        message: if valid {
            "ok".to_string()
        } else {
            "missing required environment variable".to_string()
        },
        severity: if valid { "info" } else { "critical" },
    }
}

fn check_non_empty_json_object(
    env: &BTreeMap<String, String>,
    component: &'static str,
    key: &'static str,
) -> EnvCheck {
    let finish = |present, valid, message: &str| EnvCheck {
        component,
        env_var: key,
        present,
        valid,
        message: message.to_string(),
        severity: if valid { "info" } else { "critical" },
    };

    let Some(raw) = env.get(key) else {
        return finish(false, false, "missing required environment variable");
    };
    let text = raw.trim();
    if text.is_empty() {
        return finish(true, false, "environment variable must not be empty");
    }
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(text) else {
        return finish(true, false, "environment variable must be valid JSON");
    };
    let Some(object) = parsed.as_object() else {
        return finish(true, false, "environment variable must be a JSON object");
    };
    let has_usable_entry = object.iter().any(|(name, value)| {
        !name.trim().is_empty()
            && value
                .as_str()
                .is_some_and(|text| !text.trim().is_empty())
    });
    if !has_usable_entry {
        return finish(
            true,
            false,
            "environment variable must define at least one non-empty key/value",
        );
    }
    finish(true, true, "ok")
}

fn nearest_existing_parent(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();
    while !current.exists() {
        match current.parent() {
            Some(parent) if parent != current => current = parent.to_path_buf(),
            _ => break,
        }
    }
    current
}

fn path_probe(env: &BTreeMap<String, String>, key: &'static str) -> PathProbe {
    let Some(raw) = env.get(key).map(|value| value.trim()).filter(|v| !v.is_empty()) else {
        return PathProbe {
            probe: key,
            configured: false,
            path: None,
            status: "skipped",
            message: "environment variable not configured".to_string(),
            severity: "low",
        };
    };

    let path = PathBuf::from(raw);
    let parent = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let check_target = if parent.exists() {
        parent
    } else {
        nearest_existing_parent(&parent)
    };

    let fail = |message: String| PathProbe {
        probe: key,
        configured: true,
        path: Some(path.display().to_string()),
        status: "fail",
        message,
        severity: "high",
    };

    if !check_target.exists() {
        return fail("no existing parent path found for probe".to_string());
    }
    if !check_target.is_dir() {
        return fail(format!(
            "probe parent is not a directory: {}",
            check_target.display()
        ));
    }

    let writable = !std::fs::metadata(&check_target)
        .map(|meta| meta.permissions().readonly())
        .unwrap_or(true);
    if writable {
        PathProbe {
            probe: key,
            configured: true,
            path: Some(path.display().to_string()),
            status: "pass",
            message: "ok".to_string(),
            severity: "info",
        }
    } else {
        fail(format!(
            "probe parent is not writable: {}",
            check_target.display()
        ))
    }
}

/// Build the full readiness report from an environment snapshot.
#[must_use]
pub fn build_startup_diagnostics(
    env: &BTreeMap<String, String>,
    access_mode: AccessMode,
) -> StartupDiagnostics {
    let checks = vec![
        check_non_empty_json_object(env, "auth", "AGENTHUB_API_KEYS_JSON"),
        check_non_empty(env, "auth", "AGENTHUB_AUTH_TOKEN_SECRET"),
        check_non_empty(env, "identity", "AGENTHUB_IDENTITY_SIGNING_SECRET"),
        check_non_empty(env, "provenance", "AGENTHUB_PROVENANCE_SIGNING_SECRET"),
        check_non_empty(env, "policy", "AGENTHUB_POLICY_SIGNING_SECRET"),
        check_non_empty_json_object(env, "federation", "AGENTHUB_FEDERATION_DOMAIN_TOKENS_JSON"),
    ];
    let probes: Vec<PathProbe> = PATH_PROBES.iter().map(|key| path_probe(env, key)).collect();

    let missing_or_invalid: Vec<&'static str> = checks
        .iter()
        .filter(|check| !check.valid)
        .map(|check| check.env_var)
        .collect();
    let probe_failures: Vec<&'static str> = probes
        .iter()
        .filter(|probe| probe.status == "fail")
        .map(|probe| probe.probe)
        .collect();

    let startup_ready = missing_or_invalid.is_empty();
    let overall_ready = startup_ready && probe_failures.is_empty();

    let mut severity_counts: BTreeMap<&'static str, usize> =
        BTreeMap::from([("critical", 0), ("high", 0), ("low", 0), ("info", 0)]);
    for severity in checks
        .iter()
        .map(|check| check.severity)
        .chain(probes.iter().map(|probe| probe.severity))
    {
        *severity_counts.entry(severity).or_insert(0) += 1;
    }

    StartupDiagnostics {
        generated_at: utc_now_iso(),
        access_enforcement_mode: access_mode.as_str(),
        required_env_vars: REQUIRED_ENV_VARS.to_vec(),
        summary: DiagnosticsSummary {
            check_failures: missing_or_invalid.len(),
            probe_failures: probe_failures.len(),
            overall_ready,
            severity_counts,
        },
        checks,
        startup_ready,
        probes,
        probe_failures,
        overall_ready,
        missing_or_invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_env() -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "AGENTHUB_API_KEYS_JSON".to_string(),
                r#"{"dev-owner-key": "owner-dev"}"#.to_string(),
            ),
            ("AGENTHUB_AUTH_TOKEN_SECRET".to_string(), "secret".to_string()),
            (
                "AGENTHUB_IDENTITY_SIGNING_SECRET".to_string(),
                "secret".to_string(),
            ),
            (
                "AGENTHUB_PROVENANCE_SIGNING_SECRET".to_string(),
                "secret".to_string(),
            ),
            (
                "AGENTHUB_POLICY_SIGNING_SECRET".to_string(),
                "secret".to_string(),
            ),
            (
                "AGENTHUB_FEDERATION_DOMAIN_TOKENS_JSON".to_string(),
                r#"{"partner.example": "token"}"#.to_string(),
            ),
        ])
    }

    #[test]
    fn complete_environment_is_startup_ready() {
        let report = build_startup_diagnostics(&complete_env(), AccessMode::Enforce);
        assert!(report.startup_ready);
        assert!(report.overall_ready);
        assert!(report.missing_or_invalid.is_empty());
        assert_eq!(report.access_enforcement_mode, "enforce");
        assert_eq!(report.summary.check_failures, 0);
    }

    #[test]
    fn malformed_json_is_critical_and_blocks_startup() {
        let mut env = complete_env();
        env.insert("AGENTHUB_API_KEYS_JSON".to_string(), "{bad-json".to_string());
        let report = build_startup_diagnostics(&env, AccessMode::Enforce);

        let check = report
            .checks
            .iter()
            .find(|check| check.env_var == "AGENTHUB_API_KEYS_JSON")
            .expect("check present");
        assert!(check.present);
        assert!(!check.valid);
        assert_eq!(check.severity, "critical");
        assert!(!report.startup_ready);
        assert_eq!(report.missing_or_invalid, vec!["AGENTHUB_API_KEYS_JSON"]);
    }

    #[test]
    fn non_object_json_is_invalid() {
        let mut env = complete_env();
        env.insert(
            "AGENTHUB_FEDERATION_DOMAIN_TOKENS_JSON".to_string(),
            "[1, 2]".to_string(),
        );
        let report = build_startup_diagnostics(&env, AccessMode::Enforce);
        assert!(!report.startup_ready);
    }

    #[test]
    fn missing_secret_blocks_startup() {
        let mut env = complete_env();
        env.remove("AGENTHUB_POLICY_SIGNING_SECRET");
        let report = build_startup_diagnostics(&env, AccessMode::Enforce);
        assert!(!report.startup_ready);
        assert!(report
            .missing_or_invalid
            .contains(&"AGENTHUB_POLICY_SIGNING_SECRET"));
    }

    #[test]
    fn unconfigured_paths_are_skipped_not_failed() {
        let report = build_startup_diagnostics(&complete_env(), AccessMode::Enforce);
        assert!(report.probes.iter().all(|probe| probe.status == "skipped"));
        assert!(report.probe_failures.is_empty());
    }

    #[test]
    fn writable_tempdir_passes_the_probe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut env = complete_env();
        env.insert(
            "AGENTHUB_IDENTITY_DB_PATH".to_string(),
            dir.path().join("identity.db").display().to_string(),
        );
        let report = build_startup_diagnostics(&env, AccessMode::Enforce);
        let probe = report
            .probes
            .iter()
            .find(|probe| probe.probe == "AGENTHUB_IDENTITY_DB_PATH")
            .expect("probe present");
        assert_eq!(probe.status, "pass");
        assert!(report.overall_ready);
    }

    #[test]
    fn nested_missing_parent_probes_nearest_existing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut env = complete_env();
        env.insert(
            "AGENTHUB_DELEGATION_DB_PATH".to_string(),
            dir.path()
                .join("not/yet/created/delegation.db")
                .display()
                .to_string(),
        );
        let report = build_startup_diagnostics(&env, AccessMode::Enforce);
        let probe = report
            .probes
            .iter()
            .find(|probe| probe.probe == "AGENTHUB_DELEGATION_DB_PATH")
            .expect("probe present");
        // The tempdir itself is the nearest existing, writable parent.
        assert_eq!(probe.status, "pass");
    }
}
