//! Token scope narrowing — runtime scope reduction without
//! re-authentication.
//!
//! A narrowed token grants a strict subset of its parent's scopes for a
//! bounded TTL. Wildcard parents permit any subset; anything beyond the
//! parent set is an escalation and is refused.

use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::utc_now_epoch;
use crate::identity::WILDCARD_SCOPE;
use crate::{Error, Result};

use super::MAX_RECORDS;

/// A narrowed token.
#[derive(Debug, Clone, Serialize)]
pub struct NarrowedToken {
    /// Token id (`nt-` prefix).
    pub token_id: String,
    /// Token or credential the scopes were narrowed from.
    pub parent_token_id: String,
    /// Requesting agent.
    pub agent_id: String,
    /// Parent scopes at narrowing time.
    pub original_scopes: Vec<String>,
    /// Granted (narrowed) scopes.
    pub narrowed_scopes: Vec<String>,
    /// Scopes dropped by the narrowing.
    pub scopes_removed: Vec<String>,
    /// Caller-supplied reason.
    pub reason: String,
    /// TTL in seconds.
    pub ttl_seconds: i64,
    /// Issuance time (epoch seconds).
    pub issued_at_epoch: i64,
    /// Expiry (epoch seconds).
    pub expires_at_epoch: i64,
    /// Cleared on revocation.
    pub active: bool,
    /// Revocation time, when revoked.
    pub revoked_at_epoch: Option<i64>,
}

/// Validation verdict for a narrowed token.
#[derive(Debug, Clone, Serialize)]
pub struct NarrowedTokenValidation {
    /// Whether the token is usable.
    pub valid: bool,
    /// `not_found`, `revoked`, or `expired` when invalid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    /// Token id, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// Granting agent, when valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Granted scopes, when valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Seconds until expiry, when valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

/// One narrowing-log entry.
#[derive(Debug, Clone, Serialize)]
pub struct NarrowingLogEntry {
    /// Token concerned.
    pub token_id: String,
    /// Parent token.
    pub parent_token_id: String,
    /// Acting agent.
    pub agent_id: String,
    /// `narrow` or `revoke`.
    pub action: &'static str,
    /// Scopes before, on `narrow`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_scopes: Option<Vec<String>>,
    /// Scopes after, on `narrow`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_scopes: Option<Vec<String>>,
    /// Event time (epoch seconds).
    pub timestamp_epoch: i64,
}

/// Registry statistics.
#[derive(Debug, Clone, Serialize)]
pub struct NarrowingStats {
    /// All narrowed tokens.
    pub total_narrowed_tokens: usize,
    /// Active and unexpired tokens.
    pub active_tokens: usize,
    /// Expired tokens.
    pub expired_tokens: usize,
    /// Revoked tokens.
    pub revoked_tokens: usize,
    /// All narrowing events.
    pub total_narrowing_events: usize,
}

/// Scope narrowing registry.
#[derive(Default)]
pub struct ScopeNarrowingRegistry {
    tokens: RwLock<HashMap<String, NarrowedToken>>,
    log: RwLock<VecDeque<NarrowingLogEntry>>,
}

impl ScopeNarrowingRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a narrowed token carrying a subset of `parent_scopes`.
    pub fn narrow(
        &self,
        parent_token_id: &str,
        parent_scopes: &[String],
        requested_scopes: &[String],
        agent_id: &str,
        ttl_seconds: i64,
        reason: &str,
    ) -> Result<NarrowedToken> {
        let parent_set: BTreeSet<&str> = parent_scopes.iter().map(String::as_str).collect();
        let requested_set: BTreeSet<&str> = requested_scopes.iter().map(String::as_str).collect();

        if requested_set.is_empty() {
            return Err(Error::InvalidArgument(
                "requested_scopes must not be empty".to_string(),
            ));
        }
        if !parent_set.contains(WILDCARD_SCOPE) && !requested_set.is_subset(&parent_set) {
            let excess: Vec<&str> = requested_set.difference(&parent_set).copied().collect();
            return Err(Error::InvalidArgument(format!(
                "scope escalation denied: {excess:?} not in parent scopes"
            )));
        }

        let now = utc_now_epoch();
        let token = NarrowedToken {
            token_id: {
                let hex = Uuid::new_v4().simple().to_string();
                format!("nt-{}", &hex[..12])
            },
            parent_token_id: parent_token_id.to_string(),
            agent_id: agent_id.to_string(),
            original_scopes: parent_set.iter().map(ToString::to_string).collect(),
            narrowed_scopes: requested_set.iter().map(ToString::to_string).collect(),
            scopes_removed: parent_set
                .difference(&requested_set)
                .map(ToString::to_string)
                .collect(),
            reason: reason.to_string(),
            ttl_seconds,
            issued_at_epoch: now,
            expires_at_epoch: now + ttl_seconds,
            active: true,
            revoked_at_epoch: None,
        };

        {
            let mut tokens = self.tokens.write();
            tokens.insert(token.token_id.clone(), token.clone());
            if tokens.len() > MAX_RECORDS {
                let excess = tokens.len() - MAX_RECORDS;
                let mut oldest: Vec<(String, i64)> = tokens
                    .iter()
                    .map(|(id, token)| (id.clone(), token.issued_at_epoch))
                    .collect();
                oldest.sort_by_key(|(_, issued)| *issued);
                for (id, _) in oldest.into_iter().take(excess) {
                    tokens.remove(&id);
                }
            }
        }

        self.append_log(NarrowingLogEntry {
            token_id: token.token_id.clone(),
            parent_token_id: parent_token_id.to_string(),
            agent_id: agent_id.to_string(),
            action: "narrow",
            from_scopes: Some(token.original_scopes.clone()),
            to_scopes: Some(token.narrowed_scopes.clone()),
            timestamp_epoch: now,
        });

        Ok(token)
    }

    /// Fetch a narrowed token.
    pub fn get(&self, token_id: &str) -> Result<NarrowedToken> {
        self.tokens
            .read()
            .get(token_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("narrowed token not found: {token_id}")))
    }

    /// List narrowed tokens, newest first, optionally filtered.
    #[must_use]
    pub fn list(
        &self,
        agent_id: Option<&str>,
        parent_token_id: Option<&str>,
        active_only: bool,
        limit: usize,
    ) -> Vec<NarrowedToken> {
        let now = utc_now_epoch();
        let tokens = self.tokens.read();
        let mut results: Vec<NarrowedToken> = tokens
            .values()
            .filter(|token| agent_id.is_none_or(|id| token.agent_id == id))
            .filter(|token| parent_token_id.is_none_or(|id| token.parent_token_id == id))
            .filter(|token| !active_only || (token.active && token.expires_at_epoch >= now))
            .cloned()
            .collect();
        results.sort_by_key(|token| std::cmp::Reverse(token.issued_at_epoch));
        results.truncate(limit);
        results
    }

    /// Validate a narrowed token: present, unrevoked, unexpired.
    #[must_use]
    pub fn validate(&self, token_id: &str) -> NarrowedTokenValidation {
        let tokens = self.tokens.read();
        let Some(token) = tokens.get(token_id) else {
            return NarrowedTokenValidation {
                valid: false,
                reason: Some("not_found"),
                token_id: None,
                agent_id: None,
                scopes: None,
                expires_in: None,
            };
        };

        let now = utc_now_epoch();
        if !token.active {
            return NarrowedTokenValidation {
                valid: false,
                reason: Some("revoked"),
                token_id: Some(token_id.to_string()),
                agent_id: None,
                scopes: None,
                expires_in: None,
            };
        }
        if token.expires_at_epoch < now {
            return NarrowedTokenValidation {
                valid: false,
                reason: Some("expired"),
                token_id: Some(token_id.to_string()),
                agent_id: None,
                scopes: None,
                expires_in: None,
            };
        }

        NarrowedTokenValidation {
            valid: true,
            reason: None,
            token_id: Some(token_id.to_string()),
            agent_id: Some(token.agent_id.clone()),
            scopes: Some(token.narrowed_scopes.clone()),
            expires_in: Some(token.expires_at_epoch - now),
        }
    }

    /// Revoke a narrowed token.
    pub fn revoke(&self, token_id: &str) -> Result<NarrowedToken> {
        let revoked = {
            let mut tokens = self.tokens.write();
            let token = tokens
                .get_mut(token_id)
                .ok_or_else(|| Error::NotFound(format!("narrowed token not found: {token_id}")))?;
            token.active = false;
            token.revoked_at_epoch = Some(utc_now_epoch());
            token.clone()
        };

        self.append_log(NarrowingLogEntry {
            token_id: token_id.to_string(),
            parent_token_id: revoked.parent_token_id.clone(),
            agent_id: revoked.agent_id.clone(),
            action: "revoke",
            from_scopes: None,
            to_scopes: None,
            timestamp_epoch: utc_now_epoch(),
        });
        Ok(revoked)
    }

    /// Narrowing history, newest first, optionally filtered by agent.
    #[must_use]
    pub fn log(&self, agent_id: Option<&str>, limit: usize) -> Vec<NarrowingLogEntry> {
        self.log
            .read()
            .iter()
            .rev()
            .filter(|entry| agent_id.is_none_or(|id| entry.agent_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> NarrowingStats {
        let now = utc_now_epoch();
        let tokens = self.tokens.read();
        NarrowingStats {
            total_narrowed_tokens: tokens.len(),
            active_tokens: tokens
                .values()
                .filter(|token| token.active && token.expires_at_epoch > now)
                .count(),
            expired_tokens: tokens
                .values()
                .filter(|token| token.expires_at_epoch < now)
                .count(),
            revoked_tokens: tokens.values().filter(|token| !token.active).count(),
            total_narrowing_events: self.log.read().len(),
        }
    }

    fn append_log(&self, entry: NarrowingLogEntry) {
        let mut log = self.log.write();
        log.push_back(entry);
        while log.len() > MAX_RECORDS {
            log.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn narrowing_records_removed_scopes() {
        let registry = ScopeNarrowingRegistry::new();
        let token = registry
            .narrow(
                "dtk-parent",
                &scopes(&["read", "write", "admin"]),
                &scopes(&["read"]),
                "agent-a",
                3600,
                "least privilege",
            )
            .expect("narrow");
        assert!(token.token_id.starts_with("nt-"));
        assert_eq!(token.narrowed_scopes, scopes(&["read"]));
        assert_eq!(token.scopes_removed, scopes(&["admin", "write"]));
    }

    #[test]
    fn escalation_is_denied_with_message() {
        let registry = ScopeNarrowingRegistry::new();
        let err = registry
            .narrow(
                "dtk-parent",
                &scopes(&["read"]),
                &scopes(&["read", "write"]),
                "agent-a",
                3600,
                "",
            )
            .expect_err("escalation");
        assert!(err.to_string().contains("escalation"));
    }

    #[test]
    fn wildcard_parent_permits_any_subset() {
        let registry = ScopeNarrowingRegistry::new();
        let token = registry
            .narrow("dtk-parent", &scopes(&["*"]), &scopes(&["anything"]), "agent-a", 60, "")
            .expect("narrow");
        assert_eq!(token.narrowed_scopes, scopes(&["anything"]));
    }

    #[test]
    fn empty_request_is_rejected() {
        let registry = ScopeNarrowingRegistry::new();
        assert!(matches!(
            registry.narrow("dtk-parent", &scopes(&["read"]), &[], "agent-a", 60, ""),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn validation_distinguishes_not_found_revoked_expired() {
        let registry = ScopeNarrowingRegistry::new();
        assert_eq!(registry.validate("nt-missing").reason, Some("not_found"));

        let token = registry
            .narrow("dtk-parent", &scopes(&["read"]), &scopes(&["read"]), "agent-a", 3600, "")
            .expect("narrow");
        let valid = registry.validate(&token.token_id);
        assert!(valid.valid);
        assert!(valid.expires_in.expect("ttl") > 0);

        registry.revoke(&token.token_id).expect("revoke");
        assert_eq!(registry.validate(&token.token_id).reason, Some("revoked"));

        let expired = registry
            .narrow("dtk-parent", &scopes(&["read"]), &scopes(&["read"]), "agent-a", 3600, "")
            .expect("narrow");
        registry
            .tokens
            .write()
            .get_mut(&expired.token_id)
            .expect("present")
            .expires_at_epoch = 0;
        assert_eq!(registry.validate(&expired.token_id).reason, Some("expired"));
    }

    #[test]
    fn log_tracks_narrow_and_revoke_actions() {
        let registry = ScopeNarrowingRegistry::new();
        let token = registry
            .narrow("dtk-parent", &scopes(&["read"]), &scopes(&["read"]), "agent-a", 60, "")
            .expect("narrow");
        registry.revoke(&token.token_id).expect("revoke");

        let log = registry.log(Some("agent-a"), 10);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].action, "revoke");
        assert_eq!(log[1].action, "narrow");
    }

    #[test]
    fn stats_partition_token_states() {
        let registry = ScopeNarrowingRegistry::new();
        let keep = registry
            .narrow("p", &scopes(&["read"]), &scopes(&["read"]), "agent-a", 3600, "")
            .expect("keep");
        let revoke = registry
            .narrow("p", &scopes(&["read"]), &scopes(&["read"]), "agent-a", 3600, "")
            .expect("revoke");
        registry.revoke(&revoke.token_id).expect("revoke");
        let _ = keep;

        let stats = registry.stats();
        assert_eq!(stats.total_narrowed_tokens, 2);
        assert_eq!(stats.active_tokens, 1);
        assert_eq!(stats.revoked_tokens, 1);
        assert_eq!(stats.total_narrowing_events, 3);
    }
}
