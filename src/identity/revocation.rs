//! Revocation orchestrator — the agent kill switch.
//!
//! `revoke_agent` cascades across credentials, delegation tokens, and leases,
//! then forces the identity into its terminal status. The terminal-status
//! step always executes, even when an earlier step failed, so an agent is
//! never left partially revoked.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Error, Result};

use super::store::IdentityStore;
use super::types::{IdentityStatus, RevocationEvent};

/// Collaborator seam: the lease subsystem revokes leases for a killed agent.
pub trait LeaseRevoker: Send + Sync {
    /// Revoke every active lease owned by `agent_id`; returns the count.
    fn revoke_leases_for_agent(&self, agent_id: &str, reason: &str) -> usize;
}

/// Outcome of a single-agent kill switch run.
#[derive(Debug, Clone, Serialize)]
pub struct RevocationSummary {
    /// Audit event id.
    pub event_id: String,
    /// Revoked agent.
    pub agent_id: String,
    /// Credentials revoked.
    pub revoked_credentials: usize,
    /// Delegation tokens revoked (issuer or subject edges, with cascades).
    pub revoked_tokens: usize,
    /// Leases revoked via the collaborator.
    pub revoked_leases: usize,
    /// Reason recorded on every cascaded record.
    pub reason: String,
}

/// Per-agent result in a bulk revocation run.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BulkRevokeOutcome {
    /// Revocation completed for the agent.
    Revoked(RevocationSummary),
    /// Revocation failed for the agent.
    Failed {
        /// Agent the failure concerns.
        agent_id: String,
        /// Failure description.
        error: String,
    },
}

/// Aggregate result of a bulk revocation run.
#[derive(Debug, Clone, Serialize)]
pub struct BulkRevocation {
    /// Number of agents requested.
    pub total_requested: usize,
    /// Number successfully revoked.
    pub total_revoked: usize,
    /// Per-agent outcomes in request order.
    pub results: Vec<BulkRevokeOutcome>,
}

/// The revocation orchestrator.
pub struct RevocationOrchestrator {
    store: Arc<IdentityStore>,
    lease_revoker: Option<Arc<dyn LeaseRevoker>>,
}

impl RevocationOrchestrator {
    /// Create an orchestrator without a lease collaborator.
    #[must_use]
    pub fn new(store: Arc<IdentityStore>) -> Self {
        Self {
            store,
            lease_revoker: None,
        }
    }

    /// Attach the lease collaborator.
    #[must_use]
    pub fn with_lease_revoker(mut self, revoker: Arc<dyn LeaseRevoker>) -> Self {
        self.lease_revoker = Some(revoker);
        self
    }

    /// Kill switch: revoke an agent identity plus all credentials,
    /// delegation tokens, and leases.
    ///
    /// Steps 2–4 are each idempotent; a failure in any of them is deferred
    /// until after the identity has been forced to `revoked` and the audit
    /// event appended.
    pub fn revoke_agent(
        &self,
        agent_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<RevocationSummary> {
        let identity = self.store.get_identity(agent_id)?;
        if identity.owner != actor {
            return Err(Error::PermissionDenied("owner mismatch".to_string()));
        }

        let mut deferred: Option<Error> = None;

        let revoked_credentials = match self.store.revoke_all_credentials(agent_id, reason) {
            Ok(count) => count,
            Err(err) => {
                warn!(agent_id, error = %err, "Credential cascade failed; continuing to terminal status");
                deferred.get_or_insert(err);
                0
            }
        };

        let revoked_tokens = match self.store.revoke_tokens_for_agent(agent_id) {
            Ok(count) => count,
            Err(err) => {
                warn!(agent_id, error = %err, "Token cascade failed; continuing to terminal status");
                deferred.get_or_insert(err);
                0
            }
        };

        let revoked_leases = self
            .lease_revoker
            .as_ref()
            .map_or(0, |revoker| revoker.revoke_leases_for_agent(agent_id, reason));

        // Terminal status must land regardless of partial failure above.
        self.store
            .update_identity_status(agent_id, IdentityStatus::Revoked)?;

        let cascade_count = revoked_credentials + revoked_tokens + revoked_leases;
        let event_id = {
            let hex = Uuid::new_v4().simple().to_string();
            format!("rev-{}", &hex[..16])
        };
        self.store.insert_revocation_event(&RevocationEvent {
            event_id: event_id.clone(),
            revoked_type: "agent_identity".to_string(),
            revoked_id: agent_id.to_string(),
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
            actor: actor.to_string(),
            cascade_count: cascade_count as i64,
            created_at: String::new(),
        })?;

        if let Some(err) = deferred {
            return Err(err);
        }

        info!(agent_id, actor, cascade_count, "Agent revoked");
        Ok(RevocationSummary {
            event_id,
            agent_id: agent_id.to_string(),
            revoked_credentials,
            revoked_tokens,
            revoked_leases,
            reason: reason.to_string(),
        })
    }

    /// Bulk kill switch for security incidents. Per-agent failures are
    /// recorded without aborting the run.
    pub fn bulk_revoke(&self, agent_ids: &[String], actor: &str, reason: &str) -> BulkRevocation {
        let mut results = Vec::with_capacity(agent_ids.len());
        let mut total_revoked = 0usize;
        for agent_id in agent_ids {
            match self.revoke_agent(agent_id, actor, reason) {
                Ok(summary) => {
                    total_revoked += 1;
                    results.push(BulkRevokeOutcome::Revoked(summary));
                }
                Err(err) => results.push(BulkRevokeOutcome::Failed {
                    agent_id: agent_id.clone(),
                    error: err.to_string(),
                }),
            }
        }
        BulkRevocation {
            total_requested: agent_ids.len(),
            total_revoked,
            results,
        }
    }

    /// List revocation events, newest first.
    pub fn list_events(
        &self,
        agent_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RevocationEvent>> {
        self.store.list_revocation_events(agent_id, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::store::{NewCredential, NewDelegationToken, NewIdentity};

    struct CountingRevoker;

    impl LeaseRevoker for CountingRevoker {
        fn revoke_leases_for_agent(&self, _agent_id: &str, _reason: &str) -> usize {
            2
        }
    }

    fn store_with_agent(agent_id: &str) -> Arc<IdentityStore> {
        let store = Arc::new(IdentityStore::open_in_memory().expect("open"));
        store
            .register_identity(&NewIdentity {
                agent_id: agent_id.to_string(),
                owner: "owner-dev".to_string(),
                ..NewIdentity::default()
            })
            .expect("register");
        store
    }

    #[test]
    fn kill_switch_cascades_and_terminates_identity() {
        let store = store_with_agent("agent-a");
        store
            .insert_credential(&NewCredential {
                credential_id: "cred-1".to_string(),
                agent_id: "agent-a".to_string(),
                credential_hash: "h1".to_string(),
                scopes: vec!["read".to_string()],
                issued_at_epoch: 0,
                expires_at_epoch: i64::MAX,
                rotation_parent_id: None,
            })
            .expect("credential");
        store
            .insert_token(&NewDelegationToken {
                token_id: "dtk-1".to_string(),
                issuer_agent_id: "agent-a".to_string(),
                subject_agent_id: "agent-b".to_string(),
                delegated_scopes: vec!["read".to_string()],
                issued_at_epoch: 0,
                expires_at_epoch: i64::MAX,
                parent_token_id: None,
                chain_depth: 0,
            })
            .expect("token");

        let orchestrator = RevocationOrchestrator::new(Arc::clone(&store))
            .with_lease_revoker(Arc::new(CountingRevoker));
        let summary = orchestrator
            .revoke_agent("agent-a", "owner-dev", "security_incident")
            .expect("revoke");

        assert_eq!(summary.revoked_credentials, 1);
        assert_eq!(summary.revoked_tokens, 1);
        assert_eq!(summary.revoked_leases, 2);

        let identity = store.get_identity("agent-a").expect("identity");
        assert_eq!(identity.status, IdentityStatus::Revoked);

        let events = orchestrator.list_events(Some("agent-a"), 10).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cascade_count, 4);
    }

    #[test]
    fn revoke_requires_owner() {
        let store = store_with_agent("agent-a");
        let orchestrator = RevocationOrchestrator::new(store);
        let err = orchestrator
            .revoke_agent("agent-a", "owner-partner", "nope")
            .expect_err("owner mismatch");
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn revoke_is_idempotent_on_already_revoked_agent() {
        let store = store_with_agent("agent-a");
        let orchestrator = RevocationOrchestrator::new(store);
        orchestrator
            .revoke_agent("agent-a", "owner-dev", "first")
            .expect("first");
        // Second run finds nothing left to cascade but still succeeds.
        let second = orchestrator
            .revoke_agent("agent-a", "owner-dev", "second")
            .expect("second");
        assert_eq!(second.revoked_credentials, 0);
        assert_eq!(second.revoked_tokens, 0);
    }

    #[test]
    fn bulk_revoke_records_per_agent_outcomes() {
        let store = store_with_agent("agent-a");
        let orchestrator = RevocationOrchestrator::new(store);
        let outcome = orchestrator.bulk_revoke(
            &["agent-a".to_string(), "agent-missing".to_string()],
            "owner-dev",
            "incident",
        );
        assert_eq!(outcome.total_requested, 2);
        assert_eq!(outcome.total_revoked, 1);
        assert!(matches!(outcome.results[0], BulkRevokeOutcome::Revoked(_)));
        assert!(matches!(outcome.results[1], BulkRevokeOutcome::Failed { .. }));
    }
}
