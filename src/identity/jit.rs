//! JIT credential binding — issue on sandbox provision, revoke on terminate.
//!
//! JIT credentials are scoped to a sandbox lifecycle: the credential id
//! embeds the sandbox id (`jit-<sandbox>-<nonce>`) so a terminating sandbox
//! can sweep everything it issued by prefix.

use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::clock::utc_now_epoch;
use crate::{Error, Result};

use super::store::{IdentityStore, NewCredential};
use super::types::{AgentCredential, CredentialStatus};
use super::{MAX_CREDENTIAL_TTL_SECONDS, normalize_scopes};

/// Default JIT credential TTL: one hour.
pub const DEFAULT_JIT_TTL_SECONDS: i64 = 3_600;

/// Default scopes for JIT credentials.
pub const DEFAULT_JIT_SCOPES: &[&str] = &["runtime.execute", "read"];

/// Issued JIT credential metadata.
#[derive(Debug, Clone, Serialize)]
pub struct JitCredential {
    /// Credential id (`jit-<sandbox>-<nonce>`).
    pub credential_id: String,
    /// Bound agent.
    pub agent_id: String,
    /// Bound sandbox.
    pub sandbox_id: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Issuance time (epoch seconds).
    pub issued_at_epoch: i64,
    /// Expiry (epoch seconds).
    pub expires_at_epoch: i64,
    /// Owner of the bound agent.
    pub owner: String,
}

/// Result of sweeping a terminated sandbox's credentials.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxSweep {
    /// Agent swept.
    pub agent_id: String,
    /// Sandbox swept.
    pub sandbox_id: String,
    /// Credentials revoked by the sweep.
    pub revoked_count: usize,
}

/// JIT credential service over the identity store.
pub struct JitCredentialService {
    store: Arc<IdentityStore>,
}

impl JitCredentialService {
    /// Create a service handle.
    #[must_use]
    pub fn new(store: Arc<IdentityStore>) -> Self {
        Self { store }
    }

    /// Issue a JIT credential bound to `sandbox_id`.
    pub fn issue(
        &self,
        agent_id: &str,
        sandbox_id: &str,
        scopes: Option<&[String]>,
        ttl_seconds: i64,
    ) -> Result<JitCredential> {
        let identity = self.store.get_identity(agent_id)?;

        let now = utc_now_epoch();
        let ttl = ttl_seconds.min(MAX_CREDENTIAL_TTL_SECONDS);
        let nonce = {
            let hex = Uuid::new_v4().simple().to_string();
            hex[..8].to_string()
        };
        let credential_id = format!("jit-{sandbox_id}-{nonce}");
        let effective_scopes = match scopes {
            Some(scopes) => normalize_scopes(scopes),
            None => DEFAULT_JIT_SCOPES.iter().map(ToString::to_string).collect(),
        };

        // The hash binds credential, sandbox, and agent for traceability;
        // JIT credentials authenticate by id + sandbox, not by bearer secret.
        let binding = format!("{credential_id}|{sandbox_id}|{agent_id}|{now}");
        let credential_hash = hex::encode(Sha256::digest(binding.as_bytes()));

        self.store.insert_credential(&NewCredential {
            credential_id: credential_id.clone(),
            agent_id: agent_id.to_string(),
            credential_hash,
            scopes: effective_scopes.clone(),
            issued_at_epoch: now,
            expires_at_epoch: now + ttl,
            rotation_parent_id: None,
        })?;

        info!(credential_id, agent_id, sandbox_id, ttl, "JIT credential issued");
        Ok(JitCredential {
            credential_id,
            agent_id: agent_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            scopes: effective_scopes,
            issued_at_epoch: now,
            expires_at_epoch: now + ttl,
            owner: identity.owner,
        })
    }

    /// Revoke a JIT credential when its sandbox terminates. Idempotent:
    /// an already-inactive credential is returned unchanged.
    pub fn revoke(
        &self,
        credential_id: &str,
        sandbox_id: &str,
        reason: &str,
    ) -> Result<AgentCredential> {
        match self.store.update_credential_status_if_active(
            credential_id,
            CredentialStatus::Revoked,
            Some(&format!("jit:{reason}:sandbox={sandbox_id}")),
        ) {
            Ok(credential) => {
                info!(credential_id, sandbox_id, reason, "JIT credential revoked");
                Ok(credential)
            }
            Err(Error::Conflict(_)) => {
                info!(credential_id, sandbox_id, "JIT credential already inactive");
                self.store.get_credential(credential_id)
            }
            Err(err) => Err(err),
        }
    }

    /// Revoke every active JIT credential bound to `sandbox_id` for
    /// `agent_id` by credential-id prefix scan.
    pub fn revoke_all_for_sandbox(&self, agent_id: &str, sandbox_id: &str) -> Result<SandboxSweep> {
        let prefix = format!("jit-{sandbox_id}-");
        let active = self.store.list_active_credentials(agent_id)?;
        let mut revoked_count = 0usize;

        for credential in active {
            if !credential.credential_id.starts_with(&prefix) {
                continue;
            }
            match self.store.update_credential_status_if_active(
                &credential.credential_id,
                CredentialStatus::Revoked,
                Some(&format!("jit:sandbox_terminated:sandbox={sandbox_id}")),
            ) {
                Ok(_) => revoked_count += 1,
                Err(Error::Conflict(_)) => {}
                Err(err) => return Err(err),
            }
        }

        info!(agent_id, sandbox_id, revoked_count, "Swept sandbox JIT credentials");
        Ok(SandboxSweep {
            agent_id: agent_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            revoked_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::store::NewIdentity;

    fn service() -> JitCredentialService {
        let store = Arc::new(IdentityStore::open_in_memory().expect("open"));
        store
            .register_identity(&NewIdentity {
                agent_id: "agent-a".to_string(),
                owner: "owner-dev".to_string(),
                ..NewIdentity::default()
            })
            .expect("register");
        JitCredentialService::new(store)
    }

    #[test]
    fn issued_credential_embeds_sandbox_id() {
        let service = service();
        let jit = service
            .issue("agent-a", "sbx-42", None, DEFAULT_JIT_TTL_SECONDS)
            .expect("issue");
        assert!(jit.credential_id.starts_with("jit-sbx-42-"));
        let expected: Vec<String> = DEFAULT_JIT_SCOPES.iter().map(ToString::to_string).collect();
        assert_eq!(jit.scopes, expected);
        assert_eq!(jit.owner, "owner-dev");
    }

    #[test]
    fn revoke_is_idempotent() {
        let service = service();
        let jit = service
            .issue("agent-a", "sbx-42", None, DEFAULT_JIT_TTL_SECONDS)
            .expect("issue");

        let first = service
            .revoke(&jit.credential_id, "sbx-42", "sandbox_terminated")
            .expect("first revoke");
        assert_eq!(first.status, CredentialStatus::Revoked);

        let second = service
            .revoke(&jit.credential_id, "sbx-42", "sandbox_terminated")
            .expect("second revoke");
        assert_eq!(second.status, CredentialStatus::Revoked);
    }

    #[test]
    fn sweep_revokes_only_matching_sandbox_prefix() {
        let service = service();
        service
            .issue("agent-a", "sbx-1", None, DEFAULT_JIT_TTL_SECONDS)
            .expect("issue sbx-1");
        service
            .issue("agent-a", "sbx-1", None, DEFAULT_JIT_TTL_SECONDS)
            .expect("issue sbx-1 again");
        service
            .issue("agent-a", "sbx-2", None, DEFAULT_JIT_TTL_SECONDS)
            .expect("issue sbx-2");

        let sweep = service
            .revoke_all_for_sandbox("agent-a", "sbx-1")
            .expect("sweep");
        assert_eq!(sweep.revoked_count, 2);

        let remaining = service.store.list_active_credentials("agent-a").expect("list");
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].credential_id.starts_with("jit-sbx-2-"));
    }
}
