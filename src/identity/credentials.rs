//! Credential issuance, verification, rotation, and revocation.
//!
//! Secrets are generated from the OS CSPRNG and surfaced to the caller
//! exactly once; the store only ever sees the HMAC-SHA256 of the secret
//! under the process identity signing key.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngExt;
use tracing::info;
use uuid::Uuid;

use crate::clock::utc_now_epoch;
use crate::secrets::SigningSecrets;
use crate::{Error, Result};

use super::store::{IdentityStore, NewCredential};
use super::types::{
    AgentCredential, CredentialIssuance, CredentialStatus, CredentialVerification, IdentityStatus,
};
use super::{DEFAULT_CREDENTIAL_TTL_SECONDS, clamp_ttl, normalize_scopes};

/// Credential service over the identity store.
pub struct CredentialService {
    store: Arc<IdentityStore>,
    secrets: Arc<SigningSecrets>,
}

impl CredentialService {
    /// Create a service handle.
    #[must_use]
    pub fn new(store: Arc<IdentityStore>, secrets: Arc<SigningSecrets>) -> Self {
        Self { store, secrets }
    }

    /// HMAC hash of a presented plaintext secret.
    #[must_use]
    pub fn hash_secret(&self, raw_secret: &str) -> String {
        self.secrets.identity_hmac_hex(raw_secret.as_bytes())
    }

    fn generate_secret() -> String {
        let bytes: [u8; super::SECRET_BYTE_LENGTH] = rand::rng().random();
        URL_SAFE_NO_PAD.encode(bytes)
    }

    fn short_id(prefix: &str) -> String {
        let hex = Uuid::new_v4().simple().to_string();
        format!("{prefix}-{}", &hex[..16])
    }

    /// Issue a new credential for `agent_id`.
    ///
    /// # Errors
    ///
    /// [`Error::PermissionDenied`] when the identity is not active or the
    /// caller does not own it; [`Error::NotFound`] when the agent is unknown.
    pub fn issue(
        &self,
        agent_id: &str,
        scopes: &[String],
        ttl_seconds: i64,
        owner: &str,
    ) -> Result<CredentialIssuance> {
        let identity = self.store.get_identity(agent_id)?;
        if identity.status != IdentityStatus::Active {
            return Err(Error::PermissionDenied(format!(
                "agent identity is {}, cannot issue credential",
                identity.status
            )));
        }
        if identity.owner != owner {
            return Err(Error::PermissionDenied(
                "owner mismatch: cannot issue credential for agent owned by another".to_string(),
            ));
        }

        let ttl = clamp_ttl(ttl_seconds);
        let now = utc_now_epoch();
        let credential_id = Self::short_id("cred");
        let raw_secret = Self::generate_secret();
        let scopes = normalize_scopes(scopes);

        self.store.insert_credential(&NewCredential {
            credential_id: credential_id.clone(),
            agent_id: agent_id.to_string(),
            credential_hash: self.hash_secret(&raw_secret),
            scopes: scopes.clone(),
            issued_at_epoch: now,
            expires_at_epoch: now + ttl,
            rotation_parent_id: None,
        })?;

        info!(agent_id, credential_id, ttl, "Issued credential");
        Ok(CredentialIssuance {
            credential_id,
            agent_id: agent_id.to_string(),
            secret: raw_secret,
            scopes,
            expires_at_epoch: now + ttl,
            status: CredentialStatus::Active,
        })
    }

    /// Verify a presented plaintext secret.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthenticated`] for an unknown, expired, or inactive
    /// credential, or when the owning identity is no longer active.
    pub fn verify(&self, raw_secret: &str) -> Result<CredentialVerification> {
        let credential_hash = self.hash_secret(raw_secret);
        let Some(credential) = self.store.find_credential_by_hash(&credential_hash)? else {
            return Err(Error::Unauthenticated("invalid credential".to_string()));
        };

        if credential.expires_at_epoch < utc_now_epoch() {
            return Err(Error::Unauthenticated("credential expired".to_string()));
        }

        let identity = self.store.get_identity(&credential.agent_id)?;
        if identity.status != IdentityStatus::Active {
            return Err(Error::Unauthenticated(format!(
                "agent identity is {}",
                identity.status
            )));
        }

        Ok(CredentialVerification {
            valid: true,
            agent_id: credential.agent_id,
            credential_id: credential.credential_id,
            scopes: credential.scopes,
            expires_at_epoch: credential.expires_at_epoch,
        })
    }

    /// Rotate a credential: mark the old one `rotated` under the optimistic
    /// guard and issue a replacement whose `rotation_parent_id` links back.
    pub fn rotate(
        &self,
        credential_id: &str,
        owner: &str,
        new_scopes: Option<&[String]>,
        new_ttl_seconds: Option<i64>,
    ) -> Result<CredentialIssuance> {
        let old = self.store.get_credential(credential_id)?;
        let identity = self.store.get_identity(&old.agent_id)?;
        if identity.owner != owner {
            return Err(Error::PermissionDenied("owner mismatch".to_string()));
        }

        // The WHERE status='active' predicate is the rotate-after-revoke race
        // prevention; a lost race surfaces as Conflict.
        self.store.update_credential_status_if_active(
            credential_id,
            CredentialStatus::Rotated,
            None,
        )?;

        let scopes = normalize_scopes(new_scopes.unwrap_or(&old.scopes));
        let ttl = clamp_ttl(new_ttl_seconds.unwrap_or(DEFAULT_CREDENTIAL_TTL_SECONDS));
        let now = utc_now_epoch();
        let new_credential_id = Self::short_id("cred");
        let raw_secret = Self::generate_secret();

        self.store.insert_credential(&NewCredential {
            credential_id: new_credential_id.clone(),
            agent_id: old.agent_id.clone(),
            credential_hash: self.hash_secret(&raw_secret),
            scopes: scopes.clone(),
            issued_at_epoch: now,
            expires_at_epoch: now + ttl,
            rotation_parent_id: Some(credential_id.to_string()),
        })?;

        info!(
            agent_id = %old.agent_id,
            old_credential_id = credential_id,
            new_credential_id,
            "Rotated credential"
        );
        Ok(CredentialIssuance {
            credential_id: new_credential_id,
            agent_id: old.agent_id,
            secret: raw_secret,
            scopes,
            expires_at_epoch: now + ttl,
            status: CredentialStatus::Active,
        })
    }

    /// Revoke a credential. Idempotent: an already-revoked credential is
    /// returned unchanged.
    pub fn revoke(
        &self,
        credential_id: &str,
        owner: &str,
        reason: &str,
    ) -> Result<AgentCredential> {
        let credential = self.store.get_credential(credential_id)?;
        if credential.status == CredentialStatus::Revoked {
            return Ok(credential);
        }

        let identity = self.store.get_identity(&credential.agent_id)?;
        if identity.owner != owner {
            return Err(Error::PermissionDenied("owner mismatch".to_string()));
        }

        self.store.update_credential_status_if_active(
            credential_id,
            CredentialStatus::Revoked,
            Some(reason),
        )
    }

    /// Metadata view of a credential (no secret material).
    pub fn metadata(&self, credential_id: &str) -> Result<AgentCredential> {
        self.store.get_credential(credential_id)
    }
}
