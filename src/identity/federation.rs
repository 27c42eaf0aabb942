//! Federation trust registry and agent attestations.
//!
//! Attestations bind an agent to a trusted domain for a TTL and carry an
//! HMAC-SHA256 signature over the canonical payload
//! `{"agent":..,"aid":..,"dom":..,"exp":..}`. Revoking a domain's trust
//! invalidates every outstanding attestation at verification time.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::clock::{iso_from_epoch, utc_now_epoch};
use crate::secrets::{SigningSecrets, constant_time_eq};
use crate::{Error, Result};

use super::clamp_ttl;
use super::store::IdentityStore;
use super::types::{AgentAttestation, IdentityStatus, TrustLevel, TrustedDomain};

/// Cap on domain listings.
const MAX_DOMAINS_QUERY: usize = 10_000;

/// Verification verdict for an attestation.
#[derive(Debug, Clone, Serialize)]
pub struct AttestationVerification {
    /// Always `true`; failures surface as errors.
    pub valid: bool,
    /// Verified attestation id.
    pub attestation_id: String,
    /// Attested agent.
    pub agent_id: String,
    /// Binding domain.
    pub domain_id: String,
    /// Claims carried by the attestation.
    pub claims: BTreeMap<String, String>,
    /// RFC 3339 expiry timestamp.
    pub expires_at: String,
}

/// Federation service over the identity store.
pub struct FederationService {
    store: Arc<IdentityStore>,
    secrets: Arc<SigningSecrets>,
}

impl FederationService {
    /// Create a service handle.
    #[must_use]
    pub fn new(store: Arc<IdentityStore>, secrets: Arc<SigningSecrets>) -> Self {
        Self { store, secrets }
    }

    fn sign_attestation(&self, attestation_id: &str, agent_id: &str, domain_id: &str, expires: i64) -> String {
        let payload = serde_json::to_string(&json!({
            "aid": attestation_id,
            "agent": agent_id,
            "dom": domain_id,
            "exp": expires,
        }))
        .expect("payload of strings and ints always serializes");
        self.secrets.identity_hmac_hex(payload.as_bytes())
    }

    /// Register a trusted domain.
    pub fn register_domain(
        &self,
        domain_id: &str,
        display_name: &str,
        trust_level: TrustLevel,
        public_key_pem: Option<String>,
        allowed_scopes: Vec<String>,
        registered_by: &str,
    ) -> Result<TrustedDomain> {
        let mut allowed_scopes = allowed_scopes;
        allowed_scopes.sort();
        allowed_scopes.dedup();
        self.store.insert_domain(&TrustedDomain {
            domain_id: domain_id.to_string(),
            display_name: display_name.to_string(),
            trust_level,
            public_key_pem,
            allowed_scopes,
            registered_by: registered_by.to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        })?;
        self.store.get_domain(domain_id)
    }

    /// Fetch a trusted domain.
    pub fn get_domain(&self, domain_id: &str) -> Result<TrustedDomain> {
        self.store.get_domain(domain_id)
    }

    /// List trusted domains (capped).
    pub fn list_domains(&self) -> Result<Vec<TrustedDomain>> {
        self.store.list_domains(MAX_DOMAINS_QUERY)
    }

    /// Change a domain's trust level (e.g. withdraw trust).
    pub fn set_domain_trust_level(
        &self,
        domain_id: &str,
        trust_level: TrustLevel,
    ) -> Result<TrustedDomain> {
        self.store.update_domain_trust_level(domain_id, trust_level)
    }

    /// Create an attestation binding `agent_id` to `domain_id`.
    pub fn create_attestation(
        &self,
        agent_id: &str,
        domain_id: &str,
        claims: BTreeMap<String, String>,
        ttl_seconds: i64,
        owner: &str,
    ) -> Result<AgentAttestation> {
        let identity = self.store.get_identity(agent_id)?;
        if identity.status != IdentityStatus::Active {
            return Err(Error::PermissionDenied(format!(
                "agent is {}",
                identity.status
            )));
        }
        if identity.owner != owner {
            return Err(Error::PermissionDenied("owner mismatch".to_string()));
        }

        let domain = self.store.get_domain(domain_id)?;
        if domain.trust_level == TrustLevel::Revoked {
            return Err(Error::PermissionDenied(format!(
                "domain trust is revoked: {domain_id}"
            )));
        }

        let ttl = clamp_ttl(ttl_seconds);
        let now = utc_now_epoch();
        let attestation_id = {
            let hex = Uuid::new_v4().simple().to_string();
            format!("att-{}", &hex[..16])
        };
        let signature = self.sign_attestation(&attestation_id, agent_id, domain_id, now + ttl);

        let attestation = AgentAttestation {
            attestation_id,
            agent_id: agent_id.to_string(),
            domain_id: domain_id.to_string(),
            claims,
            issued_at_epoch: now,
            expires_at_epoch: now + ttl,
            signature,
        };
        self.store.insert_attestation(&attestation)?;
        Ok(attestation)
    }

    /// Verify an attestation: signature, expiry, agent status, domain trust.
    pub fn verify_attestation(&self, attestation_id: &str) -> Result<AttestationVerification> {
        let record = self.store.get_attestation(attestation_id)?;

        let now = utc_now_epoch();
        if record.expires_at_epoch < now {
            return Err(Error::PermissionDenied("attestation expired".to_string()));
        }

        let expected = self.sign_attestation(
            attestation_id,
            &record.agent_id,
            &record.domain_id,
            record.expires_at_epoch,
        );
        if !constant_time_eq(&record.signature, &expected) {
            return Err(Error::PermissionDenied(
                "invalid attestation signature".to_string(),
            ));
        }

        let identity = self.store.get_identity(&record.agent_id)?;
        if identity.status != IdentityStatus::Active {
            return Err(Error::PermissionDenied(format!(
                "agent is {}",
                identity.status
            )));
        }

        let domain = self.store.get_domain(&record.domain_id)?;
        if domain.trust_level == TrustLevel::Revoked {
            return Err(Error::PermissionDenied(
                "domain trust has been revoked".to_string(),
            ));
        }

        Ok(AttestationVerification {
            valid: true,
            attestation_id: attestation_id.to_string(),
            agent_id: record.agent_id,
            domain_id: record.domain_id,
            claims: record.claims,
            expires_at: iso_from_epoch(record.expires_at_epoch),
        })
    }
}
