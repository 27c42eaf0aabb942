//! Lease → install promotion.
//!
//! Phase 1 (`create_lease`) hands out an attestation hash binding the
//! requester to the capability at acquisition time. Phase 2
//! (`promote_lease`) re-checks ownership, lease freshness, policy approval,
//! compatibility, and the attestation binding before creating the install
//! record. A second identical promote is a no-op replay; rollback is
//! idempotent.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::clock::{iso_from_epoch, utc_now_epoch};
use crate::identity::revocation::LeaseRevoker;
use crate::{Error, Result};

/// Promotion evidence attached to a promoted lease.
#[derive(Debug, Clone, Serialize)]
pub struct Promotion {
    /// RFC 3339 promotion timestamp.
    pub promoted_at: String,
    /// Installed reference (`requester::capability`).
    pub installed_ref: String,
    /// Attestation hash verified at promotion.
    pub attestation_hash: String,
    /// Approval ticket (`APR-` prefix).
    pub approval_ticket: String,
    /// Compatibility verification flag.
    pub compatibility_verified: bool,
    /// Created install record.
    pub install_id: String,
}

/// A capability lease.
#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    /// Lease id.
    pub lease_id: String,
    /// Requesting agent.
    pub requester_agent_id: String,
    /// Leased capability reference.
    pub capability_ref: String,
    /// Owning principal.
    pub owner: String,
    /// One of `active`, `expired`, `promoted`, `revoked`.
    pub status: String,
    /// Requested TTL.
    pub ttl_seconds: i64,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 expiry timestamp.
    pub expires_at: String,
    /// Creation time (epoch seconds).
    pub created_at_epoch: i64,
    /// Expiry (epoch seconds).
    pub expires_at_epoch: i64,
    /// SHA-256 over `requester|capability|now`, the tamper check for
    /// promotion.
    pub attestation_hash: String,
    /// Present once promoted.
    pub promotion: Option<Promotion>,
}

/// An install created by promotion.
#[derive(Debug, Clone, Serialize)]
pub struct Install {
    /// Install id.
    pub install_id: String,
    /// Source lease.
    pub lease_id: String,
    /// Owning principal.
    pub owner: String,
    /// Requesting agent.
    pub requester_agent_id: String,
    /// Installed reference (`requester::capability`).
    pub installed_ref: String,
    /// `active` or `rolled_back`.
    pub status: String,
    /// Compatibility verification flag at promotion.
    pub compatibility_verified: bool,
    /// Approval ticket at promotion.
    pub approval_ticket: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 rollback timestamp, when rolled back.
    pub rolled_back_at: Option<String>,
    /// Rollback reason, when rolled back.
    pub rollback_reason: Option<String>,
}

/// Deterministic attestation signature used in local deployments; the real
/// deployment substitutes a cryptographic signature over the same inputs.
#[must_use]
pub fn expected_signature(attestation_hash: &str, owner: &str) -> String {
    format!("sig:{attestation_hash}:{owner}")
}

/// Lease and install registry.
#[derive(Default)]
pub struct LeaseService {
    leases: RwLock<HashMap<String, Lease>>,
    installs: RwLock<HashMap<String, Install>>,
}

impl LeaseService {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize_status(lease: &mut Lease, now: i64) {
        if lease.status == "active" && now > lease.expires_at_epoch {
            lease.status = "expired".to_string();
        }
    }

    /// Phase 1: acquire a lease and its attestation hash.
    pub fn create_lease(
        &self,
        requester_agent_id: &str,
        capability_ref: &str,
        owner: &str,
        ttl_seconds: i64,
    ) -> Result<Lease> {
        if ttl_seconds <= 0 {
            return Err(Error::InvalidArgument(
                "ttl_seconds must be greater than zero".to_string(),
            ));
        }

        let now = utc_now_epoch();
        let attestation_hash = hex::encode(Sha256::digest(
            format!("{requester_agent_id}|{capability_ref}|{now}").as_bytes(),
        ));
        let lease = Lease {
            lease_id: Uuid::new_v4().to_string(),
            requester_agent_id: requester_agent_id.to_string(),
            capability_ref: capability_ref.to_string(),
            owner: owner.to_string(),
            status: "active".to_string(),
            ttl_seconds,
            created_at: iso_from_epoch(now),
            expires_at: iso_from_epoch(now + ttl_seconds),
            created_at_epoch: now,
            expires_at_epoch: now + ttl_seconds,
            attestation_hash,
            promotion: None,
        };
        self.leases
            .write()
            .insert(lease.lease_id.clone(), lease.clone());
        info!(lease_id = %lease.lease_id, capability_ref, "Lease created");
        Ok(lease)
    }

    /// Fetch a lease, auto-transitioning `active` → `expired` when stale.
    pub fn get_lease(&self, lease_id: &str, owner: &str) -> Result<Lease> {
        let mut leases = self.leases.write();
        let lease = leases
            .get_mut(lease_id)
            .ok_or_else(|| Error::NotFound("lease not found".to_string()))?;
        if lease.owner != owner {
            return Err(Error::PermissionDenied("owner mismatch".to_string()));
        }
        Self::normalize_status(lease, utc_now_epoch());
        Ok(lease.clone())
    }

    /// Phase 2: promote a lease into an install.
    #[allow(clippy::too_many_arguments)]
    pub fn promote_lease(
        &self,
        lease_id: &str,
        owner: &str,
        signature: &str,
        attestation_hash: &str,
        policy_approved: bool,
        approval_ticket: &str,
        compatibility_verified: bool,
    ) -> Result<Lease> {
        let mut leases = self.leases.write();
        let lease = leases
            .get_mut(lease_id)
            .ok_or_else(|| Error::NotFound("lease not found".to_string()))?;
        if lease.owner != owner {
            return Err(Error::PermissionDenied("owner mismatch".to_string()));
        }

        Self::normalize_status(lease, utc_now_epoch());
        if lease.status == "expired" {
            return Err(Error::InvalidArgument("lease expired".to_string()));
        }
        if lease.status == "promoted" {
            // Replay of a completed promotion is a no-op.
            return Ok(lease.clone());
        }
        if lease.status != "active" {
            return Err(Error::InvalidArgument("lease is not active".to_string()));
        }
        if !policy_approved {
            return Err(Error::PermissionDenied(
                "policy approval required".to_string(),
            ));
        }
        if !approval_ticket.starts_with("APR-") {
            return Err(Error::PermissionDenied(
                "approval ticket required".to_string(),
            ));
        }
        if !compatibility_verified {
            return Err(Error::PermissionDenied(
                "compatibility verification required".to_string(),
            ));
        }
        if attestation_hash != lease.attestation_hash {
            return Err(Error::PermissionDenied(
                "attestation hash mismatch".to_string(),
            ));
        }
        if signature != expected_signature(attestation_hash, owner) {
            return Err(Error::PermissionDenied(
                "invalid attestation signature".to_string(),
            ));
        }

        let install_id = Uuid::new_v4().to_string();
        let installed_ref = format!("{}::{}", lease.requester_agent_id, lease.capability_ref);
        let now_iso = iso_from_epoch(utc_now_epoch());
        self.installs.write().insert(
            install_id.clone(),
            Install {
                install_id: install_id.clone(),
                lease_id: lease_id.to_string(),
                owner: owner.to_string(),
                requester_agent_id: lease.requester_agent_id.clone(),
                installed_ref: installed_ref.clone(),
                status: "active".to_string(),
                compatibility_verified,
                approval_ticket: approval_ticket.to_string(),
                created_at: now_iso.clone(),
                rolled_back_at: None,
                rollback_reason: None,
            },
        );

        lease.status = "promoted".to_string();
        lease.promotion = Some(Promotion {
            promoted_at: now_iso,
            installed_ref,
            attestation_hash: attestation_hash.to_string(),
            approval_ticket: approval_ticket.to_string(),
            compatibility_verified,
            install_id,
        });
        info!(lease_id, "Lease promoted");
        Ok(lease.clone())
    }

    /// Fetch an install.
    pub fn get_install(&self, install_id: &str, owner: &str) -> Result<Install> {
        let installs = self.installs.read();
        let install = installs
            .get(install_id)
            .ok_or_else(|| Error::NotFound("install not found".to_string()))?;
        if install.owner != owner {
            return Err(Error::PermissionDenied("owner mismatch".to_string()));
        }
        Ok(install.clone())
    }

    /// Roll back an install, recording reason and timestamp. Idempotent.
    pub fn rollback_install(&self, install_id: &str, owner: &str, reason: &str) -> Result<Install> {
        let mut installs = self.installs.write();
        let install = installs
            .get_mut(install_id)
            .ok_or_else(|| Error::NotFound("install not found".to_string()))?;
        if install.owner != owner {
            return Err(Error::PermissionDenied("owner mismatch".to_string()));
        }
        if install.status == "rolled_back" {
            return Ok(install.clone());
        }
        install.status = "rolled_back".to_string();
        install.rolled_back_at = Some(iso_from_epoch(utc_now_epoch()));
        install.rollback_reason = Some(reason.to_string());
        info!(install_id, reason, "Install rolled back");
        Ok(install.clone())
    }
}

impl LeaseRevoker for LeaseService {
    fn revoke_leases_for_agent(&self, agent_id: &str, _reason: &str) -> usize {
        let mut leases = self.leases.write();
        let mut revoked = 0usize;
        for lease in leases.values_mut() {
            if lease.requester_agent_id == agent_id && lease.status == "active" {
                lease.status = "revoked".to_string();
                revoked += 1;
            }
        }
        if revoked > 0 {
            info!(agent_id, revoked, "Revoked leases for agent");
        }
        revoked
    }
}
