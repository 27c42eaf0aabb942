//! Tagged record types for the identity store.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Credential mechanism bound to an agent identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// Opaque bearer secret.
    ApiKey,
    /// X.509 client certificate.
    X509,
    /// SPIFFE workload identity.
    Spiffe,
}

impl CredentialType {
    /// Persisted label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::X509 => "x509",
            Self::Spiffe => "spiffe",
        }
    }
}

impl FromStr for CredentialType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api_key" => Ok(Self::ApiKey),
            "x509" => Ok(Self::X509),
            "spiffe" => Ok(Self::Spiffe),
            other => Err(Error::InvalidArgument(format!(
                "invalid credential_type: {other}"
            ))),
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an agent identity.
///
/// Identities are never destroyed; `Revoked` is the only terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    /// Identity can authenticate and issue credentials.
    Active,
    /// Temporarily blocked; can be re-activated by the owner.
    Suspended,
    /// Terminal: killed by the revocation orchestrator or owner.
    Revoked,
}

impl IdentityStatus {
    /// Persisted label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Revoked => "revoked",
        }
    }
}

impl FromStr for IdentityStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "revoked" => Ok(Self::Revoked),
            other => Err(Error::InvalidArgument(format!("invalid status: {other}"))),
        }
    }
}

impl fmt::Display for IdentityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a credential.
///
/// Transitions: `active → rotated` and `active → revoked`. At most one
/// transition away from `active` ever occurs; both successors are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    /// Usable bearer secret.
    Active,
    /// Superseded by a rotation child.
    Rotated,
    /// Explicitly revoked.
    Revoked,
}

impl CredentialStatus {
    /// Persisted label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Rotated => "rotated",
            Self::Revoked => "revoked",
        }
    }
}

impl FromStr for CredentialStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "rotated" => Ok(Self::Rotated),
            "revoked" => Ok(Self::Revoked),
            other => Err(Error::InvalidArgument(format!(
                "invalid credential status: {other}"
            ))),
        }
    }
}

/// An agent's root identity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Unique agent identifier.
    pub agent_id: String,
    /// Human or platform principal authorizing this agent.
    pub owner: String,
    /// Credential mechanism.
    pub credential_type: CredentialType,
    /// Lifecycle status.
    pub status: IdentityStatus,
    /// Optional on-behalf-of binding to a human principal.
    pub human_principal_id: Option<String>,
    /// Optional SHA-256 of the canonical configuration manifest.
    pub configuration_checksum: Option<String>,
    /// Optional PEM public key for x509/spiffe identities.
    pub public_key_pem: Option<String>,
    /// Opaque metadata.
    pub metadata: Option<BTreeMap<String, String>>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 last-update timestamp.
    pub updated_at: String,
}

/// A persisted bearer-secret record (hash only; plaintext is never stored).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCredential {
    /// Credential identifier (`cred-` / `jit-` prefix).
    pub credential_id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Granted scopes (sorted, deduplicated).
    pub scopes: Vec<String>,
    /// Issuance time (epoch seconds).
    pub issued_at_epoch: i64,
    /// Expiry time (epoch seconds), clamped to the TTL window.
    pub expires_at_epoch: i64,
    /// Previous credential when this one was issued by rotation.
    pub rotation_parent_id: Option<String>,
    /// Lifecycle status.
    pub status: CredentialStatus,
    /// RFC 3339 revocation timestamp, when revoked.
    pub revoked_at: Option<String>,
    /// Operator-supplied reason, when revoked.
    pub revocation_reason: Option<String>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

/// Result of issuing a credential. The only moment the secret is visible.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialIssuance {
    /// New credential id.
    pub credential_id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Plaintext secret, surfaced exactly once.
    pub secret: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Expiry (epoch seconds).
    pub expires_at_epoch: i64,
    /// Always `active` at issuance.
    pub status: CredentialStatus,
}

/// Result of verifying a presented secret.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialVerification {
    /// Always `true`; failures surface as errors.
    pub valid: bool,
    /// Agent the credential belongs to.
    pub agent_id: String,
    /// Matched credential id.
    pub credential_id: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Expiry (epoch seconds).
    pub expires_at_epoch: i64,
}

/// A signed, parented delegation edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationToken {
    /// Token identifier (`dtk-` prefix).
    pub token_id: String,
    /// Agent that granted the delegation.
    pub issuer_agent_id: String,
    /// Agent acting under the delegation.
    pub subject_agent_id: String,
    /// Attenuated scope set.
    pub delegated_scopes: Vec<String>,
    /// Issuance time (epoch seconds).
    pub issued_at_epoch: i64,
    /// Expiry (epoch seconds); never exceeds the parent's expiry.
    pub expires_at_epoch: i64,
    /// Parent edge, absent at the chain root.
    pub parent_token_id: Option<String>,
    /// 0 at the root; bounded by the chain depth limit.
    pub chain_depth: u32,
    /// Revocation flag; cascades to descendants.
    pub revoked: bool,
    /// RFC 3339 revocation timestamp, when revoked.
    pub revoked_at: Option<String>,
}

/// Verification verdict for a signed delegation token.
#[derive(Debug, Clone, Serialize)]
pub struct DelegationTokenVerification {
    /// Always `true`; failures surface as errors.
    pub valid: bool,
    /// Token id extracted from the wire form.
    pub token_id: String,
    /// Issuer agent.
    pub issuer_agent_id: String,
    /// Subject agent (the acting identity).
    pub subject_agent_id: String,
    /// Effective attenuated scopes.
    pub delegated_scopes: Vec<String>,
    /// Expiry (epoch seconds).
    pub expires_at_epoch: i64,
    /// Chain depth of the verified token.
    pub chain_depth: u32,
}

/// Trust level of a federation domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Fully verified partner domain.
    Verified,
    /// Registered but not yet verified.
    Provisional,
    /// Trust withdrawn; outstanding attestations are invalid.
    Revoked,
}

impl TrustLevel {
    /// Persisted label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Provisional => "provisional",
            Self::Revoked => "revoked",
        }
    }
}

impl FromStr for TrustLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verified" => Ok(Self::Verified),
            "provisional" => Ok(Self::Provisional),
            "revoked" => Ok(Self::Revoked),
            other => Err(Error::InvalidArgument(format!(
                "invalid trust_level: {other}"
            ))),
        }
    }
}

/// A registered federation trust domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedDomain {
    /// Domain identifier.
    pub domain_id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Current trust level.
    pub trust_level: TrustLevel,
    /// Optional PEM public key for the domain.
    pub public_key_pem: Option<String>,
    /// Scopes the domain may attest for.
    pub allowed_scopes: Vec<String>,
    /// Principal that registered the domain.
    pub registered_by: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 last-update timestamp.
    pub updated_at: String,
}

/// A signed claim binding an agent to a trusted domain for a TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAttestation {
    /// Attestation identifier (`att-` prefix).
    pub attestation_id: String,
    /// Attested agent.
    pub agent_id: String,
    /// Binding domain.
    pub domain_id: String,
    /// Arbitrary string claims.
    pub claims: BTreeMap<String, String>,
    /// Issuance time (epoch seconds).
    pub issued_at_epoch: i64,
    /// Expiry (epoch seconds).
    pub expires_at_epoch: i64,
    /// Hex HMAC-SHA256 signature over the canonical payload.
    pub signature: String,
}

/// Append-only audit record of a revocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationEvent {
    /// Event identifier (`rev-` prefix).
    pub event_id: String,
    /// Kind of entity revoked (e.g. `agent_identity`).
    pub revoked_type: String,
    /// Identifier of the revoked entity.
    pub revoked_id: String,
    /// Agent the revocation concerns.
    pub agent_id: String,
    /// Reason string.
    pub reason: String,
    /// Principal that performed the revocation.
    pub actor: String,
    /// Number of dependent records revoked in the same operation.
    pub cascade_count: i64,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}
