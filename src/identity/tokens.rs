//! Delegation tokens: parent-chained, scope-attenuated, HMAC-signed.
//!
//! The signed wire form is `<token_id>.<hex_sig>` where the signature covers
//! the canonical JSON payload `{"exp":..,"iss":..,"sub":..,"tid":..}` (sorted
//! keys, no whitespace). Chain integrity is re-checked at verify time, not
//! only at issuance, so revoking an intermediary immediately invalidates all
//! descendants without a background job.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::clock::{iso_from_epoch, utc_now_epoch};
use crate::secrets::{SigningSecrets, constant_time_eq};
use crate::{Error, Result};

use super::chain::{attenuate_scopes, validate_chain_depth};
use super::store::{IdentityStore, NewDelegationToken};
use super::types::{DelegationToken, DelegationTokenVerification, IdentityStatus};
use super::{MAX_DELEGATION_CHAIN_DEPTH, clamp_ttl};

/// Result of issuing a delegation token.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedDelegationToken {
    /// New token id (`dtk-` prefix).
    pub token_id: String,
    /// Signed wire form `<token_id>.<hex_sig>`.
    pub signed_token: String,
    /// Granting agent.
    pub issuer_agent_id: String,
    /// Acting agent.
    pub subject_agent_id: String,
    /// Effective attenuated scopes.
    pub delegated_scopes: Vec<String>,
    /// RFC 3339 issuance timestamp.
    pub issued_at: String,
    /// RFC 3339 expiry timestamp.
    pub expires_at: String,
    /// Expiry as epoch seconds.
    pub expires_at_epoch: i64,
    /// Chain depth (0 at root).
    pub chain_depth: u32,
    /// Parent edge, absent at the root.
    pub parent_token_id: Option<String>,
}

/// One edge in a rendered delegation chain, root first.
#[derive(Debug, Clone, Serialize)]
pub struct ChainLink {
    /// Token id.
    pub token_id: String,
    /// Granting agent.
    pub issuer_agent_id: String,
    /// Acting agent.
    pub subject_agent_id: String,
    /// Scopes at this edge.
    pub delegated_scopes: Vec<String>,
    /// Depth of this edge.
    pub chain_depth: u32,
    /// Whether this edge has been revoked.
    pub revoked: bool,
    /// RFC 3339 expiry timestamp.
    pub expires_at: String,
}

/// A delegation chain rendered root → leaf.
#[derive(Debug, Clone, Serialize)]
pub struct DelegationChain {
    /// Leaf token the chain was resolved from.
    pub token_id: String,
    /// Edges ordered root first.
    pub chain: Vec<ChainLink>,
    /// Depth of the leaf.
    pub chain_depth: u32,
    /// Effective scopes at the leaf.
    pub effective_scopes: Vec<String>,
}

/// Summary of a cascade revocation.
#[derive(Debug, Clone, Serialize)]
pub struct TokenRevocation {
    /// Root token revoked.
    pub token_id: String,
    /// Always true.
    pub revoked: bool,
    /// RFC 3339 revocation timestamp.
    pub revoked_at: String,
    /// Number of descendants revoked alongside the root.
    pub cascade_count: usize,
}

/// Delegation token service over the identity store.
pub struct DelegationTokenService {
    store: Arc<IdentityStore>,
    secrets: Arc<SigningSecrets>,
}

impl DelegationTokenService {
    /// Create a service handle.
    #[must_use]
    pub fn new(store: Arc<IdentityStore>, secrets: Arc<SigningSecrets>) -> Self {
        Self { store, secrets }
    }

    fn sign_payload(&self, token_id: &str, subject: &str, issuer: &str, expires: i64) -> String {
        // serde_json maps are BTree-backed: keys serialize sorted, compact.
        let payload = serde_json::to_string(&json!({
            "tid": token_id,
            "sub": subject,
            "iss": issuer,
            "exp": expires,
        }))
        .expect("payload of strings and ints always serializes");
        self.secrets.identity_hmac_hex(payload.as_bytes())
    }

    /// Issue a delegation token.
    ///
    /// Root tokens attenuate against the union of the issuer's active
    /// credential scopes; child tokens attenuate against the parent's scopes
    /// and inherit `min(now + ttl, parent.expires_at)` as expiry.
    pub fn issue(
        &self,
        issuer_agent_id: &str,
        subject_agent_id: &str,
        delegated_scopes: &[String],
        ttl_seconds: i64,
        parent_token_id: Option<&str>,
        owner: &str,
    ) -> Result<IssuedDelegationToken> {
        let issuer = self.store.get_identity(issuer_agent_id)?;
        if issuer.status != IdentityStatus::Active {
            return Err(Error::PermissionDenied(format!(
                "issuer agent is {}",
                issuer.status
            )));
        }
        if issuer.owner != owner {
            return Err(Error::PermissionDenied(
                "owner mismatch for issuer agent".to_string(),
            ));
        }

        let subject = self.store.get_identity(subject_agent_id)?;
        if subject.status != IdentityStatus::Active {
            return Err(Error::PermissionDenied(format!(
                "subject agent is {}",
                subject.status
            )));
        }

        let now = utc_now_epoch();
        let mut chain_depth = 0u32;
        let mut parent_expires: Option<i64> = None;
        let effective_scopes = if let Some(parent_id) = parent_token_id {
            let parent = self.store.get_token(parent_id)?.ok_or_else(|| {
                Error::InvalidArgument(format!("parent token not found: {parent_id}"))
            })?;
            if parent.revoked {
                return Err(Error::PermissionDenied("parent token is revoked".to_string()));
            }
            if parent.expires_at_epoch < now {
                return Err(Error::PermissionDenied("parent token is expired".to_string()));
            }
            chain_depth = parent.chain_depth + 1;
            validate_chain_depth(chain_depth)?;
            parent_expires = Some(parent.expires_at_epoch);
            attenuate_scopes(&parent.delegated_scopes, delegated_scopes)?
        } else {
            // Root delegation: bounded by the issuer's own credential grants.
            let issuer_credentials = self.store.list_active_credentials(issuer_agent_id)?;
            if issuer_credentials.is_empty() {
                return Err(Error::PermissionDenied(
                    "issuer has no active credentials".to_string(),
                ));
            }
            let mut issuer_scopes: Vec<String> = issuer_credentials
                .into_iter()
                .flat_map(|credential| credential.scopes)
                .collect();
            issuer_scopes.sort();
            issuer_scopes.dedup();
            attenuate_scopes(&issuer_scopes, delegated_scopes)?
        };

        let ttl = clamp_ttl(ttl_seconds);
        let expires_at_epoch = match parent_expires {
            Some(parent_expiry) => (now + ttl).min(parent_expiry),
            None => now + ttl,
        };

        let token_id = {
            let hex = Uuid::new_v4().simple().to_string();
            format!("dtk-{}", &hex[..16])
        };

        self.store.insert_token(&NewDelegationToken {
            token_id: token_id.clone(),
            issuer_agent_id: issuer_agent_id.to_string(),
            subject_agent_id: subject_agent_id.to_string(),
            delegated_scopes: effective_scopes.clone(),
            issued_at_epoch: now,
            expires_at_epoch,
            parent_token_id: parent_token_id.map(ToString::to_string),
            chain_depth,
        })?;

        let signature =
            self.sign_payload(&token_id, subject_agent_id, issuer_agent_id, expires_at_epoch);
        info!(token_id, issuer_agent_id, subject_agent_id, chain_depth, "Issued delegation token");

        Ok(IssuedDelegationToken {
            signed_token: format!("{token_id}.{signature}"),
            token_id,
            issuer_agent_id: issuer_agent_id.to_string(),
            subject_agent_id: subject_agent_id.to_string(),
            delegated_scopes: effective_scopes,
            issued_at: iso_from_epoch(now),
            expires_at: iso_from_epoch(expires_at_epoch),
            expires_at_epoch,
            chain_depth,
            parent_token_id: parent_token_id.map(ToString::to_string),
        })
    }

    /// Verify a signed wire-form token, including full chain integrity.
    pub fn verify(&self, signed_token: &str) -> Result<DelegationTokenVerification> {
        let Some((token_id, signature)) = signed_token.split_once('.') else {
            return Err(Error::Unauthenticated(
                "invalid delegation token format".to_string(),
            ));
        };

        let record = self
            .store
            .get_token(token_id)?
            .ok_or_else(|| Error::Unauthenticated("delegation token not found".to_string()))?;

        if record.revoked {
            return Err(Error::Unauthenticated(
                "delegation token is revoked".to_string(),
            ));
        }
        let now = utc_now_epoch();
        if record.expires_at_epoch < now {
            return Err(Error::Unauthenticated("delegation token expired".to_string()));
        }

        let expected = self.sign_payload(
            token_id,
            &record.subject_agent_id,
            &record.issuer_agent_id,
            record.expires_at_epoch,
        );
        if !constant_time_eq(signature, &expected) {
            return Err(Error::Unauthenticated(
                "invalid delegation token signature".to_string(),
            ));
        }

        self.verify_chain_integrity(&record, now)?;

        Ok(DelegationTokenVerification {
            valid: true,
            token_id: token_id.to_string(),
            issuer_agent_id: record.issuer_agent_id,
            subject_agent_id: record.subject_agent_id,
            delegated_scopes: record.delegated_scopes,
            expires_at_epoch: record.expires_at_epoch,
            chain_depth: record.chain_depth,
        })
    }

    /// Walk the parent chain, rejecting on any revoked, expired, or missing
    /// intermediary. The walk is bounded by `MAX_DEPTH + 2` to defend against
    /// cycles introduced by manual corruption.
    fn verify_chain_integrity(&self, leaf: &DelegationToken, now: i64) -> Result<()> {
        let mut current = leaf.clone();
        let mut depth = 0u32;
        while let Some(parent_id) = current.parent_token_id.clone() {
            depth += 1;
            if depth > MAX_DELEGATION_CHAIN_DEPTH + 2 {
                return Err(Error::PermissionDenied(
                    "delegation chain too deep or circular".to_string(),
                ));
            }
            let parent = self.store.get_token(&parent_id)?.ok_or_else(|| {
                Error::PermissionDenied("delegation chain broken: parent token missing".to_string())
            })?;
            if parent.revoked {
                return Err(Error::PermissionDenied(
                    "delegation chain invalid: parent token revoked".to_string(),
                ));
            }
            if parent.expires_at_epoch < now {
                return Err(Error::PermissionDenied(
                    "delegation chain invalid: parent token expired".to_string(),
                ));
            }
            current = parent;
        }
        Ok(())
    }

    /// Render the chain for `token_id`, ordered root → leaf.
    pub fn get_chain(&self, token_id: &str) -> Result<DelegationChain> {
        let leaf = self
            .store
            .get_token(token_id)?
            .ok_or_else(|| Error::NotFound(format!("delegation token not found: {token_id}")))?;

        let mut links: Vec<ChainLink> = Vec::new();
        let mut current = Some(leaf.clone());
        while let Some(record) = current {
            links.push(ChainLink {
                token_id: record.token_id.clone(),
                issuer_agent_id: record.issuer_agent_id.clone(),
                subject_agent_id: record.subject_agent_id.clone(),
                delegated_scopes: record.delegated_scopes.clone(),
                chain_depth: record.chain_depth,
                revoked: record.revoked,
                expires_at: iso_from_epoch(record.expires_at_epoch),
            });
            if links.len() > (MAX_DELEGATION_CHAIN_DEPTH + 2) as usize {
                return Err(Error::PermissionDenied(
                    "delegation chain too deep or circular".to_string(),
                ));
            }
            current = match record.parent_token_id {
                Some(parent_id) => self.store.get_token(&parent_id)?,
                None => None,
            };
        }
        // Stored leaf-upward; rendered chronologically from the root.
        links.reverse();

        Ok(DelegationChain {
            token_id: token_id.to_string(),
            chain: links,
            chain_depth: leaf.chain_depth,
            effective_scopes: leaf.delegated_scopes,
        })
    }

    /// Revoke `token_id` and every descendant, atomically.
    pub fn revoke(&self, token_id: &str, owner: &str) -> Result<TokenRevocation> {
        let record = self
            .store
            .get_token(token_id)?
            .ok_or_else(|| Error::NotFound(format!("delegation token not found: {token_id}")))?;

        let issuer = self.store.get_identity(&record.issuer_agent_id)?;
        if issuer.owner != owner {
            return Err(Error::PermissionDenied("owner mismatch".to_string()));
        }

        let cascade_count = self.store.revoke_token_cascade(token_id)?;
        info!(token_id, cascade_count, "Revoked delegation token");
        Ok(TokenRevocation {
            token_id: token_id.to_string(),
            revoked: true,
            revoked_at: iso_from_epoch(utc_now_epoch()),
            cascade_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::credentials::CredentialService;
    use crate::identity::store::NewIdentity;

    struct Fixture {
        tokens: DelegationTokenService,
        credentials: CredentialService,
        store: Arc<IdentityStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(IdentityStore::open_in_memory().expect("open"));
        let secrets = Arc::new(SigningSecrets {
            auth_token: "auth".to_string(),
            identity_signing: "identity-test-secret".to_string(),
            provenance_signing: "prov".to_string(),
            policy_signing: "policy".to_string(),
        });
        Fixture {
            tokens: DelegationTokenService::new(Arc::clone(&store), Arc::clone(&secrets)),
            credentials: CredentialService::new(Arc::clone(&store), secrets),
            store,
        }
    }

    fn register(fixture: &Fixture, agent_id: &str) {
        fixture
            .store
            .register_identity(&NewIdentity {
                agent_id: agent_id.to_string(),
                owner: "owner-dev".to_string(),
                ..NewIdentity::default()
            })
            .expect("register");
    }

    fn scopes(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    /// Register A and B and give A an active credential granting `granted`.
    fn seed_issuer(fixture: &Fixture, granted: &[&str]) {
        register(fixture, "agent-a");
        register(fixture, "agent-b");
        fixture
            .credentials
            .issue("agent-a", &scopes(granted), 3600, "owner-dev")
            .expect("credential");
    }

    #[test]
    fn root_issuance_attenuates_against_issuer_credentials() {
        let fixture = fixture();
        seed_issuer(&fixture, &["read", "write"]);

        let issued = fixture
            .tokens
            .issue("agent-a", "agent-b", &scopes(&["read"]), 3600, None, "owner-dev")
            .expect("issue");
        assert_eq!(issued.chain_depth, 0);
        assert_eq!(issued.delegated_scopes, scopes(&["read"]));
        assert!(issued.signed_token.starts_with(&issued.token_id));

        // Escalation beyond the issuer's grants is denied.
        let err = fixture
            .tokens
            .issue("agent-a", "agent-b", &scopes(&["admin"]), 3600, None, "owner-dev")
            .expect_err("escalation");
        assert!(err.to_string().contains("escalation"));
    }

    #[test]
    fn verify_round_trips_and_rejects_tampered_signature() {
        let fixture = fixture();
        seed_issuer(&fixture, &["read"]);
        let issued = fixture
            .tokens
            .issue("agent-a", "agent-b", &scopes(&["read"]), 3600, None, "owner-dev")
            .expect("issue");

        let verified = fixture.tokens.verify(&issued.signed_token).expect("verify");
        assert!(verified.valid);
        assert_eq!(verified.subject_agent_id, "agent-b");

        let tampered = format!("{}.{}", issued.token_id, "0".repeat(64));
        assert!(matches!(
            fixture.tokens.verify(&tampered),
            Err(Error::Unauthenticated(_))
        ));
    }

    #[test]
    fn child_expiry_is_capped_by_parent() {
        let fixture = fixture();
        seed_issuer(&fixture, &["read", "write"]);
        register(&fixture, "agent-c");

        let parent = fixture
            .tokens
            .issue("agent-a", "agent-b", &scopes(&["read", "write"]), 600, None, "owner-dev")
            .expect("parent");
        let child = fixture
            .tokens
            .issue(
                "agent-a",
                "agent-c",
                &scopes(&["read"]),
                86_400,
                Some(&parent.token_id),
                "owner-dev",
            )
            .expect("child");

        assert_eq!(child.chain_depth, 1);
        assert!(child.expires_at_epoch <= parent.expires_at_epoch);
    }

    #[test]
    fn depth_limit_rejects_issuance_past_five() {
        let fixture = fixture();
        seed_issuer(&fixture, &["*"]);

        let mut parent: Option<String> = None;
        for depth in 0..=5u32 {
            let issued = fixture
                .tokens
                .issue(
                    "agent-a",
                    "agent-b",
                    &scopes(&["read"]),
                    3600,
                    parent.as_deref(),
                    "owner-dev",
                )
                .unwrap_or_else(|e| panic!("depth {depth} should issue: {e}"));
            assert_eq!(issued.chain_depth, depth);
            parent = Some(issued.token_id);
        }

        let err = fixture
            .tokens
            .issue("agent-a", "agent-b", &scopes(&["read"]), 3600, parent.as_deref(), "owner-dev")
            .expect_err("depth 6 issuance");
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn revoking_intermediary_invalidates_descendants_at_verify() {
        let fixture = fixture();
        seed_issuer(&fixture, &["read", "write"]);
        register(&fixture, "agent-c");

        let root = fixture
            .tokens
            .issue("agent-a", "agent-b", &scopes(&["read", "write"]), 3600, None, "owner-dev")
            .expect("root");
        let child = fixture
            .tokens
            .issue(
                "agent-a",
                "agent-c",
                &scopes(&["read"]),
                3600,
                Some(&root.token_id),
                "owner-dev",
            )
            .expect("child");

        let revocation = fixture.tokens.revoke(&root.token_id, "owner-dev").expect("revoke");
        assert!(revocation.revoked);
        assert_eq!(revocation.cascade_count, 1);

        // Both the root and the descendant fail verification afterwards.
        assert!(fixture.tokens.verify(&root.signed_token).is_err());
        assert!(fixture.tokens.verify(&child.signed_token).is_err());
    }

    #[test]
    fn chain_renders_root_first() {
        let fixture = fixture();
        seed_issuer(&fixture, &["read", "write"]);
        register(&fixture, "agent-c");

        let root = fixture
            .tokens
            .issue("agent-a", "agent-b", &scopes(&["read", "write"]), 3600, None, "owner-dev")
            .expect("root");
        let leaf = fixture
            .tokens
            .issue(
                "agent-a",
                "agent-c",
                &scopes(&["read"]),
                3600,
                Some(&root.token_id),
                "owner-dev",
            )
            .expect("leaf");

        let chain = fixture.tokens.get_chain(&leaf.token_id).expect("chain");
        assert_eq!(chain.chain.len(), 2);
        assert_eq!(chain.chain[0].token_id, root.token_id);
        assert_eq!(chain.chain[1].token_id, leaf.token_id);
        assert_eq!(chain.effective_scopes, scopes(&["read"]));
    }

    #[test]
    fn wildcard_parent_permits_any_child_scopes() {
        let fixture = fixture();
        seed_issuer(&fixture, &["*"]);
        let root = fixture
            .tokens
            .issue("agent-a", "agent-b", &scopes(&["*"]), 3600, None, "owner-dev")
            .expect("root with wildcard");
        let child = fixture
            .tokens
            .issue(
                "agent-a",
                "agent-b",
                &scopes(&["anything.custom"]),
                3600,
                Some(&root.token_id),
                "owner-dev",
            )
            .expect("child");
        assert_eq!(child.delegated_scopes, scopes(&["anything.custom"]));
    }
}
