//! Identity-scope persistence.
//!
//! One SQLite connection, guarded by a single mutex, owns every identity
//! record exclusively: agent identities, credentials (hash-only), delegation
//! tokens, trusted domains, attestations, and the append-only revocation
//! event log. Other subsystems hold weak string ids only.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::clock::utc_now_iso;
use crate::secrets::constant_time_eq;
use crate::store::{Migration, open_scope, open_scope_in_memory};
use crate::{Error, Result};

use super::types::{
    AgentAttestation, AgentCredential, AgentIdentity, CredentialStatus, CredentialType,
    DelegationToken, IdentityStatus, RevocationEvent, TrustLevel, TrustedDomain,
};

const SCOPE: &str = "identity";

const MIGRATIONS: &[Migration] = &[
    (
        "001_agent_identities",
        "CREATE TABLE agent_identities (
            agent_id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            credential_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            human_principal_id TEXT,
            configuration_checksum TEXT,
            public_key_pem TEXT,
            metadata_json TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE INDEX idx_identities_owner ON agent_identities(owner);",
    ),
    (
        "002_agent_credentials",
        "CREATE TABLE agent_credentials (
            credential_id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            credential_hash TEXT NOT NULL,
            scopes_json TEXT NOT NULL,
            issued_at_epoch INTEGER NOT NULL,
            expires_at_epoch INTEGER NOT NULL,
            rotation_parent_id TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            revoked_at TEXT,
            revocation_reason TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE INDEX idx_credentials_agent ON agent_credentials(agent_id, status);
        CREATE UNIQUE INDEX idx_credentials_active_hash
            ON agent_credentials(credential_hash) WHERE status = 'active';",
    ),
    (
        "003_delegation_tokens",
        "CREATE TABLE delegation_tokens (
            token_id TEXT PRIMARY KEY,
            issuer_agent_id TEXT NOT NULL,
            subject_agent_id TEXT NOT NULL,
            delegated_scopes_json TEXT NOT NULL,
            issued_at_epoch INTEGER NOT NULL,
            expires_at_epoch INTEGER NOT NULL,
            parent_token_id TEXT,
            chain_depth INTEGER NOT NULL DEFAULT 0,
            revoked INTEGER NOT NULL DEFAULT 0,
            revoked_at TEXT
        );
        CREATE INDEX idx_tokens_parent ON delegation_tokens(parent_token_id, revoked);
        CREATE INDEX idx_tokens_issuer ON delegation_tokens(issuer_agent_id, revoked);
        CREATE INDEX idx_tokens_subject ON delegation_tokens(subject_agent_id, revoked);",
    ),
    (
        "004_federation",
        "CREATE TABLE trusted_domains (
            domain_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            trust_level TEXT NOT NULL DEFAULT 'verified',
            public_key_pem TEXT,
            allowed_scopes_json TEXT NOT NULL DEFAULT '[]',
            registered_by TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE TABLE agent_attestations (
            attestation_id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            domain_id TEXT NOT NULL,
            claims_json TEXT NOT NULL DEFAULT '{}',
            issued_at_epoch INTEGER NOT NULL,
            expires_at_epoch INTEGER NOT NULL,
            signature TEXT NOT NULL
        );
        CREATE INDEX idx_attestations_agent ON agent_attestations(agent_id);",
    ),
    (
        "005_revocation_events",
        "CREATE TABLE revocation_events (
            event_id TEXT PRIMARY KEY,
            revoked_type TEXT NOT NULL,
            revoked_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            actor TEXT NOT NULL,
            cascade_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE INDEX idx_revocation_events_agent ON revocation_events(agent_id, created_at);",
    ),
];

/// Inputs for registering a new agent identity.
#[derive(Debug, Clone, Default)]
pub struct NewIdentity {
    /// Unique agent identifier.
    pub agent_id: String,
    /// Owning principal.
    pub owner: String,
    /// Credential mechanism.
    pub credential_type: Option<CredentialType>,
    /// Optional on-behalf-of human principal.
    pub human_principal_id: Option<String>,
    /// Optional SHA-256 of the canonical manifest.
    pub configuration_checksum: Option<String>,
    /// Optional PEM public key.
    pub public_key_pem: Option<String>,
    /// Opaque metadata.
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Inputs for inserting a credential record (hash only, never plaintext).
#[derive(Debug, Clone)]
pub struct NewCredential {
    /// Credential identifier.
    pub credential_id: String,
    /// Owning agent.
    pub agent_id: String,
    /// HMAC-SHA256 of the secret under the identity signing key.
    pub credential_hash: String,
    /// Sorted, deduplicated scopes.
    pub scopes: Vec<String>,
    /// Issuance time (epoch seconds).
    pub issued_at_epoch: i64,
    /// Expiry (epoch seconds).
    pub expires_at_epoch: i64,
    /// Rotation parent, when issued by rotation.
    pub rotation_parent_id: Option<String>,
}

/// Inputs for inserting a delegation token record.
#[derive(Debug, Clone)]
pub struct NewDelegationToken {
    /// Token identifier.
    pub token_id: String,
    /// Granting agent.
    pub issuer_agent_id: String,
    /// Acting agent.
    pub subject_agent_id: String,
    /// Attenuated scopes.
    pub delegated_scopes: Vec<String>,
    /// Issuance time (epoch seconds).
    pub issued_at_epoch: i64,
    /// Expiry (epoch seconds).
    pub expires_at_epoch: i64,
    /// Parent edge, absent at the root.
    pub parent_token_id: Option<String>,
    /// Chain depth (0 at root).
    pub chain_depth: u32,
}

/// Identity-scope store handle.
pub struct IdentityStore {
    conn: Mutex<Connection>,
}

impl IdentityStore {
    /// Open the identity database at `path`, applying migrations.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_scope(path, SCOPE, MIGRATIONS)?),
        })
    }

    /// Open an isolated in-memory store (tests).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_scope_in_memory(SCOPE, MIGRATIONS)?),
        })
    }

    // ── Agent identities ──────────────────────────────────────────────────

    /// Register a new identity with `status = active`.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] when `agent_id` collides.
    pub fn register_identity(&self, new: &NewIdentity) -> Result<AgentIdentity> {
        let conn = self.conn.lock();
        let metadata_json = new
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = conn.execute(
            "INSERT INTO agent_identities(
                agent_id, owner, credential_type, status, human_principal_id,
                configuration_checksum, public_key_pem, metadata_json
            ) VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7)",
            params![
                new.agent_id,
                new.owner,
                new.credential_type.unwrap_or(CredentialType::ApiKey).as_str(),
                new.human_principal_id,
                new.configuration_checksum,
                new.public_key_pem,
                metadata_json,
            ],
        );
        match result {
            Ok(_) => get_identity_on(&conn, &new.agent_id),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists(format!(
                    "agent identity already exists: {}",
                    new.agent_id
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch an identity by id.
    pub fn get_identity(&self, agent_id: &str) -> Result<AgentIdentity> {
        get_identity_on(&self.conn.lock(), agent_id)
    }

    /// Update an identity's status, bumping `updated_at`.
    pub fn update_identity_status(
        &self,
        agent_id: &str,
        status: IdentityStatus,
    ) -> Result<AgentIdentity> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE agent_identities
             SET status = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE agent_id = ?2",
            params![status.as_str(), agent_id],
        )?;
        if affected == 0 {
            return Err(Error::NotFound(format!(
                "agent identity not found: {agent_id}"
            )));
        }
        get_identity_on(&conn, agent_id)
    }

    /// List identities belonging to `owner`, newest first.
    pub fn list_identities(&self, owner: &str) -> Result<Vec<AgentIdentity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM agent_identities WHERE owner = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([owner], row_to_identity)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ── Credentials ───────────────────────────────────────────────────────

    /// Insert a credential record. Multiple active credentials per agent are
    /// permitted; a second active credential with the same hash is not.
    pub fn insert_credential(&self, new: &NewCredential) -> Result<()> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO agent_credentials(
                credential_id, agent_id, credential_hash, scopes_json,
                issued_at_epoch, expires_at_epoch, rotation_parent_id, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active')",
            params![
                new.credential_id,
                new.agent_id,
                new.credential_hash,
                serde_json::to_string(&new.scopes)?,
                new.issued_at_epoch,
                new.expires_at_epoch,
                new.rotation_parent_id,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists(format!(
                    "credential collides with an existing active record: {}",
                    new.credential_id
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch a credential by id.
    pub fn get_credential(&self, credential_id: &str) -> Result<AgentCredential> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM agent_credentials WHERE credential_id = ?1",
            [credential_id],
            row_to_credential,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("credential not found: {credential_id}")))
    }

    /// Find the active credential matching `credential_hash`.
    ///
    /// The index lookup narrows to the candidate row; the stored hash is then
    /// re-compared in constant time before the record is released.
    pub fn find_credential_by_hash(&self, credential_hash: &str) -> Result<Option<AgentCredential>> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT * FROM agent_credentials
                 WHERE credential_hash = ?1 AND status = 'active'",
                [credential_hash],
                |row| {
                    let stored: String = row.get("credential_hash")?;
                    Ok((row_to_credential(row)?, stored))
                },
            )
            .optional()?;
        Ok(found.and_then(|(record, stored)| {
            constant_time_eq(&stored, credential_hash).then_some(record)
        }))
    }

    /// Transition a credential out of `active` under an optimistic guard.
    ///
    /// The UPDATE carries `WHERE status = 'active'`; zero affected rows means
    /// another writer got there first (rotate-after-revoke race) and surfaces
    /// as [`Error::Conflict`].
    pub fn update_credential_status_if_active(
        &self,
        credential_id: &str,
        new_status: CredentialStatus,
        reason: Option<&str>,
    ) -> Result<AgentCredential> {
        let conn = self.conn.lock();
        let affected = if new_status == CredentialStatus::Revoked {
            conn.execute(
                "UPDATE agent_credentials
                 SET status = ?1,
                     revoked_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                     revocation_reason = ?2
                 WHERE credential_id = ?3 AND status = 'active'",
                params![new_status.as_str(), reason, credential_id],
            )?
        } else {
            conn.execute(
                "UPDATE agent_credentials
                 SET status = ?1
                 WHERE credential_id = ?2 AND status = 'active'",
                params![new_status.as_str(), credential_id],
            )?
        };
        if affected == 0 {
            // Distinguish a missing credential from a lost race.
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM agent_credentials WHERE credential_id = ?1",
                    [credential_id],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            return if exists {
                Err(Error::Conflict(format!(
                    "credential is not active: {credential_id}"
                )))
            } else {
                Err(Error::NotFound(format!(
                    "credential not found: {credential_id}"
                )))
            };
        }
        drop(conn);
        self.get_credential(credential_id)
    }

    /// List the active credentials for an agent, newest first.
    pub fn list_active_credentials(&self, agent_id: &str) -> Result<Vec<AgentCredential>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM agent_credentials
             WHERE agent_id = ?1 AND status = 'active'
             ORDER BY issued_at_epoch DESC",
        )?;
        let rows = stmt.query_map([agent_id], row_to_credential)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Revoke every active credential of `agent_id` in a single UPDATE.
    /// Returns the affected count.
    pub fn revoke_all_credentials(&self, agent_id: &str, reason: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE agent_credentials
             SET status = 'revoked',
                 revoked_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                 revocation_reason = ?1
             WHERE agent_id = ?2 AND status = 'active'",
            params![reason, agent_id],
        )?;
        Ok(affected)
    }

    // ── Delegation tokens ─────────────────────────────────────────────────

    /// Insert a delegation token record.
    pub fn insert_token(&self, new: &NewDelegationToken) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO delegation_tokens(
                token_id, issuer_agent_id, subject_agent_id, delegated_scopes_json,
                issued_at_epoch, expires_at_epoch, parent_token_id, chain_depth
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.token_id,
                new.issuer_agent_id,
                new.subject_agent_id,
                serde_json::to_string(&new.delegated_scopes)?,
                new.issued_at_epoch,
                new.expires_at_epoch,
                new.parent_token_id,
                new.chain_depth,
            ],
        )?;
        Ok(())
    }

    /// Fetch a delegation token by id, when present.
    pub fn get_token(&self, token_id: &str) -> Result<Option<DelegationToken>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM delegation_tokens WHERE token_id = ?1",
            [token_id],
            row_to_token,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Revoke `token_id` and every descendant reachable via
    /// `parent_token_id`, atomically within one write transaction.
    ///
    /// Returns the number of descendants revoked (the root itself excluded).
    pub fn revoke_token_cascade(&self, token_id: &str) -> Result<usize> {
        let mut guard = self.conn.lock();
        let now = utc_now_iso();
        let tx = guard.transaction()?;
        tx.execute(
            "UPDATE delegation_tokens SET revoked = 1, revoked_at = ?1
             WHERE token_id = ?2 AND revoked = 0",
            params![now, token_id],
        )?;

        let mut cascade = 0usize;
        let mut frontier = vec![token_id.to_string()];
        while let Some(parent) = frontier.pop() {
            let children: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT token_id FROM delegation_tokens
                     WHERE parent_token_id = ?1 AND revoked = 0",
                )?;
                let rows = stmt.query_map([&parent], |row| row.get(0))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };
            for child in children {
                tx.execute(
                    "UPDATE delegation_tokens SET revoked = 1, revoked_at = ?1
                     WHERE token_id = ?2",
                    params![now, child],
                )?;
                cascade += 1;
                frontier.push(child);
            }
        }
        tx.commit()?;
        Ok(cascade)
    }

    /// Revoke every live token where `agent_id` is issuer or subject,
    /// cascading to all descendants of each revoked edge. Returns the total
    /// affected count.
    pub fn revoke_tokens_for_agent(&self, agent_id: &str) -> Result<usize> {
        let mut guard = self.conn.lock();
        let now = utc_now_iso();
        let tx = guard.transaction()?;

        let direct: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT token_id FROM delegation_tokens
                 WHERE (issuer_agent_id = ?1 OR subject_agent_id = ?1) AND revoked = 0",
            )?;
            let rows = stmt.query_map([agent_id], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut count = 0usize;
        let mut frontier = direct;
        while let Some(token_id) = frontier.pop() {
            let affected = tx.execute(
                "UPDATE delegation_tokens SET revoked = 1, revoked_at = ?1
                 WHERE token_id = ?2 AND revoked = 0",
                params![now, token_id],
            )?;
            if affected == 0 {
                continue;
            }
            count += 1;
            let children: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT token_id FROM delegation_tokens
                     WHERE parent_token_id = ?1 AND revoked = 0",
                )?;
                let rows = stmt.query_map([&token_id], |row| row.get(0))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };
            frontier.extend(children);
        }
        tx.commit()?;
        Ok(count)
    }

    // ── Trusted domains & attestations ────────────────────────────────────

    /// Register a trusted federation domain.
    pub fn insert_domain(&self, domain: &TrustedDomain) -> Result<()> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO trusted_domains(
                domain_id, display_name, trust_level, public_key_pem,
                allowed_scopes_json, registered_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                domain.domain_id,
                domain.display_name,
                domain.trust_level.as_str(),
                domain.public_key_pem,
                serde_json::to_string(&domain.allowed_scopes)?,
                domain.registered_by,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists(format!(
                    "domain already registered: {}",
                    domain.domain_id
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch a trusted domain.
    pub fn get_domain(&self, domain_id: &str) -> Result<TrustedDomain> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM trusted_domains WHERE domain_id = ?1",
            [domain_id],
            row_to_domain,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("trusted domain not found: {domain_id}")))
    }

    /// Update a domain's trust level, bumping `updated_at`.
    pub fn update_domain_trust_level(
        &self,
        domain_id: &str,
        trust_level: TrustLevel,
    ) -> Result<TrustedDomain> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE trusted_domains
             SET trust_level = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE domain_id = ?2",
            params![trust_level.as_str(), domain_id],
        )?;
        if affected == 0 {
            return Err(Error::NotFound(format!(
                "trusted domain not found: {domain_id}"
            )));
        }
        drop(conn);
        self.get_domain(domain_id)
    }

    /// List trusted domains, newest first (capped).
    pub fn list_domains(&self, limit: usize) -> Result<Vec<TrustedDomain>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM trusted_domains ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], row_to_domain)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Insert an attestation record.
    pub fn insert_attestation(&self, attestation: &AgentAttestation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_attestations(
                attestation_id, agent_id, domain_id, claims_json,
                issued_at_epoch, expires_at_epoch, signature
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                attestation.attestation_id,
                attestation.agent_id,
                attestation.domain_id,
                serde_json::to_string(&attestation.claims)?,
                attestation.issued_at_epoch,
                attestation.expires_at_epoch,
                attestation.signature,
            ],
        )?;
        Ok(())
    }

    /// Fetch an attestation by id.
    pub fn get_attestation(&self, attestation_id: &str) -> Result<AgentAttestation> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM agent_attestations WHERE attestation_id = ?1",
            [attestation_id],
            row_to_attestation,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("attestation not found: {attestation_id}")))
    }

    // ── Revocation events ─────────────────────────────────────────────────

    /// Append a revocation event to the audit log. Events are never mutated.
    pub fn insert_revocation_event(&self, event: &RevocationEvent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO revocation_events(
                event_id, revoked_type, revoked_id, agent_id, reason, actor, cascade_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id,
                event.revoked_type,
                event.revoked_id,
                event.agent_id,
                event.reason,
                event.actor,
                event.cascade_count,
            ],
        )?;
        Ok(())
    }

    /// List revocation events, newest first, optionally filtered by agent.
    pub fn list_revocation_events(
        &self,
        agent_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RevocationEvent>> {
        let conn = self.conn.lock();
        let rows = if let Some(agent_id) = agent_id {
            let mut stmt = conn.prepare(
                "SELECT * FROM revocation_events WHERE agent_id = ?1
                 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let mapped = stmt.query_map(params![agent_id, limit], row_to_event)?;
            mapped.collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(
                "SELECT * FROM revocation_events ORDER BY created_at DESC LIMIT ?1",
            )?;
            let mapped = stmt.query_map([limit], row_to_event)?;
            mapped.collect::<std::result::Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────────

fn get_identity_on(conn: &Connection, agent_id: &str) -> Result<AgentIdentity> {
    conn.query_row(
        "SELECT * FROM agent_identities WHERE agent_id = ?1",
        [agent_id],
        row_to_identity,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("agent identity not found: {agent_id}")))
}

fn parse_scopes(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn row_to_identity(row: &Row<'_>) -> rusqlite::Result<AgentIdentity> {
    let metadata_raw: Option<String> = row.get("metadata_json")?;
    let credential_type: String = row.get("credential_type")?;
    let status: String = row.get("status")?;
    Ok(AgentIdentity {
        agent_id: row.get("agent_id")?,
        owner: row.get("owner")?,
        credential_type: CredentialType::from_str(&credential_type)
            .unwrap_or(CredentialType::ApiKey),
        status: IdentityStatus::from_str(&status).unwrap_or(IdentityStatus::Revoked),
        human_principal_id: row.get("human_principal_id")?,
        configuration_checksum: row.get("configuration_checksum")?,
        public_key_pem: row.get("public_key_pem")?,
        metadata: metadata_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_credential(row: &Row<'_>) -> rusqlite::Result<AgentCredential> {
    let scopes_raw: String = row.get("scopes_json")?;
    let status: String = row.get("status")?;
    Ok(AgentCredential {
        credential_id: row.get("credential_id")?,
        agent_id: row.get("agent_id")?,
        scopes: parse_scopes(&scopes_raw),
        issued_at_epoch: row.get("issued_at_epoch")?,
        expires_at_epoch: row.get("expires_at_epoch")?,
        rotation_parent_id: row.get("rotation_parent_id")?,
        status: CredentialStatus::from_str(&status).unwrap_or(CredentialStatus::Revoked),
        revoked_at: row.get("revoked_at")?,
        revocation_reason: row.get("revocation_reason")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_token(row: &Row<'_>) -> rusqlite::Result<DelegationToken> {
    let scopes_raw: String = row.get("delegated_scopes_json")?;
    let revoked: i64 = row.get("revoked")?;
    Ok(DelegationToken {
        token_id: row.get("token_id")?,
        issuer_agent_id: row.get("issuer_agent_id")?,
        subject_agent_id: row.get("subject_agent_id")?,
        delegated_scopes: parse_scopes(&scopes_raw),
        issued_at_epoch: row.get("issued_at_epoch")?,
        expires_at_epoch: row.get("expires_at_epoch")?,
        parent_token_id: row.get("parent_token_id")?,
        chain_depth: row.get("chain_depth")?,
        revoked: revoked != 0,
        revoked_at: row.get("revoked_at")?,
    })
}

fn row_to_domain(row: &Row<'_>) -> rusqlite::Result<TrustedDomain> {
    let scopes_raw: String = row.get("allowed_scopes_json")?;
    let trust_level: String = row.get("trust_level")?;
    Ok(TrustedDomain {
        domain_id: row.get("domain_id")?,
        display_name: row.get("display_name")?,
        trust_level: TrustLevel::from_str(&trust_level).unwrap_or(TrustLevel::Revoked),
        public_key_pem: row.get("public_key_pem")?,
        allowed_scopes: parse_scopes(&scopes_raw),
        registered_by: row.get("registered_by")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_attestation(row: &Row<'_>) -> rusqlite::Result<AgentAttestation> {
    let claims_raw: String = row.get("claims_json")?;
    Ok(AgentAttestation {
        attestation_id: row.get("attestation_id")?,
        agent_id: row.get("agent_id")?,
        domain_id: row.get("domain_id")?,
        claims: serde_json::from_str(&claims_raw).unwrap_or_default(),
        issued_at_epoch: row.get("issued_at_epoch")?,
        expires_at_epoch: row.get("expires_at_epoch")?,
        signature: row.get("signature")?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<RevocationEvent> {
    Ok(RevocationEvent {
        event_id: row.get("event_id")?,
        revoked_type: row.get("revoked_type")?,
        revoked_id: row.get("revoked_id")?,
        agent_id: row.get("agent_id")?,
        reason: row.get("reason")?,
        actor: row.get("actor")?,
        cascade_count: row.get("cascade_count")?,
        created_at: row.get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> IdentityStore {
        IdentityStore::open_in_memory().expect("open")
    }

    fn register(store: &IdentityStore, agent_id: &str, owner: &str) -> AgentIdentity {
        store
            .register_identity(&NewIdentity {
                agent_id: agent_id.to_string(),
                owner: owner.to_string(),
                ..NewIdentity::default()
            })
            .expect("register")
    }

    fn credential(agent_id: &str, hash: &str) -> NewCredential {
        NewCredential {
            credential_id: format!("cred-{hash}"),
            agent_id: agent_id.to_string(),
            credential_hash: hash.to_string(),
            scopes: vec!["read".to_string()],
            issued_at_epoch: 1_000,
            expires_at_epoch: 2_000,
            rotation_parent_id: None,
        }
    }

    // ── identities ────────────────────────────────────────────────────────

    #[test]
    fn register_then_get_round_trips() {
        let store = store();
        let created = register(&store, "agent-a", "owner-dev");
        assert_eq!(created.status, IdentityStatus::Active);

        let fetched = store.get_identity("agent-a").expect("get");
        assert_eq!(fetched.owner, "owner-dev");
        assert_eq!(fetched.credential_type, CredentialType::ApiKey);
    }

    #[test]
    fn duplicate_registration_is_already_exists() {
        let store = store();
        register(&store, "agent-a", "owner-dev");
        let err = store
            .register_identity(&NewIdentity {
                agent_id: "agent-a".to_string(),
                owner: "owner-dev".to_string(),
                ..NewIdentity::default()
            })
            .expect_err("collision");
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn status_update_missing_identity_is_not_found() {
        let store = store();
        let err = store
            .update_identity_status("missing", IdentityStatus::Suspended)
            .expect_err("missing");
        assert!(matches!(err, Error::NotFound(_)));
    }

    // ── credentials ───────────────────────────────────────────────────────

    #[test]
    fn find_by_hash_returns_only_active_match() {
        let store = store();
        register(&store, "agent-a", "owner-dev");
        store.insert_credential(&credential("agent-a", "hash-1")).expect("insert");

        let found = store.find_credential_by_hash("hash-1").expect("query");
        assert!(found.is_some());
        assert!(store.find_credential_by_hash("hash-2").expect("query").is_none());
    }

    #[test]
    fn second_active_credential_with_same_hash_is_rejected() {
        let store = store();
        register(&store, "agent-a", "owner-dev");
        store.insert_credential(&credential("agent-a", "hash-1")).expect("first");
        let mut dup = credential("agent-a", "hash-1");
        dup.credential_id = "cred-other".to_string();
        assert!(matches!(
            store.insert_credential(&dup),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn optimistic_guard_rejects_second_transition() {
        let store = store();
        register(&store, "agent-a", "owner-dev");
        store.insert_credential(&credential("agent-a", "hash-1")).expect("insert");

        let rotated = store
            .update_credential_status_if_active("cred-hash-1", CredentialStatus::Rotated, None)
            .expect("first transition");
        assert_eq!(rotated.status, CredentialStatus::Rotated);

        // The credential already left `active`; the revoke must lose the race.
        let err = store
            .update_credential_status_if_active(
                "cred-hash-1",
                CredentialStatus::Revoked,
                Some("too late"),
            )
            .expect_err("second transition");
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn revoke_all_counts_only_active_rows() {
        let store = store();
        register(&store, "agent-a", "owner-dev");
        store.insert_credential(&credential("agent-a", "hash-1")).expect("insert");
        store.insert_credential(&credential("agent-a", "hash-2")).expect("insert");
        store
            .update_credential_status_if_active("cred-hash-1", CredentialStatus::Rotated, None)
            .expect("rotate one");

        let revoked = store
            .revoke_all_credentials("agent-a", "incident")
            .expect("revoke all");
        assert_eq!(revoked, 1);
    }

    // ── delegation token cascade ──────────────────────────────────────────

    fn token(id: &str, parent: Option<&str>, depth: u32) -> NewDelegationToken {
        NewDelegationToken {
            token_id: id.to_string(),
            issuer_agent_id: "agent-a".to_string(),
            subject_agent_id: "agent-b".to_string(),
            delegated_scopes: vec!["read".to_string()],
            issued_at_epoch: 1_000,
            expires_at_epoch: 9_999_999_999,
            parent_token_id: parent.map(ToString::to_string),
            chain_depth: depth,
        }
    }

    #[test]
    fn cascade_revokes_all_descendants() {
        let store = store();
        store.insert_token(&token("dtk-root", None, 0)).expect("root");
        store.insert_token(&token("dtk-child", Some("dtk-root"), 1)).expect("child");
        store
            .insert_token(&token("dtk-grandchild", Some("dtk-child"), 2))
            .expect("grandchild");

        let cascade = store.revoke_token_cascade("dtk-root").expect("cascade");
        assert_eq!(cascade, 2);

        for id in ["dtk-root", "dtk-child", "dtk-grandchild"] {
            let record = store.get_token(id).expect("get").expect("present");
            assert!(record.revoked, "{id} must be revoked");
            assert!(record.revoked_at.is_some());
        }
    }

    #[test]
    fn agent_wide_revoke_covers_issuer_subject_and_descendants() {
        let store = store();
        // agent-a issues dtk-1 to agent-b.
        store.insert_token(&token("dtk-1", None, 0)).expect("insert");
        // agent-a is the subject of dtk-2, issued by someone else.
        let mut as_subject = token("dtk-2", None, 0);
        as_subject.issuer_agent_id = "agent-x".to_string();
        as_subject.subject_agent_id = "agent-a".to_string();
        store.insert_token(&as_subject).expect("insert");
        // dtk-3 descends from dtk-1 but names neither edge on agent-a.
        let mut descendant = token("dtk-3", Some("dtk-1"), 1);
        descendant.issuer_agent_id = "agent-b".to_string();
        descendant.subject_agent_id = "agent-c".to_string();
        store.insert_token(&descendant).expect("insert");

        let revoked = store.revoke_tokens_for_agent("agent-a").expect("revoke");
        assert_eq!(revoked, 3, "descendants of revoked edges cascade too");
        for id in ["dtk-1", "dtk-2", "dtk-3"] {
            assert!(store.get_token(id).expect("get").expect("present").revoked);
        }
    }

    // ── revocation events ─────────────────────────────────────────────────

    #[test]
    fn events_are_append_only_and_listable() {
        let store = store();
        let event = RevocationEvent {
            event_id: "rev-1".to_string(),
            revoked_type: "agent_identity".to_string(),
            revoked_id: "agent-a".to_string(),
            agent_id: "agent-a".to_string(),
            reason: "incident".to_string(),
            actor: "owner-dev".to_string(),
            cascade_count: 3,
            created_at: String::new(),
        };
        store.insert_revocation_event(&event).expect("insert");

        let listed = store
            .list_revocation_events(Some("agent-a"), 10)
            .expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].cascade_count, 3);
        assert!(store
            .list_revocation_events(Some("agent-b"), 10)
            .expect("list")
            .is_empty());
    }
}
