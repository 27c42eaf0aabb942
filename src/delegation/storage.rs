//! Delegation-scope persistence: records, escrow balances, the durable
//! idempotency reservation table, and per-delegation queue state.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{Migration, open_scope, open_scope_in_memory};
use crate::{Error, Result};

const SCOPE: &str = "delegation";

/// Escrow balance seeded for a requester on first contact.
pub const SEED_BALANCE_USD: f64 = 1_000.0;

const MIGRATIONS: &[Migration] = &[
    (
        "001_delegation_records",
        "CREATE TABLE delegation_records (
            delegation_id TEXT PRIMARY KEY,
            requester_agent_id TEXT NOT NULL,
            delegate_agent_id TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            payload_json TEXT NOT NULL
        );
        CREATE INDEX idx_delegation_records_updated
            ON delegation_records(updated_at DESC, delegation_id);",
    ),
    (
        "002_delegation_balances",
        "CREATE TABLE delegation_balances (
            agent_id TEXT PRIMARY KEY,
            balance_usd REAL NOT NULL
        );",
    ),
    (
        "003_delegation_idempotency",
        "CREATE TABLE delegation_idempotency (
            tenant_id TEXT NOT NULL,
            owner TEXT NOT NULL,
            idempotency_key TEXT NOT NULL,
            request_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            response_json TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            PRIMARY KEY (tenant_id, owner, idempotency_key)
        );",
    ),
    (
        "004_delegation_queue_state",
        "CREATE TABLE delegation_queue_state (
            delegation_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );",
    ),
];

/// One lifecycle stage entry of a delegation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleStage {
    /// Stage name (discovery, negotiation, execution, delivery, settlement, feedback).
    pub stage: String,
    /// RFC 3339 stage timestamp.
    pub timestamp: String,
    /// Stage-specific details.
    pub details: Value,
}

/// One audit-trail entry (metering or lifecycle evidence).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Delegation the entry belongs to.
    pub delegation_id: String,
    /// Entry kind (e.g. `llm_call`, `tool_call`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Entry payload.
    pub details: Value,
}

/// Budget state machine verdict for a settled delegation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetControls {
    /// One of `ok`, `soft_alert`, `reauthorization_required`, `hard_stop`.
    pub state: String,
    /// Ratio reached the 80% soft-alert band.
    pub soft_alert: bool,
    /// Ratio reached 100% (regardless of auto-reauthorization).
    pub reauthorization_required: bool,
    /// Ratio reached the 120% hard stop.
    pub hard_stop: bool,
    /// `actual / max(estimated, ε)`, rounded to 4 decimals.
    pub ratio: f64,
}

/// Identity verification context captured at admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityContext {
    /// Requester identity was found and active.
    pub requester_verified: bool,
    /// Delegate identity was found and active.
    pub delegate_verified: bool,
    /// Verified delegation token, when one was supplied.
    pub delegation_token_id: Option<String>,
}

/// Queue state row for a delegation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState {
    /// Delegation id.
    pub delegation_id: String,
    /// Current queue status.
    pub status: String,
    /// Number of admission attempts.
    pub attempt_count: i64,
    /// Last recorded error, if any.
    pub last_error: Option<String>,
    /// RFC 3339 last-update timestamp.
    pub updated_at: String,
}

/// A fully-settled delegation record (lifecycle + audit trail included).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRecord {
    /// Delegation id.
    pub delegation_id: String,
    /// Requesting agent.
    pub requester_agent_id: String,
    /// Delegate agent.
    pub delegate_agent_id: String,
    /// Task description.
    pub task_spec: String,
    /// Estimated cost escrowed at admission.
    pub estimated_cost_usd: f64,
    /// Actual cost computed at settlement.
    pub actual_cost_usd: f64,
    /// Hard budget ceiling.
    pub max_budget_usd: f64,
    /// Final status (completed, pending_reauthorization, failed_hard_stop).
    pub status: String,
    /// Contract document in force.
    pub contract: Value,
    /// Optional upstream policy decision.
    pub policy_decision: Option<Value>,
    /// Ordered lifecycle stages.
    pub lifecycle: Vec<LifecycleStage>,
    /// Metering and evidence entries.
    pub audit_trail: Vec<AuditEntry>,
    /// Budget state machine verdict.
    pub budget_controls: BudgetControls,
    /// Queue state snapshot at persistence time.
    pub queue_state: Option<QueueState>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 last-update timestamp.
    pub updated_at: String,
    /// Identity verification context.
    pub identity_context: IdentityContext,
}

/// Outcome of an idempotency reservation attempt.
#[derive(Debug, Clone)]
pub enum ReservationState {
    /// Slot claimed; caller owns the reservation.
    Reserved,
    /// Same key and hash, but the first attempt has not finished.
    Pending,
    /// Same key with a different request hash.
    Mismatch,
    /// Completed: replay this cached response.
    Response(Value),
}

/// Delegation-scope store handle.
pub struct DelegationStore {
    conn: Mutex<Connection>,
}

impl DelegationStore {
    /// Open the delegation database at `path`, applying migrations.
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

    // ── Records ───────────────────────────────────────────────────────────

    /// Load the most recent records, newest first.
    pub fn load_records(&self, limit: usize) -> Result<Vec<DelegationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM delegation_records
             ORDER BY updated_at DESC, delegation_id LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for payload in rows {
            records.push(serde_json::from_str(&payload?)?);
        }
        Ok(records)
    }

    /// Insert or replace a delegation record.
    pub fn append_record(&self, record: &DelegationRecord) -> Result<()> {
        if record.delegation_id.is_empty() {
            return Err(Error::InvalidArgument("delegation_id is required".to_string()));
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO delegation_records(
                delegation_id, requester_agent_id, delegate_agent_id,
                status, created_at, updated_at, payload_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.delegation_id,
                record.requester_agent_id,
                record.delegate_agent_id,
                record.status,
                record.created_at,
                record.updated_at,
                serde_json::to_string(record)?,
            ],
        )?;
        Ok(())
    }

    /// Fetch a record by id.
    pub fn get_record(&self, delegation_id: &str) -> Result<Option<DelegationRecord>> {
        let conn = self.conn.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM delegation_records WHERE delegation_id = ?1",
                [delegation_id],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|raw| serde_json::from_str(&raw).map_err(Into::into))
            .transpose()
    }

    // ── Escrow balances ───────────────────────────────────────────────────

    /// Current balance for `agent_id`, if the agent has been seen.
    pub fn get_balance(&self, agent_id: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT balance_usd FROM delegation_balances WHERE agent_id = ?1",
            [agent_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Atomically deduct `amount`, seeding unseen agents first.
    ///
    /// The deduct runs as `UPDATE ... WHERE balance_usd >= amount` inside one
    /// transaction; zero affected rows means insufficient funds.
    pub fn deduct_balance(&self, agent_id: &str, amount: f64) -> Result<f64> {
        let mut guard = self.conn.lock();
        let tx = guard.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO delegation_balances(agent_id, balance_usd) VALUES (?1, ?2)",
            params![agent_id, SEED_BALANCE_USD],
        )?;
        let affected = tx.execute(
            "UPDATE delegation_balances
             SET balance_usd = ROUND(balance_usd - ?2, 6)
             WHERE agent_id = ?1 AND balance_usd >= ?2",
            params![agent_id, amount],
        )?;
        if affected == 0 {
            return Err(Error::InvalidArgument(
                "insufficient requester balance for escrow".to_string(),
            ));
        }
        let balance: f64 = tx.query_row(
            "SELECT balance_usd FROM delegation_balances WHERE agent_id = ?1",
            [agent_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(balance)
    }

    /// Atomically credit `amount` (unseen agents start from zero).
    pub fn credit_balance(&self, agent_id: &str, amount: f64) -> Result<f64> {
        let mut guard = self.conn.lock();
        let tx = guard.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO delegation_balances(agent_id, balance_usd) VALUES (?1, 0.0)",
            params![agent_id],
        )?;
        tx.execute(
            "UPDATE delegation_balances
             SET balance_usd = ROUND(balance_usd + ?2, 6)
             WHERE agent_id = ?1",
            params![agent_id, amount],
        )?;
        let balance: f64 = tx.query_row(
            "SELECT balance_usd FROM delegation_balances WHERE agent_id = ?1",
            [agent_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(balance)
    }

    // ── Durable idempotency reservations ──────────────────────────────────

    /// Claim the `(tenant, owner, idempotency_key)` slot or classify the
    /// collision. Tenants never see each other's reservations.
    pub fn reserve_idempotency(
        &self,
        tenant_id: &str,
        owner: &str,
        idempotency_key: &str,
        request_hash: &str,
    ) -> Result<ReservationState> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO delegation_idempotency(
                tenant_id, owner, idempotency_key, request_hash, status, response_json
            ) VALUES (?1, ?2, ?3, ?4, 'pending', NULL)",
            params![tenant_id, owner, idempotency_key, request_hash],
        )?;
        if inserted == 1 {
            return Ok(ReservationState::Reserved);
        }

        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT request_hash, response_json FROM delegation_idempotency
                 WHERE tenant_id = ?1 AND owner = ?2 AND idempotency_key = ?3",
                params![tenant_id, owner, idempotency_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((stored_hash, response_json)) = row else {
            return Ok(ReservationState::Reserved);
        };
        // The reservation retains the first hash for the key's lifetime.
        if stored_hash != request_hash {
            return Ok(ReservationState::Mismatch);
        }
        if let Some(raw) = response_json {
            return Ok(ReservationState::Response(serde_json::from_str(&raw)?));
        }
        Ok(ReservationState::Pending)
    }

    /// Attach the completed response to a reservation.
    pub fn finalize_idempotency(
        &self,
        tenant_id: &str,
        owner: &str,
        idempotency_key: &str,
        response: &Value,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE delegation_idempotency
             SET status = 'completed',
                 response_json = ?4,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE tenant_id = ?1 AND owner = ?2 AND idempotency_key = ?3",
            params![
                tenant_id,
                owner,
                idempotency_key,
                serde_json::to_string(response)?
            ],
        )?;
        Ok(())
    }

    /// Drop a reservation so the client can retry with the same key.
    pub fn clear_idempotency(
        &self,
        tenant_id: &str,
        owner: &str,
        idempotency_key: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM delegation_idempotency
             WHERE tenant_id = ?1 AND owner = ?2 AND idempotency_key = ?3",
            params![tenant_id, owner, idempotency_key],
        )?;
        Ok(())
    }

    // ── Queue state ───────────────────────────────────────────────────────

    /// Upsert the queue state for a delegation.
    pub fn upsert_queue_state(
        &self,
        delegation_id: &str,
        status: &str,
        increment_attempt: bool,
        last_error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let attempt_count: i64 = conn
            .query_row(
                "SELECT attempt_count FROM delegation_queue_state WHERE delegation_id = ?1",
                [delegation_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        let attempt_count = if increment_attempt {
            attempt_count + 1
        } else {
            attempt_count
        };
        conn.execute(
            "INSERT INTO delegation_queue_state(delegation_id, status, attempt_count, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
             ON CONFLICT(delegation_id) DO UPDATE SET
                 status = excluded.status,
                 attempt_count = excluded.attempt_count,
                 last_error = excluded.last_error,
                 updated_at = excluded.updated_at",
            params![delegation_id, status, attempt_count, last_error],
        )?;
        Ok(())
    }

    /// Fetch the queue state for a delegation.
    pub fn get_queue_state(&self, delegation_id: &str) -> Result<Option<QueueState>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT delegation_id, status, attempt_count, last_error, updated_at
             FROM delegation_queue_state WHERE delegation_id = ?1",
            [delegation_id],
            |row| {
                Ok(QueueState {
                    delegation_id: row.get(0)?,
                    status: row.get(1)?,
                    attempt_count: row.get(2)?,
                    last_error: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> DelegationStore {
        DelegationStore::open_in_memory().expect("open")
    }

    // ── balances ──────────────────────────────────────────────────────────

    #[test]
    fn unseen_agent_is_seeded_before_deduct() {
        let store = store();
        let balance = store.deduct_balance("agent-a", 10.0).expect("deduct");
        assert!((balance - 990.0).abs() < 1e-9);
    }

    #[test]
    fn deduct_beyond_balance_is_rejected_and_balance_unchanged() {
        let store = store();
        store.deduct_balance("agent-a", 100.0).expect("seed + deduct");
        let err = store.deduct_balance("agent-a", 10_000.0).expect_err("insufficient");
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!((store.get_balance("agent-a").expect("get").expect("seen") - 900.0).abs() < 1e-9);
    }

    #[test]
    fn credit_and_deduct_conserve_balance() {
        let store = store();
        store.deduct_balance("agent-a", 10.0).expect("deduct");
        store.credit_balance("agent-a", 2.0).expect("credit");
        let balance = store.get_balance("agent-a").expect("get").expect("seen");
        assert!((balance - 992.0).abs() < 1e-9);
    }

    // ── idempotency reservations ──────────────────────────────────────────

    const TENANT: &str = "tenant-default";

    #[test]
    fn first_reservation_is_claimed() {
        let store = store();
        let state = store
            .reserve_idempotency(TENANT, "owner-dev", "K", "hash-1")
            .expect("reserve");
        assert!(matches!(state, ReservationState::Reserved));
    }

    #[test]
    fn duplicate_before_completion_is_pending() {
        let store = store();
        store
            .reserve_idempotency(TENANT, "owner-dev", "K", "hash-1")
            .expect("reserve");
        let state = store
            .reserve_idempotency(TENANT, "owner-dev", "K", "hash-1")
            .expect("again");
        assert!(matches!(state, ReservationState::Pending));
    }

    #[test]
    fn different_hash_on_same_key_is_mismatch() {
        let store = store();
        store
            .reserve_idempotency(TENANT, "owner-dev", "K", "hash-1")
            .expect("reserve");
        let state = store
            .reserve_idempotency(TENANT, "owner-dev", "K", "hash-2")
            .expect("mismatch");
        assert!(matches!(state, ReservationState::Mismatch));
    }

    #[test]
    fn finalized_reservation_replays_response() {
        let store = store();
        store
            .reserve_idempotency(TENANT, "owner-dev", "K", "hash-1")
            .expect("reserve");
        store
            .finalize_idempotency(TENANT, "owner-dev", "K", &json!({"delegation_id": "d-1"}))
            .expect("finalize");
        match store
            .reserve_idempotency(TENANT, "owner-dev", "K", "hash-1")
            .expect("replay")
        {
            ReservationState::Response(body) => assert_eq!(body["delegation_id"], "d-1"),
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn cleared_reservation_can_be_reclaimed() {
        let store = store();
        store
            .reserve_idempotency(TENANT, "owner-dev", "K", "hash-1")
            .expect("reserve");
        store
            .clear_idempotency(TENANT, "owner-dev", "K")
            .expect("clear");
        let state = store
            .reserve_idempotency(TENANT, "owner-dev", "K", "hash-2")
            .expect("reclaim");
        assert!(matches!(state, ReservationState::Reserved));
    }

    #[test]
    fn reservations_are_isolated_per_tenant() {
        let store = store();
        store
            .reserve_idempotency("tenant-a", "owner-dev", "K", "hash-1")
            .expect("tenant-a reserve");
        store
            .finalize_idempotency("tenant-a", "owner-dev", "K", &json!({"delegation_id": "d-a"}))
            .expect("tenant-a finalize");

        // The same owner and key under another tenant is a fresh slot, even
        // with a different request hash.
        let state = store
            .reserve_idempotency("tenant-b", "owner-dev", "K", "hash-2")
            .expect("tenant-b reserve");
        assert!(matches!(state, ReservationState::Reserved));

        // And tenant-a's cached response is untouched.
        match store
            .reserve_idempotency("tenant-a", "owner-dev", "K", "hash-1")
            .expect("tenant-a replay")
        {
            ReservationState::Response(body) => assert_eq!(body["delegation_id"], "d-a"),
            other => panic!("expected Response, got {other:?}"),
        }
    }

    // ── queue state ───────────────────────────────────────────────────────

    #[test]
    fn queue_state_upserts_and_increments_attempts() {
        let store = store();
        store
            .upsert_queue_state("d-1", "queued", true, None)
            .expect("queued");
        store
            .upsert_queue_state("d-1", "running", false, None)
            .expect("running");
        store
            .upsert_queue_state("d-1", "failed", true, Some("boom"))
            .expect("failed");

        let state = store.get_queue_state("d-1").expect("get").expect("present");
        assert_eq!(state.status, "failed");
        assert_eq!(state.attempt_count, 2);
        assert_eq!(state.last_error.as_deref(), Some("boom"));
    }
}
