//! Durable idempotency reservations for mutating API routes.
//!
//! Each slot is keyed by `(tenant, actor, method, route, idempotency-key)`
//! and moves through three observable states:
//!
//! - `pending`: first claim; the caller owns the slot and runs the handler.
//! - `response`: the handler completed < 300 and its response bytes, status,
//!   content type, and whitelisted headers are cached for replay.
//! - `mismatch`: the same key arrived with a different request hash; the
//!   reservation retains the first hash and the duplicate is rejected
//!   deterministically.
//!
//! Reservations are cleared on any ≥ 300 response or handler panic so a
//! retry with a corrected payload is accepted.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

use crate::Result;
use crate::store::{Migration, open_scope, open_scope_in_memory};

const SCOPE: &str = "idempotency";

const MIGRATIONS: &[Migration] = &[(
    "001_api_idempotency",
    "CREATE TABLE api_idempotency (
        tenant_id TEXT NOT NULL,
        actor TEXT NOT NULL,
        method TEXT NOT NULL,
        route TEXT NOT NULL,
        idempotency_key TEXT NOT NULL,
        request_hash TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        response_status INTEGER,
        response_content_type TEXT,
        response_headers_json TEXT,
        response_body BLOB,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        PRIMARY KEY (tenant_id, actor, method, route, idempotency_key)
    );",
)];

/// A cached response ready for replay.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Original status code.
    pub status_code: u16,
    /// Original content type.
    pub content_type: String,
    /// Whitelisted headers (everything except `Content-Length`).
    pub headers: BTreeMap<String, String>,
    /// Original body bytes.
    pub body: Vec<u8>,
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone)]
pub enum Reservation {
    /// Slot claimed; the caller owns it.
    Reserved,
    /// Same key and hash, first attempt still in flight.
    Pending,
    /// Same key, different request hash.
    Mismatch,
    /// Completed: replay this response.
    Response(CachedResponse),
}

/// Hash of the raw request: `SHA-256(method | path | raw_query | raw_body)`.
///
/// The raw body bytes go into the hash, not a parsed representation, so
/// textually-different retries are treated as different payloads.
#[must_use]
pub fn request_hash(method: &str, path: &str, raw_query: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(raw_query.as_bytes());
    hasher.update(b"|");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Slot coordinates.
#[derive(Debug, Clone, Copy)]
pub struct SlotKey<'a> {
    /// Tenant the request targets.
    pub tenant_id: &'a str,
    /// Resolved actor (owner or `anonymous`).
    pub actor: &'a str,
    /// Uppercased HTTP method.
    pub method: &'a str,
    /// Request path.
    pub route: &'a str,
    /// Client-supplied idempotency key.
    pub idempotency_key: &'a str,
}

/// Idempotency-scope store handle.
pub struct IdempotencyStore {
    conn: Mutex<Connection>,
}

impl IdempotencyStore {
    /// Open the idempotency database at `path`, applying migrations.
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

    /// Claim the slot or classify the collision.
    pub fn reserve(&self, key: SlotKey<'_>, request_hash: &str) -> Result<Reservation> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO api_idempotency(
                tenant_id, actor, method, route, idempotency_key, request_hash, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
            params![
                key.tenant_id,
                key.actor,
                key.method,
                key.route,
                key.idempotency_key,
                request_hash,
            ],
        )?;
        if inserted == 1 {
            return Ok(Reservation::Reserved);
        }

        let row = conn
            .query_row(
                "SELECT request_hash, response_status, response_content_type,
                        response_headers_json, response_body
                 FROM api_idempotency
                 WHERE tenant_id = ?1 AND actor = ?2 AND method = ?3
                   AND route = ?4 AND idempotency_key = ?5",
                params![key.tenant_id, key.actor, key.method, key.route, key.idempotency_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<u16>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<Vec<u8>>>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((stored_hash, status, content_type, headers_json, body)) = row else {
            return Ok(Reservation::Reserved);
        };

        if stored_hash != request_hash {
            return Ok(Reservation::Mismatch);
        }
        if let Some(status_code) = status {
            let headers: BTreeMap<String, String> = headers_json
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default();
            return Ok(Reservation::Response(CachedResponse {
                status_code,
                content_type: content_type.unwrap_or_else(|| "application/json".to_string()),
                headers,
                body: body.unwrap_or_default(),
            }));
        }
        Ok(Reservation::Pending)
    }

    /// Attach the completed response to the slot.
    pub fn finalize(&self, key: SlotKey<'_>, response: &CachedResponse) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE api_idempotency
             SET status = 'response',
                 response_status = ?6,
                 response_content_type = ?7,
                 response_headers_json = ?8,
                 response_body = ?9,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE tenant_id = ?1 AND actor = ?2 AND method = ?3
               AND route = ?4 AND idempotency_key = ?5",
            params![
                key.tenant_id,
                key.actor,
                key.method,
                key.route,
                key.idempotency_key,
                response.status_code,
                response.content_type,
                serde_json::to_string(&response.headers)?,
                response.body,
            ],
        )?;
        Ok(())
    }

    /// Drop the slot so retries with the same key are accepted.
    pub fn clear(&self, key: SlotKey<'_>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM api_idempotency
             WHERE tenant_id = ?1 AND actor = ?2 AND method = ?3
               AND route = ?4 AND idempotency_key = ?5",
            params![key.tenant_id, key.actor, key.method, key.route, key.idempotency_key],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key<'a>(idempotency_key: &'a str) -> SlotKey<'a> {
        SlotKey {
            tenant_id: "tenant-default",
            actor: "owner-dev",
            method: "POST",
            route: "/v1/identity/agents",
            idempotency_key,
        }
    }

    fn cached(status: u16) -> CachedResponse {
        CachedResponse {
            status_code: status,
            content_type: "application/json".to_string(),
            headers: BTreeMap::from([("x-request-id".to_string(), "req-1".to_string())]),
            body: br#"{"ok":true}"#.to_vec(),
        }
    }

    #[test]
    fn request_hash_covers_raw_body_bytes() {
        let a = request_hash("POST", "/v1/x", "", br#"{"a":1}"#);
        let b = request_hash("POST", "/v1/x", "", br#"{"a": 1}"#);
        // Semantically equal JSON with different bytes is a different payload.
        assert_ne!(a, b);
        assert_eq!(a, request_hash("POST", "/v1/x", "", br#"{"a":1}"#));
    }

    #[test]
    fn slot_lifecycle_reserved_pending_response() {
        let store = IdempotencyStore::open_in_memory().expect("open");
        let hash = request_hash("POST", "/v1/identity/agents", "", b"{}");

        assert!(matches!(
            store.reserve(key("K"), &hash).expect("reserve"),
            Reservation::Reserved
        ));
        assert!(matches!(
            store.reserve(key("K"), &hash).expect("second"),
            Reservation::Pending
        ));

        store.finalize(key("K"), &cached(201)).expect("finalize");
        match store.reserve(key("K"), &hash).expect("replay") {
            Reservation::Response(response) => {
                assert_eq!(response.status_code, 201);
                assert_eq!(response.body, br#"{"ok":true}"#);
                assert_eq!(response.headers.get("x-request-id").map(String::as_str), Some("req-1"));
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn different_hash_is_mismatch_and_keeps_first_hash() {
        let store = IdempotencyStore::open_in_memory().expect("open");
        let first = request_hash("POST", "/v1/identity/agents", "", b"{\"a\":1}");
        let second = request_hash("POST", "/v1/identity/agents", "", b"{\"a\":2}");

        store.reserve(key("K"), &first).expect("reserve");
        assert!(matches!(
            store.reserve(key("K"), &second).expect("mismatch"),
            Reservation::Mismatch
        ));
        // The first hash still owns the slot.
        assert!(matches!(
            store.reserve(key("K"), &first).expect("original"),
            Reservation::Pending
        ));
    }

    #[test]
    fn clear_makes_the_key_retryable() {
        let store = IdempotencyStore::open_in_memory().expect("open");
        let hash = request_hash("POST", "/v1/identity/agents", "", b"{}");
        store.reserve(key("K"), &hash).expect("reserve");
        store.clear(key("K")).expect("clear");
        assert!(matches!(
            store.reserve(key("K"), &hash).expect("reclaim"),
            Reservation::Reserved
        ));
    }

    #[test]
    fn slots_are_scoped_per_actor_and_tenant() {
        let store = IdempotencyStore::open_in_memory().expect("open");
        let hash = request_hash("POST", "/v1/identity/agents", "", b"{}");
        store.reserve(key("K"), &hash).expect("reserve");

        let other_actor = SlotKey {
            actor: "owner-partner",
            ..key("K")
        };
        assert!(matches!(
            store.reserve(other_actor, &hash).expect("other actor"),
            Reservation::Reserved
        ));

        let other_tenant = SlotKey {
            tenant_id: "tenant-partner",
            ..key("K")
        };
        assert!(matches!(
            store.reserve(other_tenant, &hash).expect("other tenant"),
            Reservation::Reserved
        ));
    }
}
