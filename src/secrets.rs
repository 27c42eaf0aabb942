//! Process-wide signing secrets and HMAC primitives.
//!
//! All secrets are loaded once at startup from `AGENTHUB_*` environment
//! variables; rotating any of them requires a restart. Absence of a required
//! secret in enforce mode aborts startup (fail-closed).

use std::collections::BTreeMap;

use hmac::{KeyInit, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// Environment variable carrying the bearer-token signing secret.
pub const AUTH_TOKEN_SECRET_VAR: &str = "AGENTHUB_AUTH_TOKEN_SECRET";
/// Environment variable carrying the identity/delegation signing secret.
pub const IDENTITY_SIGNING_SECRET_VAR: &str = "AGENTHUB_IDENTITY_SIGNING_SECRET";
/// Environment variable carrying the provenance signing secret.
pub const PROVENANCE_SIGNING_SECRET_VAR: &str = "AGENTHUB_PROVENANCE_SIGNING_SECRET";
/// Environment variable carrying the policy signing secret.
pub const POLICY_SIGNING_SECRET_VAR: &str = "AGENTHUB_POLICY_SIGNING_SECRET";

/// The process signing secrets, resolved at startup.
#[derive(Clone)]
pub struct SigningSecrets {
    /// Secret for bearer (JWT) token signing and verification.
    pub auth_token: String,
    /// Secret for credential hashes, delegation tokens, and attestations.
    pub identity_signing: String,
    /// Secret for provenance manifests (external collaborator contract).
    pub provenance_signing: String,
    /// Secret for policy pack signatures (external collaborator contract).
    pub policy_signing: String,
}

impl std::fmt::Debug for SigningSecrets {
    // Never leak secret material through Debug formatting.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningSecrets").finish_non_exhaustive()
    }
}

impl SigningSecrets {
    /// Resolve all signing secrets from an environment snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first missing or empty variable.
    pub fn from_env_map(env: &BTreeMap<String, String>) -> Result<Self> {
        let fetch = |key: &str| -> Result<String> {
            match env.get(key) {
                Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
                _ => Err(Error::Config(format!("{key} is required"))),
            }
        };
        Ok(Self {
            auth_token: fetch(AUTH_TOKEN_SECRET_VAR)?,
            identity_signing: fetch(IDENTITY_SIGNING_SECRET_VAR)?,
            provenance_signing: fetch(PROVENANCE_SIGNING_SECRET_VAR)?,
            policy_signing: fetch(POLICY_SIGNING_SECRET_VAR)?,
        })
    }

    /// Resolve all signing secrets from the process environment.
    pub fn from_process_env() -> Result<Self> {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&env)
    }

    /// HMAC-SHA256 of `payload` under the identity signing secret, hex-encoded.
    ///
    /// Used for credential hashes, delegation token signatures, and
    /// attestation signatures.
    #[must_use]
    pub fn identity_hmac_hex(&self, payload: &[u8]) -> String {
        hmac_sha256_hex(self.identity_signing.as_bytes(), payload)
    }
}

/// HMAC-SHA256 over `payload` under `key`, hex-encoded.
#[must_use]
pub fn hmac_sha256_hex(key: &[u8], payload: &[u8]) -> String {
    let mut mac = hmac::Hmac::<Sha256>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time equality for hex digests.
///
/// A length mismatch short-circuits: the lengths of the digests we compare
/// are public (always 64 hex chars), only the content is secret.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
