//! Delegation contract v2: the SLA, stage timeouts, retry matrix, and
//! budget-breaker percentages advertised to callers.

use std::sync::LazyLock;

use serde_json::{Value, json};

/// The delegation contract document, stable across the process lifetime.
pub static DELEGATION_CONTRACT_V2: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "version": "delegation-contract-v2",
        "idempotency_required": true,
        "sla": {
            "p95_latency_ms_target": 3000,
            "max_end_to_end_timeout_ms": 8000,
        },
        "timeouts_ms": {
            "discovery": 500,
            "negotiation": 800,
            "execution": 5000,
            "delivery": 800,
            "settlement": 900,
        },
        "retry_matrix": {
            "transient_network_error": {
                "max_retries": 2,
                "backoff_ms": [100, 250],
                "idempotency_required": true,
            },
            "delegate_timeout": {
                "max_retries": 1,
                "backoff_ms": [200],
                "idempotency_required": true,
            },
            "policy_denied": {
                "max_retries": 0,
                "backoff_ms": [],
                "idempotency_required": true,
            },
            "hard_stop_budget": {
                "max_retries": 0,
                "backoff_ms": [],
                "idempotency_required": true,
            },
        },
        "circuit_breakers": {
            "soft_alert_pct": 80,
            "reauthorization_pct": 100,
            "hard_stop_pct": 120,
        },
    })
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_pins_breaker_percentages() {
        let breakers = &DELEGATION_CONTRACT_V2["circuit_breakers"];
        assert_eq!(breakers["soft_alert_pct"], 80);
        assert_eq!(breakers["reauthorization_pct"], 100);
        assert_eq!(breakers["hard_stop_pct"], 120);
    }

    #[test]
    fn contract_requires_idempotency() {
        assert_eq!(DELEGATION_CONTRACT_V2["idempotency_required"], true);
    }
}
