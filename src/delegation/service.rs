//! Delegation orchestrator.
//!
//! A delegation flows through five lifecycle stages after admission:
//! discovery → negotiation → execution → delivery → settlement → feedback.
//! Admission consults the SLO circuit breaker, identity verification pins
//! both parties, the estimated cost is escrowed before execution, and the
//! budget state machine decides the terminal status at settlement.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::utc_now_iso;
use crate::identity::jit::JitCredentialService;
use crate::identity::store::IdentityStore;
use crate::identity::tokens::DelegationTokenService;
use crate::identity::types::IdentityStatus;
use crate::reliability::{BreakerState, DEFAULT_WINDOW_SIZE, SrePolicy, build_slo_dashboard};
use crate::{Error, Result};

use super::contract::DELEGATION_CONTRACT_V2;
use super::storage::{
    AuditEntry, BudgetControls, DelegationRecord, DelegationStore, IdentityContext, LifecycleStage,
    QueueState,
};

/// Bound on the in-process metering log.
const MAX_METERING_EVENTS: usize = 10_000;

/// Request body for creating a delegation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateDelegation {
    /// Requesting agent.
    pub requester_agent_id: String,
    /// Delegate agent.
    pub delegate_agent_id: String,
    /// Task description.
    pub task_spec: String,
    /// Estimated cost to escrow.
    pub estimated_cost_usd: f64,
    /// Hard budget ceiling.
    pub max_budget_usd: f64,
    /// Simulated actual cost (tests / dry runs).
    #[serde(default)]
    pub simulated_actual_cost_usd: Option<f64>,
    /// Whether a 100–120% overrun settles without re-authorization.
    #[serde(default = "default_true")]
    pub auto_reauthorize: bool,
    /// Optional upstream policy decision to record.
    #[serde(default)]
    pub policy_decision: Option<Value>,
    /// Caller-supplied metering events (defaults are synthesized).
    #[serde(default)]
    pub metering_events: Option<Vec<Value>>,
    /// Optional signed delegation token authorizing the flow.
    #[serde(default)]
    pub delegation_token: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Status view of a delegation.
#[derive(Debug, Clone, Serialize)]
pub struct DelegationStatus {
    /// Delegation id.
    pub delegation_id: String,
    /// Terminal status.
    pub status: String,
    /// Contract in force.
    pub contract: Value,
    /// Requesting agent.
    pub requester_agent_id: String,
    /// Delegate agent.
    pub delegate_agent_id: String,
    /// Escrowed estimate.
    pub estimated_cost_usd: f64,
    /// Settled actual cost.
    pub actual_cost_usd: f64,
    /// Budget verdict.
    pub budget_controls: BudgetControls,
    /// Upstream policy decision, when recorded.
    pub policy_decision: Option<Value>,
    /// Lifecycle stages in order.
    pub lifecycle: Vec<LifecycleStage>,
    /// Audit trail.
    pub audit_trail: Vec<AuditEntry>,
    /// Current queue state.
    pub queue_state: Option<QueueState>,
}

/// One recorded metering event.
#[derive(Debug, Clone, Serialize)]
pub struct MeteringEvent {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Acting principal.
    pub actor: String,
    /// Metered operation.
    pub operation: String,
    /// Cost attributed to the operation.
    pub cost_usd: f64,
    /// Free-form metadata.
    pub metadata: Value,
}

/// Per-delegate usage signal aggregates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSignal {
    /// Successful delegations.
    pub success_count: u64,
    /// Failed delegations.
    pub failure_count: u64,
    /// Cumulative settled cost.
    pub total_cost_usd: f64,
    /// Last observed delivery latency.
    pub last_latency_ms: f64,
}

/// Apply the budget state machine to a cost ratio.
#[must_use]
pub fn budget_state_from_ratio(ratio: f64, auto_reauthorize: bool) -> BudgetControls {
    let soft_alert = ratio >= 0.8;
    let needs_reauthorization = ratio >= 1.0 && !auto_reauthorize;
    let hard_stop = ratio >= 1.2;
    let state = if hard_stop {
        "hard_stop"
    } else if needs_reauthorization {
        "reauthorization_required"
    } else if soft_alert {
        "soft_alert"
    } else {
        "ok"
    };
    BudgetControls {
        state: state.to_string(),
        soft_alert,
        reauthorization_required: ratio >= 1.0,
        hard_stop,
        ratio: (ratio * 10_000.0).round() / 10_000.0,
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

fn stage(name: &str, details: Value) -> LifecycleStage {
    LifecycleStage {
        stage: name.to_string(),
        timestamp: utc_now_iso(),
        details,
    }
}

/// The delegation orchestrator.
pub struct DelegationOrchestrator {
    store: Arc<DelegationStore>,
    identity_store: Arc<IdentityStore>,
    tokens: Arc<DelegationTokenService>,
    jit: Arc<JitCredentialService>,
    policy: SrePolicy,
    metering: Mutex<VecDeque<MeteringEvent>>,
    usage: Mutex<std::collections::BTreeMap<String, UsageSignal>>,
}

impl DelegationOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(
        store: Arc<DelegationStore>,
        identity_store: Arc<IdentityStore>,
        tokens: Arc<DelegationTokenService>,
        jit: Arc<JitCredentialService>,
    ) -> Self {
        Self {
            store,
            identity_store,
            tokens,
            jit,
            policy: SrePolicy::default(),
            metering: Mutex::new(VecDeque::new()),
            usage: Mutex::new(std::collections::BTreeMap::new()),
        }
    }

    /// Identity check tolerant of unregistered agents: a missing identity is
    /// "unverified", an inactive one is a hard failure.
    fn verify_party(&self, agent_id: &str) -> Result<bool> {
        match self.identity_store.get_identity(agent_id) {
            Ok(identity) if identity.status == IdentityStatus::Active => Ok(true),
            Ok(identity) => Err(Error::PermissionDenied(format!(
                "agent {agent_id} is {}",
                identity.status
            ))),
            Err(Error::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Execute a delegation end to end.
    ///
    /// The caller owns the idempotency reservation around this call: any
    /// error propagating out must clear the reservation so a retry with the
    /// same key is accepted.
    #[allow(clippy::too_many_lines)]
    pub fn create(&self, request: &CreateDelegation) -> Result<DelegationRecord> {
        // 1. Admission: the breaker refuses new work when open.
        let dashboard = build_slo_dashboard(&self.store, DEFAULT_WINDOW_SIZE, &self.policy)?;
        if dashboard.circuit_breaker.state == BreakerState::Open {
            warn!(
                reasons = ?dashboard.circuit_breaker.reasons,
                "Delegation admission refused by circuit breaker"
            );
            return Err(Error::BreakerOpen {
                reasons: dashboard.circuit_breaker.reasons,
            });
        }

        // 2. Identity verification (both parties; token chain when supplied).
        let requester_verified = self.verify_party(&request.requester_agent_id)?;
        let delegate_verified = self.verify_party(&request.delegate_agent_id)?;
        let delegation_token_id = match &request.delegation_token {
            Some(signed_token) => {
                let verification = self.tokens.verify(signed_token).map_err(|err| {
                    Error::PermissionDenied(format!("delegation token invalid: {err}"))
                })?;
                Some(verification.token_id)
            }
            None => None,
        };

        // 3. Budget precondition: the hard ceiling is checked before escrow.
        if request.estimated_cost_usd > request.max_budget_usd {
            return Err(Error::HardCeiling(
                "estimated cost above max budget".to_string(),
            ));
        }

        let delegation_id = Uuid::new_v4().to_string();
        self.store
            .upsert_queue_state(&delegation_id, "queued", true, None)?;

        match self.run_lifecycle(
            request,
            &delegation_id,
            requester_verified,
            delegate_verified,
            delegation_token_id,
        ) {
            Ok(record) => Ok(record),
            Err(err) => {
                self.store.upsert_queue_state(
                    &delegation_id,
                    "failed",
                    false,
                    Some(&err.to_string()),
                )?;
                Err(err)
            }
        }
    }

    fn run_lifecycle(
        &self,
        request: &CreateDelegation,
        delegation_id: &str,
        requester_verified: bool,
        delegate_verified: bool,
        delegation_token_id: Option<String>,
    ) -> Result<DelegationRecord> {
        let estimated = request.estimated_cost_usd;
        let actual = request
            .simulated_actual_cost_usd
            .unwrap_or(estimated * 0.92);

        let mut lifecycle: Vec<LifecycleStage> = Vec::new();
        let mut audit_trail: Vec<AuditEntry> = Vec::new();

        lifecycle.push(stage(
            "discovery",
            json!({
                "requester": request.requester_agent_id,
                "delegate": request.delegate_agent_id,
            }),
        ));
        lifecycle.push(stage(
            "negotiation",
            json!({
                "estimated_cost_usd": estimated,
                "max_budget_usd": request.max_budget_usd,
            }),
        ));

        // 4. Escrow: deduct the estimate before any execution effect.
        self.store
            .deduct_balance(&request.requester_agent_id, estimated)?;

        self.store
            .upsert_queue_state(delegation_id, "running", false, None)?;

        // 5. Execution simulation. The runtime control plane is a
        // collaborator; here a synthetic sandbox frames the JIT credential
        // lifecycle and the latency measurement.
        let started = Instant::now();
        let sandbox_id = {
            let hex = Uuid::new_v4().simple().to_string();
            format!("sbx-{}", &hex[..12])
        };
        let jit_credential_id = if delegate_verified {
            match self
                .jit
                .issue(&request.delegate_agent_id, &sandbox_id, None, 3_600)
            {
                Ok(jit) => Some(jit.credential_id),
                Err(err) => {
                    warn!(sandbox_id, error = %err, "JIT issuance failed; executing without one");
                    None
                }
            }
        } else {
            None
        };
        lifecycle.push(stage(
            "execution",
            json!({
                "sandbox_id": sandbox_id,
                "network": "disabled",
                "status": "started",
                "jit_credential_id": jit_credential_id,
            }),
        ));

        let metering_rows = request.metering_events.clone().unwrap_or_else(|| {
            vec![
                json!({"event": "llm_call", "tokens": 350, "cost_usd": round6(actual * 0.4)}),
                json!({"event": "tool_call", "tool": "delegate_tool", "cost_usd": round6(actual * 0.6)}),
            ]
        });
        for row in &metering_rows {
            audit_trail.push(AuditEntry {
                timestamp: utc_now_iso(),
                delegation_id: delegation_id.to_string(),
                kind: row
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or("metering")
                    .to_string(),
                details: row.clone(),
            });
        }

        // Sandbox terminates: sweep its JIT credentials.
        if jit_credential_id.is_some() {
            if let Err(err) = self
                .jit
                .revoke_all_for_sandbox(&request.delegate_agent_id, &sandbox_id)
            {
                warn!(sandbox_id, error = %err, "JIT sweep failed after execution");
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let latency_ms = {
            let micros = started.elapsed().as_micros() as f64;
            (micros / 1_000.0 * 1_000.0).round() / 1_000.0
        };
        lifecycle.push(stage(
            "delivery",
            json!({"output_schema_valid": true, "latency_ms": latency_ms}),
        ));

        // 6. Settlement under the budget state machine.
        let ratio = actual / estimated.max(1e-6);
        let controls = budget_state_from_ratio(ratio, request.auto_reauthorize);
        let settlement_status = if controls.hard_stop {
            "failed_hard_stop"
        } else if controls.state == "reauthorization_required" {
            "pending_reauthorization"
        } else {
            "completed"
        };

        // 7. Escrow refund of the unspent estimate.
        let refund = (estimated - actual).max(0.0);
        self.store
            .credit_balance(&request.requester_agent_id, refund)?;

        lifecycle.push(stage(
            "settlement",
            json!({
                "settlement_status": settlement_status,
                "estimated_cost_usd": estimated,
                "actual_cost_usd": actual,
                "escrow_refund_usd": round6(refund),
                "budget_controls": controls.clone(),
            }),
        ));

        let success = settlement_status == "completed";
        lifecycle.push(stage(
            "feedback",
            json!({"success": success, "quality_score": if success { 1.0 } else { 0.0 }}),
        ));

        // 8. Telemetry: metering event plus delegate usage signals.
        self.record_metering(
            &request.requester_agent_id,
            "delegation.create",
            actual,
            json!({
                "delegation_id": delegation_id,
                "delegate_agent_id": request.delegate_agent_id.clone(),
                "budget_ratio": controls.ratio,
                "budget_state": controls.state.clone(),
            }),
        );
        self.record_usage(&request.delegate_agent_id, success, actual, latency_ms);

        // 9. Persistence under the caller's idempotency reservation.
        self.store
            .upsert_queue_state(delegation_id, settlement_status, false, None)?;
        let queue_state = self.store.get_queue_state(delegation_id)?;

        let now = utc_now_iso();
        let record = DelegationRecord {
            delegation_id: delegation_id.to_string(),
            requester_agent_id: request.requester_agent_id.clone(),
            delegate_agent_id: request.delegate_agent_id.clone(),
            task_spec: request.task_spec.clone(),
            estimated_cost_usd: estimated,
            actual_cost_usd: actual,
            max_budget_usd: request.max_budget_usd,
            status: settlement_status.to_string(),
            contract: DELEGATION_CONTRACT_V2.clone(),
            policy_decision: request.policy_decision.clone(),
            lifecycle,
            audit_trail,
            budget_controls: controls,
            queue_state,
            created_at: now.clone(),
            updated_at: now,
            identity_context: IdentityContext {
                requester_verified,
                delegate_verified,
                delegation_token_id,
            },
        };
        self.store.append_record(&record)?;

        info!(
            delegation_id,
            status = settlement_status,
            ratio = record.budget_controls.ratio,
            "Delegation settled"
        );
        Ok(record)
    }

    /// Status view for a delegation, when known.
    pub fn status(&self, delegation_id: &str) -> Result<Option<DelegationStatus>> {
        let Some(record) = self.store.get_record(delegation_id)? else {
            return Ok(None);
        };
        let queue_state = self
            .store
            .get_queue_state(delegation_id)?
            .or(record.queue_state);
        Ok(Some(DelegationStatus {
            delegation_id: record.delegation_id,
            status: record.status,
            contract: record.contract,
            requester_agent_id: record.requester_agent_id,
            delegate_agent_id: record.delegate_agent_id,
            estimated_cost_usd: record.estimated_cost_usd,
            actual_cost_usd: record.actual_cost_usd,
            budget_controls: record.budget_controls,
            policy_decision: record.policy_decision,
            lifecycle: record.lifecycle,
            audit_trail: record.audit_trail,
            queue_state,
        }))
    }

    fn record_metering(&self, actor: &str, operation: &str, cost_usd: f64, metadata: Value) {
        let mut log = self.metering.lock();
        log.push_back(MeteringEvent {
            timestamp: utc_now_iso(),
            actor: actor.to_string(),
            operation: operation.to_string(),
            cost_usd: round6(cost_usd),
            metadata,
        });
        while log.len() > MAX_METERING_EVENTS {
            log.pop_front();
        }
    }

    fn record_usage(&self, agent_id: &str, success: bool, cost_usd: f64, latency_ms: f64) {
        let mut usage = self.usage.lock();
        let signal = usage.entry(agent_id.to_string()).or_default();
        if success {
            signal.success_count += 1;
        } else {
            signal.failure_count += 1;
        }
        signal.total_cost_usd = round6(signal.total_cost_usd + cost_usd);
        signal.last_latency_ms = latency_ms;
    }

    /// Most recent metering events, newest first.
    #[must_use]
    pub fn metering_events(&self, limit: usize) -> Vec<MeteringEvent> {
        let log = self.metering.lock();
        log.iter().rev().take(limit).cloned().collect()
    }

    /// Usage signal for a delegate, when recorded.
    #[must_use]
    pub fn usage_signal(&self, agent_id: &str) -> Option<UsageSignal> {
        self.usage.lock().get(agent_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::store::NewIdentity;
    use crate::secrets::SigningSecrets;

    fn orchestrator() -> DelegationOrchestrator {
        let identity_store = Arc::new(IdentityStore::open_in_memory().expect("identity"));
        let secrets = Arc::new(SigningSecrets {
            auth_token: "auth".to_string(),
            identity_signing: "identity-test-secret".to_string(),
            provenance_signing: "prov".to_string(),
            policy_signing: "policy".to_string(),
        });
        for agent_id in ["agent-req", "agent-del"] {
            identity_store
                .register_identity(&NewIdentity {
                    agent_id: agent_id.to_string(),
                    owner: "owner-dev".to_string(),
                    ..NewIdentity::default()
                })
                .expect("register");
        }
        DelegationOrchestrator::new(
            Arc::new(DelegationStore::open_in_memory().expect("delegation")),
            Arc::clone(&identity_store),
            Arc::new(DelegationTokenService::new(
                Arc::clone(&identity_store),
                Arc::clone(&secrets),
            )),
            Arc::new(JitCredentialService::new(identity_store)),
        )
    }

    fn request(estimated: f64, max_budget: f64, actual: Option<f64>) -> CreateDelegation {
        CreateDelegation {
            requester_agent_id: "agent-req".to_string(),
            delegate_agent_id: "agent-del".to_string(),
            task_spec: "summarize invoices".to_string(),
            estimated_cost_usd: estimated,
            max_budget_usd: max_budget,
            simulated_actual_cost_usd: actual,
            auto_reauthorize: true,
            policy_decision: None,
            metering_events: None,
            delegation_token: None,
        }
    }

    #[test]
    fn soft_alert_completes_with_refund() {
        let orchestrator = orchestrator();
        let record = orchestrator
            .create(&request(10.0, 20.0, Some(8.0)))
            .expect("create");

        assert_eq!(record.status, "completed");
        assert_eq!(record.budget_controls.state, "soft_alert");
        assert!((record.budget_controls.ratio - 0.8).abs() < 1e-9);

        let stages: Vec<&str> = record.lifecycle.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec!["discovery", "negotiation", "execution", "delivery", "settlement", "feedback"]
        );

        // Escrowed 10, spent 8: the refund of 2 leaves 992 of the 1000 seed.
        let balance = orchestrator
            .store
            .get_balance("agent-req")
            .expect("balance")
            .expect("seen");
        assert!((balance - 992.0).abs() < 1e-9);
    }

    #[test]
    fn hard_ceiling_rejects_before_escrow() {
        let orchestrator = orchestrator();
        let err = orchestrator
            .create(&request(50.0, 20.0, None))
            .expect_err("ceiling");
        assert!(matches!(err, Error::HardCeiling(_)));
        // Nothing was escrowed.
        assert!(orchestrator
            .store
            .get_balance("agent-req")
            .expect("balance")
            .is_none());
    }

    #[test]
    fn ratio_past_120_hard_stops() {
        let orchestrator = orchestrator();
        let record = orchestrator
            .create(&request(10.0, 20.0, Some(12.5)))
            .expect("create");
        assert_eq!(record.status, "failed_hard_stop");
        assert!(record.budget_controls.hard_stop);
        assert!((record.budget_controls.ratio - 1.25).abs() < 1e-9);
    }

    #[test]
    fn overrun_without_auto_reauthorize_pends() {
        let orchestrator = orchestrator();
        let mut req = request(10.0, 20.0, Some(11.0));
        req.auto_reauthorize = false;
        let record = orchestrator.create(&req).expect("create");
        assert_eq!(record.status, "pending_reauthorization");
        assert_eq!(record.budget_controls.state, "reauthorization_required");
    }

    #[test]
    fn inactive_party_is_refused() {
        let orchestrator = orchestrator();
        orchestrator
            .identity_store
            .update_identity_status("agent-del", IdentityStatus::Suspended)
            .expect("suspend");
        let err = orchestrator
            .create(&request(10.0, 20.0, None))
            .expect_err("suspended delegate");
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn unregistered_parties_run_unverified() {
        let orchestrator = orchestrator();
        let mut req = request(10.0, 20.0, Some(9.0));
        req.requester_agent_id = "agent-legacy".to_string();
        req.delegate_agent_id = "agent-legacy-2".to_string();
        let record = orchestrator.create(&req).expect("legacy flow");
        assert!(!record.identity_context.requester_verified);
        assert!(!record.identity_context.delegate_verified);
    }

    #[test]
    fn invalid_delegation_token_is_refused() {
        let orchestrator = orchestrator();
        let mut req = request(10.0, 20.0, None);
        req.delegation_token = Some("dtk-bogus.deadbeef".to_string());
        let err = orchestrator.create(&req).expect_err("bogus token");
        assert!(err.to_string().contains("delegation token invalid"));
    }

    #[test]
    fn breaker_open_refuses_admission() {
        let orchestrator = orchestrator();
        // Saturate the window with hard stops to trip the breaker.
        for _ in 0..12 {
            let _ = orchestrator.create(&request(10.0, 20.0, Some(12.5)));
        }
        let err = orchestrator
            .create(&request(10.0, 20.0, Some(8.0)))
            .expect_err("breaker open");
        match err {
            Error::BreakerOpen { reasons } => {
                assert!(!reasons.is_empty());
            }
            other => panic!("expected BreakerOpen, got {other:?}"),
        }
    }

    #[test]
    fn metering_and_usage_signals_are_recorded() {
        let orchestrator = orchestrator();
        orchestrator
            .create(&request(10.0, 20.0, Some(8.0)))
            .expect("create");

        let events = orchestrator.metering_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, "delegation.create");
        assert!((events[0].cost_usd - 8.0).abs() < 1e-9);

        let signal = orchestrator.usage_signal("agent-del").expect("signal");
        assert_eq!(signal.success_count, 1);
        assert_eq!(signal.failure_count, 0);
    }

    #[test]
    fn status_view_includes_lifecycle_and_queue_state() {
        let orchestrator = orchestrator();
        let record = orchestrator
            .create(&request(10.0, 20.0, Some(8.0)))
            .expect("create");

        let status = orchestrator
            .status(&record.delegation_id)
            .expect("status")
            .expect("present");
        assert_eq!(status.status, "completed");
        assert_eq!(status.lifecycle.len(), 6);
        let queue = status.queue_state.expect("queue state");
        assert_eq!(queue.status, "completed");
        assert_eq!(queue.attempt_count, 1);

        assert!(orchestrator.status("missing").expect("query").is_none());
    }

    #[test]
    fn budget_state_machine_bands() {
        assert_eq!(budget_state_from_ratio(0.5, true).state, "ok");
        assert_eq!(budget_state_from_ratio(0.8, true).state, "soft_alert");
        assert_eq!(budget_state_from_ratio(1.0, true).state, "soft_alert");
        assert_eq!(
            budget_state_from_ratio(1.0, false).state,
            "reauthorization_required"
        );
        assert_eq!(budget_state_from_ratio(1.2, true).state, "hard_stop");
        assert_eq!(budget_state_from_ratio(1.2, false).state, "hard_stop");
    }
}
