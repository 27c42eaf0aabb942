//! SLO dashboard and circuit breaker over the delegation window.
//!
//! The dashboard evaluates the last N delegation records (default 50) into
//! success/error/hard-stop rates, p95 delivery latency, and an error budget,
//! then derives the breaker state consumed by the delegation admission gate:
//! `open` refuses new work outright, `half_open` signals budget pressure,
//! `closed` admits freely.

use serde::Serialize;

use crate::Result;
use crate::delegation::storage::{DelegationRecord, DelegationStore};

/// Default evaluation window.
pub const DEFAULT_WINDOW_SIZE: usize = 50;

/// SRE governance policy for the delegation SLO.
#[derive(Debug, Clone, Serialize)]
pub struct SrePolicy {
    /// Success-rate SLO target.
    pub success_rate_slo: f64,
    /// p95 delivery latency SLO (milliseconds).
    pub latency_p95_ms_slo: f64,
    /// Window size below which the breaker stays closed.
    pub min_samples_for_enforcement: usize,
    /// Error-budget consumption ratio that warns.
    pub error_budget_warning_ratio: f64,
    /// Error rate that half-opens the breaker.
    pub half_open_error_rate_threshold: f64,
    /// Error rate that opens the breaker.
    pub open_error_rate_threshold: f64,
    /// Hard-stop rate that opens the breaker.
    pub open_hard_stop_rate_threshold: f64,
    /// Multiplier over the latency SLO that opens the breaker.
    pub open_latency_multiplier: f64,
}

impl Default for SrePolicy {
    fn default() -> Self {
        Self {
            success_rate_slo: 0.99,
            latency_p95_ms_slo: 3000.0,
            min_samples_for_enforcement: 10,
            error_budget_warning_ratio: 0.8,
            half_open_error_rate_threshold: 0.15,
            open_error_rate_threshold: 0.3,
            open_hard_stop_rate_threshold: 0.2,
            open_latency_multiplier: 1.5,
        }
    }
}

/// Circuit breaker state fed by the SLO window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Admit new delegations.
    Closed,
    /// Budget pressure; admit but under watch.
    HalfOpen,
    /// Refuse new delegations.
    Open,
}

impl BreakerState {
    /// Lowercase label used in API responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }
}

/// Window description.
#[derive(Debug, Clone, Serialize)]
pub struct WindowInfo {
    /// Configured window size.
    pub size: usize,
    /// Delegations actually evaluated.
    pub evaluated_delegations: usize,
}

/// Rolling-window metrics.
#[derive(Debug, Clone, Serialize)]
pub struct WindowMetrics {
    /// Completed / total.
    pub success_rate: f64,
    /// Non-completed / total.
    pub error_rate: f64,
    /// Hard-stopped / total.
    pub hard_stop_rate: f64,
    /// p95 delivery latency (ms).
    pub latency_p95_ms: f64,
}

/// Error budget for the window.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBudget {
    /// `max(1, N * (1 - SLO))`.
    pub allowed_errors: i64,
    /// Observed non-completed delegations.
    pub observed_errors: i64,
    /// `allowed - observed` (may go negative).
    pub remaining_errors: i64,
    /// `observed / allowed`.
    pub consumed_ratio: f64,
}

/// Breaker block of the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    /// Current state.
    pub state: BreakerState,
    /// `reject_new_delegations` when open, else `allow`.
    pub governance_action: &'static str,
    /// Reasons behind the state.
    pub reasons: Vec<String>,
}

/// One governance alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// `warning` or `critical`.
    pub severity: &'static str,
    /// Stable alert code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: &'static str,
}

/// The full SLO dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct SloDashboard {
    /// Policy in force.
    pub policy: SrePolicy,
    /// Window description.
    pub window: WindowInfo,
    /// Rolling metrics.
    pub metrics: WindowMetrics,
    /// Error budget.
    pub error_budget: ErrorBudget,
    /// Breaker block.
    pub circuit_breaker: BreakerStatus,
    /// Active alerts.
    pub alerts: Vec<Alert>,
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn round3(value: f64) -> f64 {
    (value * 1_000.0).round() / 1_000.0
}

/// Delivery-stage latency of a record, when present.
fn delivery_latency_ms(record: &DelegationRecord) -> Option<f64> {
    record
        .lifecycle
        .iter()
        .find(|stage| stage.stage == "delivery")
        .and_then(|stage| stage.details.get("latency_ms"))
        .and_then(serde_json::Value::as_f64)
}

fn percentile(values: &[f64], ratio: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let idx = (((ratio * sorted.len() as f64).ceil() as usize).saturating_sub(1))
        .min(sorted.len() - 1);
    round3(sorted[idx])
}

fn breaker_state(
    total: usize,
    error_rate: f64,
    hard_stop_rate: f64,
    consumed_ratio: f64,
    latency_p95_ms: f64,
    policy: &SrePolicy,
) -> (BreakerState, Vec<String>) {
    if total < policy.min_samples_for_enforcement {
        return (BreakerState::Closed, vec!["insufficient_samples".to_string()]);
    }

    let mut reasons: Vec<String> = Vec::new();
    if error_rate >= policy.open_error_rate_threshold {
        reasons.push("error_rate_open_threshold".to_string());
    }
    if hard_stop_rate >= policy.open_hard_stop_rate_threshold {
        reasons.push("hard_stop_rate_open_threshold".to_string());
    }
    if latency_p95_ms > policy.latency_p95_ms_slo * policy.open_latency_multiplier {
        reasons.push("latency_critical_threshold".to_string());
    }
    if !reasons.is_empty() {
        return (BreakerState::Open, reasons);
    }

    let mut half_open: Vec<String> = Vec::new();
    if error_rate >= policy.half_open_error_rate_threshold {
        half_open.push("error_rate_half_open_threshold".to_string());
    }
    if consumed_ratio >= policy.error_budget_warning_ratio {
        half_open.push("error_budget_warning_threshold".to_string());
    }
    if latency_p95_ms > policy.latency_p95_ms_slo {
        half_open.push("latency_slo_breach".to_string());
    }
    if !half_open.is_empty() {
        return (BreakerState::HalfOpen, half_open);
    }

    (
        BreakerState::Closed,
        vec!["within_governance_thresholds".to_string()],
    )
}

fn build_alerts(
    total: usize,
    consumed_ratio: f64,
    latency_p95_ms: f64,
    hard_stop_rate: f64,
    policy: &SrePolicy,
) -> Vec<Alert> {
    let mut alerts = Vec::new();
    if total < policy.min_samples_for_enforcement {
        return alerts;
    }

    if consumed_ratio >= 1.0 {
        alerts.push(Alert {
            severity: "critical",
            code: "error_budget.exhausted",
            message: "Delegation error budget exhausted for evaluation window.",
        });
    } else if consumed_ratio >= policy.error_budget_warning_ratio {
        alerts.push(Alert {
            severity: "warning",
            code: "error_budget.burn_rate_high",
            message: "Delegation error budget burn rate is approaching exhaustion.",
        });
    }

    if latency_p95_ms > policy.latency_p95_ms_slo * policy.open_latency_multiplier {
        alerts.push(Alert {
            severity: "critical",
            code: "latency.slo_critical",
            message: "Delegation p95 latency critically exceeds SLO.",
        });
    } else if latency_p95_ms > policy.latency_p95_ms_slo {
        alerts.push(Alert {
            severity: "warning",
            code: "latency.slo_breach",
            message: "Delegation p95 latency exceeds SLO.",
        });
    }

    if hard_stop_rate >= policy.open_hard_stop_rate_threshold {
        alerts.push(Alert {
            severity: "critical",
            code: "circuit_breaker.hard_stop_rate",
            message: "Hard-stop rate exceeded circuit-breaker governance threshold.",
        });
    }

    alerts
}

/// Build the SLO dashboard over the most recent `window_size` delegations.
pub fn build_slo_dashboard(
    store: &DelegationStore,
    window_size: usize,
    policy: &SrePolicy,
) -> Result<SloDashboard> {
    let window_size = window_size.max(1);
    let window = store.load_records(window_size)?;
    let total = window.len();

    if total == 0 {
        return Ok(SloDashboard {
            policy: policy.clone(),
            window: WindowInfo {
                size: window_size,
                evaluated_delegations: 0,
            },
            metrics: WindowMetrics {
                success_rate: 1.0,
                error_rate: 0.0,
                hard_stop_rate: 0.0,
                latency_p95_ms: 0.0,
            },
            error_budget: ErrorBudget {
                allowed_errors: 1,
                observed_errors: 0,
                remaining_errors: 1,
                consumed_ratio: 0.0,
            },
            circuit_breaker: BreakerStatus {
                state: BreakerState::Closed,
                governance_action: "allow",
                reasons: vec!["no_delegation_history".to_string()],
            },
            alerts: vec![],
        });
    }

    let mut success_count = 0usize;
    let mut error_count = 0usize;
    let mut hard_stop_count = 0usize;
    let mut latencies: Vec<f64> = Vec::new();

    for record in &window {
        if record.status == "completed" {
            success_count += 1;
        } else {
            error_count += 1;
        }
        if record.status == "failed_hard_stop" {
            hard_stop_count += 1;
        }
        if let Some(latency) = delivery_latency_ms(record) {
            latencies.push(latency);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let totals = total as f64;
    #[allow(clippy::cast_precision_loss)]
    let success_rate = round4(success_count as f64 / totals);
    #[allow(clippy::cast_precision_loss)]
    let error_rate = round4(error_count as f64 / totals);
    #[allow(clippy::cast_precision_loss)]
    let hard_stop_rate = round4(hard_stop_count as f64 / totals);
    let latency_p95_ms = percentile(&latencies, 0.95);

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let allowed_errors = ((totals * (1.0 - policy.success_rate_slo)) as i64).max(1);
    #[allow(clippy::cast_possible_wrap)]
    let observed_errors = error_count as i64;
    #[allow(clippy::cast_precision_loss)]
    let consumed_ratio = round4(observed_errors as f64 / allowed_errors as f64);

    let (state, reasons) = breaker_state(
        total,
        error_rate,
        hard_stop_rate,
        consumed_ratio,
        latency_p95_ms,
        policy,
    );

    Ok(SloDashboard {
        policy: policy.clone(),
        window: WindowInfo {
            size: window_size,
            evaluated_delegations: total,
        },
        metrics: WindowMetrics {
            success_rate,
            error_rate,
            hard_stop_rate,
            latency_p95_ms,
        },
        error_budget: ErrorBudget {
            allowed_errors,
            observed_errors,
            remaining_errors: allowed_errors - observed_errors,
            consumed_ratio,
        },
        circuit_breaker: BreakerStatus {
            state,
            governance_action: if state == BreakerState::Open {
                "reject_new_delegations"
            } else {
                "allow"
            },
            reasons,
        },
        alerts: build_alerts(total, consumed_ratio, latency_p95_ms, hard_stop_rate, policy),
    })
}
