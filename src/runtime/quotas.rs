//! Per-agent capability quotas.
//!
//! Quotas cap a resource per agent, optionally over a rolling window
//! (elapsed time past `period_seconds` zeroes the counter before the
//! check). A check either consumes from every matching quota or consumes
//! nothing: all candidates are validated before any counter moves.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::utc_now_epoch;
use crate::{Error, Result};

use super::MAX_RECORDS;

/// Resources a quota may govern.
pub const VALID_RESOURCES: &[&str] = &[
    "api_calls",
    "delegations",
    "sandboxes",
    "credentials",
    "keys",
    "sessions",
    "storage_mb",
    "custom",
];

/// A capability quota.
#[derive(Debug, Clone, Serialize)]
pub struct Quota {
    /// Quota id (`quota-` prefix).
    pub quota_id: String,
    /// Governed agent.
    pub agent_id: String,
    /// Governed resource.
    pub resource: String,
    /// Maximum units per window (or forever when `period_seconds` is 0).
    pub max_value: i64,
    /// Rolling window length; 0 disables the reset.
    pub period_seconds: i64,
    /// Operator note.
    pub description: String,
    /// Disabled quotas are skipped by checks.
    pub enabled: bool,
    /// Creation time (epoch seconds).
    pub created_at_epoch: i64,
}

/// Verdict of a quota check.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaCheck {
    /// Whether the requested amount was granted.
    pub allowed: bool,
    /// `no_quota`, `quota_exceeded`, or absent on a plain grant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    /// Checked agent.
    pub agent_id: String,
    /// Checked resource.
    pub resource: String,
    /// Binding quota, when one matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_id: Option<String>,
    /// Units consumed so far in the binding window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used: Option<i64>,
    /// Cap of the binding quota.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<i64>,
    /// Units remaining in the binding window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
}

/// A recorded quota violation.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaViolation {
    /// Violating agent.
    pub agent_id: String,
    /// Governed resource.
    pub resource: String,
    /// Quota that refused the request.
    pub quota_id: String,
    /// Units consumed at refusal time.
    pub used: i64,
    /// Cap of the refusing quota.
    pub max_value: i64,
    /// Units requested.
    pub requested: i64,
    /// Refusal time (epoch seconds).
    pub timestamp_epoch: i64,
}

/// Per-agent usage row.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRow {
    /// Governed resource.
    pub resource: String,
    /// Quota the counter belongs to.
    pub quota_id: String,
    /// Units consumed in the current window.
    pub used: i64,
    /// Cap of the quota.
    pub max_value: i64,
    /// Units remaining.
    pub remaining: i64,
}

/// Registry statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStats {
    /// All quotas.
    pub total_quotas: usize,
    /// Enabled quotas.
    pub enabled_quotas: usize,
    /// Quota count per resource.
    pub by_resource: std::collections::BTreeMap<String, usize>,
    /// Recorded violations.
    pub total_violations: usize,
}

#[derive(Debug, Clone)]
struct UsageCounter {
    used: i64,
    window_start_epoch: i64,
}

/// Capability quota registry.
#[derive(Default)]
pub struct QuotaRegistry {
    quotas: RwLock<HashMap<String, Quota>>,
    usage: RwLock<HashMap<String, UsageCounter>>,
    violations: RwLock<VecDeque<QuotaViolation>>,
}

impl QuotaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a quota.
    pub fn create(
        &self,
        agent_id: &str,
        resource: &str,
        max_value: i64,
        period_seconds: i64,
        description: &str,
    ) -> Result<Quota> {
        if !VALID_RESOURCES.contains(&resource) {
            return Err(Error::InvalidArgument(format!(
                "resource must be one of {VALID_RESOURCES:?}"
            )));
        }
        if max_value <= 0 {
            return Err(Error::InvalidArgument(
                "max_value must be positive".to_string(),
            ));
        }

        let quota = Quota {
            quota_id: {
                let hex = Uuid::new_v4().simple().to_string();
                format!("quota-{}", &hex[..12])
            },
            agent_id: agent_id.to_string(),
            resource: resource.to_string(),
            max_value,
            period_seconds,
            description: description.to_string(),
            enabled: true,
            created_at_epoch: utc_now_epoch(),
        };

        let mut quotas = self.quotas.write();
        quotas.insert(quota.quota_id.clone(), quota.clone());
        if quotas.len() > MAX_RECORDS {
            evict_oldest(&mut quotas);
        }
        Ok(quota)
    }

    /// Fetch a quota by id.
    pub fn get(&self, quota_id: &str) -> Result<Quota> {
        self.quotas
            .read()
            .get(quota_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("quota not found: {quota_id}")))
    }

    /// List quotas, newest first, optionally filtered.
    #[must_use]
    pub fn list(&self, agent_id: Option<&str>, resource: Option<&str>, limit: usize) -> Vec<Quota> {
        let quotas = self.quotas.read();
        let mut results: Vec<Quota> = quotas
            .values()
            .filter(|quota| agent_id.is_none_or(|id| quota.agent_id == id))
            .filter(|quota| resource.is_none_or(|r| quota.resource == r))
            .cloned()
            .collect();
        results.sort_by_key(|quota| std::cmp::Reverse(quota.created_at_epoch));
        results.truncate(limit);
        results
    }

    /// Update a quota's cap or enabled bit.
    pub fn update(
        &self,
        quota_id: &str,
        max_value: Option<i64>,
        enabled: Option<bool>,
    ) -> Result<Quota> {
        let mut quotas = self.quotas.write();
        let quota = quotas
            .get_mut(quota_id)
            .ok_or_else(|| Error::NotFound(format!("quota not found: {quota_id}")))?;
        if let Some(max_value) = max_value {
            if max_value <= 0 {
                return Err(Error::InvalidArgument(
                    "max_value must be positive".to_string(),
                ));
            }
            quota.max_value = max_value;
        }
        if let Some(enabled) = enabled {
            quota.enabled = enabled;
        }
        Ok(quota.clone())
    }

    /// Check and consume `amount` against every enabled quota matching
    /// `(agent_id, resource)`.
    ///
    /// Validation happens before consumption: a refusal consumes nothing.
    pub fn check(&self, agent_id: &str, resource: &str, amount: i64) -> QuotaCheck {
        let now = utc_now_epoch();
        let matching: Vec<Quota> = {
            let quotas = self.quotas.read();
            quotas
                .values()
                .filter(|quota| {
                    quota.agent_id == agent_id && quota.resource == resource && quota.enabled
                })
                .cloned()
                .collect()
        };

        if matching.is_empty() {
            return QuotaCheck {
                allowed: true,
                reason: Some("no_quota"),
                agent_id: agent_id.to_string(),
                resource: resource.to_string(),
                quota_id: None,
                used: None,
                max_value: None,
                remaining: None,
            };
        }

        let mut usage = self.usage.write();

        // Pass 1: validate every matching quota against its (possibly
        // window-reset) counter.
        let mut staged: Vec<(String, UsageCounter, &Quota)> = Vec::with_capacity(matching.len());
        for quota in &matching {
            let key = format!("{agent_id}:{resource}:{}", quota.quota_id);
            let mut counter = usage.get(&key).cloned().unwrap_or(UsageCounter {
                used: 0,
                window_start_epoch: now,
            });
            if quota.period_seconds > 0 && now - counter.window_start_epoch > quota.period_seconds {
                counter = UsageCounter {
                    used: 0,
                    window_start_epoch: now,
                };
            }
            if counter.used + amount > quota.max_value {
                let violation = QuotaViolation {
                    agent_id: agent_id.to_string(),
                    resource: resource.to_string(),
                    quota_id: quota.quota_id.clone(),
                    used: counter.used,
                    max_value: quota.max_value,
                    requested: amount,
                    timestamp_epoch: now,
                };
                let mut violations = self.violations.write();
                violations.push_back(violation);
                while violations.len() > MAX_RECORDS {
                    violations.pop_front();
                }
                return QuotaCheck {
                    allowed: false,
                    reason: Some("quota_exceeded"),
                    agent_id: agent_id.to_string(),
                    resource: resource.to_string(),
                    quota_id: Some(quota.quota_id.clone()),
                    used: Some(counter.used),
                    max_value: Some(quota.max_value),
                    remaining: Some(quota.max_value - counter.used),
                };
            }
            staged.push((key, counter, quota));
        }

        // Pass 2: commit the consumption and report the tightest quota.
        let mut binding: Option<(String, i64, i64)> = None;
        for (key, mut counter, quota) in staged {
            counter.used += amount;
            let remaining = quota.max_value - counter.used;
            usage.insert(key, counter.clone());
            if binding.as_ref().is_none_or(|(_, _, r)| remaining < *r) {
                binding = Some((quota.quota_id.clone(), counter.used, remaining));
            }
        }
        let (quota_id, used, remaining) = binding.expect("at least one quota matched");
        QuotaCheck {
            allowed: true,
            reason: None,
            agent_id: agent_id.to_string(),
            resource: resource.to_string(),
            max_value: Some(used + remaining),
            quota_id: Some(quota_id),
            used: Some(used),
            remaining: Some(remaining),
        }
    }

    /// Current usage rows for an agent.
    #[must_use]
    pub fn usage(&self, agent_id: &str, resource: Option<&str>) -> Vec<UsageRow> {
        let usage = self.usage.read();
        let quotas = self.quotas.read();
        let mut rows = Vec::new();
        for (key, counter) in usage.iter() {
            let mut parts = key.splitn(3, ':');
            let (Some(a_id), Some(res), Some(q_id)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if a_id != agent_id {
                continue;
            }
            if resource.is_some_and(|r| r != res) {
                continue;
            }
            let max_value = quotas.get(q_id).map_or(0, |quota| quota.max_value);
            rows.push(UsageRow {
                resource: res.to_string(),
                quota_id: q_id.to_string(),
                used: counter.used,
                max_value,
                remaining: max_value - counter.used,
            });
        }
        rows.sort_by(|a, b| a.quota_id.cmp(&b.quota_id));
        rows
    }

    /// Recorded violations, newest first.
    #[must_use]
    pub fn violations(&self, agent_id: Option<&str>, limit: usize) -> Vec<QuotaViolation> {
        self.violations
            .read()
            .iter()
            .rev()
            .filter(|violation| agent_id.is_none_or(|id| violation.agent_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> QuotaStats {
        let quotas = self.quotas.read();
        let mut by_resource = std::collections::BTreeMap::new();
        for quota in quotas.values() {
            *by_resource.entry(quota.resource.clone()).or_insert(0) += 1;
        }
        QuotaStats {
            total_quotas: quotas.len(),
            enabled_quotas: quotas.values().filter(|quota| quota.enabled).count(),
            by_resource,
            total_violations: self.violations.read().len(),
        }
    }
}

fn evict_oldest(quotas: &mut HashMap<String, Quota>) {
    let excess = quotas.len().saturating_sub(MAX_RECORDS);
    if excess == 0 {
        return;
    }
    let mut oldest: Vec<(String, i64)> = quotas
        .iter()
        .map(|(id, quota)| (id.clone(), quota.created_at_epoch))
        .collect();
    oldest.sort_by_key(|(_, created)| *created);
    for (id, _) in oldest.into_iter().take(excess) {
        quotas.remove(&id);
    }
}
