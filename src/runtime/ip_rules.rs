//! Per-agent IP allowlists and denylists with CIDR support.
//!
//! Evaluation order: deny rules take precedence; if any allow rules exist
//! the address must match at least one; with only deny rules an unmatched
//! address is allowed. Every check appends an access-log entry.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::utc_now_epoch;
use crate::{Error, Result};

use super::MAX_RECORDS;

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// Membership grants access.
    Allow,
    /// Membership denies access, over any allow rule.
    Deny,
}

/// An IP rule.
#[derive(Debug, Clone, Serialize)]
pub struct IpRule {
    /// Rule id (`ipr-` prefix).
    pub rule_id: String,
    /// Governed agent.
    pub agent_id: String,
    /// Operator label.
    pub name: String,
    /// Allow or deny.
    pub rule_type: RuleType,
    /// CIDR blocks (bare addresses are treated as host networks).
    pub cidrs: Vec<String>,
    /// Operator note.
    pub description: String,
    /// Disabled rules are skipped by checks.
    pub enabled: bool,
    /// Creation time (epoch seconds).
    pub created_at_epoch: i64,
}

/// Verdict of an IP check.
#[derive(Debug, Clone, Serialize)]
pub struct IpCheck {
    /// Whether the address is allowed.
    pub allowed: bool,
    /// `no_rules`, `denied`, `allowed`, `not_in_allowlist`, or `not_denied`.
    pub reason: &'static str,
    /// Rule that decided, when one matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// CIDR that matched, when one did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_cidr: Option<String>,
    /// Checked agent.
    pub agent_id: String,
    /// Checked address.
    pub ip_address: String,
}

/// One access-log entry.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    /// The verdict as logged.
    #[serde(flatten)]
    pub check: IpCheck,
    /// Check time (epoch seconds).
    pub checked_at_epoch: i64,
}

/// Registry statistics.
#[derive(Debug, Clone, Serialize)]
pub struct IpStats {
    /// All rules.
    pub total_rules: usize,
    /// Enabled rules.
    pub enabled_rules: usize,
    /// Allow rules.
    pub allow_rules: usize,
    /// Deny rules.
    pub deny_rules: usize,
    /// All checks performed.
    pub total_checks: usize,
    /// Checks that allowed.
    pub allowed_checks: usize,
    /// Checks that denied.
    pub denied_checks: usize,
}

/// Parse a CIDR block, accepting bare addresses as host networks.
fn parse_cidr(raw: &str) -> Result<IpNet> {
    if let Ok(net) = IpNet::from_str(raw) {
        return Ok(net);
    }
    if let Ok(addr) = IpAddr::from_str(raw) {
        return Ok(IpNet::from(addr));
    }
    Err(Error::InvalidArgument(format!("invalid CIDR '{raw}'")))
}

/// IP rule registry.
#[derive(Default)]
pub struct IpRuleRegistry {
    rules: RwLock<HashMap<String, IpRule>>,
    access_log: RwLock<VecDeque<AccessLogEntry>>,
}

impl IpRuleRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a rule after validating every CIDR.
    pub fn create(
        &self,
        agent_id: &str,
        name: &str,
        rule_type: RuleType,
        cidrs: Vec<String>,
        description: &str,
    ) -> Result<IpRule> {
        for cidr in &cidrs {
            parse_cidr(cidr)?;
        }

        let rule = IpRule {
            rule_id: {
                let hex = Uuid::new_v4().simple().to_string();
                format!("ipr-{}", &hex[..12])
            },
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            rule_type,
            cidrs,
            description: description.to_string(),
            enabled: true,
            created_at_epoch: utc_now_epoch(),
        };

        let mut rules = self.rules.write();
        rules.insert(rule.rule_id.clone(), rule.clone());
        if rules.len() > MAX_RECORDS {
            let excess = rules.len() - MAX_RECORDS;
            let mut oldest: Vec<(String, i64)> = rules
                .iter()
                .map(|(id, rule)| (id.clone(), rule.created_at_epoch))
                .collect();
            oldest.sort_by_key(|(_, created)| *created);
            for (id, _) in oldest.into_iter().take(excess) {
                rules.remove(&id);
            }
        }
        Ok(rule)
    }

    /// Fetch a rule by id.
    pub fn get(&self, rule_id: &str) -> Result<IpRule> {
        self.rules
            .read()
            .get(rule_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("IP rule not found: {rule_id}")))
    }

    /// List rules, newest first, optionally filtered.
    #[must_use]
    pub fn list(
        &self,
        agent_id: Option<&str>,
        rule_type: Option<RuleType>,
        limit: usize,
    ) -> Vec<IpRule> {
        let rules = self.rules.read();
        let mut results: Vec<IpRule> = rules
            .values()
            .filter(|rule| agent_id.is_none_or(|id| rule.agent_id == id))
            .filter(|rule| rule_type.is_none_or(|t| rule.rule_type == t))
            .cloned()
            .collect();
        results.sort_by_key(|rule| std::cmp::Reverse(rule.created_at_epoch));
        results.truncate(limit);
        results
    }

    /// Disable a rule.
    pub fn disable(&self, rule_id: &str) -> Result<IpRule> {
        let mut rules = self.rules.write();
        let rule = rules
            .get_mut(rule_id)
            .ok_or_else(|| Error::NotFound(format!("IP rule not found: {rule_id}")))?;
        rule.enabled = false;
        Ok(rule.clone())
    }

    /// Evaluate `ip_address` for `agent_id` and log the verdict.
    pub fn check(&self, agent_id: &str, ip_address: &str) -> Result<IpCheck> {
        let addr = IpAddr::from_str(ip_address).map_err(|e| {
            Error::InvalidArgument(format!("invalid IP address '{ip_address}': {e}"))
        })?;

        let agent_rules: Vec<IpRule> = {
            let rules = self.rules.read();
            rules
                .values()
                .filter(|rule| rule.agent_id == agent_id && rule.enabled)
                .cloned()
                .collect()
        };

        let check = self.evaluate(agent_id, ip_address, addr, &agent_rules);
        self.log_access(&check);
        Ok(check)
    }

    fn evaluate(
        &self,
        agent_id: &str,
        ip_address: &str,
        addr: IpAddr,
        agent_rules: &[IpRule],
    ) -> IpCheck {
        let base = |allowed, reason| IpCheck {
            allowed,
            reason,
            rule_id: None,
            matched_cidr: None,
            agent_id: agent_id.to_string(),
            ip_address: ip_address.to_string(),
        };

        if agent_rules.is_empty() {
            return base(true, "no_rules");
        }

        // Deny rules win over everything.
        for rule in agent_rules.iter().filter(|r| r.rule_type == RuleType::Deny) {
            for cidr in &rule.cidrs {
                let Ok(net) = parse_cidr(cidr) else { continue };
                if net.contains(&addr) {
                    let mut check = base(false, "denied");
                    check.rule_id = Some(rule.rule_id.clone());
                    check.matched_cidr = Some(cidr.clone());
                    return check;
                }
            }
        }

        // With allow rules present, membership in one is mandatory.
        let allow_rules: Vec<&IpRule> = agent_rules
            .iter()
            .filter(|r| r.rule_type == RuleType::Allow)
            .collect();
        if !allow_rules.is_empty() {
            for rule in allow_rules {
                for cidr in &rule.cidrs {
                    let Ok(net) = parse_cidr(cidr) else { continue };
                    if net.contains(&addr) {
                        let mut check = base(true, "allowed");
                        check.rule_id = Some(rule.rule_id.clone());
                        check.matched_cidr = Some(cidr.clone());
                        return check;
                    }
                }
            }
            return base(false, "not_in_allowlist");
        }

        // Only deny rules exist and none matched.
        base(true, "not_denied")
    }

    fn log_access(&self, check: &IpCheck) {
        let mut log = self.access_log.write();
        log.push_back(AccessLogEntry {
            check: check.clone(),
            checked_at_epoch: utc_now_epoch(),
        });
        while log.len() > MAX_RECORDS {
            log.pop_front();
        }
    }

    /// Access-log entries, newest first, optionally filtered by agent.
    #[must_use]
    pub fn access_log(&self, agent_id: Option<&str>, limit: usize) -> Vec<AccessLogEntry> {
        self.access_log
            .read()
            .iter()
            .rev()
            .filter(|entry| agent_id.is_none_or(|id| entry.check.agent_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> IpStats {
        let rules = self.rules.read();
        let log = self.access_log.read();
        let allowed_checks = log.iter().filter(|entry| entry.check.allowed).count();
        IpStats {
            total_rules: rules.len(),
            enabled_rules: rules.values().filter(|rule| rule.enabled).count(),
            allow_rules: rules
                .values()
                .filter(|rule| rule.rule_type == RuleType::Allow)
                .count(),
            deny_rules: rules
                .values()
                .filter(|rule| rule.rule_type == RuleType::Deny)
                .count(),
            total_checks: log.len(),
            allowed_checks,
            denied_checks: log.len() - allowed_checks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_rules_allows_and_logs() {
        let registry = IpRuleRegistry::new();
        let check = registry.check("agent-a", "10.0.0.1").expect("check");
        assert!(check.allowed);
        assert_eq!(check.reason, "no_rules");
        assert_eq!(registry.access_log(Some("agent-a"), 10).len(), 1);
    }

    #[test]
    fn invalid_cidr_is_rejected_at_create() {
        let registry = IpRuleRegistry::new();
        let err = registry
            .create("agent-a", "bad", RuleType::Allow, vec!["10.0.0.0/99".to_string()], "")
            .expect_err("invalid cidr");
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn bare_address_is_a_host_network() {
        let registry = IpRuleRegistry::new();
        registry
            .create("agent-a", "pin", RuleType::Allow, vec!["10.0.0.7".to_string()], "")
            .expect("create");
        assert!(registry.check("agent-a", "10.0.0.7").expect("check").allowed);
        assert!(!registry.check("agent-a", "10.0.0.8").expect("check").allowed);
    }

    #[test]
    fn deny_takes_precedence_over_allow() {
        let registry = IpRuleRegistry::new();
        registry
            .create("agent-a", "corp", RuleType::Allow, vec!["10.0.0.0/8".to_string()], "")
            .expect("allow");
        registry
            .create("agent-a", "blocked", RuleType::Deny, vec!["10.1.0.0/16".to_string()], "")
            .expect("deny");

        let denied = registry.check("agent-a", "10.1.2.3").expect("check");
        assert!(!denied.allowed);
        assert_eq!(denied.reason, "denied");
        assert_eq!(denied.matched_cidr.as_deref(), Some("10.1.0.0/16"));

        let allowed = registry.check("agent-a", "10.2.3.4").expect("check");
        assert!(allowed.allowed);
        assert_eq!(allowed.reason, "allowed");
    }

    #[test]
    fn allowlist_membership_is_mandatory_when_present() {
        let registry = IpRuleRegistry::new();
        registry
            .create("agent-a", "corp", RuleType::Allow, vec!["192.168.0.0/24".to_string()], "")
            .expect("allow");
        let check = registry.check("agent-a", "8.8.8.8").expect("check");
        assert!(!check.allowed);
        assert_eq!(check.reason, "not_in_allowlist");
    }

    #[test]
    fn only_deny_rules_allow_unmatched_addresses() {
        let registry = IpRuleRegistry::new();
        registry
            .create("agent-a", "blocked", RuleType::Deny, vec!["10.0.0.0/8".to_string()], "")
            .expect("deny");
        let check = registry.check("agent-a", "8.8.8.8").expect("check");
        assert!(check.allowed);
        assert_eq!(check.reason, "not_denied");
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let registry = IpRuleRegistry::new();
        let rule = registry
            .create("agent-a", "blocked", RuleType::Deny, vec!["10.0.0.0/8".to_string()], "")
            .expect("deny");
        registry.disable(&rule.rule_id).expect("disable");
        let check = registry.check("agent-a", "10.0.0.1").expect("check");
        assert!(check.allowed);
        assert_eq!(check.reason, "no_rules");
    }

    #[test]
    fn invalid_address_is_invalid_argument() {
        let registry = IpRuleRegistry::new();
        assert!(matches!(
            registry.check("agent-a", "not-an-ip"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn stats_track_checks_and_rules() {
        let registry = IpRuleRegistry::new();
        registry
            .create("agent-a", "corp", RuleType::Allow, vec!["10.0.0.0/8".to_string()], "")
            .expect("allow");
        registry.check("agent-a", "10.0.0.1").expect("allowed");
        registry.check("agent-a", "8.8.8.8").expect("denied");

        let stats = registry.stats();
        assert_eq!(stats.total_rules, 1);
        assert_eq!(stats.allow_rules, 1);
        assert_eq!(stats.total_checks, 2);
        assert_eq!(stats.allowed_checks, 1);
        assert_eq!(stats.denied_checks, 1);
    }

    #[test]
    fn ipv6_networks_match() {
        let registry = IpRuleRegistry::new();
        registry
            .create("agent-a", "v6", RuleType::Allow, vec!["2001:db8::/32".to_string()], "")
            .expect("allow");
        assert!(registry.check("agent-a", "2001:db8::1").expect("check").allowed);
        assert!(!registry.check("agent-a", "2001:db9::1").expect("check").allowed);
    }
}
