//! Delegation chain algebra: scope attenuation and depth bounds.

use std::collections::BTreeSet;

use crate::{Error, Result};

use super::{MAX_DELEGATION_CHAIN_DEPTH, WILDCARD_SCOPE};

/// Compute attenuated scopes: `requested` must be a subset of `parent`.
///
/// A wildcard in the parent permits any requested set. Returns the sorted,
/// deduplicated effective scopes.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] naming the excess scopes when
/// `requested` escalates beyond `parent`.
pub fn attenuate_scopes(parent: &[String], requested: &[String]) -> Result<Vec<String>> {
    let requested_set: BTreeSet<&str> = requested.iter().map(String::as_str).collect();
    if parent.iter().any(|scope| scope == WILDCARD_SCOPE) {
        return Ok(requested_set.iter().map(ToString::to_string).collect());
    }

    let parent_set: BTreeSet<&str> = parent.iter().map(String::as_str).collect();
    let excess: Vec<&str> = requested_set.difference(&parent_set).copied().collect();
    if !excess.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "scope escalation denied: {excess:?} not in parent scopes"
        )));
    }
    Ok(requested_set.iter().map(ToString::to_string).collect())
}

/// Enforce the maximum delegation chain depth (the bound is inclusive:
/// depth 5 issues, depth 6 does not).
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] when `current_depth` exceeds the bound.
pub fn validate_chain_depth(current_depth: u32) -> Result<()> {
    if current_depth > MAX_DELEGATION_CHAIN_DEPTH {
        return Err(Error::InvalidArgument(format!(
            "delegation chain depth limit exceeded: {current_depth} > {MAX_DELEGATION_CHAIN_DEPTH}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn attenuation_returns_sorted_subset() {
        let effective = attenuate_scopes(
            &scopes(&["read", "write", "admin"]),
            &scopes(&["write", "read"]),
        )
        .expect("subset is allowed");
        assert_eq!(effective, scopes(&["read", "write"]));
    }

    #[test]
    fn wildcard_parent_permits_any_request() {
        let effective = attenuate_scopes(&scopes(&["*"]), &scopes(&["anything", "else"]))
            .expect("wildcard parent");
        assert_eq!(effective, scopes(&["anything", "else"]));
    }

    #[test]
    fn escalation_is_denied_with_excess_named() {
        let err = attenuate_scopes(&scopes(&["read"]), &scopes(&["read", "write"]))
            .expect_err("escalation");
        let message = err.to_string();
        assert!(message.contains("escalation"));
        assert!(message.contains("write"));
    }

    #[test]
    fn duplicate_requests_are_deduplicated() {
        let effective =
            attenuate_scopes(&scopes(&["read", "write"]), &scopes(&["read", "read"]))
                .expect("dedup");
        assert_eq!(effective, scopes(&["read"]));
    }

    #[test]
    fn depth_bound_is_inclusive_at_limit() {
        assert!(validate_chain_depth(4).is_ok());
        assert!(validate_chain_depth(5).is_ok());
        assert!(validate_chain_depth(6).is_err());
    }
}
