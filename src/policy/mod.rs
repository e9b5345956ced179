/// Policy evaluation engine
///
/// Each rule axis is matched independently against the enabled policies.
/// An axis without any enabled policy places no constraint on the result.
/// An axis with policies restricts the result to exactly the groups whose
/// rule value equals the client's attribute, which may be none at all.
/// The eligible set is the intersection of all axes.
use crate::core::{ClientAttributes, Policy, RuleType};
use std::collections::BTreeSet;

/// Groups a client may be routed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupSet {
    /// No axis carries any policy
    Unconstrained,
    /// At least one axis carries policies; may be empty
    Only(BTreeSet<String>),
}

impl GroupSet {
    pub fn only<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GroupSet::Only(groups.into_iter().map(Into::into).collect())
    }

    /// Intersect two sets; the unconstrained set is the identity
    pub fn intersect(self, other: GroupSet) -> GroupSet {
        match (self, other) {
            (GroupSet::Unconstrained, other) => other,
            (this, GroupSet::Unconstrained) => this,
            (GroupSet::Only(a), GroupSet::Only(b)) => {
                GroupSet::Only(a.intersection(&b).cloned().collect())
            }
        }
    }

    pub fn is_unconstrained(&self) -> bool {
        matches!(self, GroupSet::Unconstrained)
    }

    /// Concrete groups, with `default_group` standing in for "unconstrained"
    pub fn resolve(&self, default_group: &str) -> Vec<String> {
        match self {
            GroupSet::Unconstrained => vec![default_group.to_string()],
            GroupSet::Only(groups) => groups.iter().cloned().collect(),
        }
    }
}

/// Groups matched on a single axis
pub fn evaluate_axis(policies: &[Policy], rule_type: RuleType, value: &str) -> GroupSet {
    let mut axis = policies
        .iter()
        .filter(|p| p.enabled && p.rule_type == rule_type)
        .peekable();

    if axis.peek().is_none() {
        return GroupSet::Unconstrained;
    }

    GroupSet::Only(
        axis.filter(|p| p.rule_value == value)
            .map(|p| p.group_id.clone())
            .collect(),
    )
}

/// Eligible groups for a client across all four axes
pub fn evaluate_groups_for_client(policies: &[Policy], attrs: &ClientAttributes) -> GroupSet {
    evaluate_groups_in_order(policies, attrs, &RuleType::ALL)
}

/// Same as [`evaluate_groups_for_client`] with an explicit axis order
pub fn evaluate_groups_in_order(
    policies: &[Policy],
    attrs: &ClientAttributes,
    order: &[RuleType],
) -> GroupSet {
    order
        .iter()
        .map(|rule_type| evaluate_axis(policies, *rule_type, &attrs.value_for(*rule_type)))
        .fold(GroupSet::Unconstrained, GroupSet::intersect)
}

/// Fallback groups declared by enabled policies routing to any of `group_ids`
///
/// Returned in policy order without duplicates, skipping the candidates themselves.
pub fn fallback_groups(policies: &[Policy], group_ids: &[String]) -> Vec<String> {
    let mut fallbacks: Vec<String> = Vec::new();
    for policy in policies.iter().filter(|p| p.enabled && group_ids.contains(&p.group_id)) {
        if let Some(fallback) = policy.fallback_group_id.as_deref().filter(|g| !g.is_empty()) {
            if !group_ids.iter().any(|g| g == fallback) && !fallbacks.iter().any(|g| g == fallback) {
                fallbacks.push(fallback.to_string());
            }
        }
    }
    fallbacks
}

/// True iff an enabled, auth-delegated policy matches the listening port
pub fn evaluate_auth_delegation(policies: &[Policy], port: u16) -> bool {
    let port = port.to_string();
    policies
        .iter()
        .any(|p| p.auth_delegated && p.matches(RuleType::ListeningPort, &port))
}

/// Source override of the first enabled policy on the listening port that defines one
pub fn evaluate_request_source(policies: &[Policy], port: u16) -> Option<String> {
    let port = port.to_string();
    policies
        .iter()
        .filter(|p| p.matches(RuleType::ListeningPort, &port))
        .find_map(|p| p.request_source.clone().filter(|s| !s.is_empty()))
}
