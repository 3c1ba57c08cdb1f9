//! Claim-set rule evaluation.
//!
//! Rules are evaluated in three passes so operators can stage policy
//! without outages:
//!
//! 1. Only `ObserveContinue` rules: a match marks the packet and
//!    records the shadow policy id, then evaluation continues.
//! 2. Only non-observed rules: first match wins.
//! 3. Only `ObserveApply` rules: applied if nothing matched earlier.
//!
//! Rule order within the input list is authoritative; the evaluator
//! never reorders.

use crate::claims::ClaimSet;
use crate::policy::{Action, TagRule};

/// Policy id reported when no rule matched and the default applied.
pub const DEFAULT_POLICY_ID: &str = "default";

/// Outcome of evaluating a peer claim set against a rule list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowVerdict {
    /// The realized action.
    pub action: Action,
    /// Identifier of the deciding rule, or [`DEFAULT_POLICY_ID`].
    pub policy_id: String,
    /// Shadow policy id recorded by an `ObserveContinue` match.
    pub observed_policy_id: Option<String>,
}

impl FlowVerdict {
    /// Returns `true` if the realized action accepts the flow.
    #[must_use]
    pub const fn accepted(&self) -> bool {
        self.action.accepted()
    }
}

/// Evaluates `claims` against `rules` with first-match semantics across
/// the three observation passes, falling back to `default_action`.
#[must_use]
pub fn evaluate(claims: &ClaimSet, rules: &[TagRule], default_action: Action) -> FlowVerdict {
    // Pass 0: observe-continue rules mark the packet and defer.
    let observed_policy_id = rules
        .iter()
        .filter(|r| r.policy.observe.observe_continue())
        .find(|r| r.matches(claims))
        .map(|r| r.policy.policy_id.clone());

    // Pass 1: non-observed rules decide.
    if let Some(rule) = rules
        .iter()
        .filter(|r| !r.policy.observe.observed())
        .find(|r| r.matches(claims))
    {
        return FlowVerdict {
            action: rule.policy.action,
            policy_id: rule.policy.policy_id.clone(),
            observed_policy_id,
        };
    }

    // Pass 2: observe-apply rules decide if still unresolved.
    if let Some(rule) = rules
        .iter()
        .filter(|r| r.policy.observe.observe_apply())
        .find(|r| r.matches(claims))
    {
        return FlowVerdict {
            action: rule.policy.action,
            policy_id: rule.policy.policy_id.clone(),
            observed_policy_id,
        };
    }

    FlowVerdict {
        action: default_action,
        policy_id: DEFAULT_POLICY_ID.to_string(),
        observed_policy_id,
    }
}

/// Evaluates an unauthenticated endpoint against IP ACLs with the same
/// three-pass observation semantics as [`evaluate`].
#[must_use]
pub fn evaluate_ip_acls(
    ip: std::net::Ipv4Addr,
    port: u16,
    protocol: crate::policy::Protocol,
    rules: &[crate::policy::IpRule],
    default_action: Action,
) -> FlowVerdict {
    let observed_policy_id = rules
        .iter()
        .filter(|r| r.policy.observe.observe_continue())
        .find(|r| r.matches(ip, port, protocol))
        .map(|r| r.policy.policy_id.clone());

    if let Some(rule) = rules
        .iter()
        .filter(|r| !r.policy.observe.observed())
        .find(|r| r.matches(ip, port, protocol))
    {
        return FlowVerdict {
            action: rule.policy.action,
            policy_id: rule.policy.policy_id.clone(),
            observed_policy_id,
        };
    }

    if let Some(rule) = rules
        .iter()
        .filter(|r| r.policy.observe.observe_apply())
        .find(|r| r.matches(ip, port, protocol))
    {
        return FlowVerdict {
            action: rule.policy.action,
            policy_id: rule.policy.policy_id.clone(),
            observed_policy_id,
        };
    }

    FlowVerdict {
        action: default_action,
        policy_id: DEFAULT_POLICY_ID.to_string(),
        observed_policy_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{FlowPolicy, ObserveAction, TagPredicate};

    fn claims(pairs: &[(&str, &str)]) -> ClaimSet {
        pairs.iter().copied().collect()
    }

    fn rule(key: &str, value: &str, policy: FlowPolicy) -> TagRule {
        TagRule::new(vec![TagPredicate::equals(key, value)], policy)
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            rule("role", "web", FlowPolicy::new(Action::ACCEPT, "p1")),
            rule("role", "web", FlowPolicy::new(Action::REJECT, "p2")),
        ];

        let verdict = evaluate(&claims(&[("role", "web")]), &rules, Action::REJECT);

        assert!(verdict.accepted());
        assert_eq!(verdict.policy_id, "p1");
    }

    #[test]
    fn test_default_action_when_nothing_matches() {
        let rules = vec![rule("role", "admin", FlowPolicy::new(Action::ACCEPT, "p1"))];

        let verdict = evaluate(&claims(&[("role", "web")]), &rules, Action::REJECT);

        assert!(verdict.action.rejected());
        assert_eq!(verdict.policy_id, DEFAULT_POLICY_ID);
        assert_eq!(verdict.observed_policy_id, None);
    }

    #[test]
    fn test_observe_continue_records_shadow_policy() {
        let rules = vec![
            rule(
                "role",
                "web",
                FlowPolicy::observing(Action::REJECT, ObserveAction::ObserveContinue, "p1-shadow"),
            ),
            rule("role", "web", FlowPolicy::new(Action::ACCEPT, "p1")),
        ];

        let verdict = evaluate(&claims(&[("role", "web")]), &rules, Action::REJECT);

        // The realized verdict comes from the non-observed rule; the
        // shadow rule is only recorded.
        assert!(verdict.accepted());
        assert_eq!(verdict.policy_id, "p1");
        assert_eq!(verdict.observed_policy_id.as_deref(), Some("p1-shadow"));
    }

    #[test]
    fn test_observe_continue_without_later_match_falls_to_default() {
        let rules = vec![rule(
            "role",
            "web",
            FlowPolicy::observing(Action::ACCEPT, ObserveAction::ObserveContinue, "shadow"),
        )];

        let verdict = evaluate(&claims(&[("role", "web")]), &rules, Action::REJECT);

        assert!(verdict.action.rejected());
        assert_eq!(verdict.policy_id, DEFAULT_POLICY_ID);
        assert_eq!(verdict.observed_policy_id.as_deref(), Some("shadow"));
    }

    #[test]
    fn test_observe_apply_decides_when_unresolved() {
        let rules = vec![
            rule("role", "admin", FlowPolicy::new(Action::ACCEPT, "p1")),
            rule(
                "role",
                "web",
                FlowPolicy::observing(Action::ACCEPT, ObserveAction::ObserveApply, "p2-apply"),
            ),
        ];

        let verdict = evaluate(&claims(&[("role", "web")]), &rules, Action::REJECT);

        assert!(verdict.accepted());
        assert_eq!(verdict.policy_id, "p2-apply");
    }

    #[test]
    fn test_non_observed_match_shadows_observe_apply() {
        let rules = vec![
            rule(
                "role",
                "web",
                FlowPolicy::observing(Action::REJECT, ObserveAction::ObserveApply, "p-apply"),
            ),
            rule("role", "web", FlowPolicy::new(Action::ACCEPT, "p1")),
        ];

        let verdict = evaluate(&claims(&[("role", "web")]), &rules, Action::REJECT);

        assert_eq!(verdict.policy_id, "p1");
        assert!(verdict.accepted());
    }

    #[test]
    fn test_input_order_is_authoritative_within_a_pass() {
        let rules = vec![
            rule(
                "role",
                "web",
                FlowPolicy::observing(Action::ACCEPT, ObserveAction::ObserveApply, "apply-1"),
            ),
            rule(
                "role",
                "web",
                FlowPolicy::observing(Action::REJECT, ObserveAction::ObserveApply, "apply-2"),
            ),
        ];

        let verdict = evaluate(&claims(&[("role", "web")]), &rules, Action::REJECT);

        assert_eq!(verdict.policy_id, "apply-1");
    }

    #[test]
    fn test_empty_claims_match_key_absent_rules() {
        let rules = vec![TagRule::new(
            vec![TagPredicate {
                key: "role".into(),
                op: crate::policy::PredicateOp::KeyAbsent,
                value: String::new(),
            }],
            FlowPolicy::new(Action::ACCEPT, "p1"),
        )];

        let verdict = evaluate(&ClaimSet::new(), &rules, Action::REJECT);
        assert!(verdict.accepted());
    }

    #[test]
    fn test_ip_acl_three_pass() {
        use std::net::Ipv4Addr;

        use crate::policy::{IpRule, PortSpec, Protocol};

        let rules = vec![
            IpRule {
                address: "10.0.0.0/8".parse().unwrap(),
                ports: PortSpec::single(443),
                protocol: Protocol::Tcp,
                policy: FlowPolicy::observing(
                    Action::REJECT,
                    ObserveAction::ObserveContinue,
                    "acl-shadow",
                ),
            },
            IpRule {
                address: "10.0.0.0/8".parse().unwrap(),
                ports: PortSpec::single(443),
                protocol: Protocol::Tcp,
                policy: FlowPolicy::new(Action::ACCEPT, "acl-1"),
            },
        ];

        let verdict = evaluate_ip_acls(
            Ipv4Addr::new(10, 1, 1, 1),
            443,
            Protocol::Tcp,
            &rules,
            Action::REJECT,
        );

        assert!(verdict.accepted());
        assert_eq!(verdict.policy_id, "acl-1");
        assert_eq!(verdict.observed_policy_id.as_deref(), Some("acl-shadow"));

        let miss = evaluate_ip_acls(
            Ipv4Addr::new(11, 0, 0, 1),
            443,
            Protocol::Tcp,
            &rules,
            Action::REJECT,
        );
        assert!(miss.action.rejected());
        assert_eq!(miss.policy_id, DEFAULT_POLICY_ID);
    }
}
