//! Policy model for Processing Units.
//!
//! A PU policy is immutable per version. It carries the identity claims
//! the PU asserts about itself, receiver and transmitter rules matched
//! against authenticated peers, IP ACLs for unauthenticated external
//! endpoints, and the network scoping (target and excluded CIDRs) that
//! decides which traffic is intercepted at all.

mod pu;
mod rules;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub use pu::{PuInfo, PuPolicy, PuRuntime, PuType, RuntimeOptions, DEFAULT_NAMESPACE};
pub use rules::{
    IpPortPair, IpRule, PortSpec, PortSpecError, PredicateOp, Protocol, ProxiedServices,
    TagPredicate, TagRule,
};

bitflags! {
    /// Verdict bitmask attached to policy rules.
    ///
    /// `ACCEPT` and `REJECT` are mutually exclusive; `LOG` may be or-ed
    /// with either.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Action: u8 {
        /// Allow the flow.
        const ACCEPT = 0x1;
        /// Drop the flow.
        const REJECT = 0x2;
        /// Additionally log the decision.
        const LOG = 0x4;
    }
}

impl Default for Action {
    /// Policing default: reject what no rule admits.
    fn default() -> Self {
        Self::REJECT
    }
}

impl Serialize for Action {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Self::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid action bits {bits:#x}")))
    }
}

impl Action {
    /// Returns `true` if the accept bit is set.
    #[must_use]
    pub const fn accepted(self) -> bool {
        self.contains(Self::ACCEPT)
    }

    /// Returns `true` if the reject bit is set.
    #[must_use]
    pub const fn rejected(self) -> bool {
        self.contains(Self::REJECT)
    }

    /// Returns `true` if the log bit is set.
    #[must_use]
    pub const fn logged(self) -> bool {
        self.contains(Self::LOG)
    }

    /// Short encoding used in packet-filter log prefixes.
    #[must_use]
    pub fn encoded(self) -> &'static str {
        match (self.accepted(), self.rejected(), self.logged()) {
            (true, _, false) => "1",
            (false, true, false) => "2",
            (true, _, true) => "3",
            (false, true, true) => "4",
            _ => "0",
        }
    }
}

/// Observation mode of a rule, orthogonal to its [`Action`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserveAction {
    /// Not an observation rule.
    #[default]
    None,
    /// Log the would-be verdict, then continue evaluation.
    ObserveContinue,
    /// Apply only if no non-observed rule matched.
    ObserveApply,
}

impl ObserveAction {
    /// Returns `true` for either observation mode.
    #[must_use]
    pub const fn observed(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Returns `true` for [`ObserveAction::ObserveContinue`].
    #[must_use]
    pub const fn observe_continue(self) -> bool {
        matches!(self, Self::ObserveContinue)
    }

    /// Returns `true` for [`ObserveAction::ObserveApply`].
    #[must_use]
    pub const fn observe_apply(self) -> bool {
        matches!(self, Self::ObserveApply)
    }
}

/// The verdict portion shared by tag rules and IP ACL rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowPolicy {
    /// Accept/reject plus optional logging.
    pub action: Action,
    /// Observation mode.
    pub observe: ObserveAction,
    /// Identifier of the policy rule, reported in flow events.
    pub policy_id: String,
}

impl FlowPolicy {
    /// Creates a non-observed policy verdict.
    #[must_use]
    pub fn new(action: Action, policy_id: impl Into<String>) -> Self {
        Self {
            action,
            observe: ObserveAction::None,
            policy_id: policy_id.into(),
        }
    }

    /// Creates an observed policy verdict.
    #[must_use]
    pub fn observing(
        action: Action,
        observe: ObserveAction,
        policy_id: impl Into<String>,
    ) -> Self {
        Self {
            action,
            observe,
            policy_id: policy_id.into(),
        }
    }

    /// NFLOG prefix for this rule: `{contextID}:{policyID}:{action}`.
    #[must_use]
    pub fn log_prefix(&self, context_id: &str) -> String {
        format!("{context_id}:{}:{}", self.policy_id, self.action.encoded())
    }
}

/// NFLOG prefix of the default tail drop rule of a PU chain.
#[must_use]
pub fn default_log_prefix(context_id: &str) -> String {
    format!("{context_id}:default:6")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_encoding() {
        assert_eq!(Action::ACCEPT.encoded(), "1");
        assert_eq!(Action::REJECT.encoded(), "2");
        assert_eq!((Action::ACCEPT | Action::LOG).encoded(), "3");
        assert_eq!((Action::REJECT | Action::LOG).encoded(), "4");
    }

    #[test]
    fn test_log_prefix_shape() {
        let policy = FlowPolicy::new(Action::ACCEPT, "p1");

        assert_eq!(policy.log_prefix("ctx"), "ctx:p1:1");
        assert_eq!(default_log_prefix("ctx"), "ctx:default:6");
    }

    #[test]
    fn test_observe_predicates() {
        assert!(!ObserveAction::None.observed());
        assert!(ObserveAction::ObserveContinue.observed());
        assert!(ObserveAction::ObserveContinue.observe_continue());
        assert!(ObserveAction::ObserveApply.observe_apply());
        assert!(!ObserveAction::ObserveApply.observe_continue());
    }
}
