//! Rule types: claim predicates for authenticated peers and IP ACLs for
//! unauthenticated external endpoints.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::FlowPolicy;
use crate::claims::ClaimSet;
use crate::net::CidrV4;

/// Comparison operator of a single claim predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    /// Key present with exactly this value.
    Equals,
    /// Key present with a different value, or absent.
    NotEquals,
    /// Key present with any value.
    KeyExists,
    /// Key absent.
    KeyAbsent,
}

/// A single claim predicate `(key, op, value)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPredicate {
    /// Claim key to inspect.
    pub key: String,
    /// Comparison operator.
    pub op: PredicateOp,
    /// Comparison value; ignored for the existence operators.
    #[serde(default)]
    pub value: String,
}

impl TagPredicate {
    /// Creates an equality predicate.
    #[must_use]
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: PredicateOp::Equals,
            value: value.into(),
        }
    }

    /// Returns `true` if the predicate holds against `claims`.
    #[must_use]
    pub fn matches(&self, claims: &ClaimSet) -> bool {
        match self.op {
            PredicateOp::Equals => claims.get(&self.key) == Some(self.value.as_str()),
            PredicateOp::NotEquals => claims.get(&self.key) != Some(self.value.as_str()),
            PredicateOp::KeyExists => claims.get(&self.key).is_some(),
            PredicateOp::KeyAbsent => claims.get(&self.key).is_none(),
        }
    }
}

/// A rule matched against an authenticated peer's claim set.
///
/// The rule matches only if all of its predicates hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRule {
    /// Conjunction of claim predicates.
    pub predicates: Vec<TagPredicate>,
    /// Verdict applied when the rule matches.
    pub policy: FlowPolicy,
}

impl TagRule {
    /// Creates a rule from predicates and a verdict.
    #[must_use]
    pub fn new(predicates: Vec<TagPredicate>, policy: FlowPolicy) -> Self {
        Self { predicates, policy }
    }

    /// Returns `true` if every predicate holds against `claims`.
    #[must_use]
    pub fn matches(&self, claims: &ClaimSet) -> bool {
        self.predicates.iter().all(|p| p.matches(claims))
    }
}

/// IP protocol selector of an ACL rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    /// Lower-case name as used by the packet-filter engine.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// Errors produced when parsing a port specification.
#[derive(Debug, Error)]
#[error("invalid port spec: {input}")]
pub struct PortSpecError {
    /// The rejected input.
    pub input: String,
}

/// A destination port selector: a single port, an inclusive range, or
/// any port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortSpec {
    low: u16,
    high: u16,
}

impl PortSpec {
    /// Matches every port.
    pub const ANY: Self = Self {
        low: 0,
        high: u16::MAX,
    };

    /// Creates a single-port selector.
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self {
            low: port,
            high: port,
        }
    }

    /// Creates an inclusive range selector.
    ///
    /// # Errors
    ///
    /// Fails if `low > high`.
    pub fn range(low: u16, high: u16) -> Result<Self, PortSpecError> {
        if low > high {
            return Err(PortSpecError {
                input: format!("{low}:{high}"),
            });
        }
        Ok(Self { low, high })
    }

    /// Returns `true` if `port` falls inside the selector.
    #[must_use]
    pub const fn matches(&self, port: u16) -> bool {
        port >= self.low && port <= self.high
    }

    /// Returns `true` if the selector matches every port.
    #[must_use]
    pub const fn is_any(&self) -> bool {
        self.low == 0 && self.high == u16::MAX
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "0")
        } else if self.low == self.high {
            write!(f, "{}", self.low)
        } else {
            write!(f, "{}:{}", self.low, self.high)
        }
    }
}

impl FromStr for PortSpec {
    type Err = PortSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PortSpecError {
            input: s.to_string(),
        };

        if s == "0" || s.is_empty() {
            return Ok(Self::ANY);
        }

        match s.split_once(':') {
            Some((low, high)) => {
                let low = low.parse().map_err(|_| invalid())?;
                let high = high.parse().map_err(|_| invalid())?;
                Self::range(low, high).map_err(|_| invalid())
            },
            None => Ok(Self::single(s.parse().map_err(|_| invalid())?)),
        }
    }
}

impl TryFrom<String> for PortSpec {
    type Error = PortSpecError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PortSpec> for String {
    fn from(p: PortSpec) -> Self {
        p.to_string()
    }
}

/// An ACL rule matched against an unauthenticated external endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRule {
    /// Peer network.
    pub address: CidrV4,
    /// Destination port selector.
    pub ports: PortSpec,
    /// Protocol.
    pub protocol: Protocol,
    /// Verdict applied when the rule matches.
    pub policy: FlowPolicy,
}

impl IpRule {
    /// Returns `true` if the rule covers `(ip, port, protocol)`.
    #[must_use]
    pub fn matches(&self, ip: Ipv4Addr, port: u16, protocol: Protocol) -> bool {
        self.protocol == protocol && self.address.contains(ip) && self.ports.matches(port)
    }
}

/// An `IP,port` pair identifying a proxied service endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPortPair {
    /// Service address.
    pub ip: Ipv4Addr,
    /// Service port.
    pub port: u16,
}

impl fmt::Display for IpPortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ipset hash:ip,port member syntax.
        write!(f, "{},{}", self.ip, self.port)
    }
}

/// Public and private endpoints handled by the in-series proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxiedServices {
    /// Endpoints reached by outbound connections from the PU.
    pub public_pairs: Vec<IpPortPair>,
    /// Endpoints whose inbound connections are proxied.
    pub private_pairs: Vec<IpPortPair>,
}

impl ProxiedServices {
    /// Returns `true` if no endpoint is proxied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.public_pairs.is_empty() && self.private_pairs.is_empty()
    }

    /// Returns `true` if `(ip, port)` is a public proxied endpoint.
    #[must_use]
    pub fn is_public(&self, ip: Ipv4Addr, port: u16) -> bool {
        self.public_pairs
            .iter()
            .any(|p| p.ip == ip && p.port == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Action;

    fn claims(pairs: &[(&str, &str)]) -> ClaimSet {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_predicate_ops() {
        let c = claims(&[("role", "web")]);

        assert!(TagPredicate::equals("role", "web").matches(&c));
        assert!(!TagPredicate::equals("role", "db").matches(&c));

        let ne = TagPredicate {
            key: "role".into(),
            op: PredicateOp::NotEquals,
            value: "db".into(),
        };
        assert!(ne.matches(&c));

        let exists = TagPredicate {
            key: "role".into(),
            op: PredicateOp::KeyExists,
            value: String::new(),
        };
        assert!(exists.matches(&c));

        let absent = TagPredicate {
            key: "tier".into(),
            op: PredicateOp::KeyAbsent,
            value: String::new(),
        };
        assert!(absent.matches(&c));
    }

    #[test]
    fn test_rule_requires_all_predicates() {
        let rule = TagRule::new(
            vec![
                TagPredicate::equals("role", "web"),
                TagPredicate::equals("tier", "1"),
            ],
            FlowPolicy::new(Action::ACCEPT, "p1"),
        );

        assert!(rule.matches(&claims(&[("role", "web"), ("tier", "1")])));
        assert!(!rule.matches(&claims(&[("role", "web")])));
    }

    #[test]
    fn test_port_spec_parse() {
        assert!("80".parse::<PortSpec>().unwrap().matches(80));
        assert!(!"80".parse::<PortSpec>().unwrap().matches(81));

        let range: PortSpec = "8000:8100".parse().unwrap();
        assert!(range.matches(8050));
        assert!(!range.matches(7999));

        assert!("0".parse::<PortSpec>().unwrap().is_any());
        assert!("9000:8000".parse::<PortSpec>().is_err());
    }

    #[test]
    fn test_ip_rule_match() {
        let rule = IpRule {
            address: "10.0.0.0/8".parse().unwrap(),
            ports: PortSpec::single(443),
            protocol: Protocol::Tcp,
            policy: FlowPolicy::new(Action::ACCEPT, "ext-1"),
        };

        assert!(rule.matches(Ipv4Addr::new(10, 9, 9, 9), 443, Protocol::Tcp));
        assert!(!rule.matches(Ipv4Addr::new(10, 9, 9, 9), 443, Protocol::Udp));
        assert!(!rule.matches(Ipv4Addr::new(11, 0, 0, 1), 443, Protocol::Tcp));
        assert!(!rule.matches(Ipv4Addr::new(10, 9, 9, 9), 80, Protocol::Tcp));
    }
}
