//! Processing Unit policy and runtime records.
//!
//! Both records are immutable per enforce call; a policy change arrives
//! as a complete replacement `PuInfo`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::rules::{IpRule, PortSpec, ProxiedServices, TagRule};
use super::Action;
use crate::claims::ClaimSet;
use crate::net::CidrV4;

/// Namespace key of the default IP address of a PU.
pub const DEFAULT_NAMESPACE: &str = "bridge";

/// Default in-series proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 5000;

/// Kind of Processing Unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PuType {
    /// A container with its own network namespace.
    Container,
    /// A cgroup-bound Linux process group.
    LinuxProcess,
    /// A UID-bound login session.
    UidLogin,
}

/// Runtime options extracted by the monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// net_cls cgroup mark of the PU, if cgroup-scoped.
    pub cgroup_mark: Option<u32>,
    /// Owning user for UID-scoped PUs.
    pub user_id: Option<String>,
    /// Server port specs declared for the PU.
    pub services: Vec<PortSpec>,
    /// Port of the in-series proxy.
    pub proxy_port: u16,
    /// UID of an in-series sidecar, if any.
    pub sidecar_uid: Option<String>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            cgroup_mark: None,
            user_id: None,
            services: Vec::new(),
            proxy_port: DEFAULT_PROXY_PORT,
            sidecar_uid: None,
        }
    }
}

impl RuntimeOptions {
    /// Renders the declared services as a packet-filter port list.
    ///
    /// An empty service list renders as `"0"` (no ports).
    #[must_use]
    pub fn port_list(&self) -> String {
        if self.services.is_empty() {
            return "0".to_string();
        }
        self.services
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Runtime status of a PU, provided by the monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuRuntime {
    /// Kind of PU.
    pub pu_type: PuType,
    /// Pid of the first process of the PU.
    pub pid: i32,
    /// Path to the network namespace, if applicable.
    pub ns_path: Option<PathBuf>,
    /// Human-readable name.
    pub name: String,
    /// IP addresses by namespace.
    pub ips: BTreeMap<String, Ipv4Addr>,
    /// Metadata claims discovered for the PU.
    pub tags: ClaimSet,
    /// Monitor-provided options.
    pub options: RuntimeOptions,
}

impl PuRuntime {
    /// Creates a runtime record.
    #[must_use]
    pub fn new(pu_type: PuType, name: impl Into<String>, pid: i32) -> Self {
        Self {
            pu_type,
            pid,
            ns_path: None,
            name: name.into(),
            ips: BTreeMap::new(),
            tags: ClaimSet::new(),
            options: RuntimeOptions::default(),
        }
    }

    /// Returns the IP address in the default namespace.
    #[must_use]
    pub fn default_ip(&self) -> Option<Ipv4Addr> {
        self.ips.get(DEFAULT_NAMESPACE).copied()
    }
}

/// The immutable policy of a PU at one version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuPolicy {
    /// External management identifier of the policy.
    pub management_id: String,
    /// Claims this PU asserts about itself.
    pub identity: ClaimSet,
    /// Rules applied to incoming authenticated connections; the matched
    /// claim set is the remote peer's identity.
    pub receiver_rules: Vec<TagRule>,
    /// Rules applied to outgoing authenticated connections.
    pub transmitter_rules: Vec<TagRule>,
    /// ACLs for unauthenticated egress.
    pub application_acls: Vec<IpRule>,
    /// ACLs for unauthenticated ingress.
    pub network_acls: Vec<IpRule>,
    /// CIDRs bypassed entirely.
    pub excluded_networks: Vec<CidrV4>,
    /// CIDRs on which the authentication protocol is applied.
    pub target_networks: Vec<CidrV4>,
    /// IP addresses owned by the PU, by namespace.
    pub ips: BTreeMap<String, Ipv4Addr>,
    /// Verdict when no rule matches.
    pub default_action: Action,
    /// Endpoints handled by the in-series proxy.
    pub proxied_services: ProxiedServices,
}

impl PuPolicy {
    /// Creates a policing (default-reject) policy with the given
    /// identity claims.
    #[must_use]
    pub fn new(management_id: impl Into<String>, identity: ClaimSet) -> Self {
        Self {
            management_id: management_id.into(),
            identity,
            default_action: Action::REJECT,
            ..Self::default()
        }
    }

    /// Returns the IP address in the default namespace.
    #[must_use]
    pub fn default_ip(&self) -> Option<Ipv4Addr> {
        self.ips.get(DEFAULT_NAMESPACE).copied()
    }
}

/// A PU as seen by the supervisor and datapath: context identifier plus
/// policy and runtime records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuInfo {
    /// Context identifier of the PU.
    pub context_id: String,
    /// Policy at the current version.
    pub policy: PuPolicy,
    /// Runtime status.
    pub runtime: PuRuntime,
}

impl PuInfo {
    /// Bundles a context identifier with policy and runtime records.
    #[must_use]
    pub fn new(context_id: impl Into<String>, policy: PuPolicy, runtime: PuRuntime) -> Self {
        Self {
            context_id: context_id.into(),
            policy,
            runtime,
        }
    }
}
