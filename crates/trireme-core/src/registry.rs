//! Read-mostly registry of enforced PU contexts.
//!
//! The supervisor publishes a complete snapshot per PU; packet workers
//! clone the snapshot `Arc` once per decision and never take a writer
//! lock. An IP reverse index resolves the local endpoint's context from
//! a packet's source or destination address.

use std::net::Ipv4Addr;
use std::sync::Arc;

use dashmap::DashMap;

use crate::claims::ClaimSet;
use crate::policy::{Action, IpRule, ProxiedServices, PuInfo, TagRule};
use crate::net::CidrV4;

/// Immutable snapshot of one enforced PU.
#[derive(Debug, Clone)]
pub struct PuContext {
    /// Context identifier.
    pub context_id: String,
    /// Policy snapshot version, monotonically increasing per context.
    pub version: u64,
    /// Management identifier of the policy.
    pub management_id: String,
    /// Claims the PU asserts about itself.
    pub identity: ClaimSet,
    /// Rules for incoming authenticated connections.
    pub receiver_rules: Vec<TagRule>,
    /// Rules for outgoing authenticated connections.
    pub transmitter_rules: Vec<TagRule>,
    /// ACLs for unauthenticated egress.
    pub application_acls: Vec<IpRule>,
    /// ACLs for unauthenticated ingress.
    pub network_acls: Vec<IpRule>,
    /// CIDRs on which authentication applies.
    pub target_networks: Vec<CidrV4>,
    /// CIDRs bypassed entirely.
    pub excluded_networks: Vec<CidrV4>,
    /// Verdict when no rule matches.
    pub default_action: Action,
    /// Addresses owned by the PU.
    pub ips: Vec<Ipv4Addr>,
    /// cgroup mark, if cgroup-scoped.
    pub mark: Option<u32>,
    /// Name of the PU's dynamic port set, if UID-scoped.
    pub port_set_name: Option<String>,
    /// In-series proxy port.
    pub proxy_port: u16,
    /// Proxied service endpoints.
    pub proxied_services: ProxiedServices,
}

impl PuContext {
    /// Builds a version-0 snapshot from a `PuInfo`.
    ///
    /// The registry assigns the real version at publish time.
    #[must_use]
    pub fn from_pu(pu: &PuInfo, port_set_name: Option<String>) -> Self {
        Self {
            context_id: pu.context_id.clone(),
            version: 0,
            management_id: pu.policy.management_id.clone(),
            identity: pu.policy.identity.clone(),
            receiver_rules: pu.policy.receiver_rules.clone(),
            transmitter_rules: pu.policy.transmitter_rules.clone(),
            application_acls: pu.policy.application_acls.clone(),
            network_acls: pu.policy.network_acls.clone(),
            target_networks: pu.policy.target_networks.clone(),
            excluded_networks: pu.policy.excluded_networks.clone(),
            default_action: pu.policy.default_action,
            ips: pu.policy.ips.values().copied().collect(),
            mark: pu.runtime.options.cgroup_mark,
            port_set_name,
            proxy_port: pu.runtime.options.proxy_port,
            proxied_services: pu.policy.proxied_services.clone(),
        }
    }
}

/// Registry of enforced PU contexts with an IP reverse index.
#[derive(Default)]
pub struct ContextRegistry {
    contexts: DashMap<String, Arc<PuContext>>,
    by_ip: DashMap<Ipv4Addr, String>,
}

impl ContextRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a snapshot, replacing any previous one for the same
    /// context and re-indexing its IPs.
    ///
    /// The published version is one above the previous snapshot's.
    /// Callers must publish only after the corresponding packet-filter
    /// rules are installed.
    pub fn publish(&self, mut context: PuContext) -> Arc<PuContext> {
        let previous = self.contexts.get(&context.context_id).map(|c| Arc::clone(&c));

        context.version = previous.as_ref().map_or(1, |p| p.version + 1);
        let context = Arc::new(context);

        if let Some(previous) = previous {
            for ip in &previous.ips {
                self.by_ip.remove_if(ip, |_, ctx| ctx == &previous.context_id);
            }
        }
        for ip in &context.ips {
            self.by_ip.insert(*ip, context.context_id.clone());
        }

        self.contexts
            .insert(context.context_id.clone(), Arc::clone(&context));
        context
    }

    /// Removes a context and its IP index entries.
    pub fn remove(&self, context_id: &str) -> Option<Arc<PuContext>> {
        let (_, context) = self.contexts.remove(context_id)?;
        for ip in &context.ips {
            self.by_ip.remove_if(ip, |_, ctx| ctx == context_id);
        }
        Some(context)
    }

    /// Returns a pinned snapshot for `context_id`.
    #[must_use]
    pub fn get(&self, context_id: &str) -> Option<Arc<PuContext>> {
        self.contexts.get(context_id).map(|c| Arc::clone(&c))
    }

    /// Resolves the context owning `ip`, if any.
    #[must_use]
    pub fn find_by_ip(&self, ip: Ipv4Addr) -> Option<Arc<PuContext>> {
        let context_id = self.by_ip.get(&ip)?;
        self.get(&context_id)
    }

    /// Number of enforced contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Returns `true` if no context is enforced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
