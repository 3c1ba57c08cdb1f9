//! The packet-filter supervisor.
//!
//! Compiles each PU's policy into a versioned pair of App/Net chains
//! plus the sets and jump rules that steer traffic into them, and keeps
//! the shared global plumbing (target-network set, proxy chains,
//! section rules) in place. Policy changes flip the chain version bit:
//! new chains are fully built and jumped to before the old ones are
//! unhooked, so established connections never drop.

pub mod names;

mod provider;
mod rules;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

pub use provider::{CommandProvider, MemoryProvider, ProviderError, RuleProvider, SetProvider};

use crate::enforcer::{Enforcer, EnforcerError, Mode};
use crate::net::CidrV4;
use crate::policy::PuInfo;
use crate::portset::PortSetTracker;
use rules::{AclSide, EngineRule, Renderer, RuleOp};

use names::{
    chain_names, proxy_set_name, proxy_set_pair, pu_port_set_name, CHAIN_PREFIX,
    NAT_PROXY_INPUT_CHAIN, NAT_PROXY_OUTPUT_CHAIN, PROXY_INPUT_CHAIN, PROXY_OUTPUT_CHAIN,
    TARGET_NETWORK_SET, UID_CHAIN,
};

/// Networks used when the target list is empty: intercept everything.
const ALL_NETWORKS: [&str; 2] = ["0.0.0.0/1", "128.0.0.0/1"];

/// Errors surfaced by the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Invalid inputs; nothing was installed.
    #[error("invalid supervisor configuration: {reason}")]
    Config {
        /// What was wrong.
        reason: String,
    },

    /// The packet-filter engine rejected a command. The supervisor has
    /// already attempted rollback.
    #[error("rule engine failure: {0}")]
    RuleEngine(#[from] ProviderError),

    /// The datapath rejected the PU registration.
    #[error(transparent)]
    Enforcer(#[from] EnforcerError),
}

struct PuRecord {
    version: u32,
    ip: Option<Ipv4Addr>,
    mark: Option<u32>,
    port_list: String,
    uid: Option<String>,
    proxy_port: u16,
    pu: PuInfo,
}

struct State {
    tracked: HashMap<String, PuRecord>,
    target_networks: Vec<CidrV4>,
}

/// The supervisor: one per enforcer, serialized by a single mutex.
pub struct Supervisor {
    renderer: Renderer,
    engine: Arc<dyn RuleProvider>,
    sets: Arc<dyn SetProvider>,
    enforcer: Arc<dyn Enforcer>,
    portset: Option<Arc<PortSetTracker>>,
    state: Mutex<State>,
}

impl Supervisor {
    /// Creates a supervisor for `enforcer`, capturing its filter-queue
    /// parameters.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Config`] if a port-set tracker is
    /// missing in a mode that programs UID PUs.
    pub fn new(
        enforcer: Arc<dyn Enforcer>,
        mode: Mode,
        target_networks: Vec<CidrV4>,
        engine: Arc<dyn RuleProvider>,
        sets: Arc<dyn SetProvider>,
        portset: Option<Arc<PortSetTracker>>,
    ) -> Result<Self, SupervisorError> {
        if mode != Mode::RemoteContainer && portset.is_none() {
            return Err(SupervisorError::Config {
                reason: "port-set tracker required outside remote-container mode".to_string(),
            });
        }

        let filter_queue = enforcer.filter_queue();
        Ok(Self {
            renderer: Renderer::new(mode, filter_queue),
            engine,
            sets,
            enforcer,
            portset,
            state: Mutex::new(State {
                tracked: HashMap::new(),
                target_networks,
            }),
        })
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Enforces a PU: first call installs its chains, subsequent calls
    /// perform a hitless policy update.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Config`] on invalid inputs and
    /// [`SupervisorError::RuleEngine`] (after rollback) when the engine
    /// rejects a rule.
    pub fn supervise(&self, context_id: &str, pu: &PuInfo) -> Result<(), SupervisorError> {
        if context_id.is_empty() {
            return Err(SupervisorError::Config {
                reason: "empty context id".to_string(),
            });
        }

        let record = self.build_record(context_id, pu)?;
        let exists = self.locked().tracked.contains_key(context_id);
        if exists {
            self.update_pu(context_id, record)
        } else {
            self.create_pu(context_id, record)
        }
    }

    /// Tears down everything installed for a PU. Best-effort: every
    /// step runs regardless of earlier failures.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Config`] only when the context was
    /// never supervised.
    pub fn unsupervise(&self, context_id: &str) -> Result<(), SupervisorError> {
        let record = self.locked().tracked.remove(context_id).ok_or_else(|| {
            SupervisorError::Config {
                reason: format!("unknown context {context_id}"),
            }
        })?;

        self.teardown(context_id, &record);

        if let Err(err) = self.enforcer.unenforce(context_id) {
            warn!(context_id, %err, "datapath unenforce failed");
        }
        info!(context_id, "pu unsupervised");
        Ok(())
    }

    /// Installs the global plumbing and the target-network set, after
    /// clearing leftovers from a previous run.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::RuleEngine`] if the global rules
    /// cannot be installed.
    pub fn start(&self) -> Result<(), SupervisorError> {
        self.clean_acls();
        self.create_global_chains()?;

        let networks = self.locked().target_networks.clone();
        self.program_target_set(&networks)?;
        self.apply(&self.renderer.global_rules())?;

        info!(mode = %self.renderer.mode(), "supervisor started");
        Ok(())
    }

    /// Removes every rule, chain, and set owned by this agent.
    pub fn stop(&self) {
        self.clean_acls();
        if let Err(err) = self.sets.destroy_all() {
            warn!(%err, "failed to destroy sets");
        }
        info!("supervisor stopped");
    }

    /// Atomically replaces the target networks. An empty list means
    /// intercept everything.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::RuleEngine`] if the set cannot be
    /// updated.
    pub fn set_target_networks(&self, networks: Vec<CidrV4>) -> Result<(), SupervisorError> {
        self.program_target_set(&networks)?;
        self.locked().target_networks = networks;
        Ok(())
    }

    fn build_record(&self, context_id: &str, pu: &PuInfo) -> Result<PuRecord, SupervisorError> {
        let options = &pu.runtime.options;

        let ip = pu.policy.default_ip();
        if self.renderer.mode() != Mode::LocalServer && ip.is_none() {
            return Err(SupervisorError::Config {
                reason: format!("no default IP address for {context_id}"),
            });
        }
        let mark = options.cgroup_mark;
        if self.renderer.mode() == Mode::LocalServer && mark.is_none() {
            return Err(SupervisorError::Config {
                reason: format!("no cgroup mark for {context_id}"),
            });
        }

        Ok(PuRecord {
            version: 0,
            ip,
            mark,
            port_list: options.port_list(),
            uid: options.user_id.clone(),
            proxy_port: options.proxy_port,
            pu: pu.clone(),
        })
    }

    fn create_pu(&self, context_id: &str, record: PuRecord) -> Result<(), SupervisorError> {
        let result = self.install_version(context_id, &record, record.version, true);

        match result {
            Ok(()) => {},
            Err(err) => {
                // Roll back whatever half-landed; the original error is
                // what the caller needs to see.
                self.teardown(context_id, &record);
                return Err(err);
            },
        }

        if let Err(err) = self.enforcer.enforce(context_id, &record.pu) {
            self.teardown(context_id, &record);
            return Err(err.into());
        }

        self.locked().tracked.insert(context_id.to_string(), record);
        info!(context_id, "pu supervised");
        Ok(())
    }

    fn update_pu(&self, context_id: &str, mut record: PuRecord) -> Result<(), SupervisorError> {
        let (old_version, old_record_chains) = {
            let state = self.locked();
            let old = state.tracked.get(context_id).ok_or_else(|| {
                SupervisorError::Config {
                    reason: format!("unknown context {context_id}"),
                }
            })?;
            (old.version, self.jump_rules(context_id, old, old.version))
        };
        record.version = old_version ^ 1;

        // Build the replacement chains completely before touching the
        // live ones.
        self.install_version(context_id, &record, record.version, false)?;

        // Switch traffic, then retire the old version.
        self.delete_rules(&old_record_chains);
        let (old_app, old_net) = chain_names(context_id, old_version);
        self.remove_chain_pair(&old_app, &old_net);

        self.update_proxy_sets(context_id, &record)?;

        if let Err(err) = self.enforcer.enforce(context_id, &record.pu) {
            return Err(err.into());
        }

        self.locked().tracked.insert(context_id.to_string(), record);
        info!(context_id, "pu policy updated");
        Ok(())
    }

    /// Renders and installs one complete chain version for a PU.
    fn install_version(
        &self,
        context_id: &str,
        record: &PuRecord,
        version: u32,
        create_sets: bool,
    ) -> Result<(), SupervisorError> {
        let (app_chain, net_chain) = chain_names(context_id, version);
        let policy = &record.pu.policy;

        if self.renderer.mode() == Mode::LocalContainer {
            self.engine
                .new_chain(self.renderer.app_packet_table, &app_chain)?;
        }
        self.engine
            .new_chain(self.renderer.app_ack_table, &app_chain)?;
        self.engine.new_chain(self.renderer.net_table, &net_chain)?;

        if create_sets {
            self.create_proxy_sets(context_id, record)?;
            if let (Some(uid), Some(mark)) = (&record.uid, record.mark) {
                let set_name = pu_port_set_name(context_id, mark);
                self.sets.create_set(&set_name, "bitmap:port range 0-65535")?;
                let Some(portset) = &self.portset else {
                    return Err(SupervisorError::Config {
                        reason: "port-set tracker required for uid pu".to_string(),
                    });
                };
                portset.add_user_port_set(uid, &set_name, mark);
            }
        }

        self.apply(&self.jump_rules(context_id, record, version))?;
        self.apply(&self.renderer.trap_rules(&app_chain, &net_chain))?;
        self.apply(&self.renderer.acl_rules(
            context_id,
            &app_chain,
            AclSide::App,
            &policy.application_acls,
        ))?;
        self.apply(&self.renderer.acl_rules(
            context_id,
            &net_chain,
            AclSide::Net,
            &policy.network_acls,
        ))?;

        let exclusion_ip = record.ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
        self.apply(&self.renderer.exclusion_rules(
            &app_chain,
            &net_chain,
            exclusion_ip,
            &policy.excluded_networks,
        ))?;

        Ok(())
    }

    /// The mode-dependent jump rules of a PU at one version.
    fn jump_rules(&self, context_id: &str, record: &PuRecord, version: u32) -> Vec<EngineRule> {
        let (app_chain, net_chain) = chain_names(context_id, version);
        let proxy_base = proxy_set_name(context_id, record.mark);
        let (dst_set, src_set) = proxy_set_pair(&proxy_base);

        if self.renderer.mode() == Mode::LocalServer {
            let mark = record.mark.unwrap_or(0);
            match &record.uid {
                Some(uid) if record.port_list == "0" => self.renderer.uid_chain_rules(
                    &pu_port_set_name(context_id, mark),
                    &app_chain,
                    &net_chain,
                    mark,
                    uid,
                ),
                _ => self.renderer.cgroup_chain_rules(
                    &app_chain,
                    &net_chain,
                    mark,
                    &record.port_list,
                    record.proxy_port,
                    &dst_set,
                    &src_set,
                ),
            }
        } else {
            self.renderer.container_chain_rules(
                &app_chain,
                &net_chain,
                record.ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
                record.proxy_port,
                &dst_set,
                &src_set,
            )
        }
    }

    fn create_proxy_sets(
        &self,
        context_id: &str,
        record: &PuRecord,
    ) -> Result<(), SupervisorError> {
        let base = proxy_set_name(context_id, record.mark);
        let (dst_set, src_set) = proxy_set_pair(&base);

        self.sets.create_set(&dst_set, "hash:ip,port")?;
        self.sets.create_set(&src_set, "hash:ip,port")?;
        self.fill_proxy_sets(record, &dst_set, &src_set)?;
        Ok(())
    }

    fn update_proxy_sets(
        &self,
        context_id: &str,
        record: &PuRecord,
    ) -> Result<(), SupervisorError> {
        let base = proxy_set_name(context_id, record.mark);
        let (dst_set, src_set) = proxy_set_pair(&base);

        self.sets.flush_set(&dst_set)?;
        self.sets.flush_set(&src_set)?;
        self.fill_proxy_sets(record, &dst_set, &src_set)?;
        Ok(())
    }

    fn fill_proxy_sets(
        &self,
        record: &PuRecord,
        dst_set: &str,
        src_set: &str,
    ) -> Result<(), SupervisorError> {
        let services = &record.pu.policy.proxied_services;
        for pair in &services.public_pairs {
            self.sets.add_entry(dst_set, &pair.to_string())?;
        }
        for pair in &services.private_pairs {
            self.sets.add_entry(src_set, &pair.to_string())?;
        }
        Ok(())
    }

    /// Best-effort removal of everything belonging to a PU.
    fn teardown(&self, context_id: &str, record: &PuRecord) {
        self.delete_rules(&self.jump_rules(context_id, record, record.version));

        let (app_chain, net_chain) = chain_names(context_id, record.version);
        self.remove_chain_pair(&app_chain, &net_chain);

        if let (Some(uid), Some(mark)) = (&record.uid, record.mark) {
            let set_name = pu_port_set_name(context_id, mark);
            if let Err(err) = self.sets.destroy_set(&set_name) {
                warn!(set = %set_name, %err, "failed to destroy port set");
            }
            if let Some(portset) = &self.portset {
                portset.del_user_port_set(uid, mark);
            }
        }

        let base = proxy_set_name(context_id, record.mark);
        let (dst_set, src_set) = proxy_set_pair(&base);
        for set in [&dst_set, &src_set] {
            if let Err(err) = self.sets.destroy_set(set) {
                warn!(%set, %err, "failed to destroy proxy set");
            }
        }
    }

    fn remove_chain_pair(&self, app_chain: &str, net_chain: &str) {
        let mut targets = vec![
            (self.renderer.app_ack_table, app_chain),
            (self.renderer.net_table, net_chain),
        ];
        if self.renderer.mode() == Mode::LocalContainer {
            targets.push((self.renderer.app_packet_table, app_chain));
        }

        for (table, chain) in targets {
            if let Err(err) = self.engine.clear_chain(table, chain) {
                warn!(table, chain, %err, "failed to clear chain");
            }
            if let Err(err) = self.engine.delete_chain(table, chain) {
                warn!(table, chain, %err, "failed to delete chain");
            }
        }
    }

    fn program_target_set(&self, networks: &[CidrV4]) -> Result<(), SupervisorError> {
        let members: Vec<String> = if networks.is_empty() {
            ALL_NETWORKS.iter().map(ToString::to_string).collect()
        } else {
            networks.iter().map(ToString::to_string).collect()
        };

        self.sets.create_set(TARGET_NETWORK_SET, "hash:net")?;

        let current = self.locked().target_networks.clone();
        let current: Vec<String> = if current.is_empty() {
            Vec::new()
        } else {
            current.iter().map(ToString::to_string).collect()
        };

        for member in &members {
            self.sets.add_entry(TARGET_NETWORK_SET, member)?;
        }
        for stale in current.iter().filter(|c| !members.contains(c)) {
            if let Err(err) = self.sets.del_entry(TARGET_NETWORK_SET, stale) {
                warn!(entry = %stale, %err, "failed to remove stale target network");
            }
        }

        debug!(?members, "target networks programmed");
        Ok(())
    }

    fn create_global_chains(&self) -> Result<(), SupervisorError> {
        if self.renderer.mode() == Mode::LocalServer {
            self.engine
                .new_chain(self.renderer.app_ack_table, UID_CHAIN)?;
        }
        self.engine
            .new_chain(self.renderer.proxy_table, NAT_PROXY_INPUT_CHAIN)?;
        self.engine
            .new_chain(self.renderer.proxy_table, NAT_PROXY_OUTPUT_CHAIN)?;
        self.engine
            .new_chain(self.renderer.app_ack_table, PROXY_INPUT_CHAIN)?;
        self.engine
            .new_chain(self.renderer.app_ack_table, PROXY_OUTPUT_CHAIN)?;
        Ok(())
    }

    /// Clears the sections this agent programs and removes every chain
    /// carrying the agent prefix. Each step is best-effort.
    fn clean_acls(&self) {
        let sections = [
            (self.renderer.app_ack_table, self.renderer.app_section),
            (self.renderer.app_ack_table, self.renderer.net_section),
            (self.renderer.app_ack_table, "PREROUTING"),
        ];
        for (table, section) in sections {
            if let Err(err) = self.engine.clear_chain(table, section) {
                warn!(table, section, %err, "failed to clear section");
            }
        }

        for table in [self.renderer.app_packet_table, self.renderer.app_ack_table] {
            match self.engine.list_chains(table) {
                Ok(chains) => {
                    for chain in chains.iter().filter(|c| c.contains(CHAIN_PREFIX)) {
                        if let Err(err) = self.engine.clear_chain(table, chain) {
                            warn!(table, chain, %err, "failed to clear chain");
                        }
                        if let Err(err) = self.engine.delete_chain(table, chain) {
                            warn!(table, chain, %err, "failed to delete chain");
                        }
                    }
                },
                Err(err) => warn!(table, %err, "failed to list chains"),
            }
        }

        self.remove_proxy_chains();

        if self.renderer.mode() == Mode::LocalServer {
            for op in [
                self.engine.clear_chain(self.renderer.app_ack_table, UID_CHAIN),
                self.engine.delete_chain(self.renderer.app_ack_table, UID_CHAIN),
            ] {
                if let Err(err) = op {
                    debug!(%err, "uid chain cleanup");
                }
            }
        }
    }

    fn remove_proxy_chains(&self) {
        for (section, chain) in [
            ("PREROUTING", NAT_PROXY_INPUT_CHAIN),
            ("OUTPUT", NAT_PROXY_OUTPUT_CHAIN),
        ] {
            if let Err(err) = self.engine.delete(
                self.renderer.proxy_table,
                section,
                &["-j".to_string(), chain.to_string()],
            ) {
                debug!(section, chain, %err, "proxy jump removal");
            }
        }

        for chain in [NAT_PROXY_INPUT_CHAIN, NAT_PROXY_OUTPUT_CHAIN] {
            if let Err(err) = self.engine.clear_chain(self.renderer.proxy_table, chain) {
                debug!(chain, %err, "proxy chain clear");
            }
            if let Err(err) = self.engine.delete_chain(self.renderer.proxy_table, chain) {
                debug!(chain, %err, "proxy chain delete");
            }
        }
        for chain in [PROXY_INPUT_CHAIN, PROXY_OUTPUT_CHAIN] {
            if let Err(err) = self.engine.clear_chain(self.renderer.app_ack_table, chain) {
                debug!(chain, %err, "proxy chain clear");
            }
            if let Err(err) = self.engine.delete_chain(self.renderer.app_ack_table, chain) {
                debug!(chain, %err, "proxy chain delete");
            }
        }
    }

    fn apply(&self, rules: &[EngineRule]) -> Result<(), SupervisorError> {
        for rule in rules {
            match rule.op {
                RuleOp::Append => self.engine.append(rule.table, &rule.chain, &rule.args)?,
                RuleOp::Insert(position) => {
                    self.engine
                        .insert(rule.table, &rule.chain, position, &rule.args)?;
                },
            }
        }
        Ok(())
    }

    fn delete_rules(&self, rules: &[EngineRule]) {
        for rule in rules {
            if let Err(err) = self.engine.delete(rule.table, &rule.chain, &rule.args) {
                warn!(table = rule.table, chain = %rule.chain, %err, "failed to delete rule");
            }
        }
    }
}
