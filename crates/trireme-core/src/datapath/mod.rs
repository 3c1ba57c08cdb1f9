//! The connection authentication datapath.
//!
//! Drives each intercepted flow through the SYN / SYN-ACK / ACK
//! authorization protocol. Outbound handshake segments are stamped with
//! the local PU's token; inbound segments are verified, evaluated
//! against the PU's rule set, and stripped before delivery to the local
//! stack. Per-packet failures are never propagated: the packet is
//! dropped, the decision logged, and a flow event emitted.

mod queue;
mod workers;

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use tracing::{debug, info, warn};

pub use queue::{
    InMemoryQueue, InMemoryQueueHandle, PacketQueue, QueueError, QueuedPacket, Verdict,
    VerdictAction,
};
pub use workers::WorkerPool;

use crate::claims::{ClaimSet, ID_KEY};
use crate::collector::{DropReason, EndpointKind, EventCollector, FlowEndpoint, FlowRecord};
use crate::conntrack::{
    ConnEntry, ConnKey, ConnState, ConnTable, Direction, EXTERNAL_TTL, HANDSHAKE_TTL,
};
use crate::enforcer::{Enforcer, EnforcerError, Mode};
use crate::evaluator::{evaluate, evaluate_ip_acls, FlowVerdict, DEFAULT_POLICY_ID};
use crate::fqueue::FilterQueueConfig;
use crate::net::any_contains;
use crate::packet::{AuthOptionFlags, FourTuple, TcpPacket};
use crate::policy::{Action, Protocol, PuInfo};
use crate::registry::{ContextRegistry, PuContext};
use crate::secrets::{Secrets, SecretsSpec, SharedSecrets};
use crate::supervisor::names;
use crate::token::{TokenCodec, DEFAULT_VALIDITY};

/// Identity reported for peers whose token did not verify.
const UNKNOWN_PEER: &str = "unknown";

/// Datapath parameters.
#[derive(Debug, Clone)]
pub struct DatapathConfig {
    /// Identity of this datapath instance, used in logs.
    pub server_id: String,
    /// Deployment mode.
    pub mode: Mode,
    /// Token validity window.
    pub validity: Duration,
    /// TTL of in-progress handshake entries.
    pub handshake_ttl: Duration,
    /// TTL of authorized and external-service entries.
    pub external_ttl: Duration,
    /// Require the transmitter side to authorize the receiver's claims.
    pub mutual_auth: bool,
    /// Log every packet decision at debug level.
    pub packet_logs: bool,
    /// Queue parameters shared with the supervisor.
    pub filter_queue: FilterQueueConfig,
}

impl DatapathConfig {
    /// Creates a config with default timeouts and mutual authorization.
    #[must_use]
    pub fn new(server_id: impl Into<String>, mode: Mode) -> Self {
        Self {
            server_id: server_id.into(),
            mode,
            validity: DEFAULT_VALIDITY,
            handshake_ttl: HANDSHAKE_TTL,
            external_ttl: EXTERNAL_TTL,
            mutual_auth: true,
            packet_logs: false,
            filter_queue: FilterQueueConfig::default(),
        }
    }
}

/// The per-host authentication datapath.
pub struct Datapath {
    config: DatapathConfig,
    registry: Arc<ContextRegistry>,
    conntrack: Arc<ConnTable>,
    secrets: SharedSecrets,
    codec: TokenCodec,
    collector: Arc<dyn EventCollector>,
}

impl Datapath {
    /// Creates a datapath with the given signing material.
    #[must_use]
    pub fn new(config: DatapathConfig, secrets: Secrets, collector: Arc<dyn EventCollector>) -> Self {
        let secrets = SharedSecrets::new(secrets);
        let codec = TokenCodec::new(secrets.clone(), config.validity);
        Self {
            config,
            registry: Arc::new(ContextRegistry::new()),
            conntrack: Arc::new(ConnTable::new()),
            secrets,
            codec,
            collector,
        }
    }

    /// The PU context registry of this datapath.
    #[must_use]
    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    /// The connection table of this datapath.
    #[must_use]
    pub fn conntrack(&self) -> &Arc<ConnTable> {
        &self.conntrack
    }

    /// Decides one intercepted packet.
    ///
    /// Never fails: undecodable packets are dropped and logged.
    pub fn process(&self, direction: Direction, payload: Vec<u8>) -> Verdict {
        let packet = match TcpPacket::parse(payload) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(%err, "dropping undecodable packet");
                return Verdict::drop_silent();
            },
        };

        let verdict = match direction {
            Direction::App => self.process_app(packet),
            Direction::Net => self.process_net(packet),
        };

        if self.config.packet_logs {
            debug!(server_id = %self.config.server_id, ?direction, ?verdict.action, "packet decided");
        }
        verdict
    }

    fn process_app(&self, packet: TcpPacket) -> Verdict {
        if packet.is_rst() {
            self.evict_on_reset(&packet);
            Verdict::accept()
        } else if packet.is_syn() {
            self.app_syn(packet)
        } else if packet.is_syn_ack() {
            self.app_synack(packet)
        } else if packet.is_ack() {
            self.app_ack(packet)
        } else {
            Verdict::accept()
        }
    }

    fn process_net(&self, packet: TcpPacket) -> Verdict {
        if packet.is_rst() {
            self.evict_on_reset(&packet);
            Verdict::accept()
        } else if packet.is_syn() {
            self.net_syn(packet)
        } else if packet.is_syn_ack() {
            self.net_synack(packet)
        } else if packet.is_ack() {
            self.net_ack(packet)
        } else {
            Verdict::accept()
        }
    }

    /// A reset ends the flow in both orientations of both directions.
    fn evict_on_reset(&self, packet: &TcpPacket) {
        let tuple = packet.four_tuple();
        for tuple in [tuple, tuple.reversed()] {
            for direction in [Direction::App, Direction::Net] {
                self.conntrack.remove(&ConnKey { tuple, direction });
            }
        }
    }

    /// Outbound SYN: stamp the local PU's token.
    fn app_syn(&self, mut packet: TcpPacket) -> Verdict {
        let tuple = packet.four_tuple();
        let Some(ctx) = self.registry.find_by_ip(tuple.src_ip) else {
            return Verdict::accept();
        };

        if any_contains(&ctx.excluded_networks, tuple.dst_ip) {
            return Verdict::accept();
        }
        if ctx.proxied_services.is_public(tuple.dst_ip, tuple.dst_port) {
            // NAT redirects this flow to the in-series proxy.
            return Verdict::accept();
        }
        if !any_contains(&ctx.target_networks, tuple.dst_ip) {
            return Verdict::accept();
        }

        let key = ConnKey {
            tuple,
            direction: Direction::App,
        };
        let now = Instant::now();
        let (entry, _) =
            self.conntrack
                .get_or_create(key, &ctx.context_id, now, self.config.handshake_ttl);

        let token = {
            let mut entry = lock(&entry);
            if entry.state == ConnState::Rejected {
                return Verdict::drop_silent();
            }
            if let Some(token) = entry.syn_token.clone() {
                // SYN retransmission: re-insert the same token.
                entry.retries += 1;
                token
            } else {
                match self.codec.issue(&self.token_claims(&ctx), SystemTime::now()) {
                    Ok(token) => {
                        entry.syn_token = Some(token.clone());
                        token
                    },
                    Err(err) => {
                        warn!(context_id = %ctx.context_id, %err, "cannot issue syn token");
                        return Verdict::drop_silent();
                    },
                }
            }
        };
        self.conntrack.refresh(&key, now, self.config.handshake_ttl);

        match packet.insert_token(
            &token,
            AuthOptionFlags {
                has_claims: true,
                synack: false,
            },
        ) {
            Ok(()) => Verdict::accept_rewritten(packet.into_bytes()),
            Err(err) => {
                warn!(context_id = %ctx.context_id, %err, "cannot stamp syn");
                self.conntrack.remove(&key);
                Verdict::drop_silent()
            },
        }
    }

    /// Outbound SYN/ACK: the local PU answers an authenticated SYN.
    fn app_synack(&self, mut packet: TcpPacket) -> Verdict {
        let key = ConnKey {
            tuple: packet.four_tuple().reversed(),
            direction: Direction::Net,
        };
        let Some(entry) = self.conntrack.get(&key) else {
            // Not an authenticated inbound flow; ACL rules govern it.
            return Verdict::accept();
        };

        let token = {
            let mut entry = lock(&entry);
            if entry.external {
                return Verdict::accept();
            }
            match entry.state {
                ConnState::Rejected => return Verdict::drop_silent(),
                ConnState::SynReceived | ConnState::Authorized => {},
                ConnState::SynSent | ConnState::AckProcessed => {
                    return Verdict::drop_silent();
                },
            }
            if let Some(token) = entry.synack_token.clone() {
                entry.retries += 1;
                token
            } else {
                let Some(ctx) = self.registry.get(&entry.context_id) else {
                    return Verdict::drop_silent();
                };
                match self.codec.issue(&self.token_claims(&ctx), SystemTime::now()) {
                    Ok(token) => {
                        entry.synack_token = Some(token.clone());
                        token
                    },
                    Err(err) => {
                        warn!(context_id = %entry.context_id, %err, "cannot issue synack token");
                        return Verdict::drop_silent();
                    },
                }
            }
        };
        self.conntrack
            .refresh(&key, Instant::now(), self.config.handshake_ttl);

        match packet.insert_token(
            &token,
            AuthOptionFlags {
                has_claims: true,
                synack: true,
            },
        ) {
            Ok(()) => Verdict::accept_rewritten(packet.into_bytes()),
            Err(err) => {
                warn!(%err, "cannot stamp synack");
                Verdict::drop_silent()
            },
        }
    }

    /// Outbound ACK: complete the handshake on the transmitter side.
    fn app_ack(&self, mut packet: TcpPacket) -> Verdict {
        let tuple = packet.four_tuple();
        let key = ConnKey {
            tuple,
            direction: Direction::App,
        };
        let Some(entry) = self.conntrack.get(&key) else {
            return Verdict::accept();
        };

        enum Next {
            Stamp(Vec<u8>),
            Accept,
            Drop,
        }

        let next = {
            let mut entry = lock(&entry);
            match entry.state {
                ConnState::AckProcessed => {
                    match self.codec.issue(&ClaimSet::new(), SystemTime::now()) {
                        Ok(token) => {
                            entry.state = ConnState::Authorized;
                            let record = self.app_flow_record(
                                tuple,
                                &entry,
                                Action::ACCEPT,
                                None,
                            );
                            self.collector.collect_flow(record);
                            Next::Stamp(token)
                        },
                        Err(err) => {
                            warn!(context_id = %entry.context_id, %err, "cannot issue ack token");
                            Next::Drop
                        },
                    }
                },
                ConnState::Authorized => Next::Accept,
                ConnState::Rejected => Next::Drop,
                ConnState::SynSent | ConnState::SynReceived => {
                    let record = self.app_flow_record(
                        tuple,
                        &entry,
                        Action::REJECT,
                        Some(DropReason::InvalidState),
                    );
                    self.collector.collect_flow(record);
                    entry.state = ConnState::Rejected;
                    Next::Drop
                },
            }
        };

        match next {
            Next::Stamp(token) => {
                self.conntrack
                    .refresh(&key, Instant::now(), self.config.external_ttl);
                match packet.insert_token(
                    &token,
                    AuthOptionFlags {
                        has_claims: false,
                        synack: false,
                    },
                ) {
                    Ok(()) => Verdict::accept_rewritten(packet.into_bytes()),
                    Err(err) => {
                        warn!(%err, "cannot stamp ack");
                        Verdict::drop_silent()
                    },
                }
            },
            Next::Accept => Verdict::accept(),
            Next::Drop => Verdict::drop_silent(),
        }
    }

    /// Inbound SYN: verify the peer token and evaluate receiver rules.
    fn net_syn(&self, mut packet: TcpPacket) -> Verdict {
        let tuple = packet.four_tuple();
        let Some(ctx) = self.registry.find_by_ip(tuple.dst_ip) else {
            return Verdict::accept();
        };
        if any_contains(&ctx.excluded_networks, tuple.src_ip) {
            return Verdict::accept();
        }

        let key = ConnKey {
            tuple,
            direction: Direction::Net,
        };

        // Retransmission fast path.
        if let Some(entry) = self.conntrack.get(&key) {
            let state = lock(&entry).state;
            match state {
                ConnState::SynReceived | ConnState::Authorized => {
                    self.conntrack
                        .refresh(&key, Instant::now(), self.config.handshake_ttl);
                    packet.strip_token();
                    return Verdict::accept_rewritten(packet.into_bytes());
                },
                ConnState::Rejected => return Verdict::drop_silent(),
                ConnState::SynSent | ConnState::AckProcessed => {},
            }
        }

        let Some((_, token)) = packet.extract_token() else {
            return self.net_external_syn(&ctx, tuple, key);
        };
        let token = token.to_vec();

        let verified = match self.codec.verify(&token, SystemTime::now()) {
            Ok(verified) => verified,
            Err(err) => {
                debug!(context_id = %ctx.context_id, %err, "syn token rejected");
                // Unauthorized: drop without installing state.
                self.collector.collect_flow(self.net_flow_record(
                    tuple,
                    &ctx,
                    UNKNOWN_PEER,
                    Action::REJECT,
                    Some(DropReason::InvalidToken),
                    DEFAULT_POLICY_ID.to_string(),
                    None,
                ));
                return Verdict::drop_silent();
            },
        };

        let verdict = evaluate(&verified.claims, &ctx.receiver_rules, ctx.default_action);
        let peer_id = peer_id(&verified.claims);
        let now = Instant::now();

        if verdict.action.rejected() {
            let (entry, _) =
                self.conntrack
                    .get_or_create(key, &ctx.context_id, now, self.config.handshake_ttl);
            lock(&entry).state = ConnState::Rejected;
            self.collector.collect_flow(self.net_flow_record(
                tuple,
                &ctx,
                &peer_id,
                verdict.action,
                Some(DropReason::Policy),
                verdict.policy_id,
                verdict.observed_policy_id,
            ));
            return Verdict::drop_silent();
        }

        let (entry, _) =
            self.conntrack
                .get_or_create(key, &ctx.context_id, now, self.config.handshake_ttl);
        {
            let mut entry = lock(&entry);
            entry.state = ConnState::SynReceived;
            entry.peer_claims = Some(verified.claims);
            entry.policy_id = Some(verdict.policy_id);
            entry.observed_policy_id = verdict.observed_policy_id;
        }

        packet.strip_token();
        Verdict::accept_rewritten(packet.into_bytes())
    }

    /// Inbound SYN without a token: an external service, governed by
    /// the PU's network ACLs. The decision is cached for the
    /// external-service TTL.
    fn net_external_syn(&self, ctx: &PuContext, tuple: FourTuple, key: ConnKey) -> Verdict {
        let verdict = evaluate_ip_acls(
            tuple.src_ip,
            tuple.dst_port,
            Protocol::Tcp,
            &ctx.network_acls,
            ctx.default_action,
        );

        let (entry, created) =
            self.conntrack
                .get_or_create(key, &ctx.context_id, Instant::now(), self.config.external_ttl);
        {
            let mut entry = lock(&entry);
            entry.external = true;
            entry.state = if verdict.action.accepted() {
                ConnState::Authorized
            } else {
                ConnState::Rejected
            };
            entry.policy_id = Some(verdict.policy_id.clone());
            entry.observed_policy_id = verdict.observed_policy_id.clone();
        }

        if created {
            let drop_reason = (!verdict.action.accepted()).then_some(DropReason::Policy);
            self.collector.collect_flow(FlowRecord {
                source: FlowEndpoint {
                    ip: tuple.src_ip,
                    port: None,
                    id: UNKNOWN_PEER.to_string(),
                    kind: EndpointKind::External,
                },
                destination: self.local_endpoint(ctx, tuple.dst_ip, Some(tuple.dst_port)),
                action: verdict.action,
                drop_reason,
                policy_id: verdict.policy_id,
                observed_policy_id: verdict.observed_policy_id,
                timestamp: Utc::now(),
            });
        }

        if verdict.action.accepted() {
            Verdict::accept()
        } else {
            Verdict::drop_silent()
        }
    }

    /// Inbound SYN/ACK: the peer answered our stamped SYN.
    fn net_synack(&self, mut packet: TcpPacket) -> Verdict {
        let tuple = packet.four_tuple();
        let key = ConnKey {
            tuple: tuple.reversed(),
            direction: Direction::App,
        };
        let Some(entry) = self.conntrack.get(&key) else {
            // Response to a flow we never stamped.
            return Verdict::accept();
        };

        let verdict = {
            let mut entry = lock(&entry);
            let Some(ctx) = self.registry.get(&entry.context_id) else {
                return Verdict::drop_silent();
            };

            match entry.state {
                ConnState::Rejected => return Verdict::drop_silent(),
                ConnState::AckProcessed | ConnState::Authorized => {
                    // SYN/ACK retransmission, accepted silently.
                    packet.strip_token();
                    return Verdict::accept_rewritten(packet.into_bytes());
                },
                ConnState::SynReceived => return Verdict::drop_silent(),
                ConnState::SynSent => {},
            }

            let Some((_, token)) = packet.extract_token() else {
                entry.state = ConnState::Rejected;
                let record = self.app_flow_record(
                    key.tuple,
                    &entry,
                    Action::REJECT,
                    Some(DropReason::MissingToken),
                );
                self.collector.collect_flow(record);
                return Verdict::drop_with_rst();
            };
            let token = token.to_vec();

            let verified = match self.codec.verify(&token, SystemTime::now()) {
                Ok(verified) => verified,
                Err(err) => {
                    debug!(context_id = %entry.context_id, %err, "synack token rejected");
                    entry.state = ConnState::Rejected;
                    let record = self.app_flow_record(
                        key.tuple,
                        &entry,
                        Action::REJECT,
                        Some(DropReason::InvalidToken),
                    );
                    self.collector.collect_flow(record);
                    return Verdict::drop_with_rst();
                },
            };

            let verdict = if self.config.mutual_auth {
                evaluate(&verified.claims, &ctx.transmitter_rules, ctx.default_action)
            } else {
                FlowVerdict {
                    action: Action::ACCEPT,
                    policy_id: DEFAULT_POLICY_ID.to_string(),
                    observed_policy_id: None,
                }
            };

            entry.peer_claims = Some(verified.claims);
            entry.policy_id = Some(verdict.policy_id.clone());
            entry.observed_policy_id = verdict.observed_policy_id.clone();

            if verdict.action.rejected() {
                entry.state = ConnState::Rejected;
                let record = self.app_flow_record(
                    key.tuple,
                    &entry,
                    verdict.action,
                    Some(DropReason::Policy),
                );
                self.collector.collect_flow(record);
                return Verdict::drop_with_rst();
            }

            entry.state = ConnState::AckProcessed;
            verdict
        };
        debug_assert!(verdict.action.accepted());
        self.conntrack
            .refresh(&key, Instant::now(), self.config.handshake_ttl);

        packet.strip_token();
        Verdict::accept_rewritten(packet.into_bytes())
    }

    /// Inbound ACK: complete the handshake on the receiver side.
    fn net_ack(&self, mut packet: TcpPacket) -> Verdict {
        let tuple = packet.four_tuple();
        let key = ConnKey {
            tuple,
            direction: Direction::Net,
        };

        let Some(entry) = self.conntrack.get(&key) else {
            let Some(ctx) = self.registry.find_by_ip(tuple.dst_ip) else {
                return Verdict::accept();
            };
            if any_contains(&ctx.excluded_networks, tuple.src_ip) {
                return Verdict::accept();
            }
            // ACK with no prior handshake state: unauthorized, and no
            // state is created for it.
            self.collector.collect_flow(self.net_flow_record(
                tuple,
                &ctx,
                UNKNOWN_PEER,
                Action::REJECT,
                Some(DropReason::InvalidState),
                DEFAULT_POLICY_ID.to_string(),
                None,
            ));
            return Verdict::drop_silent();
        };

        let authorized = {
            let mut entry = lock(&entry);
            if entry.external {
                return Verdict::accept();
            }
            match entry.state {
                ConnState::Rejected => return Verdict::drop_silent(),
                ConnState::Authorized => {
                    packet.strip_token();
                    return Verdict::accept_rewritten(packet.into_bytes());
                },
                ConnState::SynSent | ConnState::AckProcessed => return Verdict::drop_silent(),
                ConnState::SynReceived => {},
            }

            let Some(ctx) = self.registry.get(&entry.context_id) else {
                return Verdict::drop_silent();
            };

            let Some((_, token)) = packet.extract_token() else {
                entry.state = ConnState::Rejected;
                self.collector.collect_flow(self.net_flow_record(
                    tuple,
                    &ctx,
                    &entry_peer_id(&entry),
                    Action::REJECT,
                    Some(DropReason::MissingToken),
                    entry.policy_id.clone().unwrap_or_else(|| DEFAULT_POLICY_ID.to_string()),
                    entry.observed_policy_id.clone(),
                ));
                return Verdict::drop_silent();
            };
            let token = token.to_vec();

            if let Err(err) = self.codec.verify(&token, SystemTime::now()) {
                debug!(context_id = %entry.context_id, %err, "ack token rejected");
                entry.state = ConnState::Rejected;
                self.collector.collect_flow(self.net_flow_record(
                    tuple,
                    &ctx,
                    &entry_peer_id(&entry),
                    Action::REJECT,
                    Some(DropReason::InvalidToken),
                    entry.policy_id.clone().unwrap_or_else(|| DEFAULT_POLICY_ID.to_string()),
                    entry.observed_policy_id.clone(),
                ));
                return Verdict::drop_silent();
            }

            entry.state = ConnState::Authorized;
            self.collector.collect_flow(self.net_flow_record(
                tuple,
                &ctx,
                &entry_peer_id(&entry),
                Action::ACCEPT,
                None,
                entry.policy_id.clone().unwrap_or_else(|| DEFAULT_POLICY_ID.to_string()),
                entry.observed_policy_id.clone(),
            ));
            true
        };
        debug_assert!(authorized);
        self.conntrack
            .refresh(&key, Instant::now(), self.config.external_ttl);

        packet.strip_token();
        Verdict::accept_rewritten(packet.into_bytes())
    }

    /// Claims issued with outbound tokens.
    ///
    /// The identity set goes on the wire verbatim: every extra claim
    /// eats into the TCP option budget, so the transmitter-context
    /// label (`$id`) is carried only when the policy asserts it.
    fn token_claims(&self, ctx: &PuContext) -> ClaimSet {
        ctx.identity.clone()
    }

    fn local_endpoint(&self, ctx: &PuContext, ip: Ipv4Addr, port: Option<u16>) -> FlowEndpoint {
        let id = if ctx.management_id.is_empty() {
            ctx.context_id.clone()
        } else {
            ctx.management_id.clone()
        };
        FlowEndpoint {
            ip,
            port,
            id,
            kind: EndpointKind::Pu,
        }
    }

    /// Flow record for a transmitter-side decision: the local PU is the
    /// source.
    fn app_flow_record(
        &self,
        tuple: FourTuple,
        entry: &MutexGuard<'_, ConnEntry>,
        action: Action,
        drop_reason: Option<DropReason>,
    ) -> FlowRecord {
        let local_id = self
            .registry
            .get(&entry.context_id)
            .map_or_else(|| entry.context_id.clone(), |ctx| {
                if ctx.management_id.is_empty() {
                    ctx.context_id.clone()
                } else {
                    ctx.management_id.clone()
                }
            });

        FlowRecord {
            source: FlowEndpoint {
                ip: tuple.src_ip,
                port: None,
                id: local_id,
                kind: EndpointKind::Pu,
            },
            destination: FlowEndpoint {
                ip: tuple.dst_ip,
                port: Some(tuple.dst_port),
                id: entry_peer_id(entry),
                kind: EndpointKind::Pu,
            },
            action,
            drop_reason,
            policy_id: entry
                .policy_id
                .clone()
                .unwrap_or_else(|| DEFAULT_POLICY_ID.to_string()),
            observed_policy_id: entry.observed_policy_id.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Flow record for a receiver-side decision: the remote peer is the
    /// source.
    #[allow(clippy::too_many_arguments)]
    fn net_flow_record(
        &self,
        tuple: FourTuple,
        ctx: &PuContext,
        peer: &str,
        action: Action,
        drop_reason: Option<DropReason>,
        policy_id: String,
        observed_policy_id: Option<String>,
    ) -> FlowRecord {
        FlowRecord {
            source: FlowEndpoint {
                ip: tuple.src_ip,
                port: None,
                id: peer.to_string(),
                kind: EndpointKind::Pu,
            },
            destination: self.local_endpoint(ctx, tuple.dst_ip, Some(tuple.dst_port)),
            action,
            drop_reason,
            policy_id,
            observed_policy_id,
            timestamp: Utc::now(),
        }
    }
}

fn peer_id(claims: &ClaimSet) -> String {
    claims.get(ID_KEY).unwrap_or(UNKNOWN_PEER).to_string()
}

fn entry_peer_id(entry: &MutexGuard<'_, ConnEntry>) -> String {
    entry
        .peer_claims
        .as_ref()
        .map_or_else(|| UNKNOWN_PEER.to_string(), peer_id)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Enforcer for Datapath {
    fn enforce(&self, context_id: &str, pu: &PuInfo) -> Result<(), EnforcerError> {
        if context_id.is_empty() {
            return Err(EnforcerError::Config {
                reason: "empty context id".to_string(),
            });
        }
        match self.config.mode {
            Mode::LocalServer => {
                if pu.runtime.options.cgroup_mark.is_none() {
                    return Err(EnforcerError::Config {
                        reason: format!("no cgroup mark for {context_id}"),
                    });
                }
            },
            Mode::LocalContainer | Mode::RemoteContainer => {
                if pu.policy.default_ip().is_none() {
                    return Err(EnforcerError::Config {
                        reason: format!("no default IP address for {context_id}"),
                    });
                }
            },
        }

        // For UID-scoped PUs the port-set name is derivable here, so
        // supervisor and datapath need not exchange it.
        let port_set_name = pu.runtime.options.user_id.as_ref().map(|_| {
            names::pu_port_set_name(context_id, pu.runtime.options.cgroup_mark.unwrap_or(0))
        });

        let context = self
            .registry
            .publish(PuContext::from_pu(pu, port_set_name));
        info!(context_id, version = context.version, "pu enforced");
        Ok(())
    }

    fn unenforce(&self, context_id: &str) -> Result<(), EnforcerError> {
        if self.registry.remove(context_id).is_none() {
            warn!(context_id, "unenforce for unknown context");
        } else {
            info!(context_id, "pu unenforced");
        }
        Ok(())
    }

    fn update_secrets(&self, spec: &SecretsSpec) -> Result<(), EnforcerError> {
        let secrets = spec.build().map_err(|err| EnforcerError::Secrets {
            reason: err.to_string(),
        })?;
        self.secrets.swap(secrets);
        info!("signing material updated");
        Ok(())
    }

    fn filter_queue(&self) -> FilterQueueConfig {
        self.config.filter_queue.clone()
    }

    fn start(&self) -> Result<(), EnforcerError> {
        info!(server_id = %self.config.server_id, mode = %self.config.mode, "datapath started");
        Ok(())
    }

    fn stop(&self) -> Result<(), EnforcerError> {
        info!(server_id = %self.config.server_id, "datapath stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::RecordingCollector;
    use crate::packet::flags;
    use crate::policy::{
        FlowPolicy, ObserveAction, PuPolicy, PuRuntime, PuType, TagPredicate, TagRule,
        DEFAULT_NAMESPACE,
    };

    fn tuple() -> FourTuple {
        FourTuple {
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            src_port: 40000,
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            dst_port: 80,
        }
    }

    fn accept_rule(key: &str, value: &str, id: &str) -> TagRule {
        TagRule::new(
            vec![TagPredicate::equals(key, value)],
            FlowPolicy::new(Action::ACCEPT, id),
        )
    }

    fn pu_info(
        ctx: &str,
        ip: Ipv4Addr,
        role: &str,
        receiver: Vec<TagRule>,
        transmitter: Vec<TagRule>,
    ) -> PuInfo {
        let mut identity = ClaimSet::new();
        identity.insert("role", role);

        let mut policy = PuPolicy::new(format!("{ctx}-mgmt"), identity);
        policy.ips.insert(DEFAULT_NAMESPACE.to_string(), ip);
        policy.target_networks = vec!["10.0.0.0/8".parse().unwrap()];
        policy.receiver_rules = receiver;
        policy.transmitter_rules = transmitter;

        let mut runtime = PuRuntime::new(PuType::Container, ctx, 1000);
        runtime.ips.insert(DEFAULT_NAMESPACE.to_string(), ip);

        PuInfo::new(ctx, policy, runtime)
    }

    fn datapath() -> (Datapath, Arc<RecordingCollector>) {
        let collector = Arc::new(RecordingCollector::new());
        let datapath = Datapath::new(
            DatapathConfig::new("test-dp", Mode::LocalContainer),
            Secrets::psk(b"handshake-key".to_vec()),
            Arc::clone(&collector) as Arc<dyn EventCollector>,
        );
        (datapath, collector)
    }

    /// Client PU on .1 calling server PU on .2.
    fn two_pus(receiver: Vec<TagRule>, transmitter: Vec<TagRule>) -> (Datapath, Arc<RecordingCollector>) {
        let (dp, collector) = datapath();
        dp.enforce(
            "client",
            &pu_info("client", tuple().src_ip, "web", Vec::new(), transmitter),
        )
        .unwrap();
        dp.enforce(
            "server",
            &pu_info("server", tuple().dst_ip, "db", receiver, Vec::new()),
        )
        .unwrap();
        (dp, collector)
    }

    fn rewritten(verdict: Verdict) -> Vec<u8> {
        assert!(verdict.accepted(), "expected accept, got {verdict:?}");
        verdict.payload.expect("expected a rewritten payload")
    }

    /// Drives the full three-way handshake through both sides.
    fn run_handshake(dp: &Datapath) {
        let syn = TcpPacket::build(tuple(), flags::SYN, 1, 0).into_bytes();
        let syn_wire = rewritten(dp.process(Direction::App, syn));
        rewritten(dp.process(Direction::Net, syn_wire));

        let synack =
            TcpPacket::build(tuple().reversed(), flags::SYN | flags::ACK, 100, 2).into_bytes();
        let synack_wire = rewritten(dp.process(Direction::App, synack));
        rewritten(dp.process(Direction::Net, synack_wire));

        let ack = TcpPacket::build(tuple(), flags::ACK, 2, 101).into_bytes();
        let ack_wire = rewritten(dp.process(Direction::App, ack));
        rewritten(dp.process(Direction::Net, ack_wire));
    }

    #[test]
    fn test_mutual_accept_emits_two_accept_events() {
        let (dp, collector) = two_pus(
            vec![accept_rule("role", "web", "p1")],
            vec![accept_rule("role", "db", "p2")],
        );

        run_handshake(&dp);

        let records = collector.records();
        assert_eq!(records.len(), 2);
        // Transmitter side completes first, receiver side on the final
        // ACK.
        assert!(records[0].action.accepted());
        assert_eq!(records[0].policy_id, "p2");
        assert!(records[1].action.accepted());
        assert_eq!(records[1].policy_id, "p1");
        assert_eq!(records[1].source.ip, tuple().src_ip);
        assert_eq!(records[1].destination.id, "server-mgmt");
        assert_eq!(records[1].destination.port, Some(80));
    }

    #[test]
    fn test_claim_mismatch_drops_syn_with_policy_reason() {
        let (dp, collector) = two_pus(
            vec![accept_rule("role", "admin", "p1")],
            vec![accept_rule("role", "db", "p2")],
        );

        let syn = TcpPacket::build(tuple(), flags::SYN, 1, 0).into_bytes();
        let syn_wire = rewritten(dp.process(Direction::App, syn));
        let verdict = dp.process(Direction::Net, syn_wire);

        assert!(!verdict.accepted());
        let records = collector.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].action.rejected());
        assert_eq!(records[0].drop_reason, Some(DropReason::Policy));
        assert_eq!(records[0].policy_id, DEFAULT_POLICY_ID);
    }

    #[test]
    fn test_observation_reports_shadow_policy() {
        let shadow = TagRule::new(
            vec![TagPredicate::equals("role", "web")],
            FlowPolicy::observing(Action::ACCEPT, ObserveAction::ObserveContinue, "p1-shadow"),
        );
        let (dp, collector) = two_pus(
            vec![shadow, accept_rule("role", "web", "p1")],
            vec![accept_rule("role", "db", "p2")],
        );

        run_handshake(&dp);

        let server_record = collector
            .records()
            .into_iter()
            .find(|r| r.policy_id == "p1")
            .unwrap();
        assert_eq!(server_record.observed_policy_id.as_deref(), Some("p1-shadow"));
    }

    #[test]
    fn test_forged_token_dropped_without_state() {
        let (dp, collector) = two_pus(vec![accept_rule("role", "web", "p1")], Vec::new());

        let forger = TokenCodec::new(
            SharedSecrets::new(Secrets::psk(b"wrong-key".to_vec())),
            DEFAULT_VALIDITY,
        );
        let claims: ClaimSet = [("role", "web")].into_iter().collect();
        let token = forger.issue(&claims, SystemTime::now()).unwrap();

        let mut syn = TcpPacket::build(tuple(), flags::SYN, 1, 0);
        syn.insert_token(
            &token,
            AuthOptionFlags {
                has_claims: true,
                synack: false,
            },
        )
        .unwrap();

        let before = dp.conntrack().len();
        let verdict = dp.process(Direction::Net, syn.into_bytes());

        assert!(!verdict.accepted());
        assert_eq!(dp.conntrack().len(), before, "no state installed");
        let records = collector.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].drop_reason, Some(DropReason::InvalidToken));
    }

    #[test]
    fn test_tokenless_synack_rejected_with_rst() {
        let (dp, collector) = two_pus(Vec::new(), vec![accept_rule("role", "db", "p2")]);

        let syn = TcpPacket::build(tuple(), flags::SYN, 1, 0).into_bytes();
        rewritten(dp.process(Direction::App, syn));

        let synack =
            TcpPacket::build(tuple().reversed(), flags::SYN | flags::ACK, 100, 2).into_bytes();
        let verdict = dp.process(Direction::Net, synack);

        assert_eq!(verdict.action, VerdictAction::Drop { rst: true });
        let records = collector.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].drop_reason, Some(DropReason::MissingToken));
    }

    #[test]
    fn test_orphan_ack_dropped_without_creating_state() {
        let (dp, collector) = two_pus(Vec::new(), Vec::new());

        let before = dp.conntrack().len();
        let ack = TcpPacket::build(tuple(), flags::ACK, 5, 5).into_bytes();
        let verdict = dp.process(Direction::Net, ack);

        assert!(!verdict.accepted());
        assert_eq!(dp.conntrack().len(), before);
        assert_eq!(
            collector.records()[0].drop_reason,
            Some(DropReason::InvalidState)
        );
    }

    #[test]
    fn test_excluded_network_bypasses_authentication() {
        let (dp, collector) = datapath();
        let mut pu = pu_info("client", tuple().src_ip, "web", Vec::new(), Vec::new());
        pu.policy.excluded_networks = vec!["10.0.0.0/24".parse().unwrap()];
        dp.enforce("client", &pu).unwrap();

        let syn = TcpPacket::build(tuple(), flags::SYN, 1, 0).into_bytes();
        let verdict = dp.process(Direction::App, syn);

        assert!(verdict.accepted());
        assert!(verdict.payload.is_none(), "packet must not be stamped");
        assert!(dp.conntrack().is_empty());
        assert!(collector.records().is_empty());
    }

    #[test]
    fn test_syn_retransmission_reuses_token() {
        let (dp, _) = two_pus(Vec::new(), Vec::new());

        let syn = TcpPacket::build(tuple(), flags::SYN, 1, 0);
        let first = rewritten(dp.process(Direction::App, syn.clone().into_bytes()));
        let second = rewritten(dp.process(Direction::App, syn.into_bytes()));

        assert_eq!(first, second, "retransmitted SYN carries the same token");
    }

    #[test]
    fn test_authorized_flow_accepts_syn_retransmit_silently() {
        let (dp, collector) = two_pus(
            vec![accept_rule("role", "web", "p1")],
            vec![accept_rule("role", "db", "p2")],
        );
        run_handshake(&dp);
        let events_after_handshake = collector.records().len();

        let syn = TcpPacket::build(tuple(), flags::SYN, 1, 0).into_bytes();
        let verdict = dp.process(Direction::App, syn);

        assert!(verdict.accepted());
        assert_eq!(collector.records().len(), events_after_handshake);
    }

    #[test]
    fn test_retransmitted_synack_accepted_silently_in_ack_processed() {
        let (dp, collector) = two_pus(
            vec![accept_rule("role", "web", "p1")],
            vec![accept_rule("role", "db", "p2")],
        );

        let syn = TcpPacket::build(tuple(), flags::SYN, 1, 0).into_bytes();
        let syn_wire = rewritten(dp.process(Direction::App, syn));
        rewritten(dp.process(Direction::Net, syn_wire));

        let synack =
            TcpPacket::build(tuple().reversed(), flags::SYN | flags::ACK, 100, 2).into_bytes();
        let synack_wire = rewritten(dp.process(Direction::App, synack));
        rewritten(dp.process(Direction::Net, synack_wire.clone()));

        // The client is now in AckProcessed; the duplicate is accepted
        // without another evaluation.
        let events = collector.records().len();
        let verdict = dp.process(Direction::Net, synack_wire);
        assert!(verdict.accepted());
        assert_eq!(collector.records().len(), events);
    }

    #[test]
    fn test_external_syn_decided_by_network_acls_and_cached() {
        let (dp, collector) = datapath();
        let mut pu = pu_info("server", tuple().dst_ip, "db", Vec::new(), Vec::new());
        pu.policy.network_acls = vec![crate::policy::IpRule {
            address: "10.0.0.0/24".parse().unwrap(),
            ports: crate::policy::PortSpec::single(80),
            protocol: Protocol::Tcp,
            policy: FlowPolicy::new(Action::ACCEPT, "ext-allow"),
        }];
        dp.enforce("server", &pu).unwrap();

        let syn = TcpPacket::build(tuple(), flags::SYN, 1, 0).into_bytes();
        let verdict = dp.process(Direction::Net, syn.clone());
        assert!(verdict.accepted());

        let records = collector.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source.kind, EndpointKind::External);
        assert_eq!(records[0].policy_id, "ext-allow");

        // Cached: a retransmitted external SYN emits no second event.
        assert!(dp.process(Direction::Net, syn).accepted());
        assert_eq!(collector.records().len(), 1);
    }

    #[test]
    fn test_oversized_identity_cannot_be_stamped() {
        let (dp, _) = datapath();
        let mut pu = pu_info("client", tuple().src_ip, "web", Vec::new(), Vec::new());
        pu.policy
            .identity
            .insert("team", "a-rather-long-claim-value-that-overflows-the-option");
        dp.enforce("client", &pu).unwrap();

        let syn = TcpPacket::build(tuple(), flags::SYN, 1, 0).into_bytes();
        let verdict = dp.process(Direction::App, syn);

        assert!(!verdict.accepted());
    }

    #[test]
    fn test_secret_rotation_invalidates_old_tokens() {
        let (dp, collector) = two_pus(vec![accept_rule("role", "web", "p1")], Vec::new());

        let syn = TcpPacket::build(tuple(), flags::SYN, 1, 0).into_bytes();
        let stamped = rewritten(dp.process(Direction::App, syn));

        dp.update_secrets(&SecretsSpec::Psk {
            key_base64: {
                use base64::Engine as _;
                base64::engine::general_purpose::STANDARD.encode(b"rotated-key")
            },
        })
        .unwrap();

        let verdict = dp.process(Direction::Net, stamped);

        assert!(!verdict.accepted());
        assert_eq!(
            collector.records()[0].drop_reason,
            Some(DropReason::InvalidToken)
        );
    }

    #[test]
    fn test_reset_evicts_connection_state() {
        let (dp, _) = two_pus(
            vec![accept_rule("role", "web", "p1")],
            vec![accept_rule("role", "db", "p2")],
        );
        run_handshake(&dp);
        assert!(!dp.conntrack().is_empty());

        let rst = TcpPacket::build(tuple(), flags::RST, 3, 0).into_bytes();
        assert!(dp.process(Direction::App, rst).accepted());

        assert!(dp.conntrack().is_empty());
    }

    #[test]
    fn test_enforce_validates_inputs() {
        let (dp, _) = datapath();
        let mut pu = pu_info("bad", tuple().src_ip, "web", Vec::new(), Vec::new());
        pu.policy.ips.clear();

        assert!(matches!(
            dp.enforce("bad", &pu),
            Err(EnforcerError::Config { .. })
        ));
        assert!(dp.registry().is_empty(), "nothing installed on error");
    }

    #[test]
    fn test_unenforce_stops_interception() {
        let (dp, _) = two_pus(Vec::new(), Vec::new());

        dp.unenforce("client").unwrap();

        let syn = TcpPacket::build(tuple(), flags::SYN, 1, 0).into_bytes();
        let verdict = dp.process(Direction::App, syn);
        assert!(verdict.accepted());
        assert!(verdict.payload.is_none());
    }
}
