//! Rendering of PU policy into packet-filter rules.
//!
//! Table and section assignments depend on the enforcer mode. The
//! three-pass observation semantics of the ACLs are rendered at rule
//! level: observe-continue rules set a packet mark and defer,
//! observe-apply rules land after the authoritative ones, and logging
//! rules feed a per-direction NFLOG group.

use std::net::Ipv4Addr;

use crate::enforcer::Mode;
use crate::fqueue::{FilterQueueConfig, DEFAULT_CONN_MARK};
use crate::net::CidrV4;
use crate::packet::AUTH_OPTION_KIND;
use crate::policy::{default_log_prefix, Action, IpRule};

use super::names::{
    NAT_PROXY_INPUT_CHAIN, NAT_PROXY_OUTPUT_CHAIN, PROXY_INPUT_CHAIN, PROXY_MARK,
    PROXY_OUTPUT_CHAIN, TARGET_NETWORK_SET, UID_CHAIN,
};

/// Mark set by observe-continue ACL rules.
const OBSERVE_MARK: &str = "39";

/// NFLOG group of application-side ACL decisions.
const APP_NFLOG_GROUP: &str = "10";

/// NFLOG group of network-side ACL decisions.
const NET_NFLOG_GROUP: &str = "11";

/// How a rendered rule is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RuleOp {
    /// Append at the end of the chain.
    Append,
    /// Insert at a 1-based position.
    Insert(u32),
}

/// One rule destined for the packet-filter engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EngineRule {
    pub op: RuleOp,
    pub table: &'static str,
    pub chain: String,
    pub args: Vec<String>,
}

impl EngineRule {
    fn append(table: &'static str, chain: &str, args: Vec<String>) -> Self {
        Self {
            op: RuleOp::Append,
            table,
            chain: chain.to_string(),
            args,
        }
    }

    fn insert(table: &'static str, chain: &str, args: Vec<String>) -> Self {
        Self {
            op: RuleOp::Insert(1),
            table,
            chain: chain.to_string(),
            args,
        }
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

/// Which side an ACL set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AclSide {
    App,
    Net,
}

/// Mode-dependent table and section layout plus rule rendering.
pub(crate) struct Renderer {
    mode: Mode,
    fq: FilterQueueConfig,
    /// Pre-connection SYN capture table, local-container mode only.
    pub app_packet_table: &'static str,
    pub app_ack_table: &'static str,
    pub net_table: &'static str,
    pub proxy_table: &'static str,
    pub app_section: &'static str,
    pub app_cgroup_section: &'static str,
    pub net_section: &'static str,
}

impl Renderer {
    pub fn new(mode: Mode, fq: FilterQueueConfig) -> Self {
        let (app_section, app_cgroup_section, net_section) = match mode {
            Mode::LocalServer | Mode::RemoteContainer => ("OUTPUT", "OUTPUT", "INPUT"),
            Mode::LocalContainer => ("PREROUTING", "OUTPUT", "POSTROUTING"),
        };

        Self {
            mode,
            fq,
            app_packet_table: "raw",
            app_ack_table: "mangle",
            net_table: "mangle",
            proxy_table: "nat",
            app_section,
            app_cgroup_section,
            net_section,
        }
    }

    fn proxy_redirect_rules(
        &self,
        proxy_port: u16,
        dst_set: &str,
        src_set: &str,
    ) -> Vec<EngineRule> {
        let port = proxy_port.to_string();
        vec![
            EngineRule::append(
                self.proxy_table,
                NAT_PROXY_INPUT_CHAIN,
                args(&[
                    "-p", "tcp", "-m", "mark", "!", "--mark", PROXY_MARK, "-m", "set",
                    "--match-set", src_set, "src,dst", "-j", "REDIRECT", "--to-port", &port,
                ]),
            ),
            EngineRule::append(
                self.proxy_table,
                NAT_PROXY_OUTPUT_CHAIN,
                args(&[
                    "-p", "tcp", "-m", "set", "--match-set", dst_set, "dst,dst", "-m", "mark",
                    "!", "--mark", PROXY_MARK, "-j", "REDIRECT", "--to-port", &port,
                ]),
            ),
            EngineRule::append(
                self.net_table,
                PROXY_INPUT_CHAIN,
                args(&[
                    "-p", "tcp", "-m", "set", "--match-set", dst_set, "src,src", "-m", "mark",
                    "!", "--mark", PROXY_MARK, "-j", "ACCEPT",
                ]),
            ),
            EngineRule::append(
                self.net_table,
                PROXY_INPUT_CHAIN,
                args(&[
                    "-p", "tcp", "-m", "set", "--match-set", src_set, "src,dst", "-m", "mark",
                    "!", "--mark", PROXY_MARK, "-j", "ACCEPT",
                ]),
            ),
            EngineRule::append(
                self.app_ack_table,
                PROXY_OUTPUT_CHAIN,
                args(&[
                    "-p", "tcp", "-m", "set", "--match-set", dst_set, "dst,dst", "-m", "mark",
                    "!", "--mark", PROXY_MARK, "-j", "ACCEPT",
                ]),
            ),
        ]
    }

    /// Jump rules steering a container PU's traffic to its chains.
    pub fn container_chain_rules(
        &self,
        app_chain: &str,
        net_chain: &str,
        ip: Ipv4Addr,
        proxy_port: u16,
        dst_set: &str,
        src_set: &str,
    ) -> Vec<EngineRule> {
        let ip = ip.to_string();
        let mut rules = Vec::new();

        if self.mode == Mode::LocalContainer {
            rules.push(EngineRule::append(
                self.app_packet_table,
                self.app_section,
                args(&[
                    "-s", &ip, "-m", "comment", "--comment", "Container-specific-chain", "-j",
                    app_chain,
                ]),
            ));
        }

        rules.push(EngineRule::append(
            self.app_ack_table,
            self.app_section,
            args(&[
                "-s", &ip, "-m", "comment", "--comment", "Container-specific-chain", "-j",
                app_chain,
            ]),
        ));
        rules.push(EngineRule::append(
            self.net_table,
            self.net_section,
            args(&[
                "!", "-i", "lo", "-d", &ip, "-m", "comment", "--comment",
                "Container-specific-chain", "-j", net_chain,
            ]),
        ));

        rules.extend(self.proxy_redirect_rules(proxy_port, dst_set, src_set));
        let port = proxy_port.to_string();
        rules.push(EngineRule::append(
            self.net_table,
            PROXY_INPUT_CHAIN,
            args(&["-p", "tcp", "--dport", &port, "-j", "ACCEPT"]),
        ));
        rules
    }

    /// Jump rules for a cgroup-scoped PU, keyed by its net_cls mark.
    pub fn cgroup_chain_rules(
        &self,
        app_chain: &str,
        net_chain: &str,
        mark: u32,
        port_list: &str,
        proxy_port: u16,
        dst_set: &str,
        src_set: &str,
    ) -> Vec<EngineRule> {
        let mark = mark.to_string();
        let mut rules = vec![
            EngineRule::append(
                self.app_ack_table,
                self.app_cgroup_section,
                args(&[
                    "-m", "cgroup", "--cgroup", &mark, "-m", "comment", "--comment",
                    "Server-specific-chain", "-j", "MARK", "--set-mark", &mark,
                ]),
            ),
            EngineRule::append(
                self.app_ack_table,
                self.app_cgroup_section,
                args(&[
                    "-m", "cgroup", "--cgroup", &mark, "-m", "comment", "--comment",
                    "Server-specific-chain", "-j", app_chain,
                ]),
            ),
        ];

        rules.extend(self.proxy_redirect_rules(proxy_port, dst_set, src_set));
        rules.push(EngineRule::append(
            self.net_table,
            self.net_section,
            args(&[
                "-p", "tcp", "-m", "multiport", "--destination-ports", port_list, "-m",
                "comment", "--comment", "Container-specific-chain", "-j", net_chain,
            ]),
        ));
        rules
    }

    /// Jump rules for a UID-scoped PU, keyed by owner and its dynamic
    /// port set.
    pub fn uid_chain_rules(
        &self,
        port_set_name: &str,
        app_chain: &str,
        net_chain: &str,
        mark: u32,
        uid: &str,
    ) -> Vec<EngineRule> {
        let mark = mark.to_string();
        vec![
            EngineRule::append(
                self.app_ack_table,
                UID_CHAIN,
                args(&["-m", "owner", "--uid-owner", uid, "-j", "MARK", "--set-mark", &mark]),
            ),
            EngineRule::append(
                self.app_ack_table,
                UID_CHAIN,
                args(&[
                    "-m", "mark", "--mark", &mark, "-m", "comment", "--comment",
                    "Server-specific-chain", "-j", app_chain,
                ]),
            ),
            EngineRule::append(
                self.app_ack_table,
                "PREROUTING",
                args(&[
                    "-m", "set", "--match-set", port_set_name, "dst", "-j", "MARK",
                    "--set-mark", &mark,
                ]),
            ),
            EngineRule::append(
                self.net_table,
                self.net_section,
                args(&[
                    "-p", "tcp", "-m", "mark", "--mark", &mark, "-m", "comment", "--comment",
                    "Server-specific-chain", "-j", net_chain,
                ]),
            ),
        ]
    }

    /// Trap rules diverting handshake packets to the queues.
    ///
    /// In local-container mode the per-PU chains own SYN/ACK capture;
    /// in the other modes the global section rule does, so the per-PU
    /// ack-class rules here match plain ACKs only.
    pub fn trap_rules(&self, app_chain: &str, net_chain: &str) -> Vec<EngineRule> {
        let mut rules = Vec::new();

        if self.mode == Mode::LocalContainer {
            rules.push(EngineRule::append(
                self.app_packet_table,
                app_chain,
                args(&[
                    "-m", "set", "--match-set", TARGET_NETWORK_SET, "dst", "-p", "tcp",
                    "--tcp-flags", "FIN,SYN,RST,PSH,URG", "SYN", "-j", "NFQUEUE",
                    "--queue-balance", &self.fq.app_syn_balance(),
                ]),
            ));
        } else {
            rules.push(EngineRule::append(
                self.app_ack_table,
                app_chain,
                args(&[
                    "-m", "set", "--match-set", TARGET_NETWORK_SET, "dst", "-p", "tcp",
                    "--tcp-flags", "SYN,ACK", "SYN", "-j", "NFQUEUE", "--queue-balance",
                    &self.fq.app_syn_balance(),
                ]),
            ));
        }

        rules.push(EngineRule::append(
            self.app_ack_table,
            app_chain,
            args(&[
                "-m", "set", "--match-set", TARGET_NETWORK_SET, "dst", "-p", "tcp",
                "--tcp-flags", "SYN,ACK", "ACK", "-m", "connbytes", "--connbytes", ":3",
                "--connbytes-dir", "original", "--connbytes-mode", "packets", "-j", "NFQUEUE",
                "--queue-balance", &self.fq.app_ack_balance(),
            ]),
        ));

        if self.mode == Mode::LocalContainer {
            rules.push(EngineRule::append(
                self.app_ack_table,
                app_chain,
                args(&[
                    "-m", "set", "--match-set", TARGET_NETWORK_SET, "dst", "-p", "tcp",
                    "--tcp-flags", "SYN,ACK", "SYN,ACK", "-j", "NFQUEUE", "--queue-balance",
                    &self.fq.app_synack_balance(),
                ]),
            ));
        }

        rules.push(EngineRule::append(
            self.net_table,
            net_chain,
            args(&[
                "-m", "set", "--match-set", TARGET_NETWORK_SET, "src", "-p", "tcp",
                "--tcp-flags", "SYN,ACK", "SYN", "-j", "NFQUEUE", "--queue-balance",
                &self.fq.net_syn_balance(),
            ]),
        ));
        rules.push(EngineRule::append(
            self.net_table,
            net_chain,
            args(&[
                "-m", "set", "--match-set", TARGET_NETWORK_SET, "src", "-p", "tcp",
                "--tcp-flags", "SYN,ACK", "ACK", "-m", "connbytes", "--connbytes", ":3",
                "--connbytes-dir", "original", "--connbytes-mode", "packets", "-j", "NFQUEUE",
                "--queue-balance", &self.fq.net_ack_balance(),
            ]),
        ));
        if self.mode == Mode::LocalContainer {
            rules.push(EngineRule::append(
                self.net_table,
                net_chain,
                args(&[
                    "-m", "set", "--match-set", TARGET_NETWORK_SET, "src", "-p", "tcp",
                    "--tcp-flags", "SYN,ACK", "SYN,ACK", "-j", "NFQUEUE", "--queue-balance",
                    &self.fq.net_synack_balance(),
                ]),
            ));
        }

        rules
    }

    /// ACL rules for one side, rendered with the three observation
    /// passes plus the established-accept, log, and drop tail.
    pub fn acl_rules(
        &self,
        context_id: &str,
        chain: &str,
        side: AclSide,
        acls: &[IpRule],
    ) -> Vec<EngineRule> {
        let (table, addr_flag, group) = match side {
            AclSide::App => (self.app_ack_table, "-d", APP_NFLOG_GROUP),
            AclSide::Net => (self.net_table, "-s", NET_NFLOG_GROUP),
        };

        let mut rules = Vec::new();

        for pass in 0..3 {
            for acl in acls {
                let observe_continue = acl.policy.observe.observe_continue();
                match pass {
                    0 if !observe_continue => continue,
                    1 if acl.policy.observe.observed() => continue,
                    2 if !acl.policy.observe.observe_apply() => continue,
                    _ => {},
                }

                let address = acl.address.to_string();
                let ports = acl.ports.to_string();
                let proto = acl.protocol.name();
                let log_prefix = acl.policy.log_prefix(context_id);
                let logged = acl.policy.action.logged() || observe_continue;

                let mut selector = args(&["-p", proto, addr_flag, &address]);
                if !acl.ports.is_any() {
                    selector.push("--dport".to_string());
                    selector.push(ports);
                }

                let log_rule = |rules: &mut Vec<EngineRule>, inserted: bool| {
                    let mut rule_args = selector.clone();
                    rule_args.extend(args(&[
                        "-m", "mark", "!", "--mark", OBSERVE_MARK, "-m", "state", "--state",
                        "NEW", "-j", "NFLOG", "--nflog-group", group, "--nflog-prefix",
                        &log_prefix,
                    ]));
                    rules.push(if inserted {
                        EngineRule::insert(table, chain, rule_args)
                    } else {
                        EngineRule::append(table, chain, rule_args)
                    });
                };

                match acl.policy.action & (Action::ACCEPT | Action::REJECT) {
                    action if action == Action::ACCEPT => {
                        if logged {
                            log_rule(&mut rules, false);
                        }
                        let mut rule_args = selector.clone();
                        rule_args.extend(args(&["-m", "state", "--state", "NEW"]));
                        if observe_continue {
                            rule_args.extend(args(&[
                                "-m", "mark", "!", "--mark", OBSERVE_MARK, "-j", "MARK",
                                "--set-mark", OBSERVE_MARK,
                            ]));
                        } else {
                            rule_args.extend(args(&["-j", "ACCEPT"]));
                        }
                        rules.push(EngineRule::append(table, chain, rule_args));
                    },
                    action if action == Action::REJECT => {
                        // Rejects take priority: inserted at the top.
                        let mut rule_args = selector.clone();
                        rule_args.extend(args(&["-m", "state", "--state", "NEW"]));
                        if observe_continue {
                            rule_args.extend(args(&[
                                "-m", "mark", "!", "--mark", OBSERVE_MARK, "-j", "MARK",
                                "--set-mark", OBSERVE_MARK,
                            ]));
                        } else {
                            rule_args.extend(args(&["-j", "DROP"]));
                        }
                        rules.push(EngineRule::insert(table, chain, rule_args));
                        if logged {
                            log_rule(&mut rules, true);
                        }
                    },
                    _ => {},
                }
            }
        }

        // Accept established traffic, log the rest, then drop it.
        for proto in ["tcp", "udp"] {
            rules.push(EngineRule::append(
                table,
                chain,
                args(&[
                    addr_flag, "0.0.0.0/0", "-p", proto, "-m", "state", "--state",
                    "ESTABLISHED", "-j", "ACCEPT",
                ]),
            ));
        }
        rules.push(EngineRule::append(
            table,
            chain,
            args(&[
                addr_flag, "0.0.0.0/0", "-m", "state", "--state", "NEW", "-j", "NFLOG",
                "--nflog-group", group, "--nflog-prefix", &default_log_prefix(context_id),
            ]),
        ));
        rules.push(EngineRule::append(
            table,
            chain,
            args(&[addr_flag, "0.0.0.0/0", "-j", "DROP"]),
        ));

        rules
    }

    /// Highest-priority accepts between the PU and its excluded
    /// networks, authenticated or not.
    pub fn exclusion_rules(
        &self,
        app_chain: &str,
        net_chain: &str,
        ip: Ipv4Addr,
        exclusions: &[CidrV4],
    ) -> Vec<EngineRule> {
        let ip = ip.to_string();
        let option = AUTH_OPTION_KIND.to_string();
        let mut rules = Vec::new();

        for excluded in exclusions {
            let excluded = excluded.to_string();
            rules.push(EngineRule::insert(
                self.app_ack_table,
                app_chain,
                args(&["-s", &ip, "-d", &excluded, "-j", "ACCEPT"]),
            ));
            rules.push(EngineRule::insert(
                self.net_table,
                net_chain,
                args(&[
                    "-s", &excluded, "-d", &ip, "-p", "tcp", "!", "--tcp-option", &option,
                    "-j", "ACCEPT",
                ]),
            ));
        }

        rules
    }

    /// Global section rules installed once per target-network update.
    pub fn global_rules(&self) -> Vec<EngineRule> {
        let conn_mark = DEFAULT_CONN_MARK.to_string();
        let mut rules = Vec::new();

        // Completed flows bypass the queues entirely.
        rules.push(EngineRule::insert(
            self.app_ack_table,
            self.app_section,
            args(&["-m", "connmark", "--mark", &conn_mark, "-j", "ACCEPT"]),
        ));
        rules.push(EngineRule::insert(
            self.net_table,
            self.net_section,
            args(&["-m", "connmark", "--mark", &conn_mark, "-j", "ACCEPT"]),
        ));

        if self.mode != Mode::LocalContainer {
            // The global section rule owns SYN/ACK capture in these
            // modes.
            rules.push(EngineRule::insert(
                self.app_ack_table,
                self.app_section,
                args(&[
                    "-m", "set", "--match-set", TARGET_NETWORK_SET, "dst", "-p", "tcp",
                    "--tcp-flags", "SYN,ACK", "SYN,ACK", "-j", "NFQUEUE", "--queue-bypass",
                    "--queue-balance", &self.fq.app_synack_balance(),
                ]),
            ));
            rules.push(EngineRule::insert(
                self.net_table,
                self.net_section,
                args(&[
                    "-m", "set", "--match-set", TARGET_NETWORK_SET, "src", "-p", "tcp",
                    "--tcp-flags", "SYN,ACK", "SYN,ACK", "-j", "NFQUEUE", "--queue-bypass",
                    "--queue-balance", &self.fq.net_synack_balance(),
                ]),
            ));
        }

        // Stamped SYNs reaching a local PU are diverted even before a
        // per-PU chain exists.
        let option = AUTH_OPTION_KIND.to_string();
        rules.push(EngineRule::insert(
            self.net_table,
            self.net_section,
            args(&[
                "-m", "set", "--match-set", TARGET_NETWORK_SET, "src", "-p", "tcp",
                "--tcp-flags", "SYN,ACK", "SYN", "--tcp-option", &option, "-j", "NFQUEUE",
                "--queue-bypass", "--queue-balance", &self.fq.net_syn_balance(),
            ]),
        ));

        if self.mode == Mode::LocalServer {
            rules.push(EngineRule::insert(
                self.app_ack_table,
                self.app_section,
                args(&["-j", UID_CHAIN]),
            ));
        }

        if self.mode == Mode::LocalContainer {
            // Packets re-injected by the datapath carry the queue mark.
            let mark = self.fq.mark_value.to_string();
            rules.push(EngineRule::insert(
                self.app_ack_table,
                self.app_section,
                args(&["-m", "mark", "--mark", &mark, "-j", "ACCEPT"]),
            ));
        }

        // Proxy plumbing.
        rules.push(EngineRule::insert(
            self.proxy_table,
            "PREROUTING",
            args(&["-j", NAT_PROXY_INPUT_CHAIN]),
        ));
        rules.push(EngineRule::insert(
            self.proxy_table,
            "OUTPUT",
            args(&["-j", NAT_PROXY_OUTPUT_CHAIN]),
        ));
        for chain in [NAT_PROXY_INPUT_CHAIN, NAT_PROXY_OUTPUT_CHAIN] {
            rules.push(EngineRule::insert(
                self.proxy_table,
                chain,
                args(&["-m", "mark", "--mark", PROXY_MARK, "-j", "ACCEPT"]),
            ));
        }
        for chain in [PROXY_INPUT_CHAIN, PROXY_OUTPUT_CHAIN] {
            rules.push(EngineRule::insert(
                self.app_ack_table,
                chain,
                args(&["-m", "mark", "--mark", PROXY_MARK, "-j", "ACCEPT"]),
            ));
        }
        rules.push(EngineRule::insert(
            self.app_ack_table,
            self.net_section,
            args(&["-j", PROXY_INPUT_CHAIN]),
        ));
        rules.push(EngineRule::insert(
            self.app_ack_table,
            self.app_section,
            args(&["-j", PROXY_OUTPUT_CHAIN]),
        ));

        if self.mode != Mode::LocalServer {
            // TODO(review): owner rules inherited from the original
            // deployment; unclear whether required for correctness.
            rules.push(EngineRule::insert(
                self.app_ack_table,
                self.app_section,
                args(&["-m", "owner", "!", "--uid-owner", "1337", "-j", "ACCEPT"]),
            ));
            rules.push(EngineRule::insert(
                self.app_ack_table,
                self.app_section,
                args(&[
                    "-m", "owner", "!", "--uid-owner", "1337", "-j", "MARK", "--set-mark",
                    "61166",
                ]),
            ));
        }

        rules
    }

    pub const fn mode(&self) -> Mode {
        self.mode
    }
}
