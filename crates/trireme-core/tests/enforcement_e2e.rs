//! End-to-end enforcement scenarios: supervisor rendering, datapath
//! registration, hitless policy updates, and teardown, all against the
//! in-memory packet-filter provider.

use std::net::Ipv4Addr;
use std::sync::Arc;

use trireme_core::claims::ClaimSet;
use trireme_core::collector::{EventCollector, RecordingCollector};
use trireme_core::conntrack::Direction;
use trireme_core::datapath::{Datapath, DatapathConfig};
use trireme_core::enforcer::{Enforcer, Mode};
use trireme_core::packet::{flags, FourTuple, TcpPacket};
use trireme_core::policy::{
    Action, FlowPolicy, PuInfo, PuPolicy, PuRuntime, PuType, TagPredicate, TagRule,
    DEFAULT_NAMESPACE,
};
use trireme_core::portset::PortSetTracker;
use trireme_core::secrets::Secrets;
use trireme_core::supervisor::{
    MemoryProvider, RuleProvider, SetProvider, Supervisor, SupervisorError,
};
use trireme_core::net::CidrV4;

struct Harness {
    provider: Arc<MemoryProvider>,
    datapath: Arc<Datapath>,
    supervisor: Supervisor,
    collector: Arc<RecordingCollector>,
}

fn networks(cidrs: &[&str]) -> Vec<CidrV4> {
    cidrs.iter().map(|c| c.parse().unwrap()).collect()
}

fn setup(mode: Mode, target: &[&str]) -> Harness {
    let provider = Arc::new(MemoryProvider::new());
    let collector = Arc::new(RecordingCollector::new());

    let datapath = Arc::new(Datapath::new(
        DatapathConfig::new("e2e", mode),
        Secrets::psk(b"e2e-key".to_vec()),
        Arc::clone(&collector) as Arc<dyn EventCollector>,
    ));

    let portset = Arc::new(PortSetTracker::new(
        Arc::clone(&provider) as Arc<dyn SetProvider>
    ));
    let supervisor = Supervisor::new(
        Arc::clone(&datapath) as Arc<dyn Enforcer>,
        mode,
        networks(target),
        Arc::clone(&provider) as Arc<dyn RuleProvider>,
        Arc::clone(&provider) as Arc<dyn SetProvider>,
        Some(portset),
    )
    .unwrap();

    Harness {
        provider,
        datapath,
        supervisor,
        collector,
    }
}

fn container_pu(ctx: &str, ip: Ipv4Addr, role: &str) -> PuInfo {
    let mut identity = ClaimSet::new();
    identity.insert("role", role);

    let mut policy = PuPolicy::new(format!("{ctx}-mgmt"), identity);
    policy.ips.insert(DEFAULT_NAMESPACE.to_string(), ip);
    policy.target_networks = networks(&["10.0.0.0/8"]);

    let mut runtime = PuRuntime::new(PuType::Container, ctx, 4242);
    runtime.ips.insert(DEFAULT_NAMESPACE.to_string(), ip);

    PuInfo::new(ctx, policy, runtime)
}

fn accept_rule(key: &str, value: &str, id: &str) -> TagRule {
    TagRule::new(
        vec![TagPredicate::equals(key, value)],
        FlowPolicy::new(Action::ACCEPT, id),
    )
}

fn tuple() -> FourTuple {
    FourTuple {
        src_ip: Ipv4Addr::new(10, 1, 0, 1),
        src_port: 43000,
        dst_ip: Ipv4Addr::new(10, 1, 0, 2),
        dst_port: 5432,
    }
}

fn rewritten(datapath: &Datapath, direction: Direction, payload: Vec<u8>) -> Vec<u8> {
    let verdict = datapath.process(direction, payload);
    assert!(verdict.accepted(), "expected accept: {verdict:?}");
    verdict.payload.expect("expected rewritten payload")
}

fn run_handshake(datapath: &Datapath) {
    let syn = TcpPacket::build(tuple(), flags::SYN, 1, 0).into_bytes();
    let wire = rewritten(datapath, Direction::App, syn);
    rewritten(datapath, Direction::Net, wire);

    let synack = TcpPacket::build(tuple().reversed(), flags::SYN | flags::ACK, 9, 2).into_bytes();
    let wire = rewritten(datapath, Direction::App, synack);
    rewritten(datapath, Direction::Net, wire);

    let ack = TcpPacket::build(tuple(), flags::ACK, 2, 10).into_bytes();
    let wire = rewritten(datapath, Direction::App, ack);
    rewritten(datapath, Direction::Net, wire);
}

#[test]
fn start_installs_target_set_and_global_plumbing() {
    let harness = setup(Mode::LocalContainer, &["10.0.0.0/8"]);
    harness.supervisor.start().unwrap();

    assert_eq!(
        harness.provider.set_entries("TargetNetSet").unwrap(),
        vec!["10.0.0.0/8".to_string()]
    );
    let nat_chains = harness.provider.chains("nat");
    assert!(nat_chains.contains(&"RedirProxy-App".to_string()));
    assert!(nat_chains.contains(&"RedirProxy-Net".to_string()));
    let mangle_chains = harness.provider.chains("mangle");
    assert!(mangle_chains.contains(&"Proxy-App".to_string()));
    assert!(mangle_chains.contains(&"Proxy-Net".to_string()));
}

#[test]
fn empty_target_networks_intercept_everything() {
    let harness = setup(Mode::LocalContainer, &[]);
    harness.supervisor.start().unwrap();

    let entries = harness.provider.set_entries("TargetNetSet").unwrap();
    assert_eq!(
        entries,
        vec!["0.0.0.0/1".to_string(), "128.0.0.0/1".to_string()]
    );
}

#[test]
fn set_target_networks_replaces_members_atomically() {
    let harness = setup(Mode::LocalContainer, &["10.0.0.0/8"]);
    harness.supervisor.start().unwrap();

    harness
        .supervisor
        .set_target_networks(networks(&["192.168.0.0/16"]))
        .unwrap();

    assert_eq!(
        harness.provider.set_entries("TargetNetSet").unwrap(),
        vec!["192.168.0.0/16".to_string()]
    );
}

#[test]
fn supervise_installs_versioned_chains_and_registers_pu() {
    let harness = setup(Mode::LocalContainer, &["10.0.0.0/8"]);
    harness.supervisor.start().unwrap();

    harness
        .supervisor
        .supervise("db-1", &container_pu("db-1", tuple().dst_ip, "db"))
        .unwrap();

    let mangle_chains = harness.provider.chains("mangle");
    assert!(
        mangle_chains
            .iter()
            .any(|c| c.starts_with("TRIREME-App-db-1") && c.ends_with("-0")),
        "app chain at version 0, got {mangle_chains:?}"
    );
    assert!(mangle_chains
        .iter()
        .any(|c| c.starts_with("TRIREME-Net-db-1") && c.ends_with("-0")));

    // Registered with the datapath only after the rules landed.
    assert!(harness.datapath.registry().get("db-1").is_some());
}

#[test]
fn hitless_update_leaves_exactly_one_chain_version() {
    let harness = setup(Mode::LocalContainer, &["10.0.0.0/8"]);
    harness.supervisor.start().unwrap();

    let ctx = "db-1";
    harness
        .supervisor
        .supervise(ctx, &container_pu(ctx, tuple().dst_ip, "db"))
        .unwrap();

    let mut updated = container_pu(ctx, tuple().dst_ip, "db");
    updated.policy.receiver_rules = vec![accept_rule("role", "web", "p-new")];
    harness.supervisor.supervise(ctx, &updated).unwrap();

    let mangle_chains = harness.provider.chains("mangle");
    let pu_chains: Vec<_> = mangle_chains
        .iter()
        .filter(|c| c.contains("db-1"))
        .collect();
    assert_eq!(pu_chains.len(), 2, "one App + one Net chain: {pu_chains:?}");
    assert!(pu_chains.iter().all(|c| c.ends_with("-1")), "{pu_chains:?}");

    // The registry snapshot advanced with the update.
    let snapshot = harness.datapath.registry().get(ctx).unwrap();
    assert_eq!(snapshot.version, 2);
    assert_eq!(snapshot.receiver_rules.len(), 1);
}

#[test]
fn established_connection_survives_policy_update() {
    let harness = setup(Mode::LocalContainer, &["10.0.0.0/8"]);
    harness.supervisor.start().unwrap();

    harness
        .supervisor
        .supervise("web-1", &{
            let mut pu = container_pu("web-1", tuple().src_ip, "web");
            pu.policy.transmitter_rules = vec![accept_rule("role", "db", "p-out")];
            pu
        })
        .unwrap();
    harness
        .supervisor
        .supervise("db-1", &{
            let mut pu = container_pu("db-1", tuple().dst_ip, "db");
            pu.policy.receiver_rules = vec![accept_rule("role", "web", "p-in")];
            pu
        })
        .unwrap();

    run_handshake(&harness.datapath);
    assert_eq!(harness.collector.records().len(), 2);

    // Flip db-1 to a policy that would reject new web connections.
    let mut strict = container_pu("db-1", tuple().dst_ip, "db");
    strict.policy.receiver_rules = vec![accept_rule("role", "admin", "p-strict")];
    harness.supervisor.supervise("db-1", &strict).unwrap();

    // The authorized flow keeps passing: a post-handshake ACK is
    // accepted without a new evaluation.
    let ack = TcpPacket::build(tuple(), flags::ACK, 50, 60).into_bytes();
    let verdict = harness.datapath.process(Direction::Net, ack);
    assert!(verdict.accepted());
    assert_eq!(harness.collector.records().len(), 2, "no new flow events");

    // A brand-new connection is evaluated against the new policy.
    let fresh = FourTuple {
        src_port: 43999,
        ..tuple()
    };
    let syn = TcpPacket::build(fresh, flags::SYN, 1, 0).into_bytes();
    let wire = rewritten(&harness.datapath, Direction::App, syn);
    let verdict = harness.datapath.process(Direction::Net, wire);
    assert!(!verdict.accepted(), "new policy rejects the fresh flow");
}

#[test]
fn unsupervise_removes_everything_named_after_the_context() {
    let harness = setup(Mode::LocalContainer, &["10.0.0.0/8"]);
    harness.supervisor.start().unwrap();

    let ctx = "db-1";
    harness
        .supervisor
        .supervise(ctx, &container_pu(ctx, tuple().dst_ip, "db"))
        .unwrap();
    harness.supervisor.unsupervise(ctx).unwrap();

    for table in ["mangle", "raw", "nat"] {
        let leftover: Vec<_> = harness
            .provider
            .chains(table)
            .into_iter()
            .filter(|c| c.contains("db-1"))
            .collect();
        assert!(leftover.is_empty(), "{table} still has {leftover:?}");
    }
    let leftover_sets: Vec<_> = harness
        .provider
        .set_names()
        .into_iter()
        .filter(|s| s.contains("db-1"))
        .collect();
    assert!(leftover_sets.is_empty(), "sets left: {leftover_sets:?}");

    let leftover_rules = harness.provider.rules_mentioning("db-1");
    assert!(leftover_rules.is_empty(), "rules left: {leftover_rules:?}");

    assert!(harness.datapath.registry().get(ctx).is_none());
}

#[test]
fn unsupervise_unknown_context_is_a_config_error() {
    let harness = setup(Mode::LocalContainer, &["10.0.0.0/8"]);

    assert!(matches!(
        harness.supervisor.unsupervise("ghost"),
        Err(SupervisorError::Config { .. })
    ));
}

#[test]
fn supervise_without_ip_fails_and_installs_nothing() {
    let harness = setup(Mode::LocalContainer, &["10.0.0.0/8"]);
    harness.supervisor.start().unwrap();

    let mut pu = container_pu("bad-1", tuple().dst_ip, "db");
    pu.policy.ips.clear();

    assert!(matches!(
        harness.supervisor.supervise("bad-1", &pu),
        Err(SupervisorError::Config { .. })
    ));
    assert!(harness
        .provider
        .chains("mangle")
        .iter()
        .all(|c| !c.contains("bad-1")));
    assert!(harness.datapath.registry().get("bad-1").is_none());
}

#[test]
fn local_server_cgroup_pu_uses_mark_keyed_rules() {
    let harness = setup(Mode::LocalServer, &["10.0.0.0/8"]);
    harness.supervisor.start().unwrap();

    let mut pu = container_pu("svc-1", tuple().dst_ip, "db");
    pu.runtime.pu_type = PuType::LinuxProcess;
    pu.runtime.options.cgroup_mark = Some(100);
    pu.runtime.options.services = vec!["5432".parse().unwrap()];

    harness.supervisor.supervise("svc-1", &pu).unwrap();

    let output_rules = harness.provider.rules("mangle", "OUTPUT");
    assert!(
        output_rules
            .iter()
            .any(|r| r.contains(&"--cgroup".to_string()) && r.contains(&"100".to_string())),
        "cgroup jump missing: {output_rules:?}"
    );
}

#[test]
fn local_server_uid_pu_creates_dynamic_port_set() {
    let harness = setup(Mode::LocalServer, &["10.0.0.0/8"]);
    harness.supervisor.start().unwrap();

    let mut pu = container_pu("login-1", tuple().dst_ip, "user");
    pu.runtime.pu_type = PuType::UidLogin;
    pu.runtime.options.cgroup_mark = Some(200);
    pu.runtime.options.user_id = Some("1001".to_string());

    harness.supervisor.supervise("login-1", &pu).unwrap();

    let port_sets: Vec<_> = harness
        .provider
        .set_names()
        .into_iter()
        .filter(|s| s.starts_with("PUPort-"))
        .collect();
    assert_eq!(port_sets.len(), 1, "{port_sets:?}");
    assert!(port_sets[0].ends_with("200"));

    // The datapath derived the same name independently.
    let snapshot = harness.datapath.registry().get("login-1").unwrap();
    assert_eq!(snapshot.port_set_name.as_deref(), Some(port_sets[0].as_str()));
}

#[test]
fn stop_destroys_all_sets() {
    let harness = setup(Mode::LocalContainer, &["10.0.0.0/8"]);
    harness.supervisor.start().unwrap();
    harness
        .supervisor
        .supervise("db-1", &container_pu("db-1", tuple().dst_ip, "db"))
        .unwrap();

    harness.supervisor.stop();

    assert!(harness.provider.set_names().is_empty());
}
