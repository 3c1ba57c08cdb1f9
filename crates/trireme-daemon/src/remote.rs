//! Remote-datapath RPC server.
//!
//! Accepts length-prefixed command frames from the proxy enforcer and
//! applies them to the local supervisor and datapath. Commands are
//! handled one connection at a time in arrival order, so configuration
//! never interleaves with itself.

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tracing::{debug, info, warn};

use trireme_core::datapath::Datapath;
use trireme_core::enforcer::rpc::{read_frame, write_frame, Request, Response, RpcError};
use trireme_core::enforcer::Enforcer as _;
use trireme_core::supervisor::Supervisor;

/// Serves enforcement commands for a datapath in this namespace.
pub struct RemoteServer {
    datapath: Arc<Datapath>,
    supervisor: Arc<Supervisor>,
    listener: UnixListener,
}

impl RemoteServer {
    /// Binds the command socket, replacing any stale one.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be bound.
    pub fn bind(
        socket_path: &Path,
        datapath: Arc<Datapath>,
        supervisor: Arc<Supervisor>,
    ) -> anyhow::Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("binding {}", socket_path.display()))?;
        info!(socket = %socket_path.display(), "remote datapath listening");

        Ok(Self {
            datapath,
            supervisor,
            listener,
        })
    }

    /// Accepts connections until the listener fails.
    pub fn serve(&self) {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(err) = self.serve_connection(stream) {
                        debug!(%err, "rpc connection ended");
                    }
                },
                Err(err) => {
                    warn!(%err, "accept failed");
                    return;
                },
            }
        }
    }

    fn serve_connection(&self, mut stream: UnixStream) -> Result<(), RpcError> {
        loop {
            let request: Request = match read_frame(&mut stream) {
                Ok(request) => request,
                // EOF: the proxy finished this exchange.
                Err(RpcError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                },
                Err(err) => return Err(err),
            };

            let response = self.dispatch(request);
            write_frame(&mut stream, &response)?;
        }
    }

    fn dispatch(&self, request: Request) -> Response {
        let result = match request {
            Request::Enforce { context_id, pu } => {
                self.supervisor.supervise(&context_id, &pu).map_err(|e| e.to_string())
            },
            Request::Unenforce { context_id } => self
                .supervisor
                .unsupervise(&context_id)
                .map_err(|e| e.to_string()),
            Request::UpdateSecrets { spec } => {
                self.datapath.update_secrets(&spec).map_err(|e| e.to_string())
            },
            Request::SetTargetNetworks { networks } => self
                .supervisor
                .set_target_networks(networks)
                .map_err(|e| e.to_string()),
            Request::Start => self
                .supervisor
                .start()
                .map_err(|e| e.to_string())
                .and_then(|()| self.datapath.start().map_err(|e| e.to_string())),
            Request::Stop => {
                self.supervisor.stop();
                self.datapath.stop().map_err(|e| e.to_string())
            },
        };

        match result {
            Ok(()) => Response::Ok,
            Err(message) => {
                warn!(%message, "rpc command failed");
                Response::Err { message }
            },
        }
    }
}

/// Enters the network namespace at `ns_path`.
///
/// # Errors
///
/// Fails when the namespace file cannot be opened or joined.
pub fn enter_network_namespace(ns_path: &Path) -> anyhow::Result<()> {
    use std::os::fd::AsFd as _;

    let ns_file = std::fs::File::open(ns_path)
        .with_context(|| format!("opening namespace {}", ns_path.display()))?;
    nix::sched::setns(ns_file.as_fd(), nix::sched::CloneFlags::CLONE_NEWNET)
        .with_context(|| format!("entering namespace {}", ns_path.display()))?;
    info!(ns = %ns_path.display(), "joined network namespace");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use trireme_core::claims::ClaimSet;
    use trireme_core::collector::{EventCollector, RecordingCollector};
    use trireme_core::datapath::DatapathConfig;
    use trireme_core::enforcer::{Enforcer, Mode, ProxyEnforcer};
    use trireme_core::fqueue::FilterQueueConfig;
    use trireme_core::policy::{PuInfo, PuPolicy, PuRuntime, PuType, DEFAULT_NAMESPACE};
    use trireme_core::portset::PortSetTracker;
    use trireme_core::secrets::Secrets;
    use trireme_core::supervisor::{MemoryProvider, RuleProvider, SetProvider};

    use super::*;

    fn harness(dir: &Path) -> (Arc<Datapath>, ProxyEnforcer) {
        let provider = Arc::new(MemoryProvider::new());
        let datapath = Arc::new(Datapath::new(
            DatapathConfig::new("remote-test", Mode::RemoteContainer),
            Secrets::psk(b"remote-key".to_vec()),
            Arc::new(RecordingCollector::new()) as Arc<dyn EventCollector>,
        ));
        let portset = Arc::new(PortSetTracker::new(
            Arc::clone(&provider) as Arc<dyn SetProvider>
        ));
        let supervisor = Arc::new(
            Supervisor::new(
                Arc::clone(&datapath) as Arc<dyn Enforcer>,
                Mode::RemoteContainer,
                Vec::new(),
                Arc::clone(&provider) as Arc<dyn RuleProvider>,
                provider as Arc<dyn SetProvider>,
                Some(portset),
            )
            .unwrap(),
        );

        let socket = dir.join("remote.sock");
        let server =
            RemoteServer::bind(&socket, Arc::clone(&datapath), supervisor).unwrap();
        std::thread::spawn(move || server.serve());

        let proxy = ProxyEnforcer::new(socket, FilterQueueConfig::default());
        (datapath, proxy)
    }

    fn sample_pu(ctx: &str) -> PuInfo {
        let mut policy = PuPolicy::new(format!("{ctx}-mgmt"), ClaimSet::new());
        policy
            .ips
            .insert(DEFAULT_NAMESPACE.to_string(), Ipv4Addr::new(10, 0, 0, 9));
        let mut runtime = PuRuntime::new(PuType::Container, ctx, 77);
        runtime
            .ips
            .insert(DEFAULT_NAMESPACE.to_string(), Ipv4Addr::new(10, 0, 0, 9));
        PuInfo::new(ctx, policy, runtime)
    }

    #[test]
    fn test_enforce_round_trip_through_rpc() {
        let dir = tempfile::tempdir().unwrap();
        let (datapath, proxy) = harness(dir.path());

        proxy.start().unwrap();
        proxy.enforce("ctx-remote", &sample_pu("ctx-remote")).unwrap();
        assert!(datapath.registry().get("ctx-remote").is_some());

        proxy.unenforce("ctx-remote").unwrap();
        assert!(datapath.registry().get("ctx-remote").is_none());
    }

    #[test]
    fn test_remote_error_propagates_as_message() {
        let dir = tempfile::tempdir().unwrap();
        let (_datapath, proxy) = harness(dir.path());

        // Unenforcing an unknown context is a remote-side error.
        let result = proxy.unenforce("never-seen");
        assert!(result.is_err());
    }
}
