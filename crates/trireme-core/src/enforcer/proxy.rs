//! RPC client that fronts a datapath in a remote network namespace.
//!
//! Implements [`Enforcer`] by marshalling each call as one
//! request/response frame exchange over a Unix socket. Configuration
//! RPCs are serialized through a single command mutex so they never
//! interleave; the remote side applies them in arrival order.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use super::rpc::{read_frame, write_frame, Request, Response};
use super::{Enforcer, EnforcerError};
use crate::fqueue::FilterQueueConfig;
use crate::policy::PuInfo;
use crate::secrets::SecretsSpec;

const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Enforcer transport wrapper over a remote datapath.
pub struct ProxyEnforcer {
    socket_path: PathBuf,
    filter_queue: FilterQueueConfig,
    command_lock: Mutex<()>,
}

impl ProxyEnforcer {
    /// Creates a proxy speaking to the datapath at `socket_path`.
    ///
    /// `filter_queue` mirrors the remote datapath's queue parameters;
    /// the supervisor reads them from here.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>, filter_queue: FilterQueueConfig) -> Self {
        Self {
            socket_path: socket_path.into(),
            filter_queue,
            command_lock: Mutex::new(()),
        }
    }

    fn call(&self, request: &Request) -> Result<(), EnforcerError> {
        let _serialized = self
            .command_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let transport = |reason: String| EnforcerError::Transport { reason };

        let mut stream = UnixStream::connect(&self.socket_path)
            .map_err(|e| transport(format!("connect {}: {e}", self.socket_path.display())))?;
        stream
            .set_read_timeout(Some(RPC_TIMEOUT))
            .and_then(|()| stream.set_write_timeout(Some(RPC_TIMEOUT)))
            .map_err(|e| transport(format!("socket timeout: {e}")))?;

        write_frame(&mut stream, request).map_err(|e| transport(e.to_string()))?;
        let response: Response =
            read_frame(&mut stream).map_err(|e| transport(e.to_string()))?;

        match response {
            Response::Ok => Ok(()),
            Response::Err { message } => Err(transport(message)),
        }
    }
}

impl Enforcer for ProxyEnforcer {
    fn enforce(&self, context_id: &str, pu: &PuInfo) -> Result<(), EnforcerError> {
        debug!(context_id, "proxying enforce to remote datapath");
        self.call(&Request::Enforce {
            context_id: context_id.to_string(),
            pu: pu.clone(),
        })
    }

    fn unenforce(&self, context_id: &str) -> Result<(), EnforcerError> {
        self.call(&Request::Unenforce {
            context_id: context_id.to_string(),
        })
    }

    fn update_secrets(&self, spec: &SecretsSpec) -> Result<(), EnforcerError> {
        self.call(&Request::UpdateSecrets { spec: spec.clone() })
    }

    fn filter_queue(&self) -> FilterQueueConfig {
        self.filter_queue.clone()
    }

    fn start(&self) -> Result<(), EnforcerError> {
        self.call(&Request::Start)
    }

    fn stop(&self) -> Result<(), EnforcerError> {
        self.call(&Request::Stop)
    }
}
