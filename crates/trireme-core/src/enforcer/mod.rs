//! The enforcer surface shared by local and remote datapaths.
//!
//! An enforcer owns the authentication datapath for a set of PUs. The
//! local datapath implements the trait in-process; [`ProxyEnforcer`]
//! marshals the same calls over a length-prefixed RPC frame to a
//! datapath running in a remote network namespace, which behaves
//! identically.

pub mod rpc;

mod proxy;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use proxy::ProxyEnforcer;

use crate::fqueue::FilterQueueConfig;
use crate::policy::PuInfo;
use crate::secrets::SecretsSpec;

/// Deployment mode of an enforcer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Containers enforced from the host namespace.
    LocalContainer,
    /// Containers enforced by a datapath inside their namespace.
    RemoteContainer,
    /// Cgroup- and UID-scoped processes on the host itself.
    LocalServer,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LocalContainer => "local-container",
            Self::RemoteContainer => "remote-container",
            Self::LocalServer => "local-server",
        })
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-container" => Ok(Self::LocalContainer),
            "remote-container" => Ok(Self::RemoteContainer),
            "local-server" => Ok(Self::LocalServer),
            other => Err(format!("unknown enforcer mode: {other}")),
        }
    }
}

/// Errors surfaced by enforcer operations.
#[derive(Debug, Error)]
pub enum EnforcerError {
    /// Invalid inputs at enforce time; nothing was installed.
    #[error("invalid enforcer configuration: {reason}")]
    Config {
        /// What was wrong.
        reason: String,
    },

    /// The signing material could not be applied.
    #[error("secrets rejected: {reason}")]
    Secrets {
        /// What was wrong.
        reason: String,
    },

    /// The remote datapath could not be reached or answered an error.
    #[error("enforcer transport failure: {reason}")]
    Transport {
        /// What failed.
        reason: String,
    },
}

/// Policy enforcement surface of a datapath.
pub trait Enforcer: Send + Sync {
    /// Starts enforcing the given PU. Idempotent: a second call for
    /// the same context performs a policy update.
    ///
    /// # Errors
    ///
    /// Returns [`EnforcerError::Config`] on invalid inputs; no state is
    /// installed in that case.
    fn enforce(&self, context_id: &str, pu: &PuInfo) -> Result<(), EnforcerError>;

    /// Stops enforcing the given PU. Best-effort: cleanup continues
    /// past individual failures.
    ///
    /// # Errors
    ///
    /// Returns [`EnforcerError::Transport`] only when a remote datapath
    /// is unreachable.
    fn unenforce(&self, context_id: &str) -> Result<(), EnforcerError>;

    /// Hot-swaps signing material. Existing authorized connections are
    /// unaffected; the next handshake uses the new material.
    ///
    /// # Errors
    ///
    /// Returns [`EnforcerError::Secrets`] on undecodable material.
    fn update_secrets(&self, spec: &SecretsSpec) -> Result<(), EnforcerError>;

    /// The filter-queue parameters of this datapath, captured by the
    /// supervisor at construction.
    fn filter_queue(&self) -> FilterQueueConfig;

    /// Starts the datapath.
    ///
    /// # Errors
    ///
    /// Returns [`EnforcerError::Transport`] when a remote datapath
    /// cannot be started.
    fn start(&self) -> Result<(), EnforcerError>;

    /// Stops the datapath, draining in-flight packets.
    ///
    /// # Errors
    ///
    /// Returns [`EnforcerError::Transport`] when a remote datapath
    /// cannot be reached.
    fn stop(&self) -> Result<(), EnforcerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip() {
        for mode in [Mode::LocalContainer, Mode::RemoteContainer, Mode::LocalServer] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
        assert!("sidecar".parse::<Mode>().is_err());
    }
}
