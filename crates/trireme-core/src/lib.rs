//! # trireme-core
//!
//! Core library for Trireme - a host-resident agent that enforces
//! zero-trust network segmentation between Processing Units (PUs).
//!
//! Every new TCP connection between PUs is authenticated with a
//! cryptographic identity token exchanged inside a custom TCP option
//! during the three-way handshake. The host packet filter is programmed
//! so that only flows whose endpoints hold compatible policies survive.
//!
//! ## Subsystems
//!
//! - **Datapath**: per-flow SYN / SYN-ACK / ACK authentication state
//!   machine driven from a user-space packet queue
//! - **Supervisor**: compiles PU policy into versioned packet-filter
//!   chains and named sets, with hitless updates
//! - **Token codec**: signed, time-bounded claim carriers (PSK HMAC,
//!   ECDSA PKI, compact PKI)
//! - **Registry / connection table**: read-mostly PU context snapshots
//!   and a sharded per-flow state store
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use trireme_core::collector::LogCollector;
//! use trireme_core::datapath::{Datapath, DatapathConfig};
//! use trireme_core::enforcer::Mode;
//! use trireme_core::secrets::Secrets;
//!
//! let secrets = Secrets::psk(b"shared-key".to_vec());
//! let datapath = Datapath::new(
//!     DatapathConfig::new("server-1", Mode::LocalServer),
//!     secrets,
//!     Arc::new(LogCollector),
//! );
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod claims;
pub mod collector;
pub mod conntrack;
pub mod datapath;
pub mod enforcer;
pub mod evaluator;
pub mod fqueue;
pub mod net;
pub mod packet;
pub mod policy;
pub mod portset;
pub mod registry;
pub mod secrets;
pub mod supervisor;
pub mod token;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::claims::ClaimSet;
    pub use crate::collector::{EventCollector, FlowRecord};
    pub use crate::datapath::{Datapath, DatapathConfig};
    pub use crate::enforcer::{Enforcer, Mode};
    pub use crate::policy::{Action, ObserveAction, PuInfo, PuPolicy, PuRuntime};
    pub use crate::secrets::Secrets;
    pub use crate::supervisor::Supervisor;
}

pub use claims::ClaimSet;
pub use enforcer::{Enforcer, Mode};
pub use policy::{PuInfo, PuPolicy, PuRuntime};
pub use supervisor::Supervisor;
