//! Deterministic packet-filter object naming.
//!
//! Chain and set names are derived from the context identifier alone,
//! so the supervisor and datapath never need to exchange them. Names
//! embed the first four characters of the context id plus a short
//! URL-safe base64 slice of its MD5 digest, keeping the total length
//! bounded while making accidental collisions require a partial digest
//! collision.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use md5::{Digest as _, Md5};

/// Prefix of every chain owned by this agent.
pub const CHAIN_PREFIX: &str = "TRIREME-";

/// Prefix of per-PU application (outbound) chains.
pub const APP_CHAIN_PREFIX: &str = "TRIREME-App-";

/// Prefix of per-PU network (inbound) chains.
pub const NET_CHAIN_PREFIX: &str = "TRIREME-Net-";

/// Shared set holding the target network CIDRs.
pub const TARGET_NETWORK_SET: &str = "TargetNetSet";

/// Prefix of per-PU dynamic port sets.
pub const PU_PORT_SET_PREFIX: &str = "PUPort-";

/// Prefix of per-PU proxied-service sets.
pub const PROXY_SET_PREFIX: &str = "Proxy-";

/// Chain collecting UID-owner jump rules in local-server mode.
pub const UID_CHAIN: &str = "UIDCHAIN";

/// NAT chain redirecting outbound proxied traffic.
pub const NAT_PROXY_OUTPUT_CHAIN: &str = "RedirProxy-App";

/// NAT chain redirecting inbound proxied traffic.
pub const NAT_PROXY_INPUT_CHAIN: &str = "RedirProxy-Net";

/// Mangle chain accepting outbound proxy traffic.
pub const PROXY_OUTPUT_CHAIN: &str = "Proxy-App";

/// Mangle chain accepting inbound proxy traffic.
pub const PROXY_INPUT_CHAIN: &str = "Proxy-Net";

/// Mark carried by the proxy's own sockets, exempting them from
/// re-redirection.
pub const PROXY_MARK: &str = "0x40";

fn context_digest(context_id: &str, digest_chars: usize) -> String {
    let digest = Md5::digest(context_id.as_bytes());
    let encoded = URL_SAFE.encode(digest);

    let head = if context_id.len() > 4 {
        &context_id[..4]
    } else {
        context_id
    };

    format!("{head}{}", &encoded[..digest_chars])
}

/// App and Net chain names for `(context_id, version)`.
#[must_use]
pub fn chain_names(context_id: &str, version: u32) -> (String, String) {
    let id = context_digest(context_id, 6);
    (
        format!("{APP_CHAIN_PREFIX}{id}-{version}"),
        format!("{NET_CHAIN_PREFIX}{id}-{version}"),
    )
}

/// Name of a per-PU set: `{prefix}{ctx4+hash4}{mark}`.
#[must_use]
pub fn port_set_name(context_id: &str, mark: Option<u32>, prefix: &str) -> String {
    let id = context_digest(context_id, 4);
    match mark {
        Some(mark) => format!("{prefix}{id}{mark}"),
        None => format!("{prefix}{id}"),
    }
}

/// Name of the dynamic port set of a UID-scoped PU.
#[must_use]
pub fn pu_port_set_name(context_id: &str, mark: u32) -> String {
    port_set_name(context_id, Some(mark), PU_PORT_SET_PREFIX)
}

/// Name of the proxied-services set of a PU.
#[must_use]
pub fn proxy_set_name(context_id: &str, mark: Option<u32>) -> String {
    port_set_name(context_id, mark, PROXY_SET_PREFIX)
}

/// Destination and source member sets of a proxied-services set.
#[must_use]
pub fn proxy_set_pair(base: &str) -> (String, String) {
    (format!("{base}-dst"), format!("{base}-src"))
}
