//! Signing material for authentication tokens.
//!
//! Three profiles are supported:
//!
//! - **PSK**: a pre-shared HMAC-SHA256 key
//! - **PKI**: ECDSA over P-256 with an issuer identifier resolved
//!   against a trust-anchor map
//! - **Compact PKI**: ECDSA over P-256 where a 4-byte key id substitutes
//!   for the issuer chain; the verifier resolves it from a local
//!   token-CA cache
//!
//! Secrets are hot-swappable: [`SharedSecrets`] publishes the active
//! material with an atomic pointer replacement, so existing authorized
//! connections are unaffected and the next handshake picks up the new
//! material.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::Arc;

use base64::Engine as _;
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey as _, DecodePublicKey as _};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Truncated HMAC tag length for PSK tokens (96 bits).
pub const PSK_TAG_LEN: usize = 12;

/// Raw P-256 signature length.
pub const ECDSA_SIG_LEN: usize = 64;

/// Length of a compact-PKI key identifier.
pub const KEY_ID_LEN: usize = 4;

/// Errors produced by signing and verification.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// No signing key is currently configured.
    #[error("no current signing key")]
    KeyUnavailable,

    /// The token's issuer reference did not resolve to a trust anchor.
    #[error("untrusted issuer: {issuer}")]
    UntrustedIssuer {
        /// The unresolved issuer reference.
        issuer: String,
    },

    /// Signature or MAC verification failed.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// The issuer reference or signature had the wrong shape for the
    /// active profile.
    #[error("malformed signature material")]
    Malformed,

    /// A declarative secrets spec could not be built.
    #[error("invalid secrets spec: {reason}")]
    InvalidSpec {
        /// What was wrong.
        reason: String,
    },
}

/// Signing profile identifier, carried in the token header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecretsKind {
    /// Pre-shared key HMAC.
    Psk = 0,
    /// ECDSA with issuer reference resolved against trust anchors.
    Pki = 1,
    /// ECDSA with a key id resolved against the token-CA cache.
    CompactPki = 2,
}

impl SecretsKind {
    /// Decodes a profile identifier from a token header.
    #[must_use]
    pub const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Psk),
            1 => Some(Self::Pki),
            2 => Some(Self::CompactPki),
            _ => None,
        }
    }
}

/// Pre-shared-key HMAC material.
pub struct PskSecrets {
    key: Zeroizing<Vec<u8>>,
}

/// ECDSA material with a full issuer reference.
pub struct PkiSecrets {
    signing: SigningKey,
    issuer_id: String,
    anchors: HashMap<String, VerifyingKey>,
}

/// ECDSA material with a compact key id and token-CA cache.
pub struct CompactPkiSecrets {
    signing: SigningKey,
    key_id: [u8; KEY_ID_LEN],
    token_ca: HashMap<[u8; KEY_ID_LEN], VerifyingKey>,
}

/// Active signing material in one of the three profiles.
pub enum Secrets {
    /// Pre-shared key HMAC.
    Psk(PskSecrets),
    /// ECDSA PKI.
    Pki(PkiSecrets),
    /// Compact ECDSA PKI.
    CompactPki(CompactPkiSecrets),
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches logs.
        f.write_str(match self {
            Self::Psk(_) => "Secrets::Psk",
            Self::Pki(_) => "Secrets::Pki",
            Self::CompactPki(_) => "Secrets::CompactPki",
        })
    }
}

impl Secrets {
    /// Creates PSK secrets from a shared key.
    #[must_use]
    pub fn psk(key: Vec<u8>) -> Self {
        Self::Psk(PskSecrets {
            key: Zeroizing::new(key),
        })
    }

    /// Creates PKI secrets from a signing key, issuer identifier, and
    /// trust anchors.
    #[must_use]
    pub fn pki(
        signing: SigningKey,
        issuer_id: impl Into<String>,
        anchors: HashMap<String, VerifyingKey>,
    ) -> Self {
        let issuer_id = issuer_id.into();
        let mut anchors = anchors;
        // The local identity always trusts itself.
        anchors.insert(issuer_id.clone(), *signing.verifying_key());
        Self::Pki(PkiSecrets {
            signing,
            issuer_id,
            anchors,
        })
    }

    /// Creates compact-PKI secrets from a signing key, key id, and
    /// token-CA cache.
    #[must_use]
    pub fn compact_pki(
        signing: SigningKey,
        key_id: [u8; KEY_ID_LEN],
        token_ca: HashMap<[u8; KEY_ID_LEN], VerifyingKey>,
    ) -> Self {
        let mut token_ca = token_ca;
        token_ca.insert(key_id, *signing.verifying_key());
        Self::CompactPki(CompactPkiSecrets {
            signing,
            key_id,
            token_ca,
        })
    }

    /// The profile of this material.
    #[must_use]
    pub const fn kind(&self) -> SecretsKind {
        match self {
            Self::Psk(_) => SecretsKind::Psk,
            Self::Pki(_) => SecretsKind::Pki,
            Self::CompactPki(_) => SecretsKind::CompactPki,
        }
    }

    /// The issuer reference embedded in issued tokens.
    ///
    /// Empty for PSK (the key is shared), the issuer id bytes for PKI,
    /// and the 4-byte key id for compact PKI.
    #[must_use]
    pub fn issuer_ref(&self) -> Vec<u8> {
        match self {
            Self::Psk(_) => Vec::new(),
            Self::Pki(s) => s.issuer_id.as_bytes().to_vec(),
            Self::CompactPki(s) => s.key_id.to_vec(),
        }
    }

    /// Signs `message`, returning a truncated HMAC tag (PSK) or a raw
    /// P-256 signature (PKI profiles).
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::KeyUnavailable`] if the PSK key is empty.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SecretsError> {
        match self {
            Self::Psk(s) => {
                if s.key.is_empty() {
                    return Err(SecretsError::KeyUnavailable);
                }
                let mut mac = HmacSha256::new_from_slice(&s.key)
                    .map_err(|_| SecretsError::KeyUnavailable)?;
                mac.update(message);
                let tag = mac.finalize().into_bytes();
                Ok(tag[..PSK_TAG_LEN].to_vec())
            },
            Self::Pki(s) => {
                let sig: Signature = s.signing.sign(message);
                Ok(sig.to_bytes().to_vec())
            },
            Self::CompactPki(s) => {
                let sig: Signature = s.signing.sign(message);
                Ok(sig.to_bytes().to_vec())
            },
        }
    }

    /// Verifies `signature` over `message` for the given issuer
    /// reference, returning the signer identity.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::UntrustedIssuer`] when the reference does
    /// not resolve and [`SecretsError::SignatureInvalid`] on a failed
    /// check.
    pub fn verify(
        &self,
        message: &[u8],
        signature: &[u8],
        issuer_ref: &[u8],
    ) -> Result<String, SecretsError> {
        match self {
            Self::Psk(s) => {
                if s.key.is_empty() {
                    return Err(SecretsError::KeyUnavailable);
                }
                let mut mac = HmacSha256::new_from_slice(&s.key)
                    .map_err(|_| SecretsError::KeyUnavailable)?;
                mac.update(message);
                let expected = mac.finalize().into_bytes();
                if signature.len() != PSK_TAG_LEN {
                    return Err(SecretsError::SignatureInvalid);
                }
                if expected[..PSK_TAG_LEN].ct_eq(signature).into() {
                    Ok("psk".to_string())
                } else {
                    Err(SecretsError::SignatureInvalid)
                }
            },
            Self::Pki(s) => {
                let issuer =
                    std::str::from_utf8(issuer_ref).map_err(|_| SecretsError::Malformed)?;
                let key = s
                    .anchors
                    .get(issuer)
                    .ok_or_else(|| SecretsError::UntrustedIssuer {
                        issuer: issuer.to_string(),
                    })?;
                verify_p256(key, message, signature)?;
                Ok(issuer.to_string())
            },
            Self::CompactPki(s) => {
                let key_id: [u8; KEY_ID_LEN] =
                    issuer_ref.try_into().map_err(|_| SecretsError::Malformed)?;
                let key =
                    s.token_ca
                        .get(&key_id)
                        .ok_or_else(|| SecretsError::UntrustedIssuer {
                            issuer: hex(&key_id),
                        })?;
                verify_p256(key, message, signature)?;
                Ok(hex(&key_id))
            },
        }
    }
}

fn verify_p256(
    key: &VerifyingKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), SecretsError> {
    let sig = Signature::from_slice(signature).map_err(|_| SecretsError::SignatureInvalid)?;
    key.verify(message, &sig)
        .map_err(|_| SecretsError::SignatureInvalid)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Declarative, serializable description of signing material.
///
/// This is what crosses the RPC boundary to a remote datapath and what
/// the daemon reads from its configuration; [`Secrets`] itself never
/// leaves the process that built it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "profile", rename_all = "snake_case")]
pub enum SecretsSpec {
    /// Pre-shared key, base64 encoded.
    Psk {
        /// The shared key.
        key_base64: String,
    },
    /// ECDSA PKI with PEM-encoded material.
    Pki {
        /// PKCS#8 PEM signing key.
        signing_key_pem: String,
        /// Issuer identifier of the local identity.
        issuer_id: String,
        /// Trust anchors: issuer id to SPKI PEM verifying key.
        anchors: HashMap<String, String>,
    },
    /// Compact ECDSA PKI with a token-CA cache.
    CompactPki {
        /// PKCS#8 PEM signing key.
        signing_key_pem: String,
        /// 4-byte key id, hex encoded.
        key_id_hex: String,
        /// Token-CA cache: hex key id to SPKI PEM verifying key.
        token_ca: HashMap<String, String>,
    },
}

impl SecretsSpec {
    /// Builds concrete [`Secrets`] from the spec.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::InvalidSpec`] on undecodable material.
    pub fn build(&self) -> Result<Secrets, SecretsError> {
        let invalid = |reason: &str| SecretsError::InvalidSpec {
            reason: reason.to_string(),
        };

        match self {
            Self::Psk { key_base64 } => {
                let key = base64::engine::general_purpose::STANDARD
                    .decode(key_base64)
                    .map_err(|_| invalid("psk key is not valid base64"))?;
                Ok(Secrets::psk(key))
            },
            Self::Pki {
                signing_key_pem,
                issuer_id,
                anchors,
            } => {
                let signing = SigningKey::from_pkcs8_pem(signing_key_pem)
                    .map_err(|_| invalid("signing key PEM is not a P-256 PKCS#8 key"))?;
                let mut anchor_keys = HashMap::new();
                for (issuer, pem) in anchors {
                    let key = VerifyingKey::from_public_key_pem(pem)
                        .map_err(|_| invalid("trust anchor PEM is not a P-256 public key"))?;
                    anchor_keys.insert(issuer.clone(), key);
                }
                Ok(Secrets::pki(signing, issuer_id.clone(), anchor_keys))
            },
            Self::CompactPki {
                signing_key_pem,
                key_id_hex,
                token_ca,
            } => {
                let signing = SigningKey::from_pkcs8_pem(signing_key_pem)
                    .map_err(|_| invalid("signing key PEM is not a P-256 PKCS#8 key"))?;
                let key_id = parse_key_id(key_id_hex)
                    .ok_or_else(|| invalid("key id is not 4 hex-encoded bytes"))?;
                let mut ca = HashMap::new();
                for (id, pem) in token_ca {
                    let id = parse_key_id(id)
                        .ok_or_else(|| invalid("token-CA key id is not 4 hex-encoded bytes"))?;
                    let key = VerifyingKey::from_public_key_pem(pem)
                        .map_err(|_| invalid("token-CA PEM is not a P-256 public key"))?;
                    ca.insert(id, key);
                }
                Ok(Secrets::compact_pki(signing, key_id, ca))
            },
        }
    }
}

fn parse_key_id(hex_id: &str) -> Option<[u8; KEY_ID_LEN]> {
    if hex_id.len() != KEY_ID_LEN * 2 || !hex_id.is_ascii() {
        return None;
    }
    let mut out = [0u8; KEY_ID_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex_id[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

/// Hot-swappable handle to the active [`Secrets`].
///
/// Readers clone the inner `Arc` once per handshake; writers replace it
/// atomically.
#[derive(Clone)]
pub struct SharedSecrets {
    inner: Arc<RwLock<Option<Arc<Secrets>>>>,
}

impl SharedSecrets {
    /// Creates a handle with active material.
    #[must_use]
    pub fn new(secrets: Secrets) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(Arc::new(secrets)))),
        }
    }

    /// Creates a handle with no material; [`Self::current`] fails until
    /// the first [`Self::swap`].
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    /// Returns the active material.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::KeyUnavailable`] before the first swap.
    pub fn current(&self) -> Result<Arc<Secrets>, SecretsError> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or(SecretsError::KeyUnavailable)
    }

    /// Replaces the active material.
    pub fn swap(&self, secrets: Secrets) {
        *self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::new(secrets));
    }
}
