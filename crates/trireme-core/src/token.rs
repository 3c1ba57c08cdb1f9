//! Authentication token codec.
//!
//! A token is a compact, signed, time-bounded carrier of identity
//! claims, small enough to ride inside a TCP option. Wire layout:
//!
//! ```text
//! byte 0      version (high nibble) | profile (low nibble)
//! bytes 1..5  issued-at, u32 unix seconds, big endian
//! bytes 5..9  random nonce
//! byte 9      issuer-reference length
//! bytes ..    issuer reference (absent for PSK)
//! byte  n     claims block length
//! bytes ..    compact claims block
//! bytes ..    signature: truncated HMAC tag (PSK) or raw P-256
//! ```
//!
//! The signature covers every byte before it, binding the profile,
//! timestamp, nonce, issuer, and claims together.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use thiserror::Error;

use crate::claims::ClaimSet;
use crate::secrets::{SecretsError, SecretsKind, SharedSecrets, ECDSA_SIG_LEN, PSK_TAG_LEN};

/// Current token wire version.
pub const TOKEN_VERSION: u8 = 1;

/// Nonce length.
pub const NONCE_LEN: usize = 4;

/// Default token validity window.
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(60);

/// Errors produced by token issue and verification.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token bytes were structurally invalid.
    #[error("malformed token")]
    Malformed,

    /// The token was issued outside the validity window.
    #[error("stale token: issued {issued_at}, now {now}")]
    Stale {
        /// Issued-at, unix seconds.
        issued_at: u64,
        /// Verification time, unix seconds.
        now: u64,
    },

    /// The issuer reference did not resolve to trusted material.
    #[error("untrusted issuer: {issuer}")]
    UntrustedIssuer {
        /// The unresolved issuer reference.
        issuer: String,
    },

    /// Signature or MAC verification failed.
    #[error("token signature invalid")]
    SignatureInvalid,

    /// No signing key is currently configured.
    #[error("no current signing key")]
    KeyUnavailable,
}

impl From<SecretsError> for TokenError {
    fn from(err: SecretsError) -> Self {
        match err {
            SecretsError::KeyUnavailable => Self::KeyUnavailable,
            SecretsError::UntrustedIssuer { issuer } => Self::UntrustedIssuer { issuer },
            SecretsError::SignatureInvalid => Self::SignatureInvalid,
            SecretsError::Malformed => Self::Malformed,
            SecretsError::InvalidSpec { .. } => Self::Malformed,
        }
    }
}

/// A successfully verified token.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    /// The sender's claims.
    pub claims: ClaimSet,
    /// Identity of the signer (issuer id, key id, or `"psk"`).
    pub signer: String,
    /// The token's nonce.
    pub nonce: [u8; NONCE_LEN],
}

/// Issues and verifies authentication tokens against hot-swappable
/// secrets.
#[derive(Clone)]
pub struct TokenCodec {
    secrets: SharedSecrets,
    validity: Duration,
}

impl TokenCodec {
    /// Creates a codec with the given validity window.
    #[must_use]
    pub fn new(secrets: SharedSecrets, validity: Duration) -> Self {
        Self { secrets, validity }
    }

    /// The configured validity window.
    #[must_use]
    pub const fn validity(&self) -> Duration {
        self.validity
    }

    /// Issues a token over `claims` at time `now`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::KeyUnavailable`] without current signing
    /// material and [`TokenError::Malformed`] if the claims cannot be
    /// compactly encoded.
    pub fn issue(&self, claims: &ClaimSet, now: SystemTime) -> Result<Vec<u8>, TokenError> {
        let secrets = self.secrets.current()?;

        let issuer_ref = secrets.issuer_ref();
        if issuer_ref.len() > usize::from(u8::MAX) {
            return Err(TokenError::Malformed);
        }
        let claims_block = claims.to_compact().map_err(|_| TokenError::Malformed)?;
        if claims_block.len() > usize::from(u8::MAX) {
            return Err(TokenError::Malformed);
        }

        let issued_at = unix_seconds(now);
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut out = Vec::with_capacity(11 + issuer_ref.len() + claims_block.len() + 16);
        out.push((TOKEN_VERSION << 4) | secrets.kind() as u8);
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(issued_at as u32).to_be_bytes());
        out.extend_from_slice(&nonce);
        #[allow(clippy::cast_possible_truncation)]
        out.push(issuer_ref.len() as u8);
        out.extend_from_slice(&issuer_ref);
        #[allow(clippy::cast_possible_truncation)]
        out.push(claims_block.len() as u8);
        out.extend_from_slice(&claims_block);

        let signature = secrets.sign(&out)?;
        out.extend_from_slice(&signature);

        Ok(out)
    }

    /// Verifies a token at time `now`.
    ///
    /// # Errors
    ///
    /// Returns the corresponding [`TokenError`] on malformed bytes,
    /// staleness, an untrusted issuer, or a bad signature.
    pub fn verify(&self, token: &[u8], now: SystemTime) -> Result<VerifiedToken, TokenError> {
        let secrets = self.secrets.current()?;

        let header = *token.first().ok_or(TokenError::Malformed)?;
        if header >> 4 != TOKEN_VERSION {
            return Err(TokenError::Malformed);
        }
        let profile = SecretsKind::from_wire(header & 0x0f).ok_or(TokenError::Malformed)?;
        if profile != secrets.kind() {
            return Err(TokenError::Malformed);
        }

        let sig_len = match profile {
            SecretsKind::Psk => PSK_TAG_LEN,
            SecretsKind::Pki | SecretsKind::CompactPki => ECDSA_SIG_LEN,
        };

        let mut offset = 1usize;
        let issued_at = u64::from(u32::from_be_bytes(
            read(token, &mut offset, 4)?.try_into().map_err(|_| TokenError::Malformed)?,
        ));
        let nonce: [u8; NONCE_LEN] = read(token, &mut offset, NONCE_LEN)?
            .try_into()
            .map_err(|_| TokenError::Malformed)?;

        let issuer_len = usize::from(*token.get(offset).ok_or(TokenError::Malformed)?);
        offset += 1;
        let issuer_ref = read(token, &mut offset, issuer_len)?.to_vec();

        let claims_len = usize::from(*token.get(offset).ok_or(TokenError::Malformed)?);
        offset += 1;
        let claims_block = read(token, &mut offset, claims_len)?.to_vec();

        let signed = &token[..offset];
        let signature = token.get(offset..).ok_or(TokenError::Malformed)?;
        if signature.len() != sig_len {
            return Err(TokenError::Malformed);
        }

        // Authenticate before trusting any decoded content.
        let signer = secrets.verify(signed, signature, &issuer_ref)?;

        let now_secs = unix_seconds(now);
        if now_secs.abs_diff(issued_at) > self.validity.as_secs() {
            return Err(TokenError::Stale {
                issued_at,
                now: now_secs,
            });
        }

        let claims = ClaimSet::from_compact(&claims_block).map_err(|_| TokenError::Malformed)?;

        Ok(VerifiedToken {
            claims,
            signer,
            nonce,
        })
    }
}

fn read<'a>(buf: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], TokenError> {
    let end = offset.checked_add(len).ok_or(TokenError::Malformed)?;
    let slice = buf.get(*offset..end).ok_or(TokenError::Malformed)?;
    *offset = end;
    Ok(slice)
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
