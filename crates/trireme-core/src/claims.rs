//! Identity claims asserted by a Processing Unit.
//!
//! A claim set is an unordered collection of string key/value pairs.
//! Matching is order-insensitive; signing and hashing use the canonical
//! (sorted) encoding so that two equal sets always serialize identically.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved claim key carrying the namespace of the PU.
pub const NAMESPACE_KEY: &str = "$namespace";

/// Reserved claim key carrying the management identity of the PU.
///
/// This is the transmitter-context label: the value identifies the PU
/// that issued a token.
pub const ID_KEY: &str = "$id";

/// Reserved claim key carrying server ports owned by the PU.
pub const PORT_KEY: &str = "$sys:port";

/// Errors produced when decoding a compact claims block.
#[derive(Debug, Error)]
pub enum ClaimsError {
    /// The compact encoding was truncated or structurally invalid.
    #[error("malformed claims block at offset {offset}")]
    Malformed {
        /// Byte offset where decoding failed.
        offset: usize,
    },

    /// A key or value exceeded the one-byte length prefix.
    #[error("claim entry too long: {len} bytes (max 255)")]
    EntryTooLong {
        /// Length of the offending entry.
        len: usize,
    },

    /// A key or value was not valid UTF-8.
    #[error("claim entry is not valid UTF-8")]
    InvalidUtf8,
}

/// An unordered set of string key/value identity claims.
///
/// Internally kept sorted by key so canonical encodings are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSet {
    claims: BTreeMap<String, String>,
}

impl ClaimSet {
    /// Creates an empty claim set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for a claim key, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.claims.get(key).map(String::as_str)
    }

    /// Inserts a claim, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.claims.insert(key.into(), value.into());
    }

    /// Merges all claims from `other` into this set.
    ///
    /// Claims in `other` win on key conflicts.
    pub fn merge(&mut self, other: &Self) {
        for (k, v) in &other.claims {
            self.claims.insert(k.clone(), v.clone());
        }
    }

    /// Returns the number of claims.
    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Returns `true` if the set holds no claims.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Iterates over `(key, value)` pairs in canonical (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.claims.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Canonical byte encoding used as signing input.
    ///
    /// Identical sets always produce identical bytes regardless of
    /// insertion order.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.to_compact().unwrap_or_default()
    }

    /// Compact wire encoding: entry count followed by
    /// length-prefixed key and value bytes per entry.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimsError::EntryTooLong`] if a key or value exceeds
    /// 255 bytes, or if the set holds more than 255 entries.
    pub fn to_compact(&self) -> Result<Vec<u8>, ClaimsError> {
        if self.claims.len() > usize::from(u8::MAX) {
            return Err(ClaimsError::EntryTooLong {
                len: self.claims.len(),
            });
        }

        let mut out = Vec::with_capacity(1 + self.claims.len() * 8);
        #[allow(clippy::cast_possible_truncation)]
        out.push(self.claims.len() as u8);

        for (k, v) in &self.claims {
            for s in [k, v] {
                let bytes = s.as_bytes();
                if bytes.len() > usize::from(u8::MAX) {
                    return Err(ClaimsError::EntryTooLong { len: bytes.len() });
                }
                #[allow(clippy::cast_possible_truncation)]
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
            }
        }

        Ok(out)
    }

    /// Decodes a compact claims block produced by [`Self::to_compact`].
    ///
    /// # Errors
    ///
    /// Returns [`ClaimsError::Malformed`] on truncation and
    /// [`ClaimsError::InvalidUtf8`] on non-UTF-8 entries.
    pub fn from_compact(bytes: &[u8]) -> Result<Self, ClaimsError> {
        let mut claims = BTreeMap::new();
        let mut offset = 0usize;

        let count = *bytes.first().ok_or(ClaimsError::Malformed { offset })?;
        offset += 1;

        for _ in 0..count {
            let key = read_entry(bytes, &mut offset)?;
            let value = read_entry(bytes, &mut offset)?;
            claims.insert(key, value);
        }

        if offset != bytes.len() {
            return Err(ClaimsError::Malformed { offset });
        }

        Ok(Self { claims })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ClaimSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            claims: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn read_entry(bytes: &[u8], offset: &mut usize) -> Result<String, ClaimsError> {
    let len = usize::from(
        *bytes
            .get(*offset)
            .ok_or(ClaimsError::Malformed { offset: *offset })?,
    );
    *offset += 1;

    let end = *offset + len;
    let slice = bytes
        .get(*offset..end)
        .ok_or(ClaimsError::Malformed { offset: *offset })?;
    *offset = end;

    String::from_utf8(slice.to_vec()).map_err(|_| ClaimsError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order_is_insertion_independent() {
        let mut a = ClaimSet::new();
        a.insert("role", "web");
        a.insert("app", "frontend");

        let mut b = ClaimSet::new();
        b.insert("app", "frontend");
        b.insert("role", "web");

        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn test_compact_round_trip() {
        let claims: ClaimSet = [(ID_KEY, "pu-1"), (NAMESPACE_KEY, "/ns"), ("role", "db")]
            .into_iter()
            .collect();

        let encoded = claims.to_compact().unwrap();
        let decoded = ClaimSet::from_compact(&encoded).unwrap();

        assert_eq!(claims, decoded);
    }

    #[test]
    fn test_truncated_block_is_malformed() {
        let claims: ClaimSet = [("role", "web")].into_iter().collect();
        let mut encoded = claims.to_compact().unwrap();
        encoded.truncate(encoded.len() - 1);

        assert!(matches!(
            ClaimSet::from_compact(&encoded),
            Err(ClaimsError::Malformed { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let claims: ClaimSet = [("role", "web")].into_iter().collect();
        let mut encoded = claims.to_compact().unwrap();
        encoded.push(0);

        assert!(matches!(
            ClaimSet::from_compact(&encoded),
            Err(ClaimsError::Malformed { .. })
        ));
    }

    #[test]
    fn test_merge_overwrites() {
        let mut base: ClaimSet = [("role", "web")].into_iter().collect();
        let other: ClaimSet = [("role", "db"), ("tier", "1")].into_iter().collect();

        base.merge(&other);

        assert_eq!(base.get("role"), Some("db"));
        assert_eq!(base.get("tier"), Some("1"));
    }
}
