//! Per-flow connection state store.
//!
//! Keyed by (4-tuple, direction) and sharded by key hash: each shard
//! owns its own mutex, so packet workers on different flows do not
//! contend. Every shard keeps a FIFO of expiry deadlines next to its
//! map, making `expire` O(expired entries) instead of a full scan.
//! Entries whose deadline was extended are re-enqueued lazily when the
//! stale deadline surfaces.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::claims::ClaimSet;
use crate::packet::FourTuple;

/// Default TTL of an in-progress handshake entry.
pub const HANDSHAKE_TTL: Duration = Duration::from_secs(3);

/// Default TTL of an external-service cache entry.
pub const EXTERNAL_TTL: Duration = Duration::from_secs(600);

const SHARD_COUNT: usize = 64;

/// Which side of the PU a state-machine instance runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Outbound from the PU (application side).
    App,
    /// Inbound to the PU (network side).
    Net,
}

/// Authentication progress of one flow direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Own SYN stamped and emitted.
    SynSent,
    /// Peer SYN seen and verified (inbound side).
    SynReceived,
    /// Peer SYN/ACK verified, own ACK stamped.
    AckProcessed,
    /// Handshake complete; flow authorized.
    Authorized,
    /// Handshake failed; flow rejected.
    Rejected,
}

/// Key of a connection entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    /// The flow 4-tuple as seen by the local PU.
    pub tuple: FourTuple,
    /// Which side of the PU this entry tracks.
    pub direction: Direction,
}

/// State carried by one flow direction.
#[derive(Debug)]
pub struct ConnEntry {
    /// Authentication progress.
    pub state: ConnState,
    /// Context of the local PU that owns the flow.
    pub context_id: String,
    /// The peer's claims, once a token verified.
    pub peer_claims: Option<ClaimSet>,
    /// Policy rule that decided the flow, for the final flow event.
    pub policy_id: Option<String>,
    /// Observed (shadow) policy rule, if an observe rule matched.
    pub observed_policy_id: Option<String>,
    /// Token stamped on the SYN, re-inserted on retransmission.
    pub syn_token: Option<Vec<u8>>,
    /// Token stamped on the SYN/ACK, re-inserted on retransmission.
    pub synack_token: Option<Vec<u8>>,
    /// Set for unauthenticated external-service flows admitted by ACL.
    pub external: bool,
    /// Retransmissions seen while in the current state.
    pub retries: u32,
    /// Creation time.
    pub created: Instant,
    expires_at: Instant,
}

impl ConnEntry {
    fn new(context_id: String, now: Instant, ttl: Duration) -> Self {
        Self {
            state: ConnState::SynSent,
            context_id,
            peer_claims: None,
            policy_id: None,
            observed_policy_id: None,
            syn_token: None,
            synack_token: None,
            external: false,
            retries: 0,
            created: now,
            expires_at: now + ttl,
        }
    }
}

type SharedEntry = Arc<Mutex<ConnEntry>>;

struct Shard {
    map: HashMap<ConnKey, SharedEntry>,
    deadlines: VecDeque<(Instant, ConnKey)>,
}

impl Shard {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            deadlines: VecDeque::new(),
        }
    }
}

/// Sharded connection table.
pub struct ConnTable {
    shards: Vec<Mutex<Shard>>,
    sweep_cursor: AtomicUsize,
}

impl Default for ConnTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::new())).collect(),
            sweep_cursor: AtomicUsize::new(0),
        }
    }

    fn shard(&self, key: &ConnKey) -> &Mutex<Shard> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() as usize) & (SHARD_COUNT - 1);
        &self.shards[index]
    }

    /// Returns the entry for `key`, creating it atomically if absent.
    ///
    /// The boolean is `true` if the entry was created by this call.
    pub fn get_or_create(
        &self,
        key: ConnKey,
        context_id: &str,
        now: Instant,
        ttl: Duration,
    ) -> (SharedEntry, bool) {
        let mut shard = lock(self.shard(&key));

        if let Some(entry) = shard.map.get(&key) {
            return (Arc::clone(entry), false);
        }

        let entry = Arc::new(Mutex::new(ConnEntry::new(context_id.to_string(), now, ttl)));
        shard.map.insert(key, Arc::clone(&entry));
        shard.deadlines.push_back((now + ttl, key));
        (entry, true)
    }

    /// Returns the entry for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &ConnKey) -> Option<SharedEntry> {
        lock(self.shard(key)).map.get(key).cloned()
    }

    /// Removes the entry for `key`.
    pub fn remove(&self, key: &ConnKey) {
        lock(self.shard(key)).map.remove(key);
    }

    /// Extends the deadline of `key` to at least `now + ttl`.
    ///
    /// Used when a handshake makes progress so the entry survives the
    /// next sweep. Never shortens a longer remaining deadline.
    pub fn refresh(&self, key: &ConnKey, now: Instant, ttl: Duration) {
        let mut shard = lock(self.shard(key));
        if let Some(entry) = shard.map.get(key) {
            let mut entry = lock(entry);
            let deadline = now + ttl;
            if deadline > entry.expires_at {
                entry.expires_at = deadline;
                drop(entry);
                shard.deadlines.push_back((deadline, *key));
            }
        }
    }

    /// Sweeps the next shard, removing entries whose deadline passed.
    ///
    /// Returns the number of entries removed. Each call takes exactly
    /// one shard mutex.
    pub fn expire_next_shard(&self, now: Instant) -> usize {
        let index = self.sweep_cursor.fetch_add(1, Ordering::Relaxed) % SHARD_COUNT;
        let mut shard = lock(&self.shards[index]);
        let mut removed = 0;

        while let Some(&(deadline, key)) = shard.deadlines.front() {
            if deadline > now {
                break;
            }
            shard.deadlines.pop_front();

            // A later refresh supersedes this deadline.
            let live = shard
                .map
                .get(&key)
                .map(|entry| lock(entry).expires_at > now);
            match live {
                Some(true) | None => {},
                Some(false) => {
                    shard.map.remove(&key);
                    removed += 1;
                },
            }
        }

        removed
    }

    /// Sweeps every shard once.
    pub fn expire_all(&self, now: Instant) -> usize {
        (0..SHARD_COUNT)
            .map(|_| self.expire_next_shard(now))
            .sum()
    }

    /// Total number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| lock(s).map.len()).sum()
    }

    /// Returns `true` if the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn key(port: u16) -> ConnKey {
        ConnKey {
            tuple: FourTuple {
                src_ip: Ipv4Addr::new(10, 0, 0, 1),
                src_port: port,
                dst_ip: Ipv4Addr::new(10, 0, 0, 2),
                dst_port: 80,
            },
            direction: Direction::App,
        }
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let table = ConnTable::new();
        let now = Instant::now();

        let (first, created) = table.get_or_create(key(1), "ctx", now, HANDSHAKE_TTL);
        assert!(created);

        let (second, created) = table.get_or_create(key(1), "ctx", now, HANDSHAKE_TTL);
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_directions_are_distinct_entries() {
        let table = ConnTable::new();
        let now = Instant::now();

        let mut net_key = key(1);
        net_key.direction = Direction::Net;

        table.get_or_create(key(1), "ctx", now, HANDSHAKE_TTL);
        table.get_or_create(net_key, "ctx", now, HANDSHAKE_TTL);

        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_expiry_removes_stale_entries() {
        let table = ConnTable::new();
        let now = Instant::now();

        for port in 0..10 {
            table.get_or_create(key(port), "ctx", now, HANDSHAKE_TTL);
        }
        assert_eq!(table.len(), 10);

        let later = now + HANDSHAKE_TTL + Duration::from_millis(1);
        let removed = table.expire_all(later);

        assert_eq!(removed, 10);
        assert!(table.is_empty());
    }

    #[test]
    fn test_refresh_survives_sweep() {
        let table = ConnTable::new();
        let now = Instant::now();

        table.get_or_create(key(1), "ctx", now, HANDSHAKE_TTL);
        table.refresh(&key(1), now + Duration::from_secs(1), HANDSHAKE_TTL);

        let after_first_deadline = now + HANDSHAKE_TTL + Duration::from_millis(1);
        table.expire_all(after_first_deadline);
        assert_eq!(table.len(), 1, "refreshed entry must survive");

        let after_second_deadline = now + Duration::from_secs(5);
        table.expire_all(after_second_deadline);
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove() {
        let table = ConnTable::new();
        let now = Instant::now();

        table.get_or_create(key(1), "ctx", now, HANDSHAKE_TTL);
        table.remove(&key(1));

        assert!(table.get(&key(1)).is_none());
    }

    #[test]
    fn test_expiry_is_scan_free_per_call() {
        let table = ConnTable::new();
        let now = Instant::now();

        table.get_or_create(key(1), "ctx", now, HANDSHAKE_TTL);

        // Nothing expired: sweep touches deadlines, removes nothing.
        assert_eq!(table.expire_all(now), 0);
        assert_eq!(table.len(), 1);
    }
}
