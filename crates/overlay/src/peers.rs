use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt, HashSet};
use codec::address::Address;
use parking_lot::Mutex;

/// Sentinel expiry for peers that should be held indefinitely.
pub const NEVER_EXPIRE: Duration = Duration::from_secs(1024 * 24 * 60 * 60);

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Where an outgoing connection request currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Requested, no attempt made yet.
    Initial,
    /// An attempt is underway (or permitted right now).
    Connecting,
    /// The handshake completed.
    Connected,
    /// Waiting out the interval after a failed attempt.
    Backoff,
    /// Not requested and not connected.
    Closed,
}

/// How much the node trusts an address when selecting peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Confidence {
    #[default]
    Default,
    /// Never closed as surplus.
    Whitelist,
    /// Never dialed; closed if already connected.
    Blacklist,
}

/// A desired peer is known either by address (dialable once a uri for it
/// is learned) or directly by uri.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerKey {
    Address(Address),
    Uri(String),
}

#[derive(Debug, Clone)]
struct DesiredEntry {
    uri: Option<String>,
    /// `None` is the never-expire sentinel.
    expires_at: Option<Instant>,
    last_attempt: Option<Instant>,
    attempts: u32,
}

struct Inner {
    desired: HashMap<PeerKey, DesiredEntry>,
    confidence: HashMap<Address, Confidence>,
}

/// The set of peers this node *wants* outgoing connections to.
///
/// Clients and the tracker write the set; each maintenance tick compares
/// it against the live connections and emits dial requests for the gaps,
/// with exponential backoff per entry between attempts.
pub struct PeerConnectionList {
    inner: Mutex<Inner>,
}

impl Default for PeerConnectionList {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                desired: HashMap::new(),
                confidence: HashMap::new(),
            }),
        }
    }
}

impl PeerConnectionList {
    /// Add or refresh a desired peer. A zero (already past) expiry is a
    /// no-op; [`NEVER_EXPIRE`] and anything beyond it never expires.
    pub fn add_desired(
        &self,
        key: PeerKey,
        uri_hint: Option<String>,
        expire_in: Duration,
        now: Instant,
    ) {
        if expire_in == Duration::ZERO {
            return;
        }

        let expires_at = if expire_in >= NEVER_EXPIRE {
            None
        } else {
            now.checked_add(expire_in)
        };

        let mut inner = self.inner.lock();
        let entry = inner.desired.entry(key).or_insert(DesiredEntry {
            uri: None,
            expires_at,
            last_attempt: None,
            attempts: 0,
        });

        if uri_hint.is_some() {
            entry.uri = uri_hint;
        }

        // Extend, never shorten, the lifetime of an existing entry.
        entry.expires_at = match (entry.expires_at, expires_at) {
            (Some(current), Some(new)) => Some(current.max(new)),
            _ => None,
        };
    }

    pub fn remove_desired(&self, key: &PeerKey) {
        self.inner.lock().desired.remove(key);
    }

    pub fn set_confidence(&self, address: Address, confidence: Confidence) {
        let mut inner = self.inner.lock();

        if confidence == Confidence::Default {
            inner.confidence.remove(&address);
        } else {
            inner.confidence.insert(address, confidence);
        }

        if confidence == Confidence::Blacklist {
            inner.desired.remove(&PeerKey::Address(address));
        }
    }

    pub fn confidence(&self, address: &Address) -> Confidence {
        self.inner
            .lock()
            .confidence
            .get(address)
            .copied()
            .unwrap_or_default()
    }

    pub fn blacklisted(&self) -> Vec<Address> {
        self.inner
            .lock()
            .confidence
            .iter()
            .filter(|(_, confidence)| **confidence == Confidence::Blacklist)
            .map(|(address, _)| *address)
            .collect()
    }

    pub fn is_whitelisted(&self, address: &Address) -> bool {
        self.confidence(address) == Confidence::Whitelist
    }

    /// Addresses the node has been asked to connect to and has not yet
    /// dropped.
    pub fn requested_addresses(&self) -> Vec<Address> {
        self.inner
            .lock()
            .desired
            .keys()
            .filter_map(|key| match key {
                PeerKey::Address(address) => Some(*address),
                PeerKey::Uri(_) => None,
            })
            .collect()
    }

    pub fn is_requested(&self, address: &Address) -> bool {
        self.inner
            .lock()
            .desired
            .contains_key(&PeerKey::Address(*address))
    }

    pub fn is_requested_uri(&self, uri: &str) -> bool {
        self.inner
            .lock()
            .desired
            .contains_key(&PeerKey::Uri(uri.to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().desired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().desired.is_empty()
    }

    /// Drop entries whose expiry has passed. An expiry exactly at `now`
    /// is already eligible.
    pub fn expire(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.desired.len();

        inner
            .desired
            .retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));

        before - inner.desired.len()
    }

    /// The request-side state of an address: where its desired entry
    /// stands, ignoring live connections (the register knows those).
    pub fn state_of(&self, address: &Address, now: Instant) -> ConnectionState {
        let inner = self.inner.lock();

        let Some(entry) = inner.desired.get(&PeerKey::Address(*address)) else {
            return ConnectionState::Closed;
        };

        let Some(last) = entry.last_attempt else {
            return ConnectionState::Initial;
        };

        let exponent = entry.attempts.min(6);
        let delay = (BACKOFF_BASE * 2u32.pow(exponent)).min(BACKOFF_MAX);

        if now.duration_since(last) < delay {
            ConnectionState::Backoff
        } else {
            ConnectionState::Connecting
        }
    }

    /// A successful handshake resets the entry's backoff so a later drop
    /// reconnects promptly.
    pub fn mark_connected(&self, address: Option<&Address>, uri: Option<&str>) {
        let mut inner = self.inner.lock();

        let mut reset = |key: &PeerKey| {
            if let Some(entry) = inner.desired.get_mut(key) {
                entry.attempts = 0;
                entry.last_attempt = None;
            }
        };

        if let Some(address) = address {
            reset(&PeerKey::Address(*address));
        }
        if let Some(uri) = uri {
            reset(&PeerKey::Uri(uri.to_string()));
        }
    }

    /// The uris to dial this tick: desired peers that are not connected,
    /// not blacklisted, past their backoff, and whose uri is known or
    /// resolvable.
    pub fn dial_candidates(
        &self,
        now: Instant,
        connected_addresses: &HashSet<Address>,
        connected_uris: &HashSet<String>,
        resolve: impl Fn(&Address) -> Option<String>,
    ) -> Vec<String> {
        let mut inner = self.inner.lock();
        let Inner {
            desired,
            confidence,
        } = &mut *inner;

        let mut dials = Vec::new();

        for (key, entry) in desired.iter_mut() {
            let uri = match key {
                PeerKey::Address(address) => {
                    if connected_addresses.contains(address) {
                        continue;
                    }
                    if confidence.get(address) == Some(&Confidence::Blacklist) {
                        continue;
                    }

                    match entry.uri.clone().or_else(|| resolve(address)) {
                        Some(uri) => uri,
                        None => continue,
                    }
                }
                PeerKey::Uri(uri) => {
                    if connected_uris.contains(uri) {
                        continue;
                    }

                    uri.clone()
                }
            };

            if connected_uris.contains(&uri) {
                continue;
            }

            if let Some(last) = entry.last_attempt {
                let exponent = entry.attempts.min(6);
                let delay = (BACKOFF_BASE * 2u32.pow(exponent)).min(BACKOFF_MAX);
                if now.duration_since(last) < delay {
                    continue;
                }
            }

            entry.last_attempt = Some(now);
            entry.attempts += 1;
            dials.push(uri);
        }

        dials
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ahash::HashSetExt;

    fn address(byte: u8) -> Address {
        Address::new([byte; 32])
    }

    fn no_resolver(_: &Address) -> Option<String> {
        None
    }

    #[test]
    fn zero_expiry_is_a_no_op() {
        let peers = PeerConnectionList::default();
        peers.add_desired(
            PeerKey::Uri("tcp://127.0.0.1:1337".into()),
            None,
            Duration::ZERO,
            Instant::now(),
        );

        assert!(peers.is_empty());
    }

    #[test]
    fn expiry_at_current_time_is_eligible() {
        let peers = PeerConnectionList::default();
        let now = Instant::now();

        peers.add_desired(
            PeerKey::Address(address(1)),
            None,
            Duration::from_secs(5),
            now,
        );

        assert_eq!(peers.expire(now), 0);
        assert_eq!(peers.expire(now + Duration::from_secs(5)), 1);
        assert!(peers.is_empty());
    }

    #[test]
    fn never_expire_survives_any_tick() {
        let peers = PeerConnectionList::default();
        let now = Instant::now();

        peers.add_desired(PeerKey::Address(address(1)), None, NEVER_EXPIRE, now);

        assert_eq!(peers.expire(now + Duration::from_secs(3600)), 0);
        assert!(peers.is_requested(&address(1)));
    }

    #[test]
    fn dial_candidates_respect_backoff() {
        let peers = PeerConnectionList::default();
        let now = Instant::now();
        let uri = "tcp://127.0.0.1:1337".to_string();

        peers.add_desired(PeerKey::Uri(uri.clone()), None, NEVER_EXPIRE, now);

        let connected = HashSet::new();
        let uris = HashSet::new();

        assert_eq!(
            peers.dial_candidates(now, &connected, &uris, no_resolver),
            vec![uri.clone()]
        );

        // An immediate retry is suppressed by the backoff.
        assert!(
            peers
                .dial_candidates(now + Duration::from_millis(100), &connected, &uris, no_resolver)
                .is_empty()
        );

        // After the first interval it is dialable again.
        assert_eq!(
            peers
                .dial_candidates(now + Duration::from_secs(2), &connected, &uris, no_resolver)
                .len(),
            1
        );
    }

    #[test]
    fn connected_and_blacklisted_peers_are_not_dialed() {
        let peers = PeerConnectionList::default();
        let now = Instant::now();

        peers.add_desired(
            PeerKey::Address(address(1)),
            Some("tcp://127.0.0.1:1000".into()),
            NEVER_EXPIRE,
            now,
        );
        peers.add_desired(
            PeerKey::Address(address(2)),
            Some("tcp://127.0.0.1:2000".into()),
            NEVER_EXPIRE,
            now,
        );
        peers.set_confidence(address(2), Confidence::Blacklist);

        let mut connected = HashSet::new();
        connected.insert(address(1));
        let uris = HashSet::new();

        assert!(
            peers
                .dial_candidates(now, &connected, &uris, no_resolver)
                .is_empty()
        );
    }

    #[test]
    fn address_entries_resolve_uris_through_the_table() {
        let peers = PeerConnectionList::default();
        let now = Instant::now();

        peers.add_desired(PeerKey::Address(address(7)), None, NEVER_EXPIRE, now);

        let connected = HashSet::new();
        let uris = HashSet::new();

        // Unknown uri: nothing to dial yet.
        assert!(
            peers
                .dial_candidates(now, &connected, &uris, no_resolver)
                .is_empty()
        );

        let dials = peers.dial_candidates(now, &connected, &uris, |_| {
            Some("tcp://127.0.0.1:7000".into())
        });
        assert_eq!(dials, vec!["tcp://127.0.0.1:7000".to_string()]);
    }

    #[test]
    fn blacklisting_removes_the_desired_entry() {
        let peers = PeerConnectionList::default();

        peers.add_desired(
            PeerKey::Address(address(3)),
            None,
            NEVER_EXPIRE,
            Instant::now(),
        );
        peers.set_confidence(address(3), Confidence::Blacklist);

        assert!(!peers.is_requested(&address(3)));
        assert_eq!(peers.blacklisted(), vec![address(3)]);
    }
}
