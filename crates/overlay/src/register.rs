use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt, HashSet};
use bytes::Bytes;
use codec::address::Address;
use parking_lot::RwLock;

use crate::sink::{PacketSink, SinkError};

/// Window within which repeated connection errors accumulate before the
/// counter resets.
const ERROR_WINDOW: Duration = Duration::from_secs(60);

/// Opaque identifier of a live connection, stable for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

struct Entry {
    sink: Arc<dyn PacketSink>,
    direction: Direction,
    /// Learned exactly once, when the handshake identifies the peer.
    address: Option<Address>,
    /// The uri this link was dialed on, for outgoing connections.
    uri: Option<String>,
    connected_at: Instant,
    errors: u32,
    last_error: Option<Instant>,
}

/// Snapshot of a single register entry.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub handle: Handle,
    pub direction: Direction,
    pub address: Option<Address>,
    pub uri: Option<String>,
    pub connected_at: Instant,
}

/// The authoritative in-memory index of all live connections.
///
/// Every other component holds only a [`Handle`] and resolves it here on
/// each use; when an entry is dropped, all of them observe the closure.
/// Lookups and mutations take the lock briefly; no I/O ever happens under
/// it.
pub struct MuddleRegister {
    counter: AtomicU64,
    entries: RwLock<HashMap<Handle, Entry>>,
}

impl Default for MuddleRegister {
    fn default() -> Self {
        Self {
            counter: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl MuddleRegister {
    /// Admit a new connection, returning its handle.
    pub fn register(
        &self,
        sink: Arc<dyn PacketSink>,
        direction: Direction,
        uri: Option<String>,
    ) -> Handle {
        let handle = Handle(self.counter.fetch_add(1, Ordering::Relaxed));

        self.entries.write().insert(
            handle,
            Entry {
                sink,
                direction,
                address: None,
                uri,
                connected_at: Instant::now(),
                errors: 0,
                last_error: None,
            },
        );

        handle
    }

    /// Record the remote address once the handshake has identified it.
    pub fn update(&self, handle: Handle, address: Address) {
        if let Some(entry) = self.entries.write().get_mut(&handle) {
            if entry.address.is_none() {
                entry.address = Some(address);
            }
        }
    }

    pub fn unregister(&self, handle: Handle) -> Option<ConnectionInfo> {
        self.entries.write().remove(&handle).map(|entry| ConnectionInfo {
            handle,
            direction: entry.direction,
            address: entry.address,
            uri: entry.uri,
            connected_at: entry.connected_at,
        })
    }

    pub fn info(&self, handle: Handle) -> Option<ConnectionInfo> {
        self.entries.read().get(&handle).map(|entry| ConnectionInfo {
            handle,
            direction: entry.direction,
            address: entry.address,
            uri: entry.uri.clone(),
            connected_at: entry.connected_at,
        })
    }

    pub fn infos(&self) -> Vec<ConnectionInfo> {
        self.entries
            .read()
            .iter()
            .map(|(handle, entry)| ConnectionInfo {
                handle: *handle,
                direction: entry.direction,
                address: entry.address,
                uri: entry.uri.clone(),
                connected_at: entry.connected_at,
            })
            .collect()
    }

    pub fn address_of(&self, handle: Handle) -> Option<Address> {
        self.entries.read().get(&handle).and_then(|entry| entry.address)
    }

    /// All handles currently bound to an address. More than one during the
    /// window where two simultaneous dials both completed their handshake.
    pub fn lookup_by_address(&self, address: &Address) -> Vec<Handle> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.address == Some(*address))
            .map(|(handle, _)| *handle)
            .collect()
    }

    /// Count of live connections per direction.
    pub fn count(&self, direction: Direction) -> usize {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.direction == direction)
            .count()
    }

    /// Distinct addresses of links that completed the handshake.
    pub fn connected_addresses(&self) -> HashSet<Address> {
        self.entries
            .read()
            .values()
            .filter_map(|entry| entry.address)
            .collect()
    }

    /// Distinct addresses of handshake-complete links in one direction.
    pub fn addresses(&self, direction: Direction) -> HashSet<Address> {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.direction == direction)
            .filter_map(|entry| entry.address)
            .collect()
    }

    pub fn connected_uris(&self) -> HashSet<String> {
        self.entries
            .read()
            .values()
            .filter_map(|entry| entry.uri.clone())
            .collect()
    }

    pub fn is_connected(&self, address: &Address) -> bool {
        self.entries
            .read()
            .values()
            .any(|entry| entry.address == Some(*address))
    }

    /// Handshake-complete handles with their sinks, for flooding.
    pub fn authenticated(&self) -> Vec<(Handle, Arc<dyn PacketSink>)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.address.is_some())
            .map(|(handle, entry)| (*handle, entry.sink.clone()))
            .collect()
    }

    /// Enqueue a frame on a connection. The sink reference is cloned out
    /// of the lock before the enqueue.
    pub fn send(&self, handle: Handle, frame: Bytes) -> Result<(), SinkError> {
        let sink = self
            .entries
            .read()
            .get(&handle)
            .map(|entry| entry.sink.clone())
            .ok_or(SinkError::Closed)?;

        sink.send(frame)
    }

    /// Signal the transport to tear the connection down. The entry itself
    /// is removed when the transport reports the disconnect.
    pub fn close(&self, handle: Handle) {
        let sink = self
            .entries
            .read()
            .get(&handle)
            .map(|entry| entry.sink.clone());

        if let Some(sink) = sink {
            sink.close();
        }
    }

    pub fn close_all(&self) {
        let sinks: Vec<_> = self
            .entries
            .read()
            .values()
            .map(|entry| entry.sink.clone())
            .collect();

        for sink in sinks {
            sink.close();
        }
    }

    /// Bump the error counter of a connection, resetting it when the last
    /// error fell outside the accumulation window. Returns the count
    /// within the current window.
    pub fn record_error(&self, handle: Handle) -> u32 {
        let now = Instant::now();
        let mut entries = self.entries.write();

        match entries.get_mut(&handle) {
            Some(entry) => {
                if entry
                    .last_error
                    .is_none_or(|at| now.duration_since(at) > ERROR_WINDOW)
                {
                    entry.errors = 0;
                }

                entry.errors += 1;
                entry.last_error = Some(now);
                entry.errors
            }
            None => 0,
        }
    }

    /// Apply the duplicate-link tiebreak for an address that now has more
    /// than one handshake-complete link.
    ///
    /// The kept direction follows from the lexicographic comparison of the
    /// two addresses: when our own address is the lower one we keep the
    /// outgoing link, otherwise the incoming one. Both peers evaluate the
    /// same rule and arrive at the same single surviving link without any
    /// coordination. Returns the losing handles to be closed.
    pub fn resolve_duplicates(&self, own: &Address, remote: &Address) -> Vec<Handle> {
        let keep = if own < remote {
            Direction::Outgoing
        } else {
            Direction::Incoming
        };

        let mut candidates: Vec<(Handle, Direction, Instant)> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.address == Some(*remote))
            .map(|(handle, entry)| (*handle, entry.direction, entry.connected_at))
            .collect();

        if candidates.len() <= 1 {
            return Vec::new();
        }

        // Oldest first, so that among several links of the kept direction
        // the longest-lived one survives.
        candidates.sort_by_key(|(_, _, at)| *at);

        let winner = candidates
            .iter()
            .find(|(_, direction, _)| *direction == keep)
            .map(|(handle, _, _)| *handle)
            .unwrap_or(candidates[0].0);

        candidates
            .into_iter()
            .filter(|(handle, _, _)| *handle != winner)
            .map(|(handle, _, _)| handle)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct NullSink {
        closed: AtomicBool,
    }

    impl PacketSink for NullSink {
        fn send(&self, _frame: Bytes) -> Result<(), SinkError> {
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn address(byte: u8) -> Address {
        Address::new([byte; 32])
    }

    #[test]
    fn register_update_lookup_unregister() {
        let register = MuddleRegister::default();
        let handle = register.register(Arc::new(NullSink::default()), Direction::Outgoing, None);

        assert!(register.address_of(handle).is_none());

        register.update(handle, address(5));
        assert_eq!(register.address_of(handle), Some(address(5)));
        assert_eq!(register.lookup_by_address(&address(5)), vec![handle]);
        assert_eq!(register.count(Direction::Outgoing), 1);
        assert_eq!(register.count(Direction::Incoming), 0);

        // The address is learned exactly once.
        register.update(handle, address(6));
        assert_eq!(register.address_of(handle), Some(address(5)));

        let info = register.unregister(handle).unwrap();
        assert_eq!(info.address, Some(address(5)));
        assert!(register.lookup_by_address(&address(5)).is_empty());
    }

    #[test]
    fn tiebreak_prefers_outgoing_for_lower_own_address() {
        let register = MuddleRegister::default();

        let outgoing = register.register(Arc::new(NullSink::default()), Direction::Outgoing, None);
        let incoming = register.register(Arc::new(NullSink::default()), Direction::Incoming, None);
        register.update(outgoing, address(9));
        register.update(incoming, address(9));

        // own < remote: the outgoing link survives.
        let losers = register.resolve_duplicates(&address(1), &address(9));
        assert_eq!(losers, vec![incoming]);

        // own > remote: the incoming link survives.
        let losers = register.resolve_duplicates(&address(200), &address(9));
        assert_eq!(losers, vec![outgoing]);
    }

    #[test]
    fn tiebreak_with_single_link_is_a_no_op() {
        let register = MuddleRegister::default();
        let handle = register.register(Arc::new(NullSink::default()), Direction::Outgoing, None);
        register.update(handle, address(9));

        assert!(register.resolve_duplicates(&address(1), &address(9)).is_empty());
    }

    #[test]
    fn error_counter_accumulates() {
        let register = MuddleRegister::default();
        let handle = register.register(Arc::new(NullSink::default()), Direction::Incoming, None);

        assert_eq!(register.record_error(handle), 1);
        assert_eq!(register.record_error(handle), 2);
        assert_eq!(register.record_error(handle), 3);
    }
}
