use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use codec::{NetworkId, address::Address, packet::Packet};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{Error, promises::Promise, routing::Router, routing::SubMap};

/// The client-facing surface of a muddle node.
///
/// Cheap to clone; calls may come from any thread. `send` and `broadcast`
/// never block: they enqueue on a connection or fail.
#[derive(Clone)]
pub struct Endpoint {
    router: Arc<Router>,
}

impl Endpoint {
    pub(crate) fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub fn address(&self) -> Address {
        self.router.own_address()
    }

    pub fn network(&self) -> NetworkId {
        self.router.network()
    }

    pub fn send(
        &self,
        target: Address,
        service: u16,
        channel: u16,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.router.send(target, service, channel, payload)
    }

    pub fn broadcast(&self, service: u16, channel: u16, payload: Bytes) -> Result<(), Error> {
        self.router.broadcast(service, channel, payload)
    }

    /// Send a request and get back the promise of its reply. Waiting on
    /// the promise blocks only the caller; the timeout fails it and frees
    /// the slot.
    pub fn exchange(
        &self,
        target: Address,
        service: u16,
        channel: u16,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Promise, Error> {
        self.router.exchange(target, service, channel, payload, timeout)
    }

    /// Register interest in a (service, channel). Every delivered packet
    /// for the tuple reaches every live subscription; dropping the
    /// returned value removes it.
    pub fn subscribe(&self, service: u16, channel: u16) -> Subscription {
        self.router.subscribe(service, channel)
    }
}

/// A live subscription. Dropping it removes the entry from the dispatch
/// list.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Packet>,
    _token: SubscriptionToken,
}

impl Subscription {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Packet>,
        id: u64,
        key: (u16, u16),
        map: Weak<Mutex<SubMap>>,
    ) -> Self {
        Self {
            rx,
            _token: SubscriptionToken { id, key, map },
        }
    }

    /// The next delivered packet, in arrival order. `None` once the node
    /// has stopped.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }
}

struct SubscriptionToken {
    id: u64,
    key: (u16, u16),
    map: Weak<Mutex<SubMap>>,
}

impl Drop for SubscriptionToken {
    fn drop(&mut self) {
        if let Some(map) = self.map.upgrade() {
            let mut map = map.lock();
            if let Some(entries) = map.entries.get_mut(&self.key) {
                entries.retain(|entry| entry.id != self.id);
                if entries.is_empty() {
                    map.entries.remove(&self.key);
                }
            }
        }
    }
}
