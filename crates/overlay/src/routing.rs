use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt, HashSet};
use bytes::Bytes;
use codec::{NetworkId, address::Address, identity::Identity, packet::Packet};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::{
    Error, SERVICE_DIRECT,
    endpoint::Subscription,
    kademlia::KademliaTable,
    promises::{Promise, PromiseKey, PromiseTable},
    register::{Handle, MuddleRegister},
    sink::SinkError,
};

/// Re-broadcasts of the same (sender, service, channel, counter) are
/// rejected within this window.
const DEDUP_TTL: Duration = Duration::from_secs(10);

/// Bound on the dedup set; the oldest entries fall out on overflow.
const DEDUP_CAP: usize = 4096;

/// Bad signatures tolerated per connection within the error window before
/// the link is closed.
const SIGNATURE_ERROR_LIMIT: u32 = 5;

/// How a route was learned. Handshake-learned routes always win over ones
/// merely observed from packet arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    Handshake,
    Observed,
}

#[derive(Debug, Clone, Copy)]
struct Route {
    handle: Handle,
    source: RouteSource,
}

type DedupKey = (Address, u16, u16, u32);

#[derive(Default)]
struct DedupSet {
    seen: HashSet<DedupKey>,
    order: VecDeque<(DedupKey, Instant)>,
}

impl DedupSet {
    /// True when the key is new. Expired and overflowed entries are
    /// purged on the way in.
    fn observe(&mut self, key: DedupKey, now: Instant) -> bool {
        while let Some((front, at)) = self.order.front() {
            if self.order.len() >= DEDUP_CAP || now.duration_since(*at) > DEDUP_TTL {
                self.seen.remove(front);
                self.order.pop_front();
            } else {
                break;
            }
        }

        if !self.seen.insert(key) {
            return false;
        }

        self.order.push_back((key, now));
        true
    }
}

pub(crate) struct SubEntry {
    pub id: u64,
    pub tx: mpsc::UnboundedSender<Packet>,
}

#[derive(Default)]
pub(crate) struct SubMap {
    pub entries: HashMap<(u16, u16), Vec<SubEntry>>,
}

/// A registered server for a (service, channel): turns a request payload
/// into a reply payload routed back along the reverse route.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, sender: &Address, payload: &[u8]) -> Option<Bytes>;
}

/// The single point through which every inbound and outbound packet
/// passes. The router owns no sockets; it only picks next hops and hands
/// frames to the register.
///
/// Lock order, where more than one is held: register before the routing
/// table before promises. In practice each is scoped so narrowly that
/// nesting never occurs.
pub struct Router {
    network: NetworkId,
    identity: Arc<Identity>,
    register: Arc<MuddleRegister>,
    kad: Arc<KademliaTable>,
    table: Mutex<HashMap<Address, Route>>,
    dedup: Mutex<DedupSet>,
    promises: PromiseTable,
    subscriptions: Arc<Mutex<SubMap>>,
    handlers: RwLock<HashMap<(u16, u16), Arc<dyn RequestHandler>>>,
    counters: Mutex<HashMap<(u16, u16), u32>>,
    next_subscription: AtomicU64,
    stopping: AtomicBool,
}

impl Router {
    pub fn new(
        network: NetworkId,
        identity: Arc<Identity>,
        register: Arc<MuddleRegister>,
        kad: Arc<KademliaTable>,
    ) -> Self {
        Self {
            network,
            identity,
            register,
            kad,
            table: Mutex::new(HashMap::new()),
            dedup: Mutex::new(DedupSet::default()),
            promises: PromiseTable::default(),
            subscriptions: Arc::new(Mutex::new(SubMap::default())),
            handlers: RwLock::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn own_address(&self) -> Address {
        self.identity.address()
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }

    fn next_counter(&self, service: u16, channel: u16) -> u32 {
        let mut counters = self.counters.lock();
        let counter = counters.entry((service, channel)).or_insert(0);
        *counter = counter.wrapping_add(1);

        *counter
    }

    /// Record a next-hop for an address. Handshake-learned entries
    /// override observed ones, never the other way around.
    pub fn learn_route(&self, address: Address, handle: Handle, source: RouteSource) {
        if address == self.own_address() {
            return;
        }

        let mut table = self.table.lock();
        match table.get_mut(&address) {
            Some(route) => {
                if source == RouteSource::Handshake || route.source == RouteSource::Observed {
                    *route = Route { handle, source };
                }
            }
            None => {
                table.insert(address, Route { handle, source });
            }
        }
    }

    pub fn drop_routes_for(&self, handle: Handle) {
        self.table.lock().retain(|_, route| route.handle != handle);
    }

    fn resolve(&self, target: &Address, exclude: Option<Handle>) -> Option<Handle> {
        if let Some(route) = self.table.lock().get(target) {
            if Some(route.handle) != exclude {
                return Some(route.handle);
            }
        }

        // No direct route: ask the peer table for the closest known peers
        // and relay through the first one we hold a link to.
        for peer in self.kad.closest_to(target, 8) {
            if let Some(route) = self.table.lock().get(&peer.address) {
                if Some(route.handle) != exclude {
                    return Some(route.handle);
                }
            }
        }

        None
    }

    /// Send a packet toward its named target. A forwarded packet never
    /// goes back out the link it arrived on.
    fn route_packet(&self, packet: &Packet) -> Result<(), Error> {
        self.route_packet_from(packet, None)
    }

    fn route_packet_from(&self, packet: &Packet, exclude: Option<Handle>) -> Result<(), Error> {
        let handle = self.resolve(&packet.target, exclude).ok_or(Error::NoRoute)?;

        match self.register.send(handle, packet.encode()) {
            Ok(()) => Ok(()),
            Err(SinkError::Overloaded) => Err(Error::Overloaded),
            Err(SinkError::Closed) => Err(Error::NoRoute),
        }
    }

    /// Enqueue on every handshake-complete link except the one the packet
    /// arrived on. Per-link failures are best-effort.
    fn flood(&self, packet: &Packet, exclude: Option<Handle>) {
        let frame = packet.encode();

        for (handle, sink) in self.register.authenticated() {
            if Some(handle) == exclude {
                continue;
            }

            if let Err(error) = sink.send(frame.clone()) {
                log::debug!("broadcast enqueue failed: handle={handle}, err={error:?}");
            }
        }
    }

    /// Send a payload to a single named target.
    pub fn send(
        &self,
        target: Address,
        service: u16,
        channel: u16,
        payload: Bytes,
    ) -> Result<(), Error> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let counter = self.next_counter(service, channel);
        let mut packet = Packet::direct(
            self.network,
            self.own_address(),
            target,
            service,
            channel,
            counter,
            payload,
        );
        packet.sign(&self.identity);

        if target == self.own_address() {
            self.deliver_local(&packet);
            return Ok(());
        }

        self.route_packet(&packet)
    }

    /// Flood a payload to the whole network.
    pub fn broadcast(&self, service: u16, channel: u16, payload: Bytes) -> Result<(), Error> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let counter = self.next_counter(service, channel);
        let mut packet = Packet::broadcast(
            self.network,
            self.own_address(),
            service,
            channel,
            counter,
            payload,
        );
        packet.sign(&self.identity);

        // Seed the dedup set so our own broadcast is dropped when it
        // echoes back around a cycle.
        self.dedup.lock().observe(
            (packet.sender, service, channel, counter),
            Instant::now(),
        );

        self.flood(&packet, None);

        Ok(())
    }

    /// Send a request and return the promise of its reply.
    pub fn exchange(
        &self,
        target: Address,
        service: u16,
        channel: u16,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Promise, Error> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let counter = self.next_counter(service, channel);
        let key = PromiseKey {
            peer: target,
            service,
            channel,
            counter,
        };

        let promise = self.promises.register(key, timeout, Instant::now())?;

        let mut packet = Packet::direct(
            self.network,
            self.own_address(),
            target,
            service,
            channel,
            counter,
            payload,
        );
        packet.sign(&self.identity);

        if let Err(error) = self.route_packet(&packet) {
            self.promises.fail(&key, error);
            return Err(error);
        }

        Ok(promise)
    }

    /// The inbound pipeline, run synchronously on the connection that
    /// delivered the packet.
    pub fn route_inbound(&self, handle: Handle, mut packet: Packet) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }

        if packet.network != self.network {
            log::debug!(
                "network mismatch: got={}, expected={}, handle={handle}",
                packet.network,
                self.network
            );
            return;
        }

        if packet.is_unsigned() {
            // Unsigned frames are only valid on an already-authenticated
            // direct channel; everything routed must carry a signature.
            let authenticated = packet.is_direct()
                && packet.service == SERVICE_DIRECT
                && self.register.address_of(handle) == Some(packet.sender);

            if !authenticated {
                self.note_bad_signature(handle);
                return;
            }
        } else if packet.verify().is_err() {
            self.note_bad_signature(handle);
            return;
        }

        // The arrival link becomes a candidate route back to the sender.
        self.learn_route(packet.sender, handle, RouteSource::Observed);

        let own = self.own_address();

        if packet.is_exchange() && packet.target == own {
            let key = PromiseKey {
                peer: packet.sender,
                service: packet.service,
                channel: packet.channel,
                counter: packet.counter,
            };

            if !self.promises.fulfill(&key, packet.payload.clone()) {
                log::debug!(
                    "dropping late or unsolicited reply: peer={:?}, service={}, counter={}",
                    packet.sender,
                    packet.service,
                    packet.counter
                );
            }
            return;
        }

        if packet.is_broadcast() {
            let key = (
                packet.sender,
                packet.service,
                packet.channel,
                packet.counter,
            );
            if !self.dedup.lock().observe(key, Instant::now()) {
                return;
            }

            self.deliver_local(&packet);

            if packet.ttl > 1 {
                packet.ttl -= 1;
                self.flood(&packet, Some(handle));
            }
            return;
        }

        if packet.target == own {
            self.deliver_local(&packet);
            return;
        }

        // Not ours: spend a hop and pass it along.
        if packet.ttl <= 1 {
            log::debug!("ttl exhausted: sender={:?}, target={:?}", packet.sender, packet.target);
            return;
        }

        packet.ttl -= 1;
        if let Err(error) = self.route_packet_from(&packet, Some(handle)) {
            log::debug!(
                "forward failed: target={:?}, err={error}",
                packet.target
            );
        }
    }

    fn note_bad_signature(&self, handle: Handle) {
        let errors = self.register.record_error(handle);
        log::warn!("bad signature: handle={handle}, errors={errors}");

        if errors >= SIGNATURE_ERROR_LIMIT {
            self.register.close(handle);
        }
    }

    /// Hand a packet to every local subscription of its (service,
    /// channel), and to the request handler when one is registered.
    fn deliver_local(&self, packet: &Packet) {
        {
            let mut subs = self.subscriptions.lock();
            if let Some(entries) = subs.entries.get_mut(&(packet.service, packet.channel)) {
                entries.retain(|entry| entry.tx.send(packet.clone()).is_ok());
            }
        }

        if packet.is_exchange() {
            return;
        }

        let handler = self
            .handlers
            .read()
            .get(&(packet.service, packet.channel))
            .cloned();

        if let Some(handler) = handler {
            if let Some(response) = handler.handle(&packet.sender, &packet.payload) {
                let mut reply = packet.exchange_reply(self.own_address(), response);
                reply.sign(&self.identity);

                if reply.target == self.own_address() {
                    // Loopback request: complete the local promise.
                    let key = PromiseKey {
                        peer: reply.sender,
                        service: reply.service,
                        channel: reply.channel,
                        counter: reply.counter,
                    };
                    self.promises.fulfill(&key, reply.payload.clone());
                } else if let Err(error) = self.route_packet(&reply) {
                    log::debug!("reply failed: target={:?}, err={error}", reply.target);
                }
            }
        }
    }

    pub fn subscribe(&self, service: u16, channel: u16) -> Subscription {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.subscriptions
            .lock()
            .entries
            .entry((service, channel))
            .or_default()
            .push(SubEntry { id, tx });

        Subscription::new(rx, id, (service, channel), Arc::downgrade(&self.subscriptions))
    }

    pub fn register_handler(
        &self,
        service: u16,
        channel: u16,
        handler: Arc<dyn RequestHandler>,
    ) {
        self.handlers.write().insert((service, channel), handler);
    }

    /// Periodic upkeep: time out promises.
    pub fn sweep(&self, now: Instant) {
        let expired = self.promises.expire(now);
        if expired > 0 {
            log::debug!("expired promises: count={expired}");
        }
    }

    pub fn pending_promises(&self) -> usize {
        self.promises.len()
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.promises.fail_all(Error::Shutdown);
    }

    #[cfg(test)]
    pub(crate) fn route_of(&self, address: &Address) -> Option<(Handle, RouteSource)> {
        self.table
            .lock()
            .get(address)
            .map(|route| (route.handle, route.source))
    }
}
