//! ## Muddle overlay core
//!
//! The transport-agnostic heart of the overlay network: connection
//! register, router, desired-peer list, kademlia peer table, peer
//! tracker, per-link handshake and the discovery service, composed by
//! [`Overlay`].
//!
//! The crate owns no sockets. Frames leave through the [`PacketSink`]
//! trait the transport implements per connection, and the periodic
//! [`Overlay::tick`] returns [`Action`] values (dial this uri, query that
//! manifest) for the transport to carry out. Everything else, from packet
//! verification to routing, forwarding, promise matching and peer
//! selection, happens inside.

pub mod direct;
pub mod discovery;
pub mod endpoint;
pub mod kademlia;
pub mod peers;
pub mod promises;
pub mod register;
pub mod routing;
pub mod sink;
pub mod tracker;

use std::{
    fmt,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use codec::{
    NetworkId,
    address::Address,
    control::{DiscoveryRequest, DiscoveryResponse, Manifest},
    identity::Identity,
    packet::Packet,
};

use self::{
    direct::DirectMessageService,
    discovery::DiscoveryService,
    endpoint::Endpoint,
    kademlia::KademliaTable,
    peers::{Confidence, PeerConnectionList, PeerKey},
    promises::Promise,
    register::{Direction, Handle, MuddleRegister},
    routing::Router,
    sink::PacketSink,
    tracker::{PeerTracker, TrackerConfiguration},
};

/// Reserved service of the link-local direct channel.
pub const SERVICE_DIRECT: u16 = 0;
pub const CHANNEL_CONTROL: u16 = 0;

/// Reserved service of the discovery protocol.
pub const SERVICE_DISCOVERY: u16 = 1;
pub const CHANNEL_DISCOVERY: u16 = 0;

/// Timeout applied to tracker-initiated discovery exchanges.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced to callers of the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No next hop is known for a directed packet.
    NoRoute,
    /// A write queue is above its high-water mark, or too many exchanges
    /// are in flight.
    Overloaded,
    /// An exchange promise timed out.
    Timeout,
    /// The operation was aborted by a stop.
    Shutdown,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why a link was (or is being) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    DuplicateLink,
    BadHandshake,
    NetworkMismatch,
    VersionMismatch,
    SelfConnection,
    PingTimeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Work the transport must carry out on behalf of the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open an outgoing connection to the uri.
    Dial { uri: String },
    /// Run a manifest exchange against the peer and feed the response
    /// back through [`Overlay::store_manifest_response`].
    QueryManifest { address: Address },
    /// Ask the peer for a sample of its peer table, to grow our own.
    QueryPeers { address: Address },
}

pub struct OverlayOptions {
    pub network: NetworkId,
    pub identity: Identity,
    pub tracker: TrackerConfiguration,
    pub peer_table_file: Option<PathBuf>,
}

/// The composed overlay node, minus its sockets.
#[derive(Clone)]
pub struct Overlay {
    identity: Arc<Identity>,
    network: NetworkId,
    register: Arc<MuddleRegister>,
    router: Arc<Router>,
    peers: Arc<PeerConnectionList>,
    kad: Arc<KademliaTable>,
    tracker: Arc<PeerTracker>,
    direct: Arc<DirectMessageService>,
    discovery: Arc<DiscoveryService>,
    stopping: Arc<AtomicBool>,
}

impl Overlay {
    pub fn new(options: OverlayOptions) -> Self {
        let identity = Arc::new(options.identity);
        let own = identity.address();

        let register = Arc::new(MuddleRegister::default());
        let kad = Arc::new(KademliaTable::new(own));

        if let Some(path) = options.peer_table_file {
            kad.set_cache_file(path);
            if let Err(error) = kad.load() {
                log::warn!("peer table load failed: err={error}");
            }
        }

        let router = Arc::new(Router::new(
            options.network,
            identity.clone(),
            register.clone(),
            kad.clone(),
        ));

        let peers = Arc::new(PeerConnectionList::default());

        let tracker = Arc::new(PeerTracker::new(own, kad.clone()));
        tracker.configure(options.tracker);

        let direct = Arc::new(DirectMessageService::new(
            identity.clone(),
            options.network,
            register.clone(),
            router.clone(),
            kad.clone(),
            peers.clone(),
            tracker.clone(),
        ));

        let discovery = Arc::new(DiscoveryService::new(kad.clone()));
        router.register_handler(SERVICE_DISCOVERY, CHANNEL_DISCOVERY, discovery.clone());

        Self {
            identity,
            network: options.network,
            register,
            router,
            peers,
            kad,
            tracker,
            direct,
            discovery,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.router.clone())
    }

    pub fn register(&self) -> &MuddleRegister {
        &self.register
    }

    pub fn kad(&self) -> &KademliaTable {
        &self.kad
    }

    pub fn tracker(&self) -> &PeerTracker {
        &self.tracker
    }

    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    /// Register a request handler for a (service, channel); requests get
    /// their replies routed back as exchange packets.
    pub fn register_handler(
        &self,
        service: u16,
        channel: u16,
        handler: Arc<dyn routing::RequestHandler>,
    ) {
        self.router.register_handler(service, channel, handler);
    }

    /// Live link counts as (incoming, outgoing), handshaken or not.
    pub fn connection_counts(&self) -> (usize, usize) {
        (
            self.register.count(Direction::Incoming),
            self.register.count(Direction::Outgoing),
        )
    }

    /// Adopt a new transport connection. The handshake starts
    /// immediately; the connection stays unroutable until it completes.
    pub fn attach(
        &self,
        sink: Arc<dyn PacketSink>,
        direction: Direction,
        uri: Option<String>,
    ) -> Handle {
        let handle = self.register.register(sink, direction, uri);
        self.direct.on_connected(handle);

        log::debug!("connection attached: handle={handle}, direction={direction:?}");

        handle
    }

    /// One inbound frame, dispatched synchronously on the connection that
    /// delivered it.
    pub fn on_frame(&self, handle: Handle, frame: &[u8]) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }

        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(error) => {
                let errors = self.register.record_error(handle);
                log::warn!("dropping frame: handle={handle}, err={error}, errors={errors}");
                return;
            }
        };

        if packet.service == SERVICE_DIRECT && packet.channel == CHANNEL_CONTROL {
            self.direct.on_control(handle, packet);
        } else {
            self.router.route_inbound(handle, packet);
        }
    }

    /// The transport observed the connection die.
    pub fn on_disconnect(&self, handle: Handle) {
        self.router.drop_routes_for(handle);
        self.direct.on_disconnect(handle);

        if let Some(info) = self.register.unregister(handle) {
            log::info!(
                "connection dropped: handle={handle}, peer={:?}",
                info.address
            );
        }
    }

    /// One maintenance pass. Returns the transport work it produced.
    pub fn tick(&self, now: Instant) -> Vec<Action> {
        if self.stopping.load(Ordering::Acquire) {
            return Vec::new();
        }

        self.direct.tick(now);
        let actions = self.tracker.tick(now, &self.register, &self.peers);
        self.router.sweep(now);

        actions
    }

    /// Advertise where this node can be dialed; also published through
    /// the discovery manifest.
    pub fn set_listen_uris(&self, uris: Vec<String>) {
        if let Some(uri) = uris.first() {
            self.discovery.announce(SERVICE_DIRECT, uri.clone());
        }

        self.direct.set_listen_uris(uris);
    }

    pub fn set_peer_table_file(&self, path: PathBuf) {
        self.kad.set_cache_file(path);
        if let Err(error) = self.kad.load() {
            log::warn!("peer table load failed: err={error}");
        }
    }

    pub fn set_tracker_configuration(&self, config: TrackerConfiguration) {
        self.tracker.configure(config);
    }

    pub fn connect_to_address(&self, address: Address, expire_in: Duration) {
        self.peers
            .add_desired(PeerKey::Address(address), None, expire_in, Instant::now());
    }

    pub fn connect_to_uri(&self, uri: String, expire_in: Duration) {
        self.peers
            .add_desired(PeerKey::Uri(uri), None, expire_in, Instant::now());
    }

    /// Connect to an address with a hint at where it listens.
    pub fn connect_to_hinted(&self, address: Address, uri: String, expire_in: Duration) {
        self.peers.add_desired(
            PeerKey::Address(address),
            Some(uri),
            expire_in,
            Instant::now(),
        );
    }

    pub fn disconnect_from(&self, address: Address) {
        self.peers.remove_desired(&PeerKey::Address(address));

        for handle in self.register.lookup_by_address(&address) {
            self.register.close(handle);
        }
    }

    pub fn set_confidence(&self, address: Address, confidence: Confidence) {
        self.peers.set_confidence(address, confidence);

        if confidence == Confidence::Blacklist {
            for handle in self.register.lookup_by_address(&address) {
                self.register.close(handle);
            }
        }
    }

    /// Kick off a manifest exchange against a peer.
    pub fn query_manifest(&self, address: Address) -> Result<Promise, Error> {
        self.router.exchange(
            address,
            SERVICE_DISCOVERY,
            CHANNEL_DISCOVERY,
            DiscoveryRequest::Manifest.encode(),
            DISCOVERY_TIMEOUT,
        )
    }

    /// Ask a peer for a sample of its peer table.
    pub fn query_peers(&self, address: Address) -> Result<Promise, Error> {
        self.router.exchange(
            address,
            SERVICE_DISCOVERY,
            CHANNEL_DISCOVERY,
            DiscoveryRequest::Peers.encode(),
            DISCOVERY_TIMEOUT,
        )
    }

    /// Feed a discovery reply back into the manifest cache.
    pub fn store_manifest_response(&self, address: Address, payload: &[u8]) {
        match DiscoveryResponse::decode(payload) {
            Ok(DiscoveryResponse::Manifest(manifest)) => {
                self.tracker.store_manifest(address, manifest);
            }
            Ok(DiscoveryResponse::Peers(hints)) => {
                for hint in hints {
                    let uri = (!hint.uri.is_empty()).then_some(hint.uri);
                    self.kad.report_existence(hint.address, uri);
                }
            }
            Err(error) => {
                log::debug!("bad discovery reply: peer={address:?}, err={error}");
            }
        }
    }

    pub fn manifest_of(&self, address: &Address) -> Option<Manifest> {
        self.tracker.manifest_of(address)
    }

    /// Addresses of all handshake-complete links, either direction.
    pub fn directly_connected_peers(&self) -> Vec<Address> {
        self.register.connected_addresses().into_iter().collect()
    }

    pub fn incoming_connected_peers(&self) -> Vec<Address> {
        self.register
            .addresses(Direction::Incoming)
            .into_iter()
            .collect()
    }

    pub fn outgoing_connected_peers(&self) -> Vec<Address> {
        self.register
            .addresses(Direction::Outgoing)
            .into_iter()
            .collect()
    }

    pub fn num_directly_connected_peers(&self) -> usize {
        self.register.connected_addresses().len()
    }

    pub fn is_directly_connected(&self, address: &Address) -> bool {
        self.register.is_connected(address)
    }

    pub fn is_connecting_or_connected(&self, address: &Address) -> bool {
        self.register.is_connected(address) || self.peers.is_requested(address)
    }

    /// Where a connection to the address currently stands.
    pub fn connection_state(&self, address: &Address) -> peers::ConnectionState {
        if self.register.is_connected(address) {
            return peers::ConnectionState::Connected;
        }

        self.peers.state_of(address, Instant::now())
    }

    pub fn requested_peers(&self) -> Vec<Address> {
        self.peers.requested_addresses()
    }

    /// Halt the overlay: fail every pending promise with shutdown and
    /// signal every connection to close. Idempotent.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        self.router.stop();
        self.register.close_all();
    }
}
