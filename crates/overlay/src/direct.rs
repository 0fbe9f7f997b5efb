use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use codec::{
    NetworkId, VERSION,
    address::Address,
    control::{ControlMessage, Hello, PeerHint},
    identity::Identity,
    packet::Packet,
};
use parking_lot::{Mutex, RwLock};

use crate::{
    CHANNEL_CONTROL, CloseReason, SERVICE_DIRECT,
    kademlia::KademliaTable,
    peers::PeerConnectionList,
    register::{Handle, MuddleRegister},
    routing::{RouteSource, Router},
    tracker::PeerTracker,
};

const PING_INTERVAL: Duration = Duration::from_secs(5);
const MAX_MISSED_PINGS: u32 = 3;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How many peers close to the remote go into the post-handshake routing
/// digest.
const DIGEST_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitHello,
    Ready,
}

struct Link {
    phase: Phase,
    address: Option<Address>,
    opened_at: Instant,
    last_ping: Option<Instant>,
    awaiting_pong: bool,
    missed: u32,
}

/// Runs the per-link handshake and keepalive.
///
/// A new connection is not routable until both ends exchanged a hello
/// (identity, protocol version, signed nonce) and the register learned
/// the remote address. After that the service warms the peer's table with
/// a routing digest and keeps the link alive with periodic pings.
pub struct DirectMessageService {
    identity: Arc<Identity>,
    network: NetworkId,
    register: Arc<MuddleRegister>,
    router: Arc<Router>,
    kad: Arc<KademliaTable>,
    peers: Arc<PeerConnectionList>,
    tracker: Arc<PeerTracker>,
    listen_uris: RwLock<Vec<String>>,
    links: Mutex<HashMap<Handle, Link>>,
}

impl DirectMessageService {
    pub fn new(
        identity: Arc<Identity>,
        network: NetworkId,
        register: Arc<MuddleRegister>,
        router: Arc<Router>,
        kad: Arc<KademliaTable>,
        peers: Arc<PeerConnectionList>,
        tracker: Arc<PeerTracker>,
    ) -> Self {
        Self {
            identity,
            network,
            register,
            router,
            kad,
            peers,
            tracker,
            listen_uris: RwLock::new(Vec::new()),
            links: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_listen_uris(&self, uris: Vec<String>) {
        *self.listen_uris.write() = uris;
    }

    /// Begin the handshake on a freshly attached connection: both ends
    /// send their hello immediately.
    pub fn on_connected(&self, handle: Handle) {
        self.links.lock().insert(
            handle,
            Link {
                phase: Phase::AwaitHello,
                address: None,
                opened_at: Instant::now(),
                last_ping: None,
                awaiting_pong: false,
                missed: 0,
            },
        );

        let hello = ControlMessage::Hello(Hello::new(
            self.network,
            &self.identity,
            self.listen_uris.read().clone(),
        ));

        self.send_control(handle, Address::ZERO, hello, true);
    }

    pub fn on_disconnect(&self, handle: Handle) {
        self.links.lock().remove(&handle);
    }

    /// True when the link has completed its handshake.
    pub fn is_ready(&self, handle: Handle) -> bool {
        self.links
            .lock()
            .get(&handle)
            .map(|link| link.phase == Phase::Ready)
            .unwrap_or(false)
    }

    fn send_control(&self, handle: Handle, target: Address, message: ControlMessage, sign: bool) {
        let mut packet = Packet::direct(
            self.network,
            self.identity.address(),
            target,
            SERVICE_DIRECT,
            CHANNEL_CONTROL,
            0,
            message.encode(),
        );
        packet.ttl = 1;

        if sign {
            packet.sign(&self.identity);
        }

        if let Err(error) = self.register.send(handle, packet.encode()) {
            log::debug!("control enqueue failed: handle={handle}, err={error:?}");
        }
    }

    fn close(&self, handle: Handle, reason: CloseReason) {
        log::info!("closing link: handle={handle}, reason={reason}");
        self.register.close(handle);
    }

    /// Process one frame of the direct channel.
    pub fn on_control(&self, handle: Handle, packet: Packet) {
        if packet.network != self.network {
            self.close(handle, CloseReason::NetworkMismatch);
            return;
        }

        // Unsigned control frames are only acceptable once the link is
        // authenticated and only from the peer it authenticated as.
        if packet.is_unsigned() {
            let link_address = self.links.lock().get(&handle).and_then(|link| link.address);
            if link_address != Some(packet.sender) {
                self.register.record_error(handle);
                return;
            }
        } else if packet.verify().is_err() {
            self.register.record_error(handle);
            return;
        }

        let message = match ControlMessage::decode(&packet.payload) {
            Ok(message) => message,
            Err(error) => {
                log::debug!("malformed control frame: handle={handle}, err={error}");
                self.register.record_error(handle);
                return;
            }
        };

        match message {
            ControlMessage::Hello(hello) => self.on_hello(handle, &packet, hello),
            ControlMessage::Ping => {
                if self.is_ready(handle) {
                    self.send_control(handle, packet.sender, ControlMessage::Pong, false);
                }
            }
            ControlMessage::Pong => {
                let mut links = self.links.lock();
                if let Some(link) = links.get_mut(&handle) {
                    link.awaiting_pong = false;
                    link.missed = 0;
                }
                drop(links);

                self.kad.report_success(&packet.sender);
            }
            ControlMessage::RoutingDigest(hints) => {
                if self.is_ready(handle) {
                    for hint in hints {
                        let uri = (!hint.uri.is_empty()).then_some(hint.uri);
                        self.kad.report_existence(hint.address, uri);
                    }
                }
            }
        }
    }

    fn on_hello(&self, handle: Handle, packet: &Packet, hello: Hello) {
        {
            let links = self.links.lock();
            match links.get(&handle) {
                Some(link) if link.phase == Phase::AwaitHello => {}
                // Repeated hello on an established link is ignored.
                _ => return,
            }
        }

        if hello.network != self.network {
            self.close(handle, CloseReason::NetworkMismatch);
            return;
        }

        if hello.version != VERSION {
            self.close(handle, CloseReason::VersionMismatch);
            return;
        }

        // The hello must ride in a signed packet from the address it
        // claims, and the nonce signature proves possession of that key.
        if packet.is_unsigned() || packet.sender != hello.address || !hello.verify() {
            self.close(handle, CloseReason::BadHandshake);
            return;
        }

        let config = self.tracker.config();
        let own = self.identity.address();
        let remote = hello.address;

        if remote == own && config.disconnect_from_self {
            self.close(handle, CloseReason::SelfConnection);
            return;
        }

        self.register.update(handle, remote);
        self.router.learn_route(remote, handle, RouteSource::Handshake);

        {
            let mut links = self.links.lock();
            if let Some(link) = links.get_mut(&handle) {
                link.phase = Phase::Ready;
                link.address = Some(remote);
            }
        }

        let uri = hello.listen_uris.first().cloned();
        self.kad.report_existence(remote, uri);
        self.kad.report_success(&remote);

        let dialed_uri = self
            .register
            .info(handle)
            .and_then(|info| info.uri);
        self.peers.mark_connected(Some(&remote), dialed_uri.as_deref());

        log::info!(
            "handshake complete: handle={handle}, peer={:?}, network={}",
            remote,
            self.network
        );

        if config.disconnect_duplicates {
            for loser in self.register.resolve_duplicates(&own, &remote) {
                self.close(loser, CloseReason::DuplicateLink);
                if loser == handle {
                    return;
                }
            }
        }

        // Warm the peer's table with the entries we hold closest to it.
        let hints: Vec<PeerHint> = self
            .kad
            .closest_to(&remote, DIGEST_SIZE + 1)
            .into_iter()
            .filter(|peer| peer.address != remote)
            .take(DIGEST_SIZE)
            .map(|peer| PeerHint {
                address: peer.address,
                uri: peer.uri.unwrap_or_default(),
            })
            .collect();

        if !hints.is_empty() {
            self.send_control(handle, remote, ControlMessage::RoutingDigest(hints), true);
        }
    }

    /// Keepalive and handshake-timeout pass, run from the maintenance
    /// tick.
    pub fn tick(&self, now: Instant) {
        enum Act {
            Ping(Handle, Address),
            Close(Handle, CloseReason, Option<Address>),
        }

        let mut acts = Vec::new();

        {
            let mut links = self.links.lock();
            for (handle, link) in links.iter_mut() {
                match link.phase {
                    Phase::AwaitHello => {
                        if now.duration_since(link.opened_at) > HANDSHAKE_TIMEOUT {
                            acts.push(Act::Close(*handle, CloseReason::BadHandshake, None));
                        }
                    }
                    Phase::Ready => {
                        let due = link
                            .last_ping
                            .is_none_or(|at| now.duration_since(at) >= PING_INTERVAL);
                        if !due {
                            continue;
                        }

                        if link.awaiting_pong {
                            link.missed += 1;
                            if link.missed >= MAX_MISSED_PINGS {
                                acts.push(Act::Close(
                                    *handle,
                                    CloseReason::PingTimeout,
                                    link.address,
                                ));
                                continue;
                            }
                        }

                        if let Some(address) = link.address {
                            link.last_ping = Some(now);
                            link.awaiting_pong = true;
                            acts.push(Act::Ping(*handle, address));
                        }
                    }
                }
            }
        }

        for act in acts {
            match act {
                Act::Ping(handle, address) => {
                    self.send_control(handle, address, ControlMessage::Ping, false);
                }
                Act::Close(handle, reason, address) => {
                    if let Some(address) = address {
                        self.kad.report_failure(&address);
                    }
                    self.close(handle, reason);
                }
            }
        }
    }
}
