use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use ahash::{HashSet, HashSetExt};
use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use tokio::{net::TcpListener, task::JoinHandle, time};

use codec::{NetworkId, address::Address, identity::Identity};
use overlay::{
    Action, Overlay, OverlayOptions,
    endpoint::Endpoint,
    peers::Confidence,
    routing::RequestHandler,
    tracker::TrackerConfiguration,
};

use crate::net;

/// Period of the maintenance tick driving the tracker, keepalives and
/// promise timeouts.
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// How long `stop` waits for connection tasks to unwind.
const STOP_GRACE: Duration = Duration::from_millis(100);

struct Inner {
    network: NetworkId,
    seed: [u8; 32],
    external_address: String,
    port_mapping: HashMap<u16, u16>,
    overlay: RwLock<Overlay>,
    tracker_config: Mutex<TrackerConfiguration>,
    peer_table_file: Mutex<Option<PathBuf>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ports: Mutex<Vec<u16>>,
    running: AtomicBool,
    stopped_before: AtomicBool,
    dialing: Arc<Mutex<HashSet<String>>>,
}

/// The top level of the overlay stack: servers, dial-out, the
/// maintenance reactor and the overlay core behind one facade.
///
/// Peers of a muddle network are identified by their public key; all
/// client traffic flows through the [`Endpoint`] while this type manages
/// lifecycle and topology.
#[derive(Clone)]
pub struct Muddle {
    inner: Arc<Inner>,
}

impl Muddle {
    pub fn new(
        network: NetworkId,
        identity: Identity,
        external_address: String,
        port_mapping: HashMap<u16, u16>,
    ) -> Self {
        let seed = identity.seed();
        let overlay = Overlay::new(OverlayOptions {
            network,
            identity,
            tracker: TrackerConfiguration::default(),
            peer_table_file: None,
        });

        Self {
            inner: Arc::new(Inner {
                network,
                seed,
                external_address,
                port_mapping,
                overlay: RwLock::new(overlay),
                tracker_config: Mutex::new(TrackerConfiguration::default()),
                peer_table_file: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                ports: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                stopped_before: AtomicBool::new(false),
                dialing: Arc::new(Mutex::new(HashSet::new())),
            }),
        }
    }

    fn overlay(&self) -> Overlay {
        self.inner.overlay.read().clone()
    }

    /// Name the cache file the kademlia table persists to; loads any
    /// existing contents immediately.
    pub fn set_peer_table_file(&self, path: PathBuf) {
        *self.inner.peer_table_file.lock() = Some(path.clone());
        self.overlay().set_peer_table_file(path);
    }

    pub fn set_tracker_configuration(&self, config: TrackerConfiguration) {
        *self.inner.tracker_config.lock() = config.clone();
        self.overlay().set_tracker_configuration(config);
    }

    pub fn register_handler(
        &self,
        service: u16,
        channel: u16,
        handler: Arc<dyn RequestHandler>,
    ) {
        self.overlay().register_handler(service, channel, handler);
    }

    /// Start listening on the given ports (zero picks a random free
    /// port) and spin up the maintenance reactor. Idempotent while
    /// running; a stopped instance starts back up with a fresh overlay
    /// under the same identity.
    pub async fn start(&self, ports: &[u16]) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.inner.stopped_before.swap(false, Ordering::SeqCst) {
            let overlay = Overlay::new(OverlayOptions {
                network: self.inner.network,
                identity: Identity::from_seed(&self.inner.seed),
                tracker: self.inner.tracker_config.lock().clone(),
                peer_table_file: self.inner.peer_table_file.lock().clone(),
            });

            *self.inner.overlay.write() = overlay;
        }

        let overlay = self.overlay();

        let mut tasks = Vec::new();
        let mut bound_ports = Vec::new();
        let mut uris = Vec::new();

        for port in ports {
            let listener = TcpListener::bind(("0.0.0.0", *port)).await?;
            let actual = listener.local_addr()?.port();

            let external = self
                .inner
                .port_mapping
                .get(&actual)
                .copied()
                .unwrap_or(actual);
            uris.push(format!("tcp://{}:{}", self.inner.external_address, external));

            bound_ports.push(actual);
            tasks.push(tokio::spawn(net::tcp::listen(listener, overlay.clone())));
        }

        overlay.set_listen_uris(uris);

        let dialing = self.inner.dialing.clone();
        let tick_overlay = overlay.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                for action in tick_overlay.tick(Instant::now()) {
                    match action {
                        Action::Dial { uri } => {
                            if !dialing.lock().insert(uri.clone()) {
                                continue;
                            }

                            let overlay = tick_overlay.clone();
                            let dialing = dialing.clone();
                            tokio::spawn(async move {
                                net::tcp::dial(uri.clone(), overlay).await;
                                dialing.lock().remove(&uri);
                            });
                        }
                        Action::QueryManifest { address } | Action::QueryPeers { address } => {
                            let result = if matches!(action, Action::QueryManifest { .. }) {
                                tick_overlay.query_manifest(address)
                            } else {
                                tick_overlay.query_peers(address)
                            };

                            match result {
                                Ok(promise) => {
                                    let overlay = tick_overlay.clone();
                                    tokio::spawn(async move {
                                        match promise.wait().await {
                                            Ok(payload) => {
                                                overlay
                                                    .store_manifest_response(address, &payload);
                                            }
                                            Err(error) => {
                                                log::debug!(
                                                    "discovery query failed: peer={address:?}, err={error}"
                                                );
                                            }
                                        }
                                    });
                                }
                                Err(error) => {
                                    log::debug!(
                                        "discovery query not sent: peer={address:?}, err={error}"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }));

        *self.inner.ports.lock() = bound_ports.clone();
        *self.inner.tasks.lock() = tasks;

        log::info!(
            "muddle started: address={:?}, network={}, ports={bound_ports:?}",
            overlay.address(),
            self.inner.network
        );

        Ok(())
    }

    /// Halt the reactor, fail outstanding promises and close every server
    /// and connection. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.stopped_before.store(true, Ordering::SeqCst);

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        self.overlay().stop();
        self.inner.ports.lock().clear();
        self.inner.dialing.lock().clear();

        time::sleep(STOP_GRACE).await;

        log::info!("muddle stopped: network={}", self.inner.network);
    }

    pub fn get_endpoint(&self) -> Endpoint {
        self.overlay().endpoint()
    }

    /// Ask for a connection to a peer uri, held until the expiry passes.
    pub fn connect_to_uri(&self, uri: String, expire_in: Duration) {
        self.overlay().connect_to_uri(uri, expire_in);
    }

    /// Ask for a connection to an address; the uri is resolved through
    /// the peer table once known.
    pub fn connect_to_address(&self, address: Address, expire_in: Duration) {
        self.overlay().connect_to_address(address, expire_in);
    }

    /// Ask for a connection to an address with a hint at its uri.
    pub fn connect_to(&self, address: Address, uri: String, expire_in: Duration) {
        self.overlay().connect_to_hinted(address, uri, expire_in);
    }

    pub fn disconnect_from(&self, address: Address) {
        self.overlay().disconnect_from(address);
    }

    pub fn set_confidence(&self, address: Address, confidence: Confidence) {
        self.overlay().set_confidence(address, confidence);
    }

    pub fn set_confidence_all(
        &self,
        addresses: impl IntoIterator<Item = Address>,
        confidence: Confidence,
    ) {
        let overlay = self.overlay();
        for address in addresses {
            overlay.set_confidence(address, confidence);
        }
    }

    pub fn get_network(&self) -> NetworkId {
        self.inner.network
    }

    pub fn get_address(&self) -> Address {
        self.overlay().address()
    }

    pub fn get_external_address(&self) -> &str {
        &self.inner.external_address
    }

    pub fn get_listening_ports(&self) -> Vec<u16> {
        self.inner.ports.lock().clone()
    }

    pub fn get_directly_connected_peers(&self) -> Vec<Address> {
        self.overlay().directly_connected_peers()
    }

    pub fn get_incoming_connected_peers(&self) -> Vec<Address> {
        self.overlay().incoming_connected_peers()
    }

    pub fn get_outgoing_connected_peers(&self) -> Vec<Address> {
        self.overlay().outgoing_connected_peers()
    }

    pub fn get_num_directly_connected_peers(&self) -> usize {
        self.overlay().num_directly_connected_peers()
    }

    pub fn get_requested_peers(&self) -> Vec<Address> {
        self.overlay().requested_peers()
    }

    pub fn is_directly_connected(&self, address: &Address) -> bool {
        self.overlay().is_directly_connected(address)
    }

    pub fn is_connecting_or_connected(&self, address: &Address) -> bool {
        self.overlay().is_connecting_or_connected(address)
    }

    /// Live link counts as (incoming, outgoing).
    pub fn connection_counts(&self) -> (usize, usize) {
        self.overlay().connection_counts()
    }
}
