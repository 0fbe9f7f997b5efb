use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use codec::{address::Address, control::Manifest};
use parking_lot::{Mutex, RwLock};

use crate::{
    Action,
    kademlia::KademliaTable,
    peers::{PeerConnectionList, PeerKey},
    register::{Direction, MuddleRegister},
};

/// Minimum spacing between manifest queries to the same peer, so a slow
/// or silent peer is not hammered every tick.
const QUERY_SPACING: Duration = Duration::from_secs(10);

/// Lifetime of tracker-initiated desired entries; re-added every tick
/// while the candidate is still wanted.
const CANDIDATE_EXPIRY: Duration = Duration::from_secs(60);

/// Behavior switches of the peer tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfiguration {
    /// Target steady-state count of structured (kademlia-chosen) outgoing
    /// links. Zero leaves connectivity entirely to explicit requests.
    pub max_kademlia_connections: usize,
    /// Additional random long-range links maintained on top.
    pub max_longrange_connections: usize,
    /// Apply the duplicate-link tiebreak.
    pub disconnect_duplicates: bool,
    /// Close loopback dials.
    pub disconnect_from_self: bool,
    /// How long a cached manifest stays fresh.
    pub manifest_ttl: Duration,
    /// Ticks between peer-table dumps.
    pub persist_interval: u32,
}

impl Default for TrackerConfiguration {
    fn default() -> Self {
        Self {
            max_kademlia_connections: 0,
            max_longrange_connections: 0,
            disconnect_duplicates: true,
            disconnect_from_self: true,
            manifest_ttl: Duration::from_secs(60),
            persist_interval: 20,
        }
    }
}

impl TrackerConfiguration {
    /// Every feature enabled, the configuration the integration networks
    /// run with.
    pub fn all_on() -> Self {
        Self {
            max_kademlia_connections: 8,
            max_longrange_connections: 2,
            ..Self::default()
        }
    }
}

struct ManifestEntry {
    manifest: Manifest,
    updated: Instant,
}

/// Reconciles the desired topology with the live connection set.
///
/// Each maintenance tick expires stale desired peers, enforces the
/// blacklist, tops the outgoing link count up from the kademlia table,
/// refreshes manifests of peers not heard from in a while and
/// periodically persists the peer table.
pub struct PeerTracker {
    own: Address,
    config: RwLock<TrackerConfiguration>,
    kad: Arc<KademliaTable>,
    manifests: Mutex<HashMap<Address, ManifestEntry>>,
    last_query: Mutex<HashMap<Address, Instant>>,
    last_peers_query: Mutex<HashMap<Address, Instant>>,
    ticks: AtomicU64,
}

impl PeerTracker {
    pub fn new(own: Address, kad: Arc<KademliaTable>) -> Self {
        Self {
            own,
            config: RwLock::new(TrackerConfiguration::default()),
            kad,
            manifests: Mutex::new(HashMap::new()),
            last_query: Mutex::new(HashMap::new()),
            last_peers_query: Mutex::new(HashMap::new()),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn configure(&self, config: TrackerConfiguration) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> TrackerConfiguration {
        self.config.read().clone()
    }

    pub fn store_manifest(&self, address: Address, manifest: Manifest) {
        self.manifests.lock().insert(
            address,
            ManifestEntry {
                manifest,
                updated: Instant::now(),
            },
        );
    }

    pub fn manifest_of(&self, address: &Address) -> Option<Manifest> {
        self.manifests
            .lock()
            .get(address)
            .map(|entry| entry.manifest.clone())
    }

    /// One reconciliation pass. Returns the dials and manifest queries
    /// the transport should carry out.
    pub fn tick(
        &self,
        now: Instant,
        register: &MuddleRegister,
        peers: &PeerConnectionList,
    ) -> Vec<Action> {
        let config = self.config();
        let mut actions = Vec::new();

        // 1. Expired desired entries leave the set.
        peers.expire(now);

        // 2. Blacklisted addresses never keep a connection.
        for address in peers.blacklisted() {
            for handle in register.lookup_by_address(&address) {
                log::info!("closing blacklisted peer: handle={handle}, peer={address:?}");
                register.close(handle);
            }
        }

        let connected = register.connected_addresses();
        let outgoing = register.count(Direction::Outgoing);

        // 3. Top the structured link count up from the peer table, plus a
        //    few random long-range links.
        if config.max_kademlia_connections > 0 {
            let target = config.max_kademlia_connections + config.max_longrange_connections;
            let need_new = config.max_kademlia_connections.saturating_sub(outgoing);

            if need_new > 0 {
                let mut picked = 0;
                let candidates = self
                    .kad
                    .closest_to(&self.own, target * 2 + 4)
                    .into_iter()
                    .chain(self.kad.random_sample(config.max_longrange_connections * 2));

                for peer in candidates {
                    if picked >= need_new + config.max_longrange_connections {
                        break;
                    }

                    if peer.address == self.own
                        || connected.contains(&peer.address)
                        || peers.confidence(&peer.address) == crate::peers::Confidence::Blacklist
                    {
                        continue;
                    }

                    peers.add_desired(
                        PeerKey::Address(peer.address),
                        peer.uri,
                        CANDIDATE_EXPIRY,
                        now,
                    );
                    picked += 1;
                }
            }

            // Surplus links beyond the target are shed, oldest and least
            // useful first.
            if outgoing > target {
                let mut infos: Vec<_> = register
                    .infos()
                    .into_iter()
                    .filter(|info| info.direction == Direction::Outgoing)
                    .filter(|info| match info.address {
                        Some(address) => {
                            !peers.is_whitelisted(&address) && !peers.is_requested(&address)
                        }
                        None => false,
                    })
                    .collect();

                infos.sort_by_key(|info| info.connected_at);

                for info in infos.into_iter().take(outgoing - target) {
                    log::info!(
                        "closing surplus peer: handle={}, peer={:?}",
                        info.handle,
                        info.address
                    );
                    register.close(info.handle);
                }
            }
        }

        // While the table is still thin, grow it by sampling the peer
        // tables of whoever is already connected.
        if config.max_kademlia_connections > 0
            && self.kad.size()
                < (config.max_kademlia_connections + config.max_longrange_connections) * 2
        {
            let mut last_peers_query = self.last_peers_query.lock();

            for address in &connected {
                if *address == self.own {
                    continue;
                }

                let recently_asked = last_peers_query
                    .get(address)
                    .is_some_and(|at| now.duration_since(*at) < QUERY_SPACING);
                if recently_asked {
                    continue;
                }

                last_peers_query.insert(*address, now);
                actions.push(Action::QueryPeers { address: *address });
            }
        }

        // 4. Refresh manifests of directly connected peers we have not
        //    heard from recently.
        {
            let manifests = self.manifests.lock();
            let mut last_query = self.last_query.lock();

            for address in &connected {
                if *address == self.own {
                    continue;
                }

                let fresh = manifests
                    .get(address)
                    .is_some_and(|entry| now.duration_since(entry.updated) < config.manifest_ttl);
                if fresh {
                    continue;
                }

                let recently_asked = last_query
                    .get(address)
                    .is_some_and(|at| now.duration_since(*at) < QUERY_SPACING);
                if recently_asked {
                    continue;
                }

                last_query.insert(*address, now);
                actions.push(Action::QueryManifest { address: *address });
            }

            last_query.retain(|_, at| now.duration_since(*at) < QUERY_SPACING * 2);
        }

        // Stale cache entries expire entirely.
        self.manifests
            .lock()
            .retain(|_, entry| now.duration_since(entry.updated) < config.manifest_ttl * 2);

        // 5. Persist the peer table every K ticks.
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if config.persist_interval > 0 && tick % config.persist_interval as u64 == 0 {
            if let Err(error) = self.kad.dump() {
                log::warn!("peer table dump failed: err={error}");
            }
        }

        // Finally, dial whatever the desired set is still missing.
        let connected_uris = register.connected_uris();
        for uri in peers.dial_candidates(now, &connected, &connected_uris, |address| {
            self.kad.uri_of(address)
        }) {
            actions.push(Action::Dial { uri });
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::peers::{Confidence, NEVER_EXPIRE};

    fn address(byte: u8) -> Address {
        Address::new([byte; 32])
    }

    fn setup() -> (PeerTracker, Arc<KademliaTable>, MuddleRegister, PeerConnectionList) {
        let kad = Arc::new(KademliaTable::new(address(0)));
        let tracker = PeerTracker::new(address(0), kad.clone());

        (tracker, kad, MuddleRegister::default(), PeerConnectionList::default())
    }

    #[test]
    fn passive_configuration_dials_nothing_on_its_own() {
        let (tracker, kad, register, peers) = setup();

        for i in 1..=5u8 {
            kad.report_existence(address(i), Some(format!("tcp://127.0.0.1:{i}")));
        }

        assert!(tracker.tick(Instant::now(), &register, &peers).is_empty());
    }

    #[test]
    fn all_on_tops_up_from_the_table() {
        let (tracker, kad, register, peers) = setup();
        tracker.configure(TrackerConfiguration::all_on());

        for i in 1..=5u8 {
            kad.report_existence(address(i), Some(format!("tcp://127.0.0.1:{i}")));
        }

        let actions = tracker.tick(Instant::now(), &register, &peers);
        let dials = actions
            .iter()
            .filter(|action| matches!(action, Action::Dial { .. }))
            .count();

        assert_eq!(dials, 5);
    }

    #[test]
    fn explicit_requests_are_dialed_in_any_configuration() {
        let (tracker, _kad, register, peers) = setup();

        peers.add_desired(
            PeerKey::Uri("tcp://127.0.0.1:1337".into()),
            None,
            NEVER_EXPIRE,
            Instant::now(),
        );

        let actions = tracker.tick(Instant::now(), &register, &peers);
        assert!(matches!(
            actions.as_slice(),
            [Action::Dial { uri }] if uri == "tcp://127.0.0.1:1337"
        ));
    }

    #[test]
    fn blacklisted_candidates_are_never_dialed() {
        let (tracker, kad, register, peers) = setup();
        tracker.configure(TrackerConfiguration::all_on());

        kad.report_existence(address(1), Some("tcp://127.0.0.1:1".into()));
        peers.set_confidence(address(1), Confidence::Blacklist);

        assert!(tracker.tick(Instant::now(), &register, &peers).is_empty());
    }

    #[test]
    fn manifest_cache_round_trip() {
        let (tracker, _kad, _register, _peers) = setup();

        assert!(tracker.manifest_of(&address(1)).is_none());

        tracker.store_manifest(
            address(1),
            Manifest {
                entries: vec![(1920, "tcp://127.0.0.1:9000".into())],
            },
        );

        assert_eq!(
            tracker.manifest_of(&address(1)).unwrap().entries,
            vec![(1920, "tcp://127.0.0.1:9000".to_string())]
        );
    }
}
