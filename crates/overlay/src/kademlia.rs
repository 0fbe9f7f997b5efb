use std::{
    fs,
    io::{self, Read, Write},
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use ahash::{HashMap, HashMapExt};
use bytes::{Buf, BufMut, BytesMut};
use codec::address::{ADDRESS_SIZE, Address};
use parking_lot::Mutex;
use rand::seq::IteratorRandom;

/// One bucket per possible highest-differing-bit index.
pub const BUCKET_COUNT: usize = 256;

/// Maximum entries a selection bucket ranks at once.
pub const BUCKET_SIZE: usize = 20;

/// A full bucket spares its stalest ranked entry when it has no recorded
/// failures and was seen within this window; the newcomer stays known but
/// unranked instead.
const EVICTION_GRACE: Duration = Duration::from_secs(300);

/// Version byte of the cache file; files with any other version are
/// ignored on load.
const CACHE_VERSION: u8 = 1;

/// One known peer of the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: Address,
    pub uri: Option<String>,
    /// Unix seconds of the last successful contact or report.
    pub last_seen: u64,
    pub failures: u32,
}

struct Inner {
    /// Everything the node has ever been told about, keyed by address.
    known: HashMap<Address, PeerInfo>,
    /// Per-bucket ranking of the peers worth holding connections to,
    /// most recently seen first, at most [`BUCKET_SIZE`] each.
    buckets: Vec<Vec<Address>>,
    cache_file: Option<PathBuf>,
}

/// Known peers ranked by XOR distance to this node.
///
/// The bucket of a peer is the index of the highest bit where its address
/// differs from ours, so bucket k holds peers whose distance lies in
/// [2^k, 2^(k+1)). Every reported peer is remembered; each bucket
/// additionally ranks its best [`BUCKET_SIZE`] entries for connection
/// selection, with the insertion policy deciding who holds a ranked slot.
///
/// All mutations, and the dump/load pair, serialize on the table's own
/// lock.
pub struct KademliaTable {
    own: Address,
    inner: Mutex<Inner>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

impl KademliaTable {
    pub fn new(own: Address) -> Self {
        Self {
            own,
            inner: Mutex::new(Inner {
                known: HashMap::new(),
                buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
                cache_file: None,
            }),
        }
    }

    pub fn own_address(&self) -> Address {
        self.own
    }

    pub fn set_cache_file(&self, path: PathBuf) {
        self.inner.lock().cache_file = Some(path);
    }

    /// Record or refresh a peer.
    pub fn report_existence(&self, address: Address, uri: Option<String>) {
        self.insert(address, uri, now_secs());
    }

    fn insert(&self, address: Address, uri: Option<String>, seen: u64) {
        let Some(index) = self.own.bucket_index(&address) else {
            // Our own address never enters the table.
            return;
        };

        let mut inner = self.inner.lock();

        match inner.known.get_mut(&address) {
            Some(peer) => {
                peer.last_seen = peer.last_seen.max(seen);
                if uri.is_some() {
                    peer.uri = uri;
                }
            }
            None => {
                inner.known.insert(
                    address,
                    PeerInfo {
                        address,
                        uri,
                        last_seen: seen,
                        failures: 0,
                    },
                );
            }
        }

        // Ranking: refresh moves the peer to the bucket head; a newcomer
        // takes a free slot, or displaces the stalest ranked entry unless
        // that entry is healthy and fresh.
        let bucket = &mut inner.buckets[index];
        if let Some(position) = bucket.iter().position(|ranked| *ranked == address) {
            bucket.remove(position);
            bucket.insert(0, address);
            return;
        }

        if bucket.len() < BUCKET_SIZE {
            bucket.insert(0, address);
            return;
        }

        let Inner { known, buckets, .. } = &mut *inner;
        let bucket = &mut buckets[index];

        let Some(stalest) = bucket
            .iter()
            .enumerate()
            .min_by_key(|(_, ranked)| known.get(ranked).map(|peer| peer.last_seen).unwrap_or(0))
            .map(|(position, _)| position)
        else {
            return;
        };

        if let Some(candidate) = known.get(&bucket[stalest]) {
            if candidate.failures == 0
                && seen.saturating_sub(candidate.last_seen) <= EVICTION_GRACE.as_secs()
            {
                return;
            }
        }

        bucket.remove(stalest);
        bucket.insert(0, address);
    }

    /// A successful contact clears the failure count.
    pub fn report_success(&self, address: &Address) {
        if let Some(peer) = self.inner.lock().known.get_mut(address) {
            peer.failures = 0;
            peer.last_seen = now_secs();
        }
    }

    /// Failures move an entry toward eviction from its ranked slot.
    pub fn report_failure(&self, address: &Address) {
        if let Some(peer) = self.inner.lock().known.get_mut(address) {
            peer.failures += 1;
        }
    }

    pub fn uri_of(&self, address: &Address) -> Option<String> {
        self.inner
            .lock()
            .known
            .get(address)
            .and_then(|peer| peer.uri.clone())
    }

    /// Up to k known peers closest to the given address.
    pub fn closest_to(&self, target: &Address, k: usize) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.inner.lock().known.values().cloned().collect();

        peers.sort_by_key(|peer| peer.address.xor_distance(target));
        peers.truncate(k);

        peers
    }

    /// Up to k peers drawn without replacement across the whole table.
    pub fn random_sample(&self, k: usize) -> Vec<PeerInfo> {
        self.inner
            .lock()
            .known
            .values()
            .cloned()
            .choose_multiple(&mut rand::rng(), k)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().known.len()
    }

    #[cfg(test)]
    fn is_ranked(&self, address: &Address) -> bool {
        let Some(index) = self.own.bucket_index(address) else {
            return false;
        };

        self.inner.lock().buckets[index].contains(address)
    }

    #[cfg(test)]
    fn is_known(&self, address: &Address) -> bool {
        self.inner.lock().known.contains_key(address)
    }

    /// Write the table to its cache file, atomically via temp + rename.
    pub fn dump(&self) -> io::Result<()> {
        let inner = self.inner.lock();
        let Some(path) = inner.cache_file.clone() else {
            return Ok(());
        };

        // Group everything known by bucket index, ranked entries first so
        // a reload reconstructs the same ranking prefix.
        let mut grouped: Vec<Vec<&PeerInfo>> = (0..BUCKET_COUNT).map(|_| Vec::new()).collect();
        for (index, bucket) in inner.buckets.iter().enumerate() {
            for address in bucket {
                if let Some(peer) = inner.known.get(address) {
                    grouped[index].push(peer);
                }
            }
        }
        for peer in inner.known.values() {
            if let Some(index) = self.own.bucket_index(&peer.address) {
                if !inner.buckets[index].contains(&peer.address) {
                    grouped[index].push(peer);
                }
            }
        }

        let mut buf = BytesMut::new();
        buf.put_u8(CACHE_VERSION);
        buf.put_slice(self.own.as_bytes());

        for (index, group) in grouped.iter().enumerate() {
            if group.is_empty() {
                continue;
            }

            buf.put_u16(index as u16);
            buf.put_u16(group.len() as u16);

            for peer in group {
                buf.put_slice(peer.address.as_bytes());
                let uri = peer.uri.as_deref().unwrap_or("");
                buf.put_u16(uri.len() as u16);
                buf.put_slice(uri.as_bytes());
                buf.put_u64(peer.last_seen);
                buf.put_u32(peer.failures);
            }
        }

        let temp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }

        fs::rename(&temp, &path)
    }

    /// Replace the in-memory state with the cache file's contents,
    /// preserving bucket assignment and ranking order. A missing file or
    /// an incompatible version leaves the table empty; only truncated
    /// data is an error.
    pub fn load(&self) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let Some(path) = inner.cache_file.clone() else {
            return Ok(());
        };

        let mut bytes = Vec::new();
        match fs::File::open(&path) {
            Ok(mut file) => {
                file.read_to_end(&mut bytes)?;
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error),
        }

        let mut buf = bytes.as_slice();
        if buf.remaining() < 1 + ADDRESS_SIZE || buf.get_u8() != CACHE_VERSION {
            return Ok(());
        }

        let mut stored_own = [0u8; ADDRESS_SIZE];
        buf.copy_to_slice(&mut stored_own);
        let same_node = Address::new(stored_own) == self.own;

        let mut known = HashMap::new();
        let mut buckets: Vec<Vec<Address>> = (0..BUCKET_COUNT).map(|_| Vec::new()).collect();

        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(io::ErrorKind::InvalidData.into());
            }

            let index = buf.get_u16() as usize;
            let count = buf.get_u16() as usize;
            if index >= BUCKET_COUNT {
                return Err(io::ErrorKind::InvalidData.into());
            }

            for _ in 0..count {
                if buf.remaining() < ADDRESS_SIZE + 2 {
                    return Err(io::ErrorKind::InvalidData.into());
                }

                let mut address = [0u8; ADDRESS_SIZE];
                buf.copy_to_slice(&mut address);
                let address = Address::new(address);

                let uri_len = buf.get_u16() as usize;
                if buf.remaining() < uri_len + 8 + 4 {
                    return Err(io::ErrorKind::InvalidData.into());
                }

                let mut uri = vec![0u8; uri_len];
                buf.copy_to_slice(&mut uri);
                let uri = String::from_utf8(uri)
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;

                let peer = PeerInfo {
                    address,
                    uri: (!uri.is_empty()).then_some(uri),
                    last_seen: buf.get_u64(),
                    failures: buf.get_u32(),
                };

                // A file written by the same node keeps its bucket
                // assignment; anything else is re-bucketed against our
                // own address.
                let slot = if same_node {
                    Some(index)
                } else {
                    self.own.bucket_index(&address)
                };

                if let Some(slot) = slot {
                    if buckets[slot].len() < BUCKET_SIZE {
                        buckets[slot].push(address);
                    }
                    known.insert(address, peer);
                }
            }
        }

        inner.known = known;
        inner.buckets = buckets;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::{RngCore, SeedableRng, rngs::StdRng};

    fn address(byte: u8) -> Address {
        Address::new([byte; 32])
    }

    #[test]
    fn peers_land_in_the_highest_differing_bit_bucket() {
        let own = Address::ZERO;
        let table = KademliaTable::new(own);

        let mut far = [0u8; ADDRESS_SIZE];
        far[0] = 0x80;
        let far = Address::new(far);

        let mut near = [0u8; ADDRESS_SIZE];
        near[31] = 0x01;
        let near = Address::new(near);

        table.report_existence(far, None);
        table.report_existence(near, None);
        table.report_existence(own, None);

        assert_eq!(table.size(), 2);
        assert_eq!(own.bucket_index(&far), Some(255));
        assert_eq!(own.bucket_index(&near), Some(0));
        assert!(table.is_ranked(&far));
        assert!(table.is_ranked(&near));
        assert!(!table.is_known(&own));
    }

    #[test]
    fn full_bucket_spares_fresh_healthy_entries() {
        let own = Address::ZERO;
        let table = KademliaTable::new(own);

        // All of these share bucket 7 (differ from zero only in byte 31,
        // high bit of the low byte).
        let peer = |i: u8| {
            let mut bytes = [0u8; ADDRESS_SIZE];
            bytes[31] = 0x80 | i;
            Address::new(bytes)
        };

        let now = now_secs();
        for i in 0..BUCKET_SIZE as u8 {
            table.insert(peer(i), None, now);
        }

        // Everyone ranked is fresh and healthy: the newcomer stays known
        // but takes no ranked slot.
        let newcomer = peer(BUCKET_SIZE as u8);
        table.insert(newcomer, None, now);
        assert!(table.is_known(&newcomer));
        assert!(!table.is_ranked(&newcomer));

        // After the stalest ranked entry fails and ages, the newcomer
        // displaces it.
        table.report_failure(&peer(0));
        {
            let mut inner = table.inner.lock();
            if let Some(entry) = inner.known.get_mut(&peer(0)) {
                entry.last_seen = now.saturating_sub(1000);
            }
        }

        table.insert(newcomer, None, now_secs());
        assert!(table.is_ranked(&newcomer));
        assert!(!table.is_ranked(&peer(0)));
        assert!(table.is_known(&peer(0)));
    }

    #[test]
    fn closest_to_orders_by_xor_distance() {
        let table = KademliaTable::new(Address::ZERO);

        for i in 1..=8u8 {
            table.report_existence(address(i), None);
        }

        let closest = table.closest_to(&address(1), 3);
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0].address, address(1));
    }

    #[test]
    fn random_sample_draws_without_replacement() {
        let table = KademliaTable::new(Address::ZERO);

        for i in 1..=10u8 {
            table.report_existence(address(i), None);
        }

        let sample = table.random_sample(5);
        assert_eq!(sample.len(), 5);

        let mut addresses: Vec<_> = sample.iter().map(|peer| peer.address).collect();
        addresses.sort();
        addresses.dedup();
        assert_eq!(addresses.len(), 5);

        assert_eq!(table.random_sample(100).len(), 10);
    }

    #[test]
    fn dump_load_round_trip() {
        let path = std::env::temp_dir().join(format!(
            "muddle-kad-{}-{}.peer_table",
            std::process::id(),
            now_secs()
        ));

        let own = address(99);
        let table = KademliaTable::new(own);
        table.set_cache_file(path.clone());

        for i in 1..=50u8 {
            table.report_existence(
                address(i),
                Some(format!("tcp://127.0.0.1:{}", 1000 + i as u16)),
            );
        }

        table.dump().unwrap();

        let restored = KademliaTable::new(own);
        restored.set_cache_file(path.clone());
        restored.load().unwrap();

        assert_eq!(restored.size(), 50);
        for i in 1..=50u8 {
            assert_eq!(
                restored.uri_of(&address(i)),
                Some(format!("tcp://127.0.0.1:{}", 1000 + i as u16))
            );
            assert_eq!(restored.is_ranked(&address(i)), table.is_ranked(&address(i)));
        }

        let _ = fs::remove_file(path);
    }

    #[test]
    fn thousand_peer_recovery() {
        let path = std::env::temp_dir().join(format!(
            "muddle-kad-big-{}-{}.peer_table",
            std::process::id(),
            now_secs()
        ));

        let mut rng = StdRng::seed_from_u64(42);
        let mut synthetic = Vec::new();
        for _ in 0..1000 {
            let mut bytes = [0u8; ADDRESS_SIZE];
            rng.fill_bytes(&mut bytes);
            synthetic.push(Address::new(bytes));
        }

        let own = {
            let mut bytes = [0u8; ADDRESS_SIZE];
            rng.fill_bytes(&mut bytes);
            Address::new(bytes)
        };

        let table = KademliaTable::new(own);
        table.set_cache_file(path.clone());
        for peer in &synthetic {
            table.report_existence(*peer, Some("tcp://127.0.0.1:1337".into()));
        }

        assert_eq!(table.size(), 1000);
        table.dump().unwrap();

        let restored = KademliaTable::new(own);
        restored.set_cache_file(path.clone());
        restored.load().unwrap();

        assert_eq!(restored.size(), 1000);
        for peer in &synthetic {
            assert!(restored.is_known(peer));
            assert!(own.bucket_index(peer).is_some());
        }

        let _ = fs::remove_file(path);
    }

    #[test]
    fn incompatible_cache_version_is_ignored() {
        let path = std::env::temp_dir().join(format!(
            "muddle-kad-badver-{}-{}.peer_table",
            std::process::id(),
            now_secs()
        ));

        fs::write(&path, [0xffu8; 64]).unwrap();

        let table = KademliaTable::new(address(1));
        table.set_cache_file(path.clone());
        table.load().unwrap();
        assert_eq!(table.size(), 0);

        let _ = fs::remove_file(path);
    }
}
