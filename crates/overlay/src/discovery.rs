use std::sync::Arc;

use bytes::Bytes;
use codec::{
    address::Address,
    control::{DiscoveryRequest, DiscoveryResponse, Manifest, PeerHint},
};
use parking_lot::RwLock;

use crate::{kademlia::KademliaTable, routing::RequestHandler};

/// How many peers go into a peer-list reply.
const PEER_SAMPLE_SIZE: usize = 16;

/// Answers manifest and peer-list queries for this node.
///
/// The service is registered as the request handler of the reserved
/// discovery (service, channel); remote nodes reach it through an
/// ordinary exchange and the tracker uses it to refresh its manifest
/// cache.
pub struct DiscoveryService {
    kad: Arc<KademliaTable>,
    manifest: RwLock<Manifest>,
}

impl DiscoveryService {
    pub fn new(kad: Arc<KademliaTable>) -> Self {
        Self {
            kad,
            manifest: RwLock::new(Manifest::default()),
        }
    }

    /// Replace the advertised manifest.
    pub fn set_manifest(&self, manifest: Manifest) {
        *self.manifest.write() = manifest;
    }

    /// Advertise (or re-point) a single service.
    pub fn announce(&self, service: u16, uri: String) {
        let mut manifest = self.manifest.write();

        match manifest
            .entries
            .iter_mut()
            .find(|(existing, _)| *existing == service)
        {
            Some(entry) => entry.1 = uri,
            None => manifest.entries.push((service, uri)),
        }
    }

    pub fn manifest(&self) -> Manifest {
        self.manifest.read().clone()
    }
}

impl RequestHandler for DiscoveryService {
    fn handle(&self, _sender: &Address, payload: &[u8]) -> Option<Bytes> {
        let response = match DiscoveryRequest::decode(payload).ok()? {
            DiscoveryRequest::Manifest => DiscoveryResponse::Manifest(self.manifest()),
            DiscoveryRequest::Peers => DiscoveryResponse::Peers(
                self.kad
                    .random_sample(PEER_SAMPLE_SIZE)
                    .into_iter()
                    .map(|peer| PeerHint {
                        address: peer.address,
                        uri: peer.uri.unwrap_or_default(),
                    })
                    .collect(),
            ),
        };

        Some(response.encode())
    }
}
