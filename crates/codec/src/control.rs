//! Control-plane payloads.
//!
//! Two families of messages ride on reserved services of the overlay
//! itself: the direct channel (hello handshake, keepalive pings and the
//! routing digest exchanged between the two ends of a single link) and the
//! discovery protocol (manifest and peer-list queries answered by every
//! node). Both use the same hand-rolled byte codec as the packet header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;

use crate::{
    Error, NetworkId,
    address::{ADDRESS_SIZE, Address},
    identity::{Identity, SIGNATURE_SIZE, verify},
};

/// Upper bound on uri strings inside control messages.
const MAX_URI_LEN: usize = 512;

/// Upper bound on list lengths inside control messages.
const MAX_LIST_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum ControlKind {
    Hello = 1,
    Ping = 2,
    Pong = 3,
    RoutingDigest = 4,
}

/// A peer the sender knows about: address plus the uri it can be dialed
/// on, when one is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHint {
    pub address: Address,
    pub uri: String,
}

/// First message on every new link, sent by both ends.
///
/// The nonce is fresh random material signed with the key behind the
/// claimed address, proving possession before the link is trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub network: NetworkId,
    pub version: u8,
    pub address: Address,
    pub listen_uris: Vec<String>,
    pub nonce: [u8; 32],
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Hello {
    pub fn new(network: NetworkId, identity: &Identity, listen_uris: Vec<String>) -> Self {
        let mut nonce = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut nonce);

        Self {
            network,
            version: crate::VERSION,
            address: identity.address(),
            listen_uris,
            signature: identity.sign(&nonce),
            nonce,
        }
    }

    /// Check the nonce signature against the claimed address.
    pub fn verify(&self) -> bool {
        verify(&self.address, &self.nonce, &self.signature)
    }
}

/// Messages of the direct (link-local) channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Hello(Hello),
    Ping,
    Pong,
    /// A sample of the sender's peer table close to the receiver, used to
    /// warm the receiver's own table right after the handshake.
    RoutingDigest(Vec<PeerHint>),
}

impl ControlMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Self::Hello(hello) => {
                buf.put_u8(ControlKind::Hello as u8);
                buf.put_slice(&hello.network.0);
                buf.put_u8(hello.version);
                buf.put_slice(hello.address.as_bytes());
                buf.put_u8(hello.listen_uris.len() as u8);
                for uri in &hello.listen_uris {
                    put_string(&mut buf, uri);
                }
                buf.put_slice(&hello.nonce);
                buf.put_slice(&hello.signature);
            }
            Self::Ping => buf.put_u8(ControlKind::Ping as u8),
            Self::Pong => buf.put_u8(ControlKind::Pong as u8),
            Self::RoutingDigest(hints) => {
                buf.put_u8(ControlKind::RoutingDigest as u8);
                put_hints(&mut buf, hints);
            }
        }

        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = bytes;
        let kind = ControlKind::try_from(take_u8(&mut buf)?).map_err(|_| Error::MalformedPacket)?;

        Ok(match kind {
            ControlKind::Hello => {
                let mut network = [0u8; 4];
                take_slice(&mut buf, &mut network)?;

                let version = take_u8(&mut buf)?;
                let address = take_address(&mut buf)?;

                let count = take_u8(&mut buf)? as usize;
                if count > MAX_LIST_LEN {
                    return Err(Error::MalformedPacket);
                }

                let mut listen_uris = Vec::with_capacity(count);
                for _ in 0..count {
                    listen_uris.push(take_string(&mut buf)?);
                }

                let mut nonce = [0u8; 32];
                take_slice(&mut buf, &mut nonce)?;

                let mut signature = [0u8; SIGNATURE_SIZE];
                take_slice(&mut buf, &mut signature)?;

                Self::Hello(Hello {
                    network: NetworkId::new(network),
                    version,
                    address,
                    listen_uris,
                    nonce,
                    signature,
                })
            }
            ControlKind::Ping => Self::Ping,
            ControlKind::Pong => Self::Pong,
            ControlKind::RoutingDigest => Self::RoutingDigest(take_hints(&mut buf)?),
        })
    }
}

/// Queries answered by the discovery service of every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum DiscoveryRequest {
    /// Which services does the node host, and where.
    Manifest = 1,
    /// A sample of the node's peer table.
    Peers = 2,
}

impl DiscoveryRequest {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[*self as u8])
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = bytes;
        Self::try_from(take_u8(&mut buf)?).map_err(|_| Error::MalformedPacket)
    }
}

/// A node's declaration of which services it hosts and where.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<(u16, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryResponse {
    Manifest(Manifest),
    Peers(Vec<PeerHint>),
}

impl DiscoveryResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Self::Manifest(manifest) => {
                buf.put_u8(DiscoveryRequest::Manifest as u8);
                buf.put_u8(manifest.entries.len() as u8);
                for (service, uri) in &manifest.entries {
                    buf.put_u16(*service);
                    put_string(&mut buf, uri);
                }
            }
            Self::Peers(hints) => {
                buf.put_u8(DiscoveryRequest::Peers as u8);
                put_hints(&mut buf, hints);
            }
        }

        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = bytes;

        Ok(
            match DiscoveryRequest::try_from(take_u8(&mut buf)?)
                .map_err(|_| Error::MalformedPacket)?
            {
                DiscoveryRequest::Manifest => {
                    let count = take_u8(&mut buf)? as usize;
                    if count > MAX_LIST_LEN {
                        return Err(Error::MalformedPacket);
                    }

                    let mut entries = Vec::with_capacity(count);
                    for _ in 0..count {
                        if buf.remaining() < 2 {
                            return Err(Error::MalformedPacket);
                        }

                        let service = buf.get_u16();
                        entries.push((service, take_string(&mut buf)?));
                    }

                    Self::Manifest(Manifest { entries })
                }
                DiscoveryRequest::Peers => Self::Peers(take_hints(&mut buf)?),
            },
        )
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn put_hints(buf: &mut BytesMut, hints: &[PeerHint]) {
    buf.put_u8(hints.len() as u8);
    for hint in hints {
        buf.put_slice(hint.address.as_bytes());
        put_string(buf, &hint.uri);
    }
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, Error> {
    if buf.remaining() < 1 {
        return Err(Error::MalformedPacket);
    }

    Ok(buf.get_u8())
}

fn take_slice(buf: &mut &[u8], out: &mut [u8]) -> Result<(), Error> {
    if buf.remaining() < out.len() {
        return Err(Error::MalformedPacket);
    }

    buf.copy_to_slice(out);
    Ok(())
}

fn take_address(buf: &mut &[u8]) -> Result<Address, Error> {
    let mut bytes = [0u8; ADDRESS_SIZE];
    take_slice(buf, &mut bytes)?;

    Ok(Address::new(bytes))
}

fn take_string(buf: &mut &[u8]) -> Result<String, Error> {
    if buf.remaining() < 2 {
        return Err(Error::MalformedPacket);
    }

    let len = buf.get_u16() as usize;
    if len > MAX_URI_LEN || buf.remaining() < len {
        return Err(Error::MalformedPacket);
    }

    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);

    String::from_utf8(bytes).map_err(|_| Error::MalformedPacket)
}

fn take_hints(buf: &mut &[u8]) -> Result<Vec<PeerHint>, Error> {
    let count = take_u8(buf)? as usize;
    if count > MAX_LIST_LEN {
        return Err(Error::MalformedPacket);
    }

    let mut hints = Vec::with_capacity(count);
    for _ in 0..count {
        let address = take_address(buf)?;
        hints.push(PeerHint {
            address,
            uri: take_string(buf)?,
        });
    }

    Ok(hints)
}
