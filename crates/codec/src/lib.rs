//! ## Muddle wire codec
//!
//! Value types shared by every layer of the overlay: node addresses,
//! signing identities, the routed [`Packet`](packet::Packet) frame and the
//! control-plane payloads exchanged on the direct channel.
//!
//! Nodes in a muddle network are identified by public key rather than by
//! transport address. Every routed frame carries the sender's signature
//! over its canonical encoding, so the codec guarantees byte-identical
//! re-encoding for identical inputs; a packet signed on one node verifies
//! on any other regardless of how many hops it crossed.

pub mod address;
pub mod control;
pub mod identity;
pub mod packet;

use std::fmt;

/// Protocol version carried in every packet and handshake.
pub const VERSION: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Decode-time length mismatch, unknown version or truncated field.
    MalformedPacket,
    /// Signature verification failed.
    BadSignature,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 4 ASCII bytes partitioning the overlay. Packets from a different
/// network are dropped at ingress.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkId(pub [u8; 4]);

impl NetworkId {
    /// # Test
    ///
    /// ```
    /// use muddle_node_codec::NetworkId;
    ///
    /// assert_eq!(NetworkId::new(*b"TEST").as_u32(), 0x54455354);
    /// ```
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub const fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub const fn from_u32(value: u32) -> Self {
        Self(value.to_be_bytes())
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            if byte.is_ascii_graphic() {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "?")?;
            }
        }

        write!(f, "({:08x})", self.as_u32())
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
