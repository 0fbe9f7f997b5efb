use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    Error, NetworkId, VERSION,
    address::{ADDRESS_SIZE, Address},
    identity::{Identity, SIGNATURE_SIZE, verify},
};

/// Fixed header length: everything before the payload.
pub const HEADER_SIZE: usize = 83;

/// Hard bound on the payload length carried in a single packet.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default hop budget for routed packets.
pub const DEFAULT_TTL: u8 = 40;

/// Flag bits of header byte 1.
pub mod flags {
    /// Exactly one named target; deliver exactly once.
    pub const DIRECT: u8 = 1 << 0;
    /// Flood to every live link; target field is zero.
    pub const BROADCAST: u8 = 1 << 1;
    /// Reply half of an exchange, matched against a pending promise.
    pub const EXCHANGE: u8 = 1 << 2;
    /// Payload is encrypted; routed opaquely.
    pub const ENCRYPTED: u8 = 1 << 3;
    /// Payload carries a stamp; routed opaquely.
    pub const STAMP: u8 = 1 << 4;
    /// Payload carries its own inner signature.
    pub const SIGNED_PAYLOAD: u8 = 1 << 5;
}

/// A single routed frame of the overlay.
///
/// The encoding is canonical: encoding the same packet twice yields the
/// same bytes, which is what makes the trailing signature portable across
/// forwarding hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub flags: u8,
    pub service: u16,
    pub channel: u16,
    pub counter: u32,
    pub ttl: u8,
    pub network: NetworkId,
    pub sender: Address,
    /// Zero when broadcasting.
    pub target: Address,
    pub payload: Bytes,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Packet {
    /// A packet with a single named target.
    pub fn direct(
        network: NetworkId,
        sender: Address,
        target: Address,
        service: u16,
        channel: u16,
        counter: u32,
        payload: Bytes,
    ) -> Self {
        Self {
            version: VERSION,
            flags: flags::DIRECT,
            service,
            channel,
            counter,
            ttl: DEFAULT_TTL,
            network,
            sender,
            target,
            payload,
            signature: [0u8; SIGNATURE_SIZE],
        }
    }

    /// A packet flooded to every live link.
    pub fn broadcast(
        network: NetworkId,
        sender: Address,
        service: u16,
        channel: u16,
        counter: u32,
        payload: Bytes,
    ) -> Self {
        Self {
            version: VERSION,
            flags: flags::BROADCAST,
            service,
            channel,
            counter,
            ttl: DEFAULT_TTL,
            network,
            sender,
            target: Address::ZERO,
            payload,
            signature: [0u8; SIGNATURE_SIZE],
        }
    }

    /// The reply half of an exchange: same (service, channel, counter) as
    /// the request, addressed back at its sender.
    pub fn exchange_reply(&self, own: Address, payload: Bytes) -> Self {
        Self {
            version: VERSION,
            flags: flags::DIRECT | flags::EXCHANGE,
            service: self.service,
            channel: self.channel,
            counter: self.counter,
            ttl: DEFAULT_TTL,
            network: self.network,
            sender: own,
            target: self.sender,
            payload,
            signature: [0u8; SIGNATURE_SIZE],
        }
    }

    pub fn is_direct(&self) -> bool {
        self.flags & flags::DIRECT != 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & flags::BROADCAST != 0
    }

    pub fn is_exchange(&self) -> bool {
        self.flags & flags::EXCHANGE != 0
    }

    /// True while the signature field is still all zeroes. Such a frame is
    /// only acceptable on an already-authenticated direct channel.
    pub fn is_unsigned(&self) -> bool {
        self.signature == [0u8; SIGNATURE_SIZE]
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + SIGNATURE_SIZE
    }

    fn put_header(&self, buf: &mut BytesMut, ttl: u8) {
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_u16(self.service);
        buf.put_u16(self.channel);
        buf.put_u32(self.counter);
        buf.put_u8(ttl);
        buf.put_slice(&self.network.0);
        buf.put_slice(self.sender.as_bytes());
        buf.put_slice(self.target.as_bytes());
        buf.put_u32(self.payload.len() as u32);
    }

    /// The byte range covered by the signature: the header followed by the
    /// payload. The ttl byte is encoded as zero here because every
    /// forwarding hop rewrites it, and the sender's signature has to stay
    /// valid along the whole path.
    pub fn signable(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.put_header(&mut buf, 0);
        buf.put_slice(&self.payload);

        buf
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.put_header(&mut buf, self.ttl);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.signature);

        buf.freeze()
    }

    /// # Test
    ///
    /// ```
    /// use bytes::Bytes;
    /// use muddle_node_codec::{NetworkId, packet::Packet, address::Address};
    ///
    /// let packet = Packet::broadcast(
    ///     NetworkId::new(*b"TEST"),
    ///     Address::new([1u8; 32]),
    ///     1920,
    ///     101,
    ///     1,
    ///     Bytes::from_static(b"Hello world"),
    /// );
    ///
    /// let decoded = Packet::decode(&packet.encode()).unwrap();
    ///
    /// assert_eq!(decoded, packet);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_SIZE + SIGNATURE_SIZE {
            return Err(Error::MalformedPacket);
        }

        if bytes[0] != VERSION {
            return Err(Error::MalformedPacket);
        }

        let payload_len =
            u32::from_be_bytes([bytes[79], bytes[80], bytes[81], bytes[82]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(Error::MalformedPacket);
        }

        if bytes.len() != HEADER_SIZE + payload_len + SIGNATURE_SIZE {
            return Err(Error::MalformedPacket);
        }

        let mut network = [0u8; 4];
        network.copy_from_slice(&bytes[11..15]);

        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&bytes[HEADER_SIZE + payload_len..]);

        Ok(Self {
            version: bytes[0],
            flags: bytes[1],
            service: u16::from_be_bytes([bytes[2], bytes[3]]),
            channel: u16::from_be_bytes([bytes[4], bytes[5]]),
            counter: u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            ttl: bytes[10],
            network: NetworkId::new(network),
            sender: Address::from_slice(&bytes[15..15 + ADDRESS_SIZE])?,
            target: Address::from_slice(&bytes[47..47 + ADDRESS_SIZE])?,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + payload_len]),
            signature,
        })
    }

    /// Sign the canonical encoding with the sender's identity.
    pub fn sign(&mut self, identity: &Identity) {
        self.signature = identity.sign(&self.signable());
    }

    /// Recompute the signed range and check the signature against the
    /// sender address.
    pub fn verify(&self) -> Result<(), Error> {
        if verify(&self.sender, &self.signable(), &self.signature) {
            Ok(())
        } else {
            Err(Error::BadSignature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(identity: &Identity) -> Packet {
        let mut packet = Packet::direct(
            NetworkId::new(*b"TEST"),
            identity.address(),
            Address::new([9u8; ADDRESS_SIZE]),
            1920,
            101,
            7,
            Bytes::from_static(b"Hello world"),
        );
        packet.sign(identity);

        packet
    }

    #[test]
    fn sign_then_verify() {
        let identity = Identity::generate();
        let packet = sample(&identity);

        assert!(packet.verify().is_ok());
    }

    #[test]
    fn flipping_a_signed_byte_invalidates() {
        let identity = Identity::generate();
        let packet = sample(&identity);

        let mut bytes = BytesMut::from(packet.encode().as_ref());
        // Service id, high byte.
        bytes[2] ^= 0x01;

        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.verify(), Err(Error::BadSignature));
    }

    #[test]
    fn flipping_a_payload_byte_invalidates() {
        let identity = Identity::generate();
        let packet = sample(&identity);

        let mut bytes = BytesMut::from(packet.encode().as_ref());
        bytes[HEADER_SIZE] ^= 0xff;

        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.verify(), Err(Error::BadSignature));
    }

    #[test]
    fn ttl_rewrite_preserves_signature() {
        let identity = Identity::generate();
        let mut packet = sample(&identity);

        packet.ttl -= 1;
        assert!(packet.verify().is_ok());
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let identity = Identity::generate();
        let bytes = sample(&identity).encode();

        assert_eq!(
            Packet::decode(&bytes[..bytes.len() - 1]),
            Err(Error::MalformedPacket)
        );
        assert_eq!(Packet::decode(&bytes[..10]), Err(Error::MalformedPacket));
    }

    #[test]
    fn unknown_version_is_malformed() {
        let identity = Identity::generate();
        let mut bytes = BytesMut::from(sample(&identity).encode().as_ref());
        bytes[0] = 3;

        assert_eq!(Packet::decode(&bytes), Err(Error::MalformedPacket));
    }

    #[test]
    fn payload_length_bound() {
        let identity = Identity::generate();
        let mut packet = sample(&identity);
        packet.payload = Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE]);
        packet.sign(&identity);

        let bytes = packet.encode();
        assert!(Packet::decode(&bytes).is_ok());

        // One byte over the bound: rewrite the length field and extend.
        let mut over = BytesMut::from(bytes.as_ref());
        let len = (MAX_PAYLOAD_SIZE as u32 + 1).to_be_bytes();
        over[79..83].copy_from_slice(&len);
        over.extend_from_slice(&[0u8]);

        assert_eq!(Packet::decode(&over), Err(Error::MalformedPacket));
    }
}
