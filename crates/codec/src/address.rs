use std::{fmt, str::FromStr};

use crate::Error;

/// Length of a node address in bytes.
pub const ADDRESS_SIZE: usize = 32;

/// A node address: the 32-byte public key of the node's identity.
///
/// Two addresses are equal iff their bytes are equal. The derived ordering
/// is the lexicographic byte comparison used by the duplicate-link
/// tiebreak.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    /// The all-zero address, used as the broadcast target on the wire.
    pub const ZERO: Self = Self([0u8; ADDRESS_SIZE]);

    pub const fn new(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self(
            <[u8; ADDRESS_SIZE]>::try_from(bytes).map_err(|_| Error::MalformedPacket)?,
        ))
    }

    pub const fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_SIZE]
    }

    /// Bitwise XOR of two addresses, interpreted as a 256-bit big-endian
    /// integer. Used only for ordering peers, never for transport.
    ///
    /// # Test
    ///
    /// ```
    /// use muddle_node_codec::address::Address;
    ///
    /// let a = Address::new([0xffu8; 32]);
    /// let b = Address::new([0x0fu8; 32]);
    ///
    /// assert_eq!(a.xor_distance(&b), [0xf0u8; 32]);
    /// assert_eq!(a.xor_distance(&a), [0u8; 32]);
    /// ```
    pub fn xor_distance(&self, other: &Address) -> [u8; ADDRESS_SIZE] {
        let mut out = [0u8; ADDRESS_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        out
    }

    /// Index of the highest bit where `other` differs from this address,
    /// counting bit 255 as the most significant bit of byte 0. `None` when
    /// the addresses are equal.
    ///
    /// This is the bucket index used by the kademlia peer table.
    pub fn bucket_index(&self, other: &Address) -> Option<usize> {
        for (i, byte) in self.xor_distance(other).into_iter().enumerate() {
            if byte != 0 {
                return Some((ADDRESS_SIZE - 1 - i) * 8 + (7 - byte.leading_zeros() as usize));
            }
        }

        None
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        let mut out = String::with_capacity(8);
        for byte in &self.0[..4] {
            out.push_str(&format!("{byte:02x}"));
        }

        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", self.short())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() != ADDRESS_SIZE * 2 {
            return Err(Error::MalformedPacket);
        }

        let mut bytes = [0u8; ADDRESS_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&value[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::MalformedPacket)?;
        }

        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
