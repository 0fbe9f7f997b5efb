use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;

use crate::address::Address;

/// Length of a detached signature in bytes (`r || s`).
pub const SIGNATURE_SIZE: usize = 64;

/// Length of a private-key seed in bytes.
pub const SEED_SIZE: usize = 32;

/// A node identity: the signing keypair whose public half is the node's
/// [`Address`].
pub struct Identity {
    key: SigningKey,
    address: Address,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let mut seed = [0u8; SEED_SIZE];
        rand::rng().fill_bytes(&mut seed);

        Self::from_seed(&seed)
    }

    /// Deterministically derive an identity from a 32-byte seed.
    ///
    /// # Test
    ///
    /// ```
    /// use muddle_node_codec::identity::Identity;
    ///
    /// let a = Identity::from_seed(&[7u8; 32]);
    /// let b = Identity::from_seed(&[7u8; 32]);
    ///
    /// assert_eq!(a.address(), b.address());
    /// ```
    pub fn from_seed(seed: &[u8; SEED_SIZE]) -> Self {
        let key = SigningKey::from_bytes(seed);
        let address = Address::new(key.verifying_key().to_bytes());

        Self { key, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn seed(&self) -> [u8; SEED_SIZE] {
        self.key.to_bytes()
    }

    /// Sign an arbitrary message, returning the detached `r || s` bytes.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({:?})", self.address)
    }
}

/// Verify a detached signature against the public key carried in an
/// address. Unknown or malformed public keys simply fail verification.
pub fn verify(address: &Address, message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> bool {
    match VerifyingKey::from_bytes(address.as_bytes()) {
        Ok(key) => key
            .verify(message, &Signature::from_bytes(signature))
            .is_ok(),
        Err(_) => false,
    }
}
