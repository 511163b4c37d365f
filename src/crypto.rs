/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The crypto facade: hashing and signing. Every digest in the protocol is a
//! Sha256 digest, and every signature an Ed25519 signature over raw message
//! bytes.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::types::basic::{CryptoHash, SignatureBytes};

pub fn hash(bytes: &[u8]) -> CryptoHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    CryptoHash::new(hasher.finalize().into())
}

/// `H(a ‖ b)`.
pub fn hash_two(a: &[u8], b: &[u8]) -> CryptoHash {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    CryptoHash::new(hasher.finalize().into())
}

/// Digest of a batch of payloads: the hash of their concatenation. An empty
/// batch hashes to the empty byte string, so that a payload-free proposal
/// still chains deterministically.
pub fn batch_hash(items: &[Vec<u8>]) -> Vec<u8> {
    if items.is_empty() {
        return Vec::new();
    }
    let mut hasher = Sha256::new();
    for item in items {
        hasher.update(item);
    }
    hasher.finalize().to_vec()
}

/// A wrapper around [SigningKey] with a convenience method for creating
/// signatures over messages represented as byte slices.
#[derive(Clone)]
pub struct Keypair(SigningKey);

impl Keypair {
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(message).to_bytes())
    }

    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn batch_hash_of_empty_batch_is_empty() {
        assert!(batch_hash(&[]).is_empty());
        assert_eq!(batch_hash(&[b"r1".to_vec()]).len(), 32);
    }

    #[test]
    fn hash_two_is_concatenation() {
        assert_eq!(hash_two(b"ab", b"cd"), hash(b"abcd"));
    }

    #[test]
    fn sign_then_verify() {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng));
        let sig = keypair.sign(b"a message");
        let set = crate::types::ValidatorSet::new(vec![keypair.public()]);
        assert!(set.verify(crate::types::ReplicaId::new(0), b"a message", &sig));
        assert!(!set.verify(crate::types::ReplicaId::new(0), b"another message", &sig));
        assert!(!set.verify(crate::types::ReplicaId::new(1), b"a message", &sig));
    }
}
