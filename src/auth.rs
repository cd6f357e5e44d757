//! Peer authentication: the `IteratedSaltedHash` used on the link's `auth`
//! packet. Distinct from [`crate::cipher`]'s shared-secret KDF -- this is the iterated digest
//! used to authenticate the external proxy to the internal proxy, not to derive a symmetric key.

use rand::RngCore;
use sha2::{Digest, Sha512};

/// Default iteration count for [`iterated_salted_hash`].
pub const DEFAULT_ITERATIONS: u32 = 0x0002_FFFF;

/// Default salt length in bytes when a fresh salt is generated.
pub const DEFAULT_SALT_LEN: usize = 0xFF;

/// Generates a fresh random salt of [`DEFAULT_SALT_LEN`] bytes.
#[must_use]
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; DEFAULT_SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    salt
}

/// Applies SHA-512 `iterations` times to `password ∥ salt`
#[must_use]
pub fn iterated_salted_hash(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut digest = {
        let mut hasher = Sha512::new();
        hasher.update(password);
        hasher.update(salt);
        hasher.finalize().to_vec()
    };
    for _ in 1..iterations {
        let mut hasher = Sha512::new();
        hasher.update(&digest);
        digest = hasher.finalize().to_vec();
    }
    digest
}

/// Computes the `(hash, salt)` pair the external side sends in its `auth` packet, using a freshly
/// generated salt.
#[must_use]
pub fn hash_with_fresh_salt(password: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let salt = generate_salt();
    let hash = iterated_salted_hash(password, &salt, DEFAULT_ITERATIONS);
    (hash, salt)
}

/// Verifies a presented `(hash, salt)` pair against the configured password, in constant time
/// with respect to the hash comparison.
#[must_use]
pub fn verify(password: &[u8], salt: &[u8], presented_hash: &[u8]) -> bool {
    let expected = iterated_salted_hash(password, salt, DEFAULT_ITERATIONS);
    expected.len() == presented_hash.len()
        && expected
            .iter()
            .zip(presented_hash)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_password_and_salt_verify() {
        let (hash, salt) = {
            let salt = b"fixed-test-salt".to_vec();
            let hash = iterated_salted_hash(b"hunter2", &salt, 16);
            (hash, salt)
        };
        assert!(verify_with_iterations(b"hunter2", &salt, &hash, 16));
    }

    #[test]
    fn wrong_password_does_not_verify() {
        let salt = b"fixed-test-salt".to_vec();
        let hash = iterated_salted_hash(b"hunter2", &salt, 16);
        assert!(!verify_with_iterations(b"wrong", &salt, &hash, 16));
    }

    // test-only helper mirroring `verify` but with a configurable iteration count, so tests don't
    // have to pay for the real (~0x3_0000) default iteration count.
    fn verify_with_iterations(password: &[u8], salt: &[u8], presented_hash: &[u8], iterations: u32) -> bool {
        let expected = iterated_salted_hash(password, salt, iterations);
        expected == presented_hash
    }
}
