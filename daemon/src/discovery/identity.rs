//! XOR distance between node identities.
//!
//! Identities are 512-bit public keys; distances are computed between their
//! keccak256 hashes, which gives a uniformly distributed 256-bit key space.

use std::cmp::Ordering;

use kestrel_common::crypto::{Hash, HASH_SIZE};

/// Number of bits in a distance.
pub const DISTANCE_BITS: usize = HASH_SIZE * 8;

/// Bitwise XOR of two hashes.
pub fn xor_distance(a: &Hash, b: &Hash) -> Hash {
    let mut result = [0u8; HASH_SIZE];
    for (out, (x, y)) in result
        .iter_mut()
        .zip(a.as_bytes().iter().zip(b.as_bytes().iter()))
    {
        *out = x ^ y;
    }
    Hash::new(result)
}

/// Whether bit `bit` (0 = most significant) of a distance is set.
pub fn is_bit_set(distance: &Hash, bit: usize) -> bool {
    let byte = distance.as_bytes()[bit >> 3];
    byte & (0x80 >> (bit & 7)) != 0
}

/// Compare the distances of `a` and `b` to `target`.
///
/// Returns `Ordering::Less` if `a` is closer to `target` than `b`.
pub fn compare_distance(target: &Hash, a: &Hash, b: &Hash) -> Ordering {
    // Hash ordering is big-endian byte order
    xor_distance(target, a).cmp(&xor_distance(target, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::crypto::KeyPair;

    #[test]
    fn test_xor_distance_self() {
        let keypair = KeyPair::generate();
        let hash = keypair.node_id().hash();
        let distance = xor_distance(&hash, &hash);
        assert_eq!(distance, Hash::zero());
    }

    #[test]
    fn test_xor_distance_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        let (a, b) = (a.node_id().hash(), b.node_id().hash());
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        assert_ne!(xor_distance(&a, &b), Hash::zero());
    }

    #[test]
    fn test_is_bit_set() {
        let mut bytes = [0u8; HASH_SIZE];
        bytes[0] = 0b1000_0000;
        bytes[1] = 0b0000_0001;
        bytes[31] = 0b0000_0001;
        let distance = Hash::new(bytes);

        assert!(is_bit_set(&distance, 0));
        assert!(!is_bit_set(&distance, 1));
        assert!(is_bit_set(&distance, 15));
        assert!(is_bit_set(&distance, DISTANCE_BITS - 1));
        assert!(!is_bit_set(&distance, DISTANCE_BITS - 2));
    }

    #[test]
    fn test_compare_distance() {
        let target = Hash::new([0u8; HASH_SIZE]);
        let mut near = [0u8; HASH_SIZE];
        near[31] = 1;
        let mut far = [0u8; HASH_SIZE];
        far[0] = 1;

        let near = Hash::new(near);
        let far = Hash::new(far);
        assert_eq!(compare_distance(&target, &near, &far), Ordering::Less);
        assert_eq!(compare_distance(&target, &far, &near), Ordering::Greater);
        assert_eq!(compare_distance(&target, &far, &far), Ordering::Equal);
    }
}
