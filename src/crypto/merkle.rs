//! Merkle tree root calculation over transaction ids
//!
//! Each level pairs adjacent hashes and combines them with double SHA-256,
//! duplicating the last hash when a level has an odd count.

use super::hash::{hash256, Hash256};

/// Calculate the merkle root from a list of transaction ids
pub fn merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return Hash256::ZERO;
    }

    let mut level: Vec<Hash256> = hashes.to_vec();

    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);

        for chunk in level.chunks(2) {
            let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };
            next.push(combine(&chunk[0], &right));
        }

        level = next;
    }

    level[0]
}

fn combine(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    hash256(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merkle_root_single() {
        let h = hash256(b"tx1");
        assert_eq!(merkle_root(&[h]), h);
    }

    #[test]
    fn test_merkle_root_two() {
        let h1 = hash256(b"tx1");
        let h2 = hash256(b"tx2");

        let root = merkle_root(&[h1, h2]);
        assert_eq!(root, combine(&h1, &h2));
    }

    #[test]
    fn test_merkle_root_odd_duplicates_last() {
        let h1 = hash256(b"tx1");
        let h2 = hash256(b"tx2");
        let h3 = hash256(b"tx3");

        let root = merkle_root(&[h1, h2, h3]);
        let expected = combine(&combine(&h1, &h2), &combine(&h3, &h3));
        assert_eq!(root, expected);
    }

    #[test]
    fn test_merkle_root_order_matters() {
        let h1 = hash256(b"tx1");
        let h2 = hash256(b"tx2");
        assert_ne!(merkle_root(&[h1, h2]), merkle_root(&[h2, h1]));
    }

    #[test]
    fn test_merkle_root_empty() {
        assert_eq!(merkle_root(&[]), Hash256::ZERO);
    }
}
