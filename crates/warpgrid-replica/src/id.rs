//! Node identifier generation.

use sha2::{Digest, Sha256};

/// Derive a stable node id from the address a member will listen on.
///
/// The id is the first eight bytes of the address's SHA-256 digest, so the
/// same address always maps to the same id. Zero is reserved by the engine
/// and is never returned.
pub fn generate_id(address: &str) -> u64 {
    let digest = Sha256::digest(address.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    match u64::from_be_bytes(prefix) {
        0 => 1,
        id => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_address_same_id() {
        assert_eq!(generate_id("10.0.0.1:9000"), generate_id("10.0.0.1:9000"));
    }

    #[test]
    fn different_addresses_differ() {
        let ids: std::collections::HashSet<u64> = (0..1000)
            .map(|i| generate_id(&format!("10.0.{}.{}:9000", i / 256, i % 256)))
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn never_zero() {
        assert_ne!(generate_id(""), 0);
        assert_ne!(generate_id("127.0.0.1:9001"), 0);
    }
}
