use sha2::{Digest, Sha256};

/// Returns the sha256 checksum of one piece of payload data.
pub fn generate_checksum(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Returns the aggregate integrity hash over an ordered piece checksum list.
pub fn generate_integrity_checksum(checksums: &[Vec<u8>]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for checksum in checksums {
        hasher.update(checksum);
    }
    hasher.finalize().to_vec()
}
