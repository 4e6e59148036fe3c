use sha2::{Digest, Sha256};

/// SHA-256 digest of a file's bytes as lowercase hex.
///
/// Used at batch creation to suppress duplicate uploads: the first occurrence
/// of a digest is kept, later occurrences count as skipped duplicates.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
