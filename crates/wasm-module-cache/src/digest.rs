use sha2::{Digest, Sha256};

/// Prefix used by registries for SHA-256 digests.
pub(crate) const SHA256_PREFIX: &str = "sha256:";

/// Hex-encoded SHA-256 of `bytes`, without any algorithm prefix.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Normalise a user-supplied checksum: trims whitespace, drops an optional
/// `sha256:` prefix and lowercases the hex digits.
pub(crate) fn normalize_checksum(checksum: &str) -> String {
    let trimmed = checksum.trim();
    let hex = trimmed.strip_prefix(SHA256_PREFIX).unwrap_or(trimmed);
    hex.to_ascii_lowercase()
}

/// Whether `s` is a 64 character hex string.
pub(crate) fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
