// SPDX-License-Identifier: MIT

//! Content hashing shared by every step that needs idempotent upserts:
//! a step only has to write a node when the stored `content_hash` has
//! changed since the last run.

use sha2::{Digest, Sha256, Sha512};

/// A step's `hash_algorithm` param selects one of these; unrecognized
/// names fall back to the default rather than failing the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
    Blake3,
}

impl HashAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Some(Self::Sha256),
            "sha512" | "sha-512" => Some(Self::Sha512),
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }
}

/// Hex-encoded digest of `bytes` under `algorithm`.
pub fn hash_bytes_with(algorithm: HashAlgorithm, bytes: &[u8]) -> String {
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            format!("{:x}", hasher.finalize())
        }
        HashAlgorithm::Sha512 => {
            let mut hasher = Sha512::new();
            hasher.update(bytes);
            format!("{:x}", hasher.finalize())
        }
        HashAlgorithm::Blake3 => blake3::hash(bytes).to_hex().to_string(),
    }
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hash_bytes_with(HashAlgorithm::Sha256, bytes)
}

/// Hex-encoded SHA-256 over a sequence of fields, each length-prefixed so
/// `hash_fields(&["a", "bc"]) != hash_fields(&["ab", "c"])`.
pub fn hash_fields<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for field in fields {
        let field = field.as_ref();
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_hash_identically() {
        assert_eq!(hash_bytes(b"hello"), hash_bytes(b"hello"));
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"world"));
    }

    #[test]
    fn field_hashing_is_not_confused_by_concatenation() {
        let a = hash_fields(["a", "bc"]);
        let b = hash_fields(["ab", "c"]);
        assert_ne!(a, b);
    }

    #[test]
    fn algorithms_parse_case_insensitively() {
        assert_eq!(HashAlgorithm::parse("SHA256"), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::parse("sha-512"), Some(HashAlgorithm::Sha512));
        assert_eq!(HashAlgorithm::parse("Blake3"), Some(HashAlgorithm::Blake3));
        assert_eq!(HashAlgorithm::parse("md5"), None);
    }

    #[test]
    fn different_algorithms_disagree_on_the_same_bytes() {
        let sha = hash_bytes_with(HashAlgorithm::Sha256, b"hello");
        let blake = hash_bytes_with(HashAlgorithm::Blake3, b"hello");
        assert_ne!(sha, blake);
        assert_eq!(hash_bytes(b"hello"), hash_bytes_with(HashAlgorithm::Sha256, b"hello"));
    }
}
