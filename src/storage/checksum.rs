//! Content checksums for backup manifests
//!
//! SHA-256 over the exact bytes that were captured. The digest is audit
//! metadata only: tiers that re-serialize JSON can change the bytes without
//! changing the document, so a mismatch is reported, never enforced.

use sha2::{Digest, Sha256};

/// Checksum and size of one serialized item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub checksum: String,
    pub size: u64,
}

/// Stateless hashing helpers
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumCodec;

impl ChecksumCodec {
    /// Lowercase hex SHA-256 of `bytes`
    pub fn hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn size(bytes: &[u8]) -> u64 {
        bytes.len() as u64
    }

    pub fn describe(bytes: &[u8]) -> ContentDigest {
        ContentDigest {
            checksum: Self::hash(bytes),
            size: Self::size(bytes),
        }
    }

    /// Digest of a directory: one `name:checksum` line per member, in the
    /// order given (callers pass members sorted by name).
    pub fn hash_directory<'a, I>(members: I) -> String
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut hasher = Sha256::new();
        for (name, checksum) in members {
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(checksum.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// True when `bytes` hash to `expected` (case-insensitive hex)
    pub fn matches(bytes: &[u8], expected: &str) -> bool {
        Self::hash(bytes).eq_ignore_ascii_case(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_known_vector() {
        assert_eq!(
            ChecksumCodec::hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_describe_reports_size() {
        let digest = ChecksumCodec::describe(b"[1,2,3]");
        assert_eq!(digest.size, 7);
        assert_eq!(digest.checksum.len(), 64);
    }

    #[test]
    fn test_reordered_json_changes_checksum() {
        // Same document, different key order: checksums differ
        let a = br#"{"id":"t1","name":"A"}"#;
        let b = br#"{"name":"A","id":"t1"}"#;
        assert_ne!(ChecksumCodec::hash(a), ChecksumCodec::hash(b));
        assert!(ChecksumCodec::matches(a, &ChecksumCodec::hash(a).to_uppercase()));
    }

    #[test]
    fn test_directory_hash_depends_on_members() {
        let one = ChecksumCodec::hash_directory([("1.json", "aa"), ("2.json", "bb")]);
        let same = ChecksumCodec::hash_directory([("1.json", "aa"), ("2.json", "bb")]);
        let other = ChecksumCodec::hash_directory([("1.json", "aa"), ("2.json", "cc")]);
        assert_eq!(one, same);
        assert_ne!(one, other);
    }
}
