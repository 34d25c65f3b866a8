//! Content digests and the fingerprinter.
//!
//! Blocks and artifacts are both identified by the SHA-256 digest of their
//! contents, written `sha256:<hex>` as the registry API does. Two chunks
//! with the same digest are treated as the same content: the engine never
//! compares bytes on a digest match, it relies on SHA-256 being collision
//! resistant.

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// The only digest algorithm currently supported.
pub const ALGORITHM: &str = "sha256";

const DIGEST_LEN: usize = 32;

/// A SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

/// Error returned when parsing a malformed digest string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestParseError {
    /// The string had no `algorithm:` prefix.
    #[error("missing algorithm prefix in {0:?}")]
    MissingAlgorithm(String),

    /// The algorithm is not supported.
    #[error("unsupported digest algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    /// The hex part was not 64 lowercase hex characters.
    #[error("invalid hex in digest {0:?}")]
    InvalidHex(String),
}

impl Digest {
    /// Construct a digest from raw hash bytes.
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex encoding of the hash, without the algorithm prefix.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The algorithm name.
    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    /// Storage key for this digest under `root`, sharded by the first two
    /// hex characters: `<root>/sha256/<hh>/<hex><suffix>`.
    pub(crate) fn sharded_key(&self, root: &str, suffix: &str) -> Utf8PathBuf {
        let hex = self.hex();
        Utf8PathBuf::from(format!("{root}/{ALGORITHM}/{}/{hex}{suffix}", &hex[..2]))
    }

    /// Inverse of [`Digest::sharded_key`]: recover a digest from the final
    /// path component of a key.
    pub(crate) fn from_key(key: &camino::Utf8Path, suffix: &str) -> Option<Self> {
        let name = key.file_name()?.strip_suffix(suffix)?;
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(name, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ALGORITHM}:{}", self.hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| DigestParseError::MissingAlgorithm(s.to_string()))?;

        if algorithm != ALGORITHM {
            return Err(DigestParseError::UnsupportedAlgorithm(algorithm.to_string()));
        }

        if hex.len() != DIGEST_LEN * 2 || hex.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(DigestParseError::InvalidHex(s.to_string()));
        }

        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(hex, &mut bytes)
            .map_err(|_| DigestParseError::InvalidHex(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compute the digest of a byte slice.
pub fn fingerprint(data: &[u8]) -> Digest {
    Digest(Sha256::digest(data).into())
}

/// Incremental digest computation, for content which arrives in pieces.
#[derive(Clone, Default)]
pub struct Fingerprinter {
    hasher: Sha256,
    len: u64,
}

impl fmt::Debug for Fingerprinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fingerprinter")
            .field("len", &self.len)
            .finish()
    }
}

impl Fingerprinter {
    /// A fresh fingerprinter over zero bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more content.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether no bytes have been fed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish, returning the digest of everything fed.
    pub fn finalize(self) -> Digest {
        Digest(self.hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("")
    const EMPTY: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn parse_and_display() {
        let digest: Digest = EMPTY.parse().unwrap();
        assert_eq!(digest.to_string(), EMPTY);
        assert_eq!(digest, fingerprint(b""));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(matches!(
            "e3b0c442".parse::<Digest>(),
            Err(DigestParseError::MissingAlgorithm(_))
        ));
        assert!(matches!(
            "sha512:abcd".parse::<Digest>(),
            Err(DigestParseError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            "sha256:abcd".parse::<Digest>(),
            Err(DigestParseError::InvalidHex(_))
        ));
        assert!(EMPTY.to_uppercase().replace("SHA256", "sha256").parse::<Digest>().is_err());
    }

    #[test]
    fn streaming_matches_oneshot() {
        let mut fp = Fingerprinter::new();
        fp.update(b"hello ");
        fp.update(b"world");
        assert_eq!(fp.len(), 11);
        assert_eq!(fp.finalize(), fingerprint(b"hello world"));
    }

    #[test]
    fn sharded_keys_roundtrip() {
        let digest = fingerprint(b"block");
        let key = digest.sharded_key("blocks", "");
        let hex = digest.hex();
        assert_eq!(key.as_str(), format!("blocks/sha256/{}/{hex}", &hex[..2]));
        assert_eq!(Digest::from_key(&key, ""), Some(digest));

        let key = digest.sharded_key("recipes", ".json");
        assert!(key.as_str().ends_with(".json"));
        assert_eq!(Digest::from_key(&key, ".json"), Some(digest));
        assert_eq!(Digest::from_key(&key, ""), None);
    }

    #[test]
    fn serde_as_string() {
        let digest = fingerprint(b"x");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{digest}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }

    // Equal digests are treated as equal content without a byte comparison;
    // distinct content must therefore yield distinct digests.
    #[test]
    fn digest_equality_stands_in_for_content_equality() {
        assert_eq!(fingerprint(b"same bytes"), fingerprint(b"same bytes"));
        assert_ne!(fingerprint(b"same bytes"), fingerprint(b"same bytez"));
    }
}
