//! Content fingerprints.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte SHA-256 fingerprint.
///
/// Used for chunk identity, pack identity (hash of the encoded pack bytes),
/// and file-version identity (hash of name || concatenated chunk sums). The
/// hash function is fixed at repository creation and never varies.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Create a Fingerprint from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute the SHA-256 fingerprint of data.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create an incremental hasher.
    pub fn hasher() -> FingerprintHasher {
        FingerprintHasher(Sha256::new())
    }

    /// Parse from a slice, which must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() != 32 {
            return Err(crate::Error::InvalidHash(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Parse from a lowercase or uppercase hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidHash(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk)
                .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Get the object store key for a pack with this sum.
    pub fn pack_object_key(&self) -> String {
        format!("{}.pack", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// Fingerprints travel as hex strings in every JSON payload.
impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(D::Error::custom)
    }
}

/// Incremental SHA-256 hasher.
pub struct FingerprintHasher(Sha256);

impl FingerprintHasher {
    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the fingerprint.
    pub fn finalize(self) -> Fingerprint {
        Fingerprint(self.0.finalize().into())
    }
}

/// Compute the identity of a file version: hash of the file name followed by
/// the ordered chunk fingerprints.
pub fn version_sum(name: &str, chunks: &[Fingerprint]) -> Fingerprint {
    let mut hasher = Fingerprint::hasher();
    hasher.update(name.as_bytes());
    for sum in chunks {
        hasher.update(sum.as_bytes());
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let sum = Fingerprint::compute(b"hello world");
        let hex = sum.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Fingerprint::from_hex(&hex).unwrap(), sum);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(Fingerprint::from_hex("abcd").is_err());
        assert!(Fingerprint::from_hex(&"g".repeat(64)).is_err());
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut hasher = Fingerprint::hasher();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), Fingerprint::compute(b"hello world"));
    }

    #[test]
    fn serde_as_hex_string() {
        let sum = Fingerprint::compute(b"x");
        let json = serde_json::to_string(&sum).unwrap();
        assert_eq!(json, format!("\"{}\"", sum.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sum);
    }

    #[test]
    fn version_sum_depends_on_name_and_order() {
        let a = Fingerprint::compute(b"a");
        let b = Fingerprint::compute(b"b");

        let s1 = version_sum("file", &[a, b]);
        assert_eq!(version_sum("file", &[a, b]), s1);
        assert_ne!(version_sum("file", &[b, a]), s1);
        assert_ne!(version_sum("other", &[a, b]), s1);
    }

    #[test]
    fn pack_object_key_format() {
        let sum = Fingerprint::compute(b"pack");
        let key = sum.pack_object_key();
        assert!(key.ends_with(".pack"));
        assert_eq!(key.len(), 64 + 5);
    }
}
