//! Hashing System - content hashes for the document image store
//!
//! Identical QR renders for the same URL collapse to one stored image.

use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes
            .as_ref()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Serde adapter carrying raw bytes as standard base64 strings in JSON.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[test]
    fn test_hash_deterministic() {
        let data = b"test data";
        let h1 = sha256_hex(data);
        let h2 = sha256_hex(data);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_different_images_differ() {
        assert_ne!(sha256_hex(b"qr-a"), sha256_hex(b"qr-b"));
    }

    #[derive(Serialize, Deserialize)]
    struct Payload {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    }

    #[test]
    fn test_bytes_travel_as_base64() {
        let payload = Payload {
            bytes: vec![0x89, b'P', b'N', b'G'],
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"bytes":"iVBORw=="}"#);
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bytes, vec![0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        assert!(serde_json::from_str::<Payload>(r#"{"bytes":"***"}"#).is_err());
    }
}
