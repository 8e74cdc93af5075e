use sha2::{Digest, Sha256};

/// Width of node ids and DHT keys in bytes (160 bits).
pub const ID_LEN: usize = 20;

pub struct CryptoUtils;

impl CryptoUtils {
    pub fn hash_sha256(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// First 160 bits of SHA-256 over `parts`, each length-prefixed so that
    /// ("ab", "c") and ("a", "bc") never collide.
    pub fn digest_160(parts: &[&[u8]]) -> [u8; ID_LEN] {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        let hash = hasher.finalize();
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&hash[..ID_LEN]);
        bytes
    }

    pub fn parse_id_hex(s: &str) -> Result<[u8; ID_LEN], hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; ID_LEN];
        array.copy_from_slice(&bytes);
        Ok(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_length_prefixed() {
        let a = CryptoUtils::digest_160(&[b"ab", b"c"]);
        let b = CryptoUtils::digest_160(&[b"a", b"bc"]);
        assert_ne!(a, b);
        assert_eq!(a, CryptoUtils::digest_160(&[b"ab", b"c"]));
    }

    #[test]
    fn test_parse_id_hex_rejects_wrong_length() {
        assert!(CryptoUtils::parse_id_hex("abcd").is_err());
        let hex = "00".repeat(ID_LEN);
        assert_eq!(CryptoUtils::parse_id_hex(&hex).unwrap(), [0u8; ID_LEN]);
    }
}
