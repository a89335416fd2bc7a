use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use sha2::{Digest, Sha256};

use crate::error::{NodeError, Result};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const FILE_KEY_DOMAIN: &[u8] = b"sds-slice-key-v1";

/// AES-256-GCM wire encoding for encrypted files: `nonce || ciphertext || tag`.
///
/// Every encrypted file has its own key, derived from a secret its owner holds, so any node
/// the owner hands the secret to can decode slices that were sealed elsewhere.
#[derive(Clone)]
pub struct SliceCipher {
    cipher: Aes256Gcm,
}

impl SliceCipher {
    pub fn from_key(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Key for one file: SHA-256 over a domain label and the length-prefixed inputs.
    pub fn for_file(owner_secret: &str, file_hash: &str, encryption_tag: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FILE_KEY_DOMAIN);
        for part in [owner_secret, file_hash, encryption_tag] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Self::from_key(&key)
    }

    pub fn wire_len(raw_len: u64) -> u64 {
        raw_len + (NONCE_LEN + TAG_LEN) as u64
    }

    pub fn encrypt(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, raw)
            .map_err(|_| NodeError::InternalData("slice encryption failed".into()))?;
        let mut wire = nonce.to_vec();
        wire.extend_from_slice(&sealed);
        Ok(wire)
    }

    pub fn decrypt(&self, wire: &[u8]) -> Result<Vec<u8>> {
        if wire.len() < NONCE_LEN + TAG_LEN {
            return Err(NodeError::InternalData(format!(
                "encrypted slice of {} bytes is shorter than nonce and tag",
                wire.len()
            )));
        }
        let (nonce, sealed) = wire.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| NodeError::InternalData("slice authentication failed".into()))
    }
}

impl std::fmt::Debug for SliceCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SliceCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_encoding_grows_by_nonce_and_tag() {
        let cipher = SliceCipher::for_file("secret", "fh", "k3y5t4g0");
        let raw = b"slice payload".to_vec();
        let wire = cipher.encrypt(&raw).unwrap();
        assert_eq!(wire.len() as u64, SliceCipher::wire_len(raw.len() as u64));
        assert_eq!(cipher.decrypt(&wire).unwrap(), raw);
    }

    #[test]
    fn tampered_or_foreign_payload_fails() {
        let cipher = SliceCipher::from_key(&[1u8; 32]);
        let mut wire = cipher.encrypt(b"abc").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert!(cipher.decrypt(&wire).is_err());

        let other = SliceCipher::from_key(&[7u8; 32]);
        let wire = cipher.encrypt(b"abc").unwrap();
        assert!(other.decrypt(&wire).is_err());
        assert!(cipher.decrypt(&[0u8; 8]).is_err());
    }

    #[test]
    fn file_key_is_shared_by_everyone_holding_the_secret() {
        let sealed = SliceCipher::for_file("owner-secret", "fh", "k3y5t4g0")
            .encrypt(b"slice sealed on the uploader")
            .unwrap();
        let elsewhere = SliceCipher::for_file("owner-secret", "fh", "k3y5t4g0");
        assert_eq!(elsewhere.decrypt(&sealed).unwrap(), b"slice sealed on the uploader");

        for (secret, hash, tag) in [
            ("other-secret", "fh", "k3y5t4g0"),
            ("owner-secret", "fh2", "k3y5t4g0"),
            ("owner-secret", "fh", "k3y5t4g1"),
            ("owner-secretfh", "", "k3y5t4g0"),
        ] {
            assert!(SliceCipher::for_file(secret, hash, tag).decrypt(&sealed).is_err(), "{secret}/{hash}/{tag}");
        }
    }
}
