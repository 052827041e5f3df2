//! Token vault: at-rest encryption for OAuth refresh tokens and other
//! provider secrets stored in `oauth_credentials.encrypted_data`.
//!
//! Payload format: `v1:<base64 iv>:<base64 tag>:<base64 ciphertext>`. The
//! key is SHA-256 of a process secret (the `CLIMPIRE_VAULT_SECRET` env var,
//! or a generated-and-persisted fallback — see `config.rs`).

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const FORMAT_TAG: &str = "v1";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("malformed vault payload: {0}")]
    Malformed(String),
    #[error("decryption failed")]
    Decrypt,
}

pub struct TokenVault {
    cipher: Aes256Gcm,
}

impl TokenVault {
    pub fn new(secret: &str) -> Self {
        let key_bytes = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let combined = self
            .cipher
            .encrypt(nonce, Payload::from(plaintext.as_bytes()))
            .map_err(|_| VaultError::Decrypt)?;

        // aes-gcm appends the 16-byte tag to the ciphertext; split it back
        // out so the wire format carries iv/tag/ciphertext as distinct fields.
        let tag_start = combined.len() - 16;
        let (ciphertext, tag) = combined.split_at(tag_start);

        Ok(format!(
            "{FORMAT_TAG}:{}:{}:{}",
            BASE64.encode(nonce_bytes),
            BASE64.encode(tag),
            BASE64.encode(ciphertext),
        ))
    }

    pub fn decrypt(&self, payload: &str) -> Result<String, VaultError> {
        let mut parts = payload.splitn(4, ':');
        let tag = parts.next().ok_or_else(|| VaultError::Malformed("empty payload".into()))?;
        if tag != FORMAT_TAG {
            return Err(VaultError::Malformed(format!("unknown format tag {tag}")));
        }
        let iv_b64 = parts.next().ok_or_else(|| VaultError::Malformed("missing iv".into()))?;
        let tag_b64 = parts.next().ok_or_else(|| VaultError::Malformed("missing tag".into()))?;
        let ct_b64 = parts.next().ok_or_else(|| VaultError::Malformed("missing ciphertext".into()))?;

        let iv = BASE64
            .decode(iv_b64)
            .map_err(|e| VaultError::Malformed(format!("bad iv: {e}")))?;
        if iv.len() != NONCE_LEN {
            return Err(VaultError::Malformed("iv length mismatch".into()));
        }
        let tag_bytes = BASE64
            .decode(tag_b64)
            .map_err(|e| VaultError::Malformed(format!("bad tag: {e}")))?;
        let ciphertext = BASE64
            .decode(ct_b64)
            .map_err(|e| VaultError::Malformed(format!("bad ciphertext: {e}")))?;

        let mut combined = ciphertext;
        combined.extend_from_slice(&tag_bytes);

        let nonce = Nonce::from_slice(&iv);
        let plaintext = self
            .cipher
            .decrypt(nonce, Payload::from(combined.as_slice()))
            .map_err(|_| VaultError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| VaultError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_a_refresh_token() {
        let vault = TokenVault::new("test-secret");
        let encrypted = vault.encrypt("gho_refresh_token_value").unwrap();
        assert!(encrypted.starts_with("v1:"));
        assert_eq!(vault.decrypt(&encrypted).unwrap(), "gho_refresh_token_value");
    }

    #[test]
    fn different_secrets_cannot_decrypt_each_others_payloads() {
        let a = TokenVault::new("secret-a");
        let b = TokenVault::new("secret-b");
        let encrypted = a.encrypt("super secret").unwrap();
        assert!(b.decrypt(&encrypted).is_err());
    }

    #[test]
    fn rejects_malformed_payload_shapes() {
        let vault = TokenVault::new("test-secret");
        assert!(vault.decrypt("not-a-vault-payload").is_err());
        assert!(vault.decrypt("v2:aa:bb:cc").is_err());
        assert!(vault.decrypt("v1:not-base64!!:bb:cc").is_err());
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let vault = TokenVault::new("test-secret");
        let encrypted = vault.encrypt("hello world").unwrap();
        let mut tampered = encrypted.clone();
        tampered.push('x');
        assert!(vault.decrypt(&tampered).is_err());
    }
}
