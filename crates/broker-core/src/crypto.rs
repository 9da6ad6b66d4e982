//! Symmetric encryption for stored broker credentials.
//!
//! The key is derived from a process master secret with PBKDF2-HMAC-SHA256
//! and a configured salt; payloads are sealed with AES-256-GCM. The random
//! nonce is prepended to the ciphertext and the whole token is wrapped in
//! URL-safe base64, so `decrypt(encrypt(x)) == x` and any tampering fails
//! the authentication tag.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::config::EncryptionConfig;
use crate::{Error, Result};

/// AES-GCM nonce size (96 bits as recommended).
const NONCE_SIZE: usize = 12;

/// Encrypts and decrypts credential strings.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(config: &EncryptionConfig) -> Self {
        Self::derive(
            &config.master_secret,
            &config.salt,
            config.kdf_iterations,
        )
    }

    /// Derive the AES key from a master secret.
    pub fn derive(master_secret: &str, salt: &str, iterations: u32) -> Self {
        let mut key_bytes = [0u8; 32];
        pbkdf2_hmac::<Sha256>(
            master_secret.as_bytes(),
            salt.as_bytes(),
            iterations,
            &mut key_bytes,
        );
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt a credential. Empty input round-trips to the empty string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| Error::Crypto("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE.encode(sealed))
    }

    /// Decrypt a credential token produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, token: &str) -> Result<String> {
        if token.is_empty() {
            return Ok(String::new());
        }

        let sealed = URL_SAFE
            .decode(token)
            .map_err(|_| Error::Crypto("invalid base64 token".to_string()))?;
        if sealed.len() <= NONCE_SIZE {
            return Err(Error::Crypto("token too short".to_string()));
        }

        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &sealed[NONCE_SIZE..])
            .map_err(|_| Error::Crypto("invalid or corrupted token".to_string()))?;

        String::from_utf8(plaintext).map_err(|_| Error::Crypto("token is not UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> CredentialCipher {
        // Low iteration count keeps the KDF fast in debug test runs.
        CredentialCipher::derive("test-master-secret", "test-salt", 1_000)
    }

    #[test]
    fn test_round_trip() {
        let cipher = test_cipher();
        let token = cipher.encrypt("kite-api-key-12345").unwrap();
        assert_ne!(token, "kite-api-key-12345");
        assert_eq!(cipher.decrypt(&token).unwrap(), "kite-api-key-12345");
    }

    #[test]
    fn test_empty_round_trip() {
        let cipher = test_cipher();
        assert_eq!(cipher.encrypt("").unwrap(), "");
        assert_eq!(cipher.decrypt("").unwrap(), "");
    }

    #[test]
    fn test_nonce_uniqueness() {
        let cipher = test_cipher();
        let a = cipher.encrypt("same-secret").unwrap();
        let b = cipher.encrypt("same-secret").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), cipher.decrypt(&b).unwrap());
    }

    #[test]
    fn test_tampered_token_rejected() {
        let cipher = test_cipher();
        let token = cipher.encrypt("access-token").unwrap();

        let mut sealed = URL_SAFE.decode(&token).unwrap();
        *sealed.last_mut().unwrap() ^= 0xFF;
        let tampered = URL_SAFE.encode(sealed);

        assert!(matches!(cipher.decrypt(&tampered), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let token = test_cipher().encrypt("access-token").unwrap();
        let other = CredentialCipher::derive("other-secret", "test-salt", 1_000);
        assert!(matches!(other.decrypt(&token), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let cipher = test_cipher();
        assert!(cipher.decrypt("not base64 at all!!").is_err());
        assert!(cipher.decrypt("AAAA").is_err());
    }
}
