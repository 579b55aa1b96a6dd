//! Credential vault: AES-256-GCM encryption of secrets at rest.
//!
//! Stored form is `base64(nonce || ciphertext || tag)`. Every `encrypt` draws
//! a fresh 96-bit nonce from the system CSPRNG.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("vault key must be 32 bytes of base64, got {0} bytes")]
    InvalidKey(usize),

    #[error("vault key is not valid base64: {0}")]
    KeyEncoding(String),

    #[error("ciphertext is not valid base64 or is truncated")]
    Malformed,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed, wrong key or corrupted data")]
    Decrypt,
}

#[derive(Clone)]
pub struct CredentialVault {
    key: Arc<LessSafeKey>,
    rng: SystemRandom,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialVault { .. }")
    }
}

impl CredentialVault {
    pub fn new(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != 32 {
            return Err(VaultError::InvalidKey(key.len()));
        }
        let unbound =
            UnboundKey::new(&AES_256_GCM, key).map_err(|_| VaultError::InvalidKey(key.len()))?;
        Ok(Self {
            key: Arc::new(LessSafeKey::new(unbound)),
            rng: SystemRandom::new(),
        })
    }

    /// Build from the base64 form used in configuration.
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::KeyEncoding(e.to_string()))?;
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| VaultError::Encrypt)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| VaultError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, VaultError> {
        let raw = STANDARD.decode(stored.trim()).map_err(|_| VaultError::Malformed)?;
        if raw.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(VaultError::Malformed);
        }

        let (nonce_part, sealed) = raw.split_at(NONCE_LEN);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce_part);

        let mut in_out = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| VaultError::Decrypt)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| VaultError::Decrypt)
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Constant-time equality for shared secrets of any length.
///
/// Both sides are reduced to HMAC tags under a fixed key so the comparison
/// never leaks length or prefix information through timing.
pub fn secrets_match(expected: &str, provided: &str) -> bool {
    const KEY: &[u8] = b"rag-messenger-secret-compare";

    let tag = |value: &str| {
        let mut mac = match HmacSha256::new_from_slice(KEY) {
            Ok(mac) => mac,
            Err(_) => return None,
        };
        mac.update(value.as_bytes());
        Some(mac)
    };

    match (tag(expected), tag(provided)) {
        (Some(expected), Some(provided)) => {
            let expected = expected.finalize().into_bytes();
            provided.verify_slice(&expected).is_ok()
        }
        _ => false,
    }
}

/// Checks `provided` against every candidate without short-circuiting.
pub fn matches_any<'a, I>(candidates: I, provided: &str) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    candidates
        .into_iter()
        .fold(false, |found, candidate| secrets_match(candidate, provided) | found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CredentialVault {
        CredentialVault::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn roundtrip() {
        let v = vault();
        let sealed = v.encrypt("EAAG-page-token").unwrap();
        assert_ne!(sealed, "EAAG-page-token");
        assert_eq!(v.decrypt(&sealed).unwrap(), "EAAG-page-token");
    }

    #[test]
    fn fresh_nonce_per_call() {
        let v = vault();
        assert_ne!(v.encrypt("same").unwrap(), v.encrypt("same").unwrap());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = vault().encrypt("secret").unwrap();
        let other = CredentialVault::new(&[8u8; 32]).unwrap();
        assert!(matches!(other.decrypt(&sealed), Err(VaultError::Decrypt)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let v = vault();
        let mut raw = STANDARD.decode(v.encrypt("secret").unwrap()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(matches!(
            v.decrypt(&STANDARD.encode(raw)),
            Err(VaultError::Decrypt)
        ));
    }

    #[test]
    fn truncated_input_is_malformed() {
        assert!(matches!(vault().decrypt("AAAA"), Err(VaultError::Malformed)));
        assert!(matches!(vault().decrypt("not base64!"), Err(VaultError::Malformed)));
    }

    #[test]
    fn key_length_is_checked() {
        assert!(matches!(
            CredentialVault::new(&[0u8; 16]),
            Err(VaultError::InvalidKey(16))
        ));
        let encoded = STANDARD.encode([1u8; 32]);
        assert!(CredentialVault::from_base64(&encoded).is_ok());
    }

    #[test]
    fn secret_comparison() {
        assert!(secrets_match("verify-me", "verify-me"));
        assert!(!secrets_match("verify-me", "verify-m"));
        assert!(!secrets_match("verify-me", ""));
        assert!(matches_any(["a", "b", "c"], "b"));
        assert!(!matches_any(["a", "b"], "z"));
        assert!(!matches_any(std::iter::empty::<&str>(), "z"));
    }
}
