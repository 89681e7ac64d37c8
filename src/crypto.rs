//! Provider token decryption.
//!
//! Tokens are sealed by the front end with AES-256-GCM and transported as
//! `base64(iv):base64(tag):base64(ciphertext)`. The tag travels separately,
//! so it is appended to the ciphertext before verification.

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::SecretString;
use zeroize::Zeroizing;

use crate::errors::CryptoError;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct Decryptor {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decryptor").finish_non_exhaustive()
    }
}

impl Decryptor {
    /// Parse the key from configuration. Accepted forms, tried in order:
    /// 64 hex characters, 44 base64 characters decoding to 32 bytes, or a
    /// raw 32-byte string.
    pub fn new(key: &str) -> Result<Self, CryptoError> {
        let key = key.trim();
        let bytes: Zeroizing<Vec<u8>> = if key.len() == 64
            && key.bytes().all(|b| b.is_ascii_hexdigit())
        {
            Zeroizing::new(
                hex::decode(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
            )
        } else if key.len() == 44 {
            let decoded = STANDARD
                .decode(key)
                .map_err(|_| CryptoError::InvalidKey("44-character key is not base64".into()))?;
            Zeroizing::new(decoded)
        } else if key.len() == KEY_LEN {
            Zeroizing::new(key.as_bytes().to_vec())
        } else {
            return Err(CryptoError::InvalidKey(format!(
                "expected 64 hex chars, 44 base64 chars or 32 raw chars, got {} chars",
                key.len()
            )));
        };

        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "key decodes to {} bytes, expected {}",
                bytes.len(),
                KEY_LEN
            )));
        }

        let mut material = Zeroizing::new([0u8; KEY_LEN]);
        material.copy_from_slice(&bytes);
        Ok(Self { key: material })
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(self.key.as_slice())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn decrypt(&self, token: &str) -> Result<SecretString, CryptoError> {
        let segments: Vec<&str> = token.trim().split(':').collect();
        let [iv, tag, ciphertext] = segments.as_slice() else {
            return Err(CryptoError::Format(format!(
                "expected 3 colon-separated segments, got {}",
                segments.len()
            )));
        };

        let decode = |name: &str, value: &str| {
            STANDARD
                .decode(value)
                .map_err(|_| CryptoError::Format(format!("{} segment is not valid base64", name)))
        };
        let iv = decode("iv", *iv)?;
        let tag = decode("tag", *tag)?;
        let mut sealed = decode("ciphertext", *ciphertext)?;

        if iv.len() != IV_LEN {
            return Err(CryptoError::Length {
                field: "iv",
                expected: IV_LEN,
                actual: iv.len(),
            });
        }
        if tag.len() != TAG_LEN {
            return Err(CryptoError::Length {
                field: "tag",
                expected: TAG_LEN,
                actual: tag.len(),
            });
        }

        sealed.extend_from_slice(&tag);
        let plaintext = Zeroizing::new(
            self.cipher()?
                .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
                .map_err(|_| CryptoError::Authentication)?,
        );

        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| CryptoError::Format("plaintext is not valid UTF-8".into()))?;
        Ok(SecretString::from(text.to_string()))
    }

    /// Seal `plaintext` in the same wire format with a fresh random IV.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut sealed = self
            .cipher()?
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Authentication)?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        Ok(format!(
            "{}:{}:{}",
            STANDARD.encode(nonce),
            STANDARD.encode(tag),
            STANDARD.encode(sealed)
        ))
    }
}
