//! At-rest encryption for stored OAuth tokens.
//!
//! Envelope: `v1:` || base64(nonce (12) || ciphertext || tag (16)).

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use keyring::Entry;

use crate::config::EncryptionConfig;
use crate::error::PipelineError;

const APP_NAME: &str = "subscout";
const KEY_ENTRY: &str = "token_encryption_key";
const KEY_ENV: &str = "SUBSCOUT_TOKEN_KEY";
const ENVELOPE_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn from_base64(encoded: &str) -> Result<Self, PipelineError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| PipelineError::Crypto(format!("Invalid key encoding: {}", e)))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            PipelineError::Crypto(format!("Encryption key must be {} bytes", KEY_LEN))
        })?;
        Ok(Self::new(key))
    }

    /// Resolves the key from config, then `SUBSCOUT_TOKEN_KEY`, then the OS
    /// keyring (creating one on first use).
    pub fn from_config(config: &EncryptionConfig) -> Result<Self, PipelineError> {
        if let Some(key) = &config.key {
            return Self::from_base64(key);
        }
        if let Ok(key) = std::env::var(KEY_ENV) {
            return Self::from_base64(&key);
        }
        if config.use_keyring {
            return Self::from_keyring();
        }
        Err(PipelineError::Crypto(format!(
            "No encryption key configured; set [encryption].key or {}",
            KEY_ENV
        )))
    }

    fn from_keyring() -> Result<Self, PipelineError> {
        let entry = Entry::new(APP_NAME, KEY_ENTRY)
            .map_err(|e| PipelineError::Crypto(format!("Keyring error: {}", e)))?;

        match entry.get_password() {
            Ok(encoded) => Self::from_base64(&encoded),
            Err(keyring::Error::NoEntry) => {
                let key = ChaCha20Poly1305::generate_key(&mut OsRng);
                entry
                    .set_password(&STANDARD.encode(key))
                    .map_err(|e| PipelineError::Crypto(format!("Keyring error: {}", e)))?;
                tracing::info!("Generated new token encryption key in OS keyring");
                let mut bytes = [0u8; KEY_LEN];
                bytes.copy_from_slice(&key);
                Ok(Self::new(bytes))
            }
            Err(e) => Err(PipelineError::Crypto(format!("Keyring error: {}", e))),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, PipelineError> {
        let aead = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = aead
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| PipelineError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce);
        packed.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", ENVELOPE_PREFIX, STANDARD.encode(packed)))
    }

    pub fn decrypt(&self, envelope: &str) -> Result<String, PipelineError> {
        let encoded = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| PipelineError::Crypto("Unrecognized token envelope".to_string()))?;
        let packed = STANDARD
            .decode(encoded)
            .map_err(|e| PipelineError::Crypto(format!("Corrupt token envelope: {}", e)))?;
        if packed.len() <= NONCE_LEN {
            return Err(PipelineError::Crypto("Token envelope too short".to_string()));
        }

        let (nonce, ciphertext) = packed.split_at(NONCE_LEN);
        let aead = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let plaintext = aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PipelineError::Crypto("Decryption failed (wrong key?)".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| PipelineError::Crypto(format!("Token is not UTF-8: {}", e)))
    }
}
