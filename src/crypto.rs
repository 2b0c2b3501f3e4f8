//! Secrets at rest.
//!
//! Data-source passwords and model API keys are stored AES-256-GCM
//! enciphered under a process-wide key loaded from the environment at
//! startup. Key rotation requires a restart.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

use crate::error::{AskError, Result};

/// GCM nonce length in bytes. Stored as a prefix of the ciphertext.
const NONCE_LEN: usize = 12;

/// Process-wide symmetric cipher for secrets.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material, even in debug output.
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Creates a cipher from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| AskError::config(format!("Encryption key is not valid base64: {e}")))?;

        if key_bytes.len() != 32 {
            return Err(AskError::config(format!(
                "Encryption key must be 32 bytes, got {}",
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| AskError::config(format!("Failed to initialize cipher: {e}")))?;

        Ok(Self { cipher })
    }

    /// Enciphers a secret, returning base64(nonce || ciphertext).
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| AskError::internal("Failed to encipher secret"))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(combined))
    }

    /// Deciphers a value produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &str) -> Result<String> {
        let combined = BASE64
            .decode(sealed.trim())
            .map_err(|e| AskError::internal(format!("Stored secret is not valid base64: {e}")))?;

        if combined.len() < NONCE_LEN {
            return Err(AskError::internal("Stored secret is too short"));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| AskError::internal("Failed to decipher secret (wrong key?)"))?;

        String::from_utf8(plaintext)
            .map_err(|e| AskError::internal(format!("Deciphered secret is not UTF-8: {e}")))
    }
}
