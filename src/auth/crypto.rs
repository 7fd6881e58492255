use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher keyed from the session secret.
///
/// Seals the TokenData blobs mirrored into Redis and the session cookie.
/// The session secret is hashed to exactly 32 key bytes, so any secret
/// string works. Decryption failure is an expected outcome (key rotation,
/// tampering) and surfaces as `None` rather than an error.
#[derive(Clone)]
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    pub fn new(session_secret: &str) -> Self {
        let key_bytes = Sha256::digest(session_secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt a plaintext into `base64url(nonce || ciphertext)`.
    pub fn seal(&self, plaintext: &[u8]) -> String {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        // Encryption only fails on absurd plaintext lengths.
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .unwrap_or_else(|_| Vec::new());
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        URL_SAFE_NO_PAD.encode(blob)
    }

    /// Decrypt a sealed blob. Returns `None` if the blob is truncated,
    /// corrupt, or was sealed under a different key.
    pub fn open(&self, blob: &str) -> Option<Vec<u8>> {
        let raw = URL_SAFE_NO_PAD.decode(blob).ok()?;
        if raw.len() <= NONCE_LEN {
            return None;
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher.decrypt(nonce, ciphertext).ok()
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher").finish_non_exhaustive()
    }
}
