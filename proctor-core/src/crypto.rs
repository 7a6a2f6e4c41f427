//! Payload encryption for queued events.
//!
//! Every submission gets its own AES-256-GCM key, derived on demand:
//!
//! ```text
//! password = "{NAMESPACE}:{submission_id}:{secret}"
//! salt     = SHA-256("{NAMESPACE}-salt:{submission_id}")[..16]
//! key      = PBKDF2-HMAC-SHA256(password, salt, 100_000 rounds, 32 bytes)
//! output   = base64(nonce(12) || ciphertext || tag(16))
//! ```
//!
//! The key is re-derived for each call and zeroized afterwards, so nothing
//! key-related is ever stored. Because the key depends only on the submission
//! id and a deploy-time secret, this protects queued events from casual
//! inspection of the device's disk. It is NOT confidentiality against anyone
//! holding the secret, which includes the backend.

use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Fixed namespace mixed into every password and salt
const NAMESPACE: &str = "proctor-sync/log-queue/v1";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Derives per-submission keys and seals/opens JSON payloads.
#[derive(Clone)]
pub struct PayloadCodec {
    secret: Arc<str>,
    iterations: u32,
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

impl PayloadCodec {
    /// PBKDF2 rounds used in production
    pub const ITERATIONS: u32 = 100_000;

    /// Create a codec bound to the deploy-time secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self::with_iterations(secret, Self::ITERATIONS)
    }

    /// Create a codec with a custom round count.
    ///
    /// Ciphertext is only readable by a codec with the same secret and rounds.
    /// Lower counts exist for tests; production code uses [`PayloadCodec::new`].
    pub fn with_iterations(secret: impl Into<String>, iterations: u32) -> Self {
        let secret: String = secret.into();
        Self {
            secret: Arc::from(secret),
            iterations: iterations.max(1),
        }
    }

    fn derive_key(&self, submission_id: &str) -> Zeroizing<[u8; 32]> {
        let password = Zeroizing::new(format!(
            "{}:{}:{}",
            NAMESPACE, submission_id, self.secret
        ));

        let digest = Sha256::digest(format!("{}-salt:{}", NAMESPACE, submission_id).as_bytes());
        let salt = &digest[..16];

        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, self.iterations, &mut key[..]);
        key
    }

    /// Serialize `data` to JSON and seal it for `submission_id`.
    ///
    /// Each call draws a fresh random nonce, so sealing the same value twice
    /// yields different strings.
    pub fn encrypt<T: Serialize + ?Sized>(&self, data: &T, submission_id: &str) -> Result<String> {
        let plaintext = Zeroizing::new(serde_json::to_vec(data)?);

        let key = self.derive_key(submission_id);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let sealed = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);

        Ok(STANDARD.encode(out))
    }

    /// Open a string produced by [`PayloadCodec::encrypt`] for the same submission.
    pub fn decrypt<T: DeserializeOwned>(&self, ciphertext: &str, submission_id: &str) -> Result<T> {
        let blob = STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| Error::Decryption("ciphertext is not valid base64".to_string()))?;

        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Decryption("ciphertext too short".to_string()));
        }

        let (nonce, sealed) = blob.split_at(NONCE_LEN);

        let key = self.derive_key(submission_id);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|_| Error::Decryption("authentication failed".to_string()))?,
        );

        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Decryption(format!("payload is not valid JSON: {}", e)))
    }

    /// [`PayloadCodec::encrypt`] on the blocking pool.
    ///
    /// Key derivation takes tens of milliseconds at production rounds.
    pub async fn encrypt_async<T>(&self, data: T, submission_id: String) -> Result<String>
    where
        T: Serialize + Send + 'static,
    {
        let codec = self.clone();
        tokio::task::spawn_blocking(move || codec.encrypt(&data, &submission_id)).await?
    }

    /// [`PayloadCodec::decrypt`] on the blocking pool.
    pub async fn decrypt_async<T>(&self, ciphertext: String, submission_id: String) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let codec = self.clone();
        tokio::task::spawn_blocking(move || codec.decrypt(&ciphertext, &submission_id)).await?
    }
}
