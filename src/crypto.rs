//! # Cryptographic Operations
//!
//! This module provides the encryption backends for LanBeam's transfer
//! protocol:
//!
//! - [`TransferKey`]: the stream-protocol default. A 128-bit key persisted to
//!   a local key file (auto-generated on first use) drives AES-128-GCM. Every
//!   token embeds a fresh random nonce, so encrypting the same plaintext twice
//!   never yields the same bytes, and any tampering fails authentication.
//! - Passphrase mode: a 256-bit key derived from a user passphrase via
//!   PBKDF2-HMAC-SHA256 with a random 16-byte salt, used with AES-256-GCM.
//!
//! Both backends fail closed: a corrupted, truncated, or wrong-key token
//! raises [`CryptoError::Authentication`] rather than returning bogus bytes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use anyhow::Result;
use base64::Engine;
use rand::RngCore;
use sha2::Sha256;
use std::path::{Path, PathBuf};

/// Size of the stream-protocol transfer key in bytes (AES-128).
pub const TRANSFER_KEY_SIZE: usize = 16;

/// Size of a passphrase-derived key in bytes (AES-256).
pub const DERIVED_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Salt size for passphrase key derivation.
pub const SALT_SIZE: usize = 16;

/// PBKDF2 iteration count for passphrase key derivation.
pub const PBKDF2_ITERATIONS: u32 = 480_000;

/// Errors raised by the encryption backends.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Token failed authentication: tampered, truncated, or wrong key.
    #[error("authentication failed: token is corrupted or was sealed with a different key")]
    Authentication,

    /// Token is too short to contain a nonce and tag.
    #[error("token too short: {len} bytes (minimum {})", NONCE_SIZE + TAG_SIZE)]
    TokenTooShort { len: usize },

    /// The on-disk key file could not be read or written.
    #[error("key file error: {0}")]
    KeyFile(#[from] std::io::Error),
}

/// Symmetric key for the file-transfer wire protocol.
///
/// Both ends of a transfer must hold the same key; any listener without it
/// cannot decrypt headers or chunks. The key is persisted base64-encoded so
/// the file survives editors that strip trailing whitespace.
#[derive(Clone)]
pub struct TransferKey {
    key: [u8; TRANSFER_KEY_SIZE],
}

impl TransferKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; TRANSFER_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Load the key from `path`, or generate and persist a new one if the
    /// file is missing or does not hold a valid key.
    ///
    /// Safe to call from multiple processes: the key is written to a
    /// temporary sibling and atomically renamed into place, so a concurrent
    /// reader never observes a half-written file.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Some(key) = Self::decode(content.trim()) {
                return Ok(key);
            }
            tracing::warn!("Invalid key file at {}, regenerating", path.display());
        }

        let key = Self::generate();
        key.save(path)?;
        Ok(key)
    }

    /// Persist the key to `path` (base64, mode 0600 on Unix).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let encoded = base64::prelude::BASE64_STANDARD.encode(self.key);
        let tmp = tmp_sibling(path);
        std::fs::write(&tmp, encoded)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&tmp)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&tmp, perms)?;
        }

        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Encrypt `plaintext` into a self-contained token:
    /// `[12-byte nonce][ciphertext + 16-byte tag]`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes128Gcm::new_from_slice(&self.key).expect("valid key size");

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Authentication)?;

        let mut token = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);
        Ok(token)
    }

    /// Decrypt a token produced by [`TransferKey::seal`].
    pub fn open(&self, token: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if token.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::TokenTooShort { len: token.len() });
        }

        let cipher = Aes128Gcm::new_from_slice(&self.key).expect("valid key size");
        let nonce = Nonce::from_slice(&token[..NONCE_SIZE]);

        cipher
            .decrypt(nonce, &token[NONCE_SIZE..])
            .map_err(|_| CryptoError::Authentication)
    }

    /// Raw key bytes (for tests and diagnostics only).
    pub fn as_bytes(&self) -> &[u8; TRANSFER_KEY_SIZE] {
        &self.key
    }

    fn decode(encoded: &str) -> Option<Self> {
        let bytes = base64::prelude::BASE64_STANDARD.decode(encoded).ok()?;
        let key: [u8; TRANSFER_KEY_SIZE] = bytes.try_into().ok()?;
        Some(Self { key })
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp.{}", std::process::id()));
    path.with_file_name(name)
}

/// Derive a 256-bit key from a passphrase with PBKDF2-HMAC-SHA256.
///
/// Generates a random 16-byte salt when none is supplied. The same
/// (passphrase, salt) pair always yields the same key; different salts or
/// passphrases yield independent keys.
pub fn derive_key(
    passphrase: &str,
    salt: Option<[u8; SALT_SIZE]>,
) -> ([u8; DERIVED_KEY_SIZE], [u8; SALT_SIZE]) {
    let salt = salt.unwrap_or_else(|| {
        let mut s = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut s);
        s
    });

    let mut key = [0u8; DERIVED_KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut key);
    (key, salt)
}

/// Encrypt with AES-256-GCM under a passphrase-derived key.
///
/// Output format: `[12-byte nonce][ciphertext + 16-byte tag]`.
pub fn encrypt_chunk(plaintext: &[u8], key: &[u8; DERIVED_KEY_SIZE]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("valid key size");

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Authentication)?;

    let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);
    Ok(payload)
}

/// Decrypt an AES-256-GCM payload produced by [`encrypt_chunk`].
pub fn decrypt_chunk(payload: &[u8], key: &[u8; DERIVED_KEY_SIZE]) -> Result<Vec<u8>, CryptoError> {
    if payload.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::TokenTooShort { len: payload.len() });
    }

    let cipher = Aes256Gcm::new_from_slice(key).expect("valid key size");
    let nonce = Nonce::from_slice(&payload[..NONCE_SIZE]);

    cipher
        .decrypt(nonce, &payload[NONCE_SIZE..])
        .map_err(|_| CryptoError::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_seal_open_round_trip() {
        let key = TransferKey::generate();
        let plaintext = b"hello over the wire";

        let token = key.seal(plaintext).unwrap();
        assert_ne!(&token[NONCE_SIZE..], plaintext.as_slice());

        let decrypted = key.open(&token).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_seal_is_randomized() {
        let key = TransferKey::generate();
        let a = key.seal(b"same plaintext").unwrap();
        let b = key.seal(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_rejects_any_bit_flip() {
        let key = TransferKey::generate();
        let token = key.seal(b"integrity matters").unwrap();

        for i in 0..token.len() {
            let mut tampered = token.clone();
            tampered[i] ^= 0x01;
            assert!(
                key.open(&tampered).is_err(),
                "flip at byte {} was not detected",
                i
            );
        }
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let token = TransferKey::generate().seal(b"secret").unwrap();
        assert!(TransferKey::generate().open(&token).is_err());
    }

    #[test]
    fn test_open_rejects_truncated_token() {
        let key = TransferKey::generate();
        let token = key.seal(b"short").unwrap();
        assert!(matches!(
            key.open(&token[..NONCE_SIZE + 3]),
            Err(CryptoError::TokenTooShort { .. })
        ));
    }

    #[test]
    fn test_key_load_or_generate_new() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("transfer.key");

        let key = TransferKey::load_or_generate(&path).unwrap();
        assert!(path.exists());

        let reloaded = TransferKey::load_or_generate(&path).unwrap();
        assert_eq!(key.as_bytes(), reloaded.as_bytes());
    }

    #[test]
    fn test_key_regenerated_when_corrupted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("transfer.key");
        std::fs::write(&path, "not a valid key").unwrap();

        let key = TransferKey::load_or_generate(&path).unwrap();
        // The corrupt file must have been replaced with a loadable key.
        let reloaded = TransferKey::load_or_generate(&path).unwrap();
        assert_eq!(key.as_bytes(), reloaded.as_bytes());
    }

    #[test]
    fn test_keys_interoperate_via_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("transfer.key");

        let sender = TransferKey::load_or_generate(&path).unwrap();
        let receiver = TransferKey::load_or_generate(&path).unwrap();

        let token = sender.seal(b"shared key file").unwrap();
        assert_eq!(receiver.open(&token).unwrap(), b"shared key file");
    }

    #[test]
    fn test_derive_key_deterministic() {
        let (key1, salt) = derive_key("correct horse", None);
        let (key2, _) = derive_key("correct horse", Some(salt));
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_derive_key_salt_sensitivity() {
        let (key1, _) = derive_key("correct horse", Some([1u8; SALT_SIZE]));
        let (key2, _) = derive_key("correct horse", Some([2u8; SALT_SIZE]));
        assert_ne!(key1, key2);

        let (key3, _) = derive_key("battery staple", Some([1u8; SALT_SIZE]));
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_passphrase_round_trip_and_tamper() {
        let (key, _) = derive_key("battery staple", Some([7u8; SALT_SIZE]));
        let payload = encrypt_chunk(b"legacy mode data", &key).unwrap();

        assert_eq!(decrypt_chunk(&payload, &key).unwrap(), b"legacy mode data");

        let mut tampered = payload.clone();
        tampered[NONCE_SIZE + 2] ^= 0x80;
        assert!(decrypt_chunk(&tampered, &key).is_err());
    }
}
