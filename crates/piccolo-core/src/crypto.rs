//! AES-256-GCM primitives shared by the volume passphrase wrapper and the
//! file-sealed control store.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use piccolo_types::PersistenceError;
use rand::RngCore;

/// Encrypt `plaintext` under `key` with a fresh random 12-byte nonce.
/// Returns `(nonce, ciphertext)`.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), PersistenceError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| PersistenceError::Io {
            context: "cipher init".into(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
        })?;

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|e| {
        PersistenceError::Io {
            context: "aes-gcm encrypt".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        }
    })?;

    Ok((nonce_bytes.to_vec(), ciphertext))
}

/// Decrypt `ciphertext` under `key` with the given nonce.
pub fn decrypt(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, PersistenceError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| PersistenceError::Io {
            context: "cipher init".into(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
        })?;

    let nonce = Nonce::from_slice(nonce);

    cipher.decrypt(nonce, ciphertext).map_err(|e| PersistenceError::Io {
        context: "aes-gcm decrypt".into(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    })
}

/// Encrypt and base64-standard-encode nonce and ciphertext in one step —
/// the shape every on-disk envelope in this crate (`SealedEnvelope`,
/// `VolumeMetadata`) stores.
pub fn encrypt_b64(key: &[u8; 32], plaintext: &[u8]) -> Result<(String, String), PersistenceError> {
    let (nonce, ciphertext) = encrypt(key, plaintext)?;
    Ok((STANDARD.encode(nonce), STANDARD.encode(ciphertext)))
}

pub fn decrypt_b64(key: &[u8; 32], nonce_b64: &str, ciphertext_b64: &str) -> Result<Vec<u8>, PersistenceError> {
    let nonce = STANDARD.decode(nonce_b64).map_err(|e| PersistenceError::Io {
        context: "base64 decode nonce".into(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    })?;
    let ciphertext = STANDARD.decode(ciphertext_b64).map_err(|e| PersistenceError::Io {
        context: "base64 decode ciphertext".into(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    })?;
    decrypt(key, &nonce, &ciphertext)
}

/// Generate a 32-byte random passphrase, base64-encoded without padding —
/// the payload the native ciphertext-volume initializer receives over
/// stdin.
pub fn generate_volume_passphrase() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes)
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
