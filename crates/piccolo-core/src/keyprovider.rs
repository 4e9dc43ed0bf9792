//! The external key provider capability: scoped, single-use access to the
//! 32-byte Storage Data Encryption Key (SDEK) while the node is unlocked.
//!
//! The SDEK itself is never returned to the caller — only handed into a
//! callback whose execution bounds its exposure.
//! `KeyProvider` is kept object-safe (no generic method) so `Module` can
//! hold it as `Arc<dyn KeyProvider>` and accept test doubles.

use async_trait::async_trait;
use piccolo_types::PersistenceError;
use zeroize::Zeroize;

type ScopedFn = Box<dyn FnOnce(&[u8; 32]) -> Result<Vec<u8>, PersistenceError> + Send>;

#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Invoke `f` with the current SDEK. Returns `Err(PersistenceError::Locked)`
    /// without invoking `f` when the node is locked or the key has not yet
    /// been established.
    async fn with_sdek(&self, f: ScopedFn) -> Result<Vec<u8>, PersistenceError>;
}

/// Convenience helpers built on the object-safe `with_sdek` primitive, used
/// by every crypto call site in the core so they don't hand-roll the
/// `Box::new` boilerplate.
#[async_trait]
pub trait KeyProviderExt: KeyProvider {
    async fn encrypt(&self, plaintext: Vec<u8>) -> Result<(String, String), PersistenceError> {
        let out = self
            .with_sdek(Box::new(move |key| {
                let (nonce, ct) = crate::crypto::encrypt_b64(key, &plaintext)?;
                serde_json::to_vec(&(nonce, ct)).map_err(|e| PersistenceError::Io {
                    context: "serialize sealed pair".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                })
            }))
            .await?;
        let (nonce, ct): (String, String) = serde_json::from_slice(&out).map_err(|e| PersistenceError::Io {
            context: "deserialize sealed pair".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;
        Ok((nonce, ct))
    }

    async fn decrypt(&self, nonce_b64: String, ciphertext_b64: String) -> Result<Vec<u8>, PersistenceError> {
        self.with_sdek(Box::new(move |key| {
            crate::crypto::decrypt_b64(key, &nonce_b64, &ciphertext_b64)
        }))
        .await
    }
}

impl<T: KeyProvider + ?Sized> KeyProviderExt for T {}

/// Fixed-key provider. Used by tests and by deployments that inject the
/// SDEK through some other already-decided-upon mechanism.
pub struct StaticKeyProvider {
    key: [u8; 32],
}

impl StaticKeyProvider {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn with_sdek(&self, f: ScopedFn) -> Result<Vec<u8>, PersistenceError> {
        f(&self.key)
    }
}

/// Derives the SDEK from a passphrase with Argon2id. Meant as a
/// development/bring-up stand-in for the real cryptographic manager, not a
/// production key-wrapping scheme — the core never persists anything
/// derived from it.
pub struct PassphraseKeyProvider {
    key: [u8; 32],
    locked: std::sync::atomic::AtomicBool,
}

impl PassphraseKeyProvider {
    pub fn derive(passphrase: &str, salt: &[u8]) -> Result<Self, PersistenceError> {
        use argon2::Argon2;
        let argon2 = Argon2::default();
        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| PersistenceError::Io {
                context: "argon2 key derivation".into(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
            })?;
        Ok(Self {
            key,
            locked: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Drop for PassphraseKeyProvider {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[async_trait]
impl KeyProvider for PassphraseKeyProvider {
    async fn with_sdek(&self, f: ScopedFn) -> Result<Vec<u8>, PersistenceError> {
        if self.locked.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PersistenceError::Locked);
        }
        f(&self.key)
    }
}

/// Always reports `Locked`. Used to exercise lock-gated code paths in
/// tests without standing up a real key provider.
pub struct LockedKeyProvider;

#[async_trait]
impl KeyProvider for LockedKeyProvider {
    async fn with_sdek(&self, _f: ScopedFn) -> Result<Vec<u8>, PersistenceError> {
        Err(PersistenceError::Locked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_roundtrips_through_ext_helpers() {
        let provider = StaticKeyProvider::new([5u8; 32]);
        let (nonce, ct) = provider.encrypt(b"payload".to_vec()).await.unwrap();
        let plaintext = provider.decrypt(nonce, ct).await.unwrap();
        assert_eq!(plaintext, b"payload");
    }

    #[tokio::test]
    async fn locked_provider_never_invokes_callback() {
        let provider = LockedKeyProvider;
        let invoked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let invoked2 = invoked.clone();
        let result = provider
            .with_sdek(Box::new(move |_| {
                invoked2.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(vec![])
            }))
            .await;
        assert!(matches!(result, Err(PersistenceError::Locked)));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn passphrase_provider_is_deterministic() {
        let salt = [0u8; 16];
        let a = PassphraseKeyProvider::derive("hunter2", &salt).unwrap();
        let b = PassphraseKeyProvider::derive("hunter2", &salt).unwrap();
        let (nonce, ct) = a.encrypt(b"x".to_vec()).await.unwrap();
        assert_eq!(b.decrypt(nonce, ct).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn passphrase_provider_can_be_locked() {
        let provider = PassphraseKeyProvider::derive("pw", &[1u8; 16]).unwrap();
        provider.set_locked(true);
        assert!(provider.encrypt(b"x".to_vec()).await.is_err());
    }
}
