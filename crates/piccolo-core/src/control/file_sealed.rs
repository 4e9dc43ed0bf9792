//! File-sealed Control Store personality: a single sealed blob that is
//! loaded and resealed as a whole. Atomic writes (write-temp + rename)
//! guard the revisioned `ControlPayload` shape this store persists.

use crate::crypto;
use crate::keyprovider::{KeyProvider, KeyProviderExt};
use crate::volume::{CRYPTFS_CONFIG_FILE, VOLUME_METADATA_FILE};
use async_trait::async_trait;
use piccolo_types::{AppRecord, ControlState, PersistenceError, RemoteConfig, SealedEnvelope};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ControlStore, RevisionSnapshot};

pub struct FileSealedControlStore {
    enc_path: PathBuf,
    cipher_dir: PathBuf,
    key_provider: Arc<dyn KeyProvider>,
    state: RwLock<Option<ControlState>>,
}

impl FileSealedControlStore {
    pub fn new(enc_path: PathBuf, cipher_dir: PathBuf, key_provider: Arc<dyn KeyProvider>) -> Self {
        Self {
            enc_path,
            cipher_dir,
            key_provider,
            state: RwLock::new(None),
        }
    }

    fn check_prereqs(&self) -> Result<(), PersistenceError> {
        if self.cipher_dir.join(CRYPTFS_CONFIG_FILE).exists() && self.cipher_dir.join(VOLUME_METADATA_FILE).exists() {
            Ok(())
        } else {
            Err(PersistenceError::Locked)
        }
    }

    /// Mutate the in-memory state and reseal to disk. `mutate` returns
    /// whether it actually changed anything — a `false` return skips the
    /// revision bump and disk write entirely, which is how idempotent
    /// mutators like `set_initialized` guarantee at most one revision
    /// increment per distinct change.
    async fn commit(&self, mutate: impl FnOnce(&mut ControlState) -> bool) -> Result<RevisionSnapshot, PersistenceError> {
        self.check_prereqs()?;
        let mut guard = self.state.write().await;
        let state = guard.as_mut().ok_or(PersistenceError::Locked)?;

        if !mutate(state) {
            return Ok(RevisionSnapshot {
                revision: state.revision,
                checksum: state.checksum.clone(),
            });
        }

        state.revision += 1;
        let unchecksummed = state.to_payload();
        let checksum = crypto::sha256_hex(&unchecksummed.canonical_bytes_for_checksum());
        state.checksum = checksum.clone();

        let payload = state.to_payload();
        let bytes = serde_json::to_vec(&payload).map_err(|e| PersistenceError::Io {
            context: "serialize control payload".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;
        let (nonce_b64, ciphertext_b64) = self.key_provider.encrypt(bytes).await?;
        write_envelope_atomic(&self.enc_path, nonce_b64, ciphertext_b64)?;

        Ok(RevisionSnapshot {
            revision: state.revision,
            checksum,
        })
    }
}

#[async_trait]
impl ControlStore for FileSealedControlStore {
    async fn unlock(&self) -> Result<(), PersistenceError> {
        let mut guard = self.state.write().await;
        if guard.is_some() {
            return Ok(());
        }
        if !self.enc_path.exists() {
            *guard = Some(ControlState::default());
            return Ok(());
        }

        let bytes = std::fs::read(&self.enc_path).map_err(|e| PersistenceError::io(format!("read {}", self.enc_path.display()), e))?;
        let envelope: SealedEnvelope = serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Io {
            context: "parse sealed control envelope".into(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
        })?;
        if envelope.version != SealedEnvelope::CURRENT_VERSION {
            return Err(PersistenceError::Io {
                context: "unsupported control envelope version".into(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, format!("version {}", envelope.version)),
            });
        }
        let plaintext = self.key_provider.decrypt(envelope.nonce, envelope.ciphertext).await?;
        let payload = serde_json::from_slice(&plaintext).map_err(|e| PersistenceError::Io {
            context: "parse control payload".into(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
        })?;
        *guard = Some(ControlState::from_payload(payload));
        Ok(())
    }

    async fn lock(&self) -> Result<(), PersistenceError> {
        *self.state.write().await = None;
        Ok(())
    }

    async fn quick_check(&self) -> Result<(), PersistenceError> {
        if self.state.read().await.is_some() {
            Ok(())
        } else {
            Err(PersistenceError::Locked)
        }
    }

    async fn revision(&self) -> Result<RevisionSnapshot, PersistenceError> {
        let guard = self.state.read().await;
        let state = guard.as_ref().ok_or(PersistenceError::Locked)?;
        Ok(RevisionSnapshot {
            revision: state.revision,
            checksum: state.checksum.clone(),
        })
    }

    async fn is_initialized(&self) -> Result<bool, PersistenceError> {
        let guard = self.state.read().await;
        Ok(guard.as_ref().ok_or(PersistenceError::Locked)?.auth_initialized)
    }

    async fn set_initialized(&self) -> Result<RevisionSnapshot, PersistenceError> {
        self.commit(|state| {
            if state.auth_initialized {
                false
            } else {
                state.auth_initialized = true;
                true
            }
        })
        .await
    }

    async fn password_hash(&self) -> Result<Option<String>, PersistenceError> {
        let guard = self.state.read().await;
        Ok(guard.as_ref().ok_or(PersistenceError::Locked)?.password_hash.clone())
    }

    async fn save_password_hash(&self, hash: String) -> Result<RevisionSnapshot, PersistenceError> {
        self.commit(|state| {
            state.password_hash = Some(hash);
            true
        })
        .await
    }

    async fn current_config(&self) -> Result<RemoteConfig, PersistenceError> {
        let guard = self.state.read().await;
        let state = guard.as_ref().ok_or(PersistenceError::Locked)?;
        state.remote_config.clone().ok_or_else(|| PersistenceError::NotFound("remote config".into()))
    }

    async fn save_config(&self, config: RemoteConfig) -> Result<RevisionSnapshot, PersistenceError> {
        self.commit(|state| {
            state.remote_config = Some(config);
            true
        })
        .await
    }

    async fn list_apps(&self) -> Result<Vec<AppRecord>, PersistenceError> {
        let guard = self.state.read().await;
        let state = guard.as_ref().ok_or(PersistenceError::Locked)?;
        Ok(state.apps.values().cloned().collect())
    }

    async fn upsert_app(&self, app: AppRecord) -> Result<RevisionSnapshot, PersistenceError> {
        if app.name.trim().is_empty() {
            return Err(PersistenceError::InvalidCommand("app name must be non-empty".into()));
        }
        self.commit(|state| {
            state.apps.insert(app.name.clone(), app);
            true
        })
        .await
    }
}

/// Write the sealed envelope to a temp file under an `fd-lock` write guard,
/// then atomically rename over `path`.
fn write_envelope_atomic(path: &Path, nonce_b64: String, ciphertext_b64: String) -> Result<(), PersistenceError> {
    let envelope = SealedEnvelope {
        version: SealedEnvelope::CURRENT_VERSION,
        nonce: nonce_b64,
        ciphertext: ciphertext_b64,
    };
    let bytes = serde_json::to_vec(&envelope).map_err(|e| PersistenceError::Io {
        context: "serialize sealed envelope".into(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
    })?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PersistenceError::io(format!("create dir {}", parent.display()), e))?;
    }
    let tmp = path.with_extension("enc.tmp");
    {
        use std::io::Write;
        let file = std::fs::File::create(&tmp).map_err(|e| PersistenceError::io(format!("create {}", tmp.display()), e))?;
        let mut lock = fd_lock::RwLock::new(file);
        let mut guard = lock.write().map_err(|e| PersistenceError::io("acquire fd-lock on control blob temp file", e))?;
        guard
            .write_all(&bytes)
            .map_err(|e| PersistenceError::io(format!("write {}", tmp.display()), e))?;
        guard.flush().map_err(|e| PersistenceError::io(format!("flush {}", tmp.display()), e))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| PersistenceError::io(format!("chmod 0600 {}", tmp.display()), e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| PersistenceError::io(format!("rename {} -> {}", tmp.display(), path.display()), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyprovider::StaticKeyProvider;

    fn prereqs(cipher_dir: &Path) {
        std::fs::create_dir_all(cipher_dir).unwrap();
        std::fs::write(cipher_dir.join(CRYPTFS_CONFIG_FILE), b"conf").unwrap();
        std::fs::write(cipher_dir.join(VOLUME_METADATA_FILE), b"{}").unwrap();
    }

    fn store(dir: &Path) -> FileSealedControlStore {
        let cipher_dir = dir.join("ciphertext/control");
        prereqs(&cipher_dir);
        FileSealedControlStore::new(
            dir.join("ciphertext/control/control.enc"),
            cipher_dir,
            Arc::new(StaticKeyProvider::new([9u8; 32])),
        )
    }

    #[tokio::test]
    async fn fresh_store_starts_at_revision_zero() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.unlock().await.unwrap();
        let snap = s.revision().await.unwrap();
        assert_eq!(snap.revision, 0);
        assert_eq!(snap.checksum, "");
    }

    #[tokio::test]
    async fn reads_before_unlock_are_locked() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(matches!(s.is_initialized().await, Err(PersistenceError::Locked)));
    }

    #[tokio::test]
    async fn writes_advance_revision_and_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.unlock().await.unwrap();

        let r1 = s.set_initialized().await.unwrap();
        assert_eq!(r1.revision, 1);
        assert_ne!(r1.checksum, "");

        let r2 = s.save_password_hash("argon2id$abc".into()).await.unwrap();
        assert_eq!(r2.revision, 2);

        let r3 = s
            .save_config(RemoteConfig {
                payload: br#"{"endpoint":"wss://nexus.example.com/connect"}"#.to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(r3.revision, 3);

        let r4 = s
            .upsert_app(AppRecord {
                name: "app-alpha".into(),
                extra: Default::default(),
            })
            .await
            .unwrap();
        assert_eq!(r4.revision, 4);
    }

    #[tokio::test]
    async fn set_initialized_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.unlock().await.unwrap();
        let r1 = s.set_initialized().await.unwrap();
        let r2 = s.set_initialized().await.unwrap();
        assert_eq!(r1.revision, 1);
        assert_eq!(r2.revision, 1);
    }

    #[tokio::test]
    async fn roundtrip_through_lock_unlock_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let key_provider: Arc<dyn KeyProvider> = Arc::new(StaticKeyProvider::new([11u8; 32]));
        let cipher_dir = dir.path().join("ciphertext/control");
        prereqs(&cipher_dir);
        let enc_path = cipher_dir.join("control.enc");

        let s1 = FileSealedControlStore::new(enc_path.clone(), cipher_dir.clone(), key_provider.clone());
        s1.unlock().await.unwrap();
        s1.set_initialized().await.unwrap();
        s1.upsert_app(AppRecord {
            name: "app-alpha".into(),
            extra: Default::default(),
        })
        .await
        .unwrap();
        let before = s1.revision().await.unwrap();

        let s2 = FileSealedControlStore::new(enc_path, cipher_dir, key_provider);
        s2.unlock().await.unwrap();
        assert!(s2.is_initialized().await.unwrap());
        assert_eq!(s2.list_apps().await.unwrap().len(), 1);
        let after = s2.revision().await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn missing_prereq_files_cause_locked_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let cipher_dir = dir.path().join("ciphertext/control");
        std::fs::create_dir_all(&cipher_dir).unwrap();
        let s = FileSealedControlStore::new(
            cipher_dir.join("control.enc"),
            cipher_dir,
            Arc::new(StaticKeyProvider::new([1u8; 32])),
        );
        s.unlock().await.unwrap();
        assert!(matches!(s.set_initialized().await, Err(PersistenceError::Locked)));
    }

    #[tokio::test]
    async fn upsert_app_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.unlock().await.unwrap();
        let result = s
            .upsert_app(AppRecord {
                name: "".into(),
                extra: Default::default(),
            })
            .await;
        assert!(matches!(result, Err(PersistenceError::InvalidCommand(_))));
    }
}
