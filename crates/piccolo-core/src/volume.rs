//! Volume Manager: deterministically maps a `VolumeRequest` to directories,
//! initializes encryption on first use, mounts the ciphertext container,
//! sustains the mount process, and unmounts on request or shutdown.
//!
//! Registry shape: `RwLock<HashMap<id, Entry>>`, with long operations
//! holding only the read lock while state installation (role, process)
//! takes the write lock.

use crate::crypto;
use crate::keyprovider::{KeyProvider, KeyProviderExt};
use crate::leadership::LeadershipRegistry;
use crate::mount;
use crate::process::{MountProcess, ProcessRunner};
use piccolo_types::{PersistenceError, Role, VolumeHandle, VolumeMetadata, VolumeRequest, KERNEL_RESOURCE};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Native ciphertext directory marker file (gocryptfs-equivalent config).
/// Its presence alongside `piccolo.volume.json` is the precondition both the
/// file-sealed and relational control stores check before unlocking.
pub const CRYPTFS_CONFIG_FILE: &str = "gocryptfs.conf";
pub const VOLUME_METADATA_FILE: &str = "piccolo.volume.json";

struct VolumeEntry {
    handle: VolumeHandle,
    cipher_dir: PathBuf,
    metadata: Option<VolumeMetadata>,
    role: Option<Role>,
    process: Option<MountProcess>,
}

pub struct VolumeManager {
    state_dir: PathBuf,
    cryptfs_bin: PathBuf,
    mount_wait: Duration,
    process_grace: Duration,
    unmount_candidates: Vec<String>,
    key_provider: Arc<dyn KeyProvider>,
    runner: Arc<dyn ProcessRunner>,
    leadership: Arc<dyn LeadershipRegistry>,
    entries: RwLock<HashMap<String, VolumeEntry>>,
}

impl VolumeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_dir: PathBuf,
        cryptfs_bin: PathBuf,
        mount_wait: Duration,
        process_grace: Duration,
        unmount_candidates: Vec<String>,
        key_provider: Arc<dyn KeyProvider>,
        runner: Arc<dyn ProcessRunner>,
        leadership: Arc<dyn LeadershipRegistry>,
    ) -> Self {
        Self {
            state_dir,
            cryptfs_bin,
            mount_wait,
            process_grace,
            unmount_candidates,
            key_provider,
            runner,
            leadership,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn cipher_dir(&self, id: &str) -> PathBuf {
        self.state_dir.join("ciphertext").join(id)
    }

    fn mount_dir(&self, id: &str) -> PathBuf {
        self.state_dir.join("mounts").join(id)
    }

    /// Idempotent. Creates directories, generates and wraps a passphrase on
    /// first use, and runs the native initializer exactly once per volume
    /// id for the life of the node.
    pub async fn ensure_volume(&self, req: VolumeRequest) -> Result<VolumeHandle, PersistenceError> {
        if let Some(entry) = self.entries.read().await.get(&req.id) {
            return Ok(entry.handle.clone());
        }

        let cipher_dir = self.cipher_dir(&req.id);
        let mount_dir = self.mount_dir(&req.id);
        create_owner_only_dir(&cipher_dir)?;
        create_owner_only_dir(&mount_dir)?;

        let metadata_path = cipher_dir.join(VOLUME_METADATA_FILE);
        let (metadata, locked) = if metadata_path.exists() {
            (Some(read_metadata(&metadata_path)?), false)
        } else {
            match self.initialize_volume(&cipher_dir, &metadata_path).await {
                Ok(meta) => (Some(meta), false),
                Err(PersistenceError::Locked) => (None, true),
                Err(e) => return Err(e),
            }
        };

        let handle = VolumeHandle {
            id: req.id.clone(),
            mount_dir,
        };

        let mut entries = self.entries.write().await;
        entries.entry(req.id.clone()).or_insert(VolumeEntry {
            handle: handle.clone(),
            cipher_dir,
            metadata,
            role: None,
            process: None,
        });
        drop(entries);
        let _ = req.class;

        if locked {
            return Err(PersistenceError::Locked);
        }
        Ok(handle)
    }

    async fn initialize_volume(&self, cipher_dir: &Path, metadata_path: &Path) -> Result<VolumeMetadata, PersistenceError> {
        let passphrase = crypto::generate_volume_passphrase();
        let (nonce_b64, wrapped_key_b64) = self.key_provider.encrypt(passphrase.as_bytes().to_vec()).await?;
        let metadata = VolumeMetadata {
            version: VolumeMetadata::CURRENT_VERSION,
            wrapped_key_b64,
            nonce_b64,
        };
        write_metadata_atomic(metadata_path, &metadata)?;
        self.runner.run_initializer(&self.cryptfs_bin, cipher_dir, &passphrase).await?;
        Ok(metadata)
    }

    /// Attach the volume at `handle.id`, launching the mount process with
    /// the role-appropriate flags and waiting for the mount to appear.
    pub async fn attach(&self, id: &str, role: Role) -> Result<(), PersistenceError> {
        if role == Role::Leader && self.leadership.role(KERNEL_RESOURCE).await != Role::Leader {
            return Err(PersistenceError::NotLeader(KERNEL_RESOURCE.to_string()));
        }

        let (cipher_dir, mount_dir, metadata) = {
            let entries = self.entries.read().await;
            let entry = entries.get(id).ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;
            let metadata = entry
                .metadata
                .clone()
                .ok_or_else(|| PersistenceError::Locked)?;
            (entry.cipher_dir.clone(), entry.handle.mount_dir.clone(), metadata)
        };

        let passphrase_bytes = self
            .key_provider
            .decrypt(metadata.nonce_b64.clone(), metadata.wrapped_key_b64.clone())
            .await?;
        let passphrase = String::from_utf8(passphrase_bytes).map_err(|e| PersistenceError::Io {
            context: "decode unwrapped passphrase as utf8".into(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
        })?;

        let read_only = role == Role::Follower;
        let mut process = self
            .runner
            .spawn_mount(&self.cryptfs_bin, &cipher_dir, &mount_dir, &passphrase, read_only)
            .await?;

        if let Err(e) = self.wait_for_mount(&mount_dir).await {
            process.terminate(self.process_grace).await;
            return Err(e);
        }

        mount::write_sentinels(&mount_dir, &cipher_dir, read_only)?;

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.role = Some(role);
            entry.process = Some(process);
        }
        Ok(())
    }

    async fn wait_for_mount(&self, mount_dir: &Path) -> Result<(), PersistenceError> {
        let deadline = tokio::time::Instant::now() + self.mount_wait;
        loop {
            if mount::is_mounted(mount_dir).unwrap_or(false) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PersistenceError::AttachFailed {
                    volume_id: mount_dir.display().to_string(),
                    reason: "mount did not appear within the wait deadline".into(),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Detach the volume, tolerating a mount that has already disappeared.
    pub async fn detach(&self, id: &str) -> Result<(), PersistenceError> {
        let mount_dir = {
            let entries = self.entries.read().await;
            match entries.get(id) {
                Some(entry) => entry.handle.mount_dir.clone(),
                None => return Ok(()),
            }
        };

        if !mount::sentinels_present(&mount_dir) {
            mount::remove_sentinels(&mount_dir);
            self.clear_process(id).await;
            return Ok(());
        }

        let result = self.runner.unmount(&self.unmount_candidates, &mount_dir).await;
        if let Some(mut process) = self.take_process(id).await {
            if !process.has_exited().await {
                process.terminate(self.process_grace).await;
            }
        }
        mount::remove_sentinels(&mount_dir);
        result
    }

    async fn take_process(&self, id: &str) -> Option<MountProcess> {
        let mut entries = self.entries.write().await;
        entries.get_mut(id).and_then(|entry| entry.process.take())
    }

    async fn clear_process(&self, id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.process = None;
            entry.role = None;
        }
    }

    pub async fn handle(&self, id: &str) -> Option<VolumeHandle> {
        self.entries.read().await.get(id).map(|e| e.handle.clone())
    }

    /// Reserved: returns an already-closed stream. Whether it should ever
    /// emit role transitions is an open upstream question.
    pub fn role_stream(&self, _volume_id: &str) -> tokio::sync::broadcast::Receiver<Role> {
        let (_tx, rx) = tokio::sync::broadcast::channel(1);
        rx
    }
}

fn create_owner_only_dir(path: &Path) -> Result<(), PersistenceError> {
    std::fs::create_dir_all(path).map_err(|e| PersistenceError::io(format!("create dir {}", path.display()), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| PersistenceError::io(format!("chmod 0700 {}", path.display()), e))?;
    }
    Ok(())
}

fn read_metadata(path: &Path) -> Result<VolumeMetadata, PersistenceError> {
    let bytes = std::fs::read(path).map_err(|e| PersistenceError::io(format!("read {}", path.display()), e))?;
    serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Io {
        context: format!("parse volume metadata {}", path.display()),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    })
}

fn write_metadata_atomic(path: &Path, metadata: &VolumeMetadata) -> Result<(), PersistenceError> {
    let bytes = serde_json::to_vec_pretty(metadata).map_err(|e| PersistenceError::Io {
        context: "serialize volume metadata".into(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
    })?;
    let tmp = path.with_extension("json.tmp");
    {
        use std::io::Write;
        let file = std::fs::File::create(&tmp).map_err(|e| PersistenceError::io(format!("create {}", tmp.display()), e))?;
        let mut lock = fd_lock::RwLock::new(file);
        let mut guard = lock.write().map_err(|e| PersistenceError::io("acquire fd-lock on volume metadata temp file", e))?;
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
