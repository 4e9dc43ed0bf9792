//! Persistence Module: composition root. Owns the core volume handles,
//! wires the command dispatcher, enforces lock/unlock side effects, and
//! runs the commit-notification/follower-poller pipeline.

use crate::config::{ControlVariant, NodeConfig};
use crate::control::file_sealed::FileSealedControlStore;
use crate::control::relational::RelationalControlStore;
use crate::control::{ControlStore, RevisionSnapshot};
use crate::events::EventBus;
use crate::export::{ExportManager, FileExportManager};
use crate::guard::{CommitCallback, GuardedControlStore, LeaderPredicate};
use crate::keyprovider::KeyProvider;
use crate::leadership::LeadershipRegistry;
use crate::mount;
use crate::process::{ProcessRunner, RealProcessRunner};
use crate::volume::VolumeManager;
use piccolo_types::{
    Command, CommandResponse, CommitEvent, EnsureVolumeResponse, ExportArtifact, ExportKind, LockStateChanged,
    PersistenceError, Role, VolumeClass, VolumeRequest, KERNEL_RESOURCE,
};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const BOOTSTRAP_VOLUME_ID: &str = "bootstrap";
pub const CONTROL_VOLUME_ID: &str = "control";

/// Optional component overrides. Fields left `None` fall back to the
/// file-backed defaults `Module::new` constructs.
#[derive(Default)]
pub struct ModuleOverrides {
    pub control_store: Option<Arc<dyn ControlStore>>,
    pub process_runner: Option<Arc<dyn ProcessRunner>>,
    pub export_manager: Option<Arc<dyn ExportManager>>,
}

pub struct Module {
    config: NodeConfig,
    event_bus: Arc<dyn EventBus>,
    leadership: Arc<dyn LeadershipRegistry>,
    volume_manager: Arc<VolumeManager>,
    control: Arc<dyn ControlStore>,
    export_manager: Arc<dyn ExportManager>,
    locked: RwLock<bool>,
    last_commit_revision: Arc<Mutex<u64>>,
    poller_cancel: CancellationToken,
    poller_handle: Mutex<Option<JoinHandle<()>>>,
    role_log_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Module {
    /// Construct the composition root. `key_provider: None` installs a
    /// `LockedKeyProvider` stand-in so every crypto-dependent path reports
    /// `Locked` until a real provider is supplied.
    pub fn new(
        config: NodeConfig,
        key_provider: Option<Arc<dyn KeyProvider>>,
        event_bus: Arc<dyn EventBus>,
        leadership: Arc<dyn LeadershipRegistry>,
        overrides: ModuleOverrides,
    ) -> Self {
        let key_provider = key_provider.unwrap_or_else(|| Arc::new(crate::keyprovider::LockedKeyProvider));
        let runner = overrides.process_runner.unwrap_or_else(|| Arc::new(RealProcessRunner));

        let volume_manager = Arc::new(VolumeManager::new(
            config.state_dir.clone(),
            config.cryptfs_bin.clone(),
            config.mount_wait,
            config.process_grace,
            config.unmount_candidates(),
            key_provider.clone(),
            runner,
            leadership.clone(),
        ));

        let inner_control: Arc<dyn ControlStore> = overrides.control_store.unwrap_or_else(|| match config.control_variant {
            ControlVariant::FileSealed => Arc::new(FileSealedControlStore::new(
                config.control_enc_path(),
                config.ciphertext_dir(CONTROL_VOLUME_ID),
                key_provider.clone(),
            )),
            ControlVariant::Relational => Arc::new(RelationalControlStore::new(
                config.control_db_path(),
                config.mount_dir(CONTROL_VOLUME_ID),
                config.ciphertext_dir(CONTROL_VOLUME_ID),
                key_provider.clone(),
                config.wal_checkpoint_interval,
            )),
        });

        let export_manager: Arc<dyn ExportManager> = overrides.export_manager.unwrap_or_else(|| {
            Arc::new(FileExportManager::new(
                config.control_enc_path(),
                config.exports_dir("control").join("control-plane.pcv"),
                config.exports_dir("full").join("full-data.pcv"),
            ))
        });

        let last_commit_revision = Arc::new(Mutex::new(0u64));

        let is_leader: LeaderPredicate = {
            let leadership = leadership.clone();
            Arc::new(move || {
                let leadership = leadership.clone();
                Box::pin(async move { leadership.role(KERNEL_RESOURCE).await == Role::Leader })
            })
        };
        let on_commit: CommitCallback = {
            let event_bus = event_bus.clone();
            let last_commit_revision = last_commit_revision.clone();
            Arc::new(move |snapshot: RevisionSnapshot| {
                let event_bus = event_bus.clone();
                let last_commit_revision = last_commit_revision.clone();
                Box::pin(async move {
                    publish_commit_if_new(&event_bus, &last_commit_revision, snapshot.revision, snapshot.checksum, Role::Leader)
                        .await;
                })
            })
        };
        let control: Arc<dyn ControlStore> = Arc::new(GuardedControlStore::new(inner_control, is_leader, on_commit));

        Self {
            config,
            event_bus,
            leadership,
            volume_manager,
            control,
            export_manager,
            locked: RwLock::new(true),
            last_commit_revision,
            poller_cancel: CancellationToken::new(),
            poller_handle: Mutex::new(None),
            role_log_handle: Mutex::new(None),
        }
    }

    /// Startup sequence: ensure the state root, enter the locked state,
    /// publish the initial lock-state event, attempt the bootstrap volume
    /// as leader (tolerating `Locked`/`NotImplemented`), register the
    /// control volume handle, and start the revision poller.
    pub async fn start(self: &Arc<Self>) -> Result<(), PersistenceError> {
        std::fs::create_dir_all(&self.config.state_dir)
            .map_err(|e| PersistenceError::io(format!("create state dir {}", self.config.state_dir.display()), e))?;

        self.spawn_role_change_logger();

        *self.locked.write().await = true;
        self.event_bus.publish_lock_state(LockStateChanged { locked: true }).await;

        match self
            .volume_manager
            .ensure_volume(VolumeRequest {
                id: BOOTSTRAP_VOLUME_ID.to_string(),
                class: VolumeClass::Bootstrap,
                cluster_mode: false,
            })
            .await
        {
            Ok(_) => {
                if let Err(e) = self.volume_manager.attach(BOOTSTRAP_VOLUME_ID, Role::Leader).await {
                    tracing::warn!(error = %e, "bootstrap volume leader attach deferred");
                }
            }
            Err(PersistenceError::Locked) => {
                tracing::info!("bootstrap volume ensure deferred: key provider locked");
            }
            Err(e) => tracing::warn!(error = %e, "bootstrap volume ensure failed"),
        }

        if let Err(e) = self
            .volume_manager
            .ensure_volume(VolumeRequest {
                id: CONTROL_VOLUME_ID.to_string(),
                class: VolumeClass::Control,
                cluster_mode: false,
            })
            .await
        {
            if !matches!(e, PersistenceError::Locked) {
                tracing::warn!(error = %e, "control volume ensure failed");
            }
        }

        self.spawn_revision_poller();
        Ok(())
    }

    fn spawn_role_change_logger(self: &Arc<Self>) {
        let mut rx = self.leadership.subscribe_role_changed();
        let cancel = self.poller_cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(role_changed) => tracing::info!(resource = %role_changed.resource, role = %role_changed.role, "leadership role changed"),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        if let Ok(mut guard) = self.role_log_handle.try_lock() {
            *guard = Some(handle);
        }
    }

    fn spawn_revision_poller(self: &Arc<Self>) {
        let module = self.clone();
        let cancel = self.poller_cancel.clone();
        let mut interval = tokio::time::interval(self.config.poll_interval);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if module.leadership.role(KERNEL_RESOURCE).await != Role::Leader {
                            if let Ok(snapshot) = module.control.revision().await {
                                publish_commit_if_new(
                                    &module.event_bus,
                                    &module.last_commit_revision,
                                    snapshot.revision,
                                    snapshot.checksum,
                                    Role::Follower,
                                )
                                .await;
                            }
                        }
                    }
                }
            }
        });
        if let Ok(mut guard) = self.poller_handle.try_lock() {
            *guard = Some(handle);
        }
    }

    pub async fn is_locked(&self) -> bool {
        *self.locked.read().await
    }

    pub fn control(&self) -> &Arc<dyn ControlStore> {
        &self.control
    }

    pub fn volumes(&self) -> &Arc<VolumeManager> {
        &self.volume_manager
    }

    /// `record_lock_state{locked}` command and the internal transitions
    /// triggered by crypto setup/unlock/lock in the external auth layer.
    pub async fn record_lock_state(&self, locked: bool) -> Result<(), PersistenceError> {
        if locked {
            self.transition_to_locked().await
        } else {
            self.transition_to_unlocked().await
        }
    }

    async fn transition_to_locked(&self) -> Result<(), PersistenceError> {
        self.control.lock().await?;
        if mount::sentinels_present(&self.config.mount_dir(CONTROL_VOLUME_ID)) {
            self.volume_manager.detach(CONTROL_VOLUME_ID).await?;
        }
        *self.locked.write().await = true;
        self.event_bus.publish_lock_state(LockStateChanged { locked: true }).await;
        Ok(())
    }

    async fn transition_to_unlocked(&self) -> Result<(), PersistenceError> {
        self.control.unlock().await?;

        let role = if self.leadership.role(KERNEL_RESOURCE).await == Role::Leader {
            Role::Leader
        } else {
            Role::Follower
        };

        if let Err(e) = self.volume_manager.attach(CONTROL_VOLUME_ID, role).await {
            let _ = self.control.lock().await;
            return Err(PersistenceError::AttachFailed {
                volume_id: CONTROL_VOLUME_ID.to_string(),
                reason: e.to_string(),
            });
        }

        *self.locked.write().await = false;
        self.event_bus.publish_lock_state(LockStateChanged { locked: false }).await;
        Ok(())
    }

    /// Dispatch a command delivered by the external command bus.
    pub async fn handle_command(&self, command: Command) -> Result<CommandResponse, PersistenceError> {
        match command {
            Command::EnsureVolume(req) => {
                let handle = self.volume_manager.ensure_volume(req).await?;
                Ok(CommandResponse::EnsureVolume(EnsureVolumeResponse { handle }))
            }
            Command::AttachVolume { id, role } => {
                self.volume_manager.attach(&id, role).await?;
                Ok(CommandResponse::None)
            }
            Command::RecordLockState { locked } => {
                self.record_lock_state(locked).await?;
                Ok(CommandResponse::None)
            }
            Command::RunControlExport => Ok(CommandResponse::Export(self.run_export_or_placeholder(ExportKind::ControlOnly).await?)),
            Command::RunFullExport => Ok(CommandResponse::Export(self.run_export_or_placeholder(ExportKind::FullData).await?)),
        }
    }

    async fn run_export_or_placeholder(&self, kind: ExportKind) -> Result<ExportArtifact, PersistenceError> {
        let result = match kind {
            ExportKind::ControlOnly => self.export_manager.run_control_plane().await,
            ExportKind::FullData => self.export_manager.run_full_data().await,
        };
        match result {
            Ok(artifact) => Ok(artifact),
            Err(PersistenceError::NotImplemented(_)) => Ok(self.placeholder_artifact(kind)),
            Err(e) => Err(e),
        }
    }

    fn placeholder_artifact(&self, kind: ExportKind) -> ExportArtifact {
        let (dir, file) = match kind {
            ExportKind::ControlOnly => ("control", "control-plane.pcv"),
            ExportKind::FullData => ("full", "full-data.pcv"),
        };
        ExportArtifact {
            path: self.config.exports_dir(dir).join(file),
            kind,
        }
    }

    /// Shutdown: cancel the revision poller, close the control store,
    /// detach the control and bootstrap volumes (tolerating mounts that
    /// already disappeared), and return a composite error if any step
    /// failed.
    pub async fn shutdown(&self) -> Result<(), PersistenceError> {
        self.poller_cancel.cancel();
        if let Some(handle) = self.poller_handle.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.role_log_handle.lock().await.take() {
            let _ = handle.await;
        }

        let mut failures = Vec::new();
        if let Err(e) = self.control.lock().await {
            failures.push(format!("control store close: {e}"));
        }
        if let Err(e) = self.volume_manager.detach(CONTROL_VOLUME_ID).await {
            failures.push(format!("detach control volume: {e}"));
        }
        if let Err(e) = self.volume_manager.detach(BOOTSTRAP_VOLUME_ID).await {
            failures.push(format!("detach bootstrap volume: {e}"));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PersistenceError::Io {
                context: "module shutdown".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, failures.join("; ")),
            })
        }
    }
}

/// Publish `ControlStoreCommit` only if `revision` strictly exceeds the last
/// revision this module has seen (a duplicate or stale revision produces no
/// event).
async fn publish_commit_if_new(
    event_bus: &Arc<dyn EventBus>,
    last_commit_revision: &Arc<Mutex<u64>>,
    revision: u64,
    checksum: String,
    role: Role,
) -> bool {
    let mut last = last_commit_revision.lock().await;
    if revision > *last {
        *last = revision;
        event_bus.publish_commit(CommitEvent { revision, checksum, role }).await;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryBus;
    use crate::keyprovider::StaticKeyProvider;
    use crate::leadership::InMemoryLeadership;
    use crate::process::CountingProcessRunner;
    use piccolo_types::AppRecord;
    use std::time::Duration;

    fn test_module(dir: &std::path::Path, role: Role) -> Arc<Module> {
        let config = NodeConfig {
            state_dir: dir.to_path_buf(),
            control_variant: ControlVariant::FileSealed,
            mount_wait: Duration::from_millis(200),
            process_grace: Duration::from_millis(100),
            wal_checkpoint_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(50),
            unmount_bin_override: Some("true".into()),
            cryptfs_bin: std::path::PathBuf::from("gocryptfs"),
        };
        let key_provider: Arc<dyn KeyProvider> = Arc::new(StaticKeyProvider::new([7u8; 32]));
        let leadership = Arc::new(InMemoryLeadership::new(role));
        let overrides = ModuleOverrides {
            process_runner: Some(Arc::new(CountingProcessRunner::default())),
            ..Default::default()
        };
        Arc::new(Module::new(config, Some(key_provider), Arc::new(InMemoryBus::new()), leadership, overrides))
    }

    #[tokio::test]
    async fn starts_locked_and_exposes_lock_state() {
        let dir = tempfile::tempdir().unwrap();
        let module = test_module(dir.path(), Role::Leader);
        assert!(module.is_locked().await);
        module.start().await.unwrap();
        assert!(module.is_locked().await);
        module.shutdown().await.unwrap();
    }

    /// `CountingProcessRunner` never performs a real mount (see its doc
    /// comment), so without `PICCOLO_MOUNTS_TABLE` pointing at a table that
    /// lists the mount directory, `attach` always times out. This exercises
    /// the rollback path: a failed attach re-locks the control store and the
    /// module-level lock flag never flips to unlocked.
    #[tokio::test]
    async fn unlock_fails_and_rolls_back_when_mount_never_appears() {
        let dir = tempfile::tempdir().unwrap();
        let module = test_module(dir.path(), Role::Leader);
        module.start().await.unwrap();

        let result = module.record_lock_state(false).await;
        assert!(matches!(result, Err(PersistenceError::AttachFailed { .. })));
        assert!(module.is_locked().await);

        module.shutdown().await.unwrap();
    }

    /// Faking the mount table lets `attach` observe the directory as
    /// mounted immediately, exercising the full unlock/lock round trip and
    /// the leadership gate on a real `GuardedControlStore`.
    #[tokio::test]
    async fn unlock_succeeds_with_faked_mount_table_and_lock_rejects_writes_as_follower() {
        let dir = tempfile::tempdir().unwrap();
        let control_mount = dir.path().join("mounts").join(CONTROL_VOLUME_ID);
        let fake_table = dir.path().join("mounts.fake");
        std::fs::create_dir_all(&control_mount).unwrap();
        std::fs::write(&fake_table, format!("cipherfs {} fuse.gocryptfs rw 0 0\n", control_mount.display())).unwrap();

        let previous = std::env::var("PICCOLO_MOUNTS_TABLE").ok();
        std::env::set_var("PICCOLO_MOUNTS_TABLE", &fake_table);

        let module = test_module(dir.path(), Role::Follower);
        module.start().await.unwrap();
        let unlock_result = module.record_lock_state(false).await;

        match previous {
            Some(v) => std::env::set_var("PICCOLO_MOUNTS_TABLE", v),
            None => std::env::remove_var("PICCOLO_MOUNTS_TABLE"),
        }

        unlock_result.unwrap();
        assert!(!module.is_locked().await);

        let write_result = module
            .control
            .upsert_app(AppRecord {
                name: "alpha".into(),
                extra: Default::default(),
            })
            .await;
        assert!(matches!(write_result, Err(PersistenceError::NotLeader(_))));

        module.record_lock_state(true).await.unwrap();
        assert!(module.is_locked().await);
        module.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_commit_publish_produces_no_second_event() {
        let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
        let last = Arc::new(Mutex::new(0u64));
        let mut rx = event_bus.subscribe_commit();

        assert!(publish_commit_if_new(&event_bus, &last, 1, "a".into(), Role::Leader).await);
        assert!(!publish_commit_if_new(&event_bus, &last, 1, "a".into(), Role::Leader).await);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.revision, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_control_export_falls_back_to_placeholder_when_not_implemented() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            state_dir: dir.path().to_path_buf(),
            ..NodeConfig::default()
        };

        struct NotImplementedExportManager;
        #[async_trait::async_trait]
        impl ExportManager for NotImplementedExportManager {
            async fn run_control_plane(&self) -> Result<ExportArtifact, PersistenceError> {
                Err(PersistenceError::NotImplemented("control-plane export".into()))
            }
            async fn run_full_data(&self) -> Result<ExportArtifact, PersistenceError> {
                Err(PersistenceError::NotImplemented("full-data export".into()))
            }
            async fn import_control_plane(&self, _artifact_path: &std::path::Path) -> Result<(), PersistenceError> {
                Err(PersistenceError::NotImplemented("control-plane import".into()))
            }
            async fn import_full_data(&self, _artifact_path: &std::path::Path) -> Result<(), PersistenceError> {
                Err(PersistenceError::NotImplemented("full-data import".into()))
            }
        }

        let overrides = ModuleOverrides {
            control_store: None,
            process_runner: Some(Arc::new(CountingProcessRunner::default())),
            export_manager: Some(Arc::new(NotImplementedExportManager)),
        };
        let module = Arc::new(Module::new(
            config,
            Some(Arc::new(StaticKeyProvider::new([1u8; 32]))),
            Arc::new(InMemoryBus::new()),
            Arc::new(InMemoryLeadership::new(Role::Leader)),
            overrides,
        ));

        let response = module.handle_command(Command::RunControlExport).await.unwrap();
        match response {
            CommandResponse::Export(artifact) => {
                assert_eq!(artifact.kind, ExportKind::ControlOnly);
                assert!(!artifact.path.exists());
            }
            _ => panic!("expected export response"),
        }
    }
}
