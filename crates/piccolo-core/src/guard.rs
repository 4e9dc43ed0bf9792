//! Guarded Control Store: a delegating wrapper around any `ControlStore`
//! that rejects writes unless a leadership predicate reports true, and
//! invokes a commit callback after each successful mutation.
//!
//! Layered by delegation rather than subtyping — `Module` swaps the
//! predicate for tests or alternative leadership topologies without the
//! storage implementation knowing anything changed.

use crate::control::{ControlStore, RevisionSnapshot};
use async_trait::async_trait;
use piccolo_types::{AppRecord, PersistenceError, RemoteConfig};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type LeaderPredicate = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;
pub type CommitCallback = Arc<dyn Fn(RevisionSnapshot) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct GuardedControlStore {
    inner: Arc<dyn ControlStore>,
    is_leader: LeaderPredicate,
    on_commit: CommitCallback,
}

impl GuardedControlStore {
    pub fn new(inner: Arc<dyn ControlStore>, is_leader: LeaderPredicate, on_commit: CommitCallback) -> Self {
        Self {
            inner,
            is_leader,
            on_commit,
        }
    }

    async fn guard_write<F, Fut>(&self, mutate: F) -> Result<RevisionSnapshot, PersistenceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RevisionSnapshot, PersistenceError>>,
    {
        if !(self.is_leader)().await {
            return Err(PersistenceError::NotLeader(piccolo_types::KERNEL_RESOURCE.to_string()));
        }
        let snapshot = mutate().await?;
        (self.on_commit)(snapshot.clone()).await;
        Ok(snapshot)
    }
}

#[async_trait]
impl ControlStore for GuardedControlStore {
    async fn unlock(&self) -> Result<(), PersistenceError> {
        self.inner.unlock().await
    }

    async fn lock(&self) -> Result<(), PersistenceError> {
        self.inner.lock().await
    }

    async fn quick_check(&self) -> Result<(), PersistenceError> {
        self.inner.quick_check().await
    }

    async fn revision(&self) -> Result<RevisionSnapshot, PersistenceError> {
        self.inner.revision().await
    }

    async fn is_initialized(&self) -> Result<bool, PersistenceError> {
        self.inner.is_initialized().await
    }

    async fn set_initialized(&self) -> Result<RevisionSnapshot, PersistenceError> {
        self.guard_write(|| self.inner.set_initialized()).await
    }

    async fn password_hash(&self) -> Result<Option<String>, PersistenceError> {
        self.inner.password_hash().await
    }

    async fn save_password_hash(&self, hash: String) -> Result<RevisionSnapshot, PersistenceError> {
        self.guard_write(|| self.inner.save_password_hash(hash)).await
    }

    async fn current_config(&self) -> Result<RemoteConfig, PersistenceError> {
        self.inner.current_config().await
    }

    async fn save_config(&self, config: RemoteConfig) -> Result<RevisionSnapshot, PersistenceError> {
        self.guard_write(|| self.inner.save_config(config)).await
    }

    async fn list_apps(&self) -> Result<Vec<AppRecord>, PersistenceError> {
        self.inner.list_apps().await
    }

    async fn upsert_app(&self, app: AppRecord) -> Result<RevisionSnapshot, PersistenceError> {
        self.guard_write(|| self.inner.upsert_app(app)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::file_sealed::FileSealedControlStore;
    use crate::keyprovider::StaticKeyProvider;
    use crate::volume::{CRYPTFS_CONFIG_FILE, VOLUME_METADATA_FILE};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn guarded(dir: &std::path::Path, leader: Arc<AtomicBool>, commits: Arc<AtomicUsize>) -> GuardedControlStore {
        let cipher_dir = dir.join("ciphertext/control");
        std::fs::create_dir_all(&cipher_dir).unwrap();
        std::fs::write(cipher_dir.join(CRYPTFS_CONFIG_FILE), b"conf").unwrap();
        std::fs::write(cipher_dir.join(VOLUME_METADATA_FILE), b"{}").unwrap();
        let inner: Arc<dyn ControlStore> = Arc::new(FileSealedControlStore::new(
            cipher_dir.join("control.enc"),
            cipher_dir,
            Arc::new(StaticKeyProvider::new([2u8; 32])),
        ));

        let predicate: LeaderPredicate = Arc::new(move || {
            let leader = leader.clone();
            Box::pin(async move { leader.load(Ordering::SeqCst) })
        });
        let on_commit: CommitCallback = Arc::new(move |_snapshot| {
            let commits = commits.clone();
            Box::pin(async move {
                commits.fetch_add(1, Ordering::SeqCst);
            })
        });
        GuardedControlStore::new(inner, predicate, on_commit)
    }

    #[tokio::test]
    async fn write_rejected_when_not_leader() {
        let dir = tempfile::tempdir().unwrap();
        let leader = Arc::new(AtomicBool::new(false));
        let commits = Arc::new(AtomicUsize::new(0));
        let store = guarded(dir.path(), leader, commits.clone());
        store.unlock().await.unwrap();

        let result = store.set_initialized().await;
        assert!(matches!(result, Err(PersistenceError::NotLeader(_))));
        assert_eq!(store.revision().await.unwrap().revision, 0);
        assert_eq!(commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn write_succeeds_and_invokes_commit_callback_when_leader() {
        let dir = tempfile::tempdir().unwrap();
        let leader = Arc::new(AtomicBool::new(true));
        let commits = Arc::new(AtomicUsize::new(0));
        let store = guarded(dir.path(), leader, commits.clone());
        store.unlock().await.unwrap();

        let snapshot = store.set_initialized().await.unwrap();
        assert_eq!(snapshot.revision, 1);
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }
}
