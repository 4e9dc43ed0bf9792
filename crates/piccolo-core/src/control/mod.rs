//! Control Store: durable encrypted key/value structure for auth bits,
//! remote config, app records, password hash, with revision + checksum.
//! Two personalities satisfy the same `ControlStore` trait, so
//! `guard.rs`, `module.rs`, and `export.rs` are written once against the
//! trait object.

pub mod file_sealed;
pub mod relational;

use async_trait::async_trait;
use piccolo_types::{AppRecord, PersistenceError, RemoteConfig};

/// Current `(revision, checksum)` without requiring a full state read —
/// used by the commit callback and the follower poller to decide whether
/// a new commit event is warranted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionSnapshot {
    pub revision: u64,
    pub checksum: String,
}

/// Shared contract for both control-store personalities. Every mutator is
/// expected to be atomic with respect to `revision`/`checksum` advancement:
/// either both move together or neither does.
#[async_trait]
pub trait ControlStore: Send + Sync {
    /// Load plaintext state into memory. Idempotent; unlocking an already
    /// unlocked store is a no-op success.
    async fn unlock(&self) -> Result<(), PersistenceError>;

    /// Discard in-memory plaintext. Subsequent reads/writes return `Locked`
    /// until `unlock` is called again.
    async fn lock(&self) -> Result<(), PersistenceError>;

    /// Lightweight liveness/health probe distinguishing `Locked` from a
    /// deeper failure without paying for a full state read.
    async fn quick_check(&self) -> Result<(), PersistenceError>;

    async fn revision(&self) -> Result<RevisionSnapshot, PersistenceError>;

    // Auth repository
    async fn is_initialized(&self) -> Result<bool, PersistenceError>;
    async fn set_initialized(&self) -> Result<RevisionSnapshot, PersistenceError>;
    async fn password_hash(&self) -> Result<Option<String>, PersistenceError>;
    async fn save_password_hash(&self, hash: String) -> Result<RevisionSnapshot, PersistenceError>;

    // Remote repository
    async fn current_config(&self) -> Result<RemoteConfig, PersistenceError>;
    async fn save_config(&self, config: RemoteConfig) -> Result<RevisionSnapshot, PersistenceError>;

    // App state repository
    async fn list_apps(&self) -> Result<Vec<AppRecord>, PersistenceError>;
    async fn upsert_app(&self, app: AppRecord) -> Result<RevisionSnapshot, PersistenceError>;
}
