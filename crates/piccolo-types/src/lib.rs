//! Shared data model and wire contract for the Piccolo persistence core.
//!
//! Depended on by every other crate in the workspace; depends on none of
//! them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ── Errors ───────────────────────────────────────────────────────

/// Tagged sum type for every error kind the persistence core can surface.
/// Callers pattern-match on the variant; nothing here is matched by
/// substring.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("control store is locked")]
    Locked,

    #[error("not leader for resource {0}")]
    NotLeader(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("crypto unavailable: no key provider configured")]
    CryptoUnavailable,

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("export source missing: {0}")]
    SourceMissing(PathBuf),

    #[error("attach failed for volume {volume_id}: {reason}")]
    AttachFailed { volume_id: String, reason: String },

    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PersistenceError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

// ── Roles ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Leader,
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
        }
    }
}

/// The cluster resource whose leadership gates control-store writes. A
/// single well-known name in the current design — kept as a string so a
/// future multi-resource leadership registry does not require a type
/// change at this boundary.
pub const KERNEL_RESOURCE: &str = "kernel";

// ── Volumes ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeClass {
    Bootstrap,
    Control,
    Application,
}

impl std::fmt::Display for VolumeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bootstrap => write!(f, "bootstrap"),
            Self::Control => write!(f, "control"),
            Self::Application => write!(f, "application"),
        }
    }
}

/// Input to `EnsureVolume`. Created by callers, destroyed at request
/// return — carries no handle of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub id: String,
    pub class: VolumeClass,
    #[serde(default)]
    pub cluster_mode: bool,
}

/// Exclusively owned by the Volume Manager's registry. Stable for the life
/// of the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHandle {
    pub id: String,
    pub mount_dir: PathBuf,
}

/// Persisted at `<cipher_dir>/piccolo.volume.json`. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMetadata {
    pub version: u32,
    pub wrapped_key_b64: String,
    pub nonce_b64: String,
}

impl VolumeMetadata {
    pub const CURRENT_VERSION: u32 = 1;
}

// ── Control store payload ────────────────────────────────────────

/// Opaque to the core beyond `name`, which is required and acts as the
/// primary key. Other caller-supplied fields pass through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppRecord {
    pub name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Opaque JSON bytes, cloned defensively on every copy so external callers
/// cannot mutate stored state through a borrowed reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    pub payload: Vec<u8>,
}

/// On-disk / canonical representation of the control store's state. Apps
/// are always sorted lexicographically by name before serialization so the
/// checksum is deterministic regardless of insertion order.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ControlPayload {
    pub version: u32,
    pub auth_initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
    pub apps: Vec<AppRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    pub revision: u64,
    pub checksum: String,
}

impl ControlPayload {
    pub const CURRENT_VERSION: u32 = 1;

    /// Canonical bytes used to compute the checksum: identical payload with
    /// `checksum` forced to the empty string, serialized with fixed field
    /// order via `serde_json`'s struct-field ordering (stable for a given
    /// struct definition).
    pub fn canonical_bytes_for_checksum(&self) -> Vec<u8> {
        let mut zeroed = self.clone();
        zeroed.checksum = String::new();
        serde_json::to_vec(&zeroed).expect("ControlPayload always serializes")
    }
}

/// In-memory projection held by an unlocked control store.
#[derive(Debug, Clone, Default)]
pub struct ControlState {
    pub auth_initialized: bool,
    pub remote_config: Option<RemoteConfig>,
    pub apps: std::collections::BTreeMap<String, AppRecord>,
    pub password_hash: Option<String>,
    pub revision: u64,
    pub checksum: String,
}

impl ControlState {
    pub fn to_payload(&self) -> ControlPayload {
        ControlPayload {
            version: ControlPayload::CURRENT_VERSION,
            auth_initialized: self.auth_initialized,
            remote: self.remote_config.clone(),
            apps: self.apps.values().cloned().collect(),
            password_hash: self.password_hash.clone(),
            revision: self.revision,
            checksum: self.checksum.clone(),
        }
    }

    pub fn from_payload(payload: ControlPayload) -> Self {
        let mut apps = std::collections::BTreeMap::new();
        for app in payload.apps {
            apps.insert(app.name.clone(), app);
        }
        Self {
            auth_initialized: payload.auth_initialized,
            remote_config: payload.remote,
            apps,
            password_hash: payload.password_hash,
            revision: payload.revision,
            checksum: payload.checksum,
        }
    }
}

// ── File-sealed envelope ─────────────────────────────────────────

/// On-disk envelope for the file-sealed control blob and for per-volume
/// passphrase wrapping (the `wrapped_key`/`nonce` fields of
/// `VolumeMetadata` use the same base64-standard encoding convention).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub version: u32,
    pub nonce: String,
    pub ciphertext: String,
}

impl SealedEnvelope {
    pub const CURRENT_VERSION: u32 = 1;
}

// ── Export ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportKind {
    ControlOnly,
    FullData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub path: PathBuf,
    pub kind: ExportKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportEnvelope {
    pub kind: ExportKind,
    pub generated_at: DateTime<Utc>,
    pub sha256: String,
    pub blob_b64: String,
}

// ── Events ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitEvent {
    pub revision: u64,
    pub checksum: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LockStateChanged {
    pub locked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleChanged {
    pub resource: String,
    pub role: Role,
}

// ── Commands ─────────────────────────────────────────────────────

pub mod command_names {
    pub const ENSURE_VOLUME: &str = "persistence.ensure_volume";
    pub const ATTACH_VOLUME: &str = "persistence.attach_volume";
    pub const RECORD_LOCK_STATE: &str = "persistence.record_lock_state";
    pub const RUN_CONTROL_EXPORT: &str = "persistence.run_control_export";
    pub const RUN_FULL_EXPORT: &str = "persistence.run_full_export";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    #[serde(rename = "persistence.ensure_volume")]
    EnsureVolume(VolumeRequest),
    #[serde(rename = "persistence.attach_volume")]
    AttachVolume { id: String, role: Role },
    #[serde(rename = "persistence.record_lock_state")]
    RecordLockState { locked: bool },
    #[serde(rename = "persistence.run_control_export")]
    RunControlExport,
    #[serde(rename = "persistence.run_full_export")]
    RunFullExport,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::EnsureVolume(_) => command_names::ENSURE_VOLUME,
            Self::AttachVolume { .. } => command_names::ATTACH_VOLUME,
            Self::RecordLockState { .. } => command_names::RECORD_LOCK_STATE,
            Self::RunControlExport => command_names::RUN_CONTROL_EXPORT,
            Self::RunFullExport => command_names::RUN_FULL_EXPORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureVolumeResponse {
    pub handle: VolumeHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandResponse {
    EnsureVolume(EnsureVolumeResponse),
    Export(ExportArtifact),
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_order_independent_of_field_values() {
        let mut a = ControlPayload {
            version: 1,
            auth_initialized: true,
            remote: None,
            apps: vec![],
            password_hash: None,
            revision: 4,
            checksum: "deadbeef".into(),
        };
        let b = a.clone();
        a.checksum = "other".into();
        assert_eq!(a.canonical_bytes_for_checksum(), b.canonical_bytes_for_checksum());
    }

    #[test]
    fn control_state_roundtrips_through_payload() {
        let mut state = ControlState::default();
        state.auth_initialized = true;
        state.revision = 3;
        state.checksum = "abc".into();
        state.apps.insert(
            "app-alpha".into(),
            AppRecord {
                name: "app-alpha".into(),
                extra: Default::default(),
            },
        );
        let payload = state.to_payload();
        assert_eq!(payload.apps.len(), 1);
        let restored = ControlState::from_payload(payload);
        assert_eq!(restored.revision, 3);
        assert!(restored.apps.contains_key("app-alpha"));
    }

    #[test]
    fn command_name_matches_literal_dispatch_strings() {
        assert_eq!(Command::RunControlExport.name(), "persistence.run_control_export");
        assert_eq!(
            Command::RecordLockState { locked: true }.name(),
            "persistence.record_lock_state"
        );
    }
}
