//! Piccolo persistence core: volume lifecycle, encrypted control-store
//! state, and export snapshots behind a single thread-safe composition
//! root (`Module`).

pub mod config;
pub mod control;
pub mod crypto;
pub mod events;
pub mod export;
pub mod guard;
pub mod keyprovider;
pub mod leadership;
pub mod module;
pub mod mount;
pub mod process;
pub mod volume;

pub use config::{ControlVariant, NodeConfig};
pub use control::ControlStore;
pub use events::{EventBus, InMemoryBus};
pub use export::{ExportManager, FileExportManager};
pub use guard::GuardedControlStore;
pub use keyprovider::{KeyProvider, LockedKeyProvider, PassphraseKeyProvider, StaticKeyProvider};
pub use leadership::{InMemoryLeadership, LeadershipRegistry};
pub use module::{Module, ModuleOverrides};
pub use process::{ProcessRunner, RealProcessRunner};
pub use volume::VolumeManager;

pub use piccolo_types::{
    AppRecord, Command, CommandResponse, CommitEvent, EnsureVolumeResponse, ExportArtifact, ExportKind,
    LockStateChanged, PersistenceError, RemoteConfig, Role, RoleChanged, VolumeClass, VolumeHandle, VolumeMetadata,
    VolumeRequest, KERNEL_RESOURCE,
};
