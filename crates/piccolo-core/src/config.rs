//! Typed startup configuration for the persistence core: environment
//! override with a hardcoded fallback, the same shape every path helper
//! in this crate uses.

use std::path::PathBuf;
use std::time::Duration;

/// Name of the control-store personality to construct. The guard and module
/// are written against the `ControlStore` trait and do not care which one
/// is active — see `control::mod`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlVariant {
    FileSealed,
    Relational,
}

impl std::str::FromStr for ControlVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_sealed" | "file-sealed" => Ok(Self::FileSealed),
            "relational" => Ok(Self::Relational),
            other => Err(format!("unknown control store variant: {other}")),
        }
    }
}

/// Startup configuration for the persistence `Module`: 5s mount wait, 2s
/// process grace, 1 minute WAL checkpoint interval, 5s revision poll
/// interval by default.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub state_dir: PathBuf,
    pub control_variant: ControlVariant,
    pub mount_wait: Duration,
    pub process_grace: Duration,
    pub wal_checkpoint_interval: Duration,
    pub poll_interval: Duration,
    /// Overrides the unmount binary search path (normally
    /// `fusermount3`, then `fusermount`).
    pub unmount_bin_override: Option<String>,
    /// Path to the native ciphertext-volume initializer/mounter binary
    /// (gocryptfs-equivalent).
    pub cryptfs_bin: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            control_variant: ControlVariant::FileSealed,
            mount_wait: Duration::from_secs(5),
            process_grace: Duration::from_secs(2),
            wal_checkpoint_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            unmount_bin_override: std::env::var("PICCOLO_UNMOUNT_BIN").ok(),
            cryptfs_bin: std::env::var("PICCOLO_CRYPTFS_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("gocryptfs")),
        }
    }
}

/// Default state root: `$PICCOLO_STATE_DIR`, falling back to a
/// HOME-relative `~/.piccolo/state`.
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PICCOLO_STATE_DIR") {
        return PathBuf::from(dir);
    }
    home_dir().join(".piccolo").join("state")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

impl NodeConfig {
    pub fn ciphertext_dir(&self, volume_id: &str) -> PathBuf {
        self.state_dir.join("ciphertext").join(volume_id)
    }

    pub fn mount_dir(&self, volume_id: &str) -> PathBuf {
        self.state_dir.join("mounts").join(volume_id)
    }

    pub fn control_enc_path(&self) -> PathBuf {
        self.ciphertext_dir("control").join("control.enc")
    }

    pub fn control_db_path(&self) -> PathBuf {
        self.mount_dir("control").join("control.db")
    }

    pub fn exports_dir(&self, kind: &str) -> PathBuf {
        self.state_dir.join("exports").join(kind)
    }

    /// Candidate unmount binaries in search order, honoring the override.
    pub fn unmount_candidates(&self) -> Vec<String> {
        if let Some(bin) = &self.unmount_bin_override {
            return vec![bin.clone()];
        }
        vec!["fusermount3".to_string(), "fusermount".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_durations_match_spec_constants() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.mount_wait, Duration::from_secs(5));
        assert_eq!(cfg.process_grace, Duration::from_secs(2));
        assert_eq!(cfg.wal_checkpoint_interval, Duration::from_secs(60));
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn unmount_candidates_default_search_order() {
        let mut cfg = NodeConfig::default();
        cfg.unmount_bin_override = None;
        assert_eq!(cfg.unmount_candidates(), vec!["fusermount3", "fusermount"]);
    }

    #[test]
    fn unmount_override_takes_precedence() {
        let mut cfg = NodeConfig::default();
        cfg.unmount_bin_override = Some("custom-unmount".into());
        assert_eq!(cfg.unmount_candidates(), vec!["custom-unmount"]);
    }

    #[test]
    fn control_variant_parses_known_strings() {
        assert_eq!("file_sealed".parse::<ControlVariant>().unwrap(), ControlVariant::FileSealed);
        assert_eq!("relational".parse::<ControlVariant>().unwrap(), ControlVariant::Relational);
        assert!("bogus".parse::<ControlVariant>().is_err());
    }
}
