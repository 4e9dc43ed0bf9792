//! Export Manager: produces snapshot artifacts from the on-disk control
//! blob. `Import*` operations are declared but unimplemented — returning
//! `NotImplemented` lets the `Module` command handler fall back to a
//! placeholder artifact rather than failing the command.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use piccolo_types::{ExportArtifact, ExportEnvelope, ExportKind, PersistenceError};
use std::path::{Path, PathBuf};

/// Produces and restores snapshot artifacts. A trait so `Module` can accept
/// test doubles that exercise the `NotImplemented` fallback path without a
/// real control blob on disk.
#[async_trait]
pub trait ExportManager: Send + Sync {
    async fn run_control_plane(&self) -> Result<ExportArtifact, PersistenceError>;
    async fn run_full_data(&self) -> Result<ExportArtifact, PersistenceError>;
    async fn import_control_plane(&self, artifact_path: &Path) -> Result<(), PersistenceError>;
    async fn import_full_data(&self, artifact_path: &Path) -> Result<(), PersistenceError>;
}

pub struct FileExportManager {
    control_enc_path: PathBuf,
    control_export_path: PathBuf,
    full_export_path: PathBuf,
}

impl FileExportManager {
    pub fn new(control_enc_path: PathBuf, control_export_path: PathBuf, full_export_path: PathBuf) -> Self {
        Self {
            control_enc_path,
            control_export_path,
            full_export_path,
        }
    }

    async fn snapshot(&self, kind: ExportKind, source: &Path, dest: &Path) -> Result<ExportArtifact, PersistenceError> {
        if !source.exists() {
            return Err(PersistenceError::SourceMissing(source.to_path_buf()));
        }
        let bytes = tokio::fs::read(source)
            .await
            .map_err(|e| PersistenceError::io(format!("read export source {}", source.display()), e))?;

        let envelope = ExportEnvelope {
            kind,
            generated_at: Utc::now(),
            sha256: crate::crypto::sha256_hex(&bytes),
            blob_b64: STANDARD.encode(&bytes),
        };
        let json = serde_json::to_vec(&envelope).map_err(|e| PersistenceError::Io {
            context: "serialize export envelope".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistenceError::io(format!("create dir {}", parent.display()), e))?;
        }
        let tmp = dest.with_extension("pcv.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| PersistenceError::io(format!("write {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| PersistenceError::io(format!("rename {} -> {}", tmp.display(), dest.display()), e))?;

        Ok(ExportArtifact {
            path: dest.to_path_buf(),
            kind,
        })
    }
}

#[async_trait]
impl ExportManager for FileExportManager {
    async fn run_control_plane(&self) -> Result<ExportArtifact, PersistenceError> {
        self.snapshot(ExportKind::ControlOnly, &self.control_enc_path.clone(), &self.control_export_path.clone())
            .await
    }

    /// Application volumes are not yet included — this reuses the control
    /// ciphertext as a documented placeholder, provisional rather than a
    /// bit-exact contract.
    async fn run_full_data(&self) -> Result<ExportArtifact, PersistenceError> {
        self.snapshot(ExportKind::FullData, &self.control_enc_path.clone(), &self.full_export_path.clone())
            .await
    }

    async fn import_control_plane(&self, _artifact_path: &Path) -> Result<(), PersistenceError> {
        Err(PersistenceError::NotImplemented("control-plane import".into()))
    }

    async fn import_full_data(&self, _artifact_path: &Path) -> Result<(), PersistenceError> {
        Err(PersistenceError::NotImplemented("full-data import".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> FileExportManager {
        FileExportManager::new(
            dir.join("ciphertext/control/control.enc"),
            dir.join("exports/control/control-plane.pcv"),
            dir.join("exports/full/full-data.pcv"),
        )
    }

    #[tokio::test]
    async fn missing_source_yields_source_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let result = mgr.run_control_plane().await;
        assert!(matches!(result, Err(PersistenceError::SourceMissing(_))));
    }

    #[tokio::test]
    async fn control_export_writes_envelope_with_matching_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let enc_path = dir.path().join("ciphertext/control/control.enc");
        std::fs::create_dir_all(enc_path.parent().unwrap()).unwrap();
        std::fs::write(&enc_path, b"ciphertext-bytes").unwrap();

        let mgr = manager(dir.path());
        let artifact = mgr.run_control_plane().await.unwrap();
        assert_eq!(artifact.kind, ExportKind::ControlOnly);
        assert!(artifact.path.exists());

        let written = std::fs::read_to_string(&artifact.path).unwrap();
        let envelope: ExportEnvelope = serde_json::from_str(&written).unwrap();
        assert_eq!(envelope.sha256, crate::crypto::sha256_hex(b"ciphertext-bytes"));
        let decoded = STANDARD.decode(&envelope.blob_b64).unwrap();
        assert_eq!(decoded, b"ciphertext-bytes");
    }

    #[tokio::test]
    async fn imports_are_not_implemented() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        assert!(matches!(
            mgr.import_control_plane(Path::new("whatever")).await,
            Err(PersistenceError::NotImplemented(_))
        ));
    }
}
