//! Relational Control Store personality: persists into a single-file
//! SQLite database beneath a mounted FUSE volume. The encryption boundary
//! is the mount itself — the database file is plaintext *within* the
//! mount, ciphertext beneath it — so this personality never touches the
//! SDEK beyond checking it is available.
//!
//! sqlx usage is dynamic `query`/`query_as`, not the `query!` compile-time
//! macros, since this workspace has no `DATABASE_URL` to check against at
//! build time.

use crate::keyprovider::KeyProvider;
use crate::mount::{self, MODE_SENTINEL};
use crate::volume::{CRYPTFS_CONFIG_FILE, VOLUME_METADATA_FILE};
use async_trait::async_trait;
use chrono::Utc;
use piccolo_types::{AppRecord, ControlPayload, PersistenceError, RemoteConfig};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use super::{ControlStore, RevisionSnapshot};

const SCHEMA_VERSION: i64 = 1;

/// Bypasses the "mount point appears in the mount table" precondition —
/// documented test-only escape hatch for sandboxes without a real FUSE
/// mount.
const SKIP_MOUNT_CHECK_ENV: &str = "PICCOLO_SKIP_MOUNT_CHECK";

struct Session {
    pool: SqlitePool,
    read_only: bool,
}

pub struct RelationalControlStore {
    db_path: PathBuf,
    mount_dir: PathBuf,
    cipher_dir: PathBuf,
    key_provider: Arc<dyn KeyProvider>,
    checkpoint_interval: Duration,
    session: RwLock<Option<Session>>,
    last_checkpoint: Mutex<Instant>,
}

impl RelationalControlStore {
    pub fn new(
        db_path: PathBuf,
        mount_dir: PathBuf,
        cipher_dir: PathBuf,
        key_provider: Arc<dyn KeyProvider>,
        checkpoint_interval: Duration,
    ) -> Self {
        Self {
            db_path,
            mount_dir,
            cipher_dir,
            key_provider,
            checkpoint_interval,
            session: RwLock::new(None),
            last_checkpoint: Mutex::new(Instant::now()),
        }
    }

    fn check_prereqs(&self) -> Result<(), PersistenceError> {
        if self.cipher_dir.join(CRYPTFS_CONFIG_FILE).exists() && self.cipher_dir.join(VOLUME_METADATA_FILE).exists() {
            Ok(())
        } else {
            Err(PersistenceError::Locked)
        }
    }

    fn mount_is_ready(&self) -> Result<(), PersistenceError> {
        if std::env::var(SKIP_MOUNT_CHECK_ENV).is_ok() {
            return Ok(());
        }
        if mount::is_mounted(&self.mount_dir).unwrap_or(false) {
            Ok(())
        } else {
            Err(PersistenceError::Locked)
        }
    }

    fn detect_read_only(&self) -> bool {
        std::fs::read_to_string(self.mount_dir.join(MODE_SENTINEL))
            .map(|mode| mode.trim() == "ro")
            .unwrap_or(false)
    }

    async fn writer_pool(&self) -> Result<SqlitePool, PersistenceError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(PersistenceError::Locked)?;
        if session.read_only {
            return Err(PersistenceError::Locked);
        }
        Ok(session.pool.clone())
    }

    /// Reads the current full state inside `tx`, applies `mutate`, computes
    /// the next revision/checksum over the resulting canonical payload, and
    /// commits. On any failure the transaction is rolled back and the
    /// on-disk `meta` row is left untouched, satisfying "on transaction
    /// failure, in-memory state is not advanced" (there is no separate
    /// in-memory projection for this personality — the table rows are the
    /// state).
    async fn write_transaction(
        &self,
        mutate: impl FnOnce(&mut ControlPayload),
    ) -> Result<RevisionSnapshot, PersistenceError> {
        self.check_prereqs()?;
        let pool = self.writer_pool().await?;

        let mut tx = pool.begin().await.map_err(sqlx_err("begin transaction"))?;
        let mut payload = read_payload(&mut tx).await?;
        mutate(&mut payload);
        payload.revision += 1;
        payload.checksum = String::new();
        let checksum = crate::crypto::sha256_hex(&payload.canonical_bytes_for_checksum());
        payload.checksum = checksum.clone();

        write_payload(&mut tx, &payload).await?;
        update_meta(&mut tx, payload.revision, &checksum).await?;
        tx.commit().await.map_err(sqlx_err("commit transaction"))?;

        self.maybe_checkpoint(&pool).await;

        Ok(RevisionSnapshot {
            revision: payload.revision,
            checksum,
        })
    }

    async fn maybe_checkpoint(&self, pool: &SqlitePool) {
        let mut last = self.last_checkpoint.lock().await;
        if last.elapsed() < self.checkpoint_interval {
            return;
        }
        *last = Instant::now();
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(PASSIVE)").execute(pool).await {
            tracing::warn!(error = %e, "passive WAL checkpoint failed");
        }
    }
}

#[async_trait]
impl ControlStore for RelationalControlStore {
    async fn unlock(&self) -> Result<(), PersistenceError> {
        if self.session.read().await.is_some() {
            return Ok(());
        }

        self.key_provider
            .with_sdek(Box::new(|_key| Ok(Vec::new())))
            .await?;
        self.check_prereqs()?;
        self.mount_is_ready()?;

        let read_only = self.detect_read_only();
        let pool = connect(&self.db_path, read_only).await?;
        if !read_only {
            migrate(&pool).await?;
        }

        *self.session.write().await = Some(Session { pool, read_only });
        Ok(())
    }

    async fn lock(&self) -> Result<(), PersistenceError> {
        if let Some(session) = self.session.write().await.take() {
            session.pool.close().await;
        }
        Ok(())
    }

    async fn quick_check(&self) -> Result<(), PersistenceError> {
        if self.session.read().await.is_some() {
            Ok(())
        } else {
            Err(PersistenceError::Locked)
        }
    }

    async fn revision(&self) -> Result<RevisionSnapshot, PersistenceError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(PersistenceError::Locked)?;
        let row = sqlx::query("SELECT revision, checksum FROM meta WHERE id = 1")
            .fetch_one(&session.pool)
            .await
            .map_err(sqlx_err("read meta"))?;
        Ok(RevisionSnapshot {
            revision: row.get::<i64, _>("revision") as u64,
            checksum: row.get("checksum"),
        })
    }

    async fn is_initialized(&self) -> Result<bool, PersistenceError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(PersistenceError::Locked)?;
        let row = sqlx::query("SELECT initialized FROM auth_state WHERE id = 1")
            .fetch_one(&session.pool)
            .await
            .map_err(sqlx_err("read auth_state"))?;
        Ok(row.get::<i64, _>("initialized") != 0)
    }

    async fn set_initialized(&self) -> Result<RevisionSnapshot, PersistenceError> {
        if self.is_initialized().await.unwrap_or(false) {
            return self.revision().await;
        }
        self.write_transaction(|payload| payload.auth_initialized = true).await
    }

    async fn password_hash(&self) -> Result<Option<String>, PersistenceError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(PersistenceError::Locked)?;
        let row = sqlx::query("SELECT password_hash FROM auth_state WHERE id = 1")
            .fetch_one(&session.pool)
            .await
            .map_err(sqlx_err("read auth_state"))?;
        Ok(row.get("password_hash"))
    }

    async fn save_password_hash(&self, hash: String) -> Result<RevisionSnapshot, PersistenceError> {
        self.write_transaction(|payload| payload.password_hash = Some(hash.clone())).await
    }

    async fn current_config(&self) -> Result<RemoteConfig, PersistenceError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(PersistenceError::Locked)?;
        let row = sqlx::query("SELECT payload FROM remote_config WHERE id = 1")
            .fetch_one(&session.pool)
            .await
            .map_err(sqlx_err("read remote_config"))?;
        let payload: Option<Vec<u8>> = row.get("payload");
        payload.map(|payload| RemoteConfig { payload }).ok_or_else(|| PersistenceError::NotFound("remote config".into()))
    }

    async fn save_config(&self, config: RemoteConfig) -> Result<RevisionSnapshot, PersistenceError> {
        self.write_transaction(|payload| payload.remote = Some(config.clone())).await
    }

    async fn list_apps(&self) -> Result<Vec<AppRecord>, PersistenceError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(PersistenceError::Locked)?;
        let rows = sqlx::query("SELECT name, data FROM apps ORDER BY name ASC")
            .fetch_all(&session.pool)
            .await
            .map_err(sqlx_err("list apps"))?;
        rows.into_iter()
            .map(|row| {
                let name: String = row.get("name");
                let data: String = row.get("data");
                let extra = serde_json::from_str(&data).map_err(|e| PersistenceError::Io {
                    context: "parse app record extra fields".into(),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
                })?;
                Ok(AppRecord { name, extra })
            })
            .collect()
    }

    async fn upsert_app(&self, app: AppRecord) -> Result<RevisionSnapshot, PersistenceError> {
        if app.name.trim().is_empty() {
            return Err(PersistenceError::InvalidCommand("app name must be non-empty".into()));
        }
        self.write_transaction(|payload| {
            payload.apps.retain(|a| a.name != app.name);
            payload.apps.push(app.clone());
            payload.apps.sort_by(|a, b| a.name.cmp(&b.name));
        })
        .await
    }
}

async fn connect(db_path: &std::path::Path, read_only: bool) -> Result<SqlitePool, PersistenceError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PersistenceError::io(format!("create dir {}", parent.display()), e))?;
    }
    let mut options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
        .map_err(|e| PersistenceError::Io {
            context: "parse sqlite connection string".into(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
        })?
        .create_if_missing(!read_only);
    options = options.read_only(read_only);

    let pool = SqlitePoolOptions::new()
        .max_connections(if read_only { 4 } else { 1 })
        .connect_with(options)
        .await
        .map_err(sqlx_err("open sqlite pool"))?;

    if read_only {
        let _ = sqlx::query("PRAGMA query_only = ON").execute(&pool).await;
    } else {
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await.map_err(sqlx_err("set WAL mode"))?;
        sqlx::query("PRAGMA synchronous = FULL").execute(&pool).await.map_err(sqlx_err("set synchronous=FULL"))?;
    }
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<(), PersistenceError> {
    let version: i64 = sqlx::query("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(sqlx_err("read user_version"))?
        .get(0);
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS meta (id INTEGER PRIMARY KEY CHECK (id = 1), revision INTEGER NOT NULL, checksum TEXT NOT NULL, updated_at TEXT NOT NULL)",
    )
    .execute(pool)
    .await
    .map_err(sqlx_err("create meta table"))?;
    sqlx::query("INSERT OR IGNORE INTO meta (id, revision, checksum, updated_at) VALUES (1, 0, '', ?)")
        .bind(&now)
        .execute(pool)
        .await
        .map_err(sqlx_err("seed meta row"))?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS auth_state (id INTEGER PRIMARY KEY CHECK (id = 1), initialized INTEGER NOT NULL, password_hash TEXT, updated_at TEXT NOT NULL)",
    )
    .execute(pool)
    .await
    .map_err(sqlx_err("create auth_state table"))?;
    sqlx::query("INSERT OR IGNORE INTO auth_state (id, initialized, password_hash, updated_at) VALUES (1, 0, NULL, ?)")
        .bind(&now)
        .execute(pool)
        .await
        .map_err(sqlx_err("seed auth_state row"))?;

    sqlx::query("CREATE TABLE IF NOT EXISTS remote_config (id INTEGER PRIMARY KEY CHECK (id = 1), payload BLOB, updated_at TEXT NOT NULL)")
        .execute(pool)
        .await
        .map_err(sqlx_err("create remote_config table"))?;
    sqlx::query("INSERT OR IGNORE INTO remote_config (id, payload, updated_at) VALUES (1, NULL, ?)")
        .bind(&now)
        .execute(pool)
        .await
        .map_err(sqlx_err("seed remote_config row"))?;

    sqlx::query("CREATE TABLE IF NOT EXISTS apps (name TEXT PRIMARY KEY, data TEXT NOT NULL)")
        .execute(pool)
        .await
        .map_err(sqlx_err("create apps table"))?;

    sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .execute(pool)
        .await
        .map_err(sqlx_err("set user_version"))?;
    Ok(())
}

async fn read_payload(tx: &mut Transaction<'_, Sqlite>) -> Result<ControlPayload, PersistenceError> {
    let meta = sqlx::query("SELECT revision, checksum FROM meta WHERE id = 1")
        .fetch_one(&mut **tx)
        .await
        .map_err(sqlx_err("read meta"))?;
    let auth = sqlx::query("SELECT initialized, password_hash FROM auth_state WHERE id = 1")
        .fetch_one(&mut **tx)
        .await
        .map_err(sqlx_err("read auth_state"))?;
    let remote_row = sqlx::query("SELECT payload FROM remote_config WHERE id = 1")
        .fetch_one(&mut **tx)
        .await
        .map_err(sqlx_err("read remote_config"))?;
    let app_rows = sqlx::query("SELECT name, data FROM apps ORDER BY name ASC")
        .fetch_all(&mut **tx)
        .await
        .map_err(sqlx_err("list apps"))?;

    let remote_payload: Option<Vec<u8>> = remote_row.get("payload");
    let apps = app_rows
        .into_iter()
        .map(|row| {
            let name: String = row.get("name");
            let data: String = row.get("data");
            let extra = serde_json::from_str(&data).unwrap_or_default();
            AppRecord { name, extra }
        })
        .collect();

    Ok(ControlPayload {
        version: ControlPayload::CURRENT_VERSION,
        auth_initialized: auth.get::<i64, _>("initialized") != 0,
        remote: remote_payload.map(|payload| RemoteConfig { payload }),
        apps,
        password_hash: auth.get("password_hash"),
        revision: meta.get::<i64, _>("revision") as u64,
        checksum: meta.get("checksum"),
    })
}

async fn write_payload(tx: &mut Transaction<'_, Sqlite>, payload: &ControlPayload) -> Result<(), PersistenceError> {
    let now = Utc::now().to_rfc3339();
    sqlx::query("UPDATE auth_state SET initialized = ?, password_hash = ?, updated_at = ? WHERE id = 1")
        .bind(payload.auth_initialized as i64)
        .bind(&payload.password_hash)
        .bind(&now)
        .execute(&mut **tx)
        .await
        .map_err(sqlx_err("update auth_state"))?;

    sqlx::query("UPDATE remote_config SET payload = ?, updated_at = ? WHERE id = 1")
        .bind(payload.remote.as_ref().map(|r| r.payload.clone()))
        .bind(&now)
        .execute(&mut **tx)
        .await
        .map_err(sqlx_err("update remote_config"))?;

    sqlx::query("DELETE FROM apps").execute(&mut **tx).await.map_err(sqlx_err("clear apps"))?;
    for app in &payload.apps {
        let data = serde_json::to_string(&app.extra).map_err(|e| PersistenceError::Io {
            context: "serialize app extra fields".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;
        sqlx::query("INSERT INTO apps (name, data) VALUES (?, ?)")
            .bind(&app.name)
            .bind(data)
            .execute(&mut **tx)
            .await
            .map_err(sqlx_err("insert app"))?;
    }
    Ok(())
}

async fn update_meta(tx: &mut Transaction<'_, Sqlite>, revision: u64, checksum: &str) -> Result<(), PersistenceError> {
    let now = Utc::now().to_rfc3339();
    sqlx::query("UPDATE meta SET revision = ?, checksum = ?, updated_at = ? WHERE id = 1")
        .bind(revision as i64)
        .bind(checksum)
        .bind(&now)
        .execute(&mut **tx)
        .await
        .map_err(sqlx_err("update meta"))?;
    Ok(())
}

fn sqlx_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> PersistenceError {
    move |e| PersistenceError::Io {
        context: context.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyprovider::StaticKeyProvider;

    fn prereqs(cipher_dir: &std::path::Path, mount_dir: &std::path::Path) {
        std::fs::create_dir_all(cipher_dir).unwrap();
        std::fs::write(cipher_dir.join(CRYPTFS_CONFIG_FILE), b"conf").unwrap();
        std::fs::write(cipher_dir.join(VOLUME_METADATA_FILE), b"{}").unwrap();
        std::fs::create_dir_all(mount_dir).unwrap();
    }

    fn store(dir: &std::path::Path) -> RelationalControlStore {
        std::env::set_var(SKIP_MOUNT_CHECK_ENV, "1");
        let cipher_dir = dir.join("ciphertext/control");
        let mount_dir = dir.join("mounts/control");
        prereqs(&cipher_dir, &mount_dir);
        RelationalControlStore::new(
            mount_dir.join("control.db"),
            mount_dir,
            cipher_dir,
            Arc::new(StaticKeyProvider::new([6u8; 32])),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn fresh_store_migrates_and_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.unlock().await.unwrap();
        let snap = s.revision().await.unwrap();
        assert_eq!(snap.revision, 0);
    }

    #[tokio::test]
    async fn writes_advance_revision() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.unlock().await.unwrap();
        let r1 = s.set_initialized().await.unwrap();
        assert_eq!(r1.revision, 1);
        let r2 = s.upsert_app(AppRecord { name: "app-alpha".into(), extra: Default::default() }).await.unwrap();
        assert_eq!(r2.revision, 2);
        assert_eq!(s.list_apps().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn read_only_mount_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(SKIP_MOUNT_CHECK_ENV, "1");
        let cipher_dir = dir.path().join("ciphertext/control");
        let mount_dir = dir.path().join("mounts/control");
        prereqs(&cipher_dir, &mount_dir);

        // Seed the db as a writer first so migration has already happened.
        let writer = RelationalControlStore::new(
            mount_dir.join("control.db"),
            mount_dir.clone(),
            cipher_dir.clone(),
            Arc::new(StaticKeyProvider::new([6u8; 32])),
            Duration::from_secs(60),
        );
        writer.unlock().await.unwrap();
        writer.lock().await.unwrap();

        std::fs::write(mount_dir.join(MODE_SENTINEL), "ro").unwrap();
        let reader = RelationalControlStore::new(
            mount_dir.join("control.db"),
            mount_dir,
            cipher_dir,
            Arc::new(StaticKeyProvider::new([6u8; 32])),
            Duration::from_secs(60),
        );
        reader.unlock().await.unwrap();
        assert!(matches!(reader.set_initialized().await, Err(PersistenceError::Locked)));
    }
}
