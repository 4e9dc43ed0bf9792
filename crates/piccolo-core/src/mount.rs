//! Mount-table inspection and sentinel-file helpers used by the Volume
//! Manager to detect whether a FUSE mount has actually appeared, and by
//! `Detach` to tell a vanished mount from a live one.

use piccolo_types::PersistenceError;
use std::path::{Path, PathBuf};

pub const MODE_SENTINEL: &str = ".mode";
pub const CIPHER_SENTINEL: &str = ".cipher";

/// Decode the escape sequences the kernel uses in `/proc/mounts` for
/// characters that would otherwise break the space-delimited format.
pub fn decode_mount_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &raw[i + 1..i + 4];
            if let Ok(value) = u8::from_str_radix(octal, 8) {
                let decoded = match value {
                    0o040 => Some(' '),
                    0o011 => Some('\t'),
                    0o012 => Some('\n'),
                    0o134 => Some('\\'),
                    _ => None,
                };
                if let Some(c) = decoded {
                    out.push(c);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Parsed mount-table target paths (field 2 of `/proc/mounts`), decoded and
/// canonicalized where possible.
pub fn mounted_targets(mounts_table: &str) -> Vec<PathBuf> {
    mounts_table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|raw| PathBuf::from(decode_mount_escapes(raw)))
        .collect()
}

/// Read the live kernel mount table. Overridable via `PICCOLO_MOUNTS_TABLE`
/// for tests running in sandboxes without `/proc`.
pub fn read_mount_table() -> Result<String, PersistenceError> {
    let path = std::env::var("PICCOLO_MOUNTS_TABLE").unwrap_or_else(|_| "/proc/mounts".to_string());
    std::fs::read_to_string(&path).map_err(|e| PersistenceError::io(format!("read mount table {path}"), e))
}

/// True if `target` (after best-effort canonicalization) appears in the
/// current mount table.
pub fn is_mounted(target: &Path) -> Result<bool, PersistenceError> {
    let table = read_mount_table()?;
    let canonical_target = target.canonicalize().unwrap_or_else(|_| target.to_path_buf());
    Ok(mounted_targets(&table)
        .into_iter()
        .any(|mounted| mounted.canonicalize().unwrap_or(mounted) == canonical_target))
}

/// Write the `.mode` and `.cipher` sentinel files into an attached mount.
pub fn write_sentinels(mount_dir: &Path, cipher_dir: &Path, read_only: bool) -> Result<(), PersistenceError> {
    let mode = if read_only { "ro" } else { "rw" };
    std::fs::write(mount_dir.join(MODE_SENTINEL), mode)
        .map_err(|e| PersistenceError::io("write .mode sentinel", e))?;
    std::fs::write(
        mount_dir.join(CIPHER_SENTINEL),
        cipher_dir
            .canonicalize()
            .unwrap_or_else(|_| cipher_dir.to_path_buf())
            .to_string_lossy()
            .as_bytes(),
    )
    .map_err(|e| PersistenceError::io("write .cipher sentinel", e))?;
    Ok(())
}

/// Remove sentinel files; tolerant of them already being gone (the mount
/// may have disappeared out from under us).
pub fn remove_sentinels(mount_dir: &Path) {
    let _ = std::fs::remove_file(mount_dir.join(MODE_SENTINEL));
    let _ = std::fs::remove_file(mount_dir.join(CIPHER_SENTINEL));
}

pub fn sentinels_present(mount_dir: &Path) -> bool {
    mount_dir.join(MODE_SENTINEL).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_space_and_tab_and_backslash() {
        assert_eq!(decode_mount_escapes(r"/mnt/a\040b"), "/mnt/a b");
        assert_eq!(decode_mount_escapes(r"/mnt/a\011b"), "/mnt/a\tb");
        assert_eq!(decode_mount_escapes(r"/mnt/a\134b"), "/mnt/a\\b");
    }

    #[test]
    fn parses_targets_from_table() {
        let table = "cipherfs /state/mounts/control fuse.gocryptfs rw,nosuid 0 0\n\
                      tmpfs /tmp tmpfs rw 0 0\n";
        let targets = mounted_targets(table);
        assert_eq!(targets, vec![PathBuf::from("/state/mounts/control"), PathBuf::from("/tmp")]);
    }

    #[test]
    fn mount_table_with_escaped_space_roundtrips() {
        let table = r"cipherfs /state/mounts/my\040vol fuse.gocryptfs rw 0 0" .to_string() + "\n";
        let targets = mounted_targets(&table);
        assert_eq!(targets, vec![PathBuf::from("/state/mounts/my vol")]);
    }

    #[test]
    fn sentinel_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        write_sentinels(dir.path(), Path::new("/state/ciphertext/control"), false).unwrap();
        assert!(sentinels_present(dir.path()));
        let mode = std::fs::read_to_string(dir.path().join(MODE_SENTINEL)).unwrap();
        assert_eq!(mode, "rw");
        remove_sentinels(dir.path());
        assert!(!sentinels_present(dir.path()));
    }
}
