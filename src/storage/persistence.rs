//! On-disk format of a collection: one pretty-printed JSON array per file.
//!
//! Writes go to `<collection>.<nonce>.tmp` in the same directory and are then
//! renamed over the target, so a reader never observes a half-written
//! document. An interrupted write leaves the temp file behind for the
//! recovery sweep.

use crate::core::{DbError, Result, Snapshot};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const TEMP_SUFFIX: &str = "tmp";
pub const BACKUP_SUFFIX: &str = "bak";

/// Decodes a persisted collection document.
pub fn decode_snapshot(bytes: &[u8]) -> std::result::Result<Snapshot, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Reads a collection document. A missing file is an empty collection.
pub async fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(DbError::IoError(format!(
                "Failed to read '{}': {}",
                path.display(),
                err
            )));
        }
    };
    decode_snapshot(&bytes).map_err(|err| DbError::corrupt(path.display(), err))
}

/// Serializes and atomically replaces the document at `path`.
///
/// `stem` becomes the temp-file prefix so the sweeper can map an orphan
/// back to its collection.
pub async fn save_snapshot(path: &Path, stem: &str, snapshot: &Snapshot) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(snapshot)
        .map_err(|err| DbError::WriteFailure(format!("Failed to serialize '{}': {}", stem, err)))?;
    let path = path.to_path_buf();
    let prefix = format!("{}.", stem);

    tokio::task::spawn_blocking(move || write_atomic(&path, &prefix, &bytes))
        .await
        .map_err(|err| DbError::WriteFailure(format!("flush task join: {}", err)))?
}

fn write_atomic(path: &Path, prefix: &str, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|err| {
        DbError::WriteFailure(format!(
            "Failed to create parent directory '{}': {}",
            parent.display(),
            err
        ))
    })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(&format!(".{}", TEMP_SUFFIX))
        .tempfile_in(parent)
        .map_err(|err| {
            DbError::WriteFailure(format!(
                "Failed to create temp file in '{}': {}",
                parent.display(),
                err
            ))
        })?;

    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|err| {
            DbError::WriteFailure(format!(
                "Failed to write temp file '{}': {}",
                tmp.path().display(),
                err
            ))
        })?;

    tmp.persist(path).map_err(|err| {
        DbError::WriteFailure(format!(
            "Failed to rename temp file -> '{}': {}",
            path.display(),
            err.error
        ))
    })?;
    Ok(())
}

/// Path of the rollback copy for `path` (`<file>.bak`).
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Copy-to-backup rollback primitive.
///
/// `create` copies the file aside before a mutation; `restore` copies it back
/// and removes the backup; `discard` only removes the backup. When the source
/// does not exist yet the backup holds an empty collection.
#[derive(Debug, Clone)]
pub struct FileBackup {
    target: PathBuf,
    backup: PathBuf,
}

impl FileBackup {
    pub async fn create(target: impl Into<PathBuf>) -> Result<Self> {
        let target = target.into();
        let backup = backup_path(&target);

        match fs::copy(&target, &backup).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = backup.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&backup, b"[]").await.map_err(|err| {
                    DbError::IoError(format!(
                        "Failed to write backup '{}': {}",
                        backup.display(),
                        err
                    ))
                })?;
            }
            Err(err) => {
                return Err(DbError::IoError(format!(
                    "Failed to back up '{}': {}",
                    target.display(),
                    err
                )));
            }
        }

        Ok(Self { target, backup })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn path(&self) -> &Path {
        &self.backup
    }

    /// Reads the backed-up content without touching either file.
    pub async fn read(&self) -> Result<Snapshot> {
        let bytes = fs::read(&self.backup).await.map_err(|err| {
            DbError::IoError(format!(
                "Failed to read backup '{}': {}",
                self.backup.display(),
                err
            ))
        })?;
        decode_snapshot(&bytes).map_err(|err| DbError::corrupt(self.backup.display(), err))
    }

    pub async fn restore(self) -> Result<()> {
        fs::copy(&self.backup, &self.target).await.map_err(|err| {
            DbError::IoError(format!(
                "Failed to restore '{}' from backup: {}",
                self.target.display(),
                err
            ))
        })?;
        fs::remove_file(&self.backup).await?;
        Ok(())
    }

    pub async fn discard(self) -> Result<()> {
        match fs::remove_file(&self.backup).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record_from_value;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> Snapshot {
        vec![record_from_value(json!({"id": "a", "n": 1})).unwrap()]
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let loaded = load_snapshot(&dir.path().join("nothing.json")).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items.json");
        save_snapshot(&path, "items", &sample()).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n  {"), "document should be pretty-printed");
        assert_eq!(load_snapshot(&path).await.unwrap(), sample());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_snapshot(&path).await.unwrap_err();
        assert!(matches!(err, DbError::CorruptArtifact { .. }));
    }

    #[tokio::test]
    async fn test_backup_restore() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.json");
        save_snapshot(&path, "users", &sample()).await.unwrap();

        let backup = FileBackup::create(&path).await.unwrap();
        assert_eq!(backup.path(), dir.path().join("users.json.bak"));
        save_snapshot(&path, "users", &Vec::new()).await.unwrap();

        backup.restore().await.unwrap();
        assert_eq!(load_snapshot(&path).await.unwrap(), sample());
        assert!(!dir.path().join("users.json.bak").exists());
    }

    #[tokio::test]
    async fn test_backup_of_missing_file_is_empty_array() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fresh.json");
        let backup = FileBackup::create(&path).await.unwrap();
        assert!(backup.read().await.unwrap().is_empty());
        backup.discard().await.unwrap();
        assert!(!dir.path().join("fresh.json.bak").exists());
    }
}
