use crate::core::{DbError, Result};
use crate::storage::persistence::{BACKUP_SUFFIX, TEMP_SUFFIX, decode_snapshot};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{Level, event};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveredArtifact {
    pub collection: String,
    pub temp: PathBuf,
    pub target: PathBuf,
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedArtifact {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of one sweep over a data directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Temp files promoted over their collection document
    pub recovered: Vec<RecoveredArtifact>,
    /// Unparseable temp files that were deleted
    pub dropped: Vec<PathBuf>,
    /// Artifacts that could be neither promoted nor deleted
    pub failed: Vec<FailedArtifact>,
    /// Leftover rollback copies; reported, never touched
    pub stale_backups: Vec<PathBuf>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.recovered.is_empty()
            && self.dropped.is_empty()
            && self.failed.is_empty()
            && self.stale_backups.is_empty()
    }
}

struct TempArtifact {
    path: PathBuf,
    collection: String,
    modified: SystemTime,
}

/// Reconciles temp files left behind by interrupted flushes.
///
/// Every `<collection>.<nonce>.tmp` in `data_dir` that holds a valid
/// collection document is renamed over `<collection>.<extension>`; anything
/// else is deleted. When several temps exist for one collection they are
/// applied oldest first, so the newest wins. A bad artifact never stops the
/// sweep; only failing to list the directory is an error. A missing
/// directory yields an empty report.
pub async fn recover_interrupted_writes(data_dir: &Path, extension: &str) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    let mut entries = match fs::read_dir(data_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            event!(Level::DEBUG, data_dir = %data_dir.display(), "no data directory to sweep");
            return Ok(report);
        }
        Err(err) => {
            return Err(DbError::IoError(format!(
                "Failed to read data directory '{}': {}",
                data_dir.display(),
                err
            )));
        }
    };

    let mut temps = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|err| {
        DbError::IoError(format!(
            "Failed to iterate data directory '{}': {}",
            data_dir.display(),
            err
        ))
    })? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if has_suffix(name, BACKUP_SUFFIX) {
            event!(Level::WARN, path = %path.display(), "stale rollback backup found");
            report.stale_backups.push(path);
            continue;
        }

        let Some(collection) = temp_collection(name, extension) else {
            continue;
        };
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => SystemTime::UNIX_EPOCH,
        };
        temps.push(TempArtifact {
            path,
            collection,
            modified,
        });
    }

    temps.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    for temp in temps {
        recover_one(data_dir, extension, temp, &mut report).await;
    }
    report.stale_backups.sort();

    event!(
        Level::INFO,
        data_dir = %data_dir.display(),
        recovered = report.recovered.len(),
        dropped = report.dropped.len(),
        failed = report.failed.len(),
        stale_backups = report.stale_backups.len(),
        "recovery sweep finished"
    );
    Ok(report)
}

async fn recover_one(data_dir: &Path, extension: &str, temp: TempArtifact, report: &mut RecoveryReport) {
    let parsed = match fs::read(&temp.path).await {
        Ok(bytes) => decode_snapshot(&bytes).map_err(|err| err.to_string()),
        Err(err) => {
            event!(Level::ERROR, path = %temp.path.display(), error = %err, "failed to read temp file");
            report.failed.push(FailedArtifact {
                path: temp.path,
                error: err.to_string(),
            });
            return;
        }
    };

    match parsed {
        Ok(snapshot) => {
            let target = data_dir.join(format!("{}.{}", temp.collection, extension));
            match fs::rename(&temp.path, &target).await {
                Ok(()) => {
                    event!(
                        Level::WARN,
                        collection = %temp.collection,
                        records = snapshot.len(),
                        "recovered interrupted write"
                    );
                    report.recovered.push(RecoveredArtifact {
                        collection: temp.collection,
                        temp: temp.path,
                        target,
                        records: snapshot.len(),
                    });
                }
                Err(err) => {
                    event!(Level::ERROR, path = %temp.path.display(), error = %err, "failed to promote temp file");
                    report.failed.push(FailedArtifact {
                        path: temp.path,
                        error: err.to_string(),
                    });
                }
            }
        }
        Err(reason) => match fs::remove_file(&temp.path).await {
            Ok(()) => {
                event!(
                    Level::ERROR,
                    path = %temp.path.display(),
                    reason = %reason,
                    "dropping invalid temp file"
                );
                report.dropped.push(temp.path);
            }
            Err(err) => {
                event!(Level::ERROR, path = %temp.path.display(), error = %err, "failed to delete invalid temp file");
                report.failed.push(FailedArtifact {
                    path: temp.path,
                    error: err.to_string(),
                });
            }
        },
    }
}

fn has_suffix(name: &str, suffix: &str) -> bool {
    name.strip_suffix(suffix)
        .is_some_and(|rest| rest.len() > 1 && rest.ends_with('.'))
}

/// Collection name encoded in a temp file name, if `name` is one.
///
/// Accepts `<collection>.<nonce>.tmp` and `<collection>.<ext>.<nonce>.tmp`.
fn temp_collection(name: &str, extension: &str) -> Option<String> {
    let stem = name.strip_suffix(TEMP_SUFFIX)?.strip_suffix('.')?;
    let (collection, nonce) = stem.rsplit_once('.')?;
    if nonce.is_empty() {
        return None;
    }
    let ext_suffix = format!(".{}", extension);
    let collection = collection.strip_suffix(&ext_suffix).unwrap_or(collection);
    if collection.is_empty() {
        return None;
    }
    Some(collection.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_temp_names() {
        assert_eq!(temp_collection("orders.a1b2C3.tmp", "json").as_deref(), Some("orders"));
        assert_eq!(
            temp_collection("orders.json.5f0c-9e.tmp", "json").as_deref(),
            Some("orders")
        );
        assert_eq!(temp_collection("orders.tmp", "json"), None);
        assert_eq!(temp_collection(".x.tmp", "json"), None);
        assert_eq!(temp_collection("orders.json", "json"), None);
    }

    #[test]
    fn test_backup_names() {
        assert!(has_suffix("orders.json.bak", BACKUP_SUFFIX));
        assert!(!has_suffix("kebab", BACKUP_SUFFIX));
        assert!(!has_suffix(".bak", BACKUP_SUFFIX));
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty_report() {
        let dir = TempDir::new().unwrap();
        let report = recover_interrupted_writes(&dir.path().join("absent"), "json")
            .await
            .unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_stale_backup_reported_not_touched() {
        let dir = TempDir::new().unwrap();
        let bak = dir.path().join("users.json.bak");
        std::fs::write(&bak, "[]").unwrap();

        let report = recover_interrupted_writes(dir.path(), "json").await.unwrap();
        assert_eq!(report.stale_backups, vec![bak.clone()]);
        assert!(bak.exists());
    }

    #[tokio::test]
    async fn test_object_document_is_not_a_collection() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join("users.x9.tmp");
        std::fs::write(&tmp, r#"{"id": "1"}"#).unwrap();

        let report = recover_interrupted_writes(dir.path(), "json").await.unwrap();
        assert_eq!(report.dropped, vec![tmp.clone()]);
        assert!(!tmp.exists());
        assert!(!dir.path().join("users.json").exists());
    }
}
