use crate::core::{DbError, Result};
use crate::storage::persistence::decode_snapshot;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionSummary {
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
    /// `None` when the document does not parse
    pub records: Option<usize>,
}

/// Lists the collection documents in `data_dir`, sorted by name.
pub async fn inspect_data_dir(data_dir: &Path, extension: &str) -> Result<Vec<CollectionSummary>> {
    let mut entries = fs::read_dir(data_dir).await.map_err(|err| {
        DbError::IoError(format!(
            "Failed to read data directory '{}': {}",
            data_dir.display(),
            err
        ))
    })?;

    let mut summaries = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(extension) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let bytes = fs::read(&path).await?;
        summaries.push(CollectionSummary {
            name,
            bytes: bytes.len() as u64,
            records: decode_snapshot(&bytes).ok().map(|snapshot| snapshot.len()),
            path,
        });
    }
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lists_documents() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("users.json"), r#"[{"id":"1"},{"id":"2"}]"#).unwrap();
        std::fs::write(dir.path().join("broken.json"), "[{").unwrap();
        std::fs::write(dir.path().join("users.json.bak"), "[]").unwrap();

        let summaries = inspect_data_dir(dir.path(), "json").await.unwrap();
        let names: Vec<&str> = summaries.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["broken", "users"]);
        assert_eq!(summaries[0].records, None);
        assert_eq!(summaries[1].records, Some(2));
    }
}
