//! Local filesystem backend.
//!
//! Each key is one JSON file. Key segments become directories, so
//! `app/dev/bucket` is stored at `<root>/app/dev/bucket.json` and the
//! nested `app/dev/bucket/object` at `<root>/app/dev/bucket/object.json`.
//! Bytes outside `[A-Za-z0-9_-]` are percent-encoded, which keeps the
//! `.json` suffix and temp files unambiguous.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use stratum_core::{Result, StratumError};
use tracing::debug;
use uuid::Uuid;

use crate::store::{StateEntry, StateStore};

const RECORD_SUFFIX: &str = ".json";

/// Filesystem implementation of StateStore.
#[derive(Debug, Clone)]
pub struct FileSystemStateStore {
    root: PathBuf,
}

impl FileSystemStateStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            StratumError::state(format!(
                "Failed to create state directory {}: {e}",
                root.display()
            ))
        })?;
        debug!(root = %root.display(), "Opened filesystem state store");
        Ok(Self { root })
    }

    /// Directory holding the state files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn segments(key: &str) -> Result<Vec<&str>> {
        let segments: Vec<&str> = key.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(StratumError::state(format!("Invalid state key '{key}'")));
        }
        Ok(segments)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let segments = Self::segments(key)?;
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| StratumError::state("Empty state key"))?;

        let mut path = self.root.clone();
        for segment in parents {
            path.push(encode_segment(segment));
        }
        path.push(format!("{}{RECORD_SUFFIX}", encode_segment(last)));
        Ok(path)
    }

    /// Directory to start walking from for a prefix: the deepest directory
    /// made of complete segments.
    fn walk_root(&self, prefix: &str) -> (PathBuf, String) {
        let mut dir = self.root.clone();
        let mut key_prefix = String::new();
        if let Some((complete, _)) = prefix.rsplit_once('/') {
            for segment in complete.split('/').filter(|s| !s.is_empty()) {
                dir.push(encode_segment(segment));
                key_prefix.push_str(segment);
                key_prefix.push('/');
            }
        }
        (dir, key_prefix)
    }
}

#[async_trait]
impl StateStore for FileSystemStateStore {
    async fn get(&self, key: &str) -> Result<Option<StateEntry>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let entry: StateEntry = serde_json::from_slice(&bytes).map_err(|e| {
                    StratumError::state(format!("Corrupted state file {}: {e}", path.display()))
                })?;
                Ok(Some(entry))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StratumError::state(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<StateEntry> {
        let path = self.path_for(key)?;
        let version = self.get(key).await?.map(|e| e.version).unwrap_or(0) + 1;

        let entry = StateEntry {
            key: key.to_string(),
            value,
            version,
            updated_at: Utc::now(),
        };

        let parent = path
            .parent()
            .ok_or_else(|| StratumError::state(format!("No parent for {}", path.display())))?;
        tokio::fs::create_dir_all(parent).await?;

        // Write then rename so readers never observe a partial file.
        let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(&entry)?;
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StratumError::state(format!(
                "Failed to commit {}: {e}",
                path.display()
            )));
        }

        Ok(entry)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StratumError::state(format!(
                    "Failed to delete {}: {e}",
                    path.display()
                )))
            }
        }

        // Prune directories left empty; remove_dir refuses non-empty ones.
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(current) = dir {
            if current == self.root || tokio::fs::remove_dir(&current).await.is_err() {
                break;
            }
            dir = current.parent().map(Path::to_path_buf);
        }

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let (start, start_key) = self.walk_root(prefix);
        let mut keys = Vec::new();
        let mut pending = vec![(start, start_key)];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if let Some(segment) = decode_segment(&name) {
                        pending.push((entry.path(), format!("{key_prefix}{segment}/")));
                    }
                } else if let Some(stem) = name.strip_suffix(RECORD_SUFFIX) {
                    if let Some(segment) = decode_segment(stem) {
                        let key = format!("{key_prefix}{segment}");
                        if key.starts_with(prefix) {
                            keys.push(key);
                        }
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Everything except `[A-Za-z0-9_-]` is escaped.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'-');

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

/// Decode a file or directory name, rejecting names this store would not
/// have produced.
fn decode_segment(encoded: &str) -> Option<String> {
    let decoded = percent_decode_str(encoded).decode_utf8().ok()?;
    (encode_segment(&decoded) == encoded).then(|| decoded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_segment_encoding() {
        assert_eq!(encode_segment("bucket-1"), "bucket-1");
        assert_eq!(encode_segment("$scope"), "%24scope");
        assert_eq!(encode_segment("a.json"), "a%2Ejson");
        assert_eq!(decode_segment("%24scope").as_deref(), Some("$scope"));
        assert_eq!(decode_segment("caf%C3%A9").as_deref(), Some("café"));
        assert_eq!(decode_segment("%2"), None);
        assert_eq!(decode_segment("%ff"), None);
        assert_eq!(decode_segment("a.tmp"), None);
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileSystemStateStore::open(dir.path()).await.unwrap();

        let e1 = store
            .set("app/dev/bucket", serde_json::json!({"name": "logs"}))
            .await
            .unwrap();
        let e2 = store
            .set("app/dev/bucket", serde_json::json!({"name": "logs-2"}))
            .await
            .unwrap();
        assert!(e2.version > e1.version);
        assert!(dir.path().join("app/dev/bucket.json").exists());

        let entry = store.get("app/dev/bucket").await.unwrap().unwrap();
        assert_eq!(entry.value["name"], "logs-2");

        store.delete("app/dev/bucket").await.unwrap();
        store.delete("app/dev/bucket").await.unwrap();
        assert!(store.get("app/dev/bucket").await.unwrap().is_none());
        assert!(!dir.path().join("app").exists());
    }

    #[tokio::test]
    async fn test_list_nested_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileSystemStateStore::open(dir.path()).await.unwrap();

        for key in [
            "app/dev/a",
            "app/dev/site",
            "app/dev/site/record",
            "app/dev/$scope/pendingDeletions",
            "app/devx/c",
        ] {
            store.set(key, serde_json::json!(1)).await.unwrap();
        }

        let keys = store.list("app/dev/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "app/dev/$scope/pendingDeletions",
                "app/dev/a",
                "app/dev/site",
                "app/dev/site/record",
            ]
        );
        assert_eq!(store.count("app/dev").await.unwrap(), 5);
        assert!(store.list("missing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_empty_segments() {
        let dir = TempDir::new().unwrap();
        let store = FileSystemStateStore::open(dir.path()).await.unwrap();
        assert!(store.set("app//x", serde_json::json!(1)).await.is_err());
    }
}
