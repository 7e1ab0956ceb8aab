use super::BlobStore;
use crate::error::PersistError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Blob store on the local filesystem. The root directory plays the bucket;
/// keys map to relative paths below it.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: &Path) -> Result<Self, PersistError> {
        std::fs::create_dir_all(root).map_err(|source| PersistError::Directory {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self { root: root.to_path_buf() })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PersistError> {
        let rel = Path::new(key);
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(PersistError::Blob {
                key: key.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "key escapes blob root"),
            });
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    /// Write to a sibling temp file, then rename over the target so a reader
    /// never sees a half-written object.
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), PersistError> {
        let path = self.path_for(key)?;
        let blob_err = |source| PersistError::Blob { key: key.to_string(), source };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(blob_err)?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &body).await.map_err(blob_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(blob_err)?;

        debug!(key, bytes = body.len(), "blob written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files_under(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                out.extend(files_under(&path));
            } else {
                out.push(path);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_put_twice_leaves_one_object_with_latest_content() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsBlobStore::open(tmp.path()).unwrap();

        store.put("2022-000001-01/capture.json", b"first".to_vec()).await.unwrap();
        store.put("2022-000001-01/capture.json", b"second".to_vec()).await.unwrap();

        let files = files_under(tmp.path());
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0]).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_key_cannot_escape_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsBlobStore::open(tmp.path()).unwrap();
        let result = store.put("../outside.json", b"x".to_vec()).await;
        assert!(matches!(result, Err(PersistError::Blob { .. })));
    }
}
