//! Directory backed storage: `<root>/<user>/<resource_id>/<file>`.

use super::{ResourceStorage, StorageError, StorageResult};
use crate::workspace::check_name;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    root: PathBuf,
    base_url: String,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn checked(name: &str) -> StorageResult<&str> {
    check_name(name)
        .map(|()| name)
        .map_err(|_| StorageError::InvalidName(name.to_string()))
}

impl FileSystemStorage {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn url(&self, user_id: &str, resource_id: &str, name: &str) -> String {
        format!("{}/{user_id}/{resource_id}/{name}", self.base_url)
    }
}

#[async_trait]
impl ResourceStorage for FileSystemStorage {
    async fn store(&self, user_id: &str, resource_id: &str, file: &Path) -> StorageResult<String> {
        let user_id = checked(user_id)?;
        let resource_id = checked(resource_id)?;
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidName(file.display().to_string()))?;

        if !tokio::fs::try_exists(file).await.unwrap_or(false) {
            return Err(StorageError::MissingFile(file.to_path_buf()));
        }

        let dir = self.root.join(user_id).join(resource_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(io_error(&dir))?;
        let target = dir.join(name);
        tokio::fs::copy(file, &target)
            .await
            .map_err(io_error(&target))?;

        tracing::debug!(resource_id, file = %target.display(), "Stored export");
        Ok(self.url(user_id, resource_id, name))
    }

    async fn remove(&self, resource_id: &str) -> StorageResult<()> {
        let resource_id = checked(resource_id)?;
        let mut users = match tokio::fs::read_dir(&self.root).await {
            Ok(users) => users,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error(&self.root)(e)),
        };

        while let Some(user) = users.next_entry().await.map_err(io_error(&self.root))? {
            let dir = user.path().join(resource_id);
            if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .map_err(io_error(&dir))?;
                tracing::debug!(resource_id, "Removed stored exports");
            }
        }
        Ok(())
    }

    async fn size(&self, user_id: &str) -> StorageResult<u64> {
        let dir = self.root.join(checked(user_id)?);
        tokio::task::spawn_blocking(move || {
            WalkDir::new(&dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| entry.metadata().ok())
                .map(|metadata| metadata.len())
                .sum()
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_store_size_and_remove() {
        let dir = tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path().join("store"), "http://files/");
        let source = dir.path().join("slope.tif");
        std::fs::write(&source, b"0123456789").unwrap();

        let url = storage.store("alice", "resource_id-1", &source).await.unwrap();
        assert_eq!(url, "http://files/alice/resource_id-1/slope.tif");
        assert_eq!(storage.size("alice").await.unwrap(), 10);
        assert_eq!(storage.size("bob").await.unwrap(), 0);

        storage.remove("resource_id-1").await.unwrap();
        assert_eq!(storage.size("alice").await.unwrap(), 0);
        storage.remove("resource_id-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_and_bad_names() {
        let dir = tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path(), "file://x");

        assert!(matches!(
            storage
                .store("alice", "r1", &dir.path().join("absent.tif"))
                .await,
            Err(StorageError::MissingFile(_))
        ));
        assert!(matches!(
            storage.size("../etc").await,
            Err(StorageError::InvalidName(_))
        ));
    }
}
