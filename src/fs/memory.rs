//! Heap-backed [`FileIO`] used by unit tests and scratch tables.

use std::collections::BTreeMap;

use async_lock::Mutex;
use async_trait::async_trait;

use super::{FileIO, IoError, Path};

/// In-memory object store. Create-new writes are atomic under the internal
/// lock, which is what the commit protocol needs from a real store.
#[derive(Default)]
pub struct InMemoryFileIO {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryFileIO {
    /// Fresh, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects, for assertions.
    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }
}

#[async_trait]
impl FileIO for InMemoryFileIO {
    async fn open_input(&self, path: &Path) -> Result<Vec<u8>, IoError> {
        self.objects
            .lock()
            .await
            .get(path.as_str())
            .cloned()
            .ok_or_else(|| IoError::NotFound {
                path: path.as_str().to_string(),
            })
    }

    async fn open_output(
        &self,
        path: &Path,
        payload: &[u8],
        overwrite: bool,
    ) -> Result<(), IoError> {
        let mut objects = self.objects.lock().await;
        if !overwrite && objects.contains_key(path.as_str()) {
            return Err(IoError::AlreadyExists {
                path: path.as_str().to_string(),
            });
        }
        objects.insert(path.as_str().to_string(), payload.to_vec());
        Ok(())
    }

    async fn list(&self, dir: &Path) -> Result<Vec<Path>, IoError> {
        let prefix = format!("{}/", dir.as_str());
        let objects = self.objects.lock().await;
        Ok(objects
            .keys()
            .filter(|key| {
                key.starts_with(&prefix) && !key[prefix.len()..].contains('/')
            })
            .map(|key| Path::new(key.clone()))
            .collect())
    }

    async fn delete(&self, path: &Path) -> Result<(), IoError> {
        self.objects.lock().await.remove(path.as_str());
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool, IoError> {
        Ok(self.objects.lock().await.contains_key(path.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_new_refuses_existing() {
        let io = InMemoryFileIO::new();
        let p = Path::new("t/snapshot/snapshot-1");
        io.open_output(&p, b"a", false).await.unwrap();
        let err = io.open_output(&p, b"b", false).await.unwrap_err();
        assert!(err.is_already_exists());
        // Loser must not clobber the winner.
        assert_eq!(io.open_input(&p).await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn list_is_shallow() {
        let io = InMemoryFileIO::new();
        io.open_output(&Path::new("t/a"), b"", true).await.unwrap();
        io.open_output(&Path::new("t/sub/b"), b"", true).await.unwrap();
        let listed = io.list(&Path::new("t")).await.unwrap();
        assert_eq!(listed, vec![Path::new("t/a")]);
    }

    #[tokio::test]
    async fn delete_missing_is_noop() {
        let io = InMemoryFileIO::new();
        io.delete(&Path::new("nope")).await.unwrap();
        assert!(!io.exists(&Path::new("nope")).await.unwrap());
    }
}
