//! Local-disk [`FileIO`] on top of `tokio::fs`.

use std::{io::ErrorKind, path::PathBuf};

use async_trait::async_trait;

use super::{FileIO, IoError, Path};

/// [`FileIO`] rooted at a local directory. Paths are resolved relative to the
/// root, so the same table layout works against any store.
pub struct TokioFileIO {
    root: PathBuf,
}

impl TokioFileIO {
    /// Bind to a local root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        TokioFileIO { root: root.into() }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path.as_str())
    }
}

#[async_trait]
impl FileIO for TokioFileIO {
    async fn open_input(&self, path: &Path) -> Result<Vec<u8>, IoError> {
        match tokio::fs::read(self.resolve(path)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(IoError::NotFound {
                path: path.as_str().to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_output(
        &self,
        path: &Path,
        payload: &[u8],
        overwrite: bool,
    ) -> Result<(), IoError> {
        use tokio::io::AsyncWriteExt;

        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let mut file = match options.open(&target).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(IoError::AlreadyExists {
                    path: path.as_str().to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(payload).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list(&self, dir: &Path) -> Result<Vec<Path>, IoError> {
        let target = self.resolve(dir);
        let mut entries = match tokio::fs::read_dir(&target).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                out.push(dir.child(entry.file_name().to_string_lossy()));
            }
        }
        out.sort();
        Ok(out)
    }

    async fn delete(&self, path: &Path) -> Result<(), IoError> {
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &Path) -> Result<bool, IoError> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await?)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn round_trip_and_create_new() {
        let dir = TempDir::new().unwrap();
        let io = TokioFileIO::new(dir.path());
        let p = Path::new("snapshot/snapshot-1");

        io.open_output(&p, b"hello", false).await.unwrap();
        assert_eq!(io.open_input(&p).await.unwrap(), b"hello");
        assert!(io
            .open_output(&p, b"world", false)
            .await
            .unwrap_err()
            .is_already_exists());

        io.delete(&p).await.unwrap();
        assert!(!io.exists(&p).await.unwrap());
    }

    #[tokio::test]
    async fn missing_dir_lists_empty() {
        let dir = TempDir::new().unwrap();
        let io = TokioFileIO::new(dir.path());
        assert!(io.list(&Path::new("none")).await.unwrap().is_empty());
    }
}
