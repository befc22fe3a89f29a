//! Local blob store of a storage node.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::utils::DfsError;

use async_trait::async_trait;

use bytes::Bytes;

use tokio::fs;
use tokio::sync::Mutex;

/// Whole-blob key-value store private to one storage node. A blob is visible
/// to `get()` and `list()` only after its `put()` has fully completed.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persists `data` as `name`, replacing any previous blob.
    async fn put(&self, name: &str, data: Bytes) -> Result<(), DfsError>;

    /// Returns the blob's bytes, or `None` if it is not held.
    async fn get(&self, name: &str) -> Result<Option<Bytes>, DfsError>;

    /// Deletes the blob. Returns whether it was held.
    async fn delete(&self, name: &str) -> Result<bool, DfsError>;

    /// Names of all held blobs, in order.
    async fn list(&self) -> Result<Vec<String>, DfsError>;
}

/// Refuses names that could escape the store's folder.
fn check_name(name: &str) -> Result<(), DfsError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(DfsError::msg(format!("invalid blob name {:?}", name)));
    }
    Ok(())
}

/// Blob store backed by one file per blob in a folder.
#[derive(Debug)]
pub struct FolderStore {
    folder: PathBuf,

    /// Names of committed blobs.
    names: Mutex<BTreeSet<String>>,
}

impl FolderStore {
    /// Opens `folder`, creating it if needed. With `wipe` set, every file
    /// inside is deleted first; otherwise existing files count as held
    /// blobs.
    pub async fn new_and_setup(
        folder: impl AsRef<Path>,
        wipe: bool,
    ) -> Result<Self, DfsError> {
        let folder = folder.as_ref().to_path_buf();
        fs::create_dir_all(&folder).await?;

        let mut names = BTreeSet::new();
        let mut entries = fs::read_dir(&folder).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if wipe {
                fs::remove_file(entry.path()).await?;
            } else if let Ok(name) = entry.file_name().into_string() {
                names.insert(name);
            }
        }

        Ok(FolderStore {
            folder,
            names: Mutex::new(names),
        })
    }

    fn path_of(&self, name: &str) -> Result<PathBuf, DfsError> {
        check_name(name)?;
        Ok(self.folder.join(name))
    }
}

#[async_trait]
impl BlobStore for FolderStore {
    async fn put(&self, name: &str, data: Bytes) -> Result<(), DfsError> {
        let path = self.path_of(name)?;
        if let Err(e) = fs::write(&path, &data).await {
            let _ = fs::remove_file(&path).await;
            return Err(e.into());
        }
        self.names.lock().await.insert(name.into());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Bytes>, DfsError> {
        let path = self.path_of(name)?;
        if !self.names.lock().await.contains(name) {
            return Ok(None);
        }
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool, DfsError> {
        let path = self.path_of(name)?;
        if !self.names.lock().await.remove(name) {
            return Ok(false);
        }
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, DfsError> {
        Ok(self.names.lock().await.iter().cloned().collect())
    }
}
