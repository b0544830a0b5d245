//! Content-addressed archive: objects stored once under their SHA-256 digest,
//! names mapped to digests by a bincode index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use super::{
    asset_key, sniff_file, staging_file, AssetStream, AssetWriter, CommitTarget, OpenMode,
    RepositoryBackend, RepositoryError, Stats, STAGING_DIR,
};

const OBJECTS_DIR: &str = "objects";
const INDEX_FILE: &str = "index.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub digest: [u8; 32],
    pub size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ArchiveIndex {
    entries: HashMap<String, ArchiveEntry>,
}

#[derive(Debug, Clone)]
pub struct ContentArchive {
    root: PathBuf,
    index: Arc<Mutex<ArchiveIndex>>,
}

impl ContentArchive {
    /// Open (or initialize) the archive rooted at `base`, loading its index.
    pub async fn open(base: &Path) -> Result<Self, RepositoryError> {
        fs::create_dir_all(base.join(OBJECTS_DIR)).await?;
        let index = match fs::read(base.join(INDEX_FILE)).await {
            Ok(bytes) => bincode::deserialize(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ArchiveIndex::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            root: base.to_path_buf(),
            index: Arc::new(Mutex::new(index)),
        })
    }

    fn object_path(&self, digest: &[u8; 32]) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(hex::encode(digest))
    }

    async fn lookup(&self, name: &str) -> Result<ArchiveEntry, RepositoryError> {
        let key = asset_key(name)?;
        self.index
            .lock()
            .await
            .entries
            .get(&key)
            .copied()
            .ok_or(RepositoryError::NotFound(key))
    }

    /// Entry for a name, if present.
    pub async fn entry(&self, name: &str) -> Result<Option<ArchiveEntry>, RepositoryError> {
        match self.lookup(name).await {
            Ok(entry) => Ok(Some(entry)),
            Err(RepositoryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Move a staged file into the object store and bind `key` to it.
    pub(crate) async fn publish(
        &self,
        staging: &Path,
        key: &str,
        digest: [u8; 32],
        size: u64,
    ) -> Result<(), RepositoryError> {
        let object = self.object_path(&digest);
        let mut index = self.index.lock().await;
        if fs::try_exists(&object).await? {
            tracing::debug!(digest = %hex::encode(digest), "object already stored");
            fs::remove_file(staging).await?;
        } else {
            fs::rename(staging, &object).await?;
        }
        index
            .entries
            .insert(key.to_string(), ArchiveEntry { digest, size });
        self.persist(&index).await
    }

    async fn persist(&self, index: &ArchiveIndex) -> Result<(), RepositoryError> {
        let bytes = bincode::serialize(index)?;
        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, self.root.join(INDEX_FILE)).await?;
        Ok(())
    }
}

#[async_trait]
impl RepositoryBackend for ContentArchive {
    async fn stat(&self, name: &str, want_mime: bool) -> Result<Stats, RepositoryError> {
        let entry = self.lookup(name).await?;
        let mime = if want_mime {
            Some(sniff_file(&self.object_path(&entry.digest)).await?)
        } else {
            None
        };
        Ok(Stats {
            name: name.to_string(),
            size: entry.size,
            mime,
        })
    }

    async fn open(&self, name: &str, mode: OpenMode) -> Result<AssetStream, RepositoryError> {
        match mode {
            OpenMode::Read => {
                let entry = self.lookup(name).await?;
                let file = fs::File::open(self.object_path(&entry.digest))
                    .await
                    .map_err(|e| RepositoryError::from_io(e, name))?;
                Ok(AssetStream::Read(file))
            }
            OpenMode::Write => {
                let key = asset_key(name)?;
                let (file, staging) = staging_file(&self.root.join(STAGING_DIR)).await?;
                Ok(AssetStream::Write(AssetWriter::new(
                    file,
                    Some(staging),
                    CommitTarget::Archive {
                        archive: self.clone(),
                        key,
                    },
                )))
            }
            OpenMode::Append => Err(RepositoryError::Unsupported {
                backend: "content-addressed",
                mode,
            }),
        }
    }

    async fn size(&self, name: &str) -> Result<u64, RepositoryError> {
        Ok(self.lookup(name).await?.size)
    }
}
