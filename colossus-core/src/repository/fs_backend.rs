//! Plain filesystem backend: assets are files under `<repo>/data/`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};

use super::{
    resolve, sniff_file, staging_file, AssetStream, AssetWriter, CommitTarget, OpenMode,
    RepositoryBackend, RepositoryError, Stats, STAGING_DIR,
};

const DATA_DIR: &str = "data";

#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    data: PathBuf,
    staging: PathBuf,
}

impl FilesystemBackend {
    pub async fn open(base: &Path) -> Result<Self, RepositoryError> {
        let data = base.join(DATA_DIR);
        fs::create_dir_all(&data).await?;
        Ok(Self {
            data,
            staging: base.join(STAGING_DIR),
        })
    }

    async fn file_len(&self, name: &str) -> Result<(PathBuf, u64), RepositoryError> {
        let path = resolve(&self.data, name)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| RepositoryError::from_io(e, name))?;
        if !meta.is_file() {
            return Err(RepositoryError::NotFound(name.to_string()));
        }
        Ok((path, meta.len()))
    }
}

#[async_trait]
impl RepositoryBackend for FilesystemBackend {
    async fn stat(&self, name: &str, want_mime: bool) -> Result<Stats, RepositoryError> {
        let (path, size) = self.file_len(name).await?;
        let mime = if want_mime {
            Some(sniff_file(&path).await?)
        } else {
            None
        };
        Ok(Stats {
            name: name.to_string(),
            size,
            mime,
        })
    }

    async fn open(&self, name: &str, mode: OpenMode) -> Result<AssetStream, RepositoryError> {
        let path = resolve(&self.data, name)?;
        match mode {
            OpenMode::Read => {
                let (path, _) = self.file_len(name).await?;
                let file = fs::File::open(&path)
                    .await
                    .map_err(|e| RepositoryError::from_io(e, name))?;
                Ok(AssetStream::Read(file))
            }
            OpenMode::Write => {
                let (file, staging) = staging_file(&self.staging).await?;
                Ok(AssetStream::Write(AssetWriter::new(
                    file,
                    Some(staging),
                    CommitTarget::Rename(path),
                )))
            }
            OpenMode::Append => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?;
                Ok(AssetStream::Write(AssetWriter::new(
                    file,
                    None,
                    CommitTarget::InPlace,
                )))
            }
        }
    }

    async fn size(&self, name: &str) -> Result<u64, RepositoryError> {
        Ok(self.file_len(name).await?.1)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    async fn backend() -> (tempfile::TempDir, FilesystemBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::open(dir.path()).await.unwrap();
        (dir, backend)
    }

    async fn write(backend: &FilesystemBackend, name: &str, bytes: &[u8]) {
        let mut writer = backend
            .open(name, OpenMode::Write)
            .await
            .unwrap()
            .into_writer()
            .unwrap();
        writer.write_all(bytes).await.unwrap();
        assert_eq!(writer.commit().await.unwrap(), bytes.len() as u64);
    }

    #[tokio::test]
    async fn write_then_read() {
        let (_dir, backend) = backend().await;
        write(&backend, "clips/intro.bin", b"0123456789").await;

        assert_eq!(backend.size("clips/intro.bin").await.unwrap(), 10);
        let mut file = backend
            .open("clips/intro.bin", OpenMode::Read)
            .await
            .unwrap()
            .into_reader()
            .unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"0123456789");
    }

    #[tokio::test]
    async fn uncommitted_write_is_invisible_and_cleaned() {
        let (dir, backend) = backend().await;
        let mut writer = backend
            .open("a.bin", OpenMode::Write)
            .await
            .unwrap()
            .into_writer()
            .unwrap();
        writer.write_all(b"partial").await.unwrap();
        drop(writer);
        assert!(matches!(
            backend.size("a.bin").await,
            Err(RepositoryError::NotFound(_))
        ));
        let mut staged = fs::read_dir(dir.path().join(STAGING_DIR)).await.unwrap();
        assert!(staged.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_extends_file() {
        let (_dir, backend) = backend().await;
        write(&backend, "log.txt", b"abc").await;
        let mut writer = backend
            .open("log.txt", OpenMode::Append)
            .await
            .unwrap()
            .into_writer()
            .unwrap();
        writer.write_all(b"def").await.unwrap();
        writer.commit().await.unwrap();
        assert_eq!(backend.size("log.txt").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn stat_reports_mime_on_request() {
        let (_dir, backend) = backend().await;
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[0u8; 32]);
        write(&backend, "anim.gif", &gif).await;

        let plain = backend.stat("anim.gif", false).await.unwrap();
        assert_eq!(plain.size, gif.len() as u64);
        assert_eq!(plain.mime, None);
        let sniffed = backend.stat("anim.gif", true).await.unwrap();
        assert_eq!(sniffed.mime.as_deref(), Some("image/gif"));
    }

    #[tokio::test]
    async fn missing_and_escaping_names() {
        let (_dir, backend) = backend().await;
        assert!(matches!(
            backend.stat("nope", false).await,
            Err(RepositoryError::NotFound(_))
        ));
        assert!(matches!(
            backend.open("../../etc/passwd", OpenMode::Read).await,
            Err(RepositoryError::PathEscape(_))
        ));
        // directories are not assets
        write(&backend, "dir/file", b"x").await;
        assert!(matches!(
            backend.size("dir").await,
            Err(RepositoryError::NotFound(_))
        ));
    }
}
