//! Repositories: identifier-addressed stores of named assets.
//!
//! Each repository lives in `<root>/<id>/` and is backed by one of two
//! interchangeable implementations, chosen once when the repository is created
//! and recorded in `<root>/<id>/.backend`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub mod archive;
pub mod fs_backend;
pub mod pool;

pub use archive::ContentArchive;
pub use fs_backend::FilesystemBackend;
pub use pool::{RepositoryPool, SharedPool};

/// Bytes inspected for MIME detection.
pub const SNIFF_LEN: usize = 8 * 1024;
/// Reported when detection finds nothing.
pub const DEFAULT_MIME: &str = "application/octet-stream";

const BACKEND_MARKER: &str = ".backend";
const STAGING_DIR: &str = "staging";
/// Synthetic root that names are resolved against before being re-based.
const JAIL_ROOT: &str = "/__colossus_jail__";

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path escapes repository root: {0}")]
    PathEscape(String),
    #[error("invalid asset name: {0:?}")]
    InvalidName(String),
    #[error("{mode:?} is not supported by the {backend} backend")]
    Unsupported { backend: &'static str, mode: OpenMode },
    #[error("invalid repository id: {0:?}")]
    InvalidId(String),
    #[error("archive index: {0}")]
    Index(#[from] bincode::Error),
}

impl RepositoryError {
    /// HTTP-style status for the asset-serving layer.
    pub fn status_code(&self) -> u16 {
        match self {
            RepositoryError::NotFound(_) => 404,
            RepositoryError::PathEscape(_)
            | RepositoryError::InvalidName(_)
            | RepositoryError::InvalidId(_) => 400,
            RepositoryError::Unsupported { .. } => 405,
            RepositoryError::Io(_) | RepositoryError::Index(_) => 500,
        }
    }

    fn from_io(err: std::io::Error, name: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            RepositoryError::NotFound(name.to_string())
        } else {
            RepositoryError::Io(err)
        }
    }
}

/// Repository identifier: a 36-character hyphenated UUID, used verbatim as a path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryId(String);

impl RepositoryId {
    pub fn generate() -> Self {
        RepositoryId(uuid::Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for RepositoryId {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 36 || uuid::Uuid::parse_str(s).is_err() {
            return Err(RepositoryError::InvalidId(s.to_string()));
        }
        Ok(RepositoryId(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lexically resolve `name` inside a synthetic jail root, check it stays inside,
/// then strip the jail and return the relative remainder.
fn jail_relative(name: &str) -> Result<PathBuf, RepositoryError> {
    let jail = Path::new(JAIL_ROOT);
    let joined = jail.join(name);
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    let relative = normalized
        .strip_prefix(jail)
        .map_err(|_| RepositoryError::PathEscape(name.to_string()))?;
    if relative.as_os_str().is_empty() {
        return Err(RepositoryError::InvalidName(name.to_string()));
    }
    Ok(relative.to_path_buf())
}

/// Resolve an asset name to a path strictly inside `base`.
pub fn resolve(base: &Path, name: &str) -> Result<PathBuf, RepositoryError> {
    Ok(base.join(jail_relative(name)?))
}

/// Canonical key for an asset name (relative, `/`-separated).
pub fn asset_key(name: &str) -> Result<String, RepositoryError> {
    let relative = jail_relative(name)?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Metadata about one stored asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub name: String,
    pub size: u64,
    pub mime: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    /// Not every backend can append; see [`RepositoryError::Unsupported`].
    Append,
}

pub enum AssetStream {
    Read(File),
    Write(AssetWriter),
}

impl AssetStream {
    pub fn into_reader(self) -> Option<File> {
        match self {
            AssetStream::Read(file) => Some(file),
            AssetStream::Write(_) => None,
        }
    }

    pub fn into_writer(self) -> Option<AssetWriter> {
        match self {
            AssetStream::Write(writer) => Some(writer),
            AssetStream::Read(_) => None,
        }
    }
}

/// Detect a MIME type from leading bytes.
pub fn detect_mime(head: &[u8]) -> String {
    infer::get(head)
        .map(|kind| kind.mime_type().to_owned())
        .unwrap_or_else(|| DEFAULT_MIME.to_owned())
}

/// Read up to [`SNIFF_LEN`] bytes from the start of a file and detect its type.
pub(crate) async fn sniff_file(path: &Path) -> Result<String, std::io::Error> {
    let file = File::open(path).await?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head).await?;
    Ok(detect_mime(&head))
}

pub(crate) enum CommitTarget {
    /// Bytes already land in the final file (append).
    InPlace,
    /// Move the staging file over this path.
    Rename(PathBuf),
    /// Publish into a content-addressed archive under this key.
    Archive { archive: ContentArchive, key: String },
}

/// Writable asset. Bytes go to a staging file and become visible on `commit`.
/// Dropping an uncommitted writer removes the staging file.
pub struct AssetWriter {
    file: Option<File>,
    staging: Option<PathBuf>,
    target: CommitTarget,
    hasher: Sha256,
    head: Vec<u8>,
    written: u64,
}

impl AssetWriter {
    pub(crate) fn new(file: File, staging: Option<PathBuf>, target: CommitTarget) -> Self {
        Self {
            file: Some(file),
            staging,
            target,
            hasher: Sha256::new(),
            head: Vec::new(),
            written: 0,
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), RepositoryError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("writer already closed"))?;
        file.write_all(buf).await?;
        self.hasher.update(buf);
        if self.head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - self.head.len()).min(buf.len());
            self.head.extend_from_slice(&buf[..take]);
        }
        self.written += buf.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// MIME type of what has been written so far, if recognizable.
    pub fn detected_mime(&self) -> Option<String> {
        infer::get(&self.head).map(|kind| kind.mime_type().to_owned())
    }

    /// Flush, then publish. Returns the number of bytes written.
    pub async fn commit(mut self) -> Result<u64, RepositoryError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        let target = std::mem::replace(&mut self.target, CommitTarget::InPlace);
        match target {
            CommitTarget::InPlace => {}
            CommitTarget::Rename(dest) => {
                if let Some(staging) = self.staging.as_ref() {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent).await?;
                    }
                    fs::rename(staging, &dest).await?;
                }
            }
            CommitTarget::Archive { archive, key } => {
                if let Some(staging) = self.staging.as_ref() {
                    let digest: [u8; 32] = std::mem::take(&mut self.hasher).finalize().into();
                    archive.publish(staging, &key, digest, self.written).await?;
                }
            }
        }
        // Published (or moved away); nothing left for Drop to clean up.
        self.staging = None;
        Ok(self.written)
    }

    /// Discard everything written.
    pub async fn abort(mut self) {
        self.file.take();
        if let Some(staging) = self.staging.take() {
            let _ = fs::remove_file(staging).await;
        }
    }
}

impl Drop for AssetWriter {
    fn drop(&mut self) {
        self.file.take();
        if let Some(staging) = self.staging.take() {
            let _ = std::fs::remove_file(staging);
        }
    }
}

/// Create a fresh staging file inside `dir`.
pub(crate) async fn staging_file(dir: &Path) -> Result<(File, PathBuf), RepositoryError> {
    fs::create_dir_all(dir).await?;
    let path = dir.join(uuid::Uuid::new_v4().simple().to_string());
    let file = File::create(&path).await?;
    Ok((file, path))
}

/// "Store bytes under a name."
#[async_trait]
pub trait RepositoryBackend: Send + Sync {
    async fn stat(&self, name: &str, want_mime: bool) -> Result<Stats, RepositoryError>;

    async fn open(&self, name: &str, mode: OpenMode) -> Result<AssetStream, RepositoryError>;

    async fn size(&self, name: &str) -> Result<u64, RepositoryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Filesystem,
    ContentAddressed,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Filesystem => "filesystem",
            BackendKind::ContentAddressed => "content-addressed",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "filesystem" | "fs" => Ok(BackendKind::Filesystem),
            "content-addressed" | "archive" => Ok(BackendKind::ContentAddressed),
            other => Err(format!("unknown backend {other:?}")),
        }
    }
}

/// The storage implementation behind one repository.
#[derive(Debug, Clone)]
pub enum Backend {
    Filesystem(FilesystemBackend),
    ContentAddressed(ContentArchive),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Filesystem(_) => BackendKind::Filesystem,
            Backend::ContentAddressed(_) => BackendKind::ContentAddressed,
        }
    }

    async fn open_at(base: &Path, kind: BackendKind) -> Result<Self, RepositoryError> {
        Ok(match kind {
            BackendKind::Filesystem => Backend::Filesystem(FilesystemBackend::open(base).await?),
            BackendKind::ContentAddressed => {
                Backend::ContentAddressed(ContentArchive::open(base).await?)
            }
        })
    }
}

#[async_trait]
impl RepositoryBackend for Backend {
    async fn stat(&self, name: &str, want_mime: bool) -> Result<Stats, RepositoryError> {
        match self {
            Backend::Filesystem(b) => b.stat(name, want_mime).await,
            Backend::ContentAddressed(b) => b.stat(name, want_mime).await,
        }
    }

    async fn open(&self, name: &str, mode: OpenMode) -> Result<AssetStream, RepositoryError> {
        match self {
            Backend::Filesystem(b) => b.open(name, mode).await,
            Backend::ContentAddressed(b) => b.open(name, mode).await,
        }
    }

    async fn size(&self, name: &str) -> Result<u64, RepositoryError> {
        match self {
            Backend::Filesystem(b) => b.size(name).await,
            Backend::ContentAddressed(b) => b.size(name).await,
        }
    }
}

/// One repository handle. Cheap to hold; all state lives on disk.
#[derive(Debug)]
pub struct Repository {
    id: RepositoryId,
    base_path: PathBuf,
    backend: Backend,
}

impl Repository {
    /// Provision a new repository directory under `root`.
    pub async fn create(
        root: &Path,
        id: RepositoryId,
        kind: BackendKind,
    ) -> Result<Self, RepositoryError> {
        let base_path = root.join(id.as_str());
        fs::create_dir_all(&base_path).await?;
        fs::write(base_path.join(BACKEND_MARKER), kind.as_str()).await?;
        let backend = Backend::open_at(&base_path, kind).await?;
        tracing::debug!(repository = %id, backend = kind.as_str(), "created repository");
        Ok(Self {
            id,
            base_path,
            backend,
        })
    }

    /// Reopen a repository that already exists on disk. `fallback` applies when
    /// the directory predates backend markers.
    pub async fn open_existing(
        root: &Path,
        id: &RepositoryId,
        fallback: BackendKind,
    ) -> Result<Option<Self>, RepositoryError> {
        let base_path = root.join(id.as_str());
        match fs::metadata(&base_path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let kind = match fs::read_to_string(base_path.join(BACKEND_MARKER)).await {
            Ok(marker) => marker.parse().unwrap_or(fallback),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => fallback,
            Err(e) => return Err(e.into()),
        };
        let backend = Backend::open_at(&base_path, kind).await?;
        Ok(Some(Self {
            id: id.clone(),
            base_path,
            backend,
        }))
    }

    pub fn id(&self) -> &RepositoryId {
        &self.id
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn open_read(&self, name: &str) -> Result<File, RepositoryError> {
        self.open(name, OpenMode::Read)
            .await?
            .into_reader()
            .ok_or_else(|| RepositoryError::InvalidName(name.to_string()))
    }

    pub async fn open_write(&self, name: &str) -> Result<AssetWriter, RepositoryError> {
        self.open(name, OpenMode::Write)
            .await?
            .into_writer()
            .ok_or_else(|| RepositoryError::InvalidName(name.to_string()))
    }
}

#[async_trait]
impl RepositoryBackend for Repository {
    async fn stat(&self, name: &str, want_mime: bool) -> Result<Stats, RepositoryError> {
        self.backend.stat(name, want_mime).await
    }

    async fn open(&self, name: &str, mode: OpenMode) -> Result<AssetStream, RepositoryError> {
        self.backend.open(name, mode).await
    }

    async fn size(&self, name: &str) -> Result<u64, RepositoryError> {
        self.backend.size(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_escapes_rejected_for_every_base() {
        let long = "/var/lib/colossus/storage/".repeat(8);
        for base in ["/", "", "a", long.as_str()] {
            let err = resolve(Path::new(base), "../../etc/passwd").unwrap_err();
            assert!(matches!(err, RepositoryError::PathEscape(_)), "base {base:?}");
        }
    }

    #[test]
    fn absolute_and_deep_escapes_rejected() {
        for name in ["/etc/passwd", "a/../../b", "../x", "a/b/../../../c"] {
            assert!(matches!(
                resolve(Path::new("/srv"), name),
                Err(RepositoryError::PathEscape(_))
            ));
        }
    }

    #[test]
    fn names_inside_root_resolve() {
        let base = Path::new("/srv/repo");
        assert_eq!(resolve(base, "a.bin").unwrap(), base.join("a.bin"));
        assert_eq!(resolve(base, "dir/./b.bin").unwrap(), base.join("dir/b.bin"));
        assert_eq!(resolve(base, "dir/../c.bin").unwrap(), base.join("c.bin"));
        assert_eq!(asset_key("x/./y/../z").unwrap(), "x/z");
    }

    #[test]
    fn empty_name_rejected() {
        assert!(matches!(
            resolve(Path::new("/srv"), ""),
            Err(RepositoryError::InvalidName(_))
        ));
        assert!(matches!(
            resolve(Path::new("/srv"), "a/.."),
            Err(RepositoryError::InvalidName(_))
        ));
    }

    #[test]
    fn repository_id_validation() {
        let id = RepositoryId::generate();
        assert_eq!(id.as_str().len(), 36);
        assert_eq!(id.as_str().parse::<RepositoryId>().unwrap(), id);
        assert!("not-a-uuid".parse::<RepositoryId>().is_err());
        assert!("../../../../../../../../../etc/passwd".parse::<RepositoryId>().is_err());
    }

    #[test]
    fn backend_kind_parsing() {
        assert_eq!("filesystem".parse::<BackendKind>().unwrap(), BackendKind::Filesystem);
        assert_eq!(
            "content-addressed".parse::<BackendKind>().unwrap(),
            BackendKind::ContentAddressed
        );
        assert!("tape".parse::<BackendKind>().is_err());
    }

    #[test]
    fn status_codes() {
        assert_eq!(RepositoryError::NotFound("x".into()).status_code(), 404);
        assert_eq!(RepositoryError::PathEscape("x".into()).status_code(), 400);
        assert_eq!(
            RepositoryError::Io(std::io::Error::other("disk")).status_code(),
            500
        );
    }

    #[test]
    fn detects_png() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];
        assert_eq!(detect_mime(&png), "image/png");
        assert_eq!(detect_mime(b"plain words"), DEFAULT_MIME);
    }

    #[tokio::test]
    async fn reopen_uses_recorded_backend() {
        let dir = tempfile::tempdir().unwrap();
        let id = RepositoryId::generate();
        Repository::create(dir.path(), id.clone(), BackendKind::ContentAddressed)
            .await
            .unwrap();
        let reopened = Repository::open_existing(dir.path(), &id, BackendKind::Filesystem)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reopened.backend_kind(), BackendKind::ContentAddressed);
        let missing = Repository::open_existing(dir.path(), &RepositoryId::generate(), BackendKind::Filesystem)
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
