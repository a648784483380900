//! Storage placement for received files
//!
//! Decides where a received file finally lives. A plain directory
//! destination is written to directly by the transfer; a document-tree grant
//! (a sandboxed folder the user picked, written through whole-buffer base64
//! payloads) is tried first and falls back to app-private storage, and as a
//! last resort the file is left where it was staged. The fallback chain is an
//! ordered list of [`Strategy`] values so the order can be inspected and
//! tested on its own.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default whole-buffer limit of a document-tree write (bytes)
pub const DEFAULT_TREE_BUFFER_LIMIT: u64 = 128 * 1024 * 1024;

const TREE_URI_PREFIX: &str = "content://lanportal.tree/";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of memory buffering {size} bytes (limit {limit})")]
    OutOfMemory { size: u64, limit: u64 },

    #[error("File not found: {0}")]
    Missing(PathBuf),

    #[error("Invalid document tree entry: {0}")]
    InvalidEntry(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Where the user wants received files
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// A plain directory the transfer writes into directly
    Path { path: PathBuf },
    /// A document-tree grant rooted at a folder
    Tree { root: PathBuf },
}

impl Default for Destination {
    fn default() -> Self {
        Destination::Path {
            path: dirs::download_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("lanportal"),
        }
    }
}

/// Final location of a placed file
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    File(PathBuf),
    Tree(String),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::File(path) => write!(f, "{}", path.display()),
            Location::Tree(uri) => f.write_str(uri),
        }
    }
}

/// One step of the placement chain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// The download already wrote to the destination; confirm it exists
    InPlace,
    /// Create a grant entry and write the whole file as base64
    TreeBase64,
    /// Streaming copy into app-private storage
    PrivateCopy,
    /// Keep the staged file where it is
    LeaveInPlace,
}

/// Ordered strategies for a destination
pub fn plan(destination: &Destination) -> Vec<Strategy> {
    match destination {
        Destination::Path { .. } => vec![Strategy::InPlace],
        Destination::Tree { .. } => vec![
            Strategy::TreeBase64,
            Strategy::PrivateCopy,
            Strategy::PrivateCopy,
            Strategy::LeaveInPlace,
        ],
    }
}

/// Outcome of a successful placement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub location: Location,
    pub strategy: Strategy,
}

/// Grant-style folder access: entries are created by name and written as
/// whole base64 payloads
pub trait DocumentTree: Send + Sync {
    /// Create a new empty entry and return its uri
    fn create_file<'a>(&'a self, name: &'a str, mime: &'a str) -> BoxFuture<'a, Result<String>>;

    /// Replace the entry's content with the decoded payload
    fn write_base64<'a>(&'a self, uri: &'a str, payload: String) -> BoxFuture<'a, Result<()>>;

    /// Delete an entry
    fn delete<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Largest file the grant can buffer in one write
    fn buffer_limit(&self) -> u64;

    /// Local path behind an entry, when there is one
    fn local_path(&self, uri: &str) -> Option<PathBuf>;
}

/// Document tree backed by a local folder
pub struct DirectoryTree {
    root: PathBuf,
    buffer_limit: u64,
}

impl DirectoryTree {
    pub fn new(root: PathBuf, buffer_limit: u64) -> Self {
        Self { root, buffer_limit }
    }

    fn entry_path(&self, uri: &str) -> Result<PathBuf> {
        let name = uri
            .strip_prefix(TREE_URI_PREFIX)
            .ok_or_else(|| StorageError::InvalidEntry(uri.to_string()))?;
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return Err(StorageError::InvalidEntry(uri.to_string()));
        }
        Ok(self.root.join(name))
    }
}

impl DocumentTree for DirectoryTree {
    fn create_file<'a>(&'a self, name: &'a str, _mime: &'a str) -> BoxFuture<'a, Result<String>> {
        async move {
            ensure_dir(&self.root).await?;
            let path = unique_path(&self.root, name);
            tokio::fs::File::create(&path).await?;

            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| StorageError::InvalidEntry(name.to_string()))?;
            Ok(format!("{}{}", TREE_URI_PREFIX, file_name))
        }
        .boxed()
    }

    fn write_base64<'a>(&'a self, uri: &'a str, payload: String) -> BoxFuture<'a, Result<()>> {
        async move {
            let path = self.entry_path(uri)?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(payload.as_bytes())
                .map_err(|e| StorageError::Encoding(e.to_string()))?;
            tokio::fs::write(&path, bytes).await?;
            Ok(())
        }
        .boxed()
    }

    fn delete<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let path = self.entry_path(uri)?;
            tokio::fs::remove_file(&path).await?;
            Ok(())
        }
        .boxed()
    }

    fn buffer_limit(&self) -> u64 {
        self.buffer_limit
    }

    fn local_path(&self, uri: &str) -> Option<PathBuf> {
        self.entry_path(uri).ok()
    }
}

/// The device's picture/video library
pub trait MediaLibrary: Send + Sync {
    /// Copy a file into the library
    fn save<'a>(&'a self, file: &'a Path, name: &'a str) -> BoxFuture<'a, anyhow::Result<PathBuf>>;

    /// Make a newly placed file visible to other applications
    fn refresh_index<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Media library that copies into a pictures folder
pub struct PicturesLibrary {
    dir: PathBuf,
}

impl PicturesLibrary {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl Default for PicturesLibrary {
    fn default() -> Self {
        Self::new(
            dirs::picture_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("lanportal"),
        )
    }
}

impl MediaLibrary for PicturesLibrary {
    fn save<'a>(&'a self, file: &'a Path, name: &'a str) -> BoxFuture<'a, anyhow::Result<PathBuf>> {
        async move {
            ensure_dir(&self.dir).await?;
            let target = unique_path(&self.dir, name);
            tokio::fs::copy(file, &target).await?;
            Ok(target)
        }
        .boxed()
    }

    fn refresh_index<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            tracing::debug!("Media index refresh for {}", location);
            Ok(())
        }
        .boxed()
    }
}

/// Places received files according to the user's destination
pub struct StorageResolver {
    private_dir: PathBuf,
    incoming_dir: PathBuf,
    tree_buffer_limit: u64,
    media: Arc<dyn MediaLibrary>,
}

impl StorageResolver {
    pub fn new(private_dir: PathBuf, incoming_dir: PathBuf, media: Arc<dyn MediaLibrary>) -> Self {
        Self {
            private_dir,
            incoming_dir,
            tree_buffer_limit: DEFAULT_TREE_BUFFER_LIMIT,
            media,
        }
    }

    pub fn with_tree_buffer_limit(mut self, limit: u64) -> Self {
        self.tree_buffer_limit = limit;
        self
    }

    pub fn media(&self) -> &Arc<dyn MediaLibrary> {
        &self.media
    }

    fn tree_for(&self, destination: &Destination) -> Option<DirectoryTree> {
        match destination {
            Destination::Tree { root } => {
                Some(DirectoryTree::new(root.clone(), self.tree_buffer_limit))
            }
            Destination::Path { .. } => None,
        }
    }

    /// Where a transfer should write `name` before placement.
    ///
    /// Creates the directory on first use.
    pub async fn download_target(&self, destination: &Destination, name: &str) -> Result<PathBuf> {
        let dir = match destination {
            Destination::Path { path } => path.clone(),
            Destination::Tree { .. } => self.incoming_dir.clone(),
        };
        ensure_dir(&dir).await?;
        Ok(unique_path(&dir, &sanitize_file_name(name)))
    }

    /// Readable local path of a placed file
    pub fn local_path(&self, destination: &Destination, location: &Location) -> Option<PathBuf> {
        match location {
            Location::File(path) => Some(path.clone()),
            Location::Tree(uri) => self.tree_for(destination)?.local_path(uri),
        }
    }

    /// Move a downloaded file to its final location
    pub async fn place(&self, temp: &Path, name: &str, destination: &Destination) -> Result<Placement> {
        let name = sanitize_file_name(name);
        let mut last_error = StorageError::Missing(temp.to_path_buf());

        for (attempt, strategy) in plan(destination).into_iter().enumerate() {
            match self.apply(strategy, temp, &name, destination).await {
                Ok(location) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Placed {} via fallback {:?} at {}",
                            name,
                            strategy,
                            location
                        );
                    }
                    if let Err(e) = self.media.refresh_index(&location).await {
                        tracing::warn!("Media index refresh failed for {}: {}", location, e);
                    }
                    return Ok(Placement { location, strategy });
                }
                Err(e) => {
                    tracing::warn!("Placement {:?} failed for {}: {}", strategy, name, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn apply(
        &self,
        strategy: Strategy,
        temp: &Path,
        name: &str,
        destination: &Destination,
    ) -> Result<Location> {
        match strategy {
            Strategy::InPlace | Strategy::LeaveInPlace => {
                if tokio::fs::try_exists(temp).await? {
                    Ok(Location::File(temp.to_path_buf()))
                } else {
                    Err(StorageError::Missing(temp.to_path_buf()))
                }
            }
            Strategy::TreeBase64 => {
                let tree = self
                    .tree_for(destination)
                    .ok_or_else(|| StorageError::InvalidEntry(name.to_string()))?;
                write_through_tree(&tree, temp, name).await
            }
            Strategy::PrivateCopy => self.copy_to_private(temp, name).await,
        }
    }

    async fn copy_to_private(&self, temp: &Path, name: &str) -> Result<Location> {
        ensure_dir(&self.private_dir).await?;
        let target = unique_path(&self.private_dir, name);
        tokio::fs::copy(temp, &target).await?;

        if !tokio::fs::try_exists(&target).await? {
            return Err(StorageError::Missing(target));
        }

        if let Err(e) = tokio::fs::remove_file(temp).await {
            tracing::warn!("Could not remove staged file {}: {}", temp.display(), e);
        }
        Ok(Location::File(target))
    }
}

/// Whole-file write through a document tree; the created entry is removed
/// again if anything after its creation fails
async fn write_through_tree(tree: &dyn DocumentTree, temp: &Path, name: &str) -> Result<Location> {
    let uri = tree.create_file(name, mime_for(name)).await?;

    let written: Result<()> = async {
        let size = tokio::fs::metadata(temp).await?.len();
        let limit = tree.buffer_limit();
        if size > limit {
            return Err(StorageError::OutOfMemory { size, limit });
        }
        let bytes = tokio::fs::read(temp).await?;
        let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
        tree.write_base64(&uri, payload).await
    }
    .await;

    if let Err(e) = written {
        if let Err(cleanup) = tree.delete(&uri).await {
            tracing::warn!("Could not delete partial entry {}: {}", uri, cleanup);
        }
        return Err(e);
    }

    if let Err(e) = tokio::fs::remove_file(temp).await {
        tracing::warn!("Could not remove staged file {}: {}", temp.display(), e);
    }
    Ok(Location::Tree(uri))
}

/// Create a directory if it is not there yet
pub async fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(())
}

/// Strip anything from a peer-supplied file name that could escape a directory
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !matches!(c, '\0' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .take(255)
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();

    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// `dir/name`, or `dir/stem (n).ext` if that is taken
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());

    (1..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
            None => dir.join(format!("{} ({})", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Kinds of files the gallery accepts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let ext = Path::new(name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())?;
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" | "heif" | "bmp" => Some(MediaKind::Image),
            "mp4" | "mov" | "m4v" | "3gp" | "mkv" | "webm" | "avi" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// MIME type announced for a file name
pub fn mime_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" | "heif" => "image/heic",
        "bmp" => "image/bmp",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "3gp" => "video/3gpp",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mp3" => "audio/mpeg",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "zip" => "application/zip",
        "apk" => "application/vnd.android.package-archive",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingLibrary {
        refreshed: Mutex<Vec<Location>>,
    }

    impl MediaLibrary for RecordingLibrary {
        fn save<'a>(&'a self, file: &'a Path, _name: &'a str) -> BoxFuture<'a, anyhow::Result<PathBuf>> {
            async move { Ok(file.to_path_buf()) }.boxed()
        }

        fn refresh_index<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, anyhow::Result<()>> {
            self.refreshed.lock().unwrap().push(location.clone());
            async { Ok(()) }.boxed()
        }
    }

    fn resolver(root: &Path, library: Arc<RecordingLibrary>) -> StorageResolver {
        StorageResolver::new(root.join("private"), root.join("incoming"), library)
    }

    #[test]
    fn test_plan_order() {
        assert_eq!(
            plan(&Destination::Path { path: PathBuf::from("/tmp") }),
            vec![Strategy::InPlace]
        );
        assert_eq!(
            plan(&Destination::Tree { root: PathBuf::from("/tmp") }),
            vec![
                Strategy::TreeBase64,
                Strategy::PrivateCopy,
                Strategy::PrivateCopy,
                Strategy::LeaveInPlace
            ]
        );
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\a?.jpg"), "a.jpg");
        assert_eq!(sanitize_file_name(".."), "unnamed");
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
    }

    #[test]
    fn test_unique_path_adds_counter() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("a.jpg"), b"x").unwrap();
        std::fs::write(temp.path().join("a (1).jpg"), b"x").unwrap();

        assert_eq!(unique_path(temp.path(), "a.jpg"), temp.path().join("a (2).jpg"));
        assert_eq!(unique_path(temp.path(), "b.jpg"), temp.path().join("b.jpg"));
    }

    #[test]
    fn test_media_kind_detection() {
        assert_eq!(MediaKind::from_name("IMG_0001.JPG"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_name("clip.mov"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_name("b.pdf"), None);
        assert_eq!(MediaKind::from_name("noext"), None);
        assert_eq!(mime_for("b.pdf"), "application/pdf");
    }

    #[tokio::test]
    async fn test_path_destination_is_confirmed_in_place() {
        let temp = tempdir().unwrap();
        let library = Arc::new(RecordingLibrary::default());
        let resolver = resolver(temp.path(), library.clone());
        let destination = Destination::Path { path: temp.path().join("downloads") };

        let target = resolver.download_target(&destination, "a.jpg").await.unwrap();
        tokio::fs::write(&target, b"jpeg").await.unwrap();

        let placement = resolver.place(&target, "a.jpg", &destination).await.unwrap();
        assert_eq!(placement.strategy, Strategy::InPlace);
        assert_eq!(placement.location, Location::File(target));
        assert_eq!(library.refreshed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tree_destination_writes_through_grant() {
        let temp = tempdir().unwrap();
        let library = Arc::new(RecordingLibrary::default());
        let resolver = resolver(temp.path(), library);
        let root = temp.path().join("grant");
        let destination = Destination::Tree { root: root.clone() };

        let staged = resolver.download_target(&destination, "b.pdf").await.unwrap();
        tokio::fs::write(&staged, b"%PDF-1.7 body").await.unwrap();

        let placement = resolver.place(&staged, "b.pdf", &destination).await.unwrap();
        assert_eq!(placement.strategy, Strategy::TreeBase64);
        assert_eq!(placement.location, Location::Tree(format!("{}b.pdf", TREE_URI_PREFIX)));
        assert_eq!(std::fs::read(root.join("b.pdf")).unwrap(), b"%PDF-1.7 body");
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_oversized_tree_write_falls_back_to_private_storage() {
        let temp = tempdir().unwrap();
        let library = Arc::new(RecordingLibrary::default());
        let resolver = resolver(temp.path(), library).with_tree_buffer_limit(1024);
        let root = temp.path().join("grant");
        let destination = Destination::Tree { root: root.clone() };

        let staged = resolver.download_target(&destination, "big.mp4").await.unwrap();
        tokio::fs::write(&staged, vec![7u8; 4096]).await.unwrap();

        let placement = resolver.place(&staged, "big.mp4", &destination).await.unwrap();
        let private = temp.path().join("private").join("big.mp4");

        assert_eq!(placement.strategy, Strategy::PrivateCopy);
        assert_eq!(placement.location, Location::File(private.clone()));
        assert_eq!(std::fs::read(&private).unwrap().len(), 4096);
        // partially created grant entry is gone
        assert!(!root.join("big.mp4").exists());
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_last_resort_keeps_staged_file() {
        let temp = tempdir().unwrap();
        let library = Arc::new(RecordingLibrary::default());
        // a plain file where private storage should be makes both private copies fail
        std::fs::write(temp.path().join("private"), b"not a directory").unwrap();
        let resolver = resolver(temp.path(), library.clone()).with_tree_buffer_limit(1024);
        let root = temp.path().join("grant");
        let destination = Destination::Tree { root: root.clone() };

        let staged = resolver.download_target(&destination, "big.mp4").await.unwrap();
        tokio::fs::write(&staged, vec![7u8; 4096]).await.unwrap();

        let placement = resolver.place(&staged, "big.mp4", &destination).await.unwrap();

        assert_eq!(placement.strategy, Strategy::LeaveInPlace);
        assert_eq!(placement.location, Location::File(staged.clone()));
        assert_eq!(std::fs::read(&staged).unwrap().len(), 4096);
        assert!(!root.join("big.mp4").exists());
        assert_eq!(library.refreshed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_staged_file_is_an_error() {
        let temp = tempdir().unwrap();
        let resolver = resolver(temp.path(), Arc::new(RecordingLibrary::default()));
        let destination = Destination::Path { path: temp.path().to_path_buf() };

        let result = resolver
            .place(&temp.path().join("never-downloaded.bin"), "never-downloaded.bin", &destination)
            .await;
        assert!(matches!(result, Err(StorageError::Missing(_))));
    }
}
