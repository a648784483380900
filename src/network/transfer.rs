//! Streaming File Transfers
//!
//! Moves the files of one session between peers, strictly one after another.
//! Downloads resume from a `.part` file with an HTTP range request; uploads
//! stream multipart bodies. Progress from either direction feeds the same
//! [`TransferSession`] model, so the aggregate counters behave identically.
//!
//! A session runs under a cancellation token; every file gets a child token,
//! so cancelling the session aborts the request in flight and stops the loop
//! before the next file starts.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::config::TransferConfig;
use super::protocol::{device_url, download_url, peer_url, routes, ManifestEntry, TRANSFER_ID_HEADER};
use super::session::{Outcome, SessionError, SessionHolder};
use crate::history::{HistoryEntry, HistoryRecorder};
use crate::storage::{mime_for, Destination, MediaKind, Placement, StorageError, StorageResolver};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Peer answered {0}")]
    Http(StatusCode),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl TransferError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

/// Files to pull from a hosting peer
#[derive(Clone, Debug)]
pub struct DownloadJob {
    pub peer: SocketAddr,
    /// Our own id, which the peer's download routes are keyed by
    pub device_id: String,
    pub destination: Destination,
    pub save_to_gallery: bool,
}

/// Files to push to an accepting peer
#[derive(Clone, Debug)]
pub struct UploadJob {
    pub peer: SocketAddr,
    pub device_id: String,
    pub files: Vec<PathBuf>,
}

/// Manifest entries describing local files
pub async fn build_manifest(files: &[PathBuf]) -> std::io::Result<Vec<ManifestEntry>> {
    let mut manifest = Vec::with_capacity(files.len());
    for path in files {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Not a file: {}", path.display()),
            ));
        }
        let name = file_name_of(path);
        manifest.push(ManifestEntry {
            mime: mime_for(&name).to_string(),
            name,
            size: metadata.len(),
        });
    }
    Ok(manifest)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed".to_string())
}

/// Staging path used while a download is incomplete
pub fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Records which download a `.part` file belongs to, so that a later
/// session only resumes bytes it actually asked for
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct PartMarker {
    peer: String,
    name: String,
    size: u64,
}

impl PartMarker {
    fn for_download(peer: SocketAddr, entry: &ManifestEntry) -> Self {
        Self {
            peer: peer.to_string(),
            name: entry.name.clone(),
            size: entry.size,
        }
    }

    fn path(part: &Path) -> PathBuf {
        let mut name = part.as_os_str().to_owned();
        name.push(".json");
        PathBuf::from(name)
    }

    async fn load(part: &Path) -> Option<Self> {
        let bytes = tokio::fs::read(Self::path(part)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn save(&self, part: &Path) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(self).map_err(std::io::Error::from)?;
        tokio::fs::write(Self::path(part), bytes).await
    }

    async fn remove(part: &Path) {
        let _ = tokio::fs::remove_file(Self::path(part)).await;
    }
}

/// Bytes of `part` that can be kept; anything left by another download is discarded
async fn resume_offset(part: &Path, marker: &PartMarker) -> u64 {
    let existing = match tokio::fs::metadata(part).await {
        Ok(metadata) => metadata.len(),
        Err(_) => return 0,
    };
    if existing > 0 && existing < marker.size && PartMarker::load(part).await.as_ref() == Some(marker) {
        return existing;
    }

    tracing::debug!("Discarding stale {}", part.display());
    let _ = tokio::fs::remove_file(part).await;
    PartMarker::remove(part).await;
    0
}

/// Runs transfer sessions and settles received files
pub struct TransferEngine {
    client: reqwest::Client,
    storage: Arc<StorageResolver>,
    history: Arc<HistoryRecorder>,
    config: TransferConfig,
    current: Mutex<CancellationToken>,
}

impl TransferEngine {
    pub fn new(
        storage: Arc<StorageResolver>,
        history: Arc<HistoryRecorder>,
        config: TransferConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_default();

        Self {
            client,
            storage,
            history,
            config,
            current: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn storage(&self) -> &Arc<StorageResolver> {
        &self.storage
    }

    pub fn history(&self) -> &Arc<HistoryRecorder> {
        &self.history
    }

    /// Cancel the running session, if any
    pub async fn cancel(&self) {
        let token = self.current.lock().await;
        if !token.is_cancelled() {
            tracing::info!("Cancelling transfer session");
            token.cancel();
        }
    }

    async fn begin_session(&self) -> CancellationToken {
        let mut current = self.current.lock().await;
        *current = CancellationToken::new();
        current.clone()
    }

    /// Pull every file of the session's manifest from `job.peer`.
    ///
    /// Per-file failures mark that file and move on; only cancellation ends
    /// the loop early, and is reported as [`TransferError::Cancelled`].
    pub async fn run_downloads<S>(
        &self,
        state: &Arc<RwLock<S>>,
        job: &DownloadJob,
    ) -> Result<Outcome, TransferError>
    where
        S: SessionHolder + 'static,
    {
        let token = self.begin_session().await;
        let files = manifest_of(state).await?;
        tracing::info!("Receiving {} files from {}", files.len(), job.peer);

        let timer = spawn_elapsed_timer(state.clone(), token.child_token());
        let result = self.download_all(state, job, &files, &token).await;
        timer.abort();
        result?;

        self.notify_finished(job.peer, &job.device_id).await;
        finish_session(state).await
    }

    async fn notify_finished(&self, peer: SocketAddr, device_id: &str) {
        let result = self
            .client
            .get(device_url(peer, routes::TRANSFER_FINISH, device_id))
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!("Could not notify {} of completion: {}", peer, e);
        }
    }

    async fn download_all<S>(
        &self,
        state: &Arc<RwLock<S>>,
        job: &DownloadJob,
        files: &[ManifestEntry],
        token: &CancellationToken,
    ) -> Result<(), TransferError>
    where
        S: SessionHolder + 'static,
    {
        for (index, entry) in files.iter().enumerate() {
            if token.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let peer_name = begin_file(state, index).await?;

            let file_token = token.child_token();
            let result = match self.download_file(state, job, index, entry, &file_token).await {
                Ok(staged) => {
                    self.settle(&staged, &entry.name, entry.size, &peer_name, &job.destination, job.save_to_gallery)
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(placement) => {
                    let mut guard = state.write().await;
                    if let Some(session) = guard.session_mut() {
                        session.finish_file(index, Some(placement.location.to_string()))?;
                    }
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::warn!("Download of {} failed: {}", entry.name, e);
                    let mut guard = state.write().await;
                    if let Some(session) = guard.session_mut() {
                        session.fail_file(index)?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn download_file<S>(
        &self,
        state: &Arc<RwLock<S>>,
        job: &DownloadJob,
        index: usize,
        entry: &ManifestEntry,
        token: &CancellationToken,
    ) -> Result<PathBuf, TransferError>
    where
        S: SessionHolder + 'static,
    {
        let target = self.storage.download_target(&job.destination, &entry.name).await?;
        let part = part_path(&target);
        let marker = PartMarker::for_download(job.peer, entry);
        let offset = resume_offset(&part, &marker).await;

        let mut request = self.client.get(download_url(job.peer, &job.device_id, index));
        if offset > 0 {
            tracing::debug!("Resuming {} at byte {}", entry.name, offset);
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            response = request.send() => response?,
            _ = token.cancelled() => return Err(TransferError::Cancelled),
        };

        let mut written = match response.status() {
            StatusCode::PARTIAL_CONTENT => offset,
            status if status.is_success() => 0,
            status => return Err(TransferError::Http(status)),
        };

        let mut file = if written > 0 {
            tokio::fs::OpenOptions::new().append(true).open(&part).await?
        } else {
            let file = tokio::fs::File::create(&part).await?;
            marker.save(&part).await?;
            file
        };
        report_progress(state, index, written).await;

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = token.cancelled() => {
                    file.flush().await?;
                    return Err(TransferError::Cancelled);
                }
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            report_progress(state, index, written).await;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&part, &target).await?;
        PartMarker::remove(&part).await;
        tracing::debug!("Downloaded {} ({} bytes)", entry.name, written);
        Ok(target)
    }

    /// Place a fully received file, copy it to the gallery when it qualifies,
    /// and record it in history
    pub async fn settle(
        &self,
        staged: &Path,
        name: &str,
        size: u64,
        from: &str,
        destination: &Destination,
        save_to_gallery: bool,
    ) -> Result<Placement, TransferError> {
        let placement = self.storage.place(staged, name, destination).await?;

        if save_to_gallery
            && MediaKind::from_name(name).is_some()
            && size < self.config.gallery_max_bytes
        {
            match self.storage.local_path(destination, &placement.location) {
                Some(path) => {
                    if let Err(e) = self.storage.media().save(&path, name).await {
                        tracing::warn!("Gallery copy of {} failed: {}", name, e);
                    }
                }
                None => tracing::warn!("No readable path for {}, skipping gallery", name),
            }
        }

        if let Err(e) = self.history.record(HistoryEntry::new(name, size, from)).await {
            tracing::warn!("Could not record history for {}: {}", name, e);
        }

        tracing::info!("Received {} -> {}", name, placement.location);
        Ok(placement)
    }

    /// Push every file of `job` to the peer, then tell it we are done
    pub async fn run_uploads<S>(
        &self,
        state: &Arc<RwLock<S>>,
        job: &UploadJob,
    ) -> Result<Outcome, TransferError>
    where
        S: SessionHolder + 'static,
    {
        let token = self.begin_session().await;
        tracing::info!("Sending {} files to {}", job.files.len(), job.peer);

        let timer = spawn_elapsed_timer(state.clone(), token.child_token());
        let result = self.upload_all(state, job, &token).await;
        timer.abort();
        result?;

        self.notify_finished(job.peer, &job.device_id).await;
        finish_session(state).await
    }

    async fn upload_all<S>(
        &self,
        state: &Arc<RwLock<S>>,
        job: &UploadJob,
        token: &CancellationToken,
    ) -> Result<(), TransferError>
    where
        S: SessionHolder + 'static,
    {
        for (index, path) in job.files.iter().enumerate() {
            if token.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            begin_file(state, index).await?;

            let file_token = token.child_token();
            match self.upload_file(state, job, index, path, &file_token).await {
                Ok(()) => {
                    let mut guard = state.write().await;
                    if let Some(session) = guard.session_mut() {
                        session.finish_file(index, None)?;
                    }
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::warn!("Upload of {} failed: {}", path.display(), e);
                    let mut guard = state.write().await;
                    if let Some(session) = guard.session_mut() {
                        session.fail_file(index)?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn upload_file<S>(
        &self,
        state: &Arc<RwLock<S>>,
        job: &UploadJob,
        index: usize,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<(), TransferError>
    where
        S: SessionHolder + 'static,
    {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = file_name_of(path);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u64>();
        let mut sent = 0u64;
        let stream = ReaderStream::with_capacity(file, self.config.buffer_size).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                let _ = progress_tx.send(sent);
            }
            chunk
        });

        let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), size)
            .file_name(name.clone())
            .mime_str(mime_for(&name))?;
        let form = Form::new().part("file", part);

        let request = self
            .client
            .post(peer_url(job.peer, routes::UPLOAD))
            .header(TRANSFER_ID_HEADER, &job.device_id)
            .multipart(form)
            .send();
        tokio::pin!(request);

        loop {
            tokio::select! {
                response = &mut request => {
                    let response = response?;
                    if !response.status().is_success() {
                        return Err(TransferError::Http(response.status()));
                    }
                    break;
                }
                Some(bytes) = progress_rx.recv() => report_progress(state, index, bytes).await,
                _ = token.cancelled() => return Err(TransferError::Cancelled),
            }
        }

        tracing::debug!("Uploaded {} ({} bytes)", name, size);
        Ok(())
    }
}

async fn manifest_of<S: SessionHolder>(state: &RwLock<S>) -> Result<Vec<ManifestEntry>, TransferError> {
    let guard = state.read().await;
    let session = guard.session().ok_or(SessionError::NoSession)?;
    Ok(session
        .files
        .iter()
        .map(|f| ManifestEntry {
            name: f.name.clone(),
            size: f.size,
            mime: f.mime.clone(),
        })
        .collect())
}

/// Marks file `index` as started and returns the peer's display name
async fn begin_file<S: SessionHolder>(state: &RwLock<S>, index: usize) -> Result<String, TransferError> {
    let mut guard = state.write().await;
    let session = guard.session_mut().ok_or(SessionError::NoSession)?;
    session.begin_file(index)?;
    Ok(session.peer_name.clone())
}

async fn finish_session<S: SessionHolder>(state: &RwLock<S>) -> Result<Outcome, TransferError> {
    let mut guard = state.write().await;
    let session = guard.session_mut().ok_or(SessionError::NoSession)?;
    let outcome = session.finish();
    let (completed, failed) = session.counts();
    tracing::info!(
        "Transfer finished: {:?} ({} done, {} failed, {} bytes)",
        outcome,
        completed,
        failed,
        session.aggregate_transferred
    );
    Ok(outcome)
}

async fn report_progress<S: SessionHolder>(state: &RwLock<S>, index: usize, bytes: u64) {
    if let Some(session) = state.write().await.session_mut() {
        session.update_progress(index, bytes, Instant::now());
    }
}

/// Ticks `elapsed_secs` once a second while the session is transferring
fn spawn_elapsed_timer<S>(state: Arc<RwLock<S>>, stop: CancellationToken) -> JoinHandle<()>
where
    S: SessionHolder + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let mut guard = state.write().await;
                    match guard.session_mut() {
                        Some(session) if session.is_transferring() => session.tick_elapsed(),
                        _ => break,
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::PairingRequest;
    use crate::network::session::{Event, FileStatus, Phase, ReceiverState};
    use crate::network::testing::serve_on;
    use crate::storage::PicturesLibrary;
    use axum::extract::Path as UrlPath;
    use axum::http::{HeaderMap, StatusCode as HttpStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::sync::Mutex as StdMutex;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _temp: TempDir,
        engine: TransferEngine,
        downloads: PathBuf,
        pictures: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().unwrap();
        let pictures = temp.path().join("pictures");
        let storage = StorageResolver::new(
            temp.path().join("private"),
            temp.path().join("incoming"),
            Arc::new(PicturesLibrary::new(pictures.clone())),
        );
        let engine = TransferEngine::new(
            Arc::new(storage),
            Arc::new(HistoryRecorder::in_memory()),
            TransferConfig::default(),
        );
        Fixture {
            downloads: temp.path().join("downloads"),
            pictures,
            _temp: temp,
            engine,
        }
    }

    fn entry(name: &str, size: u64) -> ManifestEntry {
        ManifestEntry {
            name: name.to_string(),
            size,
            mime: mime_for(name).to_string(),
        }
    }

    fn receiving(files: Vec<ManifestEntry>) -> Arc<RwLock<ReceiverState>> {
        let mut state = ReceiverState::new(3);
        state
            .apply(Event::RequestReceived(PairingRequest {
                requestor_id: "012".to_string(),
                requestor_name: "Calm Fox".to_string(),
                requestor_os: "linux".to_string(),
                requestor_platform: "desk".to_string(),
                files: files.clone(),
                peer_address: None,
            }))
            .unwrap();
        state.apply(Event::Accepted).unwrap();
        state.apply(Event::ManifestReady(files)).unwrap();
        Arc::new(RwLock::new(state))
    }

    fn job(peer: SocketAddr, downloads: &Path) -> DownloadJob {
        DownloadJob {
            peer,
            device_id: "050".to_string(),
            destination: Destination::Path {
                path: downloads.to_path_buf(),
            },
            save_to_gallery: true,
        }
    }

    #[tokio::test]
    async fn test_two_files_complete() {
        let fx = fixture();
        let hub = Router::new().route(
            "/download/:device/:index",
            get(|UrlPath((_device, index)): UrlPath<(String, usize)>| async move {
                match index {
                    0 => vec![1u8; 1000],
                    _ => vec![2u8; 2000],
                }
            }),
        );
        let peer = serve_on("127.0.0.1:0", hub).await;
        let state = receiving(vec![entry("a.jpg", 1000), entry("b.pdf", 2000)]);

        let outcome = fx.engine.run_downloads(&state, &job(peer, &fx.downloads)).await.unwrap();

        assert_eq!(outcome, Outcome::Done);
        let guard = state.read().await;
        let session = guard.session().unwrap();
        assert_eq!(session.aggregate_transferred, 3000);
        assert!((session.progress - 1.0).abs() < f64::EPSILON);
        assert_eq!(session.current_filename, "");
        assert!(session.files.iter().all(|f| f.status == FileStatus::Done));

        let history = fx.engine.history().entries().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from, "Calm Fox");

        assert_eq!(std::fs::read(fx.downloads.join("b.pdf")).unwrap().len(), 2000);
        assert!(!fx.downloads.join("b.pdf.part").exists());
        // only the image went to the gallery
        assert!(fx.pictures.join("a.jpg").exists());
        assert!(!fx.pictures.join("b.pdf").exists());
    }

    #[tokio::test]
    async fn test_failed_file_marks_session_error() {
        let fx = fixture();
        let hub = Router::new().route(
            "/download/:device/:index",
            get(|| async { HttpStatus::INTERNAL_SERVER_ERROR }),
        );
        let peer = serve_on("127.0.0.1:0", hub).await;
        let state = receiving(vec![entry("a.jpg", 1000)]);

        let outcome = fx.engine.run_downloads(&state, &job(peer, &fx.downloads)).await.unwrap();

        assert_eq!(outcome, Outcome::Error);
        assert_eq!(state.read().await.session().unwrap().files[0].status, FileStatus::Error);
        assert!(fx.engine.history().is_empty().await);
    }

    #[tokio::test]
    async fn test_one_failure_among_many_keeps_going() {
        let fx = fixture();
        let hub = Router::new().route(
            "/download/:device/:index",
            get(|UrlPath((_device, index)): UrlPath<(String, usize)>| async move {
                if index == 0 {
                    HttpStatus::NOT_FOUND.into_response()
                } else {
                    vec![3u8; 10].into_response()
                }
            }),
        );
        let peer = serve_on("127.0.0.1:0", hub).await;
        let state = receiving(vec![entry("gone.txt", 5), entry("c.txt", 10)]);

        let outcome = fx.engine.run_downloads(&state, &job(peer, &fx.downloads)).await.unwrap();

        assert_eq!(outcome, Outcome::Error);
        let guard = state.read().await;
        let files = &guard.session().unwrap().files;
        assert_eq!(files[0].status, FileStatus::Error);
        assert_eq!(files[1].status, FileStatus::Done);
        assert_eq!(fx.engine.history().len().await, 1);
    }

    /// Serves `body`, honouring `Range: bytes=N-`, and remembers the last range asked for
    fn ranged_hub(body: Vec<u8>, seen_range: Arc<StdMutex<Option<String>>>) -> Router {
        Router::new().route(
            "/download/:device/:index",
            get(move |headers: HeaderMap| {
                let body = body.clone();
                let seen_range = seen_range.clone();
                async move {
                    let range = headers
                        .get("range")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    *seen_range.lock().unwrap() = range.clone();
                    match range.and_then(|r| r.strip_prefix("bytes=")?.strip_suffix('-')?.parse::<usize>().ok()) {
                        Some(start) => (HttpStatus::PARTIAL_CONTENT, body[start..].to_vec()).into_response(),
                        None => body.into_response(),
                    }
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_partial_download_resumes_with_range() {
        let fx = fixture();
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let seen_range = Arc::new(StdMutex::new(None::<String>));
        let peer = serve_on("127.0.0.1:0", ranged_hub(body.clone(), seen_range.clone())).await;

        std::fs::create_dir_all(&fx.downloads).unwrap();
        let part = fx.downloads.join("d.bin.part");
        std::fs::write(&part, &body[..400]).unwrap();
        PartMarker::for_download(peer, &entry("d.bin", 1000)).save(&part).await.unwrap();
        let state = receiving(vec![entry("d.bin", 1000)]);

        let outcome = fx.engine.run_downloads(&state, &job(peer, &fx.downloads)).await.unwrap();

        assert_eq!(outcome, Outcome::Done);
        assert_eq!(seen_range.lock().unwrap().as_deref(), Some("bytes=400-"));
        assert_eq!(std::fs::read(fx.downloads.join("d.bin")).unwrap(), body);
        assert!(!PartMarker::path(&part).exists());
    }

    #[tokio::test]
    async fn test_leftover_part_from_unknown_download_is_discarded() {
        let fx = fixture();
        let body = vec![0xAAu8; 1000];
        let seen_range = Arc::new(StdMutex::new(None::<String>));
        let peer = serve_on("127.0.0.1:0", ranged_hub(body.clone(), seen_range.clone())).await;

        std::fs::create_dir_all(&fx.downloads).unwrap();
        std::fs::write(fx.downloads.join("d.bin.part"), vec![0x11u8; 400]).unwrap();
        let state = receiving(vec![entry("d.bin", 1000)]);

        let outcome = fx.engine.run_downloads(&state, &job(peer, &fx.downloads)).await.unwrap();

        assert_eq!(outcome, Outcome::Done);
        assert_eq!(*seen_range.lock().unwrap(), None);
        assert_eq!(std::fs::read(fx.downloads.join("d.bin")).unwrap(), body);
    }

    #[tokio::test]
    async fn test_part_from_another_peer_is_not_resumed() {
        let fx = fixture();
        let body = vec![0xAAu8; 1000];
        let seen_range = Arc::new(StdMutex::new(None::<String>));
        let peer = serve_on("127.0.0.1:0", ranged_hub(body.clone(), seen_range.clone())).await;

        std::fs::create_dir_all(&fx.downloads).unwrap();
        let part = fx.downloads.join("d.bin.part");
        std::fs::write(&part, vec![0x11u8; 400]).unwrap();
        let elsewhere: SocketAddr = "192.168.1.77:3030".parse().unwrap();
        PartMarker::for_download(elsewhere, &entry("d.bin", 1000)).save(&part).await.unwrap();
        let state = receiving(vec![entry("d.bin", 1000)]);

        let outcome = fx.engine.run_downloads(&state, &job(peer, &fx.downloads)).await.unwrap();

        assert_eq!(outcome, Outcome::Done);
        assert_eq!(*seen_range.lock().unwrap(), None);
        assert_eq!(std::fs::read(fx.downloads.join("d.bin")).unwrap(), body);
    }

    #[tokio::test]
    async fn test_cancel_stops_without_marking_error() {
        let fx = Arc::new(fixture());
        let hub = Router::new().route(
            "/download/:device/:index",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                vec![0u8; 10]
            }),
        );
        let peer = serve_on("127.0.0.1:0", hub).await;
        let state = receiving(vec![entry("slow.bin", 10), entry("next.bin", 10)]);

        let run = {
            let fx = fx.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let job = job(peer, &fx.downloads);
                fx.engine.run_downloads(&state, &job).await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        fx.engine.cancel().await;

        let result = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));

        let guard = state.read().await;
        assert_eq!(guard.phase(), Phase::Transferring);
        let files = &guard.session().unwrap().files;
        assert_eq!(files[0].status, FileStatus::Transferring);
        assert_eq!(files[1].status, FileStatus::Waiting);
    }

    #[tokio::test]
    async fn test_cancelled_upload_is_not_marked_error() {
        let fx = Arc::new(fixture());
        let target = Router::new().route(
            "/upload",
            axum::routing::post(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                HttpStatus::OK
            }),
        );
        let peer = serve_on("127.0.0.1:0", target).await;

        std::fs::create_dir_all(&fx.downloads).unwrap();
        let files = vec![fx.downloads.join("a.jpg"), fx.downloads.join("b.pdf")];
        std::fs::write(&files[0], vec![1u8; 1000]).unwrap();
        std::fs::write(&files[1], vec![2u8; 2000]).unwrap();
        let state = receiving(vec![entry("a.jpg", 1000), entry("b.pdf", 2000)]);

        let run = {
            let fx = fx.clone();
            let state = state.clone();
            let job = UploadJob {
                peer,
                device_id: "012".to_string(),
                files,
            };
            tokio::spawn(async move { fx.engine.run_uploads(&state, &job).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        fx.engine.cancel().await;

        let result = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));

        let guard = state.read().await;
        let files = &guard.session().unwrap().files;
        assert_eq!(files[0].status, FileStatus::Transferring);
        assert_eq!(files[1].status, FileStatus::Waiting);
    }

    #[test]
    fn test_part_path() {
        assert_eq!(part_path(Path::new("/tmp/a.jpg")), PathBuf::from("/tmp/a.jpg.part"));
    }

    #[tokio::test]
    async fn test_manifest_rejects_directories() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("a.jpg");
        std::fs::write(&file, b"jpeg").unwrap();

        let manifest = build_manifest(&[file]).await.unwrap();
        assert_eq!(manifest, vec![ManifestEntry { name: "a.jpg".to_string(), size: 4, mime: "image/jpeg".to_string() }]);

        assert!(build_manifest(&[temp.path().to_path_buf()]).await.is_err());
    }
}
