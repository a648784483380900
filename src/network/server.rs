//! Control Server
//!
//! The peer side of the control protocol. A device can host one outgoing
//! offer at a time (a receiver finds it by polling, accepts, and downloads
//! the files) and accept one incoming push at a time (a sender asks through
//! `request-connect`, the local [`ConnectionDecider`] answers, then files
//! arrive as multipart uploads).

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use super::config::PairingConfig;
use super::identity::{brand_name, platform_name, DeviceIdentity};
use super::protocol::{
    routes, ConnectRequest, ManifestEntry, PairingPoll, PairingRequest, PairingStatus, ReadyStatus,
    RespondToConnection, ServerInfo, StatusReply, TransferStatusReply, UploadReply,
    PROTOCOL_VERSION, TRANSFER_ID_HEADER,
};
use super::transfer::{build_manifest, part_path, TransferEngine, TransferError};
use crate::storage::mime_for;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("No matching offer")]
    NoOffer,

    #[error("Not allowed for this device")]
    Forbidden,

    #[error("Another transfer is in progress")]
    Busy,

    #[error("No file with index {0}")]
    UnknownFile(usize),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Multipart(#[from] MultipartError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::NoOffer | ServerError::UnknownFile(_) => StatusCode::NOT_FOUND,
            ServerError::Forbidden => StatusCode::FORBIDDEN,
            ServerError::Busy => StatusCode::CONFLICT,
            ServerError::BadRequest(_) | ServerError::Multipart(_) => StatusCode::BAD_REQUEST,
            ServerError::Cancelled => StatusCode::GONE,
            ServerError::Io(_) | ServerError::Transfer(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Decides whether an incoming push is accepted
pub trait ConnectionDecider: Send + Sync {
    fn decide<'a>(&'a self, request: &'a PairingRequest) -> BoxFuture<'a, bool>;
}

/// Always gives the same answer
pub struct AutoDecision(pub bool);

impl ConnectionDecider for AutoDecision {
    fn decide<'a>(&'a self, request: &'a PairingRequest) -> BoxFuture<'a, bool> {
        let accept = self.0;
        async move {
            tracing::info!(
                "{} request from {}",
                if accept { "Auto-accepting" } else { "Auto-declining" },
                request.requestor_name
            );
            accept
        }
        .boxed()
    }
}

/// Asks the operator on the terminal
pub struct PromptDecider;

impl ConnectionDecider for PromptDecider {
    fn decide<'a>(&'a self, request: &'a PairingRequest) -> BoxFuture<'a, bool> {
        let mut prompt = format!(
            "\n{} ({}) wants to send {} file(s), {} bytes:\n",
            request.requestor_name,
            request.requestor_os,
            request.files.len(),
            request.total_size()
        );
        for file in &request.files {
            prompt.push_str(&format!("  {} ({} bytes)\n", file.name, file.size));
        }
        prompt.push_str("Accept? [y/N] ");

        async move {
            let answer = tokio::task::spawn_blocking(move || {
                use std::io::Write;
                print!("{}", prompt);
                let _ = std::io::stdout().flush();
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).map(|_| line)
            })
            .await;

            matches!(answer, Ok(Ok(line)) if matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
        }
        .boxed()
    }
}

/// Lifecycle of a hosted offer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OfferStatus {
    Pending,
    Accepted,
    Declined,
    Cancelled,
    Finished,
}

impl OfferStatus {
    pub fn is_final(self) -> bool {
        matches!(self, OfferStatus::Declined | OfferStatus::Cancelled | OfferStatus::Finished)
    }
}

struct Offer {
    /// Device id the offer is meant for; any poller when unset
    target: Option<String>,
    files: Vec<PathBuf>,
    manifest: Vec<ManifestEntry>,
    receiver: Option<String>,
    status: watch::Sender<OfferStatus>,
}

impl Offer {
    fn status(&self) -> OfferStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: OfferStatus) {
        self.status.send_replace(status);
    }

    fn addressed_to(&self, device_id: &str) -> bool {
        let target_ok = self.target.as_deref().map_or(true, |t| t == device_id);
        let receiver_ok = self.receiver.as_deref().map_or(true, |r| r == device_id);
        target_ok && receiver_ok
    }

    fn accepted_by(&self, device_id: &str) -> bool {
        self.status() == OfferStatus::Accepted && self.receiver.as_deref() == Some(device_id)
    }
}

struct IncomingPush {
    request: PairingRequest,
    cancel: CancellationToken,
    accepted: bool,
    received: usize,
    last_activity: Instant,
    uploads: Arc<AtomicUsize>,
}

impl IncomingPush {
    fn new(request: PairingRequest, cancel: CancellationToken) -> Self {
        Self {
            request,
            cancel,
            accepted: false,
            received: 0,
            last_activity: Instant::now(),
            uploads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Accepted, but the sender has sent nothing for `idle`
    fn is_abandoned(&self, idle: Duration) -> bool {
        self.accepted
            && self.uploads.load(Ordering::SeqCst) == 0
            && self.last_activity.elapsed() >= idle
    }
}

/// Counts an upload as in flight until dropped
struct UploadInFlight(Arc<AtomicUsize>);

impl UploadInFlight {
    fn start(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for UploadInFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ServerState {
    identity: Arc<RwLock<DeviceIdentity>>,
    engine: Arc<TransferEngine>,
    decider: Arc<dyn ConnectionDecider>,
    config: PairingConfig,
    offer: RwLock<Option<Offer>>,
    incoming: RwLock<Option<IncomingPush>>,
}

/// HTTP control server
#[derive(Clone)]
pub struct ControlServer {
    state: Arc<ServerState>,
}

impl ControlServer {
    pub fn new(
        identity: Arc<RwLock<DeviceIdentity>>,
        engine: Arc<TransferEngine>,
        decider: Arc<dyn ConnectionDecider>,
        config: PairingConfig,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                identity,
                engine,
                decider,
                config,
                offer: RwLock::new(None),
                incoming: RwLock::new(None),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(routes::SERVER_INFO, get(server_info))
            .route(&format!("{}/:poll_id", routes::CHECK_PAIRING), get(check_pairing))
            .route(routes::REQUEST_CONNECT, post(request_connect))
            .route(routes::RESPOND_TO_CONNECTION, post(respond_to_connection))
            .route(&format!("{}/:poll_id", routes::TRANSFER_STATUS), get(transfer_status))
            .route(&format!("{}/:device_id/:index", routes::DOWNLOAD), get(download))
            .route(
                routes::UPLOAD,
                post(upload).layer(DefaultBodyLimit::disable()),
            )
            .route(&format!("{}/:poll_id", routes::TRANSFER_FINISH), get(transfer_finish))
            .route(&format!("{}/:poll_id", routes::CANCEL_TRANSFER), get(cancel_transfer))
            .route(&format!("{}/:poll_id", routes::CANCEL_PAIRING), get(cancel_pairing))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Control server listening on http://{}", addr);
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }

    /// Host `files` for the device `target` (or whoever polls first)
    pub async fn offer_files(&self, files: Vec<PathBuf>, target: Option<String>) -> Result<Vec<ManifestEntry>, ServerError> {
        if files.is_empty() {
            return Err(ServerError::BadRequest("nothing to offer".to_string()));
        }
        let manifest = build_manifest(&files).await?;

        let mut offer = self.state.offer.write().await;
        if offer.as_ref().is_some_and(|o| !o.status().is_final()) {
            return Err(ServerError::Busy);
        }

        tracing::info!(
            "Offering {} files to {}",
            manifest.len(),
            target.as_deref().unwrap_or("any device")
        );
        let (status, _) = watch::channel(OfferStatus::Pending);
        *offer = Some(Offer {
            target,
            files,
            manifest: manifest.clone(),
            receiver: None,
            status,
        });
        Ok(manifest)
    }

    /// Wait until the current offer is declined, cancelled or delivered
    pub async fn wait_for_offer(&self, timeout: Duration) -> Option<OfferStatus> {
        let mut status = {
            let offer = self.state.offer.read().await;
            offer.as_ref()?.status.subscribe()
        };
        let outcome = match tokio::time::timeout(timeout, status.wait_for(|s| s.is_final())).await {
            Ok(Ok(status)) => Some(*status),
            _ => None,
        };
        outcome
    }

    /// Withdraw the current offer
    pub async fn cancel_offer(&self) {
        if let Some(offer) = self.state.offer.read().await.as_ref() {
            if !offer.status().is_final() {
                tracing::info!("Offer withdrawn");
                offer.set_status(OfferStatus::Cancelled);
            }
        }
    }

    /// The push currently being negotiated or received, if any
    pub async fn incoming_request(&self) -> Option<PairingRequest> {
        self.state
            .incoming
            .read()
            .await
            .as_ref()
            .map(|push| push.request.clone())
    }
}

/// `bytes=N-` → N
pub fn parse_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes=")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

async fn server_info(State(state): State<Arc<ServerState>>) -> Json<ServerInfo> {
    let identity = state.identity.read().await;
    Json(ServerInfo {
        name: identity.display_name.clone(),
        device_id: identity.short_id.clone(),
        platform: platform_name(),
        version: crate::full_version(),
        protocol_version: PROTOCOL_VERSION,
    })
}

async fn check_pairing(
    State(state): State<Arc<ServerState>>,
    Path(poll_id): Path<String>,
) -> Json<PairingPoll> {
    let none = PairingPoll {
        status: PairingStatus::None,
        request: None,
    };

    let offer = state.offer.read().await;
    let Some(offer) = offer.as_ref().filter(|o| o.addressed_to(&poll_id)) else {
        return Json(none);
    };

    let poll = match offer.status() {
        OfferStatus::Pending => {
            let identity = state.identity.read().await;
            PairingPoll {
                status: PairingStatus::Pending,
                request: Some(PairingRequest {
                    requestor_id: identity.short_id.clone(),
                    requestor_name: identity.display_name.clone(),
                    requestor_os: platform_name(),
                    requestor_platform: brand_name(),
                    files: offer.manifest.clone(),
                    peer_address: None,
                }),
            }
        }
        OfferStatus::Accepted => PairingPoll {
            status: PairingStatus::Accepted,
            request: None,
        },
        OfferStatus::Declined => PairingPoll {
            status: PairingStatus::Declined,
            request: None,
        },
        OfferStatus::Cancelled => PairingPoll {
            status: PairingStatus::Cancelled,
            request: None,
        },
        OfferStatus::Finished => none,
    };
    Json(poll)
}

async fn respond_to_connection(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RespondToConnection>,
) -> Result<Json<StatusReply>, ServerError> {
    let mut guard = state.offer.write().await;
    let offer = guard
        .as_mut()
        .filter(|o| o.addressed_to(&body.device_id))
        .ok_or(ServerError::NoOffer)?;

    if offer.status() != OfferStatus::Pending {
        return Err(ServerError::NoOffer);
    }

    let status = if body.accepted {
        offer.receiver = Some(body.device_id.clone());
        offer.set_status(OfferStatus::Accepted);
        PairingStatus::Accepted
    } else {
        offer.set_status(OfferStatus::Declined);
        PairingStatus::Declined
    };
    tracing::info!("Device {} {} the offer", body.device_id, status);

    Ok(Json(StatusReply { status }))
}

async fn transfer_status(
    State(state): State<Arc<ServerState>>,
    Path(poll_id): Path<String>,
) -> Json<TransferStatusReply> {
    let offer = state.offer.read().await;
    match offer.as_ref().filter(|o| o.accepted_by(&poll_id)) {
        Some(offer) => Json(TransferStatusReply {
            status: ReadyStatus::Ready,
            files: Some(offer.manifest.clone()),
        }),
        None => Json(TransferStatusReply {
            status: ReadyStatus::None,
            files: None,
        }),
    }
}

async fn download(
    State(state): State<Arc<ServerState>>,
    Path((device_id, index)): Path<(String, usize)>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let path = {
        let offer = state.offer.read().await;
        let offer = offer
            .as_ref()
            .filter(|o| o.accepted_by(&device_id))
            .ok_or(ServerError::Forbidden)?;
        offer
            .files
            .get(index)
            .cloned()
            .ok_or(ServerError::UnknownFile(index))?
    };

    let mut file = tokio::fs::File::open(&path).await?;
    let size = file.metadata().await?.len();
    let mime = mime_for(&path.to_string_lossy()).to_string();

    let start = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_start)
        .filter(|start| *start > 0 && *start < size);

    match start {
        Some(start) => {
            tracing::debug!("Serving {} from byte {}", path.display(), start);
            file.seek(SeekFrom::Start(start)).await?;
            let body = Body::from_stream(ReaderStream::new(file));
            Ok((
                StatusCode::PARTIAL_CONTENT,
                [
                    (CONTENT_TYPE, mime),
                    (CONTENT_LENGTH, (size - start).to_string()),
                    (CONTENT_RANGE, format!("bytes {}-{}/{}", start, size - 1, size)),
                ],
                body,
            )
                .into_response())
        }
        None => {
            let body = Body::from_stream(ReaderStream::new(file));
            Ok((
                StatusCode::OK,
                [(CONTENT_TYPE, mime), (CONTENT_LENGTH, size.to_string())],
                body,
            )
                .into_response())
        }
    }
}

async fn transfer_finish(
    State(state): State<Arc<ServerState>>,
    Path(poll_id): Path<String>,
) -> Json<StatusReply> {
    if let Some(offer) = state.offer.read().await.as_ref() {
        if offer.accepted_by(&poll_id) {
            tracing::info!("Offer delivered to {}", poll_id);
            offer.set_status(OfferStatus::Finished);
        }
    }

    let mut incoming = state.incoming.write().await;
    if incoming.as_ref().is_some_and(|p| p.request.requestor_id == poll_id) {
        if let Some(push) = incoming.take() {
            tracing::info!(
                "Push from {} finished ({} of {} files)",
                push.request.requestor_name,
                push.received,
                push.request.files.len()
            );
        }
    }

    Json(StatusReply {
        status: PairingStatus::None,
    })
}

async fn cancel_transfer(
    State(state): State<Arc<ServerState>>,
    Path(poll_id): Path<String>,
) -> Json<StatusReply> {
    if let Some(offer) = state.offer.read().await.as_ref() {
        if offer.receiver.as_deref() == Some(poll_id.as_str()) && !offer.status().is_final() {
            tracing::info!("Device {} cancelled the transfer", poll_id);
            offer.set_status(OfferStatus::Cancelled);
        }
    }

    let mut incoming = state.incoming.write().await;
    if incoming.as_ref().is_some_and(|p| p.request.requestor_id == poll_id) {
        if let Some(push) = incoming.take() {
            tracing::info!("{} cancelled the push", push.request.requestor_name);
            push.cancel.cancel();
        }
    }

    Json(StatusReply {
        status: PairingStatus::Cancelled,
    })
}

async fn cancel_pairing(
    State(state): State<Arc<ServerState>>,
    Path(poll_id): Path<String>,
) -> Json<StatusReply> {
    let incoming = state.incoming.read().await;
    if let Some(push) = incoming
        .as_ref()
        .filter(|p| p.request.requestor_id == poll_id && !p.accepted)
    {
        tracing::info!("{} withdrew the request", push.request.requestor_name);
        push.cancel.cancel();
    }

    Json(StatusReply {
        status: PairingStatus::Cancelled,
    })
}

async fn request_connect(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ConnectRequest>,
) -> Result<Json<StatusReply>, ServerError> {
    let request = body.to_pairing_request();
    let cancel = CancellationToken::new();
    {
        let mut incoming = state.incoming.write().await;
        if let Some(push) = incoming.as_ref() {
            if !push.is_abandoned(state.config.push_idle_timeout()) {
                return Err(ServerError::Busy);
            }
            tracing::warn!(
                "Dropping push from {}, nothing received for {:?}",
                push.request.requestor_name,
                push.last_activity.elapsed()
            );
            push.cancel.cancel();
        }
        *incoming = Some(IncomingPush::new(request.clone(), cancel.clone()));
    }
    tracing::info!(
        "{} wants to send {} files ({} bytes)",
        request.requestor_name,
        body.total_files,
        body.total_size
    );

    let decision = tokio::select! {
        accepted = state.decider.decide(&request) => Some(accepted),
        _ = cancel.cancelled() => None,
        _ = tokio::time::sleep(state.config.decision_timeout()) => None,
    };

    let mut incoming = state.incoming.write().await;
    let status = match decision {
        Some(true) => match incoming.as_mut() {
            Some(push) if push.request.requestor_id == request.requestor_id => {
                push.accepted = true;
                push.last_activity = Instant::now();
                PairingStatus::Accepted
            }
            _ => PairingStatus::Cancelled,
        },
        Some(false) => {
            *incoming = None;
            PairingStatus::Declined
        }
        None => {
            *incoming = None;
            PairingStatus::Cancelled
        }
    };
    tracing::info!("Request from {} {}", request.requestor_name, status);

    Ok(Json(StatusReply { status }))
}

async fn upload(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadReply>, ServerError> {
    let sender = headers
        .get(TRANSFER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::BadRequest(format!("missing {}", TRANSFER_ID_HEADER)))?
        .to_string();

    let (from, cancel, _in_flight) = {
        let mut incoming = state.incoming.write().await;
        let push = incoming
            .as_mut()
            .filter(|p| p.accepted && p.request.requestor_id == sender)
            .ok_or(ServerError::Forbidden)?;
        push.last_activity = Instant::now();
        (
            push.request.requestor_name.clone(),
            push.cancel.clone(),
            UploadInFlight::start(&push.uploads),
        )
    };
    let (destination, save_to_gallery) = {
        let identity = state.identity.read().await;
        (identity.destination.clone(), identity.save_to_gallery)
    };

    let mut field = multipart
        .next_field()
        .await?
        .ok_or_else(|| ServerError::BadRequest("empty upload".to_string()))?;
    let name = field
        .file_name()
        .map(str::to_string)
        .ok_or_else(|| ServerError::BadRequest("missing file name".to_string()))?;

    let target = state
        .engine
        .storage()
        .download_target(&destination, &name)
        .await
        .map_err(TransferError::from)?;
    let part = part_path(&target);
    let mut file = tokio::fs::File::create(&part).await?;
    let mut size = 0u64;

    loop {
        let chunk = tokio::select! {
            chunk = field.chunk() => chunk?,
            _ = cancel.cancelled() => {
                drop(file);
                let _ = tokio::fs::remove_file(&part).await;
                return Err(ServerError::Cancelled);
            }
        };
        let Some(chunk) = chunk else {
            break;
        };
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);
    tokio::fs::rename(&part, &target).await?;

    state
        .engine
        .settle(&target, &name, size, &from, &destination, save_to_gallery)
        .await?;

    if let Some(push) = state
        .incoming
        .write()
        .await
        .as_mut()
        .filter(|p| p.request.requestor_id == sender)
    {
        push.received += 1;
        push.last_activity = Instant::now();
        tracing::debug!("Received {}/{} from {}", push.received, push.request.files.len(), from);
    }

    Ok(Json(UploadReply {
        status: "ok".to_string(),
        name,
        size,
    }))
}
