//! Pairing handshake
//!
//! Receiving side: [`PairingNegotiator`] polls discovered peers for a pairing
//! request addressed to us, then accepts or declines it and waits for the
//! peer to publish its manifest. Sending side: [`SendingPortal`] asks a peer
//! to accept a push and, once accepted, hands the files to the transfer
//! engine.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::config::PairingConfig;
use super::discovery::DiscoveryScanner;
use super::identity::DeviceIdentity;
use super::protocol::{
    device_url, peer_url, routes, ConnectRequest, ManifestEntry, PairingPoll, PairingRequest,
    PairingStatus, ReadyStatus, RespondToConnection, StatusReply, TransferStatusReply,
};
use super::session::{Event, Outcome, Phase, ReceiverState, SessionError, SessionHolder, TransferSession};
use super::transfer::{build_manifest, TransferEngine, TransferError, UploadJob};

#[derive(Error, Debug)]
pub enum PairingError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Peer answered {0}")]
    Rejected(StatusCode),

    #[error("Connection {0} by peer")]
    Refused(PairingStatus),

    #[error("Pairing request has no peer address")]
    NoPeer,

    #[error("Aborted")]
    Aborted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Receiving side of the handshake
pub struct PairingNegotiator {
    client: reqwest::Client,
    state: Arc<RwLock<ReceiverState>>,
    identity: Arc<RwLock<DeviceIdentity>>,
    scanner: Arc<DiscoveryScanner>,
    engine: Arc<TransferEngine>,
    config: PairingConfig,
}

impl PairingNegotiator {
    pub fn new(
        state: Arc<RwLock<ReceiverState>>,
        identity: Arc<RwLock<DeviceIdentity>>,
        scanner: Arc<DiscoveryScanner>,
        engine: Arc<TransferEngine>,
        config: PairingConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_default();

        Self {
            client,
            state,
            identity,
            scanner,
            engine,
            config,
        }
    }

    pub fn state(&self) -> &Arc<RwLock<ReceiverState>> {
        &self.state
    }

    async fn device_id(&self) -> String {
        self.identity.read().await.short_id.clone()
    }

    /// One poll tick. Returns a request when one was newly adopted.
    pub async fn poll_for_requests(&self) -> Option<PairingRequest> {
        let device_id = self.device_id().await;
        let (phase, current) = {
            let state = self.state.read().await;
            (state.phase(), state.request().cloned())
        };

        match (phase, current) {
            (Phase::Pending, Some(request)) => {
                self.recheck(&request, &device_id).await;
                None
            }
            (Phase::Idle, _) => self.find_request(&device_id).await,
            _ => None,
        }
    }

    /// Drop a pending request the peer no longer reports
    async fn recheck(&self, request: &PairingRequest, device_id: &str) {
        let Some(peer) = request.peer_address else {
            return;
        };

        let poll = match self.check(peer, device_id).await {
            Ok(poll) => poll,
            Err(e) => {
                tracing::debug!("Pairing re-check on {} failed: {}", peer, e);
                return;
            }
        };
        if poll.status == PairingStatus::Pending {
            return;
        }

        let mut state = self.state.write().await;
        let unchanged = state.phase() == Phase::Pending
            && state.request().map(|r| r.requestor_id.as_str()) == Some(request.requestor_id.as_str());
        if unchanged {
            tracing::info!("Pairing request from {} is now {}", request.requestor_name, poll.status);
            let _ = state.apply(Event::Reset);
        }
    }

    async fn find_request(&self, device_id: &str) -> Option<PairingRequest> {
        for host in self.scanner.peers().await {
            let peer = self.scanner.endpoint(host);
            let poll = match self.check(peer, device_id).await {
                Ok(poll) => poll,
                Err(e) => {
                    tracing::debug!("Pairing poll on {} failed: {}", peer, e);
                    continue;
                }
            };
            self.scanner.mark_seen(host).await;

            if poll.status != PairingStatus::Pending {
                continue;
            }
            let Some(mut request) = poll.request else {
                continue;
            };
            request.peer_address = Some(peer);

            let mut state = self.state.write().await;
            if state.apply(Event::RequestReceived(request.clone())).is_ok() {
                tracing::info!(
                    "Pairing request from {} ({} files, {} bytes)",
                    request.requestor_name,
                    request.files.len(),
                    request.total_size()
                );
                return Some(request);
            }
            return None;
        }
        None
    }

    async fn check(&self, peer: SocketAddr, device_id: &str) -> Result<PairingPoll, PairingError> {
        let response = self
            .client
            .get(device_url(peer, routes::CHECK_PAIRING, device_id))
            .timeout(self.config.status_timeout())
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(PairingPoll {
                status: PairingStatus::None,
                request: None,
            }),
            status if status.is_success() => Ok(response.json().await?),
            status => Err(PairingError::Rejected(status)),
        }
    }

    /// Accept or decline the current request.
    ///
    /// Declining always returns the negotiator to idle, and does nothing when
    /// there is no request to decline.
    pub async fn respond(&self, accepted: bool) -> Result<(), PairingError> {
        self.answer(None, accepted).await
    }

    /// Like [`respond`](Self::respond), but only if `request` is still the
    /// one being negotiated; an answer for a request that has since been
    /// withdrawn or replaced is dropped
    pub async fn respond_to(&self, request: &PairingRequest, accepted: bool) -> Result<(), PairingError> {
        self.answer(Some(request), accepted).await
    }

    async fn answer(&self, expected: Option<&PairingRequest>, accepted: bool) -> Result<(), PairingError> {
        let device_id = self.device_id().await;
        let (phase, request) = {
            let state = self.state.read().await;
            (state.phase(), state.request().cloned())
        };
        let Some(request) = request else {
            tracing::debug!("No pairing request to respond to");
            return Ok(());
        };
        if let Some(expected) = expected {
            if !same_request(expected, &request) {
                tracing::info!(
                    "Ignoring answer for {}, no longer the current request",
                    expected.requestor_name
                );
                return Ok(());
            }
        }
        let Some(peer) = request.peer_address else {
            self.state.write().await.apply(Event::Reset)?;
            return Err(PairingError::NoPeer);
        };

        if !accepted {
            match phase {
                Phase::Transferring => {
                    self.engine.cancel().await;
                    self.best_effort_get(device_url(peer, routes::CANCEL_TRANSFER, &device_id)).await;
                }
                Phase::Pending => {
                    if let Err(e) = self.send_response(peer, &device_id, false).await {
                        tracing::warn!("Could not deliver decline to {}: {}", peer, e);
                    }
                }
                // the peer already holds our acceptance
                Phase::WaitingTransfer => {
                    self.best_effort_get(device_url(peer, routes::CANCEL_TRANSFER, &device_id)).await;
                }
                Phase::Idle | Phase::Finished(_) => {}
            }
            self.state.write().await.apply(Event::Reset)?;
            tracing::info!("Declined request from {}", request.requestor_name);
            return Ok(());
        }

        if phase != Phase::Pending {
            return Err(SessionError::InvalidTransition {
                from: phase,
                event: "accepted",
            }
            .into());
        }

        let delivered = self.send_response(peer, &device_id, true).await;
        let mut state = self.state.write().await;
        match delivered {
            Ok(()) => {
                state.apply(Event::Accepted)?;
                tracing::info!("Accepted request from {}", request.requestor_name);
                Ok(())
            }
            Err(e) => {
                state.apply(Event::Reset)?;
                Err(e)
            }
        }
    }

    async fn send_response(&self, peer: SocketAddr, device_id: &str, accepted: bool) -> Result<(), PairingError> {
        let body = RespondToConnection {
            device_id: device_id.to_string(),
            accepted,
        };
        let response = self
            .client
            .post(peer_url(peer, routes::RESPOND_TO_CONNECTION))
            .json(&body)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(PairingError::Rejected(response.status()))
        }
    }

    async fn best_effort_get(&self, url: String) {
        let result = self
            .client
            .get(&url)
            .timeout(self.config.status_timeout())
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!("{} failed: {}", url, e);
        }
    }

    /// While waiting for the transfer, ask the peer whether its manifest is
    /// ready; a ready manifest moves the session into transferring
    pub async fn poll_transfer_status(&self) -> Result<Option<Vec<ManifestEntry>>, PairingError> {
        let (phase, peer) = {
            let state = self.state.read().await;
            (state.phase(), state.request().and_then(|r| r.peer_address))
        };
        if phase != Phase::WaitingTransfer {
            return Ok(None);
        }
        let peer = peer.ok_or(PairingError::NoPeer)?;
        let device_id = self.device_id().await;

        let response = self
            .client
            .get(device_url(peer, routes::TRANSFER_STATUS, &device_id))
            .timeout(self.config.status_timeout())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PairingError::Rejected(response.status()));
        }

        let reply: TransferStatusReply = response.json().await?;
        match (reply.status, reply.files) {
            (ReadyStatus::Ready, Some(files)) => {
                self.state.write().await.apply(Event::ManifestReady(files.clone()))?;
                Ok(Some(files))
            }
            _ => Ok(None),
        }
    }

    /// Clear whatever is left of the last session
    pub async fn reset(&self) {
        let _ = self.state.write().await.apply(Event::Reset);
    }
}

fn same_request(a: &PairingRequest, b: &PairingRequest) -> bool {
    a.requestor_id == b.requestor_id && a.peer_address == b.peer_address
}

/// Phase of the sending side
#[derive(Clone, Debug, PartialEq)]
pub enum SenderPhase {
    Idle,
    /// Waiting for the peer to decide
    Connecting,
    Sending,
    Refused(PairingStatus),
    Finished(Outcome),
    Failed(String),
}

/// The sending side's owned state
pub struct SenderState {
    pub phase: SenderPhase,
    session: Option<TransferSession>,
}

impl SenderState {
    fn new() -> Self {
        Self {
            phase: SenderPhase::Idle,
            session: None,
        }
    }
}

impl SessionHolder for SenderState {
    fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    fn session_mut(&mut self) -> Option<&mut TransferSession> {
        self.session.as_mut()
    }
}

/// Sending side of the handshake
pub struct SendingPortal {
    client: reqwest::Client,
    state: Arc<RwLock<SenderState>>,
    identity: Arc<RwLock<DeviceIdentity>>,
    engine: Arc<TransferEngine>,
    config: PairingConfig,
    speed_window: usize,
    abort: Mutex<CancellationToken>,
    target: Mutex<Option<SocketAddr>>,
}

impl SendingPortal {
    pub fn new(
        identity: Arc<RwLock<DeviceIdentity>>,
        engine: Arc<TransferEngine>,
        config: PairingConfig,
        speed_window: usize,
    ) -> Self {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_default();

        Self {
            client,
            state: Arc::new(RwLock::new(SenderState::new())),
            identity,
            engine,
            config,
            speed_window,
            abort: Mutex::new(CancellationToken::new()),
            target: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<RwLock<SenderState>> {
        &self.state
    }

    async fn set_phase(&self, phase: SenderPhase) {
        self.state.write().await.phase = phase;
    }

    /// Ask `target` to accept `files` and send them once it does
    pub async fn connect_and_send(&self, target: SocketAddr, files: Vec<PathBuf>) -> Result<Outcome, PairingError> {
        let manifest = build_manifest(&files).await?;
        let identity = self.identity.read().await.clone();
        let abort = self.abort.lock().await.clone();
        *self.target.lock().await = Some(target);

        let request = ConnectRequest {
            device_id: identity.short_id.clone(),
            name: identity.display_name.clone(),
            platform: super::identity::platform_name(),
            brand: super::identity::brand_name(),
            total_files: manifest.len(),
            total_size: manifest.iter().map(|f| f.size).sum(),
            files: manifest.clone(),
        };

        self.set_phase(SenderPhase::Connecting).await;
        tracing::info!("Asking {} to accept {} files", target, manifest.len());

        let reply = tokio::select! {
            reply = self.request_connect(target, &request) => reply,
            _ = abort.cancelled() => {
                self.set_phase(SenderPhase::Idle).await;
                return Err(PairingError::Aborted);
            }
        };
        let status = match reply {
            Ok(status) => status,
            Err(e) => {
                tracing::error!("Could not connect to {}: {}", target, e);
                self.set_phase(SenderPhase::Failed(e.to_string())).await;
                return Err(e);
            }
        };

        if status != PairingStatus::Accepted {
            tracing::info!("{} {} the transfer", target, status);
            self.set_phase(SenderPhase::Refused(status)).await;
            return Err(PairingError::Refused(status));
        }

        {
            let mut state = self.state.write().await;
            state.session = Some(TransferSession::new(&manifest, target.to_string(), self.speed_window));
            state.phase = SenderPhase::Sending;
        }

        let job = UploadJob {
            peer: target,
            device_id: identity.short_id,
            files,
        };
        match self.engine.run_uploads(&self.state, &job).await {
            Ok(outcome) => {
                self.set_phase(SenderPhase::Finished(outcome)).await;
                Ok(outcome)
            }
            Err(e) if e.is_cancellation() => {
                self.set_phase(SenderPhase::Idle).await;
                Err(PairingError::Aborted)
            }
            Err(e) => {
                tracing::error!("Sending to {} failed: {}", target, e);
                self.set_phase(SenderPhase::Failed(e.to_string())).await;
                Err(e.into())
            }
        }
    }

    async fn request_connect(&self, target: SocketAddr, request: &ConnectRequest) -> Result<PairingStatus, PairingError> {
        let response = self
            .client
            .post(peer_url(target, routes::REQUEST_CONNECT))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PairingError::Rejected(response.status()));
        }
        let reply: StatusReply = response.json().await?;
        Ok(reply.status)
    }

    /// Abort whatever is in flight, tell the peer, and return to idle
    pub async fn close(&self) {
        let phase = self.state.read().await.phase.clone();
        {
            let mut abort = self.abort.lock().await;
            abort.cancel();
            *abort = CancellationToken::new();
        }
        self.engine.cancel().await;

        let device_id = self.identity.read().await.short_id.clone();
        let target = *self.target.lock().await;
        if let Some(target) = target {
            let route = match phase {
                SenderPhase::Connecting => Some(routes::CANCEL_PAIRING),
                SenderPhase::Sending => Some(routes::CANCEL_TRANSFER),
                _ => None,
            };
            if let Some(route) = route {
                let result = self
                    .client
                    .get(device_url(target, route, &device_id))
                    .timeout(self.config.status_timeout())
                    .send()
                    .await;
                if let Err(e) = result {
                    tracing::warn!("Could not notify {} of cancellation: {}", target, e);
                }
            }
        }

        let mut state = self.state.write().await;
        state.phase = SenderPhase::Idle;
        state.session = None;
    }
}
