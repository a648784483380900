//! LAN Sharing Module
//!
//! Lets devices on the same subnet find each other and move files directly,
//! over a small HTTP control protocol on a fixed port.

pub mod config;
pub mod discovery;
pub mod identity;
pub mod pairing;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transfer;

pub use config::{DiscoveryConfig, NetworkConfig, PairingConfig, TransferConfig, DEFAULT_CONTROL_PORT};
pub use discovery::DiscoveryScanner;
pub use identity::DeviceIdentity;
pub use pairing::{PairingError, PairingNegotiator, SenderPhase, SendingPortal};
pub use protocol::{ManifestEntry, PairingRequest, PairingStatus, ServerInfo, PROTOCOL_VERSION};
pub use server::{AutoDecision, ConnectionDecider, ControlServer, OfferStatus, PromptDecider};
pub use session::{Outcome, Phase, ReceiverState, TransferSession};
pub use transfer::{DownloadJob, TransferEngine, TransferError};

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::history::HistoryRecorder;
use crate::storage::{PicturesLibrary, StorageResolver};
use session::Event;

/// Coordinates identity, discovery, the control server and both transfer
/// directions for one device
pub struct ShareService {
    /// Configuration
    pub config: NetworkConfig,

    /// Our identity and device settings
    pub identity: Arc<RwLock<DeviceIdentity>>,

    /// Subnet scanner
    pub scanner: Arc<DiscoveryScanner>,

    /// Receiving side of the handshake
    pub negotiator: Arc<PairingNegotiator>,

    /// Sending side of the handshake
    pub portal: Arc<SendingPortal>,

    /// Peer-facing HTTP server
    pub server: ControlServer,

    downloads: Arc<TransferEngine>,
    history: Arc<HistoryRecorder>,
    decider: Arc<dyn ConnectionDecider>,
    shutdown: CancellationToken,
}

impl ShareService {
    /// Create the service, loading (or creating) the device identity
    pub fn new(config: NetworkConfig, decider: Arc<dyn ConnectionDecider>) -> anyhow::Result<Self> {
        let identity = DeviceIdentity::get_or_create(&config.settings_path, identity::local_ipv4())?;
        tracing::info!(
            "Device identity: {} (#{})",
            identity.display_name,
            identity.short_id
        );
        let identity = Arc::new(RwLock::new(identity));

        let history = Arc::new(HistoryRecorder::open(config.history_path.clone())?);
        let storage = Arc::new(StorageResolver::new(
            config.private_dir.clone(),
            config.incoming_dir(),
            Arc::new(PicturesLibrary::default()),
        ));
        let downloads = Arc::new(TransferEngine::new(
            storage.clone(),
            history.clone(),
            config.transfer.clone(),
        ));
        let uploads = Arc::new(TransferEngine::new(storage, history.clone(), config.transfer.clone()));

        let shutdown = CancellationToken::new();
        let scanner = Arc::new(
            DiscoveryScanner::new(config.discovery.clone(), config.control_port)
                .with_shutdown(shutdown.child_token()),
        );

        let negotiator = Arc::new(PairingNegotiator::new(
            Arc::new(RwLock::new(ReceiverState::new(config.transfer.speed_window))),
            identity.clone(),
            scanner.clone(),
            downloads.clone(),
            config.pairing.clone(),
        ));
        let portal = Arc::new(SendingPortal::new(
            identity.clone(),
            uploads,
            config.pairing.clone(),
            config.transfer.speed_window,
        ));
        let server = ControlServer::new(
            identity.clone(),
            downloads.clone(),
            decider.clone(),
            config.pairing.clone(),
        );

        Ok(Self {
            config,
            identity,
            scanner,
            negotiator,
            portal,
            server,
            downloads,
            history,
            decider,
            shutdown,
        })
    }

    /// Bind the control port and start serving peers
    pub async fn start_server(&self) -> anyhow::Result<SocketAddr> {
        let bind = format!("{}:{}", self.config.listen_address, self.config.control_port);
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        let local = listener.local_addr()?;

        let server = self.server.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener, shutdown).await {
                tracing::error!("Control server stopped: {}", e);
            }
        });

        Ok(local)
    }

    /// Start the control server and the receiving loop
    pub async fn start(&self) -> anyhow::Result<JoinHandle<()>> {
        let local = self.start_server().await?;
        tracing::info!("Sharing on {}", local);
        Ok(self.spawn_receiver())
    }

    /// Poll for pairing requests and run accepted downloads until stopped
    pub fn spawn_receiver(&self) -> JoinHandle<()> {
        tokio::spawn(self.receiver_loop().run())
    }

    fn receiver_loop(&self) -> ReceiverLoop {
        ReceiverLoop {
            identity: self.identity.clone(),
            scanner: self.scanner.clone(),
            negotiator: self.negotiator.clone(),
            downloads: self.downloads.clone(),
            decider: self.decider.clone(),
            shutdown: self.shutdown.clone(),
            interval: self.config.pairing.poll_interval(),
            decision: None,
        }
    }

    /// Push files to a peer that decides on the spot
    pub async fn send(&self, target: SocketAddr, files: Vec<PathBuf>) -> Result<Outcome, PairingError> {
        self.portal.connect_and_send(target, files).await
    }

    /// Host files for a peer to pull; `target` limits the offer to one device id
    pub async fn offer(&self, files: Vec<PathBuf>, target: Option<String>) -> anyhow::Result<Vec<ManifestEntry>> {
        Ok(self.server.offer_files(files, target).await?)
    }

    /// One full subnet sweep around our current address
    pub async fn scan_once(&self) -> anyhow::Result<HashSet<Ipv4Addr>> {
        let local_ip = identity::local_ipv4()
            .ok_or_else(|| anyhow::anyhow!("No IPv4 address; not connected to a network?"))?;
        Ok(self.scanner.scan(local_ip).await)
    }

    pub fn history(&self) -> &Arc<HistoryRecorder> {
        &self.history
    }

    /// Stop serving, polling and transferring
    pub async fn stop(&self) {
        tracing::info!("Stopping share service");
        let phase = self.negotiator.state().read().await.phase();
        if matches!(phase, Phase::WaitingTransfer | Phase::Transferring) {
            if let Err(e) = self.negotiator.respond(false).await {
                tracing::warn!("Could not cancel the running transfer: {}", e);
            }
        }
        self.shutdown.cancel();
        self.downloads.cancel().await;
        self.portal.close().await;
    }
}

struct ReceiverLoop {
    identity: Arc<RwLock<DeviceIdentity>>,
    scanner: Arc<DiscoveryScanner>,
    negotiator: Arc<PairingNegotiator>,
    downloads: Arc<TransferEngine>,
    decider: Arc<dyn ConnectionDecider>,
    shutdown: CancellationToken,
    interval: std::time::Duration,
    /// The decider asked about the last adopted request
    decision: Option<JoinHandle<()>>,
}

impl ReceiverLoop {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let phase = self.negotiator.state().read().await.phase();
            match phase {
                Phase::Idle => self.look_for_requests().await,
                Phase::Pending => {
                    self.negotiator.poll_for_requests().await;
                }
                Phase::WaitingTransfer => match self.negotiator.poll_transfer_status().await {
                    Ok(Some(_)) => {
                        if !self.receive().await {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::debug!("Transfer status poll failed: {}", e),
                },
                Phase::Transferring | Phase::Finished(_) => {}
            }
        }
        if let Some(decision) = self.decision.take() {
            decision.abort();
        }
        tracing::debug!("Receiver loop stopped");
    }

    async fn look_for_requests(&mut self) {
        let local_ip = identity::local_ipv4();
        {
            let mut identity = self.identity.write().await;
            if identity.refresh_short_id(local_ip) {
                tracing::info!("Short id is now {}", identity.short_id);
                if let Err(e) = identity.save() {
                    tracing::warn!("Could not persist device settings: {}", e);
                }
            }
        }
        if let Some(local_ip) = local_ip {
            self.scanner.tick(local_ip).await;
        }

        // one question at a time; a new request waits until the last answer is in
        if self.decision.as_ref().is_some_and(|d| !d.is_finished()) {
            return;
        }

        if let Some(request) = self.negotiator.poll_for_requests().await {
            let negotiator = self.negotiator.clone();
            let decider = self.decider.clone();
            self.decision = Some(tokio::spawn(async move {
                let accepted = decider.decide(&request).await;
                if let Err(e) = negotiator.respond_to(&request, accepted).await {
                    tracing::warn!("Could not answer {}: {}", request.requestor_name, e);
                }
            }));
        }
    }

    /// Run the accepted session's downloads; false when shutting down
    async fn receive(&self) -> bool {
        let job = {
            let state = self.negotiator.state().read().await;
            let identity = self.identity.read().await;
            let Some(peer) = state.request().and_then(|r| r.peer_address) else {
                drop(state);
                self.negotiator.reset().await;
                return true;
            };
            DownloadJob {
                peer,
                device_id: identity.short_id.clone(),
                destination: identity.destination.clone(),
                save_to_gallery: identity.save_to_gallery,
            }
        };

        let result = tokio::select! {
            result = self.downloads.run_downloads(self.negotiator.state(), &job) => result,
            _ = self.shutdown.cancelled() => return false,
        };

        match result {
            Ok(outcome) => {
                let mut state = self.negotiator.state().write().await;
                if let Err(e) = state.apply(Event::Completed(outcome)) {
                    tracing::warn!("{}", e);
                }
                tracing::info!("Session with {} finished: {:?}", job.peer, outcome);
            }
            Err(e) if e.is_cancellation() => tracing::info!("Transfer from {} cancelled", job.peer),
            Err(e) => tracing::error!("Transfer from {} failed: {}", job.peer, e),
        }
        self.negotiator.reset().await;
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::net::SocketAddr;

    use axum::Router;

    /// Serve `router` on `addr` in the background and return the bound address
    pub async fn serve_on(addr: &str, router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let local = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::PairingPoll;
    use axum::extract::State;
    use axum::routing::get;
    use axum::{Json, Router};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    fn request() -> PairingRequest {
        PairingRequest {
            requestor_id: "012".to_string(),
            requestor_name: "Calm Fox".to_string(),
            requestor_os: "linux".to_string(),
            requestor_platform: "desk".to_string(),
            files: vec![ManifestEntry {
                name: "a.jpg".to_string(),
                size: 1000,
                mime: "image/jpeg".to_string(),
            }],
            peer_address: None,
        }
    }

    /// Always has a request pending and counts cancelled transfers
    fn hub(cancels: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/check-pairing-requests/:id",
                get(|| async {
                    Json(PairingPoll {
                        status: PairingStatus::Pending,
                        request: Some(request()),
                    })
                }),
            )
            .route(
                "/cancel-transfer/:id",
                get(|State(cancels): State<Arc<AtomicUsize>>| async move {
                    cancels.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({ "status": "cancelled" }))
                }),
            )
            .with_state(cancels)
    }

    /// Never makes up its mind
    #[derive(Default)]
    struct Undecided(AtomicUsize);

    impl ConnectionDecider for Undecided {
        fn decide<'a>(&'a self, _request: &'a PairingRequest) -> BoxFuture<'a, bool> {
            self.0.fetch_add(1, Ordering::SeqCst);
            futures::future::pending().boxed()
        }
    }

    async fn service_for(root: &std::path::Path, hub: SocketAddr, decider: Arc<dyn ConnectionDecider>) -> ShareService {
        let mut config = NetworkConfig::rooted_at(root);
        config.control_port = hub.port();
        config.discovery.rescan_probability = 0.0;
        let service = ShareService::new(config, decider).unwrap();
        service.scanner.mark_seen(Ipv4Addr::LOCALHOST).await;
        service
    }

    #[tokio::test]
    async fn test_service_persists_identity() {
        let temp = tempdir().unwrap();
        let mut config = NetworkConfig::rooted_at(temp.path());
        config.control_port = 0;
        config.listen_address = "127.0.0.1".to_string();

        let name = {
            let service = ShareService::new(config.clone(), Arc::new(AutoDecision(false))).unwrap();
            let local = service.start_server().await.unwrap();
            assert_ne!(local.port(), 0);
            service.stop().await;
            let name = service.identity.read().await.display_name.clone();
            name
        };

        assert!(temp.path().join("device.toml").exists());
        let again = ShareService::new(config, Arc::new(AutoDecision(false))).unwrap();
        assert_eq!(again.identity.read().await.display_name, name);
        assert!(again.history().is_empty().await);
    }

    #[tokio::test]
    async fn test_one_decision_at_a_time() {
        let temp = tempdir().unwrap();
        let peer = testing::serve_on("127.0.0.1:0", hub(Arc::new(AtomicUsize::new(0)))).await;
        let decider = Arc::new(Undecided::default());
        let service = service_for(temp.path(), peer, decider.clone()).await;
        let mut receiver = service.receiver_loop();

        receiver.look_for_requests().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.negotiator.state().read().await.phase(), Phase::Pending);
        assert_eq!(decider.0.load(Ordering::SeqCst), 1);

        // the request goes away while the question is still open
        service.negotiator.reset().await;
        receiver.look_for_requests().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(service.negotiator.state().read().await.phase(), Phase::Idle);
        assert_eq!(decider.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_running_transfer() {
        let temp = tempdir().unwrap();
        let cancels = Arc::new(AtomicUsize::new(0));
        let peer = testing::serve_on("127.0.0.1:0", hub(cancels.clone())).await;
        let service = service_for(temp.path(), peer, Arc::new(AutoDecision(false))).await;

        {
            let mut state = service.negotiator.state().write().await;
            let request = PairingRequest {
                peer_address: Some(peer),
                ..request()
            };
            let files = request.files.clone();
            state.apply(Event::RequestReceived(request)).unwrap();
            state.apply(Event::Accepted).unwrap();
            state.apply(Event::ManifestReady(files)).unwrap();
            assert_eq!(state.phase(), Phase::Transferring);
        }

        service.stop().await;

        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_eq!(service.negotiator.state().read().await.phase(), Phase::Idle);
    }
}
