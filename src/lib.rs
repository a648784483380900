//! lanportal - LAN file sharing library
//!
//! Peer discovery on the local subnet, a polled pairing handshake and
//! resumable file transfers over a small HTTP control protocol.

pub mod history;
pub mod network;
pub mod storage;

pub use history::{HistoryEntry, HistoryRecorder};
pub use network::{
    AutoDecision, ConnectionDecider, ControlServer, DeviceIdentity, DiscoveryScanner, NetworkConfig,
    Outcome, PairingNegotiator, PromptDecider, SendingPortal, ShareService, TransferEngine,
};
pub use storage::{Destination, StorageError, StorageResolver};

/// Build number from the BUILD file
pub const BUILD_NUMBER: &str = env!("LANPORTAL_BUILD_NUMBER");

/// Full version string including build number
pub fn full_version() -> String {
    format!("{} (build {})", env!("CARGO_PKG_VERSION"), BUILD_NUMBER)
}
