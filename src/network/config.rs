//! Network Configuration
//!
//! Configuration for the control server, discovery, pairing and transfers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Fixed control port every peer listens on
pub const DEFAULT_CONTROL_PORT: u16 = 3030;

/// Main network configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port the control server listens on and peers are probed on
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Address to bind to (0.0.0.0 for all interfaces)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Path to the device settings file (identity, destination, gallery toggle)
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,

    /// Path to the transfer history file
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,

    /// App-private storage used for staging and as the placement fallback
    #[serde(default = "default_private_dir")]
    pub private_dir: PathBuf,

    /// Discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Pairing configuration
    #[serde(default)]
    pub pairing: PairingConfig,

    /// Transfer configuration
    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanportal")
        .join("device.toml")
}

fn default_history_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanportal")
        .join("history.json")
}

fn default_private_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanportal")
        .join("documents")
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            control_port: default_control_port(),
            listen_address: default_listen_address(),
            settings_path: default_settings_path(),
            history_path: default_history_path(),
            private_dir: default_private_dir(),
            discovery: DiscoveryConfig::default(),
            pairing: PairingConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Configuration rooted in a single directory, used by tests and portable installs
    pub fn rooted_at(root: &std::path::Path) -> Self {
        Self {
            settings_path: root.join("device.toml"),
            history_path: root.join("history.json"),
            private_dir: root.join("documents"),
            ..Default::default()
        }
    }

    /// Staging area for downloads that are placed somewhere else afterwards
    pub fn incoming_dir(&self) -> PathBuf {
        self.private_dir.join(".incoming")
    }
}

/// Discovery configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Per-probe timeout (milliseconds)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Number of probes in flight at once
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Chance that a polling tick re-sweeps the subnet when peers are already known
    #[serde(default = "default_rescan_probability")]
    pub rescan_probability: f64,

    /// How long a peer stays in the set without answering a sweep (seconds)
    #[serde(default = "default_peer_ttl")]
    pub peer_ttl_secs: u64,
}

fn default_probe_timeout() -> u64 {
    400
}

fn default_batch_size() -> usize {
    50
}

fn default_rescan_probability() -> f64 {
    0.3
}

fn default_peer_ttl() -> u64 {
    120
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout(),
            batch_size: default_batch_size(),
            rescan_probability: default_rescan_probability(),
            peer_ttl_secs: default_peer_ttl(),
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_ttl_secs)
    }
}

/// Pairing configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Interval of the request and transfer-status polls (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Timeout for a single status poll against a peer (milliseconds)
    #[serde(default = "default_status_timeout")]
    pub status_timeout_ms: u64,

    /// How long an incoming connect request waits for a local decision (seconds)
    #[serde(default = "default_decision_timeout")]
    pub decision_timeout_secs: u64,

    /// An accepted push with no upload for this long no longer blocks other senders (milliseconds)
    #[serde(default = "default_push_idle_timeout")]
    pub push_idle_timeout_ms: u64,
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_status_timeout() -> u64 {
    1000
}

fn default_decision_timeout() -> u64 {
    120
}

fn default_push_idle_timeout() -> u64 {
    30_000
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            status_timeout_ms: default_status_timeout(),
            decision_timeout_secs: default_decision_timeout(),
            push_idle_timeout_ms: default_push_idle_timeout(),
        }
    }
}

impl PairingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }

    pub fn push_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.push_idle_timeout_ms)
    }
}

/// Transfer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Media files at or above this size are not copied into the gallery (bytes)
    #[serde(default = "default_gallery_max_bytes")]
    pub gallery_max_bytes: u64,

    /// Number of per-second samples in the speed moving average
    #[serde(default = "default_speed_window")]
    pub speed_window: usize,

    /// File I/O buffer size
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_gallery_max_bytes() -> u64 {
    50 * 1024 * 1024 // 50MB
}

fn default_speed_window() -> usize {
    3
}

fn default_buffer_size() -> usize {
    64 * 1024 // 64KB
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            gallery_max_bytes: default_gallery_max_bytes(),
            speed_window: default_speed_window(),
            buffer_size: default_buffer_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol() {
        let config = NetworkConfig::default();
        assert_eq!(config.control_port, 3030);
        assert_eq!(config.discovery.probe_timeout(), Duration::from_millis(400));
        assert_eq!(config.discovery.batch_size, 50);
        assert_eq!(config.pairing.status_timeout(), Duration::from_secs(1));
        assert_eq!(config.pairing.push_idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.transfer.speed_window, 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: NetworkConfig = toml::from_str(
            r#"
            control_port = 4040

            [discovery]
            batch_size = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.control_port, 4040);
        assert_eq!(config.discovery.batch_size, 10);
        assert_eq!(config.discovery.probe_timeout_ms, 400);
        assert_eq!(config.pairing.poll_interval_ms, 1000);
    }
}
