//! Device Identity Management
//!
//! Each device has a human-readable display name that is generated once and
//! persisted, and a short numeric id derived from its current IPv4 address.
//! The short id is re-derived whenever the address may have changed, so
//! peers must tolerate it changing between sessions.

use std::net::{Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::storage::Destination;

/// Short id used when the device has no IPv4 address
pub const FALLBACK_SHORT_ID: &str = "000";

const ADJECTIVES: &[&str] = &[
    "Swift", "Calm", "Bold", "Brave", "Bright", "Clever", "Gentle", "Happy", "Lucky", "Mellow",
    "Nimble", "Quiet", "Rapid", "Silent", "Sunny", "Witty",
];

const ANIMALS: &[&str] = &[
    "Otter", "Falcon", "Panda", "Fox", "Heron", "Koala", "Lynx", "Marten", "Owl", "Puffin",
    "Raven", "Seal", "Tiger", "Walrus", "Wombat", "Yak",
];

/// A device's identity plus the locally persisted settings that travel with it
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Human-readable name shown to peers
    pub display_name: String,

    /// Short numeric id, the last octet of the current IPv4 address
    #[serde(default = "fallback_short_id")]
    pub short_id: String,

    /// Where received files end up
    #[serde(default)]
    pub destination: Destination,

    /// Also copy received media into the picture library
    #[serde(default = "default_true")]
    pub save_to_gallery: bool,

    /// Where this identity is persisted
    #[serde(skip)]
    path: Option<PathBuf>,
}

fn fallback_short_id() -> String {
    FALLBACK_SHORT_ID.to_string()
}

fn default_true() -> bool {
    true
}

impl DeviceIdentity {
    /// Generate a fresh, unpersisted identity
    pub fn generate(local_ip: Option<Ipv4Addr>) -> Self {
        Self {
            display_name: random_display_name(),
            short_id: short_id_for(local_ip),
            destination: Destination::default(),
            save_to_gallery: true,
            path: None,
        }
    }

    /// Load the identity from `path`, creating and persisting it on first use
    pub fn get_or_create(path: &Path, local_ip: Option<Ipv4Addr>) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let mut identity: DeviceIdentity = toml::from_str(&content)?;
            identity.path = Some(path.to_path_buf());

            let mut dirty = false;
            if identity.display_name.trim().is_empty() {
                identity.display_name = random_display_name();
                dirty = true;
            }
            if identity.refresh_short_id(local_ip) {
                dirty = true;
            }
            if dirty {
                identity.save()?;
            }

            Ok(identity)
        } else {
            let mut identity = Self::generate(local_ip);
            identity.path = Some(path.to_path_buf());
            identity.save()?;

            tracing::info!(
                "Generated new device identity: {} ({})",
                identity.display_name,
                identity.short_id
            );
            Ok(identity)
        }
    }

    /// Persist to the file this identity was loaded from (no-op when unbacked)
    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Re-derive the short id from the current address. Returns true if it changed.
    pub fn refresh_short_id(&mut self, local_ip: Option<Ipv4Addr>) -> bool {
        let short_id = short_id_for(local_ip);
        if short_id == self.short_id {
            return false;
        }

        tracing::info!("Short id changed: {} -> {}", self.short_id, short_id);
        self.short_id = short_id;
        true
    }

    /// Pick a new random display name and persist it
    pub fn regenerate_name(&mut self) -> anyhow::Result<()> {
        self.display_name = random_display_name();
        self.save()
    }

    pub fn set_display_name(&mut self, name: &str) -> anyhow::Result<()> {
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("Display name cannot be empty");
        }
        self.display_name = name.to_string();
        self.save()
    }

    pub fn set_destination(&mut self, destination: Destination) -> anyhow::Result<()> {
        self.destination = destination;
        self.save()
    }

    pub fn set_save_to_gallery(&mut self, enabled: bool) -> anyhow::Result<()> {
        self.save_to_gallery = enabled;
        self.save()
    }

    /// Get a short display string
    pub fn display_short(&self) -> String {
        format!("{} (#{})", self.display_name, self.short_id)
    }
}

/// Derive the short id from an IPv4 address
pub fn short_id_for(local_ip: Option<Ipv4Addr>) -> String {
    match local_ip {
        Some(ip) => format!("{:03}", ip.octets()[3]),
        None => fallback_short_id(),
    }
}

/// Random two-word adjective + animal name
pub fn random_display_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Quiet");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("Otter");
    format!("{} {}", adjective, animal)
}

/// The outward-facing IPv4 address of this machine.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Human-readable platform name reported to peers
pub fn platform_name() -> String {
    std::env::consts::OS.to_string()
}

/// Machine brand/host reported to peers
pub fn brand_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
