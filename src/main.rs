//! lanportal - LAN file sharing
//!
//! Runs the control server and the receiving loop, or performs one-shot
//! scans, pushes and offers.
//!
//! Usage:
//!   lanportal                              # Share: serve peers, receive files
//!   lanportal --scan                       # List peers on this subnet
//!   lanportal --send 192.168.1.20 a.jpg    # Push files to a peer
//!   lanportal --offer a.jpg --to 020       # Host files for a peer to pull
//!   lanportal --init                       # Generate default config file

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lanportal::network::session::SessionHolder;
use lanportal::network::{OfferStatus, SenderPhase};
use lanportal::{
    full_version, AutoDecision, ConnectionDecider, Destination, NetworkConfig, PromptDecider,
    ShareService,
};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "lanportal")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Share files with devices on the same local network")]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Generate a default configuration file
    #[arg(long)]
    init: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Control port (default: 3030)
    #[arg(long)]
    port: Option<u16>,

    /// Set the display name shown to peers
    #[arg(long)]
    name: Option<String>,

    /// Pick a new random display name
    #[arg(long)]
    regenerate_name: bool,

    /// Directory received files are saved to
    #[arg(long)]
    dest: Option<PathBuf>,

    /// Treat --dest as a document-tree grant instead of a plain directory
    #[arg(long, requires = "dest")]
    tree: bool,

    /// Copy received photos and videos into the pictures library
    #[arg(long)]
    gallery: Option<bool>,

    /// Accept every incoming request without asking
    #[arg(long)]
    auto_accept: bool,

    /// Scan the local subnet for peers and exit
    #[arg(long)]
    scan: bool,

    /// Push FILES to the peer at ADDR (host or host:port)
    #[arg(long, value_name = "ADDR", conflicts_with_all = ["offer", "scan"])]
    send: Option<String>,

    /// Host FILES for a peer to pull
    #[arg(long, conflicts_with = "scan")]
    offer: bool,

    /// Only offer to the device with this short id
    #[arg(long, value_name = "ID", requires = "offer")]
    to: Option<String>,

    /// Print the transfer history and exit
    #[arg(long)]
    history: bool,

    /// Files to send or offer
    files: Vec<PathBuf>,
}

/// Configuration for lanportal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Config {
    /// Logging settings
    #[serde(default)]
    logging: LoggingConfig,

    /// Network settings
    #[serde(default)]
    network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    level: String,

    /// Log to file
    #[serde(default)]
    file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    fn load(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    fn save(&self, path: &PathBuf) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    if let Some(config_path) = &args.config {
        return Config::load(config_path);
    }

    let default_paths = vec![
        PathBuf::from("lanportal.toml"),
        dirs::config_dir()
            .map(|p| p.join("lanportal").join("config.toml"))
            .unwrap_or_default(),
    ];

    for path in default_paths {
        if path.exists() {
            match Config::load(&path) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    eprintln!(
                        "Warning: Failed to load config from {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }
    }

    Ok(Config::default())
}

fn init_logging(config: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let log_level = if verbose { "debug" } else { &config.level };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if let Some(ref log_path) = config.file {
        use tracing_subscriber::fmt::writer::MakeWriterExt;

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        let file_writer = std::sync::Mutex::new(file);

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr.and(file_writer))
                    .with_ansi(false),
            )
            .init();

        eprintln!("Logging to: {}", log_path.display());
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

/// `host` or `host:port`, defaulting to the control port
fn parse_peer(value: &str, port: u16) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: std::net::IpAddr = value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid peer address: {}", value))?;
    Ok(SocketAddr::new(ip, port))
}

/// Apply settings changes given on the command line
async fn apply_settings(service: &ShareService, args: &Args) -> anyhow::Result<()> {
    let mut identity = service.identity.write().await;

    if args.regenerate_name {
        identity.regenerate_name()?;
        println!("Display name is now: {}", identity.display_name);
    }
    if let Some(name) = &args.name {
        identity.set_display_name(name)?;
        println!("Display name is now: {}", identity.display_name);
    }
    if let Some(path) = &args.dest {
        let destination = if args.tree {
            Destination::Tree { root: path.clone() }
        } else {
            Destination::Path { path: path.clone() }
        };
        identity.set_destination(destination)?;
        println!("Saving received files to: {}", path.display());
    }
    if let Some(enabled) = args.gallery {
        identity.set_save_to_gallery(enabled)?;
        println!("Gallery copies: {}", if enabled { "on" } else { "off" });
    }

    Ok(())
}

async fn print_history(service: &ShareService) {
    let entries = service.history().entries().await;
    if entries.is_empty() {
        println!("No transfers yet.");
        return;
    }
    for entry in entries {
        println!(
            "{}  {:>12} bytes  {}  (from {})",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.size,
            entry.name,
            entry.from
        );
    }
}

async fn run_scan(service: &ShareService) -> anyhow::Result<()> {
    println!("Scanning...");
    let mut peers: Vec<_> = service.scan_once().await?.into_iter().collect();
    peers.sort();

    if peers.is_empty() {
        println!("No peers found.");
    }
    for host in peers {
        match service.scanner.server_info(host).await {
            Some(info) => println!("  {:<15}  #{}  {} ({})", host, info.device_id, info.name, info.platform),
            None => println!("  {:<15}", host),
        }
    }
    Ok(())
}

/// Log sender progress once a second until the session ends
fn spawn_send_progress(service: &ShareService) -> tokio::task::JoinHandle<()> {
    let state = service.portal.state().clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let state = state.read().await;
            if let Some(session) = state.session() {
                if session.is_transferring() {
                    tracing::info!(
                        "{:5.1}%  {}  {:.0} KB/s  {}s",
                        session.progress * 100.0,
                        session.current_filename,
                        session.speed / 1024.0,
                        session.elapsed_secs
                    );
                }
            }
            if matches!(state.phase, SenderPhase::Finished(_) | SenderPhase::Failed(_) | SenderPhase::Refused(_)) {
                break;
            }
        }
    })
}

async fn run_send(service: &ShareService, target: SocketAddr, files: Vec<PathBuf>) -> anyhow::Result<()> {
    let progress = spawn_send_progress(service);

    let result = tokio::select! {
        result = service.send(target, files) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    progress.abort();

    match result {
        Some(Ok(outcome)) => println!("Transfer {:?}", outcome),
        Some(Err(e)) => {
            eprintln!("Send failed: {}", e);
            return Err(e.into());
        }
        None => {
            tracing::info!("Shutdown signal received");
            service.portal.close().await;
        }
    }
    Ok(())
}

async fn run_offer(service: &ShareService, files: Vec<PathBuf>, target: Option<String>) -> anyhow::Result<()> {
    let local = service.start_server().await?;
    let manifest = service.offer(files, target.clone()).await?;
    let total: u64 = manifest.iter().map(|f| f.size).sum();

    eprintln!(
        "Offering {} files ({} bytes) on {} to {}",
        manifest.len(),
        total,
        local,
        target.as_deref().unwrap_or("the first device that asks")
    );

    tokio::select! {
        status = service.server.wait_for_offer(Duration::from_secs(24 * 60 * 60)) => match status {
            Some(OfferStatus::Finished) => println!("Offer delivered."),
            Some(status) => println!("Offer ended: {:?}", status),
            None => println!("Offer expired."),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            service.server.cancel_offer().await;
        }
    }

    service.stop().await;
    Ok(())
}

async fn run_share(service: &ShareService) -> anyhow::Result<()> {
    let receiver = service.start().await?;
    let identity = service.identity.read().await.clone();

    eprintln!("lanportal v{} started", full_version());
    eprintln!("  Device: {}", identity.display_short());
    eprintln!("  Port:   {}", service.config.control_port);
    match &identity.destination {
        Destination::Path { path } => eprintln!("  Saving: {}", path.display()),
        Destination::Tree { root } => eprintln!("  Saving: {} (document tree)", root.display()),
    }
    eprintln!();

    tokio::select! {
        _ = receiver => {
            tracing::warn!("Receiver loop ended");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    service.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Handle --init flag
    if args.init {
        let config_path = PathBuf::from("lanportal.toml");
        let config = Config::default();
        config.save(&config_path)?;
        println!(
            "Created default configuration at: {}",
            config_path.display()
        );
        return Ok(());
    }

    let mut config = load_config(&args)?;
    init_logging(&config.logging, args.verbose)?;

    if let Some(port) = args.port {
        config.network.control_port = port;
    }

    tracing::info!("Starting lanportal v{}", full_version());

    let decider: Arc<dyn ConnectionDecider> = if args.auto_accept {
        Arc::new(AutoDecision(true))
    } else {
        Arc::new(PromptDecider)
    };
    let service = ShareService::new(config.network.clone(), decider)?;
    apply_settings(&service, &args).await?;

    if args.history {
        print_history(&service).await;
        return Ok(());
    }

    if args.scan {
        return run_scan(&service).await;
    }

    if let Some(peer) = &args.send {
        if args.files.is_empty() {
            anyhow::bail!("--send needs at least one file");
        }
        let target = parse_peer(peer, config.network.control_port)?;
        return run_send(&service, target, args.files.clone()).await;
    }

    if args.offer {
        if args.files.is_empty() {
            anyhow::bail!("--offer needs at least one file");
        }
        return run_offer(&service, args.files.clone(), args.to.clone()).await;
    }

    run_share(&service).await?;
    tracing::info!("lanportal shutting down");
    Ok(())
}
