//! Veilnet Exit Node
//!
//! Runs the exit endpoint standalone: TUN device, DNS responder and
//! address pool, with detached stand-ins at the link-layer seams. A
//! full router embeds `veilnet_exit::ExitService` with its own
//! `RouterContext` and `PathSink` instead.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, trace, Level};
use tracing_subscriber::FmtSubscriber;

use veilnet_crypto::{PathId, RouterId, RouterIdentity};
use veilnet_exit::{
    ExitConfig, ExitService, PathSink, RouterContext, SnodeLink, Timestamp, SESSION_LIFETIME_MS,
};

/// Veilnet Exit Node
#[derive(Parser)]
#[command(name = "veilnet-exit-node")]
#[command(author, version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "/etc/veilnet/exit.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the exit node
    Start,

    /// Generate a default config
    GenConfig {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// On-disk configuration: a `[node]` section plus the exit endpoint's
/// textual options, handed through unchanged
#[derive(Debug, Serialize, Deserialize)]
struct NodeFileConfig {
    node: NodeSection,
    exit: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeSection {
    /// Endpoint name used as the log prefix
    name: String,
    /// Where the router identity key lives; generated when absent
    identity: Option<PathBuf>,
}

impl Default for NodeFileConfig {
    fn default() -> Self {
        let mut exit = BTreeMap::new();
        exit.insert("ifaddr".to_string(), "10.77.0.1/16".to_string());
        exit.insert("ifname".to_string(), "veilnet0".to_string());
        exit.insert("exit".to_string(), "true".to_string());
        exit.insert("local-dns".to_string(), "127.0.0.1:53".to_string());
        exit.insert("upstream-dns".to_string(), "8.8.8.8:53".to_string());
        Self {
            node: NodeSection {
                name: "exit".to_string(),
                identity: None,
            },
            exit,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Start => cmd_start(cli.config).await,
        Commands::GenConfig { output } => cmd_gen_config(output).await,
    }
}

async fn cmd_start(config_path: PathBuf) -> Result<()> {
    info!("Starting veilnet exit node...");

    let file_config = load_config(&config_path).await?;

    let mut config = ExitConfig::named(&file_config.node.name);
    for (key, value) in &file_config.exit {
        config
            .set_option(key, value)
            .with_context(|| format!("bad config option {} = {}", key, value))?;
    }

    let identity = load_identity(file_config.node.identity.as_deref()).await?;
    info!("Router identity: {}", identity.router_id());

    let router = Arc::new(StandaloneRouter::new(identity));
    let service = ExitService::start(config, router, Arc::new(DetachedPathSink))
        .await
        .context("Failed to start exit service")?;

    let shutdown = service.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        shutdown.notify_one();
    });

    service.run().await?;
    info!("Exit node stopped");
    Ok(())
}

async fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = NodeFileConfig::default();
    let toml = toml::to_string_pretty(&config)?;

    if let Some(path) = output {
        tokio::fs::write(&path, &toml).await?;
        println!("Config written to {:?}", path);
    } else {
        println!("{}", toml);
    }

    Ok(())
}

async fn load_config(path: &PathBuf) -> Result<NodeFileConfig> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .context("Failed to read config file")?;

    toml::from_str(&contents).context("Failed to parse config")
}

/// Load the router identity, generating and persisting one when the
/// configured file does not exist yet
async fn load_identity(path: Option<&std::path::Path>) -> Result<RouterIdentity> {
    let Some(path) = path else {
        info!("No identity file configured, using an ephemeral identity");
        return Ok(RouterIdentity::generate());
    };

    match tokio::fs::read_to_string(path).await {
        Ok(hex) => {
            let bytes = decode_hex_key(hex.trim())
                .with_context(|| format!("bad identity file {:?}", path))?;
            Ok(RouterIdentity::from_secret_bytes(bytes))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let identity = RouterIdentity::generate();
            let hex: String = identity
                .export_secret()
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect();
            tokio::fs::write(path, hex)
                .await
                .with_context(|| format!("writing identity file {:?}", path))?;
            info!("Generated new identity at {:?}", path);
            Ok(identity)
        }
        Err(e) => Err(e).with_context(|| format!("reading identity file {:?}", path)),
    }
}

fn decode_hex_key(hex: &str) -> Result<[u8; 32]> {
    anyhow::ensure!(hex.len() == 64, "identity key must be 64 hex chars");
    let mut bytes = [0u8; 32];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .context("identity key is not valid hex")?;
    }
    Ok(bytes)
}

/// Router seam for standalone operation: monotonic time and our
/// identity, no path subsystem. A router process embedding the exit
/// replaces this with its real context.
struct StandaloneRouter {
    identity: RouterIdentity,
    started: Instant,
}

impl StandaloneRouter {
    fn new(identity: RouterIdentity) -> Self {
        Self {
            identity,
            started: Instant::now(),
        }
    }
}

impl RouterContext for StandaloneRouter {
    fn now_ms(&self) -> Timestamp {
        self.started.elapsed().as_millis() as Timestamp
    }

    fn router_id(&self) -> RouterId {
        self.identity.router_id()
    }

    fn transit_hop_previous_is_router(&self, _path: PathId, _id: &RouterId) -> bool {
        // no transit path knowledge without the path subsystem
        false
    }

    fn open_snode_session(&self, remote: RouterId, _rewrite_ip: Ipv4Addr) -> Box<dyn SnodeLink> {
        info!("standalone: detached snode session toward {}", remote);
        Box::new(DetachedSnodeLink {
            created_at: self.now_ms(),
            stopped: false,
        })
    }
}

/// Link seam for standalone operation; frames are accepted and
/// discarded with a trace
struct DetachedPathSink;

impl PathSink for DetachedPathSink {
    fn send_on_path(&self, path: PathId, frame: Bytes) -> bool {
        trace!("standalone: {} bytes toward path {}", frame.len(), path);
        true
    }
}

struct DetachedSnodeLink {
    created_at: Timestamp,
    stopped: bool,
}

impl SnodeLink for DetachedSnodeLink {
    fn queue_upstream(&mut self, frame: Bytes, _pad_to: usize) -> bool {
        trace!("standalone: {} upstream bytes discarded", frame.len());
        true
    }

    fn flush(&mut self) -> bool {
        true
    }

    fn is_expired(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.created_at) >= SESSION_LIFETIME_MS
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn is_stopped(&self) -> bool {
        self.stopped
    }
}
