//! xsitepush - Cross-site state transfer node
//!
//! Runs a cache node that can push its cluster's state to remote backup
//! sites, and the operator commands that drive it over HTTP.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, layer::SubscriberExt, util::SubscriberInitExt};

use xsitepush::api::{ErrorResponse, HttpServer, ModeBody};
use xsitepush::cache::{IracForwarder, MemoryCache};
use xsitepush::config::{LoggingConfig, XSiteConfig};
use xsitepush::error::{Error, Result};
use xsitepush::network::{MembershipMonitor, NetworkClient, NetworkServer, NodeHandler, TcpTransport};
use xsitepush::rpc::Transport;
use xsitepush::state::{ClusterMembership, XSiteStateTransferMode};
use xsitepush::transfer::{Dispatcher, StateTransferManager};

/// xsitepush - Cross-site state transfer node
#[derive(Parser)]
#[command(name = "xsitepush")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "xsitepush.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start,

    /// Show transfer status
    Status {
        /// Node API address
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,

        /// Merge the status of every cluster member
        #[arg(long)]
        cluster: bool,
    },

    /// Push this cluster's state to a backup site
    Push {
        /// Backup site name
        site: String,

        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Cancel a push, or stop receiving state from a site
    Cancel {
        /// Site name
        site: String,

        /// Stop receiving from `site` instead of pushing to it
        #[arg(long)]
        receive: bool,

        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Reset finished transfer statuses on every member
    Clear {
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Show or change the automatic transfer mode of a site
    Mode {
        /// Backup site name
        site: String,

        /// New mode; omit to show the current one
        mode: Option<ModeArg>,

        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "xsitepush.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,

        /// Local site name
        #[arg(long, default_value = "LON")]
        site: String,
    },

    /// Validate configuration file
    Validate,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Manual,
    Auto,
}

impl From<ModeArg> for XSiteStateTransferMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Manual => XSiteStateTransferMode::Manual,
            ModeArg::Auto => XSiteStateTransferMode::Auto,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The daemon configures logging from its config file
    if !matches!(cli.command, Commands::Start) {
        let level = cli.log_level.as_deref().unwrap_or("warn");
        init_logging(level, &LoggingConfig::default())?;
    }

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Status { address, cluster } => {
            let path = if cluster { "/status/cluster" } else { "/status" };
            api_call(reqwest::Method::GET, &address, path, None).await
        }
        Commands::Push { site, address } => {
            let path = format!("/sites/{}/push", site);
            api_call(reqwest::Method::POST, &address, &path, None).await
        }
        Commands::Cancel { site, receive, address } => {
            let action = if receive { "cancel-receive" } else { "cancel" };
            let path = format!("/sites/{}/{}", site, action);
            api_call(reqwest::Method::POST, &address, &path, None).await
        }
        Commands::Clear { address } => {
            api_call(reqwest::Method::POST, &address, "/status/clear", None).await
        }
        Commands::Mode { site, mode, address } => {
            let path = format!("/sites/{}/mode", site);
            match mode {
                Some(mode) => {
                    let body = serde_json::to_value(ModeBody { mode: mode.into() })
                        .map_err(|e| Error::Internal(e.to_string()))?;
                    api_call(reqwest::Method::PUT, &address, &path, Some(body)).await
                }
                None => api_call(reqwest::Method::GET, &address, &path, None).await,
            }
        }
        Commands::Init { output, node_id, site } => run_init(output, node_id, site),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) -> Result<()> {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    let writer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let (json, pretty) = if logging.format == "json" {
        (Some(tracing_subscriber::fmt::layer().json().with_writer(writer)), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_writer(writer)))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(pretty)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))
}

/// Start the node
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = match XSiteConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    let level = log_level.unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging)?;
    tracing::info!(
        "Starting xsitepush node {} in site {}",
        config.node.id,
        config.node.site
    );

    let view = config
        .cluster
        .members
        .iter()
        .map(|m| (m.id.clone(), m.address.clone()))
        .collect();
    let membership = Arc::new(ClusterMembership::from_view(
        config.node.id.clone(),
        config.advertise_address().to_string(),
        view,
        config.cluster.num_segments,
        config.failure_timeout(),
    ));
    let topology = membership.install_topology(false).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(
        Arc::clone(&membership),
        NetworkClient::default(),
        &config.backups,
    ));
    let tracker = Arc::new(IracForwarder::spawn(
        config.node.site.clone(),
        Arc::clone(&transport),
        &config.backups,
        shutdown_rx.clone(),
    ));
    let cache = Arc::new(MemoryCache::new());
    let manager = StateTransferManager::new(
        config.node.site.clone(),
        &config.backups,
        Arc::clone(&membership),
        Arc::clone(&transport),
        cache.clone(),
        cache,
        tracker,
    );
    let manager_handle = manager.start().await?;

    // Framed TCP server for members and remote sites
    let (joins_tx, joins_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(NodeHandler::new(
        Arc::new(Dispatcher::new(Arc::clone(&manager))),
        Arc::clone(&membership),
        joins_tx,
    ));
    let server = NetworkServer::bind(&config.node.bind_address, handler, shutdown_rx.clone()).await?;
    let network_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!("Network server error: {}", e);
        }
    });

    manager.on_topology_updated(&topology).await;

    let monitor = MembershipMonitor::new(
        Arc::clone(&manager),
        NetworkClient::new(config.heartbeat_interval(), config.failure_timeout()),
        Arc::clone(&transport),
        config.advertise_address().to_string(),
        config.heartbeat_interval(),
        config.failure_timeout(),
    );
    let monitor_handle = tokio::spawn(monitor.run(joins_rx, shutdown_rx));

    let http_server = HttpServer::new(config.api.clone(), Arc::clone(&manager));
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.start().await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    manager.stop();
    shutdown_tx.send_replace(true);
    http_handle.abort();
    for (name, handle) in [
        ("network server", network_handle),
        ("membership monitor", monitor_handle),
        ("state transfer manager", manager_handle),
    ] {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("{} failed: {}", name, e),
            Err(_) => tracing::warn!("{} did not stop in time", name),
        }
    }

    tracing::info!("xsitepush shutdown complete");
    Ok(())
}

/// Call the HTTP API of a running node and print the JSON answer
async fn api_call(
    method: reqwest::Method,
    address: &str,
    path: &str,
    body: Option<serde_json::Value>,
) -> Result<()> {
    let url = format!("http://{}{}", address, path);
    let client = reqwest::Client::new();
    let mut request = client.request(method, &url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| Error::Network(format!("Failed to reach {}: {}", address, e)))?;
    let status = response.status();

    if !status.is_success() {
        let message = match response.json::<ErrorResponse>().await {
            Ok(err) => format!("{} ({})", err.error, err.code),
            Err(_) => status.to_string(),
        };
        eprintln!("✗ {}", message);
        return Err(Error::Remote {
            node: address.to_string(),
            message,
        });
    }

    let value: serde_json::Value = response
        .json()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    let text = serde_json::to_string_pretty(&value).map_err(|e| Error::Internal(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String, site: String) -> Result<()> {
    let config_content = format!(
        r#"# xsitepush Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7800"
site = "{site}"
# advertise_address = "my-public-ip:7800"

[cluster]
heartbeat_interval_ms = 500
failure_timeout_ms = 3000
num_segments = 256

# Initial view, in order; the first member coordinates
[[cluster.members]]
id = "{node_id}"
address = "127.0.0.1:7800"

# [[backups]]
# site = "NYC"
# address = "nyc-1.example.com:7800"
# strategy = "async"      # "sync" | "async"
# timeout_ms = 15000
# chunk_size = 512
# max_retries = 30
# wait_time_ms = 2000
# mode = "manual"         # "manual" | "auto"

[api]
enabled = true
bind_address = "0.0.0.0:8080"

[logging]
level = "info"
format = "pretty"
# file = "/var/log/xsitepush/xsitepush.log"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the cluster members and backup sites.");
    println!("Then start with: xsitepush start --config {}", output.display());

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match XSiteConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Site: {}", config.node.site);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Members: {}", config.cluster.members.len());
            for backup in &config.backups {
                println!(
                    "  Backup {}: {} ({:?}, mode {})",
                    backup.site, backup.address, backup.strategy, backup.mode
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
