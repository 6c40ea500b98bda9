pub mod block;
pub mod blockchain;
pub mod config;
pub mod constants;
pub mod core;
pub mod core_gate;
pub mod error;
pub mod mining;
pub mod network;
pub mod network_type;
pub mod shutdown;
pub mod transaction_pool;
pub mod types;

use crate::blockchain::Blockchain;
use crate::config::Config;
use crate::core::NodeCore;
use crate::mining::Miner;
use crate::network::protocol_handler::ProtocolHandler;
use crate::network::server::NetworkServer;
use crate::shutdown::ShutdownManager;
use crate::transaction_pool::TransactionPool;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "cinderd")]
#[command(about = "Cinder Protocol Daemon", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(long)]
    listen_addr: Option<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,

    /// Explicitly set node to online mode (needed to launch the first node
    /// of a network)
    #[arg(long)]
    explicit_set_online: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Print hostname at startup BEFORE any logging
    if let Ok(hostname) = hostname::get() {
        if let Ok(hostname_str) = hostname.into_string() {
            let short_name = hostname_str.split('.').next().unwrap_or(&hostname_str);
            eprintln!("\n╔═══════════════════════════════════════════╗");
            eprintln!("║  🖥️  NODE: {:<30} ║", short_name);
            eprintln!("╚═══════════════════════════════════════════╝\n");
        }
    }

    if args.generate_config {
        let config = Config::default();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let config = match Config::load_or_create(&args.config) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", args.config);
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.logging, args.verbose);

    let mut shutdown_manager = ShutdownManager::new();
    let shutdown_token = shutdown_manager.token();

    let network_type = config.node.network_type();
    let listen_addr = args
        .listen_addr
        .clone()
        .unwrap_or_else(|| config.network.full_listen_address(&network_type));
    let listen_addr: SocketAddr = match listen_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("❌ Invalid listen address {}: {}", listen_addr, e);
            std::process::exit(1);
        }
    };

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    println!("\n🚀 Cinder Protocol Daemon v{} ({})", version, git_hash);
    println!("═══════════════════════════════════════════════════════");
    println!();
    println!("📡 Network: {}", network_type);
    println!("  └─ P2P: {}", listen_addr);
    println!();

    // Core components: store, pool, miner, and the protocol handler on top
    let chain = Arc::new(Blockchain::new(network_type));
    let pool = Arc::new(TransactionPool::new());
    let miner = Arc::new(Miner::new());
    let node_core = Arc::new(NodeCore::new(chain, pool, miner));
    let handler = Arc::new(ProtocolHandler::new(node_core));
    handler.init(args.explicit_set_online);

    let server = Arc::new(NetworkServer::new(
        Arc::clone(&handler),
        shutdown_token.clone(),
    ));
    if let Err(e) = server.listen(listen_addr).await {
        error!("Failed to bind P2P listener: {}", e);
        std::process::exit(1);
    }

    for peer in &config.network.bootstrap_peers {
        match peer.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = server.connect(addr).await {
                    warn!("Failed to connect bootstrap peer {}: {}", addr, e);
                }
            }
            Err(e) => warn!("Skipping bad bootstrap peer {}: {}", peer, e),
        }
    }

    // Periodic idle tick: quorum recount + core maintenance
    {
        let handler = Arc::clone(&handler);
        let token = shutdown_token.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(
                constants::network::IDLE_TICK_SECS,
            ));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => handler.on_idle(),
                }
            }
        });
        shutdown_manager.register_task(handle);
    }

    // Periodic connection-table dump
    {
        let handler = Arc::clone(&handler);
        let token = shutdown_token.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(
                constants::network::LOG_CONNECTIONS_SECS,
            ));
            tick.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => handler.log_connections(),
                }
            }
        });
        shutdown_manager.register_task(handle);
    }

    info!("Node started, waiting for peers");
    shutdown_manager.wait_for_shutdown().await;

    handler.deinit();
    info!("👋 Cinder daemon stopped");
}

fn setup_logging(config: &config::LoggingConfig, verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Get hostname - shorten to first part before dot
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .compact()
                .init();
        }
    }
}

// Custom timer that shows UTC time and hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        use chrono::Utc;
        let now = Utc::now();

        // Format: "YYYY-MM-DD HH:MM:SS.mmm [hostname]"
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
