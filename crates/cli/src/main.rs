use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ibkr_bridge_cache::{DiskCache, ResponseCache};
use ibkr_bridge_core::*;
use ibkr_bridge_dispatch::{tools, ToolDispatcher};
use ibkr_bridge_gateway::GatewaySession;
use ibkr_bridge_policy::AccessPolicy;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "ibkr-mcp")]
#[command(about = "Read-only Interactive Brokers tools over stdio JSON-RPC")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(flatten)]
    gateway: GatewayArgs,

    #[command(flatten)]
    policy: PolicyArgs,

    #[command(flatten)]
    cache: CacheArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct GatewayArgs {
    /// Gateway host
    #[arg(long = "host", env = "IBKR_GATEWAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Gateway API port
    #[arg(long = "port", env = "IBKR_GATEWAY_PORT", default_value_t = 7496)]
    port: u16,

    /// Client id announced in the handshake
    #[arg(long, env = "IBKR_CLIENT_ID", default_value_t = 1)]
    client_id: i32,

    /// Per-exchange timeout in seconds
    #[arg(long = "timeout", env = "IBKR_TIMEOUT", default_value_t = 10)]
    timeout_secs: u64,
}

#[derive(Args)]
struct PolicyArgs {
    /// Refuse tools that would modify account state
    #[arg(long, env = "IBKR_READONLY")]
    readonly: bool,

    /// Comma-separated account whitelist; empty allows every account
    #[arg(long, env = "IBKR_AUTHORIZED_ACCOUNTS", default_value = "")]
    authorized_accounts: String,
}

#[derive(Args)]
struct CacheArgs {
    /// Directory for the persistent cache tier
    #[arg(long, env = "IBKR_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Maximum in-memory cache entries
    #[arg(long, env = "IBKR_CACHE_CAPACITY", default_value_t = 512)]
    cache_capacity: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve tools over stdin/stdout (default)
    Serve {
        /// Connect to the gateway before reading requests
        #[arg(long)]
        connect_on_start: bool,
    },

    /// Print the tool definitions as JSON
    Tools,

    /// Inspect or prune the disk cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show file count, size and age range
    Stats,

    /// Remove cached files
    Clear {
        /// Only remove files written more than this many hours ago
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

impl Cli {
    fn config(&self) -> BridgeConfig {
        BridgeConfig {
            gateway: GatewayConfig {
                host: self.gateway.host.clone(),
                port: self.gateway.port,
                client_id: self.gateway.client_id,
                timeout_secs: self.gateway.timeout_secs,
            },
            policy: PolicyConfig {
                readonly: self.policy.readonly,
                authorized_accounts: PolicyConfig::parse_accounts(&self.policy.authorized_accounts),
            },
            cache: CacheConfig {
                capacity: self.cache.cache_capacity,
                dir: self.cache.cache_dir.clone(),
                ..Default::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the JSON-RPC stream, so logs go to stderr
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = cli.config();
    match cli.command.unwrap_or(Commands::Serve {
        connect_on_start: false,
    }) {
        Commands::Serve { connect_on_start } => serve(config, connect_on_start).await?,
        Commands::Tools => {
            println!("{}", serde_json::to_string_pretty(&tools::definitions())?);
        }
        Commands::Cache { command } => {
            let disk = config
                .cache
                .dir
                .clone()
                .map(DiskCache::new)
                .context("No cache directory configured; set IBKR_CACHE_DIR or --cache-dir")?;
            match command {
                CacheCommands::Stats => {
                    let stats = disk.stats().await?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                CacheCommands::Clear { older_than_hours } => {
                    let older_than = older_than_hours.map(|h| Duration::from_secs(h * 3600));
                    let removed = disk.clear(older_than).await?;
                    println!("Removed {} cache files from {}", removed, disk.dir().display());
                }
            }
        }
    }

    Ok(())
}

async fn serve(config: BridgeConfig, connect_on_start: bool) -> Result<()> {
    let session = Arc::new(GatewaySession::new(
        config.gateway.clone(),
        config.policy.readonly,
    ));
    if connect_on_start {
        if let Err(e) = session.connect().await {
            warn!("Initial gateway connect failed, will retry on first call: {}", e);
        }
    }

    let gateway: Arc<dyn Gateway> = session.clone();
    let dispatcher = Arc::new(ToolDispatcher::new(
        gateway,
        AccessPolicy::new(&config.policy),
        Arc::new(ResponseCache::new(&config.cache)),
    ));

    info!(
        gateway = %config.gateway.address(),
        readonly = config.policy.readonly,
        accounts = config.policy.authorized_accounts.len(),
        cache_dir = ?config.cache.dir,
        "Serving tools on stdio"
    );
    let outcome = ibkr_bridge_server::serve(dispatcher, tokio::io::stdin(), tokio::io::stdout()).await;

    session.disconnect().await;
    info!("Stdio closed; exiting");
    outcome
}
