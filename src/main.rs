//! skilld - MCP server for dynamically registered skills
//!
//! Modes:
//! - Default: MCP over stdio (one JSON-RPC message per line)
//! - --transport http: MCP over `POST /mcp`

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use skilld::config::{SkilldConfig, TransportKind};
use skilld::{discovery, transport};
use skilld::{Composer, ProtocolHandler, Sandbox, SandboxConfig, SkillRegistry, SkillStore};

#[derive(Parser, Debug)]
#[command(name = "skilld", version)]
#[command(about = "Register, compose and serve sandboxed skills over MCP")]
struct Args {
    /// Configuration file (default: <data dir>/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transport carrying JSON-RPC messages
    #[arg(short, long, value_enum)]
    transport: Option<TransportKind>,

    /// Listen address for the HTTP transport
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Directory holding the skill database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory watched for drop-in skills
    #[arg(long)]
    skills_dir: Option<PathBuf>,

    /// Maximum nested call depth
    #[arg(long)]
    max_depth: Option<usize>,

    /// Wall-clock budget of one tool call, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Memory ceiling of one skill execution, in MiB
    #[arg(long)]
    memory_limit_mb: Option<u64>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn load_config(&self) -> Result<SkilldConfig> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => self
                .data_dir
                .clone()
                .unwrap_or_else(|| SkilldConfig::default().data_dir)
                .join("config.toml"),
        };
        let mut config = SkilldConfig::load(&path)
            .with_context(|| format!("failed to load config {}", path.display()))?
            .apply_env();

        if let Some(transport) = self.transport {
            config.server.transport = transport;
        }
        if let Some(addr) = self.http_addr {
            config.server.http_addr = addr;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(dir) = &self.skills_dir {
            config.skills_dir = Some(dir.clone());
        }
        if let Some(depth) = self.max_depth {
            config.composition.max_depth = depth;
        }
        if let Some(ms) = self.timeout_ms {
            config.sandbox.timeout_ms = ms;
        }
        if let Some(mb) = self.memory_limit_mb {
            config.sandbox.memory_limit_mb = mb;
        }
        Ok(config)
    }
}

/// Logs always go to stderr; stdout carries protocol frames
fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = args.load_config()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        transport = ?config.server.transport,
        "skilld starting"
    );

    let store = SkillStore::open(&config.database_path())?;
    let sandbox = Sandbox::new(SandboxConfig::from(&config.sandbox))?;
    let registry = SkillRegistry::new(store, sandbox);
    registry.load_persisted()?;

    let _watcher = match &config.skills_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create skills dir {}", dir.display()))?;
            let discovered = discovery::scan(&registry, dir);
            Some(discovery::watch(registry.clone(), dir.clone(), discovered)?)
        }
        None => None,
    };

    let composer = Composer::new(registry, config.composition.max_depth);
    let handler = Arc::new(
        ProtocolHandler::new(composer).with_registration(config.server.allow_registration),
    );

    match config.server.transport {
        TransportKind::Stdio => transport::serve_stdio(handler).await?,
        TransportKind::Http => transport::serve_http(handler, config.server.http_addr).await?,
    }

    info!("skilld stopped");
    Ok(())
}
