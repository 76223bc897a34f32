use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use raft_kv::{load_config, KvClient, KvService, LoggingConfig, NodeConfig, TcpClientTransport, TcpTransport};
use raft_storage::{FileStorage, InMemoryStorage, Storage};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "raft-kv", about = "Replicated key-value store on raft")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one cluster node
    Serve(ServeArgs),
    /// Set a key, printing the previous value
    Put {
        #[command(flatten)]
        target: Target,
        key: String,
        value: String,
    },
    /// Read a key
    Get {
        #[command(flatten)]
        target: Target,
        key: String,
    },
    /// Set a key only if it currently holds `compare`
    Cas {
        #[command(flatten)]
        target: Target,
        key: String,
        compare: String,
        value: String,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Path to the YAML node config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the node id
    #[arg(long)]
    id: Option<u64>,

    /// Override the listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Extra peer as id=host:port, may be repeated
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(u64, String)>,
}

#[derive(Args, Debug)]
struct Target {
    /// Comma separated server addresses
    #[arg(short, long, value_delimiter = ',', required = true)]
    servers: Vec<String>,

    /// Give up after this many milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

impl Target {
    fn client(&self) -> KvClient {
        KvClient::with_random_order(Arc::new(TcpClientTransport), self.servers.clone())
            .with_deadline(Duration::from_millis(self.timeout_ms))
    }
}

fn parse_peer(raw: &str) -> Result<(u64, String), String> {
    let (id, addr) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got '{raw}'"))?;
    let id = id
        .trim()
        .parse()
        .map_err(|err| format!("bad peer id '{id}': {err}"))?;
    Ok((id, addr.trim().to_string()))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Put { target, key, value } => {
            init_tracing(&LoggingConfig::default());
            let (prev, found) = target.client().put(&key, &value).await?;
            if found {
                println!("{prev}");
            }
            Ok(())
        }
        Command::Get { target, key } => {
            init_tracing(&LoggingConfig::default());
            let (value, found) = target.client().get(&key).await?;
            if !found {
                bail!("key '{key}' not found");
            }
            println!("{value}");
            Ok(())
        }
        Command::Cas {
            target,
            key,
            compare,
            value,
        } => {
            init_tracing(&LoggingConfig::default());
            let (prev, found) = target.client().cas(&key, &compare, &value).await?;
            if !found {
                bail!("key '{key}' not found");
            }
            println!("{prev}");
            if prev != compare {
                bail!("current value does not match, nothing swapped");
            }
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(id) = args.id {
        config.node.id = id;
    }
    if let Some(listen) = args.listen {
        config.node.listen = listen;
    }
    if let Some(dir) = args.data_dir {
        config.node.data_dir = Some(dir);
    }
    config.peers.extend(args.peers);
    config.validate()?;

    init_tracing(&config.logging);
    let id = config.node.id;

    let storage: Box<dyn Storage> = match &config.node.data_dir {
        Some(dir) => {
            info!(node = id, dir = %dir.display(), "using file storage");
            Box::new(FileStorage::new(dir)?)
        }
        None => {
            warn!(node = id, "no data_dir configured, state will not survive a restart");
            Box::new(InMemoryStorage::new())
        }
    };

    let listener = TcpListener::bind(&config.node.listen)
        .await
        .with_context(|| format!("binding {}", config.node.listen))?;
    let service = KvService::start(
        id,
        config.peer_ids(),
        storage,
        Arc::new(TcpTransport::new(id)),
        config.raft.clone(),
    )?;
    service.serve_tcp(listener);
    for (peer, addr) in &config.peers {
        service.connect_to_peer(*peer, addr)?;
    }
    info!(node = id, listen = %config.node.listen, peers = config.peers.len(), "node ready");

    tokio::signal::ctrl_c().await?;
    info!(node = id, "interrupt received, shutting down");
    service.shutdown().await;
    Ok(())
}
