//! NEO node binary: runs one cluster role.

use clap::{Parser, Subcommand};
use neo::{Admin, Config, Master, MemoryDatabase, NodeId, SledDatabase, Storage};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "neo", version, about = "NEO distributed object store node")]
struct Args {
    /// Cluster name; peers with a different name are rejected
    #[arg(short, long, default_value = "neo")]
    cluster: String,

    /// Listen address for inbound connections
    #[arg(short, long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,

    /// Master nodes (comma-separated host:port)
    #[arg(short, long)]
    masters: Option<String>,

    /// Number of partitions (fixed per cluster before first run)
    #[arg(short, long, default_value = "12")]
    partitions: u32,

    /// Target replicas per partition
    #[arg(short, long, default_value = "1")]
    replicas: u32,

    /// Fixed node identity (masters only; other roles are assigned one)
    #[arg(long)]
    node_id: Option<u64>,

    /// Liveness: idle delay before pinging a peer, in seconds
    #[arg(long, default_value = "5")]
    ping_delay: u64,

    /// Liveness: unanswered-ping timeout, in seconds
    #[arg(long, default_value = "5")]
    ping_timeout: u64,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Run a master node (primary or secondary, by election)
    Master,
    /// Run a storage node
    Storage {
        /// Data directory; omit for a transient in-memory store
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
    /// Run an admin node
    Admin,
}

fn parse_masters(raw: &Option<String>) -> Vec<SocketAddr> {
    raw.as_deref()
        .unwrap_or("")
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = Config::new(args.cluster.clone(), args.listen)
        .with_masters(parse_masters(&args.masters))
        .with_partitions(args.partitions, args.replicas);
    config.node_id = args.node_id.map(NodeId::new);
    config.ping_delay = Duration::from_secs(args.ping_delay);
    config.ping_timeout = Duration::from_secs(args.ping_timeout);

    match args.role {
        Role::Master => {
            let mut masters = config.master_nodes.clone();
            if masters.is_empty() {
                masters.push(config.listen);
                config.master_nodes = masters;
            }
            let master = Master::bind(config).await?;
            info!(addr = %master.addr(), "master node bound");
            master.run().await?;
        }
        Role::Storage { data_dir } => {
            let db: Arc<dyn neo::Database> = match data_dir {
                Some(path) => {
                    std::fs::create_dir_all(&path)?;
                    Arc::new(SledDatabase::open(path)?)
                }
                None => Arc::new(MemoryDatabase::new()),
            };
            let storage = Storage::bind(config, db).await?;
            info!(addr = %storage.addr(), "storage node bound");
            storage.run().await?;
        }
        Role::Admin => {
            let admin = Admin::bind(config).await?;
            info!(addr = %admin.addr(), "admin node bound");
            admin.run().await?;
        }
    }
    Ok(())
}
