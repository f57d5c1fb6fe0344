//! CLI entry point (spec section: "External Interfaces" — environment /
//! configuration). Builds a `Config` from flags, optionally overlaid with a
//! TOML file, then bootstraps a node and blocks forever.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use raftkv::config::{Config, ConfigFile, DbBackend};
use raftkv::{bootstrap, Address};

#[derive(Parser, Debug)]
#[command(name = "raft-node", about = "A replicated key-value store node")]
struct Args {
    /// This node's own address, e.g. /ip4/127.0.0.1/tcp/9090.
    #[arg(long)]
    id: Address,

    /// Initial cluster membership, including this node's own address.
    #[arg(long = "peer")]
    peers: Vec<Address>,

    /// Path to an optional TOML config file overlay.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Storage backend: sled (default) or memory.
    #[arg(long, value_enum)]
    db: Option<DbBackendArg>,

    /// Disable persistence; log and meta live only in memory.
    #[arg(long)]
    no_persist: bool,

    /// Directory for persistent storage.
    #[arg(long, default_value = "./data")]
    location: PathBuf,

    /// Shared secret used to authenticate peer RPCs.
    #[arg(long)]
    session_key: Option<String>,

    /// Bind to the wildcard address instead of `id`'s own host.
    #[arg(long)]
    public: bool,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum DbBackendArg {
    Sled,
    Memory,
}

impl From<DbBackendArg> for DbBackend {
    fn from(v: DbBackendArg) -> Self {
        match v {
            DbBackendArg::Sled => DbBackend::Sled,
            DbBackendArg::Memory => DbBackend::Memory,
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::new(args.id.clone(), args.peers.clone(), args.location.clone());

    if let Some(path) = args.config {
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to read config file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        };
        let file = match ConfigFile::from_toml_str(&contents) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("failed to parse config file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        };
        config = match config.merge_file(file) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("invalid config file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        };
    }

    // Explicit CLI flags are applied last so they always win over the file
    // overlay above, matching `Config::merge_file`'s contract.
    if !args.peers.is_empty() {
        config.peers = args.peers;
    }
    if let Some(db) = args.db {
        config.db = db.into();
    }
    if args.no_persist {
        config.persist = false;
    }
    if let Some(key) = args.session_key {
        config.session_key = Some(key.into_bytes());
    }
    if args.public {
        config.public = true;
    }

    log::info!("starting node {} with peers {:?}", config.id, config.peers);
    match bootstrap(config) {
        Ok(_handle) => loop {
            std::thread::sleep(Duration::from_secs(3600));
        },
        Err(e) => {
            eprintln!("failed to start node: {}", e);
            std::process::exit(1);
        }
    }
}
