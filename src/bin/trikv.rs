//! The trikv server: one node of a replicated item collection coordinated
//! by three-phase commit.

#![warn(clippy::all)]

use serde_derive::Deserialize;
use std::collections::HashMap;
use trikv::error::Result;
use trikv::storage;
use trikv::tpc::{DtLog, NodeID};
use trikv::Server;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("trikv.yaml"),
        )
        .get_matches();
    let cfg = Config::load(args.get_one::<String>("config").unwrap())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("trikv");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let path = std::path::Path::new(&cfg.data_dir).join("dtlog");
    let log = DtLog::new(Box::new(storage::File::new(path)?), cfg.id);

    let server = Server::new(cfg.id, cfg.peers()?, log, cfg.coordinator)?;
    server.serve(std::net::TcpListener::bind(&cfg.listen)?)
}

#[derive(Debug, Deserialize)]
struct Config {
    /// The node id. Nodes are numbered contiguously from 1.
    id: NodeID,
    listen: String,
    log_level: String,
    data_dir: String,
    /// Cluster membership as id → address, the local node included.
    peers: HashMap<String, String>,
    /// Whether this node starts as the coordinator. Exactly one node in
    /// the cluster should.
    coordinator: bool,
}

impl Config {
    fn load(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("id", 1)?
            .set_default("listen", "0.0.0.0:9705")?
            .set_default("log_level", "info")?
            .set_default("data_dir", "/var/lib/trikv")?
            .set_default("coordinator", false)?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("TRIKV"))
            .build()?
            .try_deserialize()?)
    }

    fn peers(&self) -> Result<HashMap<NodeID, String>> {
        self.peers.iter().map(|(id, addr)| Ok((id.parse()?, addr.clone()))).collect()
    }
}
