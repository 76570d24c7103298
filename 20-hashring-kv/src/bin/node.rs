//! CLI entry point: runs one node and an operator prompt on stdin.
//!
//! Every node builds the same ring from its own name plus the `--peer`
//! entries, so all nodes agree on key ownership without talking to each
//! other. Writes owned locally are applied and replicated; writes owned by a
//! peer are forwarded over the wire protocol.
//!
//! # Example usage
//!
//! ```bash
//! # Terminal 1
//! cargo run --bin kv-node -- --name A --listen 127.0.0.1:7001 \
//!   --peer B=127.0.0.1:7002
//!
//! # Terminal 2
//! cargo run --bin kv-node -- --name B --listen 127.0.0.1:7002 \
//!   --peer A=127.0.0.1:7001
//! ```

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueHint};
use tracing::{info, warn};

use hashring_kv::client;
use hashring_kv::command::Mutation;
use hashring_kv::console::{self, ConsoleCommand};
use hashring_kv::node::{Node, NodeConfig};
use hashring_kv::protocol::Request;
use hashring_kv::ring::{DEFAULT_REPLICAS, HashRing};
use hashring_kv::wal::SyncPolicy;

/// Command-line arguments for a node.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a hash-ring key-value node")]
struct Args {
    /// Node name; must be unique across the ring
    #[arg(long)]
    name: String,

    /// Address to serve the wire protocol on
    #[arg(long, default_value = "127.0.0.1:7001", value_hint = ValueHint::Hostname)]
    listen: SocketAddr,

    /// Write-ahead log path (defaults to <name>.wal)
    #[arg(long, value_hint = ValueHint::FilePath)]
    wal: Option<PathBuf>,

    /// Comma-separated peer map: name=addr,name=addr,... (excluding self)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Virtual replicas per node on the ring
    #[arg(long, default_value_t = DEFAULT_REPLICAS)]
    replicas: usize,

    /// Copies of each write, owner included
    #[arg(long, default_value_t = 2)]
    replication_factor: usize,

    /// Per-connection read timeout in milliseconds (0 disables it)
    #[arg(long, default_value_t = 5000)]
    read_timeout_ms: u64,

    /// Skip fdatasync on each log append
    #[arg(long)]
    no_fsync: bool,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let peers = parse_peers(&args.peer)?;
    if peers.contains_key(&args.name) {
        return Err(anyhow!("--peer must not include this node ({})", args.name));
    }

    let wal = args
        .wal
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.wal", args.name)));
    let read_timeout =
        (args.read_timeout_ms > 0).then(|| Duration::from_millis(args.read_timeout_ms));
    let sync = if args.no_fsync {
        SyncPolicy::Flush
    } else {
        SyncPolicy::Data
    };

    let node = Node::start(
        NodeConfig::new(args.name.clone(), wal, args.listen.port())
            .with_listen_addr(args.listen)
            .with_read_timeout(read_timeout)
            .with_wal_sync(sync),
    )
    .with_context(|| format!("failed to start node {}", args.name))?;

    let mut ring = HashRing::new(args.replicas);
    ring.add_node(&args.name);
    for name in peers.keys() {
        ring.add_node(name);
    }

    let router = Router {
        node,
        ring,
        peers,
        replication_factor: args.replication_factor.max(1),
        timeout: Duration::from_secs(1),
    };
    info!(node = %args.name, peers = router.peers.len(), "ready; type HELP for commands");

    let result = run_console(&router);
    router.node.shutdown();
    result
}

/// Routes operator commands to the owning node.
struct Router {
    node: Node,
    ring: HashRing,
    peers: HashMap<String, SocketAddr>,
    replication_factor: usize,
    timeout: Duration,
}

impl Router {
    /// Applies `mutation` on every node of the key's preference list.
    ///
    /// Only the owner's outcome is reported; copies to the other nodes are
    /// best-effort.
    fn write(&self, mutation: Mutation) -> Result<String> {
        mutation.validate()?;
        let targets = self.ring.get_nodes(mutation.key(), self.replication_factor);
        let owner = targets
            .first()
            .copied()
            .ok_or_else(|| anyhow!("ring is empty"))?;

        for (i, target) in targets.iter().enumerate() {
            if *target == self.node.name() {
                match &mutation {
                    Mutation::Put { key, value } => self.node.put(key.as_str(), value.as_str())?,
                    Mutation::Remove { key } => {
                        self.node.remove_key(key.as_str())?;
                    }
                }
                continue;
            }
            let addr = self.peer_addr(target)?;
            let sent = client::send(addr, &Request::Mutate(mutation.clone()), self.timeout);
            match sent {
                Err(err) if i == 0 => {
                    return Err(err)
                        .with_context(|| format!("owner {target} at {addr} unreachable"));
                }
                Err(err) => warn!(peer = %target, error = %err, "replica write dropped"),
                Ok(()) => {}
            }
        }
        Ok(owner.to_string())
    }

    fn read(&self, key: &str) -> Result<(String, Option<String>)> {
        let owner = self
            .ring
            .get_node(key)
            .ok_or_else(|| anyhow!("ring is empty"))?;
        if owner == self.node.name() {
            return Ok((owner.to_string(), self.node.get(key)));
        }
        let addr = self.peer_addr(owner)?;
        let response = client::request(addr, &Request::get(key), self.timeout)
            .with_context(|| format!("GET from {owner} at {addr} failed"))?
            .ok_or_else(|| anyhow!("{owner} closed the connection without answering"))?;
        Ok((owner.to_string(), response.into_value()))
    }

    fn peer_addr(&self, name: &str) -> Result<SocketAddr> {
        self.peers
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("no address for peer {name}"))
    }

    fn print_status(&self, out: &mut impl Write) -> Result<()> {
        writeln!(
            out,
            "Node {} on {} | state {:?} | ring: {} node(s), {} positions",
            self.node.name(),
            self.node.local_addr(),
            self.node.state(),
            self.ring.node_names().len(),
            self.ring.len()
        )?;
        let store = self.node.snapshot();
        if store.is_empty() {
            writeln!(out, "  Store: empty")?;
        }
        for (key, value) in store {
            writeln!(out, "  {key} = {value}")?;
        }
        Ok(())
    }
}

/// Reads commands from stdin until EXIT or end of input.
fn run_console(router: &Router) -> Result<()> {
    let stdin = io::stdin();
    let mut out = io::stdout();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Put { key, value }) => {
                match router.write(Mutation::put(&key, value)) {
                    Ok(owner) => writeln!(out, "OK ({owner})")?,
                    Err(err) => writeln!(out, "ERROR: {err:#}")?,
                }
            }
            Ok(ConsoleCommand::Remove { key }) => match router.write(Mutation::remove(&key)) {
                Ok(owner) => writeln!(out, "OK ({owner})")?,
                Err(err) => writeln!(out, "ERROR: {err:#}")?,
            },
            Ok(ConsoleCommand::Get { key }) => match router.read(&key) {
                Ok((owner, Some(value))) => writeln!(out, "{key} = {value} ({owner})")?,
                Ok((owner, None)) => writeln!(out, "{key} not found ({owner})")?,
                Err(err) => writeln!(out, "ERROR: {err:#}")?,
            },
            Ok(ConsoleCommand::Status) => router.print_status(&mut out)?,
            Ok(ConsoleCommand::Help) => {
                for line in console::HELP {
                    writeln!(out, "{line}")?;
                }
            }
            Ok(ConsoleCommand::Exit) => {
                writeln!(out, "Shutting down...")?;
                break;
            }
            Err(err) => writeln!(out, "ERROR: {err}")?,
        }
        out.flush()?;
    }
    Ok(())
}

/// Parses `name=addr` peer entries.
fn parse_peers(entries: &[String]) -> Result<HashMap<String, SocketAddr>> {
    let mut peers = HashMap::new();
    for entry in entries {
        let Some((name, addr)) = entry.split_once('=') else {
            return Err(anyhow!("invalid peer entry '{entry}', expected name=addr"));
        };
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid peer address in '{entry}'"))?;
        peers.insert(name.to_string(), addr);
    }
    Ok(peers)
}
