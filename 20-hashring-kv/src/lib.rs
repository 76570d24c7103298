//! Distributed in-memory key-value store on a consistent-hashing ring.
//!
//! A [`ring::HashRing`] assigns every key to one node. Each [`node::Node`]
//! owns an in-memory [`store::KvStore`] and a [`wal::WriteAheadLog`]: a write
//! is appended and synced to the log before it touches the store, and a
//! restarted node rebuilds its store by replaying the log.
//!
//! Nodes talk to each other with a one-line text protocol over short-lived
//! TCP connections. Replication is fire-and-forget: the writer pushes the
//! mutation to its peers and moves on without waiting for, or retrying on,
//! anything.
//!
//! # Threading
//!
//! - **Caller threads**: `put`/`get`/`remove_key` run on whatever thread
//!   calls them; the store and log are safe to share.
//! - **Serving thread**: one per node, accepting and handling connections
//!   one at a time until shutdown.
//!
//! # Modules
//!
//! - [`ring`]: key → node placement with virtual replicas
//! - [`store`]: sharded concurrent map
//! - [`command`]: `PUT`/`REMOVE` records shared by the log and the wire
//! - [`wal`]: durable append-only log and crash recovery
//! - [`protocol`]: request/response codec
//! - [`client`]: outbound connections
//! - [`node`]: node lifecycle, serving loop, replication
//! - [`cluster`]: in-process routing across several nodes
//! - [`console`]: operator command parsing for the `kv-node` binary

pub mod client;
pub mod cluster;
pub mod command;
pub mod console;
pub mod error;
pub mod node;
pub mod protocol;
pub mod ring;
pub mod store;
pub mod wal;

pub use cluster::Cluster;
pub use error::{ClusterError, DecodeError, NodeError, WalError};
pub use node::{Node, NodeConfig, NodeState};
pub use ring::HashRing;
pub use store::KvStore;
pub use wal::WriteAheadLog;
