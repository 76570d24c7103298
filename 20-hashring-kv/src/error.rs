//! Error types shared across the crate.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

/// A line that could not be decoded as a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The line held no tokens.
    #[error("empty line")]
    Empty,

    /// The leading token is not a known command.
    #[error("unknown command: {command}")]
    UnknownCommand {
        /// The token that was not recognized.
        command: String,
    },

    /// The command had the wrong number of fields.
    #[error("{command} expects {expected} argument(s), found {found}")]
    Arity {
        command: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Failures of the write-ahead log.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// The log file could not be opened or created.
    #[error("failed to open write-ahead log {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Another log in this process already owns the file.
    #[error("write-ahead log {path} is already open")]
    AlreadyOpen { path: PathBuf },

    /// Appending or syncing a record failed.
    #[error("failed to append to write-ahead log {path}")]
    Append {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading the log back during recovery failed.
    #[error("failed to replay write-ahead log {path}")]
    Replay {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures surfaced by [`Node`](crate::node::Node) operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Opening, replaying, or appending to the log failed.
    #[error(transparent)]
    Wal(#[from] WalError),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The listener could not be configured or the serving thread started.
    #[error("failed to start serving on {addr}")]
    Serve {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A key or value that the line format cannot carry.
    #[error("invalid {field} {token:?}: must be non-empty and contain no whitespace")]
    InvalidToken { field: &'static str, token: String },

    /// The encoded record would not fit on one protocol line.
    #[error("record for key {key:?} is {len} bytes, over the {limit}-byte line limit")]
    RecordTooLong { key: String, len: usize, limit: u64 },
}

/// Failures surfaced by [`Cluster`](crate::cluster::Cluster) routing.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// No node is registered on the ring.
    #[error("no nodes registered")]
    EmptyRing,

    /// The ring named a node that the cluster does not hold.
    #[error("ring routed to unknown node {name}")]
    UnknownNode { name: String },

    /// A node with this name is already registered.
    #[error("node {name} is already registered")]
    DuplicateNode { name: String },

    #[error(transparent)]
    Node(#[from] NodeError),
}
