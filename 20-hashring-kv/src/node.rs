//! A storage node: one store, one write-ahead log, one listener.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Recovering → Serving → ShuttingDown → Stopped
//! ```
//!
//! [`Node::start`] opens the log, replays it into an empty store, binds the
//! listener, and spawns a dedicated serving thread. If the log cannot be
//! opened or the port cannot be bound, `start` returns an error and the node
//! never serves.
//!
//! The serving thread accepts one connection at a time and handles it to
//! completion (one request, at most one response) before accepting the next,
//! so requests reach the store in arrival order. A per-connection read
//! timeout caps how long a silent client can hold the loop.
//!
//! Shutdown is cooperative. The listener is nonblocking and the loop parks
//! on a crossbeam channel between polls; dropping the sender wakes it at
//! once. [`Node::shutdown`] (or dropping the node) joins the thread, which
//! owns and closes the listener.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use tracing::{debug, info, warn};

use crate::client;
use crate::command::Mutation;
use crate::error::{NodeError, WalError};
use crate::protocol::{self, Request, Response};
use crate::store::KvStore;
use crate::wal::{SyncPolicy, WriteAheadLog};

/// How long the idle accept loop sleeps between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a connection may take to deliver its request line.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect and write timeout for outbound replication.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings for [`Node::start`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identifies the node in logs. Not visible on the wire.
    pub name: String,
    /// Log file owned exclusively by this node.
    pub wal_path: PathBuf,
    /// Address to listen on. Port 0 picks a free port.
    pub listen_addr: SocketAddr,
    /// How long an accepted connection may take to send its request line.
    /// `None` lets a client stall the serving loop indefinitely.
    pub read_timeout: Option<Duration>,
    /// How long the idle accept loop parks before polling the listener
    /// again. Shutdown interrupts the wait, so this only bounds how quickly
    /// a new connection is noticed.
    pub poll_interval: Duration,
    /// Connect and write timeout for each outbound replication.
    pub peer_timeout: Duration,
    /// Whether each log append is synced to disk before the write is
    /// applied.
    pub wal_sync: SyncPolicy,
}

impl NodeConfig {
    /// Listens on `127.0.0.1:<port>` with default timeouts.
    pub fn new(name: impl Into<String>, wal_path: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            name: name.into(),
            wal_path: wal_path.into(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            poll_interval: DEFAULT_POLL_INTERVAL,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            wal_sync: SyncPolicy::default(),
        }
    }

    /// Listens on `addr` instead of loopback.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn with_wal_sync(mut self, sync: SyncPolicy) -> Self {
        self.wal_sync = sync;
        self
    }
}

/// Where a node is in its lifecycle. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The log is open but not yet replayed.
    Created,
    /// Replaying the log into the store.
    Recovering,
    /// The serving thread is running and accepting connections.
    Serving,
    /// Shutdown was requested; waiting for the serving thread to exit.
    ShuttingDown,
    /// The serving thread is gone and the listener is closed.
    Stopped,
}

/// State reachable from both the node handle and its serving thread.
struct Shared {
    name: String,
    store: KvStore,
    wal: WriteAheadLog,
    state: Mutex<NodeState>,
}

impl Shared {
    fn set_state(&self, next: NodeState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(node = %self.name, from = ?*state, to = ?next, "state transition");
        *state = next;
    }

    fn state(&self) -> NodeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Logs `mutation`, then applies it to the store.
    ///
    /// Returns whether the key was present, which only matters for removals.
    fn apply(&self, mutation: &Mutation) -> Result<bool, WalError> {
        self.wal.append_then(mutation, || match mutation {
            Mutation::Put { key, value } => {
                self.store.put(key.clone(), value.clone());
                true
            }
            Mutation::Remove { key } => self.store.remove(key),
        })
    }
}

/// A running storage node.
///
/// Dropping the node shuts it down and waits for the serving thread.
pub struct Node {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    peer_timeout: Duration,
    shutdown_tx: Option<Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl Node {
    /// Recovers the node from its log and starts serving.
    ///
    /// # Errors
    ///
    /// - [`NodeError::Wal`] if the log cannot be opened, is already owned by
    ///   another node in this process, or cannot be read back.
    /// - [`NodeError::Bind`] if the listen address is unavailable.
    /// - [`NodeError::Serve`] if the listener or thread cannot be set up.
    pub fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let NodeConfig {
            name,
            wal_path,
            listen_addr,
            read_timeout,
            poll_interval,
            peer_timeout,
            wal_sync,
        } = config;

        let wal = WriteAheadLog::open(&wal_path, wal_sync)?;
        let shared = Arc::new(Shared {
            name,
            store: KvStore::new(),
            wal,
            state: Mutex::new(NodeState::Created),
        });

        shared.set_state(NodeState::Recovering);
        let stats = shared.wal.replay(&shared.store)?;
        info!(
            node = %shared.name,
            wal = %wal_path.display(),
            applied = stats.applied,
            skipped = stats.skipped,
            truncated_bytes = stats.truncated_bytes,
            keys = shared.store.len(),
            "recovered from write-ahead log"
        );

        let listener = TcpListener::bind(listen_addr).map_err(|source| NodeError::Bind {
            addr: listen_addr,
            source,
        })?;
        let serve_err = |source| NodeError::Serve {
            addr: listen_addr,
            source,
        };
        listener.set_nonblocking(true).map_err(serve_err)?;
        let local_addr = listener.local_addr().map_err(serve_err)?;

        // Capacity 0: the sender is only ever dropped, never sent on.
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let server_loop = ServerLoop {
            listener,
            shared: Arc::clone(&shared),
            shutdown_rx,
            poll_interval,
            read_timeout,
        };

        let spawned = thread::Builder::new()
            .name(format!("kv-node-{}", shared.name))
            .spawn(move || server_loop.run());
        let server = match spawned {
            Ok(server) => server,
            Err(source) => {
                shared.set_state(NodeState::Stopped);
                return Err(serve_err(source));
            }
        };
        shared.set_state(NodeState::Serving);
        info!(node = %shared.name, addr = %local_addr, "serving");

        Ok(Self {
            shared,
            local_addr,
            peer_timeout,
            shutdown_tx: Some(shutdown_tx),
            server: Some(server),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn wal_path(&self) -> &Path {
        self.shared.wal.path()
    }

    pub fn state(&self) -> NodeState {
        self.shared.state()
    }

    /// Durably logs `PUT key value`, then applies it locally.
    ///
    /// Replication is a separate call; see [`Node::replicate_to`].
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) -> Result<(), NodeError> {
        let mutation = Mutation::put(key, value);
        mutation.validate()?;
        self.shared.apply(&mutation)?;
        Ok(())
    }

    /// Durably logs `REMOVE key`, then applies it locally.
    ///
    /// Returns whether the key was present. Removing an absent key is still
    /// logged.
    pub fn remove_key(&self, key: impl Into<String>) -> Result<bool, NodeError> {
        let mutation = Mutation::remove(key);
        mutation.validate()?;
        Ok(self.shared.apply(&mutation)?)
    }

    /// Reads from the local store only.
    pub fn get(&self, key: &str) -> Option<String> {
        self.shared.store.get(key)
    }

    /// Number of keys held locally.
    pub fn len(&self) -> usize {
        self.shared.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.store.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.shared.store.snapshot()
    }

    /// Pushes `PUT key value` to the node at `host:port`.
    ///
    /// Fire-and-forget: no acknowledgement is read, nothing is retried, and
    /// failures are logged and swallowed. Returning says nothing about
    /// whether the peer applied the write.
    pub fn replicate_to(&self, host: &str, port: u16, key: &str, value: &str) {
        match client::resolve(host, port) {
            Ok(addr) => self.replicate_mutation(addr, &Mutation::put(key, value)),
            Err(error) => debug!(
                node = %self.shared.name,
                peer = %format!("{host}:{port}"),
                %error,
                "replication target did not resolve"
            ),
        }
    }

    /// Pushes any mutation to `addr` with the same best-effort semantics as
    /// [`Node::replicate_to`].
    pub fn replicate_mutation(&self, addr: SocketAddr, mutation: &Mutation) {
        let request = Request::Mutate(mutation.clone());
        if let Err(error) = client::send(addr, &request, self.peer_timeout) {
            debug!(
                node = %self.shared.name,
                peer = %addr,
                key = mutation.key(),
                %error,
                "replication dropped"
            );
        }
    }

    /// Stops serving and waits for the serving thread to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };
        self.shared.set_state(NodeState::ShuttingDown);
        drop(self.shutdown_tx.take());
        if server.join().is_err() {
            warn!(node = %self.shared.name, "serving thread panicked");
        }
        self.shared.set_state(NodeState::Stopped);
        info!(node = %self.shared.name, "stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The accept loop, run on the node's serving thread.
struct ServerLoop {
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown_rx: Receiver<()>,
    poll_interval: Duration,
    read_timeout: Option<Duration>,
}

impl ServerLoop {
    fn run(self) {
        loop {
            if self.shutdown_requested() {
                break;
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(error) = self.handle_connection(stream) {
                        warn!(node = %self.shared.name, %peer, %error, "connection failed");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if self.wait_for_shutdown() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    warn!(node = %self.shared.name, %error, "accept failed");
                    if self.wait_for_shutdown() {
                        break;
                    }
                }
            }
        }
        debug!(node = %self.shared.name, "serving loop exited");
    }

    fn shutdown_requested(&self) -> bool {
        !matches!(self.shutdown_rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// Parks for one poll interval. Returns `true` if shutdown was requested.
    fn wait_for_shutdown(&self) -> bool {
        crossbeam_channel::select! {
            recv(self.shutdown_rx) -> _ => true,
            default(self.poll_interval) => false,
        }
    }

    /// Serves exactly one request on `stream`, then closes it.
    fn handle_connection(&self, stream: TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(self.read_timeout)?;

        let Some(line) = protocol::read_line(&stream)? else {
            return Ok(());
        };
        let request = match Request::decode(&line) {
            Ok(request) => request,
            Err(error) => {
                debug!(node = %self.shared.name, %error, "dropping malformed request");
                return Ok(());
            }
        };

        match request {
            Request::Mutate(mutation) => {
                if let Err(error) = self.shared.apply(&mutation) {
                    warn!(
                        node = %self.shared.name,
                        key = mutation.key(),
                        error = ?error,
                        "failed to log remote mutation"
                    );
                }
            }
            Request::Get { key } => {
                let response = Response::from(self.shared.store.get(&key));
                (&stream).write_all(response.encode().as_bytes())?;
                (&stream).flush()?;
            }
        }
        Ok(())
    }
}
