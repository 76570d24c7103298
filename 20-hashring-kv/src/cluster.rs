//! In-process cluster driver.
//!
//! Owns a set of running [`Node`]s and a [`HashRing`] over their names.
//! Client calls are routed to the ring owner of the key; writes are then
//! pushed best-effort to the next `replication_factor - 1` distinct nodes on
//! the ring, over the wire protocol, exactly as a remote peer would receive
//! them.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::command::Mutation;
use crate::error::ClusterError;
use crate::node::Node;
use crate::ring::HashRing;

pub struct Cluster {
    ring: HashRing,
    nodes: HashMap<String, Node>,
    replication_factor: usize,
}

impl Cluster {
    /// `replication_factor` counts the owner, so `1` disables replication.
    pub fn new(replicas: usize, replication_factor: usize) -> Self {
        Self {
            ring: HashRing::new(replicas),
            nodes: HashMap::new(),
            replication_factor: replication_factor.max(1),
        }
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Registers a running node and places it on the ring.
    pub fn add_node(&mut self, node: Node) -> Result<(), ClusterError> {
        let name = node.name().to_string();
        if self.nodes.contains_key(&name) {
            return Err(ClusterError::DuplicateNode { name });
        }
        self.ring.add_node(&name);
        info!(node = %name, addr = %node.local_addr(), "joined cluster");
        self.nodes.insert(name, node);
        Ok(())
    }

    /// Takes a node off the ring and hands it back, still running.
    pub fn remove_node(&mut self, name: &str) -> Option<Node> {
        let node = self.nodes.remove(name)?;
        self.ring.remove_node(name);
        info!(node = %name, "left cluster");
        Some(node)
    }

    /// The node responsible for `key`.
    pub fn owner(&self, key: &str) -> Result<&Node, ClusterError> {
        let name = self.ring.get_node(key).ok_or(ClusterError::EmptyRing)?;
        self.lookup(name)
    }

    /// Writes on the owner, then replicates to its ring successors.
    ///
    /// Returns the owner's name. Replication outcome is not reported.
    pub fn put(&self, key: &str, value: &str) -> Result<&str, ClusterError> {
        let owner = self.owner(key)?;
        owner.put(key, value)?;
        self.replicate(owner, key, &Mutation::put(key, value));
        Ok(owner.name())
    }

    /// Reads from the owner only.
    pub fn get(&self, key: &str) -> Result<Option<String>, ClusterError> {
        Ok(self.owner(key)?.get(key))
    }

    /// Removes on the owner, then replicates the removal.
    pub fn remove(&self, key: &str) -> Result<bool, ClusterError> {
        let owner = self.owner(key)?;
        let existed = owner.remove_key(key)?;
        self.replicate(owner, key, &Mutation::remove(key));
        Ok(existed)
    }

    /// Stops every node.
    pub fn shutdown(self) {
        for (_, node) in self.nodes {
            node.shutdown();
        }
    }

    fn replicate(&self, owner: &Node, key: &str, mutation: &Mutation) {
        for name in self.ring.get_nodes(key, self.replication_factor).into_iter().skip(1) {
            match self.nodes.get(name) {
                Some(peer) => owner.replicate_mutation(peer.local_addr(), mutation),
                None => debug!(node = %name, "replica target not registered"),
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<&Node, ClusterError> {
        self.nodes.get(name).ok_or_else(|| ClusterError::UnknownNode {
            name: name.to_string(),
        })
    }
}
