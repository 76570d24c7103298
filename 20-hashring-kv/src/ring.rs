//! Consistent-hashing ring that maps keys onto node names.
//!
//! Each node is inserted as [`HashRing::replicas`] virtual replicas labelled
//! `name#0 … name#(R-1)`. A key belongs to the first replica at or after its
//! own hash, wrapping around to the smallest position.
//!
//! Positions come from [`stable_hash`], which is a pure function of the input
//! bytes. Ring placement is therefore identical across processes and runs,
//! which `std`'s randomly seeded hashers do not guarantee.

use std::collections::{BTreeMap, BTreeSet};

/// Virtual replicas per node when none is configured.
pub const DEFAULT_REPLICAS: usize = 100;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hashes bytes to a ring position.
///
/// FNV-1a followed by the MurmurHash3 64-bit finalizer. FNV alone leaves
/// labels that differ only in their last byte clustered together; the
/// finalizer spreads them over the whole `u64` space.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    fmix64(hash)
}

fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Ordered mapping from ring position to node name.
///
/// Lookups take `&self` and topology changes take `&mut self`, so a shared
/// ring can serve any number of concurrent routing decisions while changes
/// require exclusive access.
#[derive(Debug, Clone)]
pub struct HashRing {
    ring: BTreeMap<u64, String>,
    replicas: usize,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

impl HashRing {
    /// Creates an empty ring placing `replicas` virtual replicas per node.
    pub fn new(replicas: usize) -> Self {
        Self {
            ring: BTreeMap::new(),
            replicas,
        }
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Inserts every virtual replica of `name`.
    ///
    /// Re-adding a name rewrites the same positions. If a replica lands on a
    /// position already held by another node, the new entry wins.
    pub fn add_node(&mut self, name: &str) {
        for position in self.positions(name) {
            self.ring.insert(position, name.to_string());
        }
    }

    /// Removes the virtual replicas of `name`. Unknown names are ignored.
    ///
    /// Positions that a colliding replica of a different node has since taken
    /// over are left in place.
    pub fn remove_node(&mut self, name: &str) {
        for position in self.positions(name) {
            if self.ring.get(&position).is_some_and(|owner| owner == name) {
                self.ring.remove(&position);
            }
        }
    }

    /// Returns the node responsible for `key`, or `None` for an empty ring.
    pub fn get_node(&self, key: &str) -> Option<&str> {
        let hash = stable_hash(key.as_bytes());
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, name)| name.as_str())
    }

    /// Returns up to `n` distinct nodes for `key`, owner first, in clockwise
    /// ring order.
    ///
    /// The entries after the owner are the natural replication targets for
    /// the key.
    pub fn get_nodes(&self, key: &str, n: usize) -> Vec<&str> {
        let mut picked: Vec<&str> = Vec::with_capacity(n);
        if n == 0 {
            return picked;
        }
        let hash = stable_hash(key.as_bytes());
        let clockwise = self.ring.range(hash..).chain(self.ring.range(..hash));
        for (_, name) in clockwise {
            if !picked.contains(&name.as_str()) {
                picked.push(name.as_str());
                if picked.len() == n {
                    break;
                }
            }
        }
        picked
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.ring.values().any(|owner| owner == name)
    }

    /// Distinct node names currently holding at least one position.
    pub fn node_names(&self) -> BTreeSet<&str> {
        self.ring.values().map(String::as_str).collect()
    }

    /// Number of occupied ring positions.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Ring positions of every virtual replica of `name`.
    fn positions(&self, name: &str) -> Vec<u64> {
        (0..self.replicas)
            .map(|i| stable_hash(format!("{name}#{i}").as_bytes()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key-{i}")).collect()
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring = HashRing::default();
        assert!(ring.is_empty());
        assert_eq!(ring.get_node("anything"), None);
        assert!(ring.get_nodes("anything", 3).is_empty());
    }

    #[test]
    fn single_node_owns_everything() {
        let mut ring = HashRing::new(10);
        ring.add_node("A");
        assert_eq!(ring.len(), 10);
        for key in keys(50) {
            assert_eq!(ring.get_node(&key), Some("A"));
        }
    }

    #[test]
    fn stable_hash_is_fixed() {
        // Ring placement must not drift between builds.
        assert_eq!(stable_hash(b""), 0xefd0_1f60_ba99_2926);
        assert_eq!(stable_hash(b"IBM"), 0x1d64_82a6_7257_a75f);
        assert_eq!(stable_hash(b"A#0"), 0x8edf_770e_db95_05f9);
        assert_ne!(stable_hash(b"A#0"), stable_hash(b"A#1"));
    }

    #[test]
    fn lookup_is_deterministic() {
        let mut first = HashRing::default();
        first.add_node("A");
        first.add_node("B");
        first.add_node("C");

        let mut second = HashRing::default();
        second.add_node("C");
        second.add_node("A");
        second.add_node("B");

        for key in keys(200) {
            let owner = first.get_node(&key);
            assert_eq!(owner, first.get_node(&key));
            assert_eq!(owner, second.get_node(&key), "insertion order changed {key}");
        }
    }

    #[test]
    fn re_adding_is_idempotent() {
        let mut ring = HashRing::default();
        ring.add_node("A");
        ring.add_node("B");
        let before: Vec<_> = keys(100)
            .iter()
            .map(|k| ring.get_node(k).map(str::to_owned))
            .collect();
        let len = ring.len();

        ring.add_node("A");
        let after: Vec<_> = keys(100)
            .iter()
            .map(|k| ring.get_node(k).map(str::to_owned))
            .collect();
        assert_eq!(ring.len(), len);
        assert_eq!(before, after);
    }

    #[test]
    fn removal_reroutes_keys() {
        let mut ring = HashRing::default();
        for name in ["A", "B", "C"] {
            ring.add_node(name);
        }
        let owned_by_b: Vec<String> = keys(500)
            .into_iter()
            .filter(|k| ring.get_node(k) == Some("B"))
            .collect();
        assert!(!owned_by_b.is_empty());

        let untouched: HashMap<String, String> = keys(500)
            .into_iter()
            .filter_map(|k| {
                let owner = ring.get_node(&k)?.to_string();
                (owner != "B").then_some((k, owner))
            })
            .collect();

        ring.remove_node("B");
        assert!(!ring.contains_node("B"));
        assert_eq!(ring.len(), 200);
        for key in &owned_by_b {
            let owner = ring.get_node(key).expect("ring still populated");
            assert!(owner == "A" || owner == "C");
        }
        // Keys that never lived on B stay where they were.
        for (key, owner) in &untouched {
            assert_eq!(ring.get_node(key), Some(owner.as_str()));
        }
    }

    #[test]
    fn removing_unknown_node_is_noop() {
        let mut ring = HashRing::new(16);
        ring.add_node("A");
        ring.remove_node("ghost");
        assert_eq!(ring.len(), 16);
        assert_eq!(ring.node_names().into_iter().collect::<Vec<_>>(), vec!["A"]);
    }

    #[test]
    fn removing_last_node_empties_ring() {
        let mut ring = HashRing::new(8);
        ring.add_node("A");
        ring.remove_node("A");
        assert!(ring.is_empty());
        assert_eq!(ring.get_node("k"), None);
    }

    #[test]
    fn load_spreads_across_nodes() {
        let mut ring = HashRing::default();
        for name in ["A", "B", "C"] {
            ring.add_node(name);
        }
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for key in keys(3000) {
            *counts.entry(ring.get_node(&key).unwrap()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        for (name, count) in counts {
            assert!(count > 300, "{name} only owns {count} of 3000 keys");
        }
    }

    #[test]
    fn preference_list_starts_with_owner() {
        let mut ring = HashRing::default();
        for name in ["A", "B", "C"] {
            ring.add_node(name);
        }
        for key in keys(50) {
            let nodes = ring.get_nodes(&key, 2);
            assert_eq!(nodes.len(), 2);
            assert_eq!(Some(nodes[0]), ring.get_node(&key));
            assert_ne!(nodes[0], nodes[1]);
        }
        // Asking for more nodes than exist returns each once.
        let all = ring.get_nodes("IBM", 10);
        assert_eq!(all.len(), 3);
    }
}
