use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use palaver_core::NodeId;

/// Compact identity of a ring: two rings with the same node set and
/// replica count always produce the same signature. Carried on every
/// proxy→master request so a desynchronized sender can be detected.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RingSignature(pub u64);

impl fmt::Display for RingSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn hash64(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Consistent-hash assignment of topic names to owning nodes.
///
/// Each node contributes `replicas` points on a 64-bit circle; a topic is
/// owned by the node whose point follows the topic's hash clockwise.
/// Deterministic for a given node set, independent of insertion order.
#[derive(Clone, Debug)]
pub struct HashRing {
    replicas: usize,
    points: Vec<(u64, NodeId)>,
    nodes: Vec<NodeId>,
    signature: RingSignature,
}

impl HashRing {
    pub fn new(replicas: usize, nodes: &[NodeId]) -> Self {
        let replicas = replicas.max(1);
        let mut sorted: Vec<NodeId> = nodes.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut points = Vec::with_capacity(sorted.len() * replicas);
        for node in &sorted {
            for i in 0..replicas {
                let point = hash64(format!("{}:{i}", node.as_str()).as_bytes());
                points.push((point, node.clone()));
            }
        }
        points.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha256::new();
        hasher.update(replicas.to_be_bytes());
        for node in &sorted {
            hasher.update(node.as_str().as_bytes());
            hasher.update([0]);
        }
        let digest = hasher.finalize();
        let mut sig = [0u8; 8];
        sig.copy_from_slice(&digest[..8]);

        Self {
            replicas,
            points,
            nodes: sorted,
            signature: RingSignature(u64::from_be_bytes(sig)),
        }
    }

    /// Rebuild with the same replica count over a new node set.
    pub fn with_nodes(&self, nodes: &[NodeId]) -> Self {
        Self::new(self.replicas, nodes)
    }

    pub fn signature(&self) -> RingSignature {
        self.signature
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.binary_search(node).is_ok()
    }

    /// Owning node for a topic name. `None` only on an empty ring.
    pub fn node_for(&self, topic: &str) -> Option<&NodeId> {
        if self.points.is_empty() {
            return None;
        }
        let key = hash64(topic.as_bytes());
        let idx = match self.points.binary_search_by(|p| p.0.cmp(&key)) {
            Ok(i) => i,
            Err(i) if i == self.points.len() => 0,
            Err(i) => i,
        };
        Some(&self.points[idx].1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::new(*n)).collect()
    }

    #[test]
    fn lookup_is_deterministic() {
        let a = HashRing::new(20, &nodes(&["alpha", "beta", "gamma"]));
        let b = HashRing::new(20, &nodes(&["gamma", "alpha", "beta"]));
        assert_eq!(a.signature(), b.signature());
        for topic in ["grp1", "p2p3-9", "usr42", "sys", "fnd7"] {
            assert_eq!(a.node_for(topic), b.node_for(topic));
            assert_eq!(a.node_for(topic), a.node_for(topic));
        }
    }

    #[test]
    fn signature_tracks_membership() {
        let three = HashRing::new(20, &nodes(&["alpha", "beta", "gamma"]));
        let two = three.with_nodes(&nodes(&["alpha", "gamma"]));
        assert_ne!(three.signature(), two.signature());
        let again = HashRing::new(20, &nodes(&["gamma", "alpha"]));
        assert_eq!(two.signature(), again.signature());
    }

    #[test]
    fn removing_a_node_only_moves_its_own_topics() {
        let full = HashRing::new(50, &nodes(&["alpha", "beta", "gamma"]));
        let reduced = full.with_nodes(&nodes(&["alpha", "beta"]));
        let gamma = NodeId::new("gamma");
        for i in 0..1000 {
            let topic = format!("grp{i}");
            let before = full.node_for(&topic).cloned();
            let after = reduced.node_for(&topic).cloned();
            if before.as_ref() != Some(&gamma) {
                assert_eq!(before, after, "topic {topic} moved without cause");
            } else {
                assert_ne!(after.as_ref(), Some(&gamma));
            }
        }
    }

    #[test]
    fn adding_a_node_moves_a_bounded_share() {
        let two = HashRing::new(50, &nodes(&["alpha", "beta"]));
        let three = two.with_nodes(&nodes(&["alpha", "beta", "gamma"]));
        let moved = (0..1000)
            .filter(|i| {
                let topic = format!("grp{i}");
                two.node_for(&topic) != three.node_for(&topic)
            })
            .count();
        // Expected share is 1/3; allow generous slack for hash variance.
        assert!(moved < 500, "{moved} of 1000 topics moved");
        assert!(moved > 0);
    }

    #[test]
    fn empty_ring_owns_nothing() {
        let ring = HashRing::new(20, &[]);
        assert!(ring.is_empty());
        assert!(ring.node_for("grp1").is_none());
    }
}
