use anyhow::{ensure, Result};

use crate::clock::NodeId;

/// Static membership of a masterless cluster.
///
/// Nodes are numbered `0..size`. No node is special: any of them may propose
/// at any time, and commit decisions only ever depend on how many nodes are
/// currently reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterlessConfiguration {
    size: u32,
}

impl MasterlessConfiguration {
    pub fn new(size: u32) -> Result<Self> {
        ensure!(size > 0, "configuration requires at least one node");
        Ok(Self { size })
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.size).map(NodeId)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.0 < self.size
    }

    /// Quorum over the full membership.
    pub fn majority(&self) -> usize {
        Self::quorum(self.size())
    }

    /// Smallest strict majority of `reachable` nodes: `floor(reachable / 2) + 1`.
    pub fn quorum(reachable: usize) -> usize {
        reachable / 2 + 1
    }
}
