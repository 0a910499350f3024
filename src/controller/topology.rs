//! Switch link graph
//!
//! Directed graph of datapath ids; each edge carries the egress port on its
//! source switch. Maintained from link events for ordinary forwarding only.
//! The key protocols never read or mutate it.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct LinkGraph {
    adjacency: HashMap<u64, HashMap<u64, u32>>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_switch(&mut self, dpid: u64) {
        self.adjacency.entry(dpid).or_default();
    }

    /// Record a bidirectional link as two directed edges
    pub fn add_link(&mut self, src: u64, src_port: u32, dst: u64, dst_port: u32) {
        self.adjacency.entry(src).or_default().insert(dst, src_port);
        self.adjacency.entry(dst).or_default().insert(src, dst_port);
    }

    /// Remove both directions of a link, if present
    pub fn remove_link(&mut self, src: u64, dst: u64) {
        if let Some(edges) = self.adjacency.get_mut(&src) {
            edges.remove(&dst);
        }
        if let Some(edges) = self.adjacency.get_mut(&dst) {
            edges.remove(&src);
        }
    }

    /// Egress port on `src` towards `dst`
    pub fn port_to(&self, src: u64, dst: u64) -> Option<u32> {
        self.adjacency.get(&src)?.get(&dst).copied()
    }

    pub fn has_edge(&self, src: u64, dst: u64) -> bool {
        self.port_to(src, dst).is_some()
    }

    pub fn contains_switch(&self, dpid: u64) -> bool {
        self.adjacency.contains_key(&dpid)
    }

    pub fn switch_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(HashMap::len).sum()
    }
}
