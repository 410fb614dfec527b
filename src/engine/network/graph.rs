// ABOUTME: Arena-style directed multigraph of typed nodes with flow and control links
// ABOUTME: Adjacency and subnetwork membership are built once at construction and read-only afterwards

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::engine::network::id::{LinkIndex, LinkType, NodeId, NodeIndex, NodeType};

/// The primary (top-level) subnetwork id.
pub const PRIMARY_SUBNETWORK: u32 = 1;

/// A registered node. `local_index` counts nodes of the same type in
/// insertion order and indexes the per-type parameter tables.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub index: NodeIndex,
    pub local_index: usize,
    pub subnetwork: u32,
}

/// A directed link. Flow links form the physical network; control links
/// form the signalling graph.
#[derive(Debug, Clone)]
pub struct Link {
    pub index: LinkIndex,
    pub from: NodeIndex,
    pub to: NodeIndex,
    pub link_type: LinkType,
    /// The subnetwork the link belongs to. A flow link crossing from the
    /// primary network into a secondary one belongs to the secondary
    /// (it is that subnetwork's inlet).
    pub subnetwork: u32,
}

/// Node registry plus topology. Nodes and links live in vectors and refer
/// to each other by index; back-references (inflow/outflow per node) are
/// derived once.
#[derive(Debug, Default)]
pub struct NetworkGraph {
    nodes: Vec<Node>,
    links: Vec<Link>,
    inflow: Vec<Vec<LinkIndex>>,
    outflow: Vec<Vec<LinkIndex>>,
    control_out: Vec<Vec<LinkIndex>>,
    by_id: BTreeMap<NodeId, NodeIndex>,
    type_counts: BTreeMap<NodeType, usize>,
}

impl NetworkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node; returns None if the id is already taken.
    pub fn add_node(&mut self, id: NodeId, subnetwork: u32) -> Option<NodeIndex> {
        if self.by_id.contains_key(&id) {
            return None;
        }
        let index = NodeIndex(self.nodes.len());
        let local_index = {
            let count = self.type_counts.entry(id.node_type).or_insert(0);
            let local = *count;
            *count += 1;
            local
        };
        self.nodes.push(Node {
            id,
            index,
            local_index,
            subnetwork,
        });
        self.inflow.push(Vec::new());
        self.outflow.push(Vec::new());
        self.control_out.push(Vec::new());
        self.by_id.insert(id, index);
        Some(index)
    }

    pub fn add_link(&mut self, from: NodeIndex, to: NodeIndex, link_type: LinkType) -> LinkIndex {
        let index = LinkIndex(self.links.len());
        // Inlets into a secondary subnetwork belong to the secondary side.
        let subnetwork = self.nodes[to.0].subnetwork;
        self.links.push(Link {
            index,
            from,
            to,
            link_type,
            subnetwork,
        });
        match link_type {
            LinkType::Flow => {
                self.outflow[from.0].push(index);
                self.inflow[to.0].push(index);
            }
            LinkType::Control => {
                self.control_out[from.0].push(index);
            }
        }
        index
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index.0]
    }

    pub fn link(&self, index: LinkIndex) -> &Link {
        &self.links[index.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    pub fn flow_links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(|l| l.link_type == LinkType::Flow)
    }

    /// Resolve a user-facing id to (type, local parameter index, subnetwork).
    pub fn lookup(&self, id: NodeId) -> Option<(NodeType, usize, u32)> {
        self.by_id.get(&id).map(|&index| {
            let node = &self.nodes[index.0];
            (node.id.node_type, node.local_index, node.subnetwork)
        })
    }

    pub fn index_of(&self, id: NodeId) -> Option<NodeIndex> {
        self.by_id.get(&id).copied()
    }

    /// Incoming flow links, in insertion order.
    pub fn inflow_links(&self, node: NodeIndex) -> &[LinkIndex] {
        &self.inflow[node.0]
    }

    /// Outgoing flow links, in insertion order.
    pub fn outflow_links(&self, node: NodeIndex) -> &[LinkIndex] {
        &self.outflow[node.0]
    }

    /// Outgoing control links, in insertion order.
    pub fn control_links(&self, node: NodeIndex) -> &[LinkIndex] {
        &self.control_out[node.0]
    }

    /// The single upstream flow neighbor of a connector node.
    pub fn upstream_of(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.inflow[node.0]
            .first()
            .map(|&l| self.links[l.0].from)
    }

    /// The single downstream flow neighbor of a connector node.
    pub fn downstream_of(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.outflow[node.0]
            .first()
            .map(|&l| self.links[l.0].to)
    }

    /// All subnetwork ids present, sorted ascending.
    pub fn subnetwork_ids(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self.nodes.iter().map(|n| n.subnetwork).collect();
        set.into_iter().collect()
    }

    /// Node indices in a subnetwork, in arena order.
    pub fn nodes_in(&self, subnetwork: u32) -> Vec<NodeIndex> {
        self.nodes
            .iter()
            .filter(|n| n.subnetwork == subnetwork)
            .map(|n| n.index)
            .collect()
    }

    /// Flow links in a subnetwork, in arena order.
    pub fn flow_links_in(&self, subnetwork: u32) -> Vec<LinkIndex> {
        self.links
            .iter()
            .filter(|l| l.link_type == LinkType::Flow && l.subnetwork == subnetwork)
            .map(|l| l.index)
            .collect()
    }

    /// Flow links entering a subnetwork from the primary network.
    pub fn inlet_links_of(&self, subnetwork: u32) -> Vec<LinkIndex> {
        self.links
            .iter()
            .filter(|l| {
                l.link_type == LinkType::Flow
                    && l.subnetwork == subnetwork
                    && self.nodes[l.from.0].subnetwork == PRIMARY_SUBNETWORK
                    && subnetwork != PRIMARY_SUBNETWORK
            })
            .map(|l| l.index)
            .collect()
    }

    /// True when the subnetwork's flow graph is connected when viewed as
    /// undirected (inlets from the primary count as internal anchors).
    pub fn subnetwork_connected(&self, subnetwork: u32) -> bool {
        let members: Vec<NodeIndex> = self
            .nodes
            .iter()
            .filter(|n| n.subnetwork == subnetwork)
            // Control-layer nodes are not part of the flow graph.
            .filter(|n| {
                !matches!(
                    n.id.node_type,
                    NodeType::DiscreteControl
                        | NodeType::ContinuousControl
                        | NodeType::PidControl
                        | NodeType::FlowDemand
                        | NodeType::LevelDemand
                )
            })
            .map(|n| n.index)
            .collect();
        if members.len() <= 1 {
            return true;
        }
        let member_set: BTreeSet<NodeIndex> = members.iter().copied().collect();
        let mut seen: BTreeSet<NodeIndex> = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(members[0]);
        seen.insert(members[0]);
        while let Some(current) = queue.pop_front() {
            let neighbors = self.inflow[current.0]
                .iter()
                .map(|&l| self.links[l.0].from)
                .chain(self.outflow[current.0].iter().map(|&l| self.links[l.0].to));
            for neighbor in neighbors {
                if member_set.contains(&neighbor) && seen.insert(neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }
        seen.len() == members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_graph() -> (NetworkGraph, NodeIndex, NodeIndex, NodeIndex) {
        let mut graph = NetworkGraph::new();
        let basin = graph
            .add_node(NodeId::new(NodeType::Basin, 1), PRIMARY_SUBNETWORK)
            .unwrap();
        let pump = graph
            .add_node(NodeId::new(NodeType::Pump, 2), PRIMARY_SUBNETWORK)
            .unwrap();
        let terminal = graph
            .add_node(NodeId::new(NodeType::Terminal, 3), PRIMARY_SUBNETWORK)
            .unwrap();
        graph.add_link(basin, pump, LinkType::Flow);
        graph.add_link(pump, terminal, LinkType::Flow);
        (graph, basin, pump, terminal)
    }

    #[test]
    fn lookup_returns_type_local_index_and_subnetwork() {
        let (graph, _, _, _) = simple_graph();
        let (node_type, local, subnetwork) = graph.lookup(NodeId::new(NodeType::Pump, 2)).unwrap();
        assert_eq!(node_type, NodeType::Pump);
        assert_eq!(local, 0);
        assert_eq!(subnetwork, PRIMARY_SUBNETWORK);
    }

    #[test]
    fn adjacency_is_ordered_and_directional() {
        let (graph, basin, pump, terminal) = simple_graph();
        assert_eq!(graph.outflow_links(basin).len(), 1);
        assert_eq!(graph.upstream_of(pump), Some(basin));
        assert_eq!(graph.downstream_of(pump), Some(terminal));
        assert!(graph.inflow_links(basin).is_empty());
    }

    #[test]
    fn duplicate_node_ids_are_rejected() {
        let mut graph = NetworkGraph::new();
        assert!(graph
            .add_node(NodeId::new(NodeType::Basin, 1), PRIMARY_SUBNETWORK)
            .is_some());
        assert!(graph
            .add_node(NodeId::new(NodeType::Basin, 1), PRIMARY_SUBNETWORK)
            .is_none());
    }

    #[test]
    fn connectivity_check_sees_undirected_components() {
        let (mut graph, _, _, _) = simple_graph();
        assert!(graph.subnetwork_connected(PRIMARY_SUBNETWORK));
        graph
            .add_node(NodeId::new(NodeType::Basin, 99), PRIMARY_SUBNETWORK)
            .unwrap();
        assert!(!graph.subnetwork_connected(PRIMARY_SUBNETWORK));
    }
}
