// ABOUTME: Integration state layout and the sparse flow-to-storage projection matrix
// ABOUTME: Every state entry is a cumulative volume since the last save; storage is reconstructed as S0 + F*u

use std::collections::BTreeMap;

use nalgebra::DVector;
use sprs::{CsMat, TriMat};

use crate::engine::core::error::ValidationIssue;
use crate::engine::network::graph::NetworkGraph;
use crate::engine::network::id::{LinkIndex, NodeIndex, NodeType};

/// What a cumulative-flow state entry integrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEntryKind {
    RatingCurve,
    Pump,
    Outlet,
    LinearResistance,
    ManningResistance,
    UserInflow,
    UserReturn,
    FlowBoundary,
}

impl FlowEntryKind {
    /// Single-signed entries integrate a non-negative rate; the step
    /// limiter keeps their cumulative volumes non-decreasing.
    pub fn single_signed(&self) -> bool {
        !matches!(
            self,
            FlowEntryKind::LinearResistance | FlowEntryKind::ManningResistance
        )
    }
}

/// One cumulative-flow slot: the governing node, the resolved endpoints
/// of its flow path (through junctions), and the links it carries.
#[derive(Debug, Clone)]
pub struct FlowEntry {
    pub kind: FlowEntryKind,
    pub node: NodeIndex,
    pub local: usize,
    /// Upstream endpoint and the local basin index if it is a basin.
    pub endpoint_up: Option<NodeIndex>,
    pub basin_up: Option<usize>,
    pub endpoint_down: Option<NodeIndex>,
    pub basin_down: Option<usize>,
    /// Every flow link whose flow equals this entry's rate (own links
    /// plus junction legs shared with sibling entries).
    pub links: Vec<LinkIndex>,
}

/// Named ranges of the state vector, in storage order: per-basin
/// precipitation, evaporation, drainage, infiltration, then one slot per
/// flow entry, then one integral slot per PID controller.
#[derive(Debug, Clone)]
pub struct StateLayout {
    pub n_basins: usize,
    pub n_pid: usize,
    pub flow_entries: Vec<FlowEntry>,
    pub total: usize,
}

impl StateLayout {
    pub fn precipitation_index(&self, basin: usize) -> usize {
        basin
    }

    pub fn evaporation_index(&self, basin: usize) -> usize {
        self.n_basins + basin
    }

    pub fn drainage_index(&self, basin: usize) -> usize {
        2 * self.n_basins + basin
    }

    pub fn infiltration_index(&self, basin: usize) -> usize {
        3 * self.n_basins + basin
    }

    pub fn flow_offset(&self) -> usize {
        4 * self.n_basins
    }

    pub fn flow_index(&self, entry: usize) -> usize {
        self.flow_offset() + entry
    }

    pub fn pid_integral_index(&self, pid: usize) -> usize {
        self.flow_offset() + self.flow_entries.len() + pid
    }

    /// Human-readable name of a state entry, for diagnostics.
    pub fn entry_name(&self, graph: &NetworkGraph, index: usize) -> String {
        let n = self.n_basins;
        let basin_name = |local: usize| {
            graph
                .nodes()
                .find(|node| node.id.node_type == NodeType::Basin && node.local_index == local)
                .map(|node| node.id.to_string())
                .unwrap_or_else(|| format!("Basin[{local}]"))
        };
        if index < n {
            return format!("precipitation[{}]", basin_name(index));
        }
        if index < 2 * n {
            return format!("evaporation[{}]", basin_name(index - n));
        }
        if index < 3 * n {
            return format!("drainage[{}]", basin_name(index - 2 * n));
        }
        if index < 4 * n {
            return format!("infiltration[{}]", basin_name(index - 3 * n));
        }
        let flow = index - 4 * n;
        if flow < self.flow_entries.len() {
            let entry = &self.flow_entries[flow];
            return format!("flow[{}]", graph.node(entry.node).id);
        }
        format!("pid_integral[{}]", index - 4 * n - self.flow_entries.len())
    }
}

/// Result of laying out the state: the layout, the projection matrix, and
/// a per-link index into the entries whose rates sum to that link's flow.
#[derive(Debug)]
pub struct StateMap {
    pub layout: StateLayout,
    /// (n_basins × total) sparse matrix with entries in {−1, 0, +1}.
    pub flow_to_storage: CsMat<f64>,
    /// For each flow link, the entries carrying it.
    pub link_entries: BTreeMap<LinkIndex, Vec<usize>>,
}

impl StateMap {
    /// Derive the layout from topology. `n_pid` extends the vector with
    /// PID integral slots; their columns are zero in the projection.
    pub fn build(
        graph: &NetworkGraph,
        n_pid: usize,
        issues: &mut Vec<ValidationIssue>,
    ) -> Option<StateMap> {
        let n_basins = graph
            .nodes()
            .filter(|n| n.id.node_type == NodeType::Basin)
            .count();
        let before = issues.len();
        let mut entries: Vec<FlowEntry> = Vec::new();

        // Fixed kind order keeps the layout deterministic and matches the
        // per-type grouping of the result tables.
        let connector_kinds = [
            (NodeType::TabulatedRatingCurve, FlowEntryKind::RatingCurve),
            (NodeType::Pump, FlowEntryKind::Pump),
            (NodeType::Outlet, FlowEntryKind::Outlet),
            (NodeType::LinearResistance, FlowEntryKind::LinearResistance),
            (NodeType::ManningResistance, FlowEntryKind::ManningResistance),
        ];
        for (node_type, kind) in connector_kinds {
            for node in graph.nodes().filter(|n| n.id.node_type == node_type) {
                let up = trace_endpoint(graph, node.index, Direction::Upstream, issues);
                let down = trace_endpoint(graph, node.index, Direction::Downstream, issues);
                let (Some(up), Some(down)) = (up, down) else {
                    continue;
                };
                check_endpoint(graph, node.index, &up, kind, Direction::Upstream, issues);
                check_endpoint(graph, node.index, &down, kind, Direction::Downstream, issues);
                entries.push(FlowEntry {
                    kind,
                    node: node.index,
                    local: node.local_index,
                    basin_up: basin_local(graph, up.endpoint),
                    endpoint_up: Some(up.endpoint),
                    basin_down: basin_local(graph, down.endpoint),
                    endpoint_down: Some(down.endpoint),
                    links: up.links.into_iter().chain(down.links).collect(),
                });
            }
        }
        for node in graph
            .nodes()
            .filter(|n| n.id.node_type == NodeType::UserDemand)
        {
            let up = trace_endpoint(graph, node.index, Direction::Upstream, issues);
            let Some(up) = up else { continue };
            check_endpoint(
                graph,
                node.index,
                &up,
                FlowEntryKind::UserInflow,
                Direction::Upstream,
                issues,
            );
            entries.push(FlowEntry {
                kind: FlowEntryKind::UserInflow,
                node: node.index,
                local: node.local_index,
                basin_up: basin_local(graph, up.endpoint),
                endpoint_up: Some(up.endpoint),
                basin_down: None,
                endpoint_down: None,
                links: up.links,
            });
        }
        for node in graph
            .nodes()
            .filter(|n| n.id.node_type == NodeType::UserDemand)
        {
            let down = trace_endpoint(graph, node.index, Direction::Downstream, issues);
            let Some(down) = down else { continue };
            check_endpoint(
                graph,
                node.index,
                &down,
                FlowEntryKind::UserReturn,
                Direction::Downstream,
                issues,
            );
            entries.push(FlowEntry {
                kind: FlowEntryKind::UserReturn,
                node: node.index,
                local: node.local_index,
                basin_up: None,
                endpoint_up: None,
                basin_down: basin_local(graph, down.endpoint),
                endpoint_down: Some(down.endpoint),
                links: down.links,
            });
        }
        for node in graph
            .nodes()
            .filter(|n| n.id.node_type == NodeType::FlowBoundary)
        {
            let down = trace_endpoint(graph, node.index, Direction::Downstream, issues);
            let Some(down) = down else { continue };
            entries.push(FlowEntry {
                kind: FlowEntryKind::FlowBoundary,
                node: node.index,
                local: node.local_index,
                basin_up: None,
                endpoint_up: None,
                basin_down: basin_local(graph, down.endpoint),
                endpoint_down: Some(down.endpoint),
                links: down.links,
            });
        }

        // Every flow link must be carried by at least one entry;
        // otherwise its flow would be undefined.
        let mut link_entries: BTreeMap<LinkIndex, Vec<usize>> = BTreeMap::new();
        for (i, entry) in entries.iter().enumerate() {
            for &link in &entry.links {
                link_entries.entry(link).or_default().push(i);
            }
        }
        for link in graph.flow_links() {
            if !link_entries.contains_key(&link.index) {
                issues.push(ValidationIssue::InvalidTopology {
                    message: format!(
                        "flow link {} -> {} has no governing node",
                        graph.node(link.from).id,
                        graph.node(link.to).id
                    ),
                });
            }
        }
        if issues.len() > before {
            return None;
        }

        let layout = StateLayout {
            n_basins,
            n_pid,
            total: 4 * n_basins + entries.len() + n_pid,
            flow_entries: entries,
        };

        let mut triplets = TriMat::new((n_basins, layout.total));
        for basin in 0..n_basins {
            triplets.add_triplet(basin, layout.precipitation_index(basin), 1.0);
            triplets.add_triplet(basin, layout.evaporation_index(basin), -1.0);
            triplets.add_triplet(basin, layout.drainage_index(basin), 1.0);
            triplets.add_triplet(basin, layout.infiltration_index(basin), -1.0);
        }
        for (i, entry) in layout.flow_entries.iter().enumerate() {
            if let Some(basin) = entry.basin_up {
                triplets.add_triplet(basin, layout.flow_index(i), -1.0);
            }
            if let Some(basin) = entry.basin_down {
                triplets.add_triplet(basin, layout.flow_index(i), 1.0);
            }
        }
        let flow_to_storage = triplets.to_csr();

        Some(StateMap {
            layout,
            flow_to_storage,
            link_entries,
        })
    }

    /// Reconstruct basin storages from cumulative state: S0 + F·u.
    pub fn storages(&self, s0: &[f64], u: &DVector<f64>) -> Vec<f64> {
        let mut result = s0.to_vec();
        for (row, vec) in self.flow_to_storage.outer_iterator().enumerate() {
            let mut sum = 0.0;
            for (col, &val) in vec.iter() {
                sum += val * u[col];
            }
            result[row] += sum;
        }
        result
    }

    /// dS/dt for one basin given the current derivative vector, with the
    /// column `skip` left out (used to close the PID equation).
    pub fn storage_rate_excluding(&self, basin: usize, du: &DVector<f64>, skip: usize) -> f64 {
        let row = self.flow_to_storage.outer_view(basin).unwrap();
        let mut sum = 0.0;
        for (col, &val) in row.iter() {
            if col != skip {
                sum += val * du[col];
            }
        }
        sum
    }

    /// The signed coefficient of state column `col` in basin `basin`'s
    /// balance, 0.0 when the entry does not touch the basin.
    pub fn projection_coefficient(&self, basin: usize, col: usize) -> f64 {
        let row = self.flow_to_storage.outer_view(basin).unwrap();
        row.iter()
            .find(|(c, _)| *c == col)
            .map(|(_, &v)| v)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upstream,
    Downstream,
}

/// Where a trace landed and the links it walked over.
struct Trace {
    endpoint: NodeIndex,
    links: Vec<LinkIndex>,
}

fn basin_local(graph: &NetworkGraph, node: NodeIndex) -> Option<usize> {
    let n = graph.node(node);
    (n.id.node_type == NodeType::Basin).then_some(n.local_index)
}

/// Walk from a flow-defining node through junctions to the physical
/// endpoint. Junction fan-in/fan-out is permitted only on the side facing
/// the defining nodes, so each junction passed has exactly one link on
/// the walked side.
fn trace_endpoint(
    graph: &NetworkGraph,
    node: NodeIndex,
    direction: Direction,
    issues: &mut Vec<ValidationIssue>,
) -> Option<Trace> {
    let mut links = Vec::new();
    let mut current = node;
    loop {
        let step = match direction {
            Direction::Upstream => graph.inflow_links(current).first().copied(),
            Direction::Downstream => graph.outflow_links(current).first().copied(),
        };
        let Some(link_index) = step else {
            issues.push(ValidationIssue::InvalidTopology {
                message: format!(
                    "{}: missing {} flow link",
                    graph.node(node).id,
                    match direction {
                        Direction::Upstream => "inflow",
                        Direction::Downstream => "outflow",
                    }
                ),
            });
            return None;
        };
        let link = graph.link(link_index);
        links.push(link_index);
        let next = match direction {
            Direction::Upstream => link.from,
            Direction::Downstream => link.to,
        };
        if graph.node(next).id.node_type != NodeType::Junction {
            return Some(Trace {
                endpoint: next,
                links,
            });
        }
        // Passing through a junction: the far side must be a single link.
        let far_side = match direction {
            Direction::Upstream => graph.inflow_links(next),
            Direction::Downstream => graph.outflow_links(next),
        };
        if far_side.len() != 1 {
            issues.push(ValidationIssue::InvalidTopology {
                message: format!(
                    "{}: junction fan-{} on the basin side makes flow indeterminate",
                    graph.node(next).id,
                    match direction {
                        Direction::Upstream => "in",
                        Direction::Downstream => "out",
                    }
                ),
            });
            return None;
        }
        current = next;
    }
}

/// Endpoint admissibility per entry kind: level-driven connectors need a
/// water level on both sides; rate-driven nodes may discharge anywhere.
fn check_endpoint(
    graph: &NetworkGraph,
    node: NodeIndex,
    trace: &Trace,
    kind: FlowEntryKind,
    direction: Direction,
    issues: &mut Vec<ValidationIssue>,
) {
    let endpoint_type = graph.node(trace.endpoint).id.node_type;
    let allowed: &[NodeType] = match (kind, direction) {
        (FlowEntryKind::UserInflow, Direction::Upstream) => &[NodeType::Basin],
        (_, Direction::Upstream) => &[NodeType::Basin, NodeType::LevelBoundary],
        (FlowEntryKind::LinearResistance | FlowEntryKind::ManningResistance, Direction::Downstream) => {
            &[NodeType::Basin, NodeType::LevelBoundary]
        }
        (_, Direction::Downstream) => {
            &[NodeType::Basin, NodeType::LevelBoundary, NodeType::Terminal]
        }
    };
    if !allowed.contains(&endpoint_type) {
        issues.push(ValidationIssue::InvalidTopology {
            message: format!(
                "{}: {} endpoint {} has unsupported type {}",
                graph.node(node).id,
                match direction {
                    Direction::Upstream => "upstream",
                    Direction::Downstream => "downstream",
                },
                graph.node(trace.endpoint).id,
                endpoint_type
            ),
        });
    }
}
