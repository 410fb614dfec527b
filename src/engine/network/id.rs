// ABOUTME: Typed node and link identifiers for the flow/control multigraph
// ABOUTME: Arena indices are plain newtypes; user-facing ids pair a node type with an integer

use std::fmt;

/// Every node type the network understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeType {
    Basin,
    LinearResistance,
    ManningResistance,
    TabulatedRatingCurve,
    Pump,
    Outlet,
    FlowBoundary,
    LevelBoundary,
    Terminal,
    Junction,
    UserDemand,
    FlowDemand,
    LevelDemand,
    DiscreteControl,
    ContinuousControl,
    PidControl,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Basin => "Basin",
            NodeType::LinearResistance => "LinearResistance",
            NodeType::ManningResistance => "ManningResistance",
            NodeType::TabulatedRatingCurve => "TabulatedRatingCurve",
            NodeType::Pump => "Pump",
            NodeType::Outlet => "Outlet",
            NodeType::FlowBoundary => "FlowBoundary",
            NodeType::LevelBoundary => "LevelBoundary",
            NodeType::Terminal => "Terminal",
            NodeType::Junction => "Junction",
            NodeType::UserDemand => "UserDemand",
            NodeType::FlowDemand => "FlowDemand",
            NodeType::LevelDemand => "LevelDemand",
            NodeType::DiscreteControl => "DiscreteControl",
            NodeType::ContinuousControl => "ContinuousControl",
            NodeType::PidControl => "PidControl",
        }
    }

    /// Allowed number of incoming/outgoing flow links, as
    /// ((in_min, in_max), (out_min, out_max)).
    pub fn flow_neighbor_bounds(&self) -> ((usize, usize), (usize, usize)) {
        const MANY: usize = usize::MAX;
        match self {
            NodeType::Basin => ((0, MANY), (0, MANY)),
            NodeType::LinearResistance
            | NodeType::ManningResistance
            | NodeType::TabulatedRatingCurve
            | NodeType::Pump
            | NodeType::Outlet => ((1, 1), (1, 1)),
            NodeType::FlowBoundary => ((0, 0), (1, 1)),
            NodeType::LevelBoundary => ((0, MANY), (0, MANY)),
            NodeType::Terminal => ((1, MANY), (0, 0)),
            NodeType::Junction => ((1, MANY), (1, MANY)),
            NodeType::UserDemand => ((1, 1), (1, 1)),
            // Demand and control nodes sit outside the flow graph.
            NodeType::FlowDemand
            | NodeType::LevelDemand
            | NodeType::DiscreteControl
            | NodeType::ContinuousControl
            | NodeType::PidControl => ((0, 0), (0, 0)),
        }
    }

    /// Connector nodes carry water between two neighbors and conserve it.
    pub fn is_connector(&self) -> bool {
        matches!(
            self,
            NodeType::LinearResistance
                | NodeType::ManningResistance
                | NodeType::TabulatedRatingCurve
                | NodeType::Pump
                | NodeType::Outlet
        )
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing node identity: type plus integer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    pub node_type: NodeType,
    pub id: i32,
}

impl NodeId {
    pub fn new(node_type: NodeType, id: i32) -> Self {
        Self { node_type, id }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.node_type, self.id)
    }
}

/// Arena index of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(pub usize);

/// Arena index of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkIndex(pub usize);

/// Links either carry water or carry a control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Flow,
    Control,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_result_table_convention() {
        let id = NodeId::new(NodeType::Basin, 7);
        assert_eq!(id.to_string(), "Basin #7");
    }

    #[test]
    fn connector_bounds_are_one_in_one_out() {
        let ((in_min, in_max), (out_min, out_max)) = NodeType::Pump.flow_neighbor_bounds();
        assert_eq!((in_min, in_max, out_min, out_max), (1, 1, 1, 1));
    }
}
