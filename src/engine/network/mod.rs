// ABOUTME: Network layer - typed identifiers, arena graph, and the model builder
// ABOUTME: Topology and parameters are assembled and validated here before any state exists

pub mod builder;
pub mod graph;
pub mod id;

pub use builder::ModelBuilder;
pub use graph::{NetworkGraph, PRIMARY_SUBNETWORK};
pub use id::{LinkIndex, LinkType, NodeId, NodeIndex, NodeType};
