//! SceneGraph - local semantic scene graph built from active instances.
//!
//! Nodes are instances; edges connect each node to its nearest neighbours
//! within a radius; triplets are (anchor, neighbour, neighbour) combinations
//! centred on each node. The graph is rebuilt from scratch on every loop
//! attempt.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::PointCloud;

use super::traits::GraphBuilder;
use super::types::{Granularity, Instance, InstanceId, NodeSummary, SceneGraphSnapshot};

/// Configuration for scene-graph construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Maximum centroid distance (meters) for an edge.
    pub edge_radius: f64,

    /// Maximum number of neighbours kept per node.
    pub max_neighbors: usize,

    /// Maximum number of triplets anchored on one node.
    pub max_triplets_per_node: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            edge_radius: 3.0,
            max_neighbors: 8,
            max_triplets_per_node: 20,
        }
    }
}

/// Scene-graph node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: InstanceId,
    pub label: String,
    pub centroid: Vector3<f64>,
    pub points: PointCloud,
    /// Ids of adjacent nodes, nearest first.
    pub neighbors: Vec<InstanceId>,
}

/// Relational triplet: an anchor node and two of its neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triplet {
    pub anchor: InstanceId,
    pub first: InstanceId,
    pub second: InstanceId,
}

pub struct SceneGraph {
    config: GraphConfig,
    nodes: Vec<Node>,
    triplets: Vec<Triplet>,
}

impl SceneGraph {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
            triplets: Vec::new(),
        }
    }

    pub fn triplets(&self) -> &[Triplet] {
        &self.triplets
    }

    pub fn edge_count(&self) -> usize {
        // Adjacency is symmetric, each edge is stored on both ends.
        self.nodes.iter().map(|n| n.neighbors.len()).sum::<usize>() / 2
    }
}

impl GraphBuilder for SceneGraph {
    fn clear(&mut self) {
        self.nodes.clear();
        self.triplets.clear();
    }

    fn initialize(&mut self, instances: &[Instance]) {
        self.clear();
        self.nodes = instances
            .iter()
            .map(|inst| Node {
                id: inst.id,
                label: inst.label.clone(),
                centroid: inst.centroid,
                points: inst.points.clone(),
                neighbors: Vec::new(),
            })
            .collect();
    }

    fn construct_edges(&mut self) -> usize {
        let n = self.nodes.len();
        let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];

        for i in 0..n {
            for j in (i + 1)..n {
                let dist = (self.nodes[i].centroid - self.nodes[j].centroid).norm();
                if dist <= self.config.edge_radius {
                    adjacency[i].push((j, dist));
                    adjacency[j].push((i, dist));
                }
            }
        }

        for candidates in adjacency.iter_mut() {
            candidates.sort_by(|a, b| a.1.total_cmp(&b.1));
            candidates.truncate(self.config.max_neighbors);
        }

        // Keep an edge only if both ends retained it.
        let ids: Vec<InstanceId> = self.nodes.iter().map(|n| n.id).collect();
        for i in 0..n {
            let neighbors = adjacency[i]
                .iter()
                .filter(|(j, _)| adjacency[*j].iter().any(|(k, _)| *k == i))
                .map(|(j, _)| ids[*j])
                .collect();
            self.nodes[i].neighbors = neighbors;
        }

        self.edge_count()
    }

    fn construct_triplets(&mut self) -> usize {
        self.triplets.clear();
        for node in &self.nodes {
            let mut count = 0;
            'anchor: for (a, &first) in node.neighbors.iter().enumerate() {
                for &second in &node.neighbors[a + 1..] {
                    if count >= self.config.max_triplets_per_node {
                        break 'anchor;
                    }
                    self.triplets.push(Triplet {
                        anchor: node.id,
                        first,
                        second,
                    });
                    count += 1;
                }
            }
        }
        self.triplets.len()
    }

    fn extract_snapshot(&self, granularity: Granularity) -> SceneGraphSnapshot {
        let mut snapshot = SceneGraphSnapshot::empty(granularity);
        snapshot.nodes = self
            .nodes
            .iter()
            .map(|n| NodeSummary {
                id: n.id,
                label: n.label.clone(),
                centroid: n.centroid,
            })
            .collect();

        if granularity == Granularity::Dense {
            for node in &self.nodes {
                snapshot.points.extend_from_slice(&node.points.points);
                snapshot
                    .point_owners
                    .extend(std::iter::repeat_n(node.id, node.points.len()));
            }
        }

        snapshot
    }

    fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: InstanceId, label: &str, x: f64) -> Instance {
        let centroid = Vector3::new(x, 0.0, 0.0);
        Instance {
            id,
            label: label.to_string(),
            points: PointCloud::from_points(vec![centroid, centroid + Vector3::new(0.0, 0.1, 0.0)]),
            centroid,
            observations: 1,
            last_observed_frame: 0,
            bbox: None,
        }
    }

    fn line_graph() -> SceneGraph {
        let mut graph = SceneGraph::new(GraphConfig {
            edge_radius: 1.5,
            ..GraphConfig::default()
        });
        graph.initialize(&[
            instance(1, "chair", 0.0),
            instance(2, "table", 1.0),
            instance(3, "sofa", 2.0),
            instance(4, "lamp", 10.0),
        ]);
        graph
    }

    #[test]
    fn test_edges_within_radius() {
        let mut graph = line_graph();
        assert_eq!(graph.construct_edges(), 2);

        let table = &graph.nodes()[1];
        assert_eq!(table.neighbors.len(), 2);
        assert!(graph.nodes()[3].neighbors.is_empty());
    }

    #[test]
    fn test_triplets_anchor_on_nodes_with_two_neighbors() {
        let mut graph = line_graph();
        graph.construct_edges();
        assert_eq!(graph.construct_triplets(), 1);
        assert_eq!(graph.triplets()[0].anchor, 2);
    }

    #[test]
    fn test_rebuild_does_not_carry_edges_over() {
        let mut graph = line_graph();
        graph.construct_edges();
        graph.initialize(&[instance(7, "chair", 0.0)]);

        assert_eq!(graph.nodes().len(), 1);
        assert!(graph.nodes()[0].neighbors.is_empty());
        assert!(graph.triplets().is_empty());
    }

    #[test]
    fn test_dense_snapshot_carries_point_owners() {
        let graph = line_graph();
        let coarse = graph.extract_snapshot(Granularity::Coarse);
        let dense = graph.extract_snapshot(Granularity::Dense);

        assert_eq!(coarse.node_count(), 4);
        assert_eq!(coarse.point_count(), 0);
        assert_eq!(dense.point_count(), 8);
        assert_eq!(dense.node_points(3).len(), 2);
    }
}
