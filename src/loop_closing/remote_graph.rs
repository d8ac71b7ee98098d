//! Local shadow of a remote agent's scene graph.

use std::collections::BTreeMap;

use nalgebra::Vector3;

use crate::geometry::PointCloud;
use crate::mapping::{Granularity, InstanceId, NodeSummary, SceneGraphSnapshot};

/// Remote nodes merged across deliveries.
///
/// Node ids are keys: a newer delivery overwrites the stored node. Updates
/// older than or as old as the last accepted one are ignored.
#[derive(Debug, Clone, Default)]
pub struct RemoteGraph {
    nodes: BTreeMap<InstanceId, NodeSummary>,
    points: BTreeMap<InstanceId, Vec<Vector3<f64>>>,
    timestamp: Option<f64>,
}

impl RemoteGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn point_count(&self) -> usize {
        self.points.values().map(Vec::len).sum()
    }

    pub fn node(&self, id: InstanceId) -> Option<&NodeSummary> {
        self.nodes.get(&id)
    }

    /// Merge coarse nodes. Returns the number of nodes written.
    pub fn subscribe_nodes(&mut self, timestamp: f64, nodes: &[NodeSummary]) -> usize {
        if self.timestamp.is_some_and(|last| timestamp <= last) {
            return 0;
        }
        self.timestamp = Some(timestamp);
        for node in nodes {
            self.nodes.insert(node.id, node.clone());
        }
        nodes.len()
    }

    /// Replace the dense points of every node present in the payload.
    /// Only accepted for the delivery whose nodes were last merged.
    pub fn subscribe_dense_points(
        &mut self,
        timestamp: f64,
        points: &[Vector3<f64>],
        owners: &[InstanceId],
    ) -> usize {
        if self.timestamp != Some(timestamp) || points.len() != owners.len() {
            return 0;
        }

        let mut grouped: BTreeMap<InstanceId, Vec<Vector3<f64>>> = BTreeMap::new();
        for (p, owner) in points.iter().zip(owners) {
            if self.nodes.contains_key(owner) {
                grouped.entry(*owner).or_default().push(*p);
            }
        }

        let written = grouped.values().map(Vec::len).sum();
        self.points.extend(grouped);
        written
    }

    pub fn centroids(&self) -> Vec<Vector3<f64>> {
        self.nodes.values().map(|n| n.centroid).collect()
    }

    /// All known remote points in one cloud.
    pub fn cloud(&self) -> PointCloud {
        PointCloud::from_points(self.points.values().flatten().copied().collect())
    }

    pub fn snapshot(&self) -> SceneGraphSnapshot {
        let granularity = if self.points.is_empty() {
            Granularity::Coarse
        } else {
            Granularity::Dense
        };
        let mut snapshot = SceneGraphSnapshot::empty(granularity);
        snapshot.nodes = self.nodes.values().cloned().collect();
        for (id, pts) in &self.points {
            snapshot.points.extend_from_slice(pts);
            snapshot.point_owners.extend(std::iter::repeat_n(*id, pts.len()));
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: InstanceId, x: f64) -> NodeSummary {
        NodeSummary {
            id,
            label: "chair".into(),
            centroid: Vector3::new(x, 0.0, 0.0),
        }
    }

    #[test]
    fn test_latest_delivery_overwrites_nodes() {
        let mut graph = RemoteGraph::new();
        assert_eq!(graph.subscribe_nodes(1.0, &[node(1, 0.0), node(2, 1.0)]), 2);
        assert_eq!(graph.subscribe_nodes(2.0, &[node(2, 5.0), node(3, 2.0)]), 2);

        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.node(2).unwrap().centroid.x, 5.0);
    }

    #[test]
    fn test_stale_and_equal_timestamps_are_ignored() {
        let mut graph = RemoteGraph::new();
        graph.subscribe_nodes(2.0, &[node(1, 0.0)]);
        assert_eq!(graph.subscribe_nodes(2.0, &[node(1, 9.0)]), 0);
        assert_eq!(graph.subscribe_nodes(1.0, &[node(1, 9.0)]), 0);
        assert_eq!(graph.node(1).unwrap().centroid.x, 0.0);
        assert_eq!(graph.timestamp(), Some(2.0));
    }

    #[test]
    fn test_dense_points_follow_node_update() {
        let mut graph = RemoteGraph::new();
        graph.subscribe_nodes(1.0, &[node(1, 0.0)]);

        let pts = vec![Vector3::zeros(), Vector3::new(0.1, 0.0, 0.0), Vector3::new(9.0, 0.0, 0.0)];
        // Owner 7 is not a known node.
        assert_eq!(graph.subscribe_dense_points(1.0, &pts, &[1, 1, 7]), 2);
        assert_eq!(graph.subscribe_dense_points(0.5, &pts, &[1, 1, 1]), 0);

        let snapshot = graph.snapshot();
        assert!(snapshot.is_dense());
        assert_eq!(snapshot.node_points(1).len(), 2);
        assert_eq!(graph.cloud().len(), 2);
    }
}
