//! Messages exchanged between agents.
//!
//! Every message is postcard-encoded. On TCP links it travels inside a
//! length-prefixed frame (see [`super::transport`]).

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::mapping::{InstanceId, NodeSummary, SceneGraphSnapshot};

use super::error::{ExchangeError, Result};

/// Node summary as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireNode {
    pub id: InstanceId,
    pub label: String,
    pub centroid: [f64; 3],
}

/// Scene-graph broadcast of one agent.
///
/// `features[i]` belongs to `nodes[i]`. Dense payloads carry points and the
/// owning node id of each point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphPayload {
    pub sender: String,
    pub frame_id: u32,
    /// Sender clock, seconds. Strictly increasing per sender.
    pub timestamp: f64,
    pub dense: bool,
    pub nodes: Vec<WireNode>,
    pub features: Vec<Vec<f32>>,
    pub points: Vec<[f32; 3]>,
    pub point_owners: Vec<InstanceId>,
}

impl GraphPayload {
    pub fn from_snapshot(
        sender: &str,
        frame_id: u32,
        timestamp: f64,
        snapshot: &SceneGraphSnapshot,
        features: Vec<Vec<f32>>,
    ) -> Self {
        Self {
            sender: sender.to_string(),
            frame_id,
            timestamp,
            dense: snapshot.is_dense(),
            nodes: snapshot
                .nodes
                .iter()
                .map(|n| WireNode {
                    id: n.id,
                    label: n.label.clone(),
                    centroid: [n.centroid.x, n.centroid.y, n.centroid.z],
                })
                .collect(),
            features,
            points: snapshot
                .points
                .iter()
                .map(|p| [p.x as f32, p.y as f32, p.z as f32])
                .collect(),
            point_owners: snapshot.point_owners.clone(),
        }
    }

    pub fn node_summaries(&self) -> Vec<NodeSummary> {
        self.nodes
            .iter()
            .map(|n| NodeSummary {
                id: n.id,
                label: n.label.clone(),
                centroid: Vector3::from(n.centroid),
            })
            .collect()
    }

    pub fn points_f64(&self) -> Vec<Vector3<f64>> {
        self.points
            .iter()
            .map(|p| Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64))
            .collect()
    }
}

/// One-shot request asking the receiver to export dense data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseRequest {
    pub sender: String,
    pub frame_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExchangeMessage {
    Graph(GraphPayload),
    DenseRequest(DenseRequest),
}

impl ExchangeMessage {
    pub fn sender(&self) -> &str {
        match self {
            ExchangeMessage::Graph(g) => &g.sender,
            ExchangeMessage::DenseRequest(r) => &r.sender,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| ExchangeError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(|e| ExchangeError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Granularity;

    #[test]
    fn test_dense_snapshot_to_payload() {
        let mut snapshot = SceneGraphSnapshot::empty(Granularity::Dense);
        snapshot.nodes.push(NodeSummary {
            id: 4,
            label: "bed".into(),
            centroid: Vector3::new(1.0, 2.0, 3.0),
        });
        snapshot.points.push(Vector3::new(1.5, 2.0, 3.0));
        snapshot.point_owners.push(4);

        let payload = GraphPayload::from_snapshot("agent_a", 12, 3.5, &snapshot, vec![vec![0.5; 3]]);
        assert!(payload.dense);
        assert_eq!(payload.node_summaries(), snapshot.nodes);
        assert_eq!(payload.points_f64(), snapshot.points);

        let msg = ExchangeMessage::Graph(payload);
        let decoded = ExchangeMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.sender(), "agent_a");
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            ExchangeMessage::decode(&[0xff, 0xff, 0xff]),
            Err(ExchangeError::Decode(_))
        ));
    }
}
