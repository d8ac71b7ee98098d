//! HistogramEncoder - label-histogram node descriptors and matching.
//!
//! A node descriptor concatenates a one-hot of its own label with a histogram
//! of its neighbours' labels (labels hashed into a fixed number of bins).
//! Nodes are matched by mutual nearest neighbour on cosine similarity, points
//! by nearest neighbour after aligning the matched nodes' centroids.

use std::collections::{BTreeMap, HashMap};

use nalgebra::Vector3;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::mapping::{InstanceId, Node, SceneGraphSnapshot};

use super::traits::{MatchPair, PointCorrespondences, SceneGraphEncoder};

/// Configuration for the histogram encoder and matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Number of label bins. Descriptors have twice this length.
    pub label_bins: usize,

    /// Weight of the neighbour histogram against the own-label one-hot.
    pub neighbor_weight: f32,

    /// Minimum cosine similarity of a node match.
    pub match_threshold: f32,

    /// Points sampled per matched local node.
    pub point_samples: usize,

    /// Maximum distance (meters) of a point correspondence after alignment.
    pub point_match_distance: f64,

    /// Seed of the point sub-sampler.
    pub seed: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            label_bins: 32,
            neighbor_weight: 0.5,
            match_threshold: 0.8,
            point_samples: 256,
            point_match_distance: 0.2,
            seed: 42,
        }
    }
}

#[derive(Debug, Default)]
struct RemoteEntry {
    timestamp: Option<f64>,
    features: BTreeMap<InstanceId, Vec<f32>>,
    remote: Option<SceneGraphSnapshot>,
    local: Option<SceneGraphSnapshot>,
    dense: bool,
}

pub struct HistogramEncoder {
    config: EncoderConfig,
    local_ids: Vec<InstanceId>,
    local_features: Vec<Vec<f32>>,
    remotes: HashMap<String, RemoteEntry>,
    rng: StdRng,
}

/// FNV-1a hash of a label.
fn label_hash(label: &str) -> u64 {
    label.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na < 1e-9 || nb < 1e-9 {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn mean(points: &[Vector3<f64>]) -> Vector3<f64> {
    points.iter().sum::<Vector3<f64>>() / points.len().max(1) as f64
}

impl HistogramEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            local_ids: Vec::new(),
            local_features: Vec::new(),
            remotes: HashMap::new(),
            rng,
        }
    }

    fn bin(&self, label: &str) -> usize {
        (label_hash(label) % self.config.label_bins.max(1) as u64) as usize
    }

    /// Number of remote descriptors stored for `agent`.
    pub fn remote_feature_count(&self, agent: &str) -> usize {
        self.remotes.get(agent).map_or(0, |e| e.features.len())
    }
}

impl SceneGraphEncoder for HistogramEncoder {
    fn encode_local_nodes(&mut self, nodes: &[Node]) {
        let bins = self.config.label_bins.max(1);
        let labels: HashMap<InstanceId, &str> =
            nodes.iter().map(|n| (n.id, n.label.as_str())).collect();

        self.local_ids = nodes.iter().map(|n| n.id).collect();
        self.local_features = nodes
            .iter()
            .map(|node| {
                let mut feature = vec![0.0f32; 2 * bins];
                feature[self.bin(&node.label)] = 1.0;

                let mut histogram = vec![0.0f32; bins];
                for neighbor in &node.neighbors {
                    if let Some(label) = labels.get(neighbor) {
                        histogram[self.bin(label)] += 1.0;
                    }
                }
                let norm = histogram.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for (slot, h) in feature[bins..].iter_mut().zip(&histogram) {
                        *slot = self.config.neighbor_weight * h / norm;
                    }
                }

                let total = feature.iter().map(|x| x * x).sum::<f32>().sqrt();
                feature.iter_mut().for_each(|x| *x /= total);
                feature
            })
            .collect();
    }

    fn local_features(&self) -> Vec<Vec<f32>> {
        self.local_features.clone()
    }

    fn subscribe_remote_coarse_features(
        &mut self,
        agent: &str,
        timestamp: f64,
        node_ids: &[InstanceId],
        features: &[Vec<f32>],
    ) -> bool {
        if node_ids.len() != features.len() {
            return false;
        }
        let entry = self.remotes.entry(agent.to_string()).or_default();
        if entry.timestamp.is_some_and(|last| timestamp <= last) {
            return false;
        }
        entry.timestamp = Some(timestamp);
        for (id, feature) in node_ids.iter().zip(features) {
            entry.features.insert(*id, feature.clone());
        }
        true
    }

    fn encode_concat(
        &mut self,
        agent: &str,
        remote: &SceneGraphSnapshot,
        local: &SceneGraphSnapshot,
        dense: bool,
    ) -> bool {
        let Some(entry) = self.remotes.get_mut(agent) else {
            return false;
        };
        if remote.node_count() == 0 || local.node_count() == 0 || entry.features.is_empty() {
            return false;
        }
        entry.remote = Some(remote.clone());
        entry.local = Some(local.clone());
        entry.dense = dense && remote.is_dense() && local.is_dense();
        true
    }

    fn match_nodes(&mut self, agent: &str) -> Vec<MatchPair> {
        let Some(entry) = self.remotes.get(agent) else {
            return Vec::new();
        };
        let Some(remote) = &entry.remote else {
            return Vec::new();
        };

        let remote_feats: Vec<(InstanceId, &Vec<f32>)> = remote
            .nodes
            .iter()
            .filter_map(|n| entry.features.get(&n.id).map(|f| (n.id, f)))
            .collect();
        if remote_feats.is_empty() || self.local_features.is_empty() {
            return Vec::new();
        }

        let n_local = self.local_features.len();
        let n_remote = remote_feats.len();
        let mut similarity = vec![vec![0.0f32; n_remote]; n_local];
        for (i, lf) in self.local_features.iter().enumerate() {
            for (j, (_, rf)) in remote_feats.iter().enumerate() {
                similarity[i][j] = cosine(lf, rf);
            }
        }

        let best_for_remote: Vec<usize> = (0..n_remote)
            .map(|j| {
                (0..n_local)
                    .max_by(|&a, &b| similarity[a][j].total_cmp(&similarity[b][j]))
                    .unwrap_or(0)
            })
            .collect();

        let mut pairs = Vec::new();
        for (i, row) in similarity.iter().enumerate() {
            let Some((j, score)) = row
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score >= self.config.match_threshold && best_for_remote[j] == i {
                pairs.push(MatchPair {
                    local: self.local_ids[i],
                    remote: remote_feats[j].0,
                    score,
                });
            }
        }

        debug!("{}: {} mutual node matches", agent, pairs.len());
        pairs
    }

    fn match_points(&mut self, agent: &str, pairs: &[MatchPair]) -> PointCorrespondences {
        let mut corr = PointCorrespondences::default();
        let Some(entry) = self.remotes.get(agent) else {
            return corr;
        };
        let (Some(remote), Some(local)) = (&entry.remote, &entry.local) else {
            return corr;
        };
        if !entry.dense {
            return corr;
        }

        let max_dist = self.config.point_match_distance;
        for pair in pairs {
            let local_pts = local.node_points(pair.local);
            let remote_pts = remote.node_points(pair.remote);
            if local_pts.is_empty() || remote_pts.is_empty() {
                continue;
            }
            let offset = mean(&remote_pts) - mean(&local_pts);

            let sampled: Vec<Vector3<f64>> = local_pts
                .choose_multiple(&mut self.rng, self.config.point_samples)
                .copied()
                .collect();
            for p in sampled {
                let query = p + offset;
                let nearest = remote_pts
                    .iter()
                    .map(|r| (r, (r - query).norm()))
                    .min_by(|a, b| a.1.total_cmp(&b.1));
                if let Some((r, dist)) = nearest {
                    if dist <= max_dist {
                        corr.local.push(p);
                        corr.remote.push(*r);
                        corr.scores.push(pair.score * (1.0 - (dist / max_dist) as f32 * 0.5));
                    }
                }
            }
        }

        corr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PointCloud;
    use crate::mapping::{Granularity, NodeSummary};

    fn node(id: InstanceId, label: &str, x: f64, neighbors: Vec<InstanceId>) -> Node {
        let centroid = Vector3::new(x, 0.0, 0.0);
        Node {
            id,
            label: label.to_string(),
            centroid,
            points: PointCloud::from_points(vec![
                centroid,
                centroid + Vector3::new(0.05, 0.0, 0.0),
                centroid + Vector3::new(0.0, 0.05, 0.0),
            ]),
            neighbors,
        }
    }

    fn graph() -> Vec<Node> {
        vec![
            node(1, "chair", 0.0, vec![2]),
            node(2, "table", 1.0, vec![1, 3]),
            node(3, "sofa", 2.0, vec![2]),
        ]
    }

    fn snapshot(nodes: &[Node], dense: bool) -> SceneGraphSnapshot {
        let granularity = if dense { Granularity::Dense } else { Granularity::Coarse };
        let mut snap = SceneGraphSnapshot::empty(granularity);
        for n in nodes {
            snap.nodes.push(NodeSummary {
                id: n.id,
                label: n.label.clone(),
                centroid: n.centroid,
            });
            if dense {
                snap.points.extend_from_slice(&n.points.points);
                snap.point_owners.extend(std::iter::repeat_n(n.id, n.points.len()));
            }
        }
        snap
    }

    #[test]
    fn test_features_are_normalized() {
        let mut encoder = HistogramEncoder::new(EncoderConfig::default());
        encoder.encode_local_nodes(&graph());
        for f in encoder.local_features() {
            let norm: f32 = f.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_identical_graphs_match_mutually() {
        let local = graph();
        let mut remote_encoder = HistogramEncoder::new(EncoderConfig::default());
        remote_encoder.encode_local_nodes(&local);

        let mut encoder = HistogramEncoder::new(EncoderConfig::default());
        encoder.encode_local_nodes(&local);
        assert!(encoder.subscribe_remote_coarse_features(
            "agent_b",
            1.0,
            &[1, 2, 3],
            &remote_encoder.local_features()
        ));
        assert!(encoder.encode_concat("agent_b", &snapshot(&local, true), &snapshot(&local, true), true));

        let pairs = encoder.match_nodes("agent_b");
        assert_eq!(pairs.len(), 3);
        assert!(pairs.iter().all(|p| p.local == p.remote));

        let corr = encoder.match_points("agent_b", &pairs);
        assert_eq!(corr.len(), 9);
    }

    #[test]
    fn test_stale_features_rejected() {
        let mut encoder = HistogramEncoder::new(EncoderConfig::default());
        let feats = vec![vec![1.0; 4]];
        assert!(encoder.subscribe_remote_coarse_features("b", 2.0, &[1], &feats));
        assert!(!encoder.subscribe_remote_coarse_features("b", 2.0, &[2], &feats));
        assert!(!encoder.subscribe_remote_coarse_features("b", 1.0, &[2], &feats));
        assert_eq!(encoder.remote_feature_count("b"), 1);
    }

    #[test]
    fn test_coarse_concat_skips_point_matching() {
        let local = graph();
        let mut encoder = HistogramEncoder::new(EncoderConfig::default());
        encoder.encode_local_nodes(&local);
        let feats = encoder.local_features();
        encoder.subscribe_remote_coarse_features("b", 1.0, &[1, 2, 3], &feats);
        assert!(encoder.encode_concat("b", &snapshot(&local, false), &snapshot(&local, true), true));

        let pairs = encoder.match_nodes("b");
        assert!(!pairs.is_empty());
        assert!(encoder.match_points("b", &pairs).is_empty());
    }

    #[test]
    fn test_concat_without_remote_data_fails() {
        let mut encoder = HistogramEncoder::new(EncoderConfig::default());
        let snap = snapshot(&graph(), false);
        assert!(!encoder.encode_concat("nobody", &snap, &snap, false));
        assert!(encoder.match_nodes("nobody").is_empty());
    }
}
