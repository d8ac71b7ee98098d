//! Contracts of the loop-detection collaborators: encoder/matcher, outlier
//! pruner, registration solver and pose averager.

use nalgebra::Vector3;

use crate::geometry::{PointCloud, SE3};
use crate::mapping::{InstanceId, Node, SceneGraphSnapshot};

/// One node correspondence between the local and a remote scene graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPair {
    pub local: InstanceId,
    pub remote: InstanceId,
    pub score: f32,
}

/// Point-level correspondences over matched node pairs.
///
/// `local[i]` corresponds to `remote[i]` with confidence `scores[i]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCorrespondences {
    pub local: Vec<Vector3<f64>>,
    pub remote: Vec<Vector3<f64>>,
    pub scores: Vec<f32>,
}

impl PointCorrespondences {
    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }
}

/// Scene-graph encoder and matcher.
///
/// Failures are reported through `false` / empty results, never panics.
pub trait SceneGraphEncoder {
    /// Encode the local graph nodes. Local-only, never waits on a peer.
    fn encode_local_nodes(&mut self, nodes: &[Node]);

    /// Feature vectors of the last encoded local nodes, in node order.
    fn local_features(&self) -> Vec<Vec<f32>>;

    /// Store the coarse features received from `agent`.
    ///
    /// Returns false if `timestamp` is not newer than the stored one.
    fn subscribe_remote_coarse_features(
        &mut self,
        agent: &str,
        timestamp: f64,
        node_ids: &[InstanceId],
        features: &[Vec<f32>],
    ) -> bool;

    /// Join the remote and local graphs for matching.
    fn encode_concat(
        &mut self,
        agent: &str,
        remote: &SceneGraphSnapshot,
        local: &SceneGraphSnapshot,
        dense: bool,
    ) -> bool;

    fn match_nodes(&mut self, agent: &str) -> Vec<MatchPair>;

    fn match_points(&mut self, agent: &str, pairs: &[MatchPair]) -> PointCorrespondences;
}

/// Geometric outlier pruner over node matches.
pub trait OutlierPruner {
    /// `local[i]` and `remote[i]` are the centroids of the i-th match.
    /// Returns one inlier flag per match.
    fn prune_outliers(&self, local: &[Vector3<f64>], remote: &[Vector3<f64>]) -> Vec<bool>;
}

/// Everything the registration solver may use.
pub struct RegistrationInput<'a> {
    pub local_centroids: &'a [Vector3<f64>],
    pub remote_centroids: &'a [Vector3<f64>],
    pub pair_scores: &'a [f32],
    pub correspondences: &'a PointCorrespondences,
    pub local_cloud: &'a PointCloud,
    pub remote_cloud: &'a PointCloud,
}

/// Rigid registration of the local map onto a remote map.
///
/// The returned transform maps local coordinates into the remote frame.
pub trait RegistrationSolver {
    fn estimate_pose(&self, input: &RegistrationInput<'_>) -> Option<SE3>;

    fn refine(&self, local: &PointCloud, remote: &PointCloud, initial: &SE3) -> SE3;
}

/// Robust fusion of several pose estimates.
pub trait PoseAverager {
    /// `poses` is ordered oldest first and never empty.
    fn average(&self, poses: &[SE3]) -> SE3;
}
