//! Contracts of the mapping collaborators consumed by the loop pipeline.

use std::path::Path;

use anyhow::Result;
use nalgebra::Vector3;

use crate::geometry::{PointCloud, SE3};

use super::scene_graph::Node;
use super::types::{Detection, Granularity, Instance, RgbdImage, SceneGraphSnapshot};

/// Incremental semantic mapping engine.
///
/// The orchestrator only feeds frames in and exports instances out; how
/// instances are fused is up to the implementation.
pub trait MappingEngine {
    /// Integrate one frame. Ownership of the images and detections moves into
    /// the engine.
    fn integrate(
        &mut self,
        frame_id: u32,
        rgbd: RgbdImage,
        pose: &SE3,
        detections: Vec<Detection>,
    );

    /// Instances observed at or after `window_start`, ordered by id.
    fn export_instances(&self, window_start: u32) -> Vec<Instance>;

    /// All instance points merged into one cloud, voxel down-sampled.
    fn export_global_point_cloud(&self, voxel_size: f64) -> PointCloud;

    fn export_instance_centroids(&self) -> Vec<Vector3<f64>>;

    fn instance_count(&self) -> usize;

    // Post-sequence processing.

    fn extract_point_cloud(&mut self);

    /// Returns the number of instances merged away.
    fn merge_overlap_instances(&mut self) -> usize;

    /// Returns the number of structural instances merged away.
    fn merge_overlap_structural_instances(&mut self) -> usize;

    fn extract_bounding_boxes(&mut self);

    fn save(&self, dir: &Path) -> Result<()>;
}

/// Builds the local scene graph from the currently active instances.
pub trait GraphBuilder {
    fn clear(&mut self);

    fn initialize(&mut self, instances: &[Instance]);

    /// Returns the number of edges.
    fn construct_edges(&mut self) -> usize;

    /// Returns the number of triplets.
    fn construct_triplets(&mut self) -> usize;

    fn extract_snapshot(&self, granularity: Granularity) -> SceneGraphSnapshot;

    fn nodes(&self) -> &[Node];
}
