//! Visualization sinks.
//!
//! Render calls are fire-and-forget: a sink never fails the caller.

pub mod rerun;

use image::RgbImage;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::{PointCloud, SE3};

pub use self::rerun::RerunVisualizer;

/// Visualization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VizConfig {
    /// Spawn a viewer and stream to it.
    pub enabled: bool,

    /// Recording application id.
    pub app_id: String,

    /// Radius of rendered instance centroids (meters).
    pub centroid_radius: f32,

    /// Display offset applied to local geometry in correspondence views.
    pub local_frame_offset: [f64; 3],
}

impl Default for VizConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            app_id: "sgloop-online".into(),
            centroid_radius: 0.1,
            local_frame_offset: [0.0, 0.0, 0.0],
        }
    }
}

pub trait VisualizationSink {
    /// False when nobody consumes the output; callers skip costly work.
    fn is_enabled(&self) -> bool;

    fn set_frame(&mut self, frame_id: u32);

    fn render_image(&self, image: &RgbImage);

    fn render_camera_pose(&self, pose: &SE3);

    /// Append the pose to the rendered path.
    fn render_path(&mut self, pose: &SE3);

    fn render_local_centroids(&self, centroids: &[Vector3<f64>]);

    fn render_remote_centroids(&self, agent: &str, centroids: &[Vector3<f64>]);

    fn render_local_map(&self, cloud: &PointCloud);

    fn render_correspondences(&self, agent: &str, local: &[Vector3<f64>], remote: &[Vector3<f64>]);

    /// Local map already transformed into the remote frame.
    fn render_aligned_map(&self, agent: &str, cloud: &PointCloud);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullVisualizer;

impl VisualizationSink for NullVisualizer {
    fn is_enabled(&self) -> bool {
        false
    }

    fn set_frame(&mut self, _frame_id: u32) {}

    fn render_image(&self, _image: &RgbImage) {}

    fn render_camera_pose(&self, _pose: &SE3) {}

    fn render_path(&mut self, _pose: &SE3) {}

    fn render_local_centroids(&self, _centroids: &[Vector3<f64>]) {}

    fn render_remote_centroids(&self, _agent: &str, _centroids: &[Vector3<f64>]) {}

    fn render_local_map(&self, _cloud: &PointCloud) {}

    fn render_correspondences(&self, _agent: &str, _local: &[Vector3<f64>], _remote: &[Vector3<f64>]) {}

    fn render_aligned_map(&self, _agent: &str, _cloud: &PointCloud) {}
}
