//! Rerun-based visualization of one agent.
//!
//! Entity hierarchy (`<agent>` is the local agent name):
//!     <agent>/camera/image          - Color image of the current frame
//!     <agent>/world/camera          - Current camera pose
//!     <agent>/world/path            - Camera path
//!     <agent>/world/centroids       - Local instance centroids
//!     <agent>/world/map             - Active local map
//!     <agent>/remote/<r>/centroids  - Centroids received from remote agent r
//!     <agent>/remote/<r>/matches    - Instance correspondences with r
//!     <agent>/remote/<r>/aligned    - Local map aligned into r's frame

use nalgebra::Vector3;
use rerun::{RecordingStream, external::glam};
use tracing::warn;

use image::RgbImage;

use crate::geometry::{PointCloud, SE3};

use super::{VisualizationSink, VizConfig};

const LOCAL_COLOR: [u8; 3] = [0, 180, 255];
const REMOTE_COLOR: [u8; 3] = [255, 0, 0];
const ALIGNED_COLOR: [u8; 3] = [0, 180, 180];

fn to_f32(points: &[Vector3<f64>]) -> Vec<[f32; 3]> {
    points
        .iter()
        .map(|p| [p.x as f32, p.y as f32, p.z as f32])
        .collect()
}

pub struct RerunVisualizer {
    rec: RecordingStream,
    agent: String,
    config: VizConfig,
    path: Vec<[f32; 3]>,
}

impl RerunVisualizer {
    /// Spawn a viewer. Falls back to a disabled stream if the viewer cannot
    /// be started.
    pub fn new(agent: &str, config: VizConfig) -> Self {
        let rec = match rerun::RecordingStreamBuilder::new(config.app_id.as_str()).spawn() {
            Ok(rec) => rec,
            Err(e) => {
                warn!("Failed to spawn rerun viewer: {}. Visualization disabled.", e);
                RecordingStream::disabled()
            }
        };
        rec.log_static(format!("{}/world", agent), &rerun::ViewCoordinates::RDF())
            .ok();

        Self {
            rec,
            agent: agent.to_string(),
            config,
            path: Vec::new(),
        }
    }

    fn entity(&self, suffix: &str) -> String {
        format!("{}/{}", self.agent, suffix)
    }

    fn log_cloud(&self, entity: String, cloud: &PointCloud, fallback: [u8; 3]) {
        if cloud.is_empty() {
            return;
        }
        let points = rerun::Points3D::new(to_f32(&cloud.points)).with_radii([0.01f32]);
        let points = if cloud.has_colors() {
            points.with_colors(cloud.colors.clone())
        } else {
            points.with_colors([fallback])
        };
        self.rec.log(entity, &points).ok();
    }
}

impl VisualizationSink for RerunVisualizer {
    fn is_enabled(&self) -> bool {
        self.rec.is_enabled()
    }

    fn set_frame(&mut self, frame_id: u32) {
        self.rec.set_time_sequence("frame", frame_id as i64);
    }

    fn render_image(&self, image: &RgbImage) {
        if !self.is_enabled() {
            return;
        }
        let (width, height) = image.dimensions();
        self.rec
            .log(
                self.entity("camera/image"),
                &rerun::Image::from_rgb24(image.as_raw().clone(), [width, height]),
            )
            .ok();
    }

    fn render_camera_pose(&self, pose: &SE3) {
        let translation = glam::Vec3::new(
            pose.translation.x as f32,
            pose.translation.y as f32,
            pose.translation.z as f32,
        );
        let rotation = glam::Quat::from_xyzw(
            pose.rotation.coords.x as f32,
            pose.rotation.coords.y as f32,
            pose.rotation.coords.z as f32,
            pose.rotation.w as f32,
        );
        self.rec
            .log(
                self.entity("world/camera"),
                &rerun::Transform3D::from_translation_rotation(translation, rotation),
            )
            .ok();
    }

    fn render_path(&mut self, pose: &SE3) {
        let t = pose.translation;
        self.path.push([t.x as f32, t.y as f32, t.z as f32]);
        if self.path.len() < 2 || !self.is_enabled() {
            return;
        }
        self.rec
            .log(
                self.entity("world/path"),
                &rerun::LineStrips3D::new([self.path.clone()])
                    .with_colors([[128u8, 128, 128]])
                    .with_radii([0.005f32]),
            )
            .ok();
    }

    fn render_local_centroids(&self, centroids: &[Vector3<f64>]) {
        if centroids.is_empty() {
            return;
        }
        self.rec
            .log(
                self.entity("world/centroids"),
                &rerun::Points3D::new(to_f32(centroids))
                    .with_colors([LOCAL_COLOR])
                    .with_radii([self.config.centroid_radius]),
            )
            .ok();
    }

    fn render_remote_centroids(&self, agent: &str, centroids: &[Vector3<f64>]) {
        if centroids.is_empty() {
            return;
        }
        self.rec
            .log(
                self.entity(&format!("remote/{}/centroids", agent)),
                &rerun::Points3D::new(to_f32(centroids))
                    .with_colors([REMOTE_COLOR])
                    .with_radii([self.config.centroid_radius]),
            )
            .ok();
    }

    fn render_local_map(&self, cloud: &PointCloud) {
        if self.is_enabled() {
            self.log_cloud(self.entity("world/map"), cloud, [200, 200, 200]);
        }
    }

    fn render_correspondences(&self, agent: &str, local: &[Vector3<f64>], remote: &[Vector3<f64>]) {
        if local.is_empty() {
            return;
        }
        let offset = Vector3::from(self.config.local_frame_offset);
        let strips: Vec<Vec<[f32; 3]>> = local
            .iter()
            .zip(remote)
            .map(|(l, r)| {
                let l = l + offset;
                vec![[l.x as f32, l.y as f32, l.z as f32], [r.x as f32, r.y as f32, r.z as f32]]
            })
            .collect();
        self.rec
            .log(
                self.entity(&format!("remote/{}/matches", agent)),
                &rerun::LineStrips3D::new(strips)
                    .with_colors([[0u8, 255, 0]])
                    .with_radii([0.01f32]),
            )
            .ok();
    }

    fn render_aligned_map(&self, agent: &str, cloud: &PointCloud) {
        if !self.is_enabled() {
            return;
        }
        let mut painted = cloud.clone();
        painted.paint_uniform(ALIGNED_COLOR);
        self.log_cloud(self.entity(&format!("remote/{}/aligned", agent)), &painted, ALIGNED_COLOR);
    }
}
