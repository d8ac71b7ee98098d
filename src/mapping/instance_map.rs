//! InstanceMap - lightweight semantic instance map.
//!
//! Every detection box is back-projected from the depth image into world
//! coordinates and fused into the nearest instance with the same label. The
//! map keeps, per instance, the last frame that observed it so the sliding
//! window can restrict exports to recently seen instances.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::geometry::{PointCloud, SE3};

use super::traits::MappingEngine;
use super::types::{Aabb, Detection, Instance, InstanceId, RgbdImage};

/// Instance colors used for map exports.
const INSTANCE_PALETTE: [[u8; 3]; 20] = [
    [230, 25, 75],
    [60, 180, 75],
    [255, 225, 25],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
    [240, 50, 230],
    [210, 245, 60],
    [250, 190, 190],
    [0, 128, 128],
    [230, 190, 255],
    [170, 110, 40],
    [255, 250, 200],
    [128, 0, 0],
    [170, 255, 195],
    [128, 128, 0],
    [255, 215, 180],
    [0, 0, 128],
    [128, 128, 128],
];

/// Configuration for the instance map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Pinhole intrinsics of the depth-registered color camera.
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,

    /// Raw depth units per meter.
    pub depth_scale: f64,

    /// Depth readings beyond this range (meters) are ignored.
    pub depth_max: f64,

    /// Back-project every n-th pixel in both directions.
    pub pixel_stride: u32,

    /// Detections below this confidence are ignored.
    pub min_detection_score: f32,

    /// Minimum number of valid depth points for a detection or an exported instance.
    pub min_points: usize,

    /// Maximum centroid distance (meters) to fuse a detection into an instance.
    pub association_radius: f64,

    /// Voxel size (meters) used to bound per-instance point clouds.
    pub voxel_size: f64,

    /// Labels of large structural elements merged with a looser radius.
    pub structural_labels: Vec<String>,

    /// Centroid distance (meters) under which same-label instances are merged.
    pub merge_radius: f64,

    /// Centroid distance (meters) under which structural instances are merged.
    pub structural_merge_radius: f64,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            fx: 577.87,
            fy: 577.87,
            cx: 319.5,
            cy: 239.5,
            depth_scale: 1000.0,
            depth_max: 5.0,
            pixel_stride: 4,
            min_detection_score: 0.3,
            min_points: 20,
            association_radius: 0.5,
            voxel_size: 0.05,
            structural_labels: vec!["floor".into(), "wall".into(), "ceiling".into()],
            merge_radius: 0.3,
            structural_merge_radius: 1.0,
        }
    }
}

#[derive(Serialize)]
struct InstanceInfoRow<'a> {
    id: InstanceId,
    label: &'a str,
    observations: u32,
    last_observed_frame: u32,
    points: usize,
    centroid_x: f64,
    centroid_y: f64,
    centroid_z: f64,
}

#[derive(Serialize)]
struct InstanceBoxRow {
    id: InstanceId,
    min_x: f64,
    min_y: f64,
    min_z: f64,
    max_x: f64,
    max_y: f64,
    max_z: f64,
}

/// Semantic instance map.
pub struct InstanceMap {
    config: MappingConfig,
    instances: BTreeMap<InstanceId, Instance>,
    next_id: InstanceId,
}

impl InstanceMap {
    pub fn new(config: MappingConfig) -> Self {
        Self {
            config,
            instances: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    fn is_structural(&self, label: &str) -> bool {
        self.config.structural_labels.iter().any(|l| l == label)
    }

    /// Back-project the detection box into world coordinates.
    fn back_project(&self, rgbd: &RgbdImage, det: &Detection, pose: &SE3) -> PointCloud {
        let (width, height) = rgbd.depth.dimensions();
        let with_color = rgbd.color.dimensions() == (width, height);
        let stride = self.config.pixel_stride.max(1) as usize;
        let u_end = det.u_max.min(width);
        let v_end = det.v_max.min(height);

        let mut cloud = PointCloud::new();
        for v in (det.v_min..v_end).step_by(stride) {
            for u in (det.u_min..u_end).step_by(stride) {
                let raw = rgbd.depth.get_pixel(u, v)[0];
                if raw == 0 {
                    continue;
                }
                let z = raw as f64 / self.config.depth_scale;
                if z > self.config.depth_max {
                    continue;
                }
                let p_cam = Vector3::new(
                    (u as f64 - self.config.cx) * z / self.config.fx,
                    (v as f64 - self.config.cy) * z / self.config.fy,
                    z,
                );
                cloud.points.push(pose.transform_point(&p_cam));
                if with_color {
                    cloud.colors.push(rgbd.color.get_pixel(u, v).0);
                }
            }
        }
        cloud
    }

    /// Nearest instance with the same label within the association radius.
    fn associate(&self, label: &str, centroid: &Vector3<f64>) -> Option<InstanceId> {
        self.instances
            .values()
            .filter(|inst| inst.label == label)
            .map(|inst| (inst.id, (inst.centroid - centroid).norm()))
            .filter(|(_, dist)| *dist < self.config.association_radius)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    /// Merge same-label instance pairs closer than `radius`.
    fn merge_instances(&mut self, structural: bool, radius: f64) -> usize {
        let ids: Vec<InstanceId> = self.instances.keys().copied().collect();
        let mut merged = 0;

        for (i, &keep_id) in ids.iter().enumerate() {
            for &other_id in &ids[i + 1..] {
                let should_merge = match (self.instances.get(&keep_id), self.instances.get(&other_id)) {
                    (Some(keep), Some(other)) => {
                        keep.label == other.label
                            && self.is_structural(&keep.label) == structural
                            && (keep.centroid - other.centroid).norm() < radius
                    }
                    _ => false,
                };
                if !should_merge {
                    continue;
                }

                let Some(other) = self.instances.remove(&other_id) else {
                    continue;
                };
                if let Some(keep) = self.instances.get_mut(&keep_id) {
                    keep.points.extend(&other.points);
                    keep.points = keep.points.voxel_downsample(self.config.voxel_size);
                    keep.observations += other.observations;
                    keep.last_observed_frame = keep.last_observed_frame.max(other.last_observed_frame);
                    keep.recompute_centroid();
                    merged += 1;
                }
            }
        }

        merged
    }
}

impl MappingEngine for InstanceMap {
    fn integrate(
        &mut self,
        frame_id: u32,
        rgbd: RgbdImage,
        pose: &SE3,
        detections: Vec<Detection>,
    ) {
        let mut created = 0;
        let mut updated = 0;

        for det in &detections {
            if det.score < self.config.min_detection_score {
                continue;
            }
            let observed = self.back_project(&rgbd, det, pose);
            if observed.len() < self.config.min_points {
                continue;
            }
            let Some(centroid) = observed.centroid() else {
                continue;
            };

            match self.associate(&det.label, &centroid) {
                Some(id) => {
                    if let Some(inst) = self.instances.get_mut(&id) {
                        inst.points.extend(&observed);
                        inst.points = inst.points.voxel_downsample(self.config.voxel_size);
                        inst.recompute_centroid();
                        inst.observations += 1;
                        inst.last_observed_frame = frame_id;
                        updated += 1;
                    }
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    let points = observed.voxel_downsample(self.config.voxel_size);
                    let centroid = points.centroid().unwrap_or(centroid);
                    self.instances.insert(
                        id,
                        Instance {
                            id,
                            label: det.label.clone(),
                            points,
                            centroid,
                            observations: 1,
                            last_observed_frame: frame_id,
                            bbox: None,
                        },
                    );
                    created += 1;
                }
            }
        }

        trace!(
            "Frame {}: {} detections, {} instances created, {} updated",
            frame_id,
            detections.len(),
            created,
            updated
        );
    }

    fn export_instances(&self, window_start: u32) -> Vec<Instance> {
        self.instances
            .values()
            .filter(|inst| inst.last_observed_frame >= window_start)
            .filter(|inst| inst.points.len() >= self.config.min_points)
            .cloned()
            .collect()
    }

    fn export_global_point_cloud(&self, voxel_size: f64) -> PointCloud {
        let mut cloud = PointCloud::new();
        for inst in self.instances.values() {
            cloud.extend(&inst.points);
        }
        cloud.voxel_downsample(voxel_size)
    }

    fn export_instance_centroids(&self) -> Vec<Vector3<f64>> {
        self.instances.values().map(|inst| inst.centroid).collect()
    }

    fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn extract_point_cloud(&mut self) {
        let voxel = self.config.voxel_size;
        for inst in self.instances.values_mut() {
            inst.points = inst.points.voxel_downsample(voxel);
            inst.recompute_centroid();
        }
    }

    fn merge_overlap_instances(&mut self) -> usize {
        let merged = self.merge_instances(false, self.config.merge_radius);
        debug!("Merged {} overlapping instances", merged);
        merged
    }

    fn merge_overlap_structural_instances(&mut self) -> usize {
        let merged = self.merge_instances(true, self.config.structural_merge_radius);
        debug!("Merged {} overlapping structural instances", merged);
        merged
    }

    fn extract_bounding_boxes(&mut self) {
        for inst in self.instances.values_mut() {
            inst.bbox = Aabb::from_points(&inst.points.points);
        }
    }

    fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

        let info_path = dir.join("instance_info.csv");
        let mut info = csv::Writer::from_path(&info_path)
            .with_context(|| format!("Failed to create {:?}", info_path))?;
        for inst in self.instances.values() {
            info.serialize(InstanceInfoRow {
                id: inst.id,
                label: &inst.label,
                observations: inst.observations,
                last_observed_frame: inst.last_observed_frame,
                points: inst.points.len(),
                centroid_x: inst.centroid.x,
                centroid_y: inst.centroid.y,
                centroid_z: inst.centroid.z,
            })?;
        }
        info.flush()?;

        let box_path = dir.join("instance_box.csv");
        let mut boxes = csv::Writer::from_path(&box_path)
            .with_context(|| format!("Failed to create {:?}", box_path))?;
        for inst in self.instances.values() {
            if let Some(bbox) = &inst.bbox {
                boxes.serialize(InstanceBoxRow {
                    id: inst.id,
                    min_x: bbox.min.x,
                    min_y: bbox.min.y,
                    min_z: bbox.min.z,
                    max_x: bbox.max.x,
                    max_y: bbox.max.y,
                    max_z: bbox.max.z,
                })?;
            }
        }
        boxes.flush()?;

        let mut map_cloud = PointCloud::new();
        for inst in self.instances.values() {
            let mut colored = inst.points.clone();
            colored.paint_uniform(INSTANCE_PALETTE[inst.id as usize % INSTANCE_PALETTE.len()]);
            map_cloud.extend(&colored);
        }
        let ply_path = dir.join("instance_map.ply");
        map_cloud
            .write_ply(&ply_path)
            .with_context(|| format!("Failed to write {:?}", ply_path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{ImageBuffer, Luma, RgbImage};

    fn test_config() -> MappingConfig {
        MappingConfig {
            fx: 50.0,
            fy: 50.0,
            cx: 32.0,
            cy: 24.0,
            pixel_stride: 2,
            min_points: 4,
            ..MappingConfig::default()
        }
    }

    /// Flat wall 2 m in front of the camera.
    fn flat_rgbd() -> RgbdImage {
        RgbdImage {
            color: RgbImage::from_pixel(64, 48, image::Rgb([200, 100, 50])),
            depth: ImageBuffer::from_pixel(64, 48, Luma([2000u16])),
        }
    }

    fn detection(label: &str, u_min: u32, u_max: u32) -> Detection {
        Detection {
            label: label.to_string(),
            score: 0.9,
            u_min,
            v_min: 10,
            u_max,
            v_max: 30,
        }
    }

    #[test]
    fn test_repeated_detection_fuses_into_one_instance() {
        let mut map = InstanceMap::new(test_config());
        let pose = SE3::identity();

        map.integrate(0, flat_rgbd(), &pose, vec![detection("chair", 20, 40)]);
        map.integrate(1, flat_rgbd(), &pose, vec![detection("chair", 20, 40)]);

        assert_eq!(map.instance_count(), 1);
        let inst = map.instances().next().unwrap();
        assert_eq!(inst.observations, 2);
        assert_eq!(inst.last_observed_frame, 1);
        assert_relative_eq!(inst.centroid.z, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_different_labels_create_separate_instances() {
        let mut map = InstanceMap::new(test_config());
        map.integrate(
            0,
            flat_rgbd(),
            &SE3::identity(),
            vec![detection("chair", 20, 40), detection("table", 20, 40)],
        );

        assert_eq!(map.instance_count(), 2);
    }

    #[test]
    fn test_low_score_and_empty_depth_are_ignored() {
        let mut map = InstanceMap::new(test_config());
        let mut weak = detection("chair", 20, 40);
        weak.score = 0.1;
        let rgbd = RgbdImage {
            color: RgbImage::new(64, 48),
            depth: ImageBuffer::from_pixel(64, 48, Luma([0u16])),
        };

        map.integrate(0, flat_rgbd(), &SE3::identity(), vec![weak]);
        map.integrate(1, rgbd, &SE3::identity(), vec![detection("chair", 20, 40)]);

        assert_eq!(map.instance_count(), 0);
    }

    #[test]
    fn test_export_respects_window_start() {
        let mut map = InstanceMap::new(test_config());
        let pose = SE3::identity();
        map.integrate(0, flat_rgbd(), &pose, vec![detection("chair", 0, 16)]);
        map.integrate(10, flat_rgbd(), &pose, vec![detection("sofa", 40, 60)]);

        assert_eq!(map.export_instances(0).len(), 2);
        let recent = map.export_instances(5);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].label, "sofa");
    }

    #[test]
    fn test_merge_overlap_instances() {
        let mut config = test_config();
        config.association_radius = 0.01;
        config.merge_radius = 0.5;
        let mut map = InstanceMap::new(config);
        let pose = SE3::identity();

        map.integrate(0, flat_rgbd(), &pose, vec![detection("chair", 20, 30)]);
        map.integrate(1, flat_rgbd(), &pose, vec![detection("chair", 26, 36)]);
        assert_eq!(map.instance_count(), 2);

        assert_eq!(map.merge_overlap_structural_instances(), 0);
        assert_eq!(map.merge_overlap_instances(), 1);
        assert_eq!(map.instance_count(), 1);
    }

    #[test]
    fn test_save_writes_map_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = InstanceMap::new(test_config());
        map.integrate(0, flat_rgbd(), &SE3::identity(), vec![detection("chair", 20, 40)]);
        map.extract_point_cloud();
        map.extract_bounding_boxes();
        map.save(dir.path()).unwrap();

        assert!(dir.path().join("instance_info.csv").exists());
        assert!(dir.path().join("instance_box.csv").exists());
        let cloud = PointCloud::read_ply(dir.path().join("instance_map.ply")).unwrap();
        assert!(!cloud.is_empty());
        assert!(cloud.has_colors());
    }
}
