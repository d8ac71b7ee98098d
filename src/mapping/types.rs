//! Core data types shared by the mapping engine, the scene graph and the
//! exchange layer.

use image::{ImageBuffer, Luma, RgbImage};
use nalgebra::Vector3;
use serde::Deserialize;

use crate::geometry::PointCloud;

/// Identifier of a semantic instance (and of its scene-graph node).
pub type InstanceId = u32;

/// 16-bit depth image, raw sensor units (see `MappingConfig::depth_scale`).
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Registered color + depth pair of one frame.
pub struct RgbdImage {
    pub color: RgbImage,
    pub depth: DepthImage,
}

/// One semantic detection of a frame: label, confidence and pixel box
/// `[u_min, v_min, u_max, v_max]` (inclusive-exclusive).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub u_min: u32,
    pub v_min: u32,
    pub u_max: u32,
    pub v_max: u32,
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl Aabb {
    pub fn from_points(points: &[Vector3<f64>]) -> Option<Self> {
        let first = points.first()?;
        let mut min = *first;
        let mut max = *first;
        for p in &points[1..] {
            min = min.inf(p);
            max = max.sup(p);
        }
        Some(Self { min, max })
    }

    pub fn extent(&self) -> Vector3<f64> {
        self.max - self.min
    }
}

/// A semantic instance of the local map.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub label: String,
    pub points: PointCloud,
    pub centroid: Vector3<f64>,
    /// Number of frames that observed this instance.
    pub observations: u32,
    /// Sequence id of the last frame that observed this instance.
    pub last_observed_frame: u32,
    pub bbox: Option<Aabb>,
}

impl Instance {
    pub fn recompute_centroid(&mut self) {
        if let Some(c) = self.points.centroid() {
            self.centroid = c;
        }
    }
}

/// Node summary exchanged between agents: the coarse unit of a scene graph.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSummary {
    pub id: InstanceId,
    pub label: String,
    pub centroid: Vector3<f64>,
}

/// Exchange granularity of a scene-graph snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// Node summaries only.
    Coarse,
    /// Node summaries plus every node's points.
    Dense,
}

/// Scene graph extracted at a point in time.
///
/// Node ids are unique within a snapshot. In dense snapshots
/// `point_owners[i]` is the node id that `points[i]` belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneGraphSnapshot {
    pub granularity: Granularity,
    pub nodes: Vec<NodeSummary>,
    pub points: Vec<Vector3<f64>>,
    pub point_owners: Vec<InstanceId>,
}

impl SceneGraphSnapshot {
    pub fn empty(granularity: Granularity) -> Self {
        Self {
            granularity,
            nodes: Vec::new(),
            points: Vec::new(),
            point_owners: Vec::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn is_dense(&self) -> bool {
        self.granularity == Granularity::Dense
    }

    pub fn centroids(&self) -> Vec<Vector3<f64>> {
        self.nodes.iter().map(|n| n.centroid).collect()
    }

    /// Same nodes without the point payload.
    pub fn coarse(&self) -> Self {
        Self {
            granularity: Granularity::Coarse,
            nodes: self.nodes.clone(),
            points: Vec::new(),
            point_owners: Vec::new(),
        }
    }

    /// Points owned by one node.
    pub fn node_points(&self, id: InstanceId) -> Vec<Vector3<f64>> {
        self.points
            .iter()
            .zip(&self.point_owners)
            .filter(|(_, owner)| **owner == id)
            .map(|(p, _)| *p)
            .collect()
    }
}
