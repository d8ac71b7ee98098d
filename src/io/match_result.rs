//! Persisted loop-closure match result, one YAML file per attempt.

use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::mapping::InstanceId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResultRecord {
    /// Timestamp of the remote graph the match was computed against.
    pub timestamp: f64,
    /// Local-to-remote transform, row-major 4x4.
    pub pose: [[f64; 4]; 4],
    /// Matched (local, remote) instance ids.
    pub instance_pairs: Vec<(InstanceId, InstanceId)>,
    pub src_centroids: Vec<[f64; 3]>,
    pub ref_centroids: Vec<[f64; 3]>,
}

impl MatchResultRecord {
    pub fn new(
        timestamp: f64,
        pose: &SE3,
        instance_pairs: Vec<(InstanceId, InstanceId)>,
        src_centroids: &[Vector3<f64>],
        ref_centroids: &[Vector3<f64>],
    ) -> Self {
        Self {
            timestamp,
            pose: pose.to_rows(),
            instance_pairs,
            src_centroids: src_centroids.iter().map(|c| [c.x, c.y, c.z]).collect(),
            ref_centroids: ref_centroids.iter().map(|c| [c.x, c.y, c.z]).collect(),
        }
    }

    pub fn pose(&self) -> SE3 {
        SE3::from_rows(&self.pose)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        serde_yaml::to_writer(file, self)
            .with_context(|| format!("Failed to write match result {:?}", path))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let record = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse match result {:?}", path))?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_save_and_reload_match_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_b").join("frame-000120.txt");

        let pose = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 1.3),
            Vector3::new(1.25, -3.5, 0.125),
        );
        let src = vec![Vector3::new(0.1, 0.2, 0.3), Vector3::new(-1.0, 2.0, 0.5)];
        let dst = vec![Vector3::new(1.1, 0.9, 0.3), Vector3::new(0.0, 4.0, 0.6)];
        let record = MatchResultRecord::new(42.75, &pose, vec![(3, 17), (5, 21)], &src, &dst);
        record.save(&path).unwrap();

        let restored = MatchResultRecord::load(&path).unwrap();
        assert_eq!(restored.instance_pairs, vec![(3, 17), (5, 21)]);
        assert_eq!(restored.src_centroids, record.src_centroids);
        assert_eq!(restored.ref_centroids, record.ref_centroids);
        assert_relative_eq!(restored.timestamp, 42.75);
        assert_relative_eq!(restored.pose().to_matrix(), pose.to_matrix(), epsilon = 1e-9);
    }
}
