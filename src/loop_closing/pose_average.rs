//! Bounded pose history and robust pose averaging.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

use super::traits::PoseAverager;

/// Fixed-capacity FIFO of pose estimates.
///
/// Slots are overwritten in place; `cursor` points at the oldest entry once
/// the window is full.
#[derive(Debug, Clone)]
pub struct PoseWindow {
    capacity: usize,
    slots: Vec<SE3>,
    cursor: usize,
}

impl PoseWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slots: Vec::with_capacity(capacity),
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push(&mut self, pose: SE3) {
        if self.slots.len() < self.capacity {
            self.slots.push(pose);
        } else {
            self.slots[self.cursor] = pose;
        }
        self.cursor = (self.cursor + 1) % self.capacity;
    }

    /// Stored poses, oldest first.
    pub fn ordered(&self) -> Vec<SE3> {
        if self.slots.len() < self.capacity {
            return self.slots.clone();
        }
        let (newer, older) = self.slots.split_at(self.cursor);
        older.iter().chain(newer).copied().collect()
    }
}

/// Configuration for the robust pose averager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseAverageConfig {
    /// Rotation noise bound (chordal distance).
    pub rotation_noise: f64,

    /// Translation noise bound (meters).
    pub translation_noise: f64,

    /// Re-weighting iterations.
    pub max_iterations: usize,
}

impl Default for PoseAverageConfig {
    fn default() -> Self {
        Self {
            rotation_noise: 0.1,
            translation_noise: 0.3,
            max_iterations: 10,
        }
    }
}

/// Iteratively re-weighted chordal mean with Geman-McClure weights.
pub struct RobustPoseAverager {
    config: PoseAverageConfig,
}

impl RobustPoseAverager {
    pub fn new(config: PoseAverageConfig) -> Self {
        Self { config }
    }
}

/// Closest rotation to `m` in the Frobenius sense.
fn project_to_rotation(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u = u;
        for i in 0..3 {
            u[(i, 2)] = -u[(i, 2)];
        }
        r = u * v_t;
    }
    Some(r)
}

impl PoseAverager for RobustPoseAverager {
    fn average(&self, poses: &[SE3]) -> SE3 {
        match poses {
            [] => return SE3::identity(),
            [single] => return *single,
            _ => {}
        }

        let rotations: Vec<Matrix3<f64>> = poses.iter().map(|p| p.rotation_matrix()).collect();
        let mut weights = vec![1.0; poses.len()];
        let mut mean_r = rotations[poses.len() - 1];
        let mut mean_t = poses[poses.len() - 1].translation;

        for _ in 0..self.config.max_iterations.max(1) {
            let total: f64 = weights.iter().sum();
            if total < 1e-12 {
                break;
            }

            let mut sum_r = Matrix3::zeros();
            let mut sum_t = Vector3::zeros();
            for ((r, pose), w) in rotations.iter().zip(poses).zip(&weights) {
                sum_r += r * *w;
                sum_t += pose.translation * *w;
            }
            let Some(projected) = project_to_rotation(&sum_r) else {
                break;
            };
            mean_r = projected;
            mean_t = sum_t / total;

            for ((r, pose), w) in rotations.iter().zip(poses).zip(weights.iter_mut()) {
                let rot_res = (r - mean_r).norm() / self.config.rotation_noise;
                let trans_res = (pose.translation - mean_t).norm() / self.config.translation_noise;
                let r2 = rot_res * rot_res + trans_res * trans_res;
                *w = 1.0 / ((1.0 + r2) * (1.0 + r2));
            }
        }

        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(mean_r));
        SE3::new(rotation, mean_t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pose(yaw: f64, x: f64) -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.0, yaw),
            Vector3::new(x, 0.0, 0.0),
        )
    }

    #[test]
    fn test_window_keeps_last_w_poses_in_order() {
        let mut window = PoseWindow::new(5);
        for i in 1..=7 {
            window.push(pose(0.0, i as f64));
            assert!(window.len() <= 5);
        }

        let xs: Vec<f64> = window.ordered().iter().map(|p| p.translation.x).collect();
        assert_eq!(xs, vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_partial_window_ordered() {
        let mut window = PoseWindow::new(4);
        window.push(pose(0.0, 1.0));
        window.push(pose(0.0, 2.0));
        let xs: Vec<f64> = window.ordered().iter().map(|p| p.translation.x).collect();
        assert_eq!(xs, vec![1.0, 2.0]);
    }

    #[test]
    fn test_average_of_identical_poses() {
        let averager = RobustPoseAverager::new(PoseAverageConfig::default());
        let p = pose(0.3, 2.0);
        let avg = averager.average(&[p, p, p]);

        assert_relative_eq!(avg.translation, p.translation, epsilon = 1e-9);
        assert_relative_eq!(avg.rotation.angle_to(&p.rotation), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_average_rejects_outlier() {
        let averager = RobustPoseAverager::new(PoseAverageConfig::default());
        let poses = [
            pose(0.10, 1.00),
            pose(0.11, 1.02),
            pose(0.09, 0.98),
            pose(0.10, 1.01),
            pose(2.50, 8.00),
        ];
        let avg = averager.average(&poses);

        assert_relative_eq!(avg.translation.x, 1.0, epsilon = 0.05);
        assert_relative_eq!(avg.rotation.angle(), 0.1, epsilon = 0.02);
    }
}
