//! Closed-form registration of the local map onto a remote map.
//!
//! Node centroids and point correspondences are aligned together with a
//! weighted Horn (SVD) fit, re-fitted on inliers, and optionally refined with
//! point-to-point ICP.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::{PointCloud, SE3};

use super::traits::{RegistrationInput, RegistrationSolver};

/// Configuration for the registration solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Residual (meters) under which a correspondence counts as an inlier.
    pub inlier_threshold: f64,

    /// Weight multiplier of node centroid correspondences.
    pub centroid_weight: f64,

    /// Maximum ICP iterations.
    pub icp_iterations: usize,

    /// Maximum ICP nearest-neighbour distance (meters).
    pub icp_max_distance: f64,

    /// Maximum number of source points used by ICP.
    pub icp_max_points: usize,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            inlier_threshold: 0.5,
            centroid_weight: 1.0,
            icp_iterations: 20,
            icp_max_distance: 0.5,
            icp_max_points: 2000,
        }
    }
}

pub struct HornRegistration {
    config: RegistrationConfig,
}

impl HornRegistration {
    pub fn new(config: RegistrationConfig) -> Self {
        Self { config }
    }
}

/// Weighted rigid alignment: finds T minimising sum w_i |dst_i - T * src_i|^2.
pub fn horn_alignment(
    src: &[Vector3<f64>],
    dst: &[Vector3<f64>],
    weights: &[f64],
) -> Option<SE3> {
    let n = src.len();
    if n < 3 || dst.len() != n || weights.len() != n {
        return None;
    }
    let total: f64 = weights.iter().sum();
    if total < 1e-12 {
        return None;
    }

    let mut centroid_src = Vector3::zeros();
    let mut centroid_dst = Vector3::zeros();
    for i in 0..n {
        centroid_src += src[i] * weights[i];
        centroid_dst += dst[i] * weights[i];
    }
    centroid_src /= total;
    centroid_dst /= total;

    // Cross-covariance H = sum w * p_src * p_dst^T
    let mut h = Matrix3::zeros();
    for i in 0..n {
        h += (src[i] - centroid_src) * (dst[i] - centroid_dst).transpose() * weights[i];
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut rotation_mat = v_t.transpose() * u.transpose();
    if rotation_mat.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation_mat = v * u.transpose();
    }

    let rotation =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation_mat));
    let translation = centroid_dst - rotation * centroid_src;
    Some(SE3::new(rotation, translation))
}

fn nearest(points: &[Vector3<f64>], query: &Vector3<f64>) -> Option<(usize, f64)> {
    points
        .iter()
        .enumerate()
        .map(|(i, p)| (i, (p - query).norm_squared()))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

impl RegistrationSolver for HornRegistration {
    fn estimate_pose(&self, input: &RegistrationInput<'_>) -> Option<SE3> {
        let mut src = Vec::new();
        let mut dst = Vec::new();
        let mut weights = Vec::new();

        for (i, (l, r)) in input
            .local_centroids
            .iter()
            .zip(input.remote_centroids)
            .enumerate()
        {
            let score = input.pair_scores.get(i).copied().unwrap_or(1.0).max(1e-3);
            src.push(*l);
            dst.push(*r);
            weights.push(score as f64 * self.config.centroid_weight);
        }

        let corr = input.correspondences;
        for i in 0..corr.len() {
            src.push(corr.local[i]);
            dst.push(corr.remote[i]);
            weights.push(corr.scores.get(i).copied().unwrap_or(1.0).max(1e-3) as f64);
        }

        let initial = horn_alignment(&src, &dst, &weights)?;

        // Re-fit on inliers of the first estimate.
        let inliers: Vec<usize> = (0..src.len())
            .filter(|&i| (dst[i] - initial.transform_point(&src[i])).norm() < self.config.inlier_threshold)
            .collect();
        if inliers.len() < 3 || inliers.len() == src.len() {
            return Some(initial);
        }
        let src_in: Vec<_> = inliers.iter().map(|&i| src[i]).collect();
        let dst_in: Vec<_> = inliers.iter().map(|&i| dst[i]).collect();
        let w_in: Vec<_> = inliers.iter().map(|&i| weights[i]).collect();

        Some(horn_alignment(&src_in, &dst_in, &w_in).unwrap_or(initial))
    }

    fn refine(&self, local: &PointCloud, remote: &PointCloud, initial: &SE3) -> SE3 {
        if local.len() < 3 || remote.len() < 3 {
            return *initial;
        }

        let stride = (local.len() / self.config.icp_max_points.max(1)).max(1);
        let source: Vec<Vector3<f64>> = local.points.iter().step_by(stride).copied().collect();
        let max_dist_sq = self.config.icp_max_distance * self.config.icp_max_distance;

        let mut pose = *initial;
        for _ in 0..self.config.icp_iterations {
            let mut src = Vec::new();
            let mut dst = Vec::new();
            for p in &source {
                let moved = pose.transform_point(p);
                if let Some((j, dist_sq)) = nearest(&remote.points, &moved) {
                    if dist_sq <= max_dist_sq {
                        src.push(*p);
                        dst.push(remote.points[j]);
                    }
                }
            }

            let weights = vec![1.0; src.len()];
            let Some(updated) = horn_alignment(&src, &dst, &weights) else {
                break;
            };
            let converged = updated.translation_distance(&pose) < 1e-6
                && updated.compose(&pose.inverse()).rotation_angle() < 1e-8;
            pose = updated;
            if converged {
                break;
            }
        }

        pose
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_closing::traits::PointCorrespondences;
    use approx::assert_relative_eq;

    fn ground_truth() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.05, -0.1, 0.8),
            Vector3::new(3.0, -1.0, 0.2),
        )
    }

    fn scattered_points() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(2.0, 0.1, 0.0),
            Vector3::new(0.3, 1.7, 0.2),
            Vector3::new(1.1, 1.0, 1.5),
            Vector3::new(-1.0, 0.5, 0.8),
            Vector3::new(0.7, -1.2, 0.4),
        ]
    }

    #[test]
    fn test_horn_alignment_recovers_transform() {
        let t = ground_truth();
        let src = scattered_points();
        let dst = t.transform_points(&src);
        let est = horn_alignment(&src, &dst, &vec![1.0; src.len()]).unwrap();

        assert_relative_eq!(est.translation, t.translation, epsilon = 1e-9);
        assert_relative_eq!(est.rotation.angle_to(&t.rotation), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_estimate_pose_ignores_outlier_centroid() {
        let t = ground_truth();
        let local: Vec<Vector3<f64>> = (0..12)
            .map(|i| {
                let a = i as f64 * 0.9;
                Vector3::new(3.0 * a.cos(), 2.5 * a.sin(), 0.4 * i as f64)
            })
            .collect();
        let mut remote = t.transform_points(&local);
        remote[4] += Vector3::new(4.0, 0.0, 0.0);
        let scores = vec![0.9; local.len()];
        let corr = PointCorrespondences::default();
        let empty = PointCloud::new();

        let solver = HornRegistration::new(RegistrationConfig {
            inlier_threshold: 1.5,
            ..RegistrationConfig::default()
        });
        let input = RegistrationInput {
            local_centroids: &local,
            remote_centroids: &remote,
            pair_scores: &scores,
            correspondences: &corr,
            local_cloud: &empty,
            remote_cloud: &empty,
        };
        let est = solver.estimate_pose(&input).unwrap();

        assert_relative_eq!(est.translation, t.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_estimate_pose_needs_three_correspondences() {
        let solver = HornRegistration::new(RegistrationConfig::default());
        let local = vec![Vector3::zeros(), Vector3::x()];
        let corr = PointCorrespondences::default();
        let empty = PointCloud::new();
        let input = RegistrationInput {
            local_centroids: &local,
            remote_centroids: &local,
            pair_scores: &[1.0, 1.0],
            correspondences: &corr,
            local_cloud: &empty,
            remote_cloud: &empty,
        };
        assert!(solver.estimate_pose(&input).is_none());
    }

    #[test]
    fn test_icp_refines_small_offset() {
        let t = ground_truth();
        let mut grid = Vec::new();
        for i in 0..8 {
            for j in 0..8 {
                let (x, y) = (i as f64 * 0.2, j as f64 * 0.2);
                grid.push(Vector3::new(x, y, 0.3 * (x * 2.0).sin() + 0.2 * y * y));
            }
        }
        let local = PointCloud::from_points(grid);
        let remote = local.transformed(&t);

        let mut initial = t;
        initial.translation += Vector3::new(0.03, -0.02, 0.01);

        let solver = HornRegistration::new(RegistrationConfig::default());
        let refined = solver.refine(&local, &remote, &initial);

        assert!(refined.translation_distance(&t) < initial.translation_distance(&t));
    }
}
