//! SE3: 6-DOF rigid transformation (rotation + translation).
//!
//! Poses of the local frames and the inter-agent loop transforms are all SE3.
//! Persisted artifacts store the homogeneous 4x4 form, so conversions to and
//! from `Matrix4` are lossless up to re-orthonormalisation of the rotation.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

/// Rigid transformation: p' = R * p + t.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from a rotation matrix and translation.
    ///
    /// The matrix is projected back onto SO(3) so that slightly
    /// non-orthonormal inputs (e.g. text round trips) stay valid rotations.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix(&rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Construct from quaternion (w, x, y, z) and translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from homogeneous 4x4 matrix [R | t; 0 | 1].
    pub fn from_matrix(mat: Matrix4<f64>) -> Self {
        let r = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let t = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Self::from_rt(r, t)
    }

    /// Construct from four row-major rows.
    pub fn from_rows(rows: &[[f64; 4]; 4]) -> Self {
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        Self::from_matrix(Matrix4::from_row_slice(&flat))
    }

    /// Homogeneous 4x4 matrix.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut mat = Matrix4::identity();
        mat.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        mat[(0, 3)] = self.translation.x;
        mat[(1, 3)] = self.translation.y;
        mat[(2, 3)] = self.translation.z;
        mat
    }

    /// Row-major rows of the homogeneous matrix.
    pub fn to_rows(&self) -> [[f64; 4]; 4] {
        let mat = self.to_matrix();
        let mut rows = [[0.0; 4]; 4];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = mat[(r, c)];
            }
        }
        rows
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Inverse: [R^T | -R^T t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose: self ∘ other (apply `other` first).
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn transform_points(&self, pts: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
        pts.iter().map(|p| self.transform_point(p)).collect()
    }

    /// Rotation angle in radians.
    pub fn rotation_angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// Euclidean distance between the translations of two poses.
    pub fn translation_distance(&self, other: &SE3) -> f64 {
        (self.translation - other.translation).norm()
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.3, -0.2, 1.0)),
                0.7,
            ),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn test_inverse_compose_is_identity() {
        let pose = sample_pose();
        let id = pose.compose(&pose.inverse());

        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(id.rotation_angle(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_matrix_roundtrip() {
        let pose = sample_pose();
        let restored = SE3::from_matrix(pose.to_matrix());

        assert_relative_eq!(restored.translation, pose.translation, epsilon = 1e-12);
        assert_relative_eq!(
            restored.rotation_matrix(),
            pose.rotation_matrix(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_rows_layout() {
        let pose = SE3::new(UnitQuaternion::identity(), Vector3::new(4.0, 5.0, 6.0));
        let rows = pose.to_rows();

        assert_eq!(rows[0], [1.0, 0.0, 0.0, 4.0]);
        assert_eq!(rows[1], [0.0, 1.0, 0.0, 5.0]);
        assert_eq!(rows[2], [0.0, 0.0, 1.0, 6.0]);
        assert_eq!(rows[3], [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_transform_point_order() {
        // 90 degrees about Z, then translate along X
        let pose = SE3::new(
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2),
            Vector3::new(1.0, 0.0, 0.0),
        );
        let p = pose.transform_point(&Vector3::new(1.0, 0.0, 0.0));

        assert_relative_eq!(p, Vector3::new(1.0, 1.0, 0.0), epsilon = 1e-12);
    }
}
