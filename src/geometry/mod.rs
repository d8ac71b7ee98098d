//! Geometry utilities: SE3 transforms and point clouds.

pub mod point_cloud;
pub mod se3;

pub use point_cloud::PointCloud;
pub use se3::SE3;
