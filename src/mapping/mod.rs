//! Local semantic mapping: instance map, scene graph and their contracts.

pub mod instance_map;
pub mod scene_graph;
pub mod traits;
pub mod types;

pub use instance_map::{InstanceMap, MappingConfig};
pub use scene_graph::{GraphConfig, Node, SceneGraph, Triplet};
pub use traits::{GraphBuilder, MappingEngine};
pub use types::{
    Aabb, DepthImage, Detection, Granularity, Instance, InstanceId, NodeSummary, RgbdImage,
    SceneGraphSnapshot,
};
