//! Inter-agent loop closing.
//!
//! This module decides when to attempt a loop closure against each remote
//! agent, what granularity of scene graph to exchange, and how match results
//! become a pose estimate.
//!
//! # Architecture
//!
//! 1. **Window** (`sliding_window.rs`): translation-driven bound on the exported local history
//! 2. **Mode** (`mode_controller.rs`): per-agent coarse/dense state machine and request throttling
//! 3. **Remote shadow** (`remote_graph.rs`): latest-wins copy of each remote scene graph
//! 4. **Collaborators** (`encoder.rs`, `prune.rs`, `registration.rs`, `pose_average.rs`):
//!    concrete implementations of the contracts in `traits.rs`
//! 5. **Pipeline** (`pipeline.rs`): the per-frame attempt state machine
//!
//! # Threading Model
//!
//! Everything here runs on the sequence thread. The only concurrency is the
//! transport's receiver threads, which hand messages over through a channel.

pub mod encoder;
pub mod mode_controller;
pub mod pipeline;
pub mod pose_average;
pub mod prune;
pub mod registration;
pub mod remote_graph;
pub mod sliding_window;
pub mod traits;

pub use encoder::{EncoderConfig, HistogramEncoder};
pub use mode_controller::{DenseConfig, ExchangeMode, ModeController};
pub use pipeline::{
    AgentOutcome, AttemptOutcome, AttemptStage, Collaborators, LoopAttemptPipeline,
    LoopDetectorConfig, PipelineConfig, PipelineStats, SkipReason,
};
pub use pose_average::{PoseAverageConfig, PoseWindow, RobustPoseAverager};
pub use prune::{ConsistencyPruner, PrunerConfig, apply_mask};
pub use registration::{HornRegistration, RegistrationConfig, horn_alignment};
pub use remote_graph::RemoteGraph;
pub use sliding_window::SlidingWindow;
pub use traits::{
    MatchPair, OutlierPruner, PointCorrespondences, PoseAverager, RegistrationInput,
    RegistrationSolver, SceneGraphEncoder,
};
