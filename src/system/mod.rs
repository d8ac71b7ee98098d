//! Sequence orchestration.
//!
//! `SequenceDriver` owns the mapping engine, the loop pipeline, the sliding
//! window and the timing ledger of one agent, and walks its RGB-D sequence
//! frame by frame on the calling thread.

mod sequence_driver;

pub use sequence_driver::{DriverStats, FrameStatus, SequenceDriver};
