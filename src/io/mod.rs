//! Dataset input and result persistence.

pub mod match_result;
pub mod sequence;

pub use match_result::MatchResultRecord;
pub use sequence::{Frame, FrameEntry, SequenceTable, parse_sequence_id};
