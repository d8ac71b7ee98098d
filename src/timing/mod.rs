//! Per-frame timing ledger.
//!
//! One row per processed frame, one column per pipeline stage. Stages are
//! recorded in declaration order; stages a frame skipped stay empty.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Pipeline stages in recording order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Load,
    Mapping,
    GraphBuild,
    CoarseEncode,
    Exchange,
    ShapeEncode,
    NodeMatch,
    PointMatch,
    Pose,
    Persist,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Load,
        Stage::Mapping,
        Stage::GraphBuild,
        Stage::CoarseEncode,
        Stage::Exchange,
        Stage::ShapeEncode,
        Stage::NodeMatch,
        Stage::PointMatch,
        Stage::Pose,
        Stage::Persist,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Mapping => "mapping",
            Stage::GraphBuild => "graph_build",
            Stage::CoarseEncode => "coarse_encode",
            Stage::Exchange => "exchange",
            Stage::ShapeEncode => "shape_encode",
            Stage::NodeMatch => "node_match",
            Stage::PointMatch => "point_match",
            Stage::Pose => "pose",
            Stage::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
struct FrameRow {
    frame_id: u32,
    durations: [Option<Duration>; Stage::ALL.len()],
}

/// Mean duration of one stage over the frames that recorded it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageSummary {
    pub stage: Stage,
    pub frames: usize,
    pub mean_ms: f64,
}

#[derive(Debug, Default)]
pub struct TimingLedger {
    rows: Vec<FrameRow>,
    mark: Option<Instant>,
}

impl TimingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new row and restart the lap stopwatch.
    pub fn start_frame(&mut self, frame_id: u32) {
        self.rows.push(FrameRow {
            frame_id,
            durations: [None; Stage::ALL.len()],
        });
        self.mark = Some(Instant::now());
    }

    /// Record a stage duration for the current frame.
    ///
    /// Ignored if no frame is open.
    ///
    /// # Panics
    /// If `stage` does not come after every stage already recorded for this
    /// frame.
    pub fn record(&mut self, stage: Stage, elapsed: Duration) {
        let Some(row) = self.rows.last_mut() else {
            return;
        };
        let out_of_order = row.durations[stage.index()..].iter().any(Option::is_some);
        assert!(
            !out_of_order,
            "stage {} recorded out of order for frame {}",
            stage, row.frame_id
        );
        row.durations[stage.index()] = Some(elapsed);
    }

    /// Record the time since the previous lap (or `start_frame`).
    pub fn lap(&mut self, stage: Stage) {
        let now = Instant::now();
        let elapsed = self.mark.map_or(Duration::ZERO, |m| now - m);
        self.mark = Some(now);
        self.record(stage, elapsed);
    }

    /// Restart the lap stopwatch without recording.
    pub fn reset_lap(&mut self) {
        self.mark = Some(Instant::now());
    }

    pub fn frame_count(&self) -> usize {
        self.rows.len()
    }

    pub fn duration(&self, frame_id: u32, stage: Stage) -> Option<Duration> {
        self.rows
            .iter()
            .rev()
            .find(|r| r.frame_id == frame_id)
            .and_then(|r| r.durations[stage.index()])
    }

    pub fn summary(&self) -> Vec<StageSummary> {
        Stage::ALL
            .iter()
            .map(|&stage| {
                let samples: Vec<f64> = self
                    .rows
                    .iter()
                    .filter_map(|r| r.durations[stage.index()])
                    .map(|d| d.as_secs_f64() * 1e3)
                    .collect();
                let mean_ms = if samples.is_empty() {
                    0.0
                } else {
                    samples.iter().sum::<f64>() / samples.len() as f64
                };
                StageSummary {
                    stage,
                    frames: samples.len(),
                    mean_ms,
                }
            })
            .collect()
    }

    /// Write the table as CSV, durations in milliseconds.
    pub fn write_log(&self, path: &Path) -> Result<()> {
        let mut writer =
            csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;

        let mut header = vec!["frame_id".to_string()];
        header.extend(Stage::ALL.iter().map(|s| format!("{}_ms", s.name())));
        writer.write_record(&header)?;

        for row in &self.rows {
            let mut record = vec![row.frame_id.to_string()];
            record.extend(row.durations.iter().map(|d| match d {
                Some(d) => format!("{:.3}", d.as_secs_f64() * 1e3),
                None => String::new(),
            }));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_in_stage_order() {
        let mut ledger = TimingLedger::new();
        ledger.start_frame(3);
        ledger.record(Stage::Load, Duration::from_millis(2));
        ledger.record(Stage::Mapping, Duration::from_millis(5));
        ledger.record(Stage::Persist, Duration::from_millis(1));

        assert_eq!(ledger.duration(3, Stage::Mapping), Some(Duration::from_millis(5)));
        assert_eq!(ledger.duration(3, Stage::Pose), None);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn test_duplicate_stage_panics() {
        let mut ledger = TimingLedger::new();
        ledger.start_frame(0);
        ledger.record(Stage::Mapping, Duration::ZERO);
        ledger.record(Stage::Mapping, Duration::ZERO);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn test_backwards_stage_panics() {
        let mut ledger = TimingLedger::new();
        ledger.start_frame(0);
        ledger.record(Stage::Pose, Duration::ZERO);
        ledger.record(Stage::Load, Duration::ZERO);
    }

    #[test]
    fn test_new_frame_allows_same_stage_again() {
        let mut ledger = TimingLedger::new();
        ledger.start_frame(0);
        ledger.lap(Stage::Load);
        ledger.start_frame(1);
        ledger.lap(Stage::Load);

        assert_eq!(ledger.frame_count(), 2);
        assert_eq!(ledger.summary()[0].frames, 2);
    }

    #[test]
    fn test_write_log_leaves_skipped_stages_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timing.csv");

        let mut ledger = TimingLedger::new();
        ledger.start_frame(0);
        ledger.record(Stage::Load, Duration::from_micros(1500));
        ledger.record(Stage::Mapping, Duration::from_millis(4));
        ledger.write_log(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("frame_id,load_ms,mapping_ms,graph_build_ms"));
        assert_eq!(lines[1], "0,1.500,4.000,,,,,,,,");
    }
}
