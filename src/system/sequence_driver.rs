//! SequenceDriver - the per-frame loop of one agent.
//!
//! For every frame of the sequence: load, integrate, let the loop pipeline
//! decide whether to attempt a loop closure, render, then advance the
//! sliding window. After the last frame the map is post-processed and every
//! artifact is written to the sequence output directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::LoopNodeConfig;
use crate::exchange::{ExchangeChannel, Transport};
use crate::io::{FrameEntry, SequenceTable};
use crate::loop_closing::{
    AttemptOutcome, Collaborators, ConsistencyPruner, HistogramEncoder, HornRegistration,
    LoopAttemptPipeline, RobustPoseAverager, SlidingWindow,
};
use crate::mapping::{InstanceMap, MappingEngine, SceneGraph};
use crate::timing::{Stage, TimingLedger};
use crate::viz::VisualizationSink;

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Closer than `frame_gap` to the last integrated frame.
    Skipped,
    /// Images or detections could not be read; not integrated.
    LoadFailed,
    Integrated,
}

#[derive(Debug, Default, Clone)]
pub struct DriverStats {
    pub frames_total: usize,
    pub frames_skipped: usize,
    pub frames_integrated: usize,
    pub load_failures: usize,
}

pub struct SequenceDriver {
    agent: String,
    table: SequenceTable,
    mapping: Box<dyn MappingEngine>,
    pipeline: LoopAttemptPipeline,
    window: SlidingWindow,
    ledger: TimingLedger,
    viz: Box<dyn VisualizationSink>,
    frame_gap: u32,
    last_integrated: Option<u32>,
    output_dir: PathBuf,
    stats: DriverStats,
}

impl SequenceDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: &str,
        table: SequenceTable,
        mapping: Box<dyn MappingEngine>,
        pipeline: LoopAttemptPipeline,
        viz: Box<dyn VisualizationSink>,
        frame_gap: u32,
        sliding_window_translation: f64,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            agent: agent.to_string(),
            table,
            mapping,
            pipeline,
            window: SlidingWindow::new(sliding_window_translation),
            ledger: TimingLedger::new(),
            viz,
            frame_gap,
            last_integrated: None,
            output_dir,
            stats: DriverStats::default(),
        }
    }

    /// Wire the concrete mapping, graph and loop collaborators from the
    /// configuration. Fails if the frame table cannot be read.
    pub fn from_config(
        config: &LoopNodeConfig,
        transport: Box<dyn Transport>,
        viz: Box<dyn VisualizationSink>,
    ) -> Result<Self> {
        let table = SequenceTable::load(
            &config.paths.sequence_dir,
            &config.pipeline.prediction_folder,
        )?;
        info!(
            "Loaded {} frames from {:?}",
            table.len(),
            config.paths.sequence_dir
        );

        let channel = ExchangeChannel::new(
            transport,
            config.agents.remotes.clone(),
            config.exchange.clone(),
        );
        let collaborators = Collaborators {
            graph: Box::new(SceneGraph::new(config.graph.clone())),
            encoder: Box::new(HistogramEncoder::new(config.encoder.clone())),
            pruner: Box::new(ConsistencyPruner::new(config.pruner.clone())),
            solver: Box::new(HornRegistration::new(config.registration.clone())),
            averager: Box::new(RobustPoseAverager::new(config.pose_average.clone())),
        };
        let pipeline = LoopAttemptPipeline::new(
            config.pipeline.clone(),
            config.loop_detector.clone(),
            config.dense.clone(),
            collaborators,
            channel,
            &config.loop_result_root(),
        );

        Ok(Self::new(
            &config.agents.local,
            table,
            Box::new(InstanceMap::new(config.mapping.clone())),
            pipeline,
            viz,
            config.pipeline.frame_gap,
            config.pipeline.sliding_window_translation,
            config.sequence_output_dir(),
        ))
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    pub fn pipeline(&self) -> &LoopAttemptPipeline {
        &self.pipeline
    }

    pub fn ledger(&self) -> &TimingLedger {
        &self.ledger
    }

    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    /// Process every frame, then post-process and save.
    pub fn run(&mut self) -> Result<()> {
        self.open_exchange_log()?;
        info!(agent = %self.agent, "Running sequence");
        for index in 0..self.table.len() {
            let entry = self.table.entries[index].clone();
            self.process(&entry);
        }
        info!(agent = %self.agent, "Finished sequence");
        self.finish()
    }

    /// Process one frame.
    pub fn process(&mut self, entry: &FrameEntry) -> FrameStatus {
        let frame_id = entry.sequence_id;
        self.stats.frames_total += 1;
        if self
            .last_integrated
            .is_some_and(|last| i64::from(frame_id) - i64::from(last) < i64::from(self.frame_gap))
        {
            self.stats.frames_skipped += 1;
            return FrameStatus::Skipped;
        }

        debug!(agent = %self.agent, frame = frame_id, "Processing frame");
        self.ledger.start_frame(frame_id);
        self.viz.set_frame(frame_id);

        let loaded = self.table.load_frame(entry);
        self.ledger.lap(Stage::Load);

        let (status, color) = match loaded {
            Ok(frame) => {
                let color = self.viz.is_enabled().then(|| frame.rgbd.color.clone());
                self.mapping
                    .integrate(frame_id, frame.rgbd, &frame.pose, frame.detections);
                self.last_integrated = Some(frame_id);
                self.stats.frames_integrated += 1;
                (FrameStatus::Integrated, color)
            }
            Err(e) => {
                warn!("Frame {} not integrated: {:#}", entry.name, e);
                self.stats.load_failures += 1;
                (FrameStatus::LoadFailed, None)
            }
        };
        self.ledger.lap(Stage::Mapping);

        let outcome = self.pipeline.step(
            frame_id,
            &entry.name,
            self.mapping.as_ref(),
            self.window.window_start_frame(),
            &mut self.ledger,
            self.viz.as_mut(),
        );
        if let AttemptOutcome::Attempted(agents) = &outcome {
            for agent in agents {
                debug!(
                    agent = %agent.agent,
                    reached = ?agent.reached,
                    matches = agent.matches,
                    kept = agent.pruned.len(),
                    "Attempt finished"
                );
            }
        }

        if let Some(color) = color {
            self.viz.render_image(&color);
        }
        self.viz.render_camera_pose(&entry.pose);
        self.viz.render_path(&entry.pose);

        self.window.update(frame_id, &entry.pose);
        status
    }

    /// Post-process the map and write every artifact.
    pub fn finish(&mut self) -> Result<()> {
        self.mapping.extract_point_cloud();
        let merged = self.mapping.merge_overlap_instances();
        let structural = self.mapping.merge_overlap_structural_instances();
        self.mapping.extract_bounding_boxes();
        info!(
            "Post-processing merged {} instances and {} structural instances, {} remain",
            merged,
            structural,
            self.mapping.instance_count()
        );

        if !self.pipeline.channel().is_log_open() {
            self.open_exchange_log()?;
        }
        self.pipeline.channel_mut().flush_log()?;

        let dir = &self.output_dir;
        self.mapping.save(dir)?;
        self.ledger.write_log(&dir.join("timing.txt"))?;

        self.log_summary(dir);
        Ok(())
    }

    /// Create the output directory and start streaming the exchange log.
    fn open_exchange_log(&mut self) -> Result<()> {
        let dir = &self.output_dir;
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        self.pipeline
            .channel_mut()
            .open_log(&dir.join("exchange_log.csv"))
    }

    fn log_summary(&self, dir: &Path) {
        let s = &self.stats;
        info!(
            "Frames: {} total, {} integrated, {} skipped, {} failed to load",
            s.frames_total, s.frames_integrated, s.frames_skipped, s.load_failures
        );
        let p = self.pipeline.stats();
        info!(
            "Loop attempts: {} ({} with matches), loops found: {}, dense requests: {}, dense broadcasts: {}",
            p.attempts, p.attempts_matched, p.loops_found, p.dense_requests_sent, p.dense_broadcasts
        );
        for summary in self.ledger.summary().iter().filter(|s| s.frames > 0) {
            info!(
                "  {:<14} {:>8.2} ms over {} frames",
                summary.stage.name(),
                summary.mean_ms,
                summary.frames
            );
        }
        info!("Saved sequence to {:?}", dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use image::{ImageBuffer, Luma, RgbImage};
    use nalgebra::Vector3;
    use parking_lot::Mutex;

    use crate::exchange::{ExchangeConfig, LocalBus};
    use crate::geometry::{PointCloud, SE3};
    use crate::loop_closing::{DenseConfig, LoopDetectorConfig, PipelineConfig};
    use crate::mapping::{Detection, GraphConfig, Instance, RgbdImage};
    use crate::viz::NullVisualizer;

    #[derive(Default)]
    struct Calls {
        integrated: Vec<u32>,
        post_processed: bool,
        saved_to: Option<PathBuf>,
    }

    struct RecordingMap {
        calls: Arc<Mutex<Calls>>,
    }

    impl MappingEngine for RecordingMap {
        fn integrate(&mut self, frame_id: u32, _: RgbdImage, _: &SE3, _: Vec<Detection>) {
            self.calls.lock().integrated.push(frame_id);
        }

        fn export_instances(&self, _: u32) -> Vec<Instance> {
            Vec::new()
        }

        fn export_global_point_cloud(&self, _: f64) -> PointCloud {
            PointCloud::new()
        }

        fn export_instance_centroids(&self) -> Vec<Vector3<f64>> {
            Vec::new()
        }

        fn instance_count(&self) -> usize {
            0
        }

        fn extract_point_cloud(&mut self) {
            self.calls.lock().post_processed = true;
        }

        fn merge_overlap_instances(&mut self) -> usize {
            0
        }

        fn merge_overlap_structural_instances(&mut self) -> usize {
            0
        }

        fn extract_bounding_boxes(&mut self) {}

        fn save(&self, dir: &Path) -> Result<()> {
            self.calls.lock().saved_to = Some(dir.to_path_buf());
            Ok(())
        }
    }

    /// Frames 0, 1, 2, 3, 5, 8 placed at x = id; frame 8 has no detection
    /// file.
    fn write_sequence(root: &Path) {
        let ids = [0u32, 1, 2, 3, 5, 8];
        for sub in ["color", "depth", "pred"] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }

        let mut association = String::new();
        let mut trajectory = String::new();
        for (k, id) in ids.iter().enumerate() {
            let name = format!("frame-{:06}", id);
            association.push_str(&format!("depth/{name}.png color/{name}.png\n"));
            trajectory.push_str(&format!(
                "{k} {k} {}\n1 0 0 {id}\n0 1 0 0\n0 0 1 0\n0 0 0 1\n",
                k + 1
            ));

            RgbImage::from_pixel(8, 6, image::Rgb([20, 40, 60]))
                .save(root.join(format!("color/{name}.png")))
                .unwrap();
            ImageBuffer::<Luma<u16>, Vec<u16>>::from_pixel(8, 6, Luma([1000]))
                .save(root.join(format!("depth/{name}.png")))
                .unwrap();
            if *id != 8 {
                fs::write(
                    root.join(format!("pred/{name}.csv")),
                    "label,score,u_min,v_min,u_max,v_max\nchair,0.9,0,0,8,6\n",
                )
                .unwrap();
            }
        }
        fs::write(root.join("data_association.txt"), association).unwrap();
        fs::write(root.join("trajectory.log"), trajectory).unwrap();
    }

    fn driver(root: &Path, out: &Path, calls: Arc<Mutex<Calls>>) -> SequenceDriver {
        let table = SequenceTable::load(root, "pred").unwrap();
        let bus = LocalBus::new();
        let channel = ExchangeChannel::new(
            Box::new(bus.endpoint("a", 8)),
            vec!["b".into()],
            ExchangeConfig::default(),
        );
        let collaborators = Collaborators {
            graph: Box::new(SceneGraph::new(GraphConfig::default())),
            encoder: Box::new(HistogramEncoder::new(Default::default())),
            pruner: Box::new(ConsistencyPruner::new(Default::default())),
            solver: Box::new(HornRegistration::new(Default::default())),
            averager: Box::new(RobustPoseAverager::new(Default::default())),
        };
        let pipeline = LoopAttemptPipeline::new(
            PipelineConfig::default(),
            LoopDetectorConfig::default(),
            DenseConfig::default(),
            collaborators,
            channel,
            out,
        );
        SequenceDriver::new(
            "a",
            table,
            Box::new(RecordingMap { calls }),
            pipeline,
            Box::new(NullVisualizer),
            2,
            2.5,
            out.to_path_buf(),
        )
    }

    #[test]
    fn test_frame_gap_and_load_failures() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_sequence(data.path());
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut driver = driver(data.path(), out.path(), calls.clone());

        let statuses: Vec<FrameStatus> = driver
            .table
            .entries
            .clone()
            .iter()
            .map(|e| driver.process(e))
            .collect();

        use FrameStatus::*;
        assert_eq!(
            statuses,
            vec![Integrated, Skipped, Integrated, Skipped, Integrated, LoadFailed]
        );
        assert_eq!(calls.lock().integrated, vec![0, 2, 5]);
        assert_eq!(driver.stats().load_failures, 1);
        // Skipped frames get no timing row; failed loads do.
        assert_eq!(driver.ledger().frame_count(), 4);
        assert!(driver.ledger().duration(8, Stage::Mapping).is_some());
    }

    #[test]
    fn test_window_advances_with_failed_frames() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_sequence(data.path());
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut driver = driver(data.path(), out.path(), calls);

        let entries = driver.table.entries.clone();
        for entry in &entries {
            driver.process(entry);
        }
        // Positions 0, 2, 5, 8 are processed; the path exceeds 2.5 m at frame
        // 5 and again at frame 8.
        assert_eq!(driver.window().window_start_frame(), 8);
    }

    #[test]
    fn test_run_writes_artifacts() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_sequence(data.path());
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut driver = driver(data.path(), out.path(), calls.clone());

        driver.run().unwrap();

        let calls = calls.lock();
        assert!(calls.post_processed);
        assert_eq!(calls.saved_to.as_deref(), Some(out.path()));
        assert!(out.path().join("timing.txt").exists());
        assert!(out.path().join("exchange_log.csv").exists());

        let timing = fs::read_to_string(out.path().join("timing.txt")).unwrap();
        assert!(timing.starts_with("frame_id,load_ms,mapping_ms"));
        assert_eq!(timing.lines().count(), 5);
    }
}
