//! LoopAttemptPipeline - per-frame loop-closure decision and orchestration.
//!
//! An attempt is triggered once more than `loop_duration` frames passed
//! since the previous trigger and more than `lcd_nodes` local instances are
//! active. It then runs
//!
//! ```text
//! Idle -> GraphBuilt -> Encoded -> Exchanged -> Matched -> Pruned -> PoseEstimated -> Persisted
//! ```
//!
//! Stages run stage-major across the remote agents so that each timing
//! column covers every agent. An agent lacking data stops at the stage it
//! reached; this is a normal outcome and never an error.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::exchange::ExchangeChannel;
use crate::geometry::{PointCloud, SE3};
use crate::io::MatchResultRecord;
use crate::mapping::{Granularity, GraphBuilder, Instance, InstanceId, MappingEngine};
use crate::timing::{Stage, TimingLedger};
use crate::viz::VisualizationSink;

use super::mode_controller::{DenseConfig, ModeController};
use super::pose_average::PoseWindow;
use super::prune::apply_mask;
use super::remote_graph::RemoteGraph;
use super::traits::{
    MatchPair, OutlierPruner, PointCorrespondences, PoseAverager, RegistrationInput,
    RegistrationSolver, SceneGraphEncoder,
};

/// Per-frame pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames closer than this to the last integrated frame are skipped.
    pub frame_gap: u32,

    /// Frames (strictly more) between two loop triggers.
    pub loop_duration: u32,

    /// Run geometric pruning on node matches. Otherwise every match is kept.
    pub prune_instances: bool,

    /// Refine the registration with ICP when remote points are available.
    pub icp_refine: bool,

    /// Pose-averaging window. 1 reports the instantaneous estimate.
    pub pose_average_size: usize,

    /// Export correspondence point sets next to the match results.
    pub save_corr: bool,

    /// Path length (meters) after which the sliding window restarts.
    pub sliding_window_translation: f64,

    /// Detection folder inside the sequence directory.
    pub prediction_folder: String,

    /// Voxel size of the exported active map (meters).
    pub map_voxel_size: f64,

    /// Render every accepted remote graph.
    pub debug_mode: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_gap: 1,
            loop_duration: 20,
            prune_instances: true,
            icp_refine: false,
            pose_average_size: 5,
            save_corr: true,
            sliding_window_translation: 100.0,
            prediction_folder: "prediction_no_augment".into(),
            map_voxel_size: 0.05,
            debug_mode: false,
        }
    }
}

/// Node-count thresholds of loop detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectorConfig {
    /// Local and remote graphs need strictly more active nodes than this.
    pub lcd_nodes: usize,

    /// A loop needs strictly more consistent matches than this.
    pub recall_nodes: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            lcd_nodes: 5,
            recall_nodes: 3,
        }
    }
}

/// Progress of one attempt for one remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttemptStage {
    Idle,
    GraphBuilt,
    Encoded,
    Exchanged,
    Matched,
    Pruned,
    PoseEstimated,
    Persisted,
}

/// Result of an attempt for one remote agent.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub agent: String,
    /// Last stage this agent completed.
    pub reached: AttemptStage,
    pub remote_nodes: usize,
    /// Node matches before pruning.
    pub matches: usize,
    pub pruned: Vec<MatchPair>,
    pub correspondences: usize,
    pub pose: Option<SE3>,
    pub dense_requested: bool,
}

impl AgentOutcome {
    fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            reached: AttemptStage::Idle,
            remote_nodes: 0,
            matches: 0,
            pruned: Vec::new(),
            correspondences: 0,
            pose: None,
            dense_requested: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Not more than `lcd_nodes` active local instances.
    TooFewLocalNodes { active: usize },
}

#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// `loop_duration` has not elapsed since the last trigger.
    NotDue,
    Skipped(SkipReason),
    Attempted(Vec<AgentOutcome>),
}

impl AttemptOutcome {
    pub fn is_attempted(&self) -> bool {
        matches!(self, AttemptOutcome::Attempted(_))
    }
}

/// Counters over the whole sequence.
#[derive(Debug, Default, Clone)]
pub struct PipelineStats {
    /// Loop attempts run.
    pub attempts: usize,

    /// Attempts where at least one agent produced node matches.
    pub attempts_matched: usize,

    /// Pose estimates produced, over all agents.
    pub loops_found: usize,

    /// Dense requests dispatched.
    pub dense_requests_sent: usize,

    /// Dense broadcasts completed.
    pub dense_broadcasts: usize,
}

/// The external algorithms the pipeline orchestrates.
pub struct Collaborators {
    pub graph: Box<dyn GraphBuilder>,
    pub encoder: Box<dyn SceneGraphEncoder>,
    pub pruner: Box<dyn OutlierPruner>,
    pub solver: Box<dyn RegistrationSolver>,
    pub averager: Box<dyn PoseAverager>,
}

/// Everything the pipeline keeps per remote agent.
struct RemoteAgentState {
    agent: String,
    mode: ModeController,
    graph: RemoteGraph,
    poses: PoseWindow,
    result_dir: PathBuf,
    has_pose: bool,
}

/// Scratch data of one agent within an attempt.
struct AgentWork {
    outcome: AgentOutcome,
    matches: Vec<MatchPair>,
    local_centroids: Vec<Vector3<f64>>,
    remote_centroids: Vec<Vector3<f64>>,
    correspondences: PointCorrespondences,
}

pub struct LoopAttemptPipeline {
    config: PipelineConfig,
    detector: LoopDetectorConfig,
    graph: Box<dyn GraphBuilder>,
    encoder: Box<dyn SceneGraphEncoder>,
    pruner: Box<dyn OutlierPruner>,
    solver: Box<dyn RegistrationSolver>,
    averager: Box<dyn PoseAverager>,
    channel: ExchangeChannel,
    agents: Vec<RemoteAgentState>,
    last_trigger_frame: Option<u32>,
    stats: PipelineStats,
}

impl LoopAttemptPipeline {
    /// Match results for agent `r` are written to `<result_root>/<r>/`.
    pub fn new(
        config: PipelineConfig,
        detector: LoopDetectorConfig,
        dense: DenseConfig,
        collaborators: Collaborators,
        channel: ExchangeChannel,
        result_root: &Path,
    ) -> Self {
        let agents = channel
            .remote_agents()
            .iter()
            .map(|agent| RemoteAgentState {
                agent: agent.clone(),
                mode: ModeController::new(dense.clone()),
                graph: RemoteGraph::new(),
                poses: PoseWindow::new(config.pose_average_size),
                result_dir: result_root.join(agent),
                has_pose: false,
            })
            .collect();

        Self {
            config,
            detector,
            graph: collaborators.graph,
            encoder: collaborators.encoder,
            pruner: collaborators.pruner,
            solver: collaborators.solver,
            averager: collaborators.averager,
            channel,
            agents,
            last_trigger_frame: None,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn channel(&self) -> &ExchangeChannel {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut ExchangeChannel {
        &mut self.channel
    }

    pub fn last_trigger_frame(&self) -> Option<u32> {
        self.last_trigger_frame
    }

    pub fn mode(&self, agent: &str) -> Option<&ModeController> {
        self.agent_state(agent).map(|s| &s.mode)
    }

    pub fn remote_graph(&self, agent: &str) -> Option<&RemoteGraph> {
        self.agent_state(agent).map(|s| &s.graph)
    }

    pub fn pose_window(&self, agent: &str) -> Option<&PoseWindow> {
        self.agent_state(agent).map(|s| &s.poses)
    }

    fn agent_state(&self, agent: &str) -> Option<&RemoteAgentState> {
        self.agents.iter().find(|s| s.agent == agent)
    }

    /// Whether more than `loop_duration` frames passed since the last trigger.
    pub fn is_due(&self, frame_id: u32) -> bool {
        self.last_trigger_frame.is_none_or(|last| {
            i64::from(frame_id) - i64::from(last) > i64::from(self.config.loop_duration)
        })
    }

    /// Run the loop logic for one frame.
    ///
    /// The trigger frame advances whenever the duration elapsed, whether or
    /// not enough nodes were active for an attempt.
    pub fn step(
        &mut self,
        frame_id: u32,
        frame_name: &str,
        mapping: &dyn MappingEngine,
        window_start: u32,
        ledger: &mut TimingLedger,
        viz: &mut dyn VisualizationSink,
    ) -> AttemptOutcome {
        if !self.is_due(frame_id) {
            return AttemptOutcome::NotDue;
        }

        let instances = mapping.export_instances(window_start);
        let active_cloud = mapping.export_global_point_cloud(self.config.map_voxel_size);

        let outcome = if instances.len() > self.detector.lcd_nodes {
            info!(
                frame = frame_id,
                attempt = self.stats.attempts,
                active_nodes = instances.len(),
                "Loop attempt"
            );
            AttemptOutcome::Attempted(self.attempt(
                frame_id,
                frame_name,
                &instances,
                &active_cloud,
                ledger,
                viz,
            ))
        } else {
            debug!(
                frame = frame_id,
                active_nodes = instances.len(),
                "Too few active nodes for a loop attempt"
            );
            AttemptOutcome::Skipped(SkipReason::TooFewLocalNodes {
                active: instances.len(),
            })
        };

        viz.render_local_centroids(&mapping.export_instance_centroids());
        viz.render_local_map(&active_cloud);
        self.last_trigger_frame = Some(frame_id);
        outcome
    }

    fn attempt(
        &mut self,
        frame_id: u32,
        frame_name: &str,
        instances: &[Instance],
        active_cloud: &PointCloud,
        ledger: &mut TimingLedger,
        viz: &mut dyn VisualizationSink,
    ) -> Vec<AgentOutcome> {
        self.stats.attempts += 1;
        let mut work: Vec<AgentWork> = self
            .agents
            .iter()
            .map(|s| AgentWork {
                outcome: AgentOutcome::new(&s.agent),
                matches: Vec::new(),
                local_centroids: Vec::new(),
                remote_centroids: Vec::new(),
                correspondences: PointCorrespondences::default(),
            })
            .collect();

        // Graph build: always a fresh rebuild.
        self.graph.clear();
        self.graph.initialize(instances);
        let edges = self.graph.construct_edges();
        let triplets = self.graph.construct_triplets();
        for agent in self.channel.take_dense_requests() {
            if let Some(state) = self.agents.iter_mut().find(|s| s.agent == agent) {
                info!(agent = %agent, frame = frame_id, "Dense graph requested");
                state.mode.on_dense_request_received();
            }
        }
        let granularity = if self.agents.iter().any(|s| !s.mode.is_coarse()) {
            Granularity::Dense
        } else {
            Granularity::Coarse
        };
        let local = self.graph.extract_snapshot(Granularity::Dense);
        debug!(
            nodes = local.node_count(),
            edges,
            triplets,
            ?granularity,
            "Built local scene graph"
        );
        advance(&mut work, AttemptStage::GraphBuilt);
        ledger.lap(Stage::GraphBuild);

        // Encode: local only, never waits on the channel.
        self.encoder.encode_local_nodes(self.graph.nodes());
        advance(&mut work, AttemptStage::Encoded);
        ledger.lap(Stage::CoarseEncode);

        // Exchange: receive from every agent, then broadcast once.
        self.receive_remote_graphs(viz);
        let broadcast = match granularity {
            Granularity::Dense => local.clone(),
            Granularity::Coarse => local.coarse(),
        };
        let dispatched = self
            .channel
            .send(frame_id, &broadcast, self.encoder.local_features());
        let mut drain = None;
        let mut dense_completed = false;
        for state in &mut self.agents {
            if state
                .mode
                .on_broadcast(frame_id, granularity, broadcast.point_count(), dispatched)
            {
                dense_completed = true;
                drain = drain.max(state.mode.drain_delay(state.has_pose));
            }
        }
        if dense_completed {
            self.stats.dense_broadcasts += 1;
            info!(
                frame = frame_id,
                points = broadcast.point_count(),
                "Broadcast dense graph"
            );
        }
        if let Some(delay) = drain {
            thread::sleep(delay);
        }
        advance(&mut work, AttemptStage::Exchanged);
        ledger.lap(Stage::Exchange);

        // Shape encode: join each remote graph with the local one.
        for (state, w) in self.agents.iter().zip(work.iter_mut()) {
            let remote = state.graph.snapshot();
            w.outcome.remote_nodes = remote.node_count();
            if remote.node_count() == 0 {
                debug!(agent = %state.agent, "No remote graph yet");
                continue;
            }
            if !self.encoder.encode_concat(&state.agent, &remote, &local, true) {
                debug!(agent = %state.agent, "Joint encoding failed");
            }
        }
        ledger.lap(Stage::ShapeEncode);

        // Match.
        for w in work.iter_mut() {
            if w.outcome.remote_nodes <= self.detector.lcd_nodes {
                continue;
            }
            w.matches = self.encoder.match_nodes(&w.outcome.agent);
            w.outcome.matches = w.matches.len();
            w.outcome.reached = AttemptStage::Matched;
            debug!(
                agent = %w.outcome.agent,
                local_nodes = local.node_count(),
                remote_nodes = w.outcome.remote_nodes,
                matches = w.matches.len(),
                "Matched nodes"
            );
        }
        if work.iter().any(|w| !w.matches.is_empty()) {
            self.stats.attempts_matched += 1;
        }
        ledger.lap(Stage::NodeMatch);

        // Prune, then match points over the surviving pairs.
        let local_centroids: HashMap<InstanceId, Vector3<f64>> = self
            .graph
            .nodes()
            .iter()
            .map(|n| (n.id, n.centroid))
            .collect();
        for (state, w) in self.agents.iter_mut().zip(work.iter_mut()) {
            if w.matches.len() <= self.detector.recall_nodes {
                continue;
            }
            let (pairs, src, dst) = resolve_centroids(&w.matches, &local_centroids, &state.graph);
            let mask = if self.config.prune_instances {
                self.pruner.prune_outliers(&src, &dst)
            } else {
                vec![true; pairs.len()]
            };
            w.outcome.pruned = apply_mask(&pairs, &mask);
            w.local_centroids = apply_mask(&src, &mask);
            w.remote_centroids = apply_mask(&dst, &mask);
            w.outcome.reached = AttemptStage::Pruned;
            debug!(
                agent = %state.agent,
                kept = w.outcome.pruned.len(),
                "Kept consistent matches"
            );

            if w.outcome.pruned.len() > self.detector.recall_nodes {
                state.mode.record_coarse_loop();
            }
            w.correspondences = self.encoder.match_points(&state.agent, &w.outcome.pruned);
            w.outcome.correspondences = w.correspondences.len();
        }
        ledger.lap(Stage::PointMatch);

        // Pose estimate, then the dense-request rule.
        for (state, w) in self.agents.iter_mut().zip(work.iter_mut()) {
            if w.outcome.pruned.len() > self.detector.recall_nodes {
                let remote_cloud = state.graph.cloud();
                let scores: Vec<f32> = w.outcome.pruned.iter().map(|p| p.score).collect();
                let input = RegistrationInput {
                    local_centroids: &w.local_centroids,
                    remote_centroids: &w.remote_centroids,
                    pair_scores: &scores,
                    correspondences: &w.correspondences,
                    local_cloud: active_cloud,
                    remote_cloud: &remote_cloud,
                };
                match self.solver.estimate_pose(&input) {
                    Some(mut pose) => {
                        if self.config.icp_refine && !remote_cloud.is_empty() {
                            pose = self.solver.refine(active_cloud, &remote_cloud, &pose);
                        }
                        if self.config.pose_average_size > 1 {
                            state.poses.push(pose);
                            pose = self.averager.average(&state.poses.ordered());
                        }
                        state.has_pose = true;
                        w.outcome.pose = Some(pose);
                        w.outcome.reached = AttemptStage::PoseEstimated;
                        self.stats.loops_found += 1;
                        info!(
                            agent = %state.agent,
                            frame = frame_id,
                            matches = w.outcome.pruned.len(),
                            points = w.correspondences.len(),
                            averaged = state.poses.len(),
                            "Loop found"
                        );
                    }
                    None => debug!(agent = %state.agent, "Registration failed"),
                }
            }

            if state.mode.check_dense_request(frame_id) {
                w.outcome.dense_requested = true;
                if self.channel.request_dense(&state.agent, frame_id) {
                    self.stats.dense_requests_sent += 1;
                    info!(agent = %state.agent, frame = frame_id, "Requested dense graph");
                }
            }
        }
        ledger.lap(Stage::Pose);

        // Persist and publish.
        for (state, w) in self.agents.iter().zip(work.iter_mut()) {
            if let Some(pose) = w.outcome.pose {
                let timestamp = state.graph.timestamp().unwrap_or_default();
                if let Err(e) = persist_match(
                    &state.result_dir,
                    frame_name,
                    timestamp,
                    &pose,
                    w,
                    active_cloud,
                ) {
                    warn!("Failed to save match result for {}: {:#}", state.agent, e);
                }
                viz.render_correspondences(&state.agent, &w.local_centroids, &w.remote_centroids);
                if viz.is_enabled() {
                    viz.render_aligned_map(&state.agent, &active_cloud.transformed(&pose));
                }
                w.outcome.reached = AttemptStage::Persisted;
            }

            if self.config.save_corr && !w.correspondences.is_empty() {
                if let Err(e) = persist_correspondences(&state.result_dir, frame_name, &w.correspondences) {
                    warn!("Failed to save correspondences for {}: {:#}", state.agent, e);
                }
            }
        }
        ledger.lap(Stage::Persist);

        work.into_iter().map(|w| w.outcome).collect()
    }

    /// Feed fresh remote graphs into the encoder and the remote shadows.
    fn receive_remote_graphs(&mut self, viz: &mut dyn VisualizationSink) {
        for state in &mut self.agents {
            let Some(data) = self.channel.receive(&state.agent) else {
                continue;
            };
            let timestamp = data.received_timestamp;
            self.encoder.subscribe_remote_coarse_features(
                &state.agent,
                timestamp,
                &data.node_ids(),
                &data.features,
            );
            let nodes = state.graph.subscribe_nodes(timestamp, &data.nodes);
            let points = if nodes > 0 && data.point_count() > 0 {
                state
                    .graph
                    .subscribe_dense_points(timestamp, &data.points, &data.point_owners)
            } else {
                0
            };
            debug!(
                agent = %state.agent,
                remote_frame = data.frame_id,
                nodes,
                points,
                "Updated remote graph"
            );

            if self.config.debug_mode {
                viz.render_remote_centroids(&state.agent, &state.graph.centroids());
            }
        }
    }
}

fn advance(work: &mut [AgentWork], stage: AttemptStage) {
    for w in work {
        w.outcome.reached = stage;
    }
}

/// Centroids of both ends of each match. Pairs naming an unknown node are
/// dropped.
fn resolve_centroids(
    pairs: &[MatchPair],
    local: &HashMap<InstanceId, Vector3<f64>>,
    remote: &RemoteGraph,
) -> (Vec<MatchPair>, Vec<Vector3<f64>>, Vec<Vector3<f64>>) {
    let mut kept = Vec::with_capacity(pairs.len());
    let mut src = Vec::with_capacity(pairs.len());
    let mut dst = Vec::with_capacity(pairs.len());
    for pair in pairs {
        if let (Some(l), Some(r)) = (local.get(&pair.local), remote.node(pair.remote)) {
            kept.push(*pair);
            src.push(*l);
            dst.push(r.centroid);
        }
    }
    (kept, src, dst)
}

fn persist_match(
    dir: &Path,
    frame_name: &str,
    timestamp: f64,
    pose: &SE3,
    work: &AgentWork,
    active_cloud: &PointCloud,
) -> Result<()> {
    let record = MatchResultRecord::new(
        timestamp,
        pose,
        work.outcome
            .pruned
            .iter()
            .map(|p| (p.local, p.remote))
            .collect(),
        &work.local_centroids,
        &work.remote_centroids,
    );
    record.save(&dir.join(format!("{}.txt", frame_name)))?;

    let path = dir.join(format!("{}_src.ply", frame_name));
    active_cloud
        .write_ply(&path)
        .with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

fn persist_correspondences(
    dir: &Path,
    frame_name: &str,
    correspondences: &PointCorrespondences,
) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    for (suffix, points) in [
        ("csrc", &correspondences.local),
        ("cref", &correspondences.remote),
    ] {
        let path = dir.join(format!("{}_{}.ply", frame_name, suffix));
        PointCloud::from_points(points.clone())
            .write_ply(&path)
            .with_context(|| format!("Failed to write {:?}", path))?;
    }
    Ok(())
}
