//! ModeController - coarse/dense exchange state machine for one remote agent.
//!
//! Dense (point-level) exchange is expensive. The controller requests it only
//! after repeated coarse loops and never more often than a frame gap.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mapping::Granularity;

/// Dense exchange throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DenseConfig {
    /// Coarse loops required (strictly more) before requesting dense data.
    pub min_loops: u32,

    /// Frames required (strictly more) since the last dense event.
    pub min_frame_gap: u32,

    /// Pause after a dense broadcast, seconds. Zero disables it.
    pub broadcast_sleep_s: f64,

    /// A dense broadcast succeeds only above this point count.
    pub min_dense_points: usize,
}

impl Default for DenseConfig {
    fn default() -> Self {
        Self {
            min_loops: 3,
            min_frame_gap: 200,
            broadcast_sleep_s: 1.5,
            min_dense_points: 10,
        }
    }
}

/// Exchange mode of one agent pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    Coarse,
    /// The next local export carries point payloads.
    DensePendingBroadcast,
}

#[derive(Debug, Clone)]
pub struct ModeController {
    config: DenseConfig,
    mode: ExchangeMode,
    coarse_loop_count: u32,
    last_dense_frame_id: u32,
}

impl ModeController {
    pub fn new(config: DenseConfig) -> Self {
        Self {
            config,
            mode: ExchangeMode::Coarse,
            coarse_loop_count: 0,
            last_dense_frame_id: 0,
        }
    }

    pub fn mode(&self) -> ExchangeMode {
        self.mode
    }

    pub fn is_coarse(&self) -> bool {
        self.mode == ExchangeMode::Coarse
    }

    pub fn coarse_loop_count(&self) -> u32 {
        self.coarse_loop_count
    }

    pub fn last_dense_frame_id(&self) -> u32 {
        self.last_dense_frame_id
    }

    /// Granularity the next local export must use for this agent.
    pub fn export_granularity(&self) -> Granularity {
        match self.mode {
            ExchangeMode::Coarse => Granularity::Coarse,
            ExchangeMode::DensePendingBroadcast => Granularity::Dense,
        }
    }

    /// The remote agent asked for dense data.
    pub fn on_dense_request_received(&mut self) {
        self.mode = ExchangeMode::DensePendingBroadcast;
    }

    /// Report a broadcast. Returns true if it completed a pending dense
    /// broadcast, in which case the controller is back in coarse mode.
    pub fn on_broadcast(
        &mut self,
        frame_id: u32,
        granularity: Granularity,
        point_count: usize,
        dispatched: bool,
    ) -> bool {
        let completed = self.mode == ExchangeMode::DensePendingBroadcast
            && dispatched
            && granularity == Granularity::Dense
            && point_count > self.config.min_dense_points;
        if completed {
            self.mode = ExchangeMode::Coarse;
            self.coarse_loop_count = 0;
            self.last_dense_frame_id = self.last_dense_frame_id.max(frame_id);
        }
        completed
    }

    /// A coarse attempt kept more than `recall_nodes` consistent matches.
    pub fn record_coarse_loop(&mut self) {
        self.coarse_loop_count += 1;
    }

    /// Throttling rule. Returns true if a dense request must be sent now;
    /// the local side then also exports dense data on its next attempt.
    pub fn check_dense_request(&mut self, frame_id: u32) -> bool {
        let gap = i64::from(frame_id) - i64::from(self.last_dense_frame_id);
        if self.coarse_loop_count > self.config.min_loops && gap > i64::from(self.config.min_frame_gap) {
            self.coarse_loop_count = 0;
            self.last_dense_frame_id = frame_id;
            self.mode = ExchangeMode::DensePendingBroadcast;
            true
        } else {
            false
        }
    }

    /// Pause to apply after a completed dense broadcast. Only applies before
    /// the first pose estimate for this agent.
    pub fn drain_delay(&self, has_pose: bool) -> Option<Duration> {
        if has_pose {
            return None;
        }
        Duration::try_from_secs_f64(self.config.broadcast_sleep_s)
            .ok()
            .filter(|d| !d.is_zero())
    }
}
