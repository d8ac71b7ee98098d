//! Node configuration.
//!
//! One YAML file with a section per subsystem. Every section falls back to
//! its defaults when absent; command-line flags override the file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exchange::{ExchangeConfig, TransportKind};
use crate::loop_closing::{
    DenseConfig, EncoderConfig, LoopDetectorConfig, PipelineConfig, PoseAverageConfig,
    PrunerConfig, RegistrationConfig,
};
use crate::mapping::{GraphConfig, MappingConfig};
use crate::viz::VizConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Agent identities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub local: String,
    pub remotes: Vec<String>,
}

/// Input and output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// RGB-D sequence directory.
    pub sequence_dir: PathBuf,

    /// Root of every output of this run.
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sequence_dir: PathBuf::new(),
            output_dir: PathBuf::from("output"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopNodeConfig {
    pub agents: AgentsConfig,
    pub paths: PathsConfig,
    pub pipeline: PipelineConfig,
    pub loop_detector: LoopDetectorConfig,
    pub dense: DenseConfig,
    pub exchange: ExchangeConfig,
    pub mapping: MappingConfig,
    pub graph: GraphConfig,
    pub encoder: EncoderConfig,
    pub pruner: PrunerConfig,
    pub registration: RegistrationConfig,
    pub pose_average: PoseAverageConfig,
    pub viz: VizConfig,
}

/// Startup overrides. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub sequence_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub local_agent: Option<String>,
    pub remote_agents: Vec<String>,
    pub listen_addr: Option<String>,
    /// `agent=host:port` entries.
    pub peers: Vec<(String, String)>,
    pub frame_gap: Option<u32>,
    pub loop_duration: Option<u32>,
    pub dense_min_loops: Option<u32>,
    pub dense_min_frame_gap: Option<u32>,
    pub pose_average_size: Option<usize>,
    pub sliding_window_translation: Option<f64>,
    pub visualize: Option<bool>,
}

impl LoopNodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        // An empty document means "all defaults".
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(dir) = overrides.sequence_dir {
            self.paths.sequence_dir = dir;
        }
        if let Some(dir) = overrides.output_dir {
            self.paths.output_dir = dir;
        }
        if let Some(agent) = overrides.local_agent {
            self.agents.local = agent;
        }
        if !overrides.remote_agents.is_empty() {
            self.agents.remotes = overrides.remote_agents;
        }
        if let Some(addr) = overrides.listen_addr {
            self.exchange.listen_addr = addr;
        }
        for (agent, addr) in overrides.peers {
            self.exchange.peers.insert(agent, addr);
        }
        if let Some(v) = overrides.frame_gap {
            self.pipeline.frame_gap = v;
        }
        if let Some(v) = overrides.loop_duration {
            self.pipeline.loop_duration = v;
        }
        if let Some(v) = overrides.dense_min_loops {
            self.dense.min_loops = v;
        }
        if let Some(v) = overrides.dense_min_frame_gap {
            self.dense.min_frame_gap = v;
        }
        if let Some(v) = overrides.pose_average_size {
            self.pipeline.pose_average_size = v;
        }
        if let Some(v) = overrides.sliding_window_translation {
            self.pipeline.sliding_window_translation = v;
        }
        if let Some(v) = overrides.visualize {
            self.viz.enabled = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.agents.local.trim().is_empty() {
            return invalid("local agent name is empty".into());
        }
        if self.agents.remotes.is_empty() {
            return invalid("no remote agent configured".into());
        }
        for (i, remote) in self.agents.remotes.iter().enumerate() {
            if remote.trim().is_empty() {
                return invalid("remote agent name is empty".into());
            }
            if *remote == self.agents.local {
                return invalid(format!("remote agent {} is the local agent", remote));
            }
            if self.agents.remotes[..i].contains(remote) {
                return invalid(format!("remote agent {} listed twice", remote));
            }
            if self.exchange.transport == TransportKind::Tcp
                && !self.exchange.peers.contains_key(remote)
            {
                return invalid(format!("no peer address for remote agent {}", remote));
            }
        }
        if self.paths.sequence_dir.as_os_str().is_empty() {
            return invalid("sequence directory is not set".into());
        }
        if self.pipeline.frame_gap == 0 {
            return invalid("pipeline.frame_gap must be positive".into());
        }
        if self.pipeline.pose_average_size == 0 {
            return invalid("pipeline.pose_average_size must be positive".into());
        }
        let window = self.pipeline.sliding_window_translation;
        if !window.is_finite() || window <= 0.0 {
            return invalid("pipeline.sliding_window_translation must be positive and finite".into());
        }
        if self.loop_detector.recall_nodes == 0 {
            return invalid("loop_detector.recall_nodes must be positive".into());
        }
        for (name, seconds) in [
            ("dense.broadcast_sleep_s", self.dense.broadcast_sleep_s),
            ("exchange.request_cooldown_s", self.exchange.request_cooldown_s),
        ] {
            if !seconds.is_finite() || seconds < 0.0 {
                return invalid(format!("{} must be a finite, non-negative duration", name));
            }
        }
        if self.exchange.max_frame_bytes == 0 || self.exchange.queue_capacity == 0 {
            return invalid("exchange frame size and queue capacity must be positive".into());
        }
        if self.mapping.depth_scale <= 0.0 || self.mapping.pixel_stride == 0 {
            return invalid("mapping.depth_scale and mapping.pixel_stride must be positive".into());
        }
        Ok(())
    }

    /// Last component of the sequence directory.
    pub fn sequence_name(&self) -> String {
        self.paths
            .sequence_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sequence".into())
    }

    /// `<output>/<sequence>`: map bundle, timing and exchange logs.
    pub fn sequence_output_dir(&self) -> PathBuf {
        self.paths.output_dir.join(self.sequence_name())
    }

    /// Match results go to `<output>/<sequence>/<remote agent>/`.
    pub fn loop_result_root(&self) -> PathBuf {
        self.sequence_output_dir()
    }

    /// Write the effective configuration to `<dir>/config.txt`.
    pub fn dump(&self, dir: &Path) -> Result<PathBuf, ConfigError> {
        fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join("config.txt");
        fs::write(&path, self.to_yaml()?).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
