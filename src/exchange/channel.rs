//! ExchangeChannel - scene-graph exchange with the remote agents.
//!
//! Wraps a [`Transport`] with:
//! - per-agent buffering of the freshest received graph,
//! - freshness filtering (older or equally old deliveries are dropped),
//! - dense-request cooldown,
//! - an exchange log streamed as CSV once a file is attached.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::mapping::{InstanceId, NodeSummary, SceneGraphSnapshot};

use super::messages::{DenseRequest, ExchangeMessage, GraphPayload};
use super::transport::Transport;

/// Transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    /// In-process bus, only meaningful when agents share a process.
    Local,
}

/// Exchange configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub transport: TransportKind,

    /// Listen address of the local agent.
    pub listen_addr: String,

    /// Address of every remote agent, keyed by agent name.
    pub peers: BTreeMap<String, String>,

    /// Snapshots with fewer nodes are not broadcast.
    pub min_broadcast_nodes: usize,

    /// Minimum interval between two dense requests to one agent, seconds.
    pub request_cooldown_s: f64,

    /// Maximum encoded message size.
    pub max_frame_bytes: usize,

    /// Capacity of the incoming and per-peer outgoing queues.
    pub queue_capacity: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            listen_addr: "0.0.0.0:7400".into(),
            peers: BTreeMap::new(),
            min_broadcast_nodes: 1,
            request_cooldown_s: 5.0,
            max_frame_bytes: 64 * 1024 * 1024,
            queue_capacity: 16,
        }
    }
}

/// Latest graph received from one remote agent.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAgentData {
    pub agent_id: String,
    pub frame_id: u32,
    /// Sender timestamp of the delivery.
    pub received_timestamp: f64,
    pub nodes: Vec<NodeSummary>,
    /// One feature vector per node.
    pub features: Vec<Vec<f32>>,
    pub points: Vec<Vector3<f64>>,
    pub point_owners: Vec<InstanceId>,
}

impl RemoteAgentData {
    fn from_payload(payload: GraphPayload) -> Self {
        Self {
            nodes: payload.node_summaries(),
            points: payload.points_f64(),
            agent_id: payload.sender,
            frame_id: payload.frame_id,
            received_timestamp: payload.timestamp,
            features: payload.features,
            point_owners: payload.point_owners,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn node_ids(&self) -> Vec<InstanceId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    pub fn centroids(&self) -> Vec<Vector3<f64>> {
        self.nodes.iter().map(|n| n.centroid).collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
enum Direction {
    Sent,
    Received,
    Discarded,
    RequestSent,
    RequestReceived,
}

#[derive(Debug, Clone, Serialize)]
struct LogRow {
    direction: Direction,
    agent: String,
    frame_id: u32,
    timestamp: f64,
    nodes: usize,
    points: usize,
    bytes: usize,
}

/// Exchange log rows. Rows are kept in memory only until a file is
/// attached, then written as they happen.
#[derive(Default)]
struct ExchangeLog {
    writer: Option<csv::Writer<File>>,
    backlog: Vec<LogRow>,
}

impl ExchangeLog {
    fn push(&mut self, row: LogRow) {
        match self.writer.as_mut() {
            Some(writer) => {
                if let Err(e) = writer.serialize(&row) {
                    warn!("Failed to write exchange log row: {}", e);
                }
            }
            None => self.backlog.push(row),
        }
    }
}

struct Buffered {
    data: RemoteAgentData,
    unread: bool,
}

pub struct ExchangeChannel {
    transport: Box<dyn Transport>,
    config: ExchangeConfig,
    remote_agents: Vec<String>,
    buffers: HashMap<String, Buffered>,
    dense_requests: Vec<String>,
    last_request: HashMap<String, Instant>,
    clock: Instant,
    last_timestamp: f64,
    log: ExchangeLog,
}

impl ExchangeChannel {
    pub fn new(transport: Box<dyn Transport>, remote_agents: Vec<String>, config: ExchangeConfig) -> Self {
        Self {
            transport,
            config,
            remote_agents,
            buffers: HashMap::new(),
            dense_requests: Vec::new(),
            last_request: HashMap::new(),
            clock: Instant::now(),
            last_timestamp: 0.0,
            log: ExchangeLog::default(),
        }
    }

    pub fn local_agent(&self) -> &str {
        self.transport.local_agent()
    }

    pub fn remote_agents(&self) -> &[String] {
        &self.remote_agents
    }

    /// Strictly increasing sender clock.
    fn next_timestamp(&mut self) -> f64 {
        let now = self.clock.elapsed().as_secs_f64();
        self.last_timestamp = if now > self.last_timestamp {
            now
        } else {
            self.last_timestamp + 1e-6
        };
        self.last_timestamp
    }

    /// Drain the transport into the per-agent buffers.
    pub fn pump(&mut self) {
        while let Some(msg) = self.transport.try_recv() {
            match msg {
                ExchangeMessage::Graph(payload) => self.accept_graph(payload),
                ExchangeMessage::DenseRequest(req) => self.accept_request(req),
            }
        }
    }

    fn accept_graph(&mut self, payload: GraphPayload) {
        if !self.remote_agents.contains(&payload.sender) {
            debug!("Ignoring graph from unknown agent {}", payload.sender);
            return;
        }

        let mut row = LogRow {
            direction: Direction::Received,
            agent: payload.sender.clone(),
            frame_id: payload.frame_id,
            timestamp: payload.timestamp,
            nodes: payload.nodes.len(),
            points: payload.points.len(),
            bytes: 0,
        };

        let stale = self
            .buffers
            .get(&payload.sender)
            .is_some_and(|b| payload.timestamp <= b.data.received_timestamp);
        if stale {
            debug!(
                "Discarding stale graph from {} (frame {}, t={:.6})",
                payload.sender, payload.frame_id, payload.timestamp
            );
            row.direction = Direction::Discarded;
            self.log.push(row);
            return;
        }

        let data = RemoteAgentData::from_payload(payload);
        self.log.push(row);
        self.buffers
            .insert(data.agent_id.clone(), Buffered { data, unread: true });
    }

    fn accept_request(&mut self, req: DenseRequest) {
        if !self.remote_agents.contains(&req.sender) {
            debug!("Ignoring dense request from unknown agent {}", req.sender);
            return;
        }
        info!("{} requested dense data (frame {})", req.sender, req.frame_id);
        self.log.push(LogRow {
            direction: Direction::RequestReceived,
            agent: req.sender.clone(),
            frame_id: req.frame_id,
            timestamp: 0.0,
            nodes: 0,
            points: 0,
            bytes: 0,
        });
        if !self.dense_requests.contains(&req.sender) {
            self.dense_requests.push(req.sender);
        }
    }

    /// Newest graph from `agent` if it arrived since the last call.
    pub fn receive(&mut self, agent: &str) -> Option<RemoteAgentData> {
        self.pump();
        let buffered = self.buffers.get_mut(agent)?;
        if !buffered.unread {
            return None;
        }
        buffered.unread = false;
        Some(buffered.data.clone())
    }

    /// Newest graph from `agent`, read or not.
    pub fn latest(&self, agent: &str) -> Option<&RemoteAgentData> {
        self.buffers.get(agent).map(|b| &b.data)
    }

    /// Agents that asked for dense data since the last call.
    pub fn take_dense_requests(&mut self) -> Vec<String> {
        self.pump();
        std::mem::take(&mut self.dense_requests)
    }

    /// Broadcast the local graph to every remote agent. Returns whether the
    /// message was dispatched.
    pub fn send(
        &mut self,
        frame_id: u32,
        snapshot: &SceneGraphSnapshot,
        features: Vec<Vec<f32>>,
    ) -> bool {
        if snapshot.node_count() < self.config.min_broadcast_nodes {
            debug!(
                "Broadcast suppressed: {} nodes < {}",
                snapshot.node_count(),
                self.config.min_broadcast_nodes
            );
            return false;
        }

        let timestamp = self.next_timestamp();
        let payload = GraphPayload::from_snapshot(
            self.transport.local_agent(),
            frame_id,
            timestamp,
            snapshot,
            features,
        );
        let (nodes, points) = (payload.nodes.len(), payload.points.len());

        match self.transport.publish(&ExchangeMessage::Graph(payload)) {
            Ok(bytes) => {
                self.log.push(LogRow {
                    direction: Direction::Sent,
                    agent: "*".into(),
                    frame_id,
                    timestamp,
                    nodes,
                    points,
                    bytes,
                });
                true
            }
            Err(e) => {
                warn!("Broadcast at frame {} failed: {}", frame_id, e);
                false
            }
        }
    }

    /// Ask `agent` for dense data. Suppressed within the cooldown.
    pub fn request_dense(&mut self, agent: &str, frame_id: u32) -> bool {
        let cooldown =
            Duration::try_from_secs_f64(self.config.request_cooldown_s).unwrap_or_default();
        if self
            .last_request
            .get(agent)
            .is_some_and(|t| t.elapsed() < cooldown)
        {
            debug!("Dense request to {} suppressed by cooldown", agent);
            return false;
        }

        let msg = ExchangeMessage::DenseRequest(DenseRequest {
            sender: self.transport.local_agent().to_string(),
            frame_id,
        });
        match self.transport.send_to(agent, &msg) {
            Ok(bytes) => {
                self.last_request.insert(agent.to_string(), Instant::now());
                self.log.push(LogRow {
                    direction: Direction::RequestSent,
                    agent: agent.to_string(),
                    frame_id,
                    timestamp: self.clock.elapsed().as_secs_f64(),
                    nodes: 0,
                    points: 0,
                    bytes,
                });
                true
            }
            Err(e) => {
                warn!("Dense request to {} failed: {}", agent, e);
                false
            }
        }
    }

    /// Stream the exchange log to `path` as CSV. Rows recorded before the
    /// call are written first.
    pub fn open_log(&mut self, path: &Path) -> Result<()> {
        let mut writer =
            csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;
        for row in self.log.backlog.drain(..) {
            writer.serialize(&row)?;
        }
        writer.flush()?;
        self.log.writer = Some(writer);
        Ok(())
    }

    pub fn is_log_open(&self) -> bool {
        self.log.writer.is_some()
    }

    pub fn flush_log(&mut self) -> Result<()> {
        if let Some(writer) = self.log.writer.as_mut() {
            writer.flush().context("Failed to flush exchange log")?;
        }
        Ok(())
    }
}
