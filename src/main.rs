//! sgloop-online - one agent of an online multi-agent loop-closure session.
//!
//! # Usage
//!
//! ```bash
//! # Agent "a" exchanging with "b" over TCP
//! sgloop-online --config agent_a.yaml --sequence data/scene0011_00 \
//!     --local a --remote b --listen 0.0.0.0:7400 --peer b=10.0.0.2:7400
//!
//! # Same, with the viewer and a denser loop schedule
//! sgloop-online --config agent_a.yaml --loop-duration 10 --visualize
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use sgloop_online::config::{LoopNodeConfig, Overrides};
use sgloop_online::exchange::{LocalBus, TcpSettings, TcpTransport, Transport, TransportKind};
use sgloop_online::system::SequenceDriver;
use sgloop_online::viz::{NullVisualizer, RerunVisualizer, VisualizationSink};

#[derive(Parser, Debug)]
#[command(name = "sgloop-online")]
#[command(about = "Online inter-agent loop closure over exchanged scene graphs")]
struct Cli {
    /// YAML configuration file; missing sections keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RGB-D sequence directory
    #[arg(short, long)]
    sequence: Option<PathBuf>,

    /// Output root; results go to <output>/<sequence name>
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Name of this agent
    #[arg(long)]
    local: Option<String>,

    /// Remote agent names (repeatable)
    #[arg(long = "remote")]
    remotes: Vec<String>,

    /// Listen address of this agent
    #[arg(long)]
    listen: Option<String>,

    /// Peer address as AGENT=HOST:PORT (repeatable)
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(String, String)>,

    /// Skip frames closer than this to the last integrated frame
    #[arg(long)]
    frame_gap: Option<u32>,

    /// Frames between two loop attempts
    #[arg(long)]
    loop_duration: Option<u32>,

    /// Coarse loops needed before asking for a dense graph
    #[arg(long)]
    dense_min_loops: Option<u32>,

    /// Frames between two dense requests to the same agent
    #[arg(long)]
    dense_min_frame_gap: Option<u32>,

    /// Number of pose estimates averaged per remote agent
    #[arg(long)]
    pose_average_size: Option<usize>,

    /// Path length (meters) after which the local window restarts
    #[arg(long)]
    sliding_window: Option<f64>,

    /// Stream to a Rerun viewer
    #[arg(long)]
    visualize: bool,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long, default_value = "sgloop_online=info")]
    log_level: String,
}

fn parse_peer(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((agent, addr)) if !agent.is_empty() && !addr.is_empty() => {
            Ok((agent.to_string(), addr.to_string()))
        }
        _ => Err(format!("expected AGENT=HOST:PORT, got '{}'", s)),
    }
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            sequence_dir: self.sequence.clone(),
            output_dir: self.output.clone(),
            local_agent: self.local.clone(),
            remote_agents: self.remotes.clone(),
            listen_addr: self.listen.clone(),
            peers: self.peers.clone(),
            frame_gap: self.frame_gap,
            loop_duration: self.loop_duration,
            dense_min_loops: self.dense_min_loops,
            dense_min_frame_gap: self.dense_min_frame_gap,
            pose_average_size: self.pose_average_size,
            sliding_window_translation: self.sliding_window,
            visualize: self.visualize.then_some(true),
        }
    }
}

fn build_transport(config: &LoopNodeConfig) -> Result<Box<dyn Transport>> {
    let exchange = &config.exchange;
    match exchange.transport {
        TransportKind::Tcp => {
            let transport = TcpTransport::bind(
                &config.agents.local,
                &exchange.listen_addr,
                &exchange.peers,
                TcpSettings {
                    max_frame_bytes: exchange.max_frame_bytes,
                    queue_capacity: exchange.queue_capacity,
                },
            )
            .with_context(|| format!("Failed to listen on {}", exchange.listen_addr))?;
            Ok(Box::new(transport))
        }
        TransportKind::Local => {
            warn!("In-process transport selected; no remote agent shares this process");
            let bus = LocalBus::new();
            Ok(Box::new(
                bus.endpoint(&config.agents.local, exchange.queue_capacity),
            ))
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cli.log_level))
                .context("Invalid log filter")?,
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            LoopNodeConfig::load(path)?
        }
        None => {
            info!("Using default configuration");
            LoopNodeConfig::default()
        }
    };
    config.apply(cli.overrides());
    if let Err(e) = config.validate() {
        bail!("Invalid configuration: {}", e);
    }

    let output_dir = config.sequence_output_dir();
    let dumped = config.dump(&output_dir)?;
    info!(
        "Agent {} with remotes {:?}, configuration saved to {:?}",
        config.agents.local, config.agents.remotes, dumped
    );

    let transport = build_transport(&config)?;
    let viz: Box<dyn VisualizationSink> = if config.viz.enabled {
        Box::new(RerunVisualizer::new(&config.agents.local, config.viz.clone()))
    } else {
        Box::new(NullVisualizer)
    };

    let mut driver = SequenceDriver::from_config(&config, transport, viz)?;
    driver.run()?;

    let stats = driver.pipeline().stats();
    info!(
        "Done: {} loops found over {} attempts, results in {:?}",
        stats.loops_found, stats.attempts, output_dir
    );
    Ok(())
}
