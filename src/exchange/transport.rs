//! Transports carrying encoded messages between agents.
//!
//! Two implementations:
//! - `LocalBus`: in-process bus for agents running as threads of one
//!   process (and for tests).
//! - `TcpTransport`: one listener per agent plus one writer thread per peer.
//!
//! TCP frames use a 4-byte big-endian length prefix followed by the postcard
//! payload:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (4 bytes) │ Payload (variable)       │
//! │ Big-endian u32   │ Postcard binary          │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! Both transports are lossy: a full queue drops the message instead of
//! blocking the sender.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::error::{ExchangeError, Result};
use super::messages::ExchangeMessage;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Message transport between named agents.
pub trait Transport: Send {
    fn local_agent(&self) -> &str;

    /// Send to every known peer. Returns the encoded size in bytes; fails
    /// with `NotDelivered` if no peer accepted the message.
    fn publish(&self, msg: &ExchangeMessage) -> Result<usize>;

    /// Send to one peer. Returns the encoded size in bytes.
    fn send_to(&self, agent: &str, msg: &ExchangeMessage) -> Result<usize>;

    /// Next received message, if any. Never blocks.
    fn try_recv(&mut self) -> Option<ExchangeMessage>;
}

/// Write one length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8], max_frame: usize) -> Result<()> {
    if payload.len() > max_frame || payload.len() > u32::MAX as usize {
        return Err(ExchangeError::FrameTooLarge {
            size: payload.len(),
            limit: max_frame,
        });
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean EOF.
pub fn read_frame<R: Read>(reader: &mut R, max_frame: usize) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame {
        return Err(ExchangeError::FrameTooLarge {
            size: len,
            limit: max_frame,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Offer `bytes` to every peer queue. Returns the encoded size if at least
/// one peer accepted it.
fn fan_out<'a>(
    peers: impl Iterator<Item = (&'a String, &'a Sender<Vec<u8>>)>,
    bytes: Vec<u8>,
) -> Result<usize> {
    let mut accepted = 0;
    for (agent, tx) in peers {
        match try_forward(tx, agent, bytes.clone()) {
            Ok(()) => accepted += 1,
            Err(e) => warn!("Dropped message to {}: {}", agent, e),
        }
    }
    if accepted == 0 {
        return Err(ExchangeError::NotDelivered);
    }
    Ok(bytes.len())
}

fn try_forward(tx: &Sender<Vec<u8>>, agent: &str, bytes: Vec<u8>) -> Result<()> {
    match tx.try_send(bytes) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(ExchangeError::Backpressure(agent.to_string())),
        Err(TrySendError::Disconnected(_)) => Err(ExchangeError::Disconnected),
    }
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

/// Registry shared by all endpoints of one in-process bus.
#[derive(Clone, Default)]
pub struct LocalBus {
    inboxes: Arc<Mutex<BTreeMap<String, Sender<Vec<u8>>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `agent` and return its endpoint. Re-registering replaces
    /// the previous inbox.
    pub fn endpoint(&self, agent: &str, capacity: usize) -> LocalEndpoint {
        let (tx, rx) = bounded(capacity.max(1));
        self.inboxes.lock().insert(agent.to_string(), tx);
        LocalEndpoint {
            agent: agent.to_string(),
            bus: self.clone(),
            inbox: rx,
        }
    }
}

pub struct LocalEndpoint {
    agent: String,
    bus: LocalBus,
    inbox: Receiver<Vec<u8>>,
}

impl Transport for LocalEndpoint {
    fn local_agent(&self) -> &str {
        &self.agent
    }

    fn publish(&self, msg: &ExchangeMessage) -> Result<usize> {
        let bytes = msg.encode()?;
        let inboxes = self.bus.inboxes.lock();
        fan_out(inboxes.iter().filter(|(a, _)| **a != self.agent), bytes)
    }

    fn send_to(&self, agent: &str, msg: &ExchangeMessage) -> Result<usize> {
        let bytes = msg.encode()?;
        let len = bytes.len();
        let inboxes = self.bus.inboxes.lock();
        let tx = inboxes
            .get(agent)
            .ok_or_else(|| ExchangeError::UnknownAgent(agent.to_string()))?;
        try_forward(tx, agent, bytes)?;
        Ok(len)
    }

    fn try_recv(&mut self) -> Option<ExchangeMessage> {
        while let Ok(bytes) = self.inbox.try_recv() {
            match ExchangeMessage::decode(&bytes) {
                Ok(msg) => return Some(msg),
                Err(e) => warn!("Discarding undecodable message: {}", e),
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// TCP transport settings.
#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub max_frame_bytes: usize,
    pub queue_capacity: usize,
}

/// TCP transport: listener plus per-peer writer threads.
///
/// Reader threads decode frames and hand messages over a bounded channel;
/// writer threads (re)connect lazily and drop messages on failure.
pub struct TcpTransport {
    agent: String,
    local_addr: SocketAddr,
    peers: Arc<Mutex<HashMap<String, Sender<Vec<u8>>>>>,
    inbox: Receiver<ExchangeMessage>,
    max_frame_bytes: usize,
}

impl TcpTransport {
    pub fn bind(
        agent: &str,
        listen_addr: &str,
        peers: &BTreeMap<String, String>,
        settings: TcpSettings,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr)?;
        let local_addr = listener.local_addr()?;
        info!("{} listening on {}", agent, local_addr);

        let (inbox_tx, inbox_rx) = bounded(settings.queue_capacity.max(1));
        let max_frame = settings.max_frame_bytes;
        thread::Builder::new()
            .name(format!("{}-listener", agent))
            .spawn(move || accept_loop(listener, inbox_tx, max_frame))?;

        let mut links = HashMap::new();
        for (peer, addr) in peers {
            let (tx, rx) = bounded::<Vec<u8>>(settings.queue_capacity.max(1));
            let peer_name = peer.clone();
            let addr = addr.clone();
            thread::Builder::new()
                .name(format!("{}-to-{}", agent, peer))
                .spawn(move || writer_loop(&peer_name, &addr, rx, max_frame))?;
            links.insert(peer.clone(), tx);
        }

        Ok(Self {
            agent: agent.to_string(),
            local_addr,
            peers: Arc::new(Mutex::new(links)),
            inbox: inbox_rx,
            max_frame_bytes: max_frame,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Encode `msg`, rejecting frames the writer threads would refuse.
    fn encode_frame(&self, msg: &ExchangeMessage) -> Result<Vec<u8>> {
        let bytes = msg.encode()?;
        if bytes.len() > self.max_frame_bytes {
            return Err(ExchangeError::FrameTooLarge {
                size: bytes.len(),
                limit: self.max_frame_bytes,
            });
        }
        Ok(bytes)
    }
}

fn accept_loop(listener: TcpListener, inbox: Sender<ExchangeMessage>, max_frame: usize) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };
        let inbox = inbox.clone();
        let spawned = thread::Builder::new()
            .name("exchange-reader".into())
            .spawn(move || reader_loop(stream, inbox, max_frame));
        if let Err(e) = spawned {
            warn!("Failed to spawn reader thread: {}", e);
        }
    }
}

fn reader_loop(stream: TcpStream, inbox: Sender<ExchangeMessage>, max_frame: usize) {
    let peer = stream.peer_addr().ok();
    debug!("Peer connected: {:?}", peer);
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame(&mut reader, max_frame) {
            Ok(Some(bytes)) => match ExchangeMessage::decode(&bytes) {
                Ok(msg) => match inbox.try_send(msg) {
                    Ok(()) => {}
                    Err(TrySendError::Full(msg)) => {
                        warn!("Inbox full, dropping message from {}", msg.sender());
                    }
                    Err(TrySendError::Disconnected(_)) => return,
                },
                Err(e) => warn!("Discarding undecodable frame from {:?}: {}", peer, e),
            },
            Ok(None) => {
                debug!("Peer disconnected: {:?}", peer);
                return;
            }
            Err(e) => {
                warn!("Closing connection to {:?}: {}", peer, e);
                return;
            }
        }
    }
}

fn connect(addr: &str) -> Result<TcpStream> {
    let target = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ExchangeError::UnknownAgent(addr.to_string()))?;
    let stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn writer_loop(peer: &str, addr: &str, outgoing: Receiver<Vec<u8>>, max_frame: usize) {
    let mut link: Option<BufWriter<TcpStream>> = None;
    for bytes in outgoing.iter() {
        if link.is_none() {
            match connect(addr) {
                Ok(stream) => {
                    info!("Connected to {} at {}", peer, addr);
                    link = Some(BufWriter::new(stream));
                }
                Err(e) => {
                    debug!("Peer {} unreachable ({}), dropping message", peer, e);
                    continue;
                }
            }
        }
        if let Some(writer) = link.as_mut() {
            if let Err(e) = write_frame(writer, &bytes, max_frame) {
                warn!("Send to {} failed: {}", peer, e);
                link = None;
            }
        }
    }
}

impl Transport for TcpTransport {
    fn local_agent(&self) -> &str {
        &self.agent
    }

    fn publish(&self, msg: &ExchangeMessage) -> Result<usize> {
        let bytes = self.encode_frame(msg)?;
        let peers = self.peers.lock();
        fan_out(peers.iter(), bytes)
    }

    fn send_to(&self, agent: &str, msg: &ExchangeMessage) -> Result<usize> {
        let bytes = self.encode_frame(msg)?;
        let len = bytes.len();
        let peers = self.peers.lock();
        let tx = peers
            .get(agent)
            .ok_or_else(|| ExchangeError::UnknownAgent(agent.to_string()))?;
        try_forward(tx, agent, bytes)?;
        Ok(len)
    }

    fn try_recv(&mut self) -> Option<ExchangeMessage> {
        self.inbox.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::messages::DenseRequest;
    use std::io::Cursor;
    use std::time::Instant;

    fn request(sender: &str, frame_id: u32) -> ExchangeMessage {
        ExchangeMessage::DenseRequest(DenseRequest {
            sender: sender.into(),
            frame_id,
        })
    }

    #[test]
    fn test_frame_roundtrip_and_size_limit() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello", 16).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor, 16).unwrap().unwrap(), b"hello");
        assert!(read_frame(&mut cursor, 16).unwrap().is_none());

        assert!(matches!(
            write_frame(&mut Vec::new(), &[0u8; 32], 16),
            Err(ExchangeError::FrameTooLarge { size: 32, limit: 16 })
        ));
    }

    #[test]
    fn test_local_bus_publish_skips_sender() {
        let bus = LocalBus::new();
        let mut a = bus.endpoint("a", 4);
        let mut b = bus.endpoint("b", 4);

        a.publish(&request("a", 1)).unwrap();
        assert_eq!(b.try_recv(), Some(request("a", 1)));
        assert_eq!(a.try_recv(), None);
        assert_eq!(b.try_recv(), None);
    }

    #[test]
    fn test_local_bus_backpressure_and_unknown_agent() {
        let bus = LocalBus::new();
        let a = bus.endpoint("a", 4);
        let _b = bus.endpoint("b", 1);

        a.send_to("b", &request("a", 1)).unwrap();
        assert!(matches!(
            a.send_to("b", &request("a", 2)),
            Err(ExchangeError::Backpressure(_))
        ));
        assert!(matches!(
            a.send_to("c", &request("a", 3)),
            Err(ExchangeError::UnknownAgent(_))
        ));
    }

    #[test]
    fn test_local_publish_fails_when_every_peer_is_full() {
        let bus = LocalBus::new();
        let a = bus.endpoint("a", 4);
        let _b = bus.endpoint("b", 1);
        let mut c = bus.endpoint("c", 1);

        a.send_to("b", &request("a", 1)).unwrap();
        // "c" still has room, so the broadcast counts.
        assert!(a.publish(&request("a", 2)).is_ok());
        assert_eq!(c.try_recv(), Some(request("a", 2)));

        a.send_to("c", &request("a", 3)).unwrap();
        assert!(matches!(
            a.publish(&request("a", 4)),
            Err(ExchangeError::NotDelivered)
        ));
    }

    #[test]
    fn test_local_publish_without_peers_is_not_delivered() {
        let bus = LocalBus::new();
        let a = bus.endpoint("a", 4);
        assert!(matches!(
            a.publish(&request("a", 1)),
            Err(ExchangeError::NotDelivered)
        ));
    }

    #[test]
    fn test_tcp_rejects_oversized_frame_before_queueing() {
        let settings = TcpSettings {
            max_frame_bytes: 8,
            queue_capacity: 8,
        };
        let mut peers = BTreeMap::new();
        peers.insert("b".to_string(), "127.0.0.1:9".to_string());
        let a = TcpTransport::bind("a", "127.0.0.1:0", &peers, settings).unwrap();

        let big = ExchangeMessage::DenseRequest(DenseRequest {
            sender: "a-with-a-long-name".into(),
            frame_id: 1,
        });
        assert!(matches!(
            a.publish(&big),
            Err(ExchangeError::FrameTooLarge { limit: 8, .. })
        ));
        assert!(matches!(
            a.send_to("b", &big),
            Err(ExchangeError::FrameTooLarge { limit: 8, .. })
        ));
    }

    #[test]
    fn test_tcp_loopback_delivery() {
        let settings = TcpSettings {
            max_frame_bytes: 1 << 20,
            queue_capacity: 8,
        };
        let mut b = TcpTransport::bind("b", "127.0.0.1:0", &BTreeMap::new(), settings.clone()).unwrap();
        let mut peers = BTreeMap::new();
        peers.insert("b".to_string(), b.local_addr().to_string());
        let a = TcpTransport::bind("a", "127.0.0.1:0", &peers, settings).unwrap();

        a.send_to("b", &request("a", 7)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = None;
        while received.is_none() && Instant::now() < deadline {
            received = b.try_recv();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received, Some(request("a", 7)));
    }
}
