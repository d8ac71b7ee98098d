//! Inter-agent exchange: wire messages, transports and the channel adapter
//! used by the loop pipeline.

pub mod channel;
pub mod error;
pub mod messages;
pub mod transport;

pub use channel::{ExchangeChannel, ExchangeConfig, RemoteAgentData, TransportKind};
pub use error::ExchangeError;
pub use messages::{DenseRequest, ExchangeMessage, GraphPayload, WireNode};
pub use transport::{LocalBus, LocalEndpoint, TcpSettings, TcpTransport, Transport};
