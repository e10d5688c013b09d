pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod negotiator;
pub mod peer;
pub mod rendezvous;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod utils;

pub use config::NegotiatorConfig;
pub use error::{Error, Result};
pub use events::{EventSink, FnSink, NullSink, SessionEvent};
pub use negotiator::Negotiator;
#[cfg(any(test, feature = "test-util"))]
pub use peer::MemoryNetwork;
pub use peer::{
    Candidate, ChannelState, ConnectionState, Description, Role, SdpType, ServerConfig,
    WebRtcConnector,
};
pub use rendezvous::RendezvousServer;
pub use session::Session;
pub use signaling::{CandidateMode, SignalMessage, SignalingLoop, SignalingTransport, TransportEvent};
pub use transport::{ManualTransport, RelayTransport};
