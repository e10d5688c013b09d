pub mod codec;
pub mod connection;
pub mod data_channel;
pub mod ice;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod state;
pub mod types;

pub use connection::{
    ChannelEvent, ChannelLink, ChannelOptions, PeerConnector, PeerEvent, PeerLink, WebRtcConnector,
};
pub use data_channel::DataChannelManager;
pub use ice::{CandidateBuffer, CandidateSummary};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryConnector, MemoryNetwork};
pub use state::{ChannelState, ConnectionState, LinkState, DATA_CHANNEL_LABEL};
pub use types::{Candidate, Description, Role, SdpPayload, SdpType, ServerConfig};
