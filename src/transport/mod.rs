//! Signaling transports: copy/paste (`manual`) and WebSocket relay (`relay`)

pub mod manual;
pub mod relay;

pub use manual::{ManualTransport, Outgoing};
pub use relay::RelayTransport;
