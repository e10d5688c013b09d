//! Error types for ssc-link

use crate::peer::state::ChannelState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Offer/answer creation or description application was rejected.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// API misuse, e.g. applying an answer before an offer was sent.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Data channel not ready (state: {0})")]
    ChannelNotReady(ChannelState),

    #[error("Data channel fault: {0}")]
    ChannelFault(String),

    #[error("Data channel closed")]
    ChannelClosed,

    /// Unrecognized or malformed signaling message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Payload decode error: {0}")]
    Codec(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Error reported by the underlying peer connection stack.
    pub(crate) fn backend(e: impl std::fmt::Display) -> Self {
        Error::NegotiationFailed(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
