use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// ========== STATES ==========

/// Состояние сессии: new → negotiating → connected → closed
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Negotiating,
    Connected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Negotiating => write!(f, "negotiating"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Состояние data channel: connecting → open → closed
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}

/// State reported by the peer connection stack itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ========== CONSTANTS ==========

/// Метка единственного data channel
pub const DATA_CHANNEL_LABEL: &str = "data_channel";

/// Максимальное время ретрансляции, мс
pub const MAX_PACKET_LIFE_TIME_MS: u16 = 3000;

/// Период ожидания перед объявлением соединения потерянным
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Сколько ждать окончания сбора кандидатов
pub const GATHER_TIMEOUT: Duration = Duration::from_secs(10);
