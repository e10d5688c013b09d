// Конфигурация приложения
// Уровень логирования по умолчанию зависит от профиля сборки

use crate::error::{Error, Result};
use crate::peer::state::{DATA_CHANNEL_LABEL, GATHER_TIMEOUT, GRACE_PERIOD, MAX_PACKET_LIFE_TIME_MS};
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки подробное логирование

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене только предупреждения

/// Фильтр по умолчанию, если RUST_LOG не задан
pub fn default_log_filter() -> &'static str {
    if LOGGING_ENABLED {
        "ssc_link=debug,info"
    } else {
        "warn"
    }
}

/// Настройки переговорщика. Всё задаётся снаружи, ядро ничего не вычисляет.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct NegotiatorConfig {
    /// STUN/TURN servers handed to the ICE agent
    pub ice_servers: Vec<ServerConfig>,
    /// Rendezvous relay, e.g. `ws://localhost:8888`
    pub signaling_url: Option<String>,
    pub channel_label: String,
    pub max_packet_life_time_ms: u16,
    pub disconnect_grace_secs: u64,
    pub gather_timeout_secs: u64,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            signaling_url: None,
            channel_label: DATA_CHANNEL_LABEL.into(),
            max_packet_life_time_ms: MAX_PACKET_LIFE_TIME_MS,
            disconnect_grace_secs: GRACE_PERIOD.as_secs(),
            gather_timeout_secs: GATHER_TIMEOUT.as_secs(),
        }
    }
}

/// Дефолтные серверы
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
}

impl NegotiatorConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Валидация серверов и адреса сигналинга
    pub fn validate(&self) -> Result<()> {
        if !self.ice_servers.iter().any(|s| !s.is_turn()) {
            return Err(Error::Config("at least one STUN server is required".into()));
        }
        for server in &self.ice_servers {
            server.validate()?;
        }
        if let Some(url) = &self.signaling_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(Error::Config(format!(
                    "signaling URL must be ws:// or wss://, got {url}"
                )));
            }
        }
        if self.channel_label.is_empty() {
            return Err(Error::Config("channel label cannot be empty".into()));
        }
        Ok(())
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_secs(self.gather_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NegotiatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channel_label, "data_channel");
        assert_eq!(config.max_packet_life_time_ms, 3000);
        assert_eq!(config.disconnect_grace(), Duration::from_secs(10));
        assert!(config.ice_servers.iter().all(|s| s.url.starts_with("stun:")));
    }

    #[test]
    fn test_turn_requires_credentials() {
        let mut config = NegotiatorConfig::default();
        config.ice_servers.push(ServerConfig {
            id: "relay".into(),
            r#type: "turn".into(),
            url: "turn:turn.example.org:3478".into(),
            username: Some("user".into()),
            credential: None,
        });
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_turn_only_list_is_rejected() {
        let config = NegotiatorConfig {
            ice_servers: vec![ServerConfig {
                id: "relay".into(),
                r#type: "turn".into(),
                url: "turn.example.org".into(),
                username: Some("u".into()),
                credential: Some("p".into()),
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = NegotiatorConfig::from_json_str(
            r#"{"signaling_url":"ws://localhost:8888","disconnect_grace_secs":3}"#,
        )
        .unwrap();
        assert_eq!(config.signaling_url.as_deref(), Some("ws://localhost:8888"));
        assert_eq!(config.disconnect_grace_secs, 3);
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn test_bad_signaling_url() {
        let err = NegotiatorConfig::from_json_str(r#"{"signaling_url":"http://x"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
