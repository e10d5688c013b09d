//! Signaling messages, the transport seam and the inbound dispatch loop

use crate::error::{Error, Result};
use crate::events::{EventSink, SessionEvent};
use crate::negotiator::Negotiator;
use crate::peer::types::{Candidate, Description, Role, SdpType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// ========== MESSAGES ==========

/// Сообщение сигналинга, JSON с полем `type`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer {
        sdp: String,
    },
    Answer {
        // старые клиенты кладут SDP в поле "answer"
        #[serde(alias = "answer")]
        sdp: String,
    },
    Ice(Candidate),
    Candidates {
        candidates: Vec<Candidate>,
    },
}

const KNOWN_TYPES: [&str; 4] = ["offer", "answer", "ice", "candidates"];

impl SignalMessage {
    /// Unknown `type` and malformed JSON are both [`Error::Protocol`].
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("malformed message: {e}")))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| Error::Protocol("message has no type".into()))?
            .to_owned();
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(Error::Protocol(format!("unknown message type {kind:?}")));
        }
        serde_json::from_value(value).map_err(|e| Error::Protocol(format!("bad {kind} message: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn msg_type(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Ice(_) => "ice",
            SignalMessage::Candidates { .. } => "candidates",
        }
    }

    pub fn description(desc: &Description) -> Self {
        match desc.kind {
            SdpType::Offer => SignalMessage::Offer {
                sdp: desc.sdp.clone(),
            },
            SdpType::Answer => SignalMessage::Answer {
                sdp: desc.sdp.clone(),
            },
        }
    }
}

/// ========== TRANSPORT ==========

/// Как отдавать локальных кандидатов
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateMode {
    /// One `ice` message per candidate, as soon as the local description is out
    Trickle,
    /// One `candidates` message after discovery completes
    Batch,
}

/// Outbound half of a signaling channel
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, message: SignalMessage) -> Result<()>;

    fn candidate_mode(&self) -> CandidateMode;

    /// Called once when a session starts using this transport
    fn attach(&self, _session_id: &str) {}
}

/// Inbound half of a signaling channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Closed,
    Error(String),
}

/// ========== DISPATCH ==========

/// Читает события транспорта и передаёт их переговорщику
pub struct SignalingLoop {
    negotiator: Arc<Negotiator>,
    role: Role,
    sink: Arc<dyn EventSink>,
}

impl SignalingLoop {
    pub fn new(negotiator: Arc<Negotiator>, role: Role, sink: Arc<dyn EventSink>) -> Self {
        Self {
            negotiator,
            role,
            sink,
        }
    }

    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            if self.dispatch(event).await.is_break() {
                break;
            }
        }
        debug!("Signaling loop finished");
    }

    /// Handle one transport event. `Break` means the transport is gone.
    pub async fn dispatch(&self, event: TransportEvent) -> ControlFlow<()> {
        match event {
            TransportEvent::Open => {
                info!("Signaling connected as {}", self.role);
                if self.role == Role::Offerer {
                    if let Err(e) = self.negotiator.create_as_offerer().await {
                        warn!("Failed to create offer: {e}");
                    }
                }
                ControlFlow::Continue(())
            }
            TransportEvent::Message(text) => {
                match SignalMessage::parse(&text) {
                    Ok(msg) => {
                        debug!("Received {}", msg.msg_type());
                        if let Err(e) = self.handle(msg).await {
                            warn!("Signaling message rejected: {e}");
                            if matches!(e, Error::InvalidState(_) | Error::Protocol(_)) {
                                self.sink.emit(SessionEvent::ProtocolError(e.to_string()));
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Ignoring signaling message: {e}");
                        self.sink.emit(SessionEvent::ProtocolError(e.to_string()));
                    }
                }
                ControlFlow::Continue(())
            }
            TransportEvent::Closed => {
                info!("Signaling transport closed");
                ControlFlow::Break(())
            }
            TransportEvent::Error(reason) => {
                warn!("Signaling transport error: {reason}");
                self.sink.emit(SessionEvent::TransportError(reason));
                ControlFlow::Break(())
            }
        }
    }

    async fn handle(&self, msg: SignalMessage) -> Result<()> {
        match msg {
            SignalMessage::Offer { sdp } => {
                if self.role != Role::Answerer {
                    return Err(Error::Protocol("offer received by the offerer".into()));
                }
                self.negotiator
                    .create_as_answerer(Description::offer(sdp))
                    .await
                    .map(|_| ())
            }
            SignalMessage::Answer { sdp } => {
                self.negotiator
                    .apply_remote_answer(Description::answer(sdp))
                    .await
            }
            SignalMessage::Ice(candidate) => self.negotiator.add_remote_candidate(candidate).await,
            SignalMessage::Candidates { candidates } => {
                self.negotiator.apply_candidate_batch(candidates).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let offer = SignalMessage::Offer { sdp: "v=0".into() };
        assert_eq!(offer.to_json().unwrap(), r#"{"type":"offer","sdp":"v=0"}"#);

        let mut cand = Candidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        cand.sdp_mid = Some("0".into());
        cand.sdp_mline_index = Some(0);
        let json = SignalMessage::Ice(cand.clone()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "ice");
        assert_eq!(value["candidate"], cand.candidate.as_str());
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert_eq!(SignalMessage::parse(&json).unwrap(), SignalMessage::Ice(cand));
    }

    #[test]
    fn test_legacy_answer_field_is_accepted() {
        let msg = SignalMessage::parse(r#"{"type":"answer","answer":"v=0 legacy"}"#).unwrap();
        assert_eq!(
            msg,
            SignalMessage::Answer {
                sdp: "v=0 legacy".into()
            }
        );
        // На выходе всегда sdp
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"answer","sdp":"v=0 legacy"}"#
        );
    }

    #[test]
    fn test_unknown_and_malformed_are_protocol_errors() {
        for text in [
            r#"{"type":"bye"}"#,
            r#"{"sdp":"v=0"}"#,
            "not json",
            r#"{"type":"offer"}"#,
            r#"["offer"]"#,
        ] {
            assert!(
                matches!(SignalMessage::parse(text), Err(Error::Protocol(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn test_candidates_batch() {
        let json = r#"{"type":"candidates","candidates":[
            {"candidate":"candidate:1 1 udp 1 10.0.0.1 1 typ host","sdpMid":"0","sdpMLineIndex":0},
            {"candidate":"candidate:2 1 udp 1 10.0.0.2 1 typ host"}]}"#;
        match SignalMessage::parse(json).unwrap() {
            SignalMessage::Candidates { candidates } => {
                assert_eq!(candidates.len(), 2);
                assert_eq!(candidates[1].sdp_mid, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
