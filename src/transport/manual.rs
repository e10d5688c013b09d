use crate::error::{Error, Result};
use crate::peer::codec;
use crate::peer::types::{Candidate, Description, SdpPayload, SdpType};
use crate::signaling::{CandidateMode, SignalMessage, SignalingTransport};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// Текст для показа пользователю
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Raw SDP, or the compact payload in compact mode
    Description(String),
    /// JSON array of candidate objects
    Candidates(String),
}

/// Copy/paste transport. Outgoing messages pile up in an outbox the caller
/// drains and displays; pasted text goes back in through the parse helpers.
pub struct ManualTransport {
    compact: bool,
    session_id: Mutex<String>,
    outbox: Mutex<VecDeque<Outgoing>>,
}

impl ManualTransport {
    pub fn new() -> Self {
        Self {
            compact: false,
            session_id: Mutex::new(String::new()),
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Descriptions as gzip+base64 payloads instead of raw SDP
    pub fn compact() -> Self {
        Self {
            compact: true,
            ..Self::new()
        }
    }

    pub fn take_outgoing(&self) -> Vec<Outgoing> {
        self.outbox.lock().unwrap().drain(..).collect()
    }

    /// Flush candidates by hand, e.g. when discovery timed out
    pub async fn send_batch(&self, candidates: Vec<Candidate>) -> Result<()> {
        if candidates.is_empty() {
            return Ok(());
        }
        self.send(SignalMessage::Candidates { candidates }).await
    }

    fn push(&self, item: Outgoing) {
        self.outbox.lock().unwrap().push_back(item);
    }

    fn render_description(&self, desc: Description) -> Result<String> {
        if !self.compact {
            return Ok(desc.sdp);
        }
        let mut payload = SdpPayload::new(desc);
        let id = self.session_id.lock().unwrap().clone();
        if !id.is_empty() {
            payload.id = id;
        }
        codec::encode(&payload)
    }
}

impl Default for ManualTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingTransport for ManualTransport {
    async fn send(&self, message: SignalMessage) -> Result<()> {
        debug!("Manual outbox <- {}", message.msg_type());
        let item = match message {
            SignalMessage::Offer { sdp } => {
                Outgoing::Description(self.render_description(Description::offer(sdp))?)
            }
            SignalMessage::Answer { sdp } => {
                Outgoing::Description(self.render_description(Description::answer(sdp))?)
            }
            SignalMessage::Ice(c) => Outgoing::Candidates(serde_json::to_string(&[c])?),
            SignalMessage::Candidates { candidates } => {
                Outgoing::Candidates(serde_json::to_string(&candidates)?)
            }
        };
        self.push(item);
        Ok(())
    }

    fn candidate_mode(&self) -> CandidateMode {
        CandidateMode::Batch
    }

    fn attach(&self, session_id: &str) {
        *self.session_id.lock().unwrap() = session_id.to_string();
    }
}

/// Вставленный текст → описание. Принимает raw SDP и compact payload.
pub fn parse_description(text: &str, kind: SdpType) -> Result<Description> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::Protocol("empty description".into()));
    }
    if text.starts_with("v=") {
        // SDP строки разделены CRLF; при копировании их часто теряют
        let sdp = if text.contains("\r\n") {
            text.to_string()
        } else {
            text.lines().map(|l| format!("{}\r\n", l.trim_end())).collect()
        };
        return Ok(Description { kind, sdp });
    }

    let payload = codec::decode(text)?;
    if payload.sdp.kind != kind {
        return Err(Error::Protocol(format!(
            "expected {kind}, got {}",
            payload.sdp.kind
        )));
    }
    Ok(payload.sdp)
}

/// Вставленный JSON-массив → кандидаты. Пустой текст = нет кандидатов.
pub fn parse_candidates(text: &str) -> Result<Vec<Candidate>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(text).map_err(|e| Error::Protocol(format!("bad candidate list: {e}")))
}
