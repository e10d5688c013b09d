use crate::error::{Error, Result};
use crate::logger::dump_candidate;
use crate::peer::state::LinkState;
use crate::peer::types::{Candidate, Description, SdpType, ServerConfig};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::{
    api::APIBuilder,
    data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel},
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// События от стека peer connection
pub enum PeerEvent {
    /// `None` = конец сбора кандидатов
    IceCandidate(Option<Candidate>),
    StateChange(LinkState),
    /// Remote peer opened its own data channel
    DataChannel(Arc<dyn ChannelLink>),
}

/// События data channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Error(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub ordered: bool,
    pub max_packet_life_time_ms: Option<u16>,
}

/// Factory for peer connections. The ICE agent behind it is not ours.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, events: mpsc::UnboundedSender<PeerEvent>) -> Result<Arc<dyn PeerLink>>;
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn ChannelLink>>;
    async fn create_offer(&self) -> Result<Description>;
    async fn create_answer(&self) -> Result<Description>;
    async fn set_local_description(&self, desc: Description) -> Result<()>;
    async fn set_remote_description(&self, desc: Description) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<()>;
    async fn close(&self) -> Result<()>;

    /// Снимок статистики в лог
    async fn dump_stats(&self, _moment: &str) {}
}

#[async_trait]
pub trait ChannelLink: Send + Sync {
    /// Unique per channel instance
    fn id(&self) -> u64;
    fn label(&self) -> String;
    /// Route open/message/close/error events into `events`
    fn bind(&self, events: mpsc::UnboundedSender<ChannelEvent>);
    async fn send(&self, data: Bytes) -> Result<()>;
    async fn send_text(&self, text: String) -> Result<()> {
        self.send(Bytes::from(text)).await
    }
    async fn close(&self) -> Result<()>;
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_channel_id() -> u64 {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// ========== WEBRTC BACKEND ==========

/// Коннектор поверх `webrtc` crate
pub struct WebRtcConnector {
    ice_servers: Vec<ServerConfig>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self { ice_servers }
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn link_state(st: RTCPeerConnectionState) -> LinkState {
    match st {
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

fn to_rtc(desc: Description) -> Result<RTCSessionDescription> {
    match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(Error::backend)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<Description> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(Description::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(Description::answer(desc.sdp)),
        other => Err(Error::NegotiationFailed(format!(
            "unsupported description type {other}"
        ))),
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, events: mpsc::UnboundedSender<PeerEvent>) -> Result<Arc<dyn PeerLink>> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(rtc_config(&self.ice_servers))
                .await
                .map_err(Error::backend)?,
        );

        // Обработчик для сбора локальных кандидатов
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let event = match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => Some(PeerEvent::IceCandidate(Some(Candidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }))),
                    Err(e) => {
                        warn!("Failed to serialize local candidate: {e}");
                        None
                    }
                },
                // cand == None означает конец сбора
                None => Some(PeerEvent::IceCandidate(None)),
            };
            if let Some(event) = event {
                let _ = tx.send(event);
            }
            Box::pin(async {})
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!("ICE gathering state changed to: {:?}", state);
            Box::pin(async {})
        }));

        let tx = events.clone();
        let pc_stats = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!("Peer connection state changed to: {:?}", st);
            if st == RTCPeerConnectionState::Failed {
                if let Some(pc) = pc_stats.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            let _ = tx.send(PeerEvent::StateChange(link_state(st)));
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            debug!("Remote data channel offered: {}", dc.label());
            let _ = tx.send(PeerEvent::DataChannel(Arc::new(WebRtcChannel::new(dc))));
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcLink { pc }))
    }
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn ChannelLink>> {
        let init = RTCDataChannelInit {
            ordered: Some(options.ordered),
            max_packet_life_time: options.max_packet_life_time_ms,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(Error::backend)?;
        Ok(Arc::new(WebRtcChannel::new(dc)))
    }

    async fn create_offer(&self) -> Result<Description> {
        from_rtc(self.pc.create_offer(None).await.map_err(Error::backend)?)
    }

    async fn create_answer(&self) -> Result<Description> {
        from_rtc(self.pc.create_answer(None).await.map_err(Error::backend)?)
    }

    async fn set_local_description(&self, desc: Description) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(Error::backend)
    }

    async fn set_remote_description(&self, desc: Description) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(Error::backend)
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<()> {
        dump_candidate("REMOTE", &candidate);
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(Error::backend)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(Error::backend)
    }

    async fn dump_stats(&self, moment: &str) {
        dump_selected_pair(&self.pc, moment).await;
    }
}

/// Быстрый снимок getStats → выбранная пара
async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

/// Очередь событий канала до bind. Обработчики dc ставятся сразу при
/// создании канала, иначе первое сообщение от удалённой стороны теряется.
#[derive(Default)]
pub(crate) struct ChannelTap {
    sink: Option<mpsc::UnboundedSender<ChannelEvent>>,
    pending: Vec<ChannelEvent>,
}

impl ChannelTap {
    pub(crate) fn push(&mut self, event: ChannelEvent) {
        match &self.sink {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => self.pending.push(event),
        }
    }

    /// Hand everything queued so far to `events`. Only the first call binds.
    pub(crate) fn attach(&mut self, events: mpsc::UnboundedSender<ChannelEvent>) -> bool {
        if self.sink.is_some() {
            return false;
        }
        for event in self.pending.drain(..) {
            let _ = events.send(event);
        }
        self.sink = Some(events);
        true
    }
}

struct WebRtcChannel {
    id: u64,
    dc: Arc<RTCDataChannel>,
    tap: Arc<Mutex<ChannelTap>>,
}

impl WebRtcChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        let tap = Arc::new(Mutex::new(ChannelTap::default()));

        let t = tap.clone();
        dc.on_open(Box::new(move || {
            t.lock().unwrap().push(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let t = tap.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            t.lock().unwrap().push(ChannelEvent::Message(msg.data));
            Box::pin(async {})
        }));

        let t = tap.clone();
        dc.on_error(Box::new(move |err: webrtc::Error| {
            t.lock().unwrap().push(ChannelEvent::Error(err.to_string()));
            Box::pin(async {})
        }));

        let t = tap.clone();
        dc.on_close(Box::new(move || {
            t.lock().unwrap().push(ChannelEvent::Close);
            Box::pin(async {})
        }));

        Self {
            id: next_channel_id(),
            dc,
            tap,
        }
    }
}

#[async_trait]
impl ChannelLink for WebRtcChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn bind(&self, events: mpsc::UnboundedSender<ChannelEvent>) {
        if !self.tap.lock().unwrap().attach(events) {
            debug!("Data channel {} already bound", self.id);
        }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| Error::ChannelFault(e.to_string()))
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| Error::ChannelFault(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.dc
            .close()
            .await
            .map_err(|e| Error::ChannelFault(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_before_bind_are_kept_in_order() {
        let mut tap = ChannelTap::default();
        tap.push(ChannelEvent::Open);
        tap.push(ChannelEvent::Message(Bytes::from_static(b"ping")));

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(tap.attach(tx));
        tap.push(ChannelEvent::Close);

        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::Open);
        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelEvent::Message(Bytes::from_static(b"ping"))
        );
        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_second_bind_is_ignored() {
        let mut tap = ChannelTap::default();
        let (first, mut first_rx) = mpsc::unbounded_channel();
        let (second, mut second_rx) = mpsc::unbounded_channel();
        assert!(tap.attach(first));
        assert!(!tap.attach(second));

        tap.push(ChannelEvent::Open);
        assert_eq!(first_rx.try_recv().unwrap(), ChannelEvent::Open);
        assert!(second_rx.try_recv().is_err());
    }
}
