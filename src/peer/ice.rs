use crate::peer::types::{Candidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::{
    api::APIBuilder,
    ice_transport::{
        ice_candidate::RTCIceCandidate, ice_gatherer_state::RTCIceGathererState,
        ice_server::RTCIceServer,
    },
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

/// Буфер ICE кандидатов. Порядок поступления сохраняется, дубликаты не отсеиваются.
#[derive(Debug, Default, Clone)]
pub struct CandidateBuffer {
    items: Vec<Candidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, candidate: Candidate) {
        self.items.push(candidate);
    }

    /// Returns everything buffered so far and leaves the buffer empty.
    pub fn flush_as_batch(&mut self) -> Vec<Candidate> {
        std::mem::take(&mut self.items)
    }

    /// Put candidates back in front of anything buffered since.
    pub fn requeue(&mut self, candidates: Vec<Candidate>) {
        let newer = std::mem::replace(&mut self.items, candidates);
        self.items.extend(newer);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.items.iter()
    }

    pub fn summary(&self) -> CandidateSummary {
        CandidateSummary::of(&self.items)
    }
}

/// Сколько кандидатов каждого типа
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

impl CandidateSummary {
    pub fn of(candidates: &[Candidate]) -> Self {
        let mut s = Self::default();
        for c in candidates {
            match c.kind() {
                Some("host") => s.host += 1,
                Some("srflx") => s.srflx += 1,
                Some("relay") => s.relay += 1,
                _ => {}
            }
        }
        s
    }

    pub fn log(&self) {
        info!(
            "Candidate analysis: {} host, {} srflx, {} relay",
            self.host, self.srflx, self.relay
        );
        if self.relay == 0 {
            warn!("No TURN relay candidates found! Connection through NAT may fail.");
        }
    }
}

/// Проверяет доступность STUN/TURN сервера: поднимает временное соединение
/// и ждёт srflx (для STUN) или relay (для TURN) кандидата.
pub async fn probe_ice_server(config: &ServerConfig, wait: Duration) -> bool {
    let url = add_ice_url_scheme(config);
    debug!("Probing ICE server '{}' -> '{}'", config.url, url);

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![url],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        }],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    match api.new_peer_connection(rtc_config).await {
        Ok(pc) => check_via_ice_gathering(Arc::new(pc), config.is_turn(), wait).await,
        Err(e) => {
            warn!("Failed to create probe peer connection: {e}");
            false
        }
    }
}

async fn check_via_ice_gathering(pc: Arc<RTCPeerConnection>, turn: bool, wait: Duration) -> bool {
    let wanted = if turn { "relay" } else { "srflx" };

    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        let _ = state_tx.send(state);
        Box::pin(async {})
    }));

    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        if let Some(init) = cand.and_then(|c| c.to_json().ok()) {
            let matched = Candidate::new(init.candidate).kind() == Some(wanted);
            debug!("Probe candidate matched={matched}");
            if matched {
                let _ = found_tx.send(());
            }
        }
        Box::pin(async {})
    }));

    // Data channel и offer нужны только чтобы запустить gathering
    if let Err(e) = pc.create_data_channel("probe", None).await {
        warn!("Failed to create probe data channel: {e}");
        return false;
    }
    let started = match pc.create_offer(None).await {
        Ok(offer) => pc.set_local_description(offer).await.is_ok(),
        Err(_) => false,
    };
    if !started {
        warn!("Probe could not start ICE gathering");
        let _ = pc.close().await;
        return false;
    }

    let result = tokio::select! {
        r = timeout(wait, found_rx.recv()) => matches!(r, Ok(Some(()))),
        _ = async {
            while let Some(state) = state_rx.recv().await {
                if state == RTCIceGathererState::Complete {
                    break;
                }
            }
        } => {
            // Gathering закончился; кандидат мог прийти одновременно
            found_rx.try_recv().is_ok()
        }
    };

    let _ = pc.close().await;
    info!("ICE server probe ({wanted}) result: {result}");
    result
}
