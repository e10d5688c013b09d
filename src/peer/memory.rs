//! In-process peer connection backend.
//!
//! Peers created from the same [`MemoryNetwork`] find each other through an
//! id embedded in their SDP. The backend keeps the ordering rules of a real
//! stack: remote candidates are rejected until a remote description is set,
//! and a pair only connects once both sides hold both descriptions and at
//! least one remote candidate.

use crate::error::{Error, Result};
use crate::peer::connection::{
    next_channel_id, ChannelEvent, ChannelLink, ChannelOptions, ChannelTap, PeerConnector,
    PeerEvent, PeerLink,
};
use crate::peer::state::LinkState;
use crate::peer::types::{Candidate, Description, SdpType};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::debug;

const PEER_ATTR: &str = "a=x-memory-peer:";

#[derive(Default)]
struct NetworkInner {
    peers: Mutex<HashMap<u64, Weak<MemoryPeer>>>,
    next_peer: AtomicU64,
    fail_offers: AtomicUsize,
    fail_answers: AtomicUsize,
    connect_lock: Mutex<()>,
}

/// Shared medium for [`MemoryConnector`]s
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.inner.clone(),
            host_candidates: 2,
        }
    }

    /// The next `create_offer` on this network fails
    pub fn fail_next_offer(&self) {
        self.inner.fail_offers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn fail_next_answer(&self) {
        self.inner.fail_answers.fetch_add(1, Ordering::SeqCst);
    }

    /// Report a link state on every live peer, e.g. to simulate ICE failure
    pub fn report_state(&self, state: LinkState) {
        for peer in self.live_peers() {
            peer.st.lock().unwrap().link = state;
            let _ = peer.events.send(PeerEvent::StateChange(state));
        }
    }

    /// Remote candidates applied so far by every live peer, keyed by peer id
    pub fn applied_candidates(&self) -> HashMap<u64, Vec<Candidate>> {
        self.live_peers()
            .into_iter()
            .map(|p| (p.id, p.st.lock().unwrap().applied.clone()))
            .collect()
    }

    fn live_peers(&self) -> Vec<Arc<MemoryPeer>> {
        self.inner
            .peers
            .lock()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

pub struct MemoryConnector {
    network: Arc<NetworkInner>,
    host_candidates: usize,
}

impl MemoryConnector {
    /// Number of host candidates each peer discovers
    pub fn with_host_candidates(mut self, n: usize) -> Self {
        self.host_candidates = n;
        self
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn connect(&self, events: mpsc::UnboundedSender<PeerEvent>) -> Result<Arc<dyn PeerLink>> {
        let id = self.network.next_peer.fetch_add(1, Ordering::SeqCst) + 1;
        let peer = Arc::new(MemoryPeer {
            id,
            network: Arc::downgrade(&self.network),
            events,
            host_candidates: self.host_candidates,
            st: Mutex::new(PeerState::default()),
        });
        self.network
            .peers
            .lock()
            .unwrap()
            .insert(id, Arc::downgrade(&peer));
        Ok(peer as Arc<dyn PeerLink>)
    }
}

struct PeerState {
    local: Option<Description>,
    remote: Option<Description>,
    remote_peer: Option<u64>,
    applied: Vec<Candidate>,
    /// Локальные каналы, ещё не переданные удалённой стороне
    unmirrored: Vec<Arc<MemoryChannel>>,
    channels: Vec<Arc<MemoryChannel>>,
    link: LinkState,
    closed: bool,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            local: None,
            remote: None,
            remote_peer: None,
            applied: Vec::new(),
            unmirrored: Vec::new(),
            channels: Vec::new(),
            link: LinkState::New,
            closed: false,
        }
    }
}

impl PeerState {
    fn ready(&self) -> bool {
        !self.closed
            && self.local.is_some()
            && self.remote.is_some()
            && !self.applied.is_empty()
            && self.link != LinkState::Connected
    }
}

pub struct MemoryPeer {
    id: u64,
    network: Weak<NetworkInner>,
    events: mpsc::UnboundedSender<PeerEvent>,
    host_candidates: usize,
    st: Mutex<PeerState>,
}

fn sdp_for(id: u64, kind: SdpType) -> String {
    format!(
        "v=0\r\no=- {id} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
         m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
         a=setup:{}\r\n{PEER_ATTR}{id}\r\n",
        if kind == SdpType::Offer { "actpass" } else { "active" }
    )
}

fn peer_of(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|l| l.strip_prefix(PEER_ATTR))
        .and_then(|v| v.trim().parse().ok())
}

impl MemoryPeer {
    fn ensure_open(&self) -> Result<()> {
        if self.st.lock().unwrap().closed {
            return Err(Error::NegotiationFailed("peer connection is closed".into()));
        }
        Ok(())
    }

    fn gather(&self) {
        for k in 1..=self.host_candidates {
            let cand = Candidate {
                candidate: format!(
                    "candidate:{}{k} 1 udp 2130706431 10.0.{}.{k} {} typ host",
                    self.id,
                    self.id % 256,
                    5000 + k
                ),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            };
            let _ = self.events.send(PeerEvent::IceCandidate(Some(cand)));
        }
        let _ = self.events.send(PeerEvent::IceCandidate(None));
    }

    fn try_connect(&self) {
        let Some(network) = self.network.upgrade() else {
            return;
        };
        let _guard = network.connect_lock.lock().unwrap();

        let remote_id = {
            let st = self.st.lock().unwrap();
            if !st.ready() {
                return;
            }
            st.remote_peer
        };
        let Some(remote) = remote_id
            .and_then(|id| network.peers.lock().unwrap().get(&id).cloned())
            .and_then(|w| w.upgrade())
        else {
            return;
        };
        if !remote.st.lock().unwrap().ready() {
            return;
        }
        debug!("memory peers {} <-> {} connected", self.id, remote.id);

        let mine = self.mark_connected();
        let theirs = remote.mark_connected();
        mirror_channels(mine, &remote);
        mirror_channels(theirs, self);
    }

    fn mark_connected(&self) -> Vec<Arc<MemoryChannel>> {
        let unmirrored = {
            let mut st = self.st.lock().unwrap();
            st.link = LinkState::Connected;
            std::mem::take(&mut st.unmirrored)
        };
        let _ = self
            .events
            .send(PeerEvent::StateChange(LinkState::Connecting));
        let _ = self.events.send(PeerEvent::StateChange(LinkState::Connected));
        unmirrored
    }
}

/// Каналы одной стороны появляются на другой через on_data_channel
fn mirror_channels(channels: Vec<Arc<MemoryChannel>>, remote: &MemoryPeer) {
    for local in channels {
        let far = Arc::new(MemoryChannel::new(&local.label));
        local.st.lock().unwrap().peer = Arc::downgrade(&far);
        far.st.lock().unwrap().peer = Arc::downgrade(&local);
        remote.st.lock().unwrap().channels.push(far.clone());
        let _ = remote.events.send(PeerEvent::DataChannel(far.clone()));
        local.set_open();
        far.set_open();
    }
}

#[async_trait]
impl PeerLink for MemoryPeer {
    async fn create_data_channel(
        &self,
        label: &str,
        _options: ChannelOptions,
    ) -> Result<Arc<dyn ChannelLink>> {
        self.ensure_open()?;
        let ch = Arc::new(MemoryChannel::new(label));
        let mut st = self.st.lock().unwrap();
        st.channels.push(ch.clone());
        st.unmirrored.push(ch.clone());
        Ok(ch as Arc<dyn ChannelLink>)
    }

    async fn create_offer(&self) -> Result<Description> {
        self.ensure_open()?;
        if let Some(n) = self.network.upgrade() {
            if take_one(&n.fail_offers) {
                return Err(Error::NegotiationFailed("offer creation rejected".into()));
            }
        }
        Ok(Description::offer(sdp_for(self.id, SdpType::Offer)))
    }

    async fn create_answer(&self) -> Result<Description> {
        self.ensure_open()?;
        let has_offer = matches!(
            self.st.lock().unwrap().remote,
            Some(Description {
                kind: SdpType::Offer,
                ..
            })
        );
        if !has_offer {
            return Err(Error::NegotiationFailed(
                "cannot create answer without a remote offer".into(),
            ));
        }
        if let Some(n) = self.network.upgrade() {
            if take_one(&n.fail_answers) {
                return Err(Error::NegotiationFailed("answer creation rejected".into()));
            }
        }
        Ok(Description::answer(sdp_for(self.id, SdpType::Answer)))
    }

    async fn set_local_description(&self, desc: Description) -> Result<()> {
        self.ensure_open()?;
        {
            let mut st = self.st.lock().unwrap();
            if st.local.is_some() {
                return Err(Error::NegotiationFailed("local description already set".into()));
            }
            if desc.kind == SdpType::Answer && st.remote.is_none() {
                return Err(Error::NegotiationFailed(
                    "answer set before remote offer".into(),
                ));
            }
            st.local = Some(desc);
        }
        self.gather();
        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: Description) -> Result<()> {
        self.ensure_open()?;
        let remote_peer = peer_of(&desc.sdp)
            .ok_or_else(|| Error::NegotiationFailed("malformed session description".into()))?;
        {
            let mut st = self.st.lock().unwrap();
            let expected = match st.local {
                None => SdpType::Offer,
                Some(_) => SdpType::Answer,
            };
            if st.remote.is_some() || desc.kind != expected {
                return Err(Error::NegotiationFailed(format!(
                    "unexpected remote {} in current signaling state",
                    desc.kind
                )));
            }
            st.remote = Some(desc);
            st.remote_peer = Some(remote_peer);
        }
        self.try_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<()> {
        self.ensure_open()?;
        if !candidate.candidate.starts_with("candidate:") {
            return Err(Error::NegotiationFailed(format!(
                "malformed candidate {:?}",
                candidate.candidate
            )));
        }
        {
            let mut st = self.st.lock().unwrap();
            if st.remote.is_none() {
                return Err(Error::NegotiationFailed(
                    "remote description is not set".into(),
                ));
            }
            st.applied.push(candidate);
        }
        self.try_connect();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let channels = {
            let mut st = self.st.lock().unwrap();
            if st.closed {
                return Ok(());
            }
            st.closed = true;
            st.link = LinkState::Closed;
            std::mem::take(&mut st.channels)
        };
        for ch in channels {
            ch.shutdown();
        }
        if let Some(n) = self.network.upgrade() {
            n.peers.lock().unwrap().remove(&self.id);
        }
        let _ = self.events.send(PeerEvent::StateChange(LinkState::Closed));
        Ok(())
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

struct ChannelSlot {
    tap: ChannelTap,
    peer: Weak<MemoryChannel>,
    open: bool,
    closed: bool,
}

pub struct MemoryChannel {
    id: u64,
    label: String,
    st: Mutex<ChannelSlot>,
}

impl MemoryChannel {
    fn new(label: &str) -> Self {
        Self {
            id: next_channel_id(),
            label: label.to_string(),
            st: Mutex::new(ChannelSlot {
                tap: ChannelTap::default(),
                peer: Weak::new(),
                open: false,
                closed: false,
            }),
        }
    }

    // События до bind копятся и отдаются при bind
    fn emit(st: &mut ChannelSlot, event: ChannelEvent) {
        st.tap.push(event);
    }

    fn set_open(&self) {
        let mut st = self.st.lock().unwrap();
        if st.closed || st.open {
            return;
        }
        st.open = true;
        Self::emit(&mut st, ChannelEvent::Open);
    }

    /// Закрыть этот конец и сообщить второму
    fn shutdown(&self) {
        let peer = {
            let mut st = self.st.lock().unwrap();
            if st.closed {
                return;
            }
            st.closed = true;
            st.open = false;
            Self::emit(&mut st, ChannelEvent::Close);
            st.peer.upgrade()
        };
        if let Some(peer) = peer {
            peer.shutdown();
        }
    }

    fn deliver(&self, data: Bytes) {
        let mut st = self.st.lock().unwrap();
        if !st.closed {
            Self::emit(&mut st, ChannelEvent::Message(data));
        }
    }
}

#[async_trait]
impl ChannelLink for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn bind(&self, events: mpsc::UnboundedSender<ChannelEvent>) {
        self.st.lock().unwrap().tap.attach(events);
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let peer = {
            let st = self.st.lock().unwrap();
            if st.closed {
                return Err(Error::ChannelClosed);
            }
            if !st.open {
                return Err(Error::ChannelFault("channel is not open".into()));
            }
            st.peer.upgrade()
        };
        match peer {
            Some(peer) => {
                peer.deliver(data);
                Ok(())
            }
            None => Err(Error::ChannelFault("remote end is gone".into())),
        }
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}
