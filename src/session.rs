//! One negotiation attempt: a peer connection, its data channel and the
//! offer/answer/candidate sequencing around them.
//!
//! Every negotiation step holds `inner` for its whole duration, so steps are
//! atomic with respect to the event pump. After each await a step re-checks
//! `closed` and stops without touching state if the session was torn down.

use crate::config::NegotiatorConfig;
use crate::error::{Error, Result};
use crate::events::{EventSink, SessionEvent};
use crate::logger::dump_candidate;
use crate::peer::connection::{ChannelLink, ChannelOptions, PeerConnector, PeerEvent, PeerLink};
use crate::peer::data_channel::DataChannelManager;
use crate::peer::ice::{CandidateBuffer, CandidateSummary};
use crate::peer::state::{ChannelState, ConnectionState, LinkState};
use crate::peer::types::{Candidate, Description, Role, SdpType};
use crate::signaling::{CandidateMode, SignalMessage, SignalingTransport};
use crate::utils::random_id;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct SessionInner {
    local: Option<Description>,
    remote: Option<Description>,
    /// Локальное описание уже отправлено через транспорт
    local_sent: bool,
    /// Кандидаты, ещё не отданные транспорту
    local_candidates: CandidateBuffer,
    discovered: Vec<Candidate>,
    /// Удалённые кандидаты, пришедшие раньше remote description
    pending_remote: CandidateBuffer,
    gathering_complete: bool,
    batch_sent: bool,
    link_state: LinkState,
    grace_task: Option<JoinHandle<()>>,
}

pub struct Session {
    id: String,
    role: Role,
    config: NegotiatorConfig,
    link: Arc<dyn PeerLink>,
    transport: Arc<dyn SignalingTransport>,
    sink: Arc<dyn EventSink>,
    channel: DataChannelManager,
    inner: Mutex<SessionInner>,
    closed: AtomicBool,
    state: watch::Sender<ConnectionState>,
    gathered: watch::Sender<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create the peer connection and start its event pump. The session
    /// starts in `new`; nothing is sent until `start_offer`/`accept_offer`.
    pub async fn open(
        role: Role,
        config: NegotiatorConfig,
        connector: &dyn PeerConnector,
        transport: Arc<dyn SignalingTransport>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<Session>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = connector.connect(tx).await?;
        let id = random_id();
        transport.attach(&id);
        info!("Session {id} opened as {role}");

        let session = Arc::new(Session {
            id,
            role,
            config,
            link,
            transport,
            channel: DataChannelManager::new(sink.clone()),
            sink,
            inner: Mutex::new(SessionInner {
                local: None,
                remote: None,
                local_sent: false,
                local_candidates: CandidateBuffer::new(),
                discovered: Vec::new(),
                pending_remote: CandidateBuffer::new(),
                gathering_complete: false,
                batch_sent: false,
                link_state: LinkState::New,
                grace_task: None,
            }),
            closed: AtomicBool::new(false),
            state: watch::channel(ConnectionState::New).0,
            gathered: watch::channel(false).0,
        });
        tokio::spawn(drive(Arc::downgrade(&session), rx));
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn local_description(&self) -> Option<Description> {
        self.inner.lock().await.local.clone()
    }

    pub async fn remote_description(&self) -> Option<Description> {
        self.inner.lock().await.remote.clone()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidState("session closed".into()));
        }
        Ok(())
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Closed {
                return false;
            }
            // negotiating только из new
            if next == ConnectionState::Negotiating && *current != ConnectionState::New {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!("Session {} state -> {next}", self.id);
            self.sink.emit(SessionEvent::StateChanged(next));
        }
    }

    /// Сообщить об ошибке переговоров, если сессия ещё жива
    fn fail(&self, e: Error) -> Error {
        if !self.is_closed() {
            warn!("Negotiation failed: {e}");
            self.sink.emit(SessionEvent::NegotiationFailed(e.to_string()));
        }
        e
    }

    /// ========== OFFER / ANSWER ==========

    /// Offerer: open the data channel, create the offer, set it locally and
    /// send it.
    pub async fn start_offer(&self) -> Result<Description> {
        let mut inner = self.inner.lock().await;
        self.ensure_live()?;
        if self.role != Role::Offerer {
            return Err(Error::InvalidState("only the offerer creates an offer".into()));
        }
        if inner.local.is_some() {
            return Err(Error::InvalidState("offer already created".into()));
        }

        let offer = self.negotiate_offer().await.map_err(|e| self.fail(e))?;
        inner.local = Some(offer.clone());
        self.publish_local(&mut inner, &offer)
            .await
            .map_err(|e| self.fail(e))?;
        self.set_state(ConnectionState::Negotiating);
        Ok(offer)
    }

    async fn negotiate_offer(&self) -> Result<Description> {
        let options = ChannelOptions {
            ordered: true,
            max_packet_life_time_ms: Some(self.config.max_packet_life_time_ms),
        };
        let channel = self
            .link
            .create_data_channel(&self.config.channel_label, options)
            .await?;
        self.ensure_live()?;
        self.channel.bind(channel);

        let offer = self.link.create_offer().await?;
        self.ensure_live()?;
        self.link.set_local_description(offer.clone()).await?;
        self.ensure_live()?;
        Ok(offer)
    }

    /// Answerer: apply the remote offer, drain queued candidates, create the
    /// answer, set it locally and send it.
    pub async fn accept_offer(&self, offer: Description) -> Result<Description> {
        let mut inner = self.inner.lock().await;
        self.ensure_live()?;
        if self.role != Role::Answerer {
            return Err(Error::InvalidState("only the answerer accepts an offer".into()));
        }
        if offer.kind != SdpType::Offer {
            return Err(Error::InvalidState(format!("expected an offer, got {}", offer.kind)));
        }
        if inner.remote.is_some() {
            return Err(Error::InvalidState("offer already applied".into()));
        }

        self.link
            .set_remote_description(offer.clone())
            .await
            .map_err(|e| self.fail(e))?;
        self.ensure_live()?;
        inner.remote = Some(offer);
        self.drain_pending(&mut inner).await;
        self.ensure_live()?;

        let answer = self.negotiate_answer().await.map_err(|e| self.fail(e))?;
        inner.local = Some(answer.clone());
        self.publish_local(&mut inner, &answer)
            .await
            .map_err(|e| self.fail(e))?;
        self.set_state(ConnectionState::Negotiating);
        Ok(answer)
    }

    async fn negotiate_answer(&self) -> Result<Description> {
        let answer = self.link.create_answer().await?;
        self.ensure_live()?;
        self.link.set_local_description(answer.clone()).await?;
        self.ensure_live()?;
        Ok(answer)
    }

    /// Offerer: apply the remote answer and drain queued candidates in
    /// arrival order.
    pub async fn apply_remote_answer(&self, answer: Description) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_live()?;
        if self.role != Role::Offerer {
            return Err(Error::InvalidState("only the offerer applies an answer".into()));
        }
        if inner.local.is_none() {
            return Err(Error::InvalidState("no local offer yet".into()));
        }
        if inner.remote.is_some() {
            return Err(Error::InvalidState("answer already applied".into()));
        }
        if answer.kind != SdpType::Answer {
            return Err(Error::InvalidState(format!("expected an answer, got {}", answer.kind)));
        }

        self.link
            .set_remote_description(answer.clone())
            .await
            .map_err(|e| self.fail(e))?;
        self.ensure_live()?;
        inner.remote = Some(answer);
        info!("Remote answer applied");
        self.drain_pending(&mut inner).await;
        Ok(())
    }

    async fn publish_local(&self, inner: &mut SessionInner, desc: &Description) -> Result<()> {
        self.transport
            .send(SignalMessage::description(desc))
            .await
            .map_err(|e| Error::NegotiationFailed(format!("sending local {}: {e}", desc.kind)))?;
        self.ensure_live()?;
        inner.local_sent = true;
        debug!("Local {} sent", desc.kind);
        self.flush_local(inner).await;
        Ok(())
    }

    /// ========== CANDIDATES ==========

    /// Queue until the remote description exists, then apply immediately.
    pub async fn add_remote_candidate(&self, candidate: Candidate) -> Result<()> {
        self.apply_candidate_batch(vec![candidate]).await
    }

    /// Same as [`Session::add_remote_candidate`] for each candidate, in order.
    /// A candidate the peer connection rejects is logged and skipped.
    pub async fn apply_candidate_batch(&self, candidates: Vec<Candidate>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_live()?;
        if inner.remote.is_none() {
            debug!("Queueing {} remote candidates", candidates.len());
            for c in candidates {
                inner.pending_remote.add(c);
            }
            return Ok(());
        }
        for c in candidates {
            self.apply_one(c).await;
            self.ensure_live()?;
        }
        Ok(())
    }

    async fn drain_pending(&self, inner: &mut SessionInner) {
        let queued = inner.pending_remote.flush_as_batch();
        if !queued.is_empty() {
            info!("Applying {} queued remote candidates", queued.len());
        }
        for c in queued {
            if self.is_closed() {
                return;
            }
            self.apply_one(c).await;
        }
    }

    async fn apply_one(&self, candidate: Candidate) {
        if let Err(e) = self.link.add_ice_candidate(candidate).await {
            warn!("Failed to add candidate: {e}");
        }
    }

    /// Ждать окончания сбора локальных кандидатов
    pub async fn wait_gathering_complete(&self, wait: Duration) -> bool {
        let mut rx = self.gathered.subscribe();
        let res = tokio::time::timeout(wait, rx.wait_for(|done| *done)).await;
        matches!(res, Ok(Ok(_)))
    }

    /// Drain local candidates not yet handed to the transport.
    pub async fn take_local_candidates(&self) -> Vec<Candidate> {
        self.inner.lock().await.local_candidates.flush_as_batch()
    }

    pub async fn local_summary(&self) -> CandidateSummary {
        CandidateSummary::of(&self.inner.lock().await.discovered)
    }

    async fn flush_local(&self, inner: &mut SessionInner) {
        if !inner.local_sent {
            return;
        }
        let result = match self.transport.candidate_mode() {
            CandidateMode::Trickle => {
                let mut queued = inner.local_candidates.flush_as_batch().into_iter();
                let mut result = Ok(());
                while let Some(c) = queued.next() {
                    if let Err(e) = self.transport.send(SignalMessage::Ice(c.clone())).await {
                        // неотправленные вернутся в буфер до следующего flush
                        inner
                            .local_candidates
                            .requeue(std::iter::once(c).chain(queued).collect());
                        result = Err(e);
                        break;
                    }
                }
                result
            }
            CandidateMode::Batch => {
                if !inner.gathering_complete || inner.batch_sent {
                    return;
                }
                inner.batch_sent = true;
                let candidates = inner.local_candidates.flush_as_batch();
                if candidates.is_empty() {
                    return;
                }
                info!("Sending batch of {} candidates", candidates.len());
                self.transport
                    .send(SignalMessage::Candidates { candidates })
                    .await
            }
        };
        if let Err(e) = result {
            warn!("Failed to send local candidates: {e}");
            self.sink.emit(SessionEvent::TransportError(e.to_string()));
        }
    }

    async fn on_local_candidate(&self, candidate: Option<Candidate>) {
        let mut inner = self.inner.lock().await;
        if self.is_closed() {
            return;
        }
        match candidate {
            Some(c) => {
                dump_candidate("LOCAL", &c);
                inner.discovered.push(c.clone());
                inner.local_candidates.add(c);
                if self.transport.candidate_mode() == CandidateMode::Trickle {
                    self.flush_local(&mut inner).await;
                }
            }
            None => {
                if inner.gathering_complete {
                    return;
                }
                inner.gathering_complete = true;
                let summary = CandidateSummary::of(&inner.discovered);
                summary.log();
                self.sink.emit(SessionEvent::GatheringComplete {
                    candidates: inner.discovered.len(),
                });
                self.flush_local(&mut inner).await;
                self.gathered.send_replace(true);
            }
        }
    }

    /// ========== LINK STATE ==========

    async fn on_link_state(self: &Arc<Self>, st: LinkState) {
        let mut inner = self.inner.lock().await;
        if self.is_closed() {
            return;
        }
        let prev = inner.link_state;
        inner.link_state = st;
        debug!("Link state {prev:?} -> {st:?}");

        match st {
            LinkState::Connected => {
                if let Some(handle) = inner.grace_task.take() {
                    debug!("Aborting pending disconnect task - connection restored");
                    handle.abort();
                }
                if prev == LinkState::Disconnected {
                    info!("Connection recovered");
                    self.sink.emit(SessionEvent::ConnectionRecovered);
                }
                drop(inner);
                self.set_state(ConnectionState::Connected);
            }
            LinkState::Disconnected => {
                warn!("Connection problem, waiting {:?}", self.config.disconnect_grace());
                self.sink.emit(SessionEvent::ConnectionProblem);
                if inner.grace_task.is_none() {
                    inner.grace_task = Some(self.spawn_grace_timer());
                }
            }
            LinkState::Failed => {
                drop(inner);
                self.link.dump_stats("FAILED").await;
                self.sink
                    .emit(SessionEvent::NegotiationLost("ICE connection failed".into()));
                self.close().await;
            }
            LinkState::Closed => {
                drop(inner);
                info!("Peer connection closed underneath the session");
                self.close().await;
            }
            LinkState::New | LinkState::Connecting => {}
        }
    }

    fn spawn_grace_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let grace = self.config.disconnect_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(session) = weak.upgrade() else {
                return;
            };
            let lost = {
                let mut inner = session.inner.lock().await;
                // close() не должен абортить этот же таск
                inner.grace_task = None;
                !session.is_closed() && inner.link_state != LinkState::Connected
            };
            if lost {
                warn!("Connection not restored within {grace:?}");
                session.sink.emit(SessionEvent::NegotiationLost(
                    "connection lost after grace period".into(),
                ));
                session.close().await;
            }
        })
    }

    fn on_remote_channel(&self, channel: Arc<dyn ChannelLink>) {
        if self.is_closed() {
            return;
        }
        info!("Remote data channel offered: {}", channel.label());
        self.channel.bind(channel);
    }

    /// ========== DATA CHANNEL ==========

    pub async fn send_text(&self, payload: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        self.channel.send_text(payload).await
    }

    pub async fn send(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        self.channel.send(data).await
    }

    pub async fn wait_for_state(&self, wanted: ConnectionState, wait: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let res = tokio::time::timeout(wait, rx.wait_for(|s| *s == wanted)).await;
        matches!(res, Ok(Ok(_)))
    }

    pub async fn wait_for_channel(&self, wanted: ChannelState, wait: Duration) -> bool {
        self.channel.wait_for(wanted, wait).await
    }

    /// Закрыть канал и соединение. Повторный вызов ничего не делает.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing session {}", self.id);
        self.channel.close().await;
        if let Err(e) = self.link.close().await {
            debug!("Peer connection close error: {e}");
        }

        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.grace_task.take() {
            handle.abort();
        }
        inner.pending_remote.flush_as_batch();
        inner.local_candidates.flush_as_batch();
        drop(inner);
        self.set_state(ConnectionState::Closed);
    }
}

/// Насос событий peer connection. Держит только Weak, чтобы не продлевать жизнь сессии.
async fn drive(session: Weak<Session>, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        if session.is_closed() {
            break;
        }
        match event {
            PeerEvent::IceCandidate(c) => session.on_local_candidate(c).await,
            PeerEvent::StateChange(st) => session.on_link_state(st).await,
            PeerEvent::DataChannel(ch) => session.on_remote_channel(ch),
        }
    }
    debug!("Session event pump finished");
}
