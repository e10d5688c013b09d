//! Owner of the single live [`Session`]

use crate::config::NegotiatorConfig;
use crate::error::{Error, Result};
use crate::events::{EventSink, SessionEvent};
use crate::peer::connection::PeerConnector;
use crate::peer::ice::CandidateBuffer;
use crate::peer::types::{Candidate, Description, Role};
use crate::session::Session;
use crate::signaling::SignalingTransport;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct Negotiator {
    config: NegotiatorConfig,
    connector: Arc<dyn PeerConnector>,
    transport: Arc<dyn SignalingTransport>,
    sink: Arc<dyn EventSink>,
    current: Mutex<Option<Arc<Session>>>,
    /// Кандидаты, пришедшие до создания сессии
    early: StdMutex<CandidateBuffer>,
}

impl Negotiator {
    pub fn new(
        config: NegotiatorConfig,
        connector: Arc<dyn PeerConnector>,
        transport: Arc<dyn SignalingTransport>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            connector,
            transport,
            sink,
            current: Mutex::new(None),
            early: StdMutex::new(CandidateBuffer::new()),
        }
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Tear down the previous session and create the offer for a new one.
    /// On failure the new session stays current, in `new`.
    pub async fn create_as_offerer(&self) -> Result<Arc<Session>> {
        let session = self.replace_session(Role::Offerer).await?;
        session.start_offer().await?;
        Ok(session)
    }

    /// Tear down the previous session, apply `offer` and answer it.
    pub async fn create_as_answerer(&self, offer: Description) -> Result<Arc<Session>> {
        let session = self.replace_session(Role::Answerer).await?;
        session.accept_offer(offer).await?;
        Ok(session)
    }

    async fn replace_session(&self, role: Role) -> Result<Arc<Session>> {
        let mut current = self.current.lock().await;
        if let Some(prev) = current.take() {
            info!("Tearing down previous session {}", prev.id());
            prev.close().await;
        }

        let session = Session::open(
            role,
            self.config.clone(),
            self.connector.as_ref(),
            self.transport.clone(),
            self.sink.clone(),
        )
        .await
        .map_err(|e| {
            warn!("Failed to create peer connection: {e}");
            self.sink.emit(SessionEvent::NegotiationFailed(e.to_string()));
            e
        })?;

        let early = self.early.lock().unwrap().flush_as_batch();
        if !early.is_empty() {
            debug!("Handing {} early candidates to session {}", early.len(), session.id());
            session.apply_candidate_batch(early).await?;
        }
        *current = Some(session.clone());
        Ok(session)
    }

    fn require_session(current: &Option<Arc<Session>>) -> Result<Arc<Session>> {
        current
            .clone()
            .ok_or_else(|| Error::InvalidState("no session".into()))
    }

    pub async fn apply_remote_answer(&self, answer: Description) -> Result<()> {
        let session = Self::require_session(&*self.current.lock().await)?;
        session.apply_remote_answer(answer).await
    }

    /// Without a live session the candidate waits for the next one.
    pub async fn add_remote_candidate(&self, candidate: Candidate) -> Result<()> {
        self.apply_candidate_batch(vec![candidate]).await
    }

    /// Candidates that arrive while the current session is closed (ICE
    /// failure, lost link) belong to the next negotiation.
    pub async fn apply_candidate_batch(&self, candidates: Vec<Candidate>) -> Result<()> {
        let session = {
            let current = self.current.lock().await;
            match current.as_ref() {
                Some(s) if !s.is_closed() => s.clone(),
                _ => {
                    self.keep_early(candidates);
                    return Ok(());
                }
            }
        };
        match session.apply_candidate_batch(candidates.clone()).await {
            // сессия закрылась, пока кандидаты применялись
            Err(Error::InvalidState(_)) if session.is_closed() => {
                self.keep_early(candidates);
                Ok(())
            }
            other => other,
        }
    }

    fn keep_early(&self, candidates: Vec<Candidate>) {
        debug!("No live session, keeping {} candidates", candidates.len());
        let mut early = self.early.lock().unwrap();
        for c in candidates {
            early.add(c);
        }
    }

    pub async fn current(&self) -> Option<Arc<Session>> {
        self.current.lock().await.clone()
    }

    /// Закрыть текущую сессию
    pub async fn close(&self) {
        let session = self.current.lock().await.take();
        self.early.lock().unwrap().flush_as_batch();
        if let Some(session) = session {
            session.close().await;
        }
    }
}
