#![allow(dead_code)]

use async_trait::async_trait;
use ssc_link::{
    CandidateMode, Error, MemoryNetwork, Negotiator, NegotiatorConfig, Result, SessionEvent,
    Session, SignalMessage, SignalingTransport, TransportEvent,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// One direction of an in-test signaling wire
pub struct PipeTransport {
    mode: CandidateMode,
    peer: mpsc::UnboundedSender<TransportEvent>,
    pub sent: Mutex<Vec<SignalMessage>>,
}

#[async_trait]
impl SignalingTransport for PipeTransport {
    async fn send(&self, message: SignalMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        let _ = self.peer.send(TransportEvent::Message(message.to_json()?));
        Ok(())
    }

    fn candidate_mode(&self) -> CandidateMode {
        self.mode
    }
}

/// Trickle transport that rejects the next N sends of a kind
#[derive(Default)]
pub struct FlakyTransport {
    pub fail_descriptions: AtomicUsize,
    pub fail_candidates: AtomicUsize,
    pub sent: Mutex<Vec<SignalMessage>>,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl SignalingTransport for FlakyTransport {
    async fn send(&self, message: SignalMessage) -> Result<()> {
        let counter = match message {
            SignalMessage::Offer { .. } | SignalMessage::Answer { .. } => &self.fail_descriptions,
            SignalMessage::Ice(_) | SignalMessage::Candidates { .. } => &self.fail_candidates,
        };
        if take_one(counter) {
            return Err(Error::Transport("link down".into()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn candidate_mode(&self) -> CandidateMode {
        CandidateMode::Trickle
    }
}

pub struct Wire {
    pub a: Arc<PipeTransport>,
    pub b: Arc<PipeTransport>,
    /// Inbound events of side A (what B sends lands here)
    pub to_a: mpsc::UnboundedSender<TransportEvent>,
    pub to_b: mpsc::UnboundedSender<TransportEvent>,
    pub a_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub b_events: mpsc::UnboundedReceiver<TransportEvent>,
}

pub fn wire(mode: CandidateMode) -> Wire {
    let (to_a, a_events) = mpsc::unbounded_channel();
    let (to_b, b_events) = mpsc::unbounded_channel();
    Wire {
        a: Arc::new(PipeTransport {
            mode,
            peer: to_b.clone(),
            sent: Mutex::new(Vec::new()),
        }),
        b: Arc::new(PipeTransport {
            mode,
            peer: to_a.clone(),
            sent: Mutex::new(Vec::new()),
        }),
        to_a,
        to_b,
        a_events,
        b_events,
    }
}

pub struct Side {
    pub negotiator: Arc<Negotiator>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

pub fn side(
    net: &MemoryNetwork,
    config: NegotiatorConfig,
    transport: Arc<dyn SignalingTransport>,
) -> Side {
    let (tx, events) = mpsc::unbounded_channel::<SessionEvent>();
    let negotiator = Arc::new(Negotiator::new(
        config,
        Arc::new(net.connector()),
        transport,
        Arc::new(tx),
    ));
    Side { negotiator, events }
}

/// Read events until one matches, failing after [`WAIT`]
pub async fn expect_event<F>(rx: &mut mpsc::UnboundedReceiver<SessionEvent>, what: &str, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    let found = tokio::time::timeout(WAIT, async {
        while let Some(ev) = rx.recv().await {
            if pred(&ev) {
                return Some(ev);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(ev)) => ev,
        _ => panic!("no {what} event"),
    }
}

/// Wait until the negotiator has a session
pub async fn session_of(negotiator: &Negotiator) -> Arc<Session> {
    let found = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(s) = negotiator.current().await {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    found.expect("session created")
}
