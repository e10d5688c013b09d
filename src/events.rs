//! Notifications from a session and its data channel to the caller

use crate::peer::state::ConnectionState;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

/// Everything a caller can observe about a negotiation
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// End of local candidate discovery
    GatheringComplete { candidates: usize },
    NegotiationFailed(String),
    /// ICE reported failed/disconnected; the session is closed, no retry
    NegotiationLost(String),
    /// Disconnected, waiting for the grace period
    ConnectionProblem,
    ConnectionRecovered,
    ChannelOpen { label: String },
    Message { label: String, text: String, data: Bytes },
    ChannelFault { label: String, reason: String },
    ChannelClosed { label: String },
    /// Unknown or malformed signaling message; the loop keeps running
    ProtocolError(String),
    TransportError(String),
}

/// Observer for session notifications
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

impl EventSink for mpsc::UnboundedSender<SessionEvent> {
    fn emit(&self, event: SessionEvent) {
        if self.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }
}

/// Closure sink
pub struct FnSink<F>(pub F);

impl<F> EventSink for FnSink<F>
where
    F: Fn(SessionEvent) + Send + Sync,
{
    fn emit(&self, event: SessionEvent) {
        (self.0)(event)
    }
}

/// Sink that discards everything
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SessionEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
        tx.emit(SessionEvent::ConnectionProblem);
        tx.emit(SessionEvent::ConnectionRecovered);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::ConnectionProblem);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::ConnectionRecovered);
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel::<SessionEvent>();
        drop(rx);
        tx.emit(SessionEvent::ConnectionProblem);
    }

    #[test]
    fn test_fn_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = FnSink({
            let seen = seen.clone();
            move |e| seen.lock().unwrap().push(e)
        });
        sink.emit(SessionEvent::ProtocolError("x".into()));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
