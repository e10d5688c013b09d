use crate::error::{Error, Result};
use crate::signaling::{CandidateMode, SignalMessage, SignalingTransport, TransportEvent};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Persistent WebSocket to the rendezvous relay. Outbound frames go through
/// a writer task; inbound frames come out as [`TransportEvent`]s.
pub struct RelayTransport {
    url: String,
    outgoing: mpsc::UnboundedSender<String>,
}

impl RelayTransport {
    /// Connect and start the reader/writer tasks. The first event on the
    /// returned receiver is [`TransportEvent::Open`].
    pub async fn connect(
        url: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (ws_stream, _) = connect_async(url).await?;
        info!("Connected to signaling relay {url}");
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let _ = ev_tx.send(TransportEvent::Open);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("Relay write failed: {e}");
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if ev_tx.send(TransportEvent::Message(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = ev_tx.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                }
            }
            debug!("Relay stream ended");
            let _ = ev_tx.send(TransportEvent::Closed);
        });

        Ok((
            Arc::new(Self {
                url: url.to_string(),
                outgoing: out_tx,
            }),
            ev_rx,
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SignalingTransport for RelayTransport {
    async fn send(&self, message: SignalMessage) -> Result<()> {
        debug!("Relay <- {}", message.msg_type());
        self.outgoing
            .send(message.to_json()?)
            .map_err(|_| Error::Transport("relay connection is closed".into()))
    }

    fn candidate_mode(&self) -> CandidateMode {
        CandidateMode::Trickle
    }
}
