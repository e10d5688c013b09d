use crate::error::{Error, Result};
use crate::events::{EventSink, SessionEvent};
use crate::peer::connection::{ChannelEvent, ChannelLink};
use crate::peer::state::ChannelState;
use crate::utils::decode_text;
use bytes::Bytes;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

struct Slot {
    channel: Option<Arc<dyn ChannelLink>>,
    bound_id: Option<u64>,
    label: String,
    closed: bool,
}

/// Владеет единственным data channel сессии
pub struct DataChannelManager {
    sink: Arc<dyn EventSink>,
    slot: Arc<Mutex<Slot>>,
    state: Arc<watch::Sender<ChannelState>>,
}

impl DataChannelManager {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        let (state, _) = watch::channel(ChannelState::Connecting);
        Self {
            sink,
            slot: Arc::new(Mutex::new(Slot {
                channel: None,
                bound_id: None,
                label: String::new(),
                closed: false,
            })),
            state: Arc::new(state),
        }
    }

    /// Подписаться на события канала. Повторный bind того же канала ничего не делает.
    pub fn bind(&self, channel: Arc<dyn ChannelLink>) -> bool {
        let id = channel.id();
        {
            let mut slot = self.slot.lock().unwrap();
            if slot.closed || slot.bound_id == Some(id) {
                return false;
            }
            if slot.bound_id.is_some() {
                debug!("Replacing data channel {:?} with {}", slot.label, channel.label());
            }
            slot.bound_id = Some(id);
            slot.label = channel.label();
            slot.channel = Some(channel.clone());
        }
        self.state.send_replace(ChannelState::Connecting);

        let (tx, rx) = mpsc::unbounded_channel();
        channel.bind(tx);
        tokio::spawn(pump(
            id,
            Arc::downgrade(&self.slot),
            self.state.clone(),
            self.sink.clone(),
            rx,
        ));
        true
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn label(&self) -> Option<String> {
        let slot = self.slot.lock().unwrap();
        slot.bound_id.map(|_| slot.label.clone())
    }

    /// Ждать нужного состояния канала
    pub async fn wait_for(&self, wanted: ChannelState, wait: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let res = tokio::time::timeout(wait, rx.wait_for(|s| *s == wanted)).await;
        matches!(res, Ok(Ok(_)))
    }

    fn ready_channel(&self) -> Result<Arc<dyn ChannelLink>> {
        let slot = self.slot.lock().unwrap();
        let state = self.state();
        if slot.closed || state == ChannelState::Closed {
            return Err(Error::ChannelClosed);
        }
        match (&slot.channel, state) {
            (Some(ch), ChannelState::Open) => Ok(ch.clone()),
            _ => Err(Error::ChannelNotReady(state)),
        }
    }

    /// текст по каналу
    pub async fn send_text(&self, payload: &str) -> Result<()> {
        let ch = self.ready_channel()?;
        debug!("send_text: {} bytes", payload.len());
        ch.send_text(payload.to_owned()).await
    }

    pub async fn send(&self, data: Bytes) -> Result<()> {
        let ch = self.ready_channel()?;
        ch.send(data).await
    }

    /// Закрыть канал. После возврата отправка и приём невозможны.
    pub async fn close(&self) {
        let (channel, label) = {
            let mut slot = self.slot.lock().unwrap();
            if slot.closed {
                return;
            }
            slot.closed = true;
            (slot.channel.take(), slot.label.clone())
        };
        let was = self.state.send_replace(ChannelState::Closed);
        if let Some(ch) = channel {
            if let Err(e) = ch.close().await {
                debug!("Data channel close error: {e}");
            }
            if was != ChannelState::Closed {
                self.sink.emit(SessionEvent::ChannelClosed { label });
            }
        }
    }
}

async fn pump(
    id: u64,
    slot: Weak<Mutex<Slot>>,
    state: Arc<watch::Sender<ChannelState>>,
    sink: Arc<dyn EventSink>,
    mut rx: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(slot) = slot.upgrade() else {
            break;
        };
        // Канал закрыт или заменён: события устаревшего экземпляра не доставляем
        let label = {
            let slot = slot.lock().unwrap();
            if slot.closed || slot.bound_id != Some(id) {
                break;
            }
            slot.label.clone()
        };

        match event {
            ChannelEvent::Open => {
                info!("Data channel {label:?} open");
                state.send_replace(ChannelState::Open);
                sink.emit(SessionEvent::ChannelOpen { label });
            }
            ChannelEvent::Message(data) => {
                let text = decode_text(&data);
                debug!("Received message, length: {}", data.len());
                sink.emit(SessionEvent::Message { label, text, data });
            }
            ChannelEvent::Error(reason) => {
                warn!("Data channel {label:?} error: {reason}");
                sink.emit(SessionEvent::ChannelFault { label, reason });
            }
            ChannelEvent::Close => {
                info!("Data channel {label:?} closed");
                state.send_replace(ChannelState::Closed);
                sink.emit(SessionEvent::ChannelClosed { label });
                break;
            }
        }
    }
}
