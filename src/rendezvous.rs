//! Minimal rendezvous relay: every text frame from one client goes to all
//! other connected clients.

use crate::error::Result;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Кадр, по которому сервер закрывает соединение отправителя
pub const CLOSE_COMMAND: &str = "close_server";

type Clients = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>>;

pub struct RendezvousServer {
    listener: TcpListener,
    clients: Clients,
}

impl RendezvousServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            clients: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until the listener fails
    pub async fn run(self) -> Result<()> {
        info!("Rendezvous relay listening on {}", self.local_addr()?);
        let mut next_id = 0u64;
        loop {
            let (stream, peer) = self.listener.accept().await?;
            next_id += 1;
            tokio::spawn(handle_client(next_id, stream, peer, self.clients.clone()));
        }
    }
}

async fn handle_client(id: u64, stream: TcpStream, peer: SocketAddr, clients: Clients) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {peer} failed: {e}");
            return;
        }
    };
    info!("Client {id} connected from {peer}");
    let (mut sender, mut receiver) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    clients.lock().unwrap().insert(id, tx);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Client {id} error: {e}");
                break;
            }
        };
        if text.trim() == CLOSE_COMMAND {
            info!("Client {id} asked to close");
            break;
        }

        let others: Vec<_> = clients
            .lock()
            .unwrap()
            .iter()
            .filter(|(other, _)| **other != id)
            .map(|(_, tx)| tx.clone())
            .collect();
        debug!("Forwarding {} bytes from {id} to {} clients", text.len(), others.len());
        for tx in others {
            let _ = tx.send(Message::Text(text.clone()));
        }
    }

    // Удаление отправителя закрывает его writer
    clients.lock().unwrap().remove(&id);
    let _ = send_task.await;
    info!("Client {id} disconnected");
}
