mod common;

use common::{expect_event, session_of, side, WAIT};
use futures::{SinkExt, StreamExt};
use ssc_link::{
    ChannelState, ConnectionState, MemoryNetwork, NegotiatorConfig, NullSink, RelayTransport,
    RendezvousServer, Role, SessionEvent, SignalMessage, SignalingLoop, SignalingTransport,
    TransportEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

async fn start_relay() -> String {
    let server = RendezvousServer::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    tokio::spawn(server.run());
    url
}

#[tokio::test]
async fn test_relay_forwards_to_other_clients_only() {
    let url = start_relay().await;
    let (a, mut a_rx) = RelayTransport::connect(&url).await.unwrap();
    let (_b, mut b_rx) = RelayTransport::connect(&url).await.unwrap();
    assert_eq!(a_rx.recv().await.unwrap(), TransportEvent::Open);
    assert_eq!(b_rx.recv().await.unwrap(), TransportEvent::Open);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let msg = SignalMessage::Offer { sdp: "v=0".into() };
    a.send(msg.clone()).await.unwrap();

    let got = tokio::time::timeout(WAIT, b_rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, TransportEvent::Message(msg.to_json().unwrap()));
    // отправителю эхо не приходит
    assert!(tokio::time::timeout(Duration::from_millis(200), a_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_close_server_command_closes_sender() {
    let url = start_relay().await;
    let (mut ws, _) = connect_async(&url).await.unwrap();
    ws.send(Message::Text("close_server".into())).await.unwrap();

    let end = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(end.is_ok());
}

#[tokio::test]
async fn test_negotiation_over_websocket_relay() {
    let url = start_relay().await;
    let net = MemoryNetwork::new();

    let (tb, b_events) = RelayTransport::connect(&url).await.unwrap();
    let mut b = side(&net, NegotiatorConfig::default(), tb);
    let b_loop = SignalingLoop::new(b.negotiator.clone(), Role::Answerer, Arc::new(NullSink));
    tokio::spawn(async move { b_loop.run(b_events).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (ta, a_events) = RelayTransport::connect(&url).await.unwrap();
    let a = side(&net, NegotiatorConfig::default(), ta);
    let a_loop = SignalingLoop::new(a.negotiator.clone(), Role::Offerer, Arc::new(NullSink));
    tokio::spawn(async move { a_loop.run(a_events).await });

    let sa = session_of(&a.negotiator).await;
    let sb = session_of(&b.negotiator).await;
    assert!(sa.wait_for_state(ConnectionState::Connected, WAIT).await);
    assert!(sb.wait_for_state(ConnectionState::Connected, WAIT).await);
    assert!(sa.wait_for_channel(ChannelState::Open, WAIT).await);

    sa.send_text("ping").await.unwrap();
    expect_event(&mut b.events, "message", |e| {
        matches!(e, SessionEvent::Message { text, .. } if text == "ping")
    })
    .await;
}
