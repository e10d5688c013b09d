mod common;

use common::expect_event;
use ssc_link::transport::manual::{parse_candidates, parse_description};
use ssc_link::transport::Outgoing;
use ssc_link::{
    ChannelState, ConnectionState, ManualTransport, Negotiator, NegotiatorConfig, SdpType,
    SessionEvent, WebRtcConnector,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(20);

fn split(t: &ManualTransport) -> (String, String) {
    let mut desc = String::new();
    let mut cands = String::from("[]");
    for item in t.take_outgoing() {
        match item {
            Outgoing::Description(d) => desc = d,
            Outgoing::Candidates(c) => cands = c,
        }
    }
    (desc, cands)
}

/// Two real peer connections on this host, host candidates only
#[tokio::test]
#[ignore = "needs a usable network interface"]
async fn test_webrtc_pair_over_manual_transport() {
    let config = NegotiatorConfig::default();
    let ta = Arc::new(ManualTransport::compact());
    let tb = Arc::new(ManualTransport::compact());
    let (a_tx, _a_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (b_tx, mut b_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let a = Negotiator::new(
        config.clone(),
        Arc::new(WebRtcConnector::new(Vec::new())),
        ta.clone(),
        Arc::new(a_tx),
    );
    let b = Negotiator::new(
        config,
        Arc::new(WebRtcConnector::new(Vec::new())),
        tb.clone(),
        Arc::new(b_tx),
    );

    let sa = a.create_as_offerer().await.unwrap();
    assert!(sa.wait_gathering_complete(WAIT).await);
    let (offer, oc) = split(&ta);

    let sb = b
        .create_as_answerer(parse_description(&offer, SdpType::Offer).unwrap())
        .await
        .unwrap();
    b.apply_candidate_batch(parse_candidates(&oc).unwrap())
        .await
        .unwrap();
    assert!(sb.wait_gathering_complete(WAIT).await);
    let (answer, ac) = split(&tb);

    a.apply_remote_answer(parse_description(&answer, SdpType::Answer).unwrap())
        .await
        .unwrap();
    a.apply_candidate_batch(parse_candidates(&ac).unwrap())
        .await
        .unwrap();

    assert!(sa.wait_for_state(ConnectionState::Connected, WAIT).await);
    assert!(sa.wait_for_channel(ChannelState::Open, WAIT).await);
    assert!(sb.wait_for_channel(ChannelState::Open, WAIT).await);

    sa.send_text("ping").await.unwrap();
    expect_event(&mut b_rx, "message", |e| {
        matches!(e, SessionEvent::Message { text, .. } if text == "ping")
    })
    .await;

    a.close().await;
    b.close().await;
}
