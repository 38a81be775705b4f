//! End-to-end exercise of the signaling path over a real websocket.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use vantage_signaling::{ServerEvent, SignalingClient, SignalingEvent, SignalingServer};

async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended unexpectedly")
}

#[tokio::test]
async fn offer_answer_candidate_flow() {
    let (server, mut server_events) = SignalingServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let uri = format!("ws://{}", server.local_addr());

    let (client, mut client_events) = SignalingClient::connect(&uri).await.unwrap();

    let connected = next(&mut server_events).await;
    let id = match connected {
        SignalingEvent::ClientConnected(id) => id,
        other => panic!("expected connect, got {other:?}"),
    };

    server.send_sdp_offer(id, "offer-sdp".to_string()).unwrap();
    assert_eq!(
        next(&mut client_events).await,
        ServerEvent::SdpOffer {
            sdp: "offer-sdp".to_string()
        }
    );

    client.send_answer("answer-sdp".to_string()).unwrap();
    assert_eq!(
        next(&mut server_events).await,
        SignalingEvent::SdpAnswer {
            client: id,
            sdp: "answer-sdp".to_string()
        }
    );

    server
        .send_candidate(id, 0, "candidate:server".to_string())
        .unwrap();
    assert_eq!(
        next(&mut client_events).await,
        ServerEvent::IceCandidate {
            mline_index: 0,
            candidate: "candidate:server".to_string()
        }
    );

    client.send_candidate(0, "candidate:client".to_string()).unwrap();
    assert_eq!(
        next(&mut server_events).await,
        SignalingEvent::IceCandidate {
            client: id,
            mline_index: 0,
            candidate: "candidate:client".to_string()
        }
    );

    client.close();
    assert_eq!(
        next(&mut server_events).await,
        SignalingEvent::ClientDisconnected(id)
    );

    // The peer is gone; outbound sends now fail without affecting others.
    assert!(server.send_sdp_offer(id, "late".to_string()).is_err());
}

#[tokio::test]
async fn connected_precedes_all_other_events() {
    let (server, mut server_events) = SignalingServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let uri = format!("ws://{}", server.local_addr());

    let (client, _client_events) = SignalingClient::connect(&uri).await.unwrap();
    client.send_answer("early-answer".to_string()).unwrap();

    let first = next(&mut server_events).await;
    assert!(matches!(first, SignalingEvent::ClientConnected(_)));
    let second = next(&mut server_events).await;
    assert!(matches!(second, SignalingEvent::SdpAnswer { .. }));
}
