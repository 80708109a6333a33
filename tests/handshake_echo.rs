//! Scenario 1: handshake, self-send, ack.

mod common;

use common::TestBroker;
use relay_protocol::{AckPayload, Envelope, FrameType, SendKind, SendPayload};

#[tokio::test]
async fn handshake_then_self_send_is_delivered_and_acked() {
    let broker = TestBroker::start().await;
    let mut alice = broker.connect().await;

    let welcome = alice.hello("alice").await;
    assert!(!welcome.session_id.is_empty());

    let mut send = Envelope::new(
        FrameType::Send,
        serde_json::to_value(SendPayload {
            kind: SendKind::Message,
            body: "self".to_owned(),
            data: None,
            thread: None,
        })
        .unwrap(),
    );
    send.to = Some("alice".to_owned());
    alice.send(send).await;

    let deliver = alice.recv().await;
    assert_eq!(deliver.kind, FrameType::Deliver);
    let delivery = deliver.delivery.expect("DELIVER carries delivery info");
    assert_eq!(delivery.seq, 1);
    assert_eq!(delivery.peer, "alice");
    let payload = deliver.payload_as::<SendPayload>().unwrap();
    assert_eq!(payload.body, "self");

    let ack = Envelope::new(
        FrameType::Ack,
        serde_json::to_value(AckPayload {
            ack_id: deliver.id,
            seq: delivery.seq,
        })
        .unwrap(),
    );
    alice.send(ack).await;

    // No reply expected for an ACK; give the router a moment to process it
    // and confirm the connection is still alive by sending one more frame.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let mut send2 = Envelope::new(
        FrameType::Send,
        serde_json::to_value(SendPayload {
            kind: SendKind::Message,
            body: "second".to_owned(),
            data: None,
            thread: None,
        })
        .unwrap(),
    );
    send2.to = Some("alice".to_owned());
    alice.send(send2).await;
    let deliver2 = alice.recv().await;
    assert_eq!(deliver2.delivery.unwrap().seq, 2, "per-stream seq keeps increasing after ack");
}
