//! Scenario 6: a shadow bound to a primary with both directions enabled
//! receives a copy of its primary's inbound and outbound traffic.

mod common;

use common::TestBroker;
use relay_protocol::{Envelope, FrameType, SendKind, SendPayload, ShadowBindPayload};

fn send_to(to: &str, body: &str) -> Envelope {
    let mut env = Envelope::new(
        FrameType::Send,
        serde_json::to_value(SendPayload {
            kind: SendKind::Message,
            body: body.to_owned(),
            data: None,
            thread: None,
        })
        .unwrap(),
    );
    env.to = Some(to.to_owned());
    env
}

#[tokio::test]
async fn shadow_receives_copies_of_both_directions() {
    let broker = TestBroker::start().await;
    let mut alice = broker.connect().await;
    let mut bob = broker.connect().await;
    let mut carol = broker.connect().await;
    let mut shadow = broker.connect().await;

    alice.hello("alice").await;
    bob.hello("bob").await;
    carol.hello("carol").await;
    shadow.hello("alice-shadow").await;

    let bind = Envelope::new(
        FrameType::ShadowBind,
        serde_json::to_value(ShadowBindPayload {
            primary_agent: "alice".to_owned(),
            speak_on: None,
            receive_incoming: Some(true),
            receive_outgoing: Some(true),
        })
        .unwrap(),
    );
    shadow.send(bind).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // bob -> alice: both alice and the shadow see it.
    bob.send(send_to("alice", "for alice")).await;

    let alice_deliver = alice.recv().await;
    assert_eq!(alice_deliver.delivery.as_ref().unwrap().seq, 1);
    assert_eq!(alice_deliver.topic.as_deref(), None);

    let shadow_deliver_1 = shadow.recv().await;
    assert_ne!(shadow_deliver_1.id, alice_deliver.id);
    let shadow_delivery_1 = shadow_deliver_1.delivery.as_ref().unwrap();
    assert_eq!(shadow_delivery_1.seq, 1);
    assert_eq!(shadow_deliver_1.topic.as_deref(), Some("shadow-in:default"));

    // alice -> carol: the shadow sees a copy, carol sees the real thing.
    alice.send(send_to("carol", "for carol")).await;

    let carol_deliver = carol.recv().await;
    assert_eq!(carol_deliver.delivery.as_ref().unwrap().peer, "alice");

    // The shadow's copy of alice's outgoing traffic carries alice as the
    // peer (it is a mirror of what alice sent, not a message from carol)
    // and lands on a stream keyed by the send's own topic, not by the
    // recipient's name.
    let shadow_deliver_2 = shadow.recv().await;
    let shadow_delivery_2 = shadow_deliver_2.delivery.as_ref().unwrap();
    assert_eq!(shadow_delivery_2.peer, "alice");
    assert_eq!(shadow_delivery_2.seq, 1, "shadow-out:default is a distinct stream from shadow-in:default");
    assert_eq!(shadow_deliver_2.topic.as_deref(), Some("shadow-out:default"));
}
