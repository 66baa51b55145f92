//! Domain resolution, direct delivery, IQ correlation and eviction of
//! unreachable occupants, end to end.

mod common;

use common::Harness;
use jid::Jid;
use minidom::Element;
use rookery_xmpp::Stanza;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::{Body, Message, MessageType};
use xmpp_parsers::stanza_error::DefinedCondition;

const ROOM: &str = "garden@conference.example.org";

#[test]
fn test_stanza_between_local_users_is_delivered_directly() {
    let harness = Harness::new();
    let alice = harness.client("alice@example.org/desk");
    let mut bob = harness.client("bob@example.org/lap");

    let mut m = Message::new(Some("bob@example.org/lap".parse().unwrap()));
    m.from = Some(Jid::from(alice.jid.clone()));
    m.type_ = MessageType::Chat;
    m.bodies.insert(String::new(), Body("hi bob".to_string()));

    assert!(harness.dispatch(&alice, Stanza::Message(m)).is_none());
    let received = bob.messages();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].bodies.get("").unwrap().0, "hi bob");
}

#[test]
fn test_message_to_bare_jid_reaches_all_resources() {
    let harness = Harness::new();
    let alice = harness.client("alice@example.org/desk");
    let mut bob_desk = harness.client("bob@example.org/desk");
    let mut bob_phone = harness.client("bob@example.org/phone");

    let mut m = Message::new(Some("bob@example.org".parse().unwrap()));
    m.from = Some(Jid::from(alice.jid.clone()));
    m.type_ = MessageType::Chat;
    m.bodies.insert(String::new(), Body("anyone there".to_string()));
    harness.dispatch(&alice, Stanza::Message(m));

    assert_eq!(bob_desk.messages().len(), 1);
    assert_eq!(bob_phone.messages().len(), 1);
}

#[test]
fn test_iq_to_unserved_domain_is_answered_with_remote_server_not_found() {
    let harness = Harness::new();
    let mut alice = harness.client("alice@example.org/desk");

    let iq = Iq {
        from: Some(Jid::from(alice.jid.clone())),
        to: Some("user@elsewhere.example.net".parse().unwrap()),
        id: "out1".to_string(),
        payload: IqType::Get(Element::builder("query", "jabber:iq:version").build()),
    };
    assert!(harness.dispatch(&alice, Stanza::Iq(iq)).is_none());

    // The stub answers through the default relay, back to the sender.
    let answers = alice.drain();
    assert_eq!(answers.len(), 1);
    match &answers[0] {
        Stanza::Iq(answer) => {
            assert_eq!(answer.id, "out1");
            match &answer.payload {
                IqType::Error(error) => assert_eq!(
                    error.defined_condition,
                    DefinedCondition::RemoteServerNotFound
                ),
                other => panic!("expected error payload, got {other:?}"),
            }
        }
        other => panic!("expected iq answer, got {other:?}"),
    }
}

#[test]
fn test_occupant_iq_is_relayed_and_correlated_back() {
    let harness = Harness::new();
    let mut alice = harness.client("alice@example.org/desk");
    let mut bob = harness.client("bob@example.org/lap");
    harness.join(&alice, &format!("{ROOM}/alice"));
    harness.join(&bob, &format!("{ROOM}/bob"));
    alice.drain();
    bob.drain();

    // Alice asks bob's client for its version, via his room address.
    let response = harness.iq_get(
        &alice,
        &format!("{ROOM}/bob"),
        "ver1",
        Element::builder("query", "jabber:iq:version").build(),
    );
    assert!(response.is_none());
    assert!(!harness.engine.pending.is_empty());

    // Bob receives the request readdressed to come from alice's room nick.
    let forwarded = bob.drain();
    assert_eq!(forwarded.len(), 1);
    let forwarded = match &forwarded[0] {
        Stanza::Iq(iq) => iq.clone(),
        other => panic!("expected forwarded iq, got {other:?}"),
    };
    assert_eq!(
        forwarded.from.as_ref().unwrap().to_string(),
        format!("{ROOM}/alice")
    );
    assert_eq!(forwarded.id, "ver1");

    // Bob answers; the result is matched against the pending table and
    // flows back to alice under bob's room address.
    let answer = Iq {
        from: Some(Jid::from(bob.jid.clone())),
        to: forwarded.from.clone(),
        id: forwarded.id.clone(),
        payload: IqType::Result(Some(
            Element::builder("query", "jabber:iq:version").build(),
        )),
    };
    assert!(harness.dispatch(&bob, Stanza::Iq(answer)).is_none());
    assert!(harness.engine.pending.is_empty());

    let answers = alice.drain();
    assert_eq!(answers.len(), 1);
    match &answers[0] {
        Stanza::Iq(iq) => {
            assert_eq!(iq.id, "ver1");
            assert_eq!(iq.from.as_ref().unwrap().to_string(), format!("{ROOM}/bob"));
            assert_eq!(
                iq.to.as_ref().unwrap().to_string(),
                "alice@example.org/desk"
            );
        }
        other => panic!("expected correlated answer, got {other:?}"),
    }
}

#[test]
fn test_uncorrelated_iq_result_is_relayed_to_destination() {
    let harness = Harness::new();
    let alice = harness.client("alice@example.org/desk");
    let mut bob = harness.client("bob@example.org/lap");

    let result = Iq {
        from: Some(Jid::from(alice.jid.clone())),
        to: Some("bob@example.org/lap".parse().unwrap()),
        id: "nobody-waits".to_string(),
        payload: IqType::Result(None),
    };
    harness.dispatch(&alice, Stanza::Iq(result));

    assert_eq!(bob.drain().len(), 1);
}

#[test]
fn test_unreachable_occupant_is_evicted_from_room() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    runtime.block_on(async {
        let harness = Harness::new();
        let mut alice = harness.client("alice@example.org/desk");
        let bob = harness.client("bob@example.org/lap");
        harness.join(&alice, &format!("{ROOM}/alice"));
        harness.join(&bob, &format!("{ROOM}/bob"));
        alice.drain();

        // Bob's delivery channel dies without an unbind.
        drop(bob.rx);

        harness.groupchat(&alice, ROOM, "anyone home?");

        let room = harness.engine.muc.conference().find_room("garden").unwrap();
        for _ in 0..50 {
            if room.occupant_by_nick("bob").is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(room.occupant_by_nick("bob").is_none());
        assert_eq!(room.occupant_count(), 1);
    });
}

#[test]
fn test_groupchat_fanout_and_history_replay() {
    let harness = Harness::new();
    let mut alice = harness.client("alice@example.org/desk");
    let mut bob = harness.client("bob@example.org/lap");
    harness.join(&alice, &format!("{ROOM}/alice"));
    alice.drain();

    assert!(harness.groupchat(&alice, ROOM, "first!").is_none());
    let echoed = alice.messages();
    assert_eq!(echoed.len(), 1);
    assert_eq!(
        echoed[0].from.as_ref().unwrap().to_string(),
        format!("{ROOM}/alice")
    );

    // A later joiner gets the buffered history back, stamped.
    harness.join(&bob, &format!("{ROOM}/bob"));
    let replayed: Vec<_> = bob
        .messages()
        .into_iter()
        .filter(|m| !m.bodies.is_empty())
        .collect();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].bodies.get("").unwrap().0, "first!");
    assert!(replayed[0]
        .payloads
        .iter()
        .any(|p| p.is("delay", "urn:xmpp:delay")));
}

#[test]
fn test_subject_change_is_broadcast_and_replayed_on_join() {
    let harness = Harness::new();
    let mut alice = harness.client("alice@example.org/desk");
    let mut bob = harness.client("bob@example.org/lap");
    harness.join(&alice, &format!("{ROOM}/alice"));
    alice.drain();

    let mut m = Message::new(Some(ROOM.parse().unwrap()));
    m.from = Some(Jid::from(alice.jid.clone()));
    m.type_ = MessageType::Groupchat;
    m.subjects.insert(
        String::new(),
        xmpp_parsers::message::Subject("gardening tips".to_string()),
    );
    assert!(harness.dispatch(&alice, Stanza::Message(m)).is_none());

    let announced = alice.messages();
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0].subjects.get("").unwrap().0, "gardening tips");

    harness.join(&bob, &format!("{ROOM}/bob"));
    let subjects: Vec<_> = bob
        .messages()
        .into_iter()
        .filter(|m| !m.subjects.is_empty())
        .collect();
    assert_eq!(subjects.len(), 1);
    assert_eq!(subjects[0].subjects.get("").unwrap().0, "gardening tips");
}

#[test]
fn test_private_message_between_occupants() {
    let harness = Harness::new();
    let alice = harness.client("alice@example.org/desk");
    let mut bob = harness.client("bob@example.org/lap");
    harness.join(&alice, &format!("{ROOM}/alice"));
    harness.join(&bob, &format!("{ROOM}/bob"));
    bob.drain();

    let mut m = Message::new(Some(format!("{ROOM}/bob").parse().unwrap()));
    m.from = Some(Jid::from(alice.jid.clone()));
    m.type_ = MessageType::Chat;
    m.bodies.insert(String::new(), Body("psst".to_string()));
    assert!(harness.dispatch(&alice, Stanza::Message(m)).is_none());

    let received = bob.messages();
    assert_eq!(received.len(), 1);
    // The sender is hidden behind their room address.
    assert_eq!(
        received[0].from.as_ref().unwrap().to_string(),
        format!("{ROOM}/alice")
    );
    assert_eq!(received[0].bodies.get("").unwrap().0, "psst");
}
