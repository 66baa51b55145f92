//! Room entry, exit, presence updates and nickname changes, end to end.

mod common;

use common::{expect_presence_error, status_codes, Harness};
use jid::Jid;
use minidom::Element;
use rookery_xmpp::muc::{Affiliation, NS_MUC, Role, RoomType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

const ROOM: &str = "garden@conference.example.org";

/// The defined condition carried by a presence error.
fn error_condition(p: &Presence) -> String {
    p.payloads
        .iter()
        .find(|e| e.name() == "error")
        .and_then(|error| {
            error
                .children()
                .find(|c| c.ns() == "urn:ietf:params:xml:ns:xmpp-stanzas" && c.name() != "text")
                .map(|c| c.name().to_string())
        })
        .expect("error payload with a defined condition")
}

#[test]
fn test_first_join_creates_room_and_grants_ownership() {
    let harness = Harness::new();
    let mut alice = harness.client("alice@example.org/desk");

    assert!(harness.join(&alice, &format!("{ROOM}/alice")).is_none());

    let room = harness.engine.muc.conference().find_room("garden").unwrap();
    let occupant = room.occupant_by_nick("alice").unwrap();
    assert_eq!(occupant.affiliation(), Affiliation::Owner);
    assert_eq!(occupant.role(), Role::Moderator);
    // Auto-created rooms disclose real JIDs.
    assert!(room.is_type(RoomType::NonAnonymous));

    let presences = alice.presences();
    assert_eq!(presences.len(), 1);
    let codes = status_codes(&presences[0]);
    assert!(codes.contains(&110));
    assert!(codes.contains(&201));
    assert!(codes.contains(&100));
    assert_eq!(
        presences[0].from.as_ref().unwrap().to_string(),
        format!("{ROOM}/alice")
    );
}

#[test]
fn test_join_sequence_order_for_second_occupant() {
    let harness = Harness::new();
    let mut alice = harness.client("alice@example.org/desk");
    let mut bob = harness.client("bob@example.org/lap");

    harness.join(&alice, &format!("{ROOM}/alice"));
    alice.drain();
    harness.join(&bob, &format!("{ROOM}/bob"));

    // Bob first learns about alice, then sees himself, self-presence last.
    let to_bob = bob.presences();
    assert_eq!(to_bob.len(), 2);
    assert_eq!(
        to_bob[0].from.as_ref().unwrap().to_string(),
        format!("{ROOM}/alice")
    );
    assert!(status_codes(&to_bob[0]).is_empty());
    assert_eq!(
        to_bob[1].from.as_ref().unwrap().to_string(),
        format!("{ROOM}/bob")
    );
    assert!(status_codes(&to_bob[1]).contains(&110));

    // Alice sees bob arrive, without a self marker, with his real JID
    // because the room is non-anonymous.
    let to_alice = alice.presences();
    assert_eq!(to_alice.len(), 1);
    assert!(status_codes(&to_alice[0]).is_empty());
    let item_jid = to_alice[0]
        .payloads
        .iter()
        .find_map(|x| x.get_child("item", "http://jabber.org/protocol/muc#user"))
        .and_then(|item| item.attr("jid").map(str::to_string));
    assert_eq!(item_jid.as_deref(), Some("bob@example.org/lap"));
}

#[test]
fn test_nickname_conflict_is_rejected() {
    let harness = Harness::new();
    let alice = harness.client("alice@example.org/desk");
    let bob = harness.client("bob@example.org/lap");

    harness.join(&alice, &format!("{ROOM}/shared"));
    let error = expect_presence_error(harness.join(&bob, &format!("{ROOM}/shared")));
    assert_eq!(
        error.from.as_ref().unwrap().to_string(),
        "garden@conference.example.org"
    );
}

#[test]
fn test_rejoin_is_answered_with_full_sequence_again() {
    let harness = Harness::new();
    let mut alice = harness.client("alice@example.org/desk");

    harness.join(&alice, &format!("{ROOM}/alice"));
    alice.drain();
    harness.join(&alice, &format!("{ROOM}/alice"));

    let presences = alice.presences();
    assert_eq!(presences.len(), 1);
    let codes = status_codes(&presences[0]);
    assert!(codes.contains(&110));
    // The room is not new the second time around.
    assert!(!codes.contains(&201));
}

#[test]
fn test_presence_update_is_rebroadcast_to_everyone() {
    let harness = Harness::new();
    let mut alice = harness.client("alice@example.org/desk");
    let mut bob = harness.client("bob@example.org/lap");
    harness.join(&alice, &format!("{ROOM}/alice"));
    harness.join(&bob, &format!("{ROOM}/bob"));
    alice.drain();
    bob.drain();

    // Plain presence to the occupied nick, no protocol extension.
    let mut update = Presence::new(PresenceType::None);
    update.from = Some(Jid::from(alice.jid.clone()));
    update.to = Some(format!("{ROOM}/alice").parse().unwrap());
    update.statuses.insert(String::new(), "away thinking".to_string());
    harness.dispatch(&alice, rookery_xmpp::Stanza::Presence(update));

    let to_bob = bob.presences();
    assert_eq!(to_bob.len(), 1);
    assert_eq!(
        to_bob[0].statuses.get("").map(String::as_str),
        Some("away thinking")
    );
    assert!(status_codes(&to_bob[0]).is_empty());

    let to_alice = alice.presences();
    assert_eq!(to_alice.len(), 1);
    assert!(status_codes(&to_alice[0]).contains(&110));
}

#[test]
fn test_nick_change_runs_in_two_phases() {
    let harness = Harness::new();
    let mut alice = harness.client("alice@example.org/desk");
    let mut bob = harness.client("bob@example.org/lap");
    harness.join(&alice, &format!("{ROOM}/alice"));
    harness.join(&bob, &format!("{ROOM}/bob"));
    alice.drain();
    bob.drain();

    let mut rename = Presence::new(PresenceType::None);
    rename.from = Some(Jid::from(alice.jid.clone()));
    rename.to = Some(format!("{ROOM}/phoenix").parse().unwrap());
    harness.dispatch(&alice, rookery_xmpp::Stanza::Presence(rename));

    let to_bob = bob.presences();
    assert_eq!(to_bob.len(), 2);
    // Phase one: unavailable under the old nick, advertising the new one.
    assert_eq!(to_bob[0].type_, PresenceType::Unavailable);
    assert_eq!(
        to_bob[0].from.as_ref().unwrap().to_string(),
        format!("{ROOM}/alice")
    );
    assert!(status_codes(&to_bob[0]).contains(&303));
    let announced_nick = to_bob[0]
        .payloads
        .iter()
        .find_map(|x| x.get_child("item", "http://jabber.org/protocol/muc#user"))
        .and_then(|item| item.attr("nick").map(str::to_string));
    assert_eq!(announced_nick.as_deref(), Some("phoenix"));
    // Phase two: available under the new nick.
    assert_eq!(to_bob[1].type_, PresenceType::None);
    assert_eq!(
        to_bob[1].from.as_ref().unwrap().to_string(),
        format!("{ROOM}/phoenix")
    );

    let room = harness.engine.muc.conference().find_room("garden").unwrap();
    assert!(room.occupant_by_nick("phoenix").is_some());
    assert!(room.occupant_by_nick("alice").is_none());
}

#[test]
fn test_nick_change_to_taken_nick_is_rejected() {
    let harness = Harness::new();
    let alice = harness.client("alice@example.org/desk");
    let bob = harness.client("bob@example.org/lap");
    harness.join(&alice, &format!("{ROOM}/alice"));
    harness.join(&bob, &format!("{ROOM}/bob"));

    let mut rename = Presence::new(PresenceType::None);
    rename.from = Some(Jid::from(bob.jid.clone()));
    rename.to = Some(format!("{ROOM}/alice").parse().unwrap());
    expect_presence_error(harness.dispatch(&bob, rookery_xmpp::Stanza::Presence(rename)));
}

#[test]
fn test_leave_announces_to_room_and_leaver() {
    let harness = Harness::new();
    let mut alice = harness.client("alice@example.org/desk");
    let mut bob = harness.client("bob@example.org/lap");
    harness.join(&alice, &format!("{ROOM}/alice"));
    harness.join(&bob, &format!("{ROOM}/bob"));
    alice.drain();
    bob.drain();

    harness.leave(&bob, &format!("{ROOM}/bob"));

    let to_bob = bob.presences();
    assert_eq!(to_bob.len(), 1);
    assert_eq!(to_bob[0].type_, PresenceType::Unavailable);
    assert!(status_codes(&to_bob[0]).contains(&110));

    let to_alice = alice.presences();
    assert_eq!(to_alice.len(), 1);
    assert_eq!(to_alice[0].type_, PresenceType::Unavailable);
    assert!(!status_codes(&to_alice[0]).contains(&110));

    let room = harness.engine.muc.conference().find_room("garden").unwrap();
    assert_eq!(room.occupant_count(), 1);
}

#[test]
fn test_temporary_room_is_destroyed_when_emptied() {
    let harness = Harness::new();
    let alice = harness.client("alice@example.org/desk");
    harness.join(&alice, &format!("{ROOM}/alice"));
    assert!(harness.engine.muc.conference().find_room("garden").is_some());

    harness.leave(&alice, &format!("{ROOM}/alice"));
    assert!(harness.engine.muc.conference().find_room("garden").is_none());
}

#[test]
fn test_persistent_room_survives_being_emptied() {
    let harness = Harness::new();
    let alice = harness.client("alice@example.org/desk");
    harness.join(&alice, &format!("{ROOM}/alice"));

    let room = harness.engine.muc.conference().find_room("garden").unwrap();
    room.update_settings(|s| s.set(RoomType::Persistent));

    harness.leave(&alice, &format!("{ROOM}/alice"));
    assert!(harness.engine.muc.conference().find_room("garden").is_some());
}

#[test]
fn test_ghost_presence_is_terminated() {
    let harness = Harness::new();
    let alice = harness.client("alice@example.org/desk");
    let carol = harness.client("carol@example.org/web");
    harness.join(&alice, &format!("{ROOM}/alice"));

    // Presence without the muc <x/> from someone who is not an occupant:
    // a client that thinks it is still joined.
    let mut ghost = Presence::new(PresenceType::None);
    ghost.from = Some(Jid::from(carol.jid.clone()));
    ghost.to = Some(format!("{ROOM}/carol").parse().unwrap());
    let answer = harness.dispatch(&carol, rookery_xmpp::Stanza::Presence(ghost));

    match answer {
        Some(rookery_xmpp::Stanza::Presence(p)) => {
            assert_eq!(p.type_, PresenceType::Unavailable);
            let codes = status_codes(&p);
            assert!(codes.contains(&110));
            assert!(codes.contains(&307));
            assert!(codes.contains(&332));
        }
        other => panic!("expected terminal presence, got {other:?}"),
    }
}

#[test]
fn test_password_protected_room_checks_password() {
    let harness = Harness::new();
    let alice = harness.client("alice@example.org/desk");
    let mut bob = harness.client("bob@example.org/lap");
    harness.join(&alice, &format!("{ROOM}/alice"));

    let room = harness.engine.muc.conference().find_room("garden").unwrap();
    room.update_settings(|s| s.set(RoomType::PasswordProtected));
    room.set_password(Some("sesame".to_string()));

    expect_presence_error(harness.join(&bob, &format!("{ROOM}/bob")));

    let x = Element::builder("x", NS_MUC)
        .append(Element::builder("password", NS_MUC).append("sesame").build())
        .build();
    assert!(harness
        .join_with_x(&bob, &format!("{ROOM}/bob"), x)
        .is_none());
    assert!(status_codes(bob.presences().last().unwrap()).contains(&110));
}

#[test]
fn test_presence_without_nickname_is_malformed() {
    let harness = Harness::new();
    let alice = harness.client("alice@example.org/desk");

    let mut p = Presence::new(PresenceType::None);
    p.from = Some(Jid::from(alice.jid.clone()));
    p.to = Some(ROOM.parse().unwrap());
    p.payloads.push(Element::builder("x", NS_MUC).build());
    expect_presence_error(harness.dispatch(&alice, rookery_xmpp::Stanza::Presence(p)));
}

#[test]
fn test_unbound_session_cleans_up_occupancy() {
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

        harness.engine.registry.unbind(&bob.jid);

        let room = harness.engine.muc.conference().find_room("garden").unwrap();
        for _ in 0..50 {
            if room.occupant_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(room.occupant_count(), 1);

        // Alice saw the departure with the service-removal marker.
        let departures = alice.presences();
        assert_eq!(departures.len(), 1);
        assert_eq!(departures[0].type_, PresenceType::Unavailable);
        assert!(status_codes(&departures[0]).contains(&332));
    });
}

#[test]
fn test_taken_nick_with_wrong_password_reports_conflict() {
    let harness = Harness::new();
    let alice = harness.client("alice@example.org/desk");
    let bob = harness.client("bob@example.org/lap");
    harness.join(&alice, &format!("{ROOM}/alice"));

    let room = harness.engine.muc.conference().find_room("garden").unwrap();
    room.update_settings(|s| s.set(RoomType::PasswordProtected));
    room.set_password(Some("sesame".to_string()));

    // Both checks would refuse; the nickname verdict is the one reported.
    let error = expect_presence_error(harness.join(&bob, &format!("{ROOM}/alice")));
    assert_eq!(error_condition(&error), "conflict");
}

#[test]
fn test_ghost_presence_to_unknown_room_creates_nothing() {
    let harness = Harness::new();
    let carol = harness.client("carol@example.org/web");

    let mut ghost = Presence::new(PresenceType::None);
    ghost.from = Some(Jid::from(carol.jid.clone()));
    ghost.to = Some(format!("{ROOM}/carol").parse().unwrap());
    let answer = harness.dispatch(&carol, rookery_xmpp::Stanza::Presence(ghost));

    match answer {
        Some(rookery_xmpp::Stanza::Presence(p)) => {
            assert_eq!(p.type_, PresenceType::Unavailable);
            assert!(status_codes(&p).contains(&332));
        }
        other => panic!("expected terminal presence, got {other:?}"),
    }
    assert!(harness.engine.muc.conference().find_room("garden").is_none());

    // The next real joiner still founds the room and takes ownership.
    let alice = harness.client("alice@example.org/desk");
    harness.join(&alice, &format!("{ROOM}/alice"));
    let room = harness.engine.muc.conference().find_room("garden").unwrap();
    assert_eq!(
        room.occupant_by_nick("alice").unwrap().affiliation(),
        Affiliation::Owner
    );
}

#[test]
fn test_departure_status_text_skips_the_leaver() {
    let harness = Harness::new();
    let mut alice = harness.client("alice@example.org/desk");
    let mut bob = harness.client("bob@example.org/lap");
    harness.join(&alice, &format!("{ROOM}/alice"));
    harness.join(&bob, &format!("{ROOM}/bob"));
    alice.drain();
    bob.drain();

    let mut leave = Presence::new(PresenceType::Unavailable);
    leave.from = Some(Jid::from(bob.jid.clone()));
    leave.to = Some(format!("{ROOM}/bob").parse().unwrap());
    leave.statuses.insert(String::new(), "gone fishing".to_string());
    harness.dispatch(&bob, rookery_xmpp::Stanza::Presence(leave));

    let to_alice = alice.presences();
    assert_eq!(to_alice.len(), 1);
    assert_eq!(
        to_alice[0].statuses.get("").map(String::as_str),
        Some("gone fishing")
    );

    let to_bob = bob.presences();
    assert_eq!(to_bob.len(), 1);
    assert!(status_codes(&to_bob[0]).contains(&110));
    assert!(to_bob[0].statuses.is_empty());
}
