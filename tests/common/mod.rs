#![allow(dead_code)]

//! In-process test harness: an assembled [`Engine`] with channel-backed
//! clients, so whole protocol exchanges run without any transport.

use jid::{FullJid, Jid};
use minidom::Element;
use tokio::sync::mpsc::UnboundedReceiver;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::{Body, Message, MessageType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use rookery_xmpp::config::ServerConfig;
use rookery_xmpp::dispatch::Session;
use rookery_xmpp::muc::NS_MUC;
use rookery_xmpp::{Engine, Stanza};

pub struct TestClient {
    pub jid: FullJid,
    pub session: Session,
    pub rx: UnboundedReceiver<Stanza>,
}

impl TestClient {
    /// Everything delivered to this client so far.
    pub fn drain(&mut self) -> Vec<Stanza> {
        let mut stanzas = Vec::new();
        while let Ok(stanza) = self.rx.try_recv() {
            stanzas.push(stanza);
        }
        stanzas
    }

    pub fn presences(&mut self) -> Vec<Presence> {
        self.drain()
            .into_iter()
            .filter_map(|s| match s {
                Stanza::Presence(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&mut self) -> Vec<Message> {
        self.drain()
            .into_iter()
            .filter_map(|s| match s {
                Stanza::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }
}

pub struct Harness {
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        // RUST_LOG=rookery_xmpp=debug surfaces the dispatch trail on failure.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self {
            engine: Engine::new(ServerConfig::new("example.org")),
        }
    }

    /// Bind a resource and open a session for it.
    pub fn client(&self, jid: &str) -> TestClient {
        let jid: FullJid = jid.parse().expect("valid full jid");
        let rx = self.engine.registry.bind(jid.clone());
        TestClient {
            session: Session::new(jid.clone()),
            jid,
            rx,
        }
    }

    pub fn dispatch(&self, client: &TestClient, stanza: Stanza) -> Option<Stanza> {
        self.engine.dispatcher.dispatch(stanza, Some(&client.session))
    }

    /// Send a join presence for `room_nick` (e.g. `garden@…/alice`).
    pub fn join(&self, client: &TestClient, room_nick: &str) -> Option<Stanza> {
        self.join_with_x(
            client,
            room_nick,
            Element::builder("x", NS_MUC).build(),
        )
    }

    pub fn join_with_x(&self, client: &TestClient, room_nick: &str, x: Element) -> Option<Stanza> {
        let mut p = Presence::new(PresenceType::None);
        p.from = Some(Jid::from(client.jid.clone()));
        p.to = Some(room_nick.parse().expect("valid room jid"));
        p.payloads.push(x);
        self.dispatch(client, Stanza::Presence(p))
    }

    pub fn leave(&self, client: &TestClient, room_nick: &str) -> Option<Stanza> {
        let mut p = Presence::new(PresenceType::Unavailable);
        p.from = Some(Jid::from(client.jid.clone()));
        p.to = Some(room_nick.parse().expect("valid room jid"));
        self.dispatch(client, Stanza::Presence(p))
    }

    /// Send a groupchat message with the given body to a room address.
    pub fn groupchat(&self, client: &TestClient, room: &str, body: &str) -> Option<Stanza> {
        let mut m = Message::new(Some(room.parse().expect("valid room jid")));
        m.from = Some(Jid::from(client.jid.clone()));
        m.type_ = MessageType::Groupchat;
        m.bodies.insert(String::new(), Body(body.to_string()));
        self.dispatch(client, Stanza::Message(m))
    }

    /// Send an IQ set with the given payload.
    pub fn iq_set(&self, client: &TestClient, to: &str, id: &str, payload: Element) -> Option<Stanza> {
        let iq = Iq {
            from: Some(Jid::from(client.jid.clone())),
            to: Some(to.parse().expect("valid jid")),
            id: id.to_string(),
            payload: IqType::Set(payload),
        };
        self.dispatch(client, Stanza::Iq(iq))
    }

    pub fn iq_get(&self, client: &TestClient, to: &str, id: &str, payload: Element) -> Option<Stanza> {
        let iq = Iq {
            from: Some(Jid::from(client.jid.clone())),
            to: Some(to.parse().expect("valid jid")),
            id: id.to_string(),
            payload: IqType::Get(payload),
        };
        self.dispatch(client, Stanza::Iq(iq))
    }
}

/// Status codes on a presence, via the muc#user extension.
pub fn status_codes(p: &Presence) -> Vec<u16> {
    rookery_xmpp::muc::stanzas::status_codes(p)
}

/// Unwrap a returned stanza as a presence of type error.
pub fn expect_presence_error(response: Option<Stanza>) -> Presence {
    match response {
        Some(Stanza::Presence(p)) if p.type_ == PresenceType::Error => p,
        other => panic!("expected presence error, got {other:?}"),
    }
}

/// Unwrap a returned stanza as an IQ error.
pub fn expect_iq_error(response: Option<Stanza>) -> Iq {
    match response {
        Some(Stanza::Iq(iq)) if matches!(iq.payload, IqType::Error(_)) => iq,
        other => panic!("expected iq error, got {other:?}"),
    }
}

/// Unwrap a returned stanza as an IQ result.
pub fn expect_iq_result(response: Option<Stanza>) -> Iq {
    match response {
        Some(Stanza::Iq(iq)) if matches!(iq.payload, IqType::Result(_)) => iq,
        other => panic!("expected iq result, got {other:?}"),
    }
}
