//! Wire-format builders for occupant presence, status codes and room
//! messages.
//!
//! Everything the room broadcasts is built per receiver, because the
//! `<x xmlns='…#user'/>` extension differs between receivers: the
//! occupant's real JID is only disclosed where the room's anonymity
//! flag permits, and status code 110 only marks the receiver's own
//! presence.

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use uuid::Uuid;
use xmpp_parsers::message::{Message, MessageType, Subject};
use xmpp_parsers::presence::{self, Presence};

use super::room::{Affiliation, Occupant, Role, Room};
use super::settings::{RoomSettings, RoomType};
use super::{NS_MUC, NS_MUC_USER};
use crate::error::{presence_error, StanzaErrorCondition};

/// XEP-0045 status codes carried in `<status code='…'/>` children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Any occupant may see the occupant's full JID.
    RoomNonAnonymous,
    /// This presence describes the receiver themself.
    SelfPresence,
    /// A new room has been created.
    RoomCreated,
    /// The service modified the requested nickname.
    NickModified,
    /// The occupant was banned.
    Banned,
    /// The occupant's nickname changed; `nick` attribute carries the new one.
    NewNick,
    /// The occupant was kicked.
    Kicked,
    /// Removal because of an affiliation change.
    RemovedByAffiliation,
    /// Removal because the room became members-only.
    RemovedByMembersOnly,
    /// Removal because the service, not the occupant, ended the presence.
    RemovedByService,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::RoomNonAnonymous => 100,
            StatusCode::SelfPresence => 110,
            StatusCode::RoomCreated => 201,
            StatusCode::NickModified => 210,
            StatusCode::Banned => 301,
            StatusCode::NewNick => 303,
            StatusCode::Kicked => 307,
            StatusCode::RemovedByAffiliation => 321,
            StatusCode::RemovedByMembersOnly => 322,
            StatusCode::RemovedByService => 332,
        }
    }
}

/// Whether a receiver with the given role may see real JIDs in this room.
pub fn discloses_jid_to(settings: &RoomSettings, receiver_role: Role) -> bool {
    if settings.contains(RoomType::NonAnonymous) {
        true
    } else if settings.contains(RoomType::SemiAnonymous) {
        receiver_role == Role::Moderator
    } else {
        false
    }
}

/// The `<item/>` child of a muc#user extension.
#[derive(Debug, Clone)]
pub struct OccupantItem {
    pub affiliation: Affiliation,
    pub role: Role,
    pub jid: Option<Jid>,
    pub nick: Option<String>,
    pub reason: Option<String>,
}

impl OccupantItem {
    /// Describe `subject` for delivery to `receiver`, applying the room's
    /// JID disclosure rule.
    pub fn describing(room: &Room, subject: &Occupant, receiver: &Occupant) -> Self {
        let disclose = subject.jid() == receiver.jid()
            || discloses_jid_to(&room.settings(), receiver.role());
        Self {
            affiliation: subject.affiliation(),
            role: subject.role(),
            jid: disclose.then(|| Jid::from(subject.jid().clone())),
            nick: None,
            reason: None,
        }
    }

    pub fn into_element(self) -> Element {
        let mut builder = Element::builder("item", NS_MUC_USER)
            .attr("affiliation", self.affiliation.as_str())
            .attr("role", self.role.as_str());
        if let Some(jid) = self.jid {
            builder = builder.attr("jid", jid.to_string());
        }
        if let Some(nick) = self.nick {
            builder = builder.attr("nick", nick);
        }
        if let Some(reason) = self.reason {
            builder = builder.append(
                Element::builder("reason", NS_MUC_USER)
                    .append(reason)
                    .build(),
            );
        }
        builder.build()
    }
}

/// Build the `<x xmlns='…#user'/>` extension with an item and status codes.
pub fn x_user(item: OccupantItem, statuses: &[StatusCode]) -> Element {
    let mut builder = Element::builder("x", NS_MUC_USER).append(item.into_element());
    for status in statuses {
        builder = builder.append(
            Element::builder("status", NS_MUC_USER)
                .attr("code", status.code().to_string())
                .build(),
        );
    }
    builder.build()
}

/// Full JID of an occupant as seen inside the room.
pub fn room_nick_jid(room: &BareJid, nick: &str) -> FullJid {
    room.with_resource_str(nick).unwrap_or_else(|_| {
        room.with_resource_str("unknown")
            .expect("literal 'unknown' is always a valid resource")
    })
}

fn generated_id() -> String {
    Uuid::new_v4().to_string()
}

/// Presence from `room/nick` to one receiver.
pub fn occupant_presence(
    room: &BareJid,
    nick: &str,
    to: &Jid,
    type_: presence::Type,
    x: Element,
    extras: Vec<Element>,
) -> Presence {
    let mut p = Presence::new(type_);
    p.id = Some(generated_id());
    p.from = Some(Jid::from(room_nick_jid(room, nick)));
    p.to = Some(to.clone());
    p.payloads = extras;
    p.payloads.push(x);
    p
}

/// Presence of type error answering a failed chat request; carries the
/// empty protocol `<x/>` the request arrived with.
pub fn error_presence(
    room: &BareJid,
    to: &Jid,
    id: Option<String>,
    condition: StanzaErrorCondition,
) -> Presence {
    let mut p = presence_error(room, to, id, condition);
    p.payloads.insert(0, Element::builder("x", NS_MUC).build());
    p
}

/// Groupchat message from the bare room JID announcing the subject.
pub fn subject_message(room: &BareJid, to: &FullJid, subject: &str) -> Message {
    let mut message = Message::new(Some(Jid::from(to.clone())));
    message.id = Some(generated_id());
    message.from = Some(Jid::from(room.clone()));
    message.type_ = MessageType::Groupchat;
    message
        .subjects
        .insert(String::new(), Subject(subject.to_string()));
    message
}

/// Groupchat message from the bare room JID carrying a membership update
/// for a user who is not currently an occupant.
pub fn affiliation_message(room: &BareJid, to: &FullJid, item: OccupantItem) -> Message {
    let mut message = Message::new(Some(Jid::from(to.clone())));
    message.id = Some(generated_id());
    message.from = Some(Jid::from(room.clone()));
    message.type_ = MessageType::Groupchat;
    message.payloads.push(
        Element::builder("x", NS_MUC_USER)
            .append(item.into_element())
            .build(),
    );
    message
}

/// Status codes present on a presence, in document order.
pub fn status_codes(presence: &Presence) -> Vec<u16> {
    presence
        .payloads
        .iter()
        .filter(|p| p.is("x", NS_MUC_USER))
        .flat_map(|x| x.children())
        .filter(|c| c.name() == "status")
        .filter_map(|c| c.attr("code").and_then(|v| v.parse().ok()))
        .collect()
}
