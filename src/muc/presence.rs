//! Presence handling: joining, leaving, nickname changes and presence
//! updates.
//!
//! Join fan-out order matters to clients: first the existing occupants'
//! presence to the newcomer, then the newcomer's presence to everyone
//! with the self-presence (status 110) last, then history replay, then
//! the subject.

use std::sync::{Arc, Weak};

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tracing::{debug, instrument};
use xmpp_parsers::presence::{self, Presence};

use super::history::HistoryRequest;
use super::room::{AdmissionError, Affiliation, Occupant, Role, Room};
use super::settings::RoomType;
use super::stanzas::{
    discloses_jid_to, error_presence, occupant_presence, room_nick_jid, subject_message, x_user,
    OccupantItem, StatusCode,
};
use super::{MucService, NS_MUC};
use crate::dispatch::StanzaHandler;
use crate::error::{StanzaErrorCondition, XmppError};
use crate::stanza::Stanza;

pub struct MucPresenceHandler {
    service: Weak<MucService>,
}

impl MucPresenceHandler {
    pub fn new(service: Weak<MucService>) -> Self {
        Self { service }
    }
}

impl StanzaHandler for MucPresenceHandler {
    fn name(&self) -> &'static str {
        "muc-presence"
    }

    fn verify(&self, stanza: &Stanza) -> bool {
        matches!(stanza, Stanza::Presence(_))
    }

    fn execute(&self, stanza: &Stanza, from: &Jid) -> Result<Option<Stanza>, XmppError> {
        let service = self
            .service
            .upgrade()
            .ok_or_else(|| XmppError::internal("conference service gone"))?;
        let Stanza::Presence(p) = stanza else {
            return Ok(None);
        };
        let Some(to) = p.to.clone() else {
            return Ok(None);
        };
        match p.type_ {
            presence::Type::None => available(&service, p, &to, from),
            presence::Type::Unavailable => unavailable(&service, p, &to, from),
            // Errors and subscription presences have no meaning in a room.
            _ => Ok(None),
        }
    }
}

#[instrument(skip_all, fields(to = %to))]
fn available(
    service: &Arc<MucService>,
    p: &Presence,
    to: &Jid,
    from: &Jid,
) -> Result<Option<Stanza>, XmppError> {
    let room_bare = to.to_bare();
    let reject = |condition| {
        Ok(Some(Stanza::Presence(error_presence(
            &room_bare,
            from,
            p.id.clone(),
            condition,
        ))))
    };

    let Some(node) = to.node() else {
        // Presence to the bare service address is not room traffic.
        return Ok(None);
    };
    let Some(nick) = to.resource().map(|r| r.as_str().to_string()) else {
        return reject(StanzaErrorCondition::JidMalformed);
    };
    let Ok(sender) = from.clone().try_into_full() else {
        return reject(StanzaErrorCondition::JidMalformed);
    };

    let join_x = p.payloads.iter().find(|e| e.is("x", NS_MUC));

    if let Some(room) = service.conference().find_room(node.as_str()) {
        if let Some(occupant) = room.occupant_by_jid(&sender) {
            occupant.capture_extras(p);
            if occupant.nick() == nick {
                if let Some(x) = join_x {
                    // A fresh join request from a current occupant: answer
                    // with the full join sequence again.
                    send_join_sequence(
                        service,
                        &room,
                        &occupant,
                        &HistoryRequest::from_join(x),
                        false,
                        false,
                    );
                } else {
                    broadcast_update(service, &room, &occupant, p);
                }
                return Ok(None);
            }
            if room.nick_taken(&nick, Some(&sender)) {
                return reject(StanzaErrorCondition::Conflict);
            }
            change_nick(service, &room, &occupant, &nick);
            return Ok(None);
        }
        return join(service, &room, p, join_x, &sender, &nick, false, reject);
    }

    if join_x.is_none() {
        // A ghost aimed at a room that does not exist. The terminal
        // answer needs no room state, and the room must not come into
        // being for it: only a real join founds a room.
        debug!(room = %room_bare, occupant = %sender, "terminating ghost presence");
        return Ok(Some(Stanza::Presence(ghost_termination(
            &room_bare, &nick, &sender,
        ))));
    }

    // First join creates the room; such rooms disclose JIDs to everyone.
    let (room, created) = service
        .conference()
        .find_or_create_room(node.as_str(), &[RoomType::NonAnonymous])
        .map_err(|e| XmppError::internal(e.to_string()))?;
    join(service, &room, p, join_x, &sender, &nick, created, reject)
}

#[allow(clippy::too_many_arguments)]
fn join(
    service: &Arc<MucService>,
    room: &Arc<Room>,
    p: &Presence,
    join_x: Option<&Element>,
    sender: &FullJid,
    nick: &str,
    created: bool,
    reject: impl Fn(StanzaErrorCondition) -> Result<Option<Stanza>, XmppError>,
) -> Result<Option<Stanza>, XmppError> {
    let Some(x) = join_x else {
        // Presence without the protocol extension from a non-occupant is
        // a ghost: a client that believes it is still in the room. Answer
        // with a terminal presence so it stops.
        debug!(room = %room.jid(), occupant = %sender, "terminating ghost presence");
        return Ok(Some(Stanza::Presence(ghost_termination(
            room.jid(),
            nick,
            sender,
        ))));
    };

    // The nickname verdict comes before the password is examined, on the
    // nick the room would actually assign.
    let reserved = room.member(&sender.to_bare()).and_then(|m| m.nick);
    if room.nick_taken(reserved.as_deref().unwrap_or(nick), Some(sender)) {
        return reject(StanzaErrorCondition::Conflict);
    }

    if room.is_type(RoomType::PasswordProtected) {
        let given = x
            .get_child("password", NS_MUC)
            .map(|pw| pw.text())
            .unwrap_or_default();
        if room.password().as_deref() != Some(given.as_str()) {
            return reject(StanzaErrorCondition::NotAuthorized);
        }
    }

    let occupant = match room.add_occupant(sender, nick) {
        Ok(occupant) => occupant,
        Err(AdmissionError::NickTaken) => return reject(StanzaErrorCondition::Conflict),
        Err(AdmissionError::Banned) => return reject(StanzaErrorCondition::Forbidden),
        Err(AdmissionError::NotAMember) => {
            return reject(StanzaErrorCondition::RegistrationRequired)
        }
        Err(AdmissionError::Full) => return reject(StanzaErrorCondition::ServiceUnavailable),
        Err(AdmissionError::Locked) => return reject(StanzaErrorCondition::ItemNotFound),
    };

    occupant.capture_extras(p);
    if created {
        room.set_affiliation(&sender.to_bare(), Affiliation::Owner);
        occupant.set_role(Role::Moderator);
    }
    let nick_rewritten = occupant.nick() != nick;

    send_join_sequence(
        service,
        room,
        &occupant,
        &HistoryRequest::from_join(x),
        created,
        nick_rewritten,
    );
    Ok(None)
}

/// Terminal presence for a ghost: unavailable under the attempted nick
/// with statuses 110, 307 and 332 so the client gives up its phantom
/// occupancy.
fn ghost_termination(room: &BareJid, nick: &str, sender: &FullJid) -> Presence {
    let item = OccupantItem {
        affiliation: Affiliation::None,
        role: Role::None,
        jid: None,
        nick: None,
        reason: None,
    };
    let x = x_user(
        item,
        &[
            StatusCode::SelfPresence,
            StatusCode::Kicked,
            StatusCode::RemovedByService,
        ],
    );
    occupant_presence(
        room,
        nick,
        &Jid::from(sender.clone()),
        presence::Type::Unavailable,
        x,
        Vec::new(),
    )
}

/// Deliver the complete join choreography to the newcomer and announce
/// them to the room.
fn send_join_sequence(
    service: &Arc<MucService>,
    room: &Arc<Room>,
    newcomer: &Arc<Occupant>,
    limits: &HistoryRequest,
    created: bool,
    nick_rewritten: bool,
) {
    let receivers = room.occupants();

    for existing in receivers.iter().filter(|o| o.jid() != newcomer.jid()) {
        let item = OccupantItem::describing(room, existing, newcomer);
        let presence = occupant_presence(
            room.jid(),
            &existing.nick(),
            &Jid::from(newcomer.jid().clone()),
            presence::Type::None,
            x_user(item, &[]),
            existing.extras(),
        );
        service.send(Stanza::Presence(presence));
    }

    let (others, this): (Vec<_>, Vec<_>) = receivers
        .iter()
        .partition(|o| o.jid() != newcomer.jid());
    for receiver in others.into_iter().chain(this) {
        let mut statuses = Vec::new();
        if receiver.jid() == newcomer.jid() {
            if room.is_type(RoomType::NonAnonymous) {
                statuses.push(StatusCode::RoomNonAnonymous);
            }
            statuses.push(StatusCode::SelfPresence);
            if created {
                statuses.push(StatusCode::RoomCreated);
            }
            if nick_rewritten {
                statuses.push(StatusCode::NickModified);
            }
        }
        let item = OccupantItem::describing(room, newcomer, receiver);
        let presence = occupant_presence(
            room.jid(),
            &newcomer.nick(),
            &Jid::from(receiver.jid().clone()),
            presence::Type::None,
            x_user(item, &statuses),
            newcomer.extras(),
        );
        service.send(Stanza::Presence(presence));
    }

    let replay = room
        .with_history(|history| history.replay_for(room.jid(), newcomer.jid(), limits))
        .unwrap_or_default();
    for message in replay {
        service.send(Stanza::Message(message));
    }

    if let Some(subject) = room.subject() {
        service.send(Stanza::Message(subject_message(
            room.jid(),
            newcomer.jid(),
            &subject,
        )));
    }
}

/// Re-broadcast a show/status update to every occupant.
fn broadcast_update(service: &Arc<MucService>, room: &Arc<Room>, occupant: &Arc<Occupant>, p: &Presence) {
    for receiver in room.occupants() {
        let mut updated = p.clone();
        updated.from = Some(Jid::from(room_nick_jid(room.jid(), &occupant.nick())));
        updated.to = Some(Jid::from(receiver.jid().clone()));
        updated.payloads.retain(|e| !e.ns().starts_with(NS_MUC));
        let statuses = if receiver.jid() == occupant.jid() {
            vec![StatusCode::SelfPresence]
        } else {
            Vec::new()
        };
        updated.payloads.push(x_user(
            OccupantItem::describing(room, occupant, &receiver),
            &statuses,
        ));
        service.send(Stanza::Presence(updated));
    }
}

/// Two-phase nickname change: unavailable under the old nick carrying
/// status 303 and the new nick, then available under the new nick.
fn change_nick(service: &Arc<MucService>, room: &Arc<Room>, occupant: &Arc<Occupant>, new_nick: &str) {
    let old_nick = occupant.nick();
    occupant.set_nick(new_nick);
    debug!(room = %room.jid(), %old_nick, %new_nick, "nickname change");

    for receiver in room.occupants() {
        let is_self = receiver.jid() == occupant.jid();
        let disclose = is_self || discloses_jid_to(&room.settings(), receiver.role());
        let item = OccupantItem {
            affiliation: occupant.affiliation(),
            role: occupant.role(),
            jid: disclose.then(|| Jid::from(occupant.jid().clone())),
            nick: Some(new_nick.to_string()),
            reason: None,
        };
        let mut statuses = vec![StatusCode::NewNick];
        if is_self {
            statuses.push(StatusCode::SelfPresence);
        }
        let presence = occupant_presence(
            room.jid(),
            &old_nick,
            &Jid::from(receiver.jid().clone()),
            presence::Type::Unavailable,
            x_user(item, &statuses),
            Vec::new(),
        );
        service.send(Stanza::Presence(presence));
    }

    for receiver in room.occupants() {
        let statuses = if receiver.jid() == occupant.jid() {
            vec![StatusCode::SelfPresence]
        } else {
            Vec::new()
        };
        let item = OccupantItem::describing(room, occupant, &receiver);
        let presence = occupant_presence(
            room.jid(),
            new_nick,
            &Jid::from(receiver.jid().clone()),
            presence::Type::None,
            x_user(item, &statuses),
            occupant.extras(),
        );
        service.send(Stanza::Presence(presence));
    }
}

fn unavailable(
    service: &Arc<MucService>,
    p: &Presence,
    to: &Jid,
    from: &Jid,
) -> Result<Option<Stanza>, XmppError> {
    let Some(node) = to.node() else {
        return Ok(None);
    };
    let Ok(sender) = from.clone().try_into_full() else {
        return Ok(None);
    };
    let Some(room) = service.conference().find_room(node.as_str()) else {
        return Ok(None);
    };
    let Some(occupant) = room.occupant_by_jid(&sender) else {
        return Ok(None);
    };
    let status_text = p.statuses.values().next().cloned();
    depart(service, &room, &occupant, status_text.as_deref(), false);
    Ok(None)
}

/// Remove an occupant and announce the departure to the room, the leaver
/// included. Empties of temporary rooms destroy the room.
pub(crate) fn depart(
    service: &Arc<MucService>,
    room: &Arc<Room>,
    occupant: &Arc<Occupant>,
    status_text: Option<&str>,
    service_initiated: bool,
) {
    // Snapshot first; the leaver must still see their own unavailable.
    let receivers = room.occupants();
    if room.remove_occupant(occupant.jid()).is_none() {
        // Already departed, e.g. an eviction racing a voluntary leave.
        return;
    }
    debug!(room = %room.jid(), occupant = %occupant.jid(), "occupant departed");

    for receiver in receivers {
        let is_self = receiver.jid() == occupant.jid();
        let disclose = is_self || discloses_jid_to(&room.settings(), receiver.role());
        let item = OccupantItem {
            affiliation: occupant.affiliation(),
            role: Role::None,
            jid: disclose.then(|| Jid::from(occupant.jid().clone())),
            nick: None,
            reason: None,
        };
        let mut statuses = Vec::new();
        if is_self {
            statuses.push(StatusCode::SelfPresence);
        }
        if service_initiated {
            statuses.push(StatusCode::RemovedByService);
        }
        let mut presence = occupant_presence(
            room.jid(),
            &occupant.nick(),
            &Jid::from(receiver.jid().clone()),
            presence::Type::Unavailable,
            x_user(item, &statuses),
            Vec::new(),
        );
        // The leaver gets the bare self-presence; the status text is for
        // the rest of the room.
        if !is_self {
            if let Some(text) = status_text {
                presence.statuses.insert(String::new(), text.to_string());
            }
        }
        service.send(Stanza::Presence(presence));
    }

    service.sweep_if_abandoned(room);
}
