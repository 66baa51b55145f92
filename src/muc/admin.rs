//! The muc#admin protocol: kicks, voice management, bans and other
//! affiliation changes.

use std::sync::{Arc, Weak};

use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, instrument};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::presence;

use super::room::{Affiliation, Occupant, Role, Room};
use super::settings::RoomType;
use super::stanzas::{
    affiliation_message, discloses_jid_to, occupant_presence, x_user, OccupantItem, StatusCode,
};
use super::{MucService, NS_MUC_ADMIN};
use crate::dispatch::StanzaHandler;
use crate::error::{iq_error, StanzaErrorCondition, XmppError};
use crate::stanza::Stanza;

pub struct MucAdminHandler {
    service: Weak<MucService>,
}

impl MucAdminHandler {
    pub fn new(service: Weak<MucService>) -> Self {
        Self { service }
    }
}

/// The `<item/>` of an admin request.
struct AdminItem {
    nick: Option<String>,
    jid: Option<Jid>,
    role: Option<String>,
    affiliation: Option<String>,
    reason: Option<String>,
}

impl AdminItem {
    fn parse(query: &Element) -> Option<Self> {
        let item = query.get_child("item", NS_MUC_ADMIN)?;
        Some(Self {
            nick: item.attr("nick").map(str::to_string),
            jid: item.attr("jid").and_then(|v| v.parse().ok()),
            role: item.attr("role").map(str::to_string),
            affiliation: item.attr("affiliation").map(str::to_string),
            reason: item
                .get_child("reason", NS_MUC_ADMIN)
                .map(|r| r.text())
                .filter(|t| !t.is_empty()),
        })
    }
}

impl StanzaHandler for MucAdminHandler {
    fn name(&self) -> &'static str {
        "muc-admin"
    }

    fn verify(&self, stanza: &Stanza) -> bool {
        matches!(stanza, Stanza::Iq(_))
    }

    #[instrument(skip_all)]
    fn execute(&self, stanza: &Stanza, from: &Jid) -> Result<Option<Stanza>, XmppError> {
        let service = self
            .service
            .upgrade()
            .ok_or_else(|| XmppError::internal("conference service gone"))?;
        let Stanza::Iq(iq) = stanza else {
            return Ok(None);
        };
        let Some(to) = iq.to.clone() else {
            return Ok(None);
        };
        let reply_err = |condition| {
            Ok(Some(Stanza::Iq(iq_error(
                &iq.id,
                Some(Jid::from(to.to_bare())),
                Some(from.clone()),
                condition,
            ))))
        };

        let query = match &iq.payload {
            IqType::Set(query) => query,
            // Membership list retrieval is not offered.
            IqType::Get(_) => return reply_err(StanzaErrorCondition::FeatureNotImplemented),
            _ => return Ok(None),
        };
        let Some(node) = to.node() else {
            return reply_err(StanzaErrorCondition::BadRequest);
        };
        let Some(room) = service.conference().find_room(node.as_str()) else {
            return reply_err(StanzaErrorCondition::ItemNotFound);
        };
        let Ok(sender) = from.clone().try_into_full() else {
            return reply_err(StanzaErrorCondition::JidMalformed);
        };
        let Some(actor) = room.occupant_by_jid(&sender) else {
            return reply_err(StanzaErrorCondition::Forbidden);
        };
        let Some(item) = AdminItem::parse(query) else {
            return reply_err(StanzaErrorCondition::BadRequest);
        };

        let outcome = if item.role.is_some() {
            change_role(&service, &room, &actor, &item)
        } else if item.affiliation.is_some() {
            change_affiliation(&service, &room, &actor, &item)
        } else {
            Err(StanzaErrorCondition::BadRequest)
        };

        match outcome {
            Ok(()) => Ok(Some(Stanza::Iq(Iq {
                from: Some(Jid::from(room.jid().clone())),
                to: Some(from.clone()),
                id: iq.id.clone(),
                payload: IqType::Result(None),
            }))),
            Err(condition) => reply_err(condition),
        }
    }
}

fn change_role(
    service: &Arc<MucService>,
    room: &Arc<Room>,
    actor: &Arc<Occupant>,
    item: &AdminItem,
) -> Result<(), StanzaErrorCondition> {
    if !actor.is_moderator() {
        return Err(StanzaErrorCondition::Forbidden);
    }
    let nick = item.nick.as_deref().ok_or(StanzaErrorCondition::BadRequest)?;
    let target = room
        .occupant_by_nick(nick)
        .ok_or(StanzaErrorCondition::ItemNotFound)?;
    if target.jid() == actor.jid() {
        return Err(StanzaErrorCondition::Conflict);
    }
    let new_role = item
        .role
        .as_deref()
        .and_then(Role::parse)
        .ok_or(StanzaErrorCondition::BadRequest)?;

    match new_role {
        Role::None => {
            // Kicking: the actor's affiliation must strictly outrank the
            // target's.
            if !actor.affiliation().outranks(target.affiliation()) {
                return Err(StanzaErrorCondition::NotAllowed);
            }
        }
        Role::Visitor | Role::Participant => {
            // Admins and owners keep their privileges.
            if target.affiliation() >= Affiliation::Admin {
                return Err(StanzaErrorCondition::NotAllowed);
            }
        }
        Role::Moderator => {
            if actor.affiliation() < Affiliation::Admin {
                return Err(StanzaErrorCondition::NotAllowed);
            }
        }
    }

    if new_role == Role::None {
        kick(service, room, &target, item.reason.as_deref());
    } else {
        target.set_role(new_role);
        debug!(room = %room.jid(), nick, role = new_role.as_str(), "role changed");
        broadcast_position(service, room, &target, item.reason.as_deref(), &[]);
    }
    Ok(())
}

fn change_affiliation(
    service: &Arc<MucService>,
    room: &Arc<Room>,
    actor: &Arc<Occupant>,
    item: &AdminItem,
) -> Result<(), StanzaErrorCondition> {
    if actor.affiliation() < Affiliation::Admin {
        return Err(StanzaErrorCondition::Forbidden);
    }
    let new_affiliation = item
        .affiliation
        .as_deref()
        .and_then(Affiliation::parse)
        .ok_or(StanzaErrorCondition::BadRequest)?;

    let target_bare: BareJid = match (&item.jid, &item.nick) {
        (Some(jid), _) => jid.to_bare(),
        (None, Some(nick)) => room
            .occupant_by_nick(nick)
            .ok_or(StanzaErrorCondition::ItemNotFound)?
            .jid()
            .to_bare(),
        (None, None) => return Err(StanzaErrorCondition::BadRequest),
    };
    let current = room.affiliation_of(&target_bare);

    // Only owners touch the admin and owner tiers.
    if (current >= Affiliation::Admin || new_affiliation >= Affiliation::Admin)
        && actor.affiliation() != Affiliation::Owner
    {
        return Err(StanzaErrorCondition::NotAllowed);
    }
    if new_affiliation == Affiliation::Outcast && !actor.affiliation().outranks(current) {
        return Err(StanzaErrorCondition::NotAllowed);
    }

    let target = room.occupant_by_bare(&target_bare);
    room.set_affiliation(&target_bare, new_affiliation);
    debug!(room = %room.jid(), target = %target_bare,
        affiliation = new_affiliation.as_str(), "affiliation changed");

    let expelled = new_affiliation == Affiliation::Outcast
        || (room.is_type(RoomType::MembersOnly) && new_affiliation < Affiliation::Member);

    match target {
        Some(target) if expelled => {
            let status = if new_affiliation == Affiliation::Outcast {
                StatusCode::Banned
            } else {
                StatusCode::RemovedByAffiliation
            };
            expel(service, room, &target, item.reason.as_deref(), status);
        }
        Some(target) => {
            if new_affiliation >= Affiliation::Admin {
                target.set_role(Role::Moderator);
            } else if target.role() == Role::Moderator && current >= Affiliation::Admin {
                // Demotion out of the admin tier loses the implicit
                // moderator role.
                target.set_role(Role::on_entry(new_affiliation, &room.settings()));
            }
            broadcast_position(service, room, &target, item.reason.as_deref(), &[]);
        }
        None => {
            // The user is not in the room: occupants learn about the
            // change through a room message.
            let announcement = OccupantItem {
                affiliation: new_affiliation,
                role: Role::None,
                jid: Some(Jid::from(target_bare.clone())),
                nick: None,
                reason: item.reason.clone(),
            };
            for receiver in room.occupants() {
                service.send(Stanza::Message(affiliation_message(
                    room.jid(),
                    receiver.jid(),
                    announcement.clone(),
                )));
            }
        }
    }
    Ok(())
}

/// Announce an occupant's current affiliation and role to the whole room.
fn broadcast_position(
    service: &Arc<MucService>,
    room: &Arc<Room>,
    target: &Arc<Occupant>,
    reason: Option<&str>,
    extra_statuses: &[StatusCode],
) {
    for receiver in room.occupants() {
        let mut item = OccupantItem::describing(room, target, &receiver);
        item.reason = reason.map(str::to_string);
        let mut statuses = extra_statuses.to_vec();
        if receiver.jid() == target.jid() {
            statuses.push(StatusCode::SelfPresence);
        }
        let presence = occupant_presence(
            room.jid(),
            &target.nick(),
            &Jid::from(receiver.jid().clone()),
            presence::Type::None,
            x_user(item, &statuses),
            target.extras(),
        );
        service.send(Stanza::Presence(presence));
    }
}

fn kick(service: &Arc<MucService>, room: &Arc<Room>, target: &Arc<Occupant>, reason: Option<&str>) {
    expel(service, room, target, reason, StatusCode::Kicked);
}

/// Remove an occupant against their will and tell everyone, the target
/// included, with the appropriate removal status code.
fn expel(
    service: &Arc<MucService>,
    room: &Arc<Room>,
    target: &Arc<Occupant>,
    reason: Option<&str>,
    status: StatusCode,
) {
    let receivers = room.occupants();
    if room.remove_occupant(target.jid()).is_none() {
        return;
    }
    debug!(room = %room.jid(), target = %target.jid(), code = status.code(), "occupant expelled");

    for receiver in receivers {
        let is_self = receiver.jid() == target.jid();
        let disclose = is_self || discloses_jid_to(&room.settings(), receiver.role());
        let item = OccupantItem {
            affiliation: target.affiliation(),
            role: Role::None,
            jid: disclose.then(|| Jid::from(target.jid().clone())),
            nick: None,
            reason: reason.map(str::to_string),
        };
        let mut statuses = vec![status];
        if is_self {
            statuses.push(StatusCode::SelfPresence);
        }
        let presence = occupant_presence(
            room.jid(),
            &target.nick(),
            &Jid::from(receiver.jid().clone()),
            presence::Type::Unavailable,
            x_user(item, &statuses),
            Vec::new(),
        );
        service.send(Stanza::Presence(presence));
    }

    service.sweep_if_abandoned(room);
}
