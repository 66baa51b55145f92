//! The muc#owner protocol: room configuration forms and room destruction.
//!
//! Owners fetch the configuration as a jabber:x:data form, submit changes
//! back, or destroy the room outright. Submitting any form also unlocks a
//! room that was created locked.

use std::sync::{Arc, Weak};

use jid::Jid;
use minidom::Element;
use tracing::{debug, info, instrument};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::presence;

use super::room::{Affiliation, Role, Room};
use super::settings::RoomType;
use super::stanzas::StatusCode;
use super::{MucService, NS_DATA_FORMS, NS_MUC_OWNER, NS_MUC_USER};
use crate::dispatch::StanzaHandler;
use crate::error::{iq_error, StanzaErrorCondition, XmppError};
use crate::stanza::Stanza;

/// What an owner asked for.
enum OwnerAction {
    GetConfig,
    SetConfig(ConfigFormData),
    Cancel,
    Destroy(DestroyRequest),
}

/// Parsed muc#roomconfig submission. Unset fields leave the current
/// value alone.
#[derive(Debug, Default, PartialEq)]
struct ConfigFormData {
    room_name: Option<String>,
    password_protected: Option<bool>,
    password: Option<String>,
    members_only: Option<bool>,
    moderated: Option<bool>,
    persistent: Option<bool>,
    public: Option<bool>,
    whois: Option<String>,
    open_subject: Option<bool>,
    max_users: Option<usize>,
}

#[derive(Debug, Default)]
struct DestroyRequest {
    reason: Option<String>,
}

fn parse_boolean(value: &str) -> Option<bool> {
    match value {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn field_value(field: &Element) -> Option<String> {
    field
        .get_child("value", NS_DATA_FORMS)
        .map(|v| v.text())
        .filter(|v| !v.is_empty())
}

fn parse_config_form(x: &Element) -> ConfigFormData {
    let mut data = ConfigFormData::default();
    for field in x.children().filter(|c| c.is("field", NS_DATA_FORMS)) {
        let Some(var) = field.attr("var") else {
            continue;
        };
        let value = field_value(field);
        match var {
            "muc#roomconfig_roomname" => data.room_name = value,
            "muc#roomconfig_passwordprotectedroom" => {
                data.password_protected = value.as_deref().and_then(parse_boolean)
            }
            "muc#roomconfig_roomsecret" => data.password = value,
            "muc#roomconfig_membersonly" => {
                data.members_only = value.as_deref().and_then(parse_boolean)
            }
            "muc#roomconfig_moderatedroom" => {
                data.moderated = value.as_deref().and_then(parse_boolean)
            }
            "muc#roomconfig_persistentroom" => {
                data.persistent = value.as_deref().and_then(parse_boolean)
            }
            "muc#roomconfig_publicroom" => data.public = value.as_deref().and_then(parse_boolean),
            "muc#roomconfig_whois" => data.whois = value,
            "muc#roomconfig_changesubject" => {
                data.open_subject = value.as_deref().and_then(parse_boolean)
            }
            "muc#roomconfig_maxusers" => data.max_users = value.and_then(|v| v.parse().ok()),
            _ => {}
        }
    }
    data
}

fn parse_owner_query(iq: &Iq) -> Option<OwnerAction> {
    let query = match &iq.payload {
        IqType::Get(query) if query.is("query", NS_MUC_OWNER) => return Some(OwnerAction::GetConfig),
        IqType::Set(query) if query.is("query", NS_MUC_OWNER) => query,
        _ => return None,
    };
    if let Some(destroy) = query.get_child("destroy", NS_MUC_OWNER) {
        return Some(OwnerAction::Destroy(DestroyRequest {
            reason: destroy
                .get_child("reason", NS_MUC_OWNER)
                .map(|r| r.text())
                .filter(|t| !t.is_empty()),
        }));
    }
    let x = query.get_child("x", NS_DATA_FORMS)?;
    match x.attr("type") {
        Some("submit") => Some(OwnerAction::SetConfig(parse_config_form(x))),
        Some("cancel") => Some(OwnerAction::Cancel),
        _ => None,
    }
}

fn build_field_hidden(var: &str, value: &str) -> Element {
    Element::builder("field", NS_DATA_FORMS)
        .attr("var", var)
        .attr("type", "hidden")
        .append(Element::builder("value", NS_DATA_FORMS).append(value).build())
        .build()
}

fn build_field_boolean(var: &str, label: &str, value: bool) -> Element {
    Element::builder("field", NS_DATA_FORMS)
        .attr("var", var)
        .attr("type", "boolean")
        .attr("label", label)
        .append(
            Element::builder("value", NS_DATA_FORMS)
                .append(if value { "1" } else { "0" })
                .build(),
        )
        .build()
}

fn build_field_text(var: &str, label: &str, field_type: &str, value: &str) -> Element {
    Element::builder("field", NS_DATA_FORMS)
        .attr("var", var)
        .attr("type", field_type)
        .attr("label", label)
        .append(Element::builder("value", NS_DATA_FORMS).append(value).build())
        .build()
}

/// Render a room's current configuration as a data form.
fn build_config_form(room: &Room) -> Element {
    let settings = room.settings();
    let whois = if settings.contains(RoomType::NonAnonymous) {
        "anyone"
    } else if settings.contains(RoomType::SemiAnonymous) {
        "moderators"
    } else {
        "none"
    };
    Element::builder("x", NS_DATA_FORMS)
        .attr("type", "form")
        .append(build_field_hidden(
            "FORM_TYPE",
            "http://jabber.org/protocol/muc#roomconfig",
        ))
        .append(build_field_text(
            "muc#roomconfig_roomname",
            "Natural-Language Room Name",
            "text-single",
            &room.name(),
        ))
        .append(build_field_boolean(
            "muc#roomconfig_passwordprotectedroom",
            "Password Required to Enter?",
            settings.contains(RoomType::PasswordProtected),
        ))
        .append(build_field_text(
            "muc#roomconfig_roomsecret",
            "Password",
            "text-private",
            room.password().as_deref().unwrap_or(""),
        ))
        .append(build_field_boolean(
            "muc#roomconfig_membersonly",
            "Make Room Members Only?",
            settings.contains(RoomType::MembersOnly),
        ))
        .append(build_field_boolean(
            "muc#roomconfig_moderatedroom",
            "Make Room Moderated?",
            settings.contains(RoomType::Moderated),
        ))
        .append(build_field_boolean(
            "muc#roomconfig_persistentroom",
            "Make Room Persistent?",
            settings.contains(RoomType::Persistent),
        ))
        .append(build_field_boolean(
            "muc#roomconfig_publicroom",
            "Make Room Publicly Searchable?",
            settings.contains(RoomType::Public),
        ))
        .append(build_field_text(
            "muc#roomconfig_whois",
            "Who May Discover Real JIDs?",
            "list-single",
            whois,
        ))
        .append(build_field_boolean(
            "muc#roomconfig_changesubject",
            "Allow Occupants to Change Subject?",
            settings.contains(RoomType::OpenSubject),
        ))
        .append(build_field_text(
            "muc#roomconfig_maxusers",
            "Maximum Number of Occupants",
            "text-single",
            &room
                .max_occupants()
                .map(|m| m.to_string())
                .unwrap_or_default(),
        ))
        .build()
}

/// Apply a submitted form to the room.
fn apply_config_form(room: &Room, data: &ConfigFormData) {
    if let Some(name) = &data.room_name {
        room.set_name(name.clone());
    }
    room.update_settings(|settings| {
        if let Some(protected) = data.password_protected {
            settings.set(if protected {
                RoomType::PasswordProtected
            } else {
                RoomType::Unsecured
            });
        }
        if let Some(members_only) = data.members_only {
            settings.set(if members_only {
                RoomType::MembersOnly
            } else {
                RoomType::Open
            });
        }
        if let Some(moderated) = data.moderated {
            settings.set(if moderated {
                RoomType::Moderated
            } else {
                RoomType::Unmoderated
            });
        }
        if let Some(persistent) = data.persistent {
            settings.set(if persistent {
                RoomType::Persistent
            } else {
                RoomType::Temporary
            });
        }
        if let Some(public) = data.public {
            settings.set(if public { RoomType::Public } else { RoomType::Hidden });
        }
        if let Some(whois) = &data.whois {
            match whois.as_str() {
                "anyone" => settings.set(RoomType::NonAnonymous),
                "moderators" => settings.set(RoomType::SemiAnonymous),
                "none" => settings.set(RoomType::FullyAnonymous),
                _ => {}
            }
        }
        if let Some(open) = data.open_subject {
            settings.set(if open {
                RoomType::OpenSubject
            } else {
                RoomType::ModeratedSubject
            });
        }
    });
    if let Some(password) = &data.password {
        room.set_password(Some(password.clone()));
    } else if data.password_protected == Some(false) {
        room.set_password(None);
    }
    if let Some(max) = data.max_users {
        room.set_max_occupants(if max == 0 { None } else { Some(max) });
    }
}

pub struct MucOwnerHandler {
    service: Weak<MucService>,
}

impl MucOwnerHandler {
    pub fn new(service: Weak<MucService>) -> Self {
        Self { service }
    }
}

impl StanzaHandler for MucOwnerHandler {
    fn name(&self) -> &'static str {
        "muc-owner"
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
        let result = |payload: Option<Element>| {
            Ok(Some(Stanza::Iq(Iq {
                from: Some(Jid::from(to.to_bare())),
                to: Some(from.clone()),
                id: iq.id.clone(),
                payload: IqType::Result(payload),
            })))
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
        let is_owner = room.affiliation_of(&sender.to_bare()) == Affiliation::Owner
            || room
                .occupant_by_jid(&sender)
                .map(|o| o.affiliation() == Affiliation::Owner)
                .unwrap_or(false);
        if !is_owner {
            return reply_err(StanzaErrorCondition::Forbidden);
        }

        match parse_owner_query(iq) {
            Some(OwnerAction::GetConfig) => {
                let query = Element::builder("query", NS_MUC_OWNER)
                    .append(build_config_form(&room))
                    .build();
                result(Some(query))
            }
            Some(OwnerAction::SetConfig(data)) => {
                apply_config_form(&room, &data);
                if room.is_locked() {
                    room.set_locked(false);
                    info!(room = %room.jid(), "room unlocked by configuration");
                }
                debug!(room = %room.jid(), "room reconfigured");
                result(None)
            }
            Some(OwnerAction::Cancel) => result(None),
            Some(OwnerAction::Destroy(destroy)) => {
                destroy_room(&service, &room, destroy.reason.as_deref());
                result(None)
            }
            None => reply_err(StanzaErrorCondition::BadRequest),
        }
    }
}

/// Tell every occupant the room is gone, then delete it.
fn destroy_room(service: &Arc<MucService>, room: &Arc<Room>, reason: Option<&str>) {
    info!(room = %room.jid(), "room destroyed by owner");
    let occupants = room.occupants();
    for occupant in &occupants {
        room.remove_occupant(occupant.jid());
    }
    for occupant in occupants {
        let mut destroy = Element::builder("destroy", NS_MUC_USER);
        if let Some(reason) = reason {
            destroy = destroy.append(
                Element::builder("reason", NS_MUC_USER)
                    .append(reason)
                    .build(),
            );
        }
        let x = Element::builder("x", NS_MUC_USER)
            .append(
                Element::builder("item", NS_MUC_USER)
                    .attr("affiliation", Affiliation::None.as_str())
                    .attr("role", Role::None.as_str())
                    .build(),
            )
            .append(destroy.build())
            .append(
                Element::builder("status", NS_MUC_USER)
                    .attr("code", StatusCode::SelfPresence.code().to_string())
                    .build(),
            )
            .build();
        let mut p = presence::Presence::new(presence::Type::Unavailable);
        p.from = Some(Jid::from(super::stanzas::room_nick_jid(
            room.jid(),
            &occupant.nick(),
        )));
        p.to = Some(Jid::from(occupant.jid().clone()));
        p.payloads.push(x);
        service.send(Stanza::Presence(p));
    }
    if let Some(node) = room.jid().node() {
        service.conference().delete_room(node.as_str());
    }
}
