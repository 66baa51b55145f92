//! XEP-0045 Multi-User Chat.
//!
//! [`MucService`] is the conference component: it registers as the
//! routing context for its subdomain, claims presence, message and IQ
//! stanzas addressed there, and fans room traffic back out through the
//! domain router. Deliveries that fail evict the unreachable occupant in
//! a detached task so the delivering path never blocks on room locks.

pub mod admin;
pub mod conference;
pub mod history;
pub mod owner;
pub mod presence;
pub mod room;
pub mod settings;
pub mod stanzas;

use std::sync::{Arc, Weak};

use jid::Jid;
use tracing::{debug, info, warn};
use xmpp_parsers::iq::Iq;
use xmpp_parsers::message::MessageType;

use crate::correlate::PendingIqTable;
use crate::dispatch::{HandlerTable, StanzaHandler};
use crate::error::{message_error, StanzaErrorCondition, XmppError};
use crate::registry::BindListener;
use crate::relay::{DeliveryError, DeliveryFailureStrategy, StanzaRelay};
use crate::router::{DomainRouter, RoutingContext};
use crate::stanza::{Stanza, StanzaShape};

use conference::Conference;
use room::{Occupant, Room};
use stanzas::room_nick_jid;

pub use room::{Affiliation, Role};
pub use settings::{ConfigAxis, RoomSettings, RoomType};

pub const NS_MUC: &str = "http://jabber.org/protocol/muc";
pub const NS_MUC_USER: &str = "http://jabber.org/protocol/muc#user";
pub const NS_MUC_ADMIN: &str = "http://jabber.org/protocol/muc#admin";
pub const NS_MUC_OWNER: &str = "http://jabber.org/protocol/muc#owner";
pub const NS_DELAY: &str = "urn:xmpp:delay";
pub const NS_DATA_FORMS: &str = "jabber:x:data";

/// The conference component for one chat subdomain.
pub struct MucService {
    domain: String,
    conference: Conference,
    router: Arc<DomainRouter>,
    pending: Arc<PendingIqTable>,
    handlers: HandlerTable,
    loopback: MucLoopbackRelay,
    weak_self: Weak<MucService>,
}

impl MucService {
    pub fn new(
        domain: impl Into<String>,
        router: Arc<DomainRouter>,
        pending: Arc<PendingIqTable>,
    ) -> Arc<Self> {
        let domain = domain.into();
        Arc::new_cyclic(|weak: &Weak<MucService>| {
            let mut handlers = HandlerTable::new();
            handlers.set_presence(Arc::new(presence::MucPresenceHandler::new(weak.clone())));
            handlers.set_message(Arc::new(MucMessageHandler {
                service: weak.clone(),
            }));
            handlers.register_iq(NS_MUC_ADMIN, Arc::new(admin::MucAdminHandler::new(weak.clone())));
            handlers.register_iq(NS_MUC_OWNER, Arc::new(owner::MucOwnerHandler::new(weak.clone())));
            handlers.set_iq_fallback(Arc::new(OccupantIqRelay {
                service: weak.clone(),
            }));
            info!(%domain, "conference service created");
            Self {
                conference: Conference::new(domain.clone()),
                domain,
                router,
                pending,
                handlers,
                loopback: MucLoopbackRelay { service: weak.clone() },
                weak_self: weak.clone(),
            }
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn conference(&self) -> &Conference {
        &self.conference
    }

    /// Relay a stanza on behalf of a room. Failed deliveries to occupants
    /// trigger eviction of the unreachable occupant.
    pub fn send(&self, stanza: Stanza) -> bool {
        self.router.relay_with(
            stanza,
            &EvictUnreachable {
                service: self.weak_self.clone(),
            },
        )
    }

    /// Bind listener that removes a resource's occupancies when its
    /// session goes away without leaving its rooms.
    pub fn bind_listener(self: &Arc<Self>) -> Arc<dyn BindListener> {
        Arc::new(OccupancyCleanup {
            service: Arc::downgrade(self),
        })
    }

    /// Delete the room if it is temporary and now empty.
    pub(crate) fn sweep_if_abandoned(&self, room: &Room) {
        if room.is_type(RoomType::Temporary) && room.is_empty() {
            if let Some(node) = room.jid().node() {
                self.conference.delete_room(node.as_str());
            }
        }
    }

    /// Run a departure off the delivering call stack.
    ///
    /// Used for evictions triggered while a room broadcast is in flight;
    /// running inline would re-enter the room from inside its own fan-out.
    /// Outside a runtime the departure runs inline, which is only the
    /// case in synchronous tests.
    pub(crate) fn schedule_departure(
        &self,
        room: Arc<Room>,
        occupant: Arc<Occupant>,
        reason: &'static str,
    ) {
        let Some(service) = self.weak_self.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    presence::depart(&service, &room, &occupant, Some(reason), true);
                });
            }
            Err(_) => presence::depart(&service, &room, &occupant, Some(reason), true),
        }
    }
}

impl RoutingContext for MucService {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn relay(&self) -> &dyn StanzaRelay {
        &self.loopback
    }

    fn handler(&self, stanza: &Stanza) -> Option<Arc<dyn StanzaHandler>> {
        self.handlers.select(stanza)
    }
}

/// Relay for stanzas routed *to* the conference domain rather than
/// dispatched there: they are handed to the service's own handlers.
struct MucLoopbackRelay {
    service: Weak<MucService>,
}

impl StanzaRelay for MucLoopbackRelay {
    fn deliver(&self, to: &Jid, stanza: &Stanza) -> Result<(), DeliveryError> {
        let service = self
            .service
            .upgrade()
            .ok_or_else(|| DeliveryError::NotRelaying(to.domain().to_string()))?;
        let handler = service
            .handlers
            .select(stanza)
            .ok_or_else(|| DeliveryError::NotRelaying(service.domain.clone()))?;
        let from = stanza
            .from()
            .cloned()
            .ok_or_else(|| DeliveryError::NotRelaying(service.domain.clone()))?;
        match handler.execute(stanza, &from) {
            Ok(Some(response)) => {
                service.router.relay(response);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) => {
                warn!(%error, "conference loopback handler failed");
                Ok(())
            }
        }
    }
}

/// Eviction strategy for room fan-out: an occupant whose session cannot
/// be reached anymore is removed from the room the stanza came from.
struct EvictUnreachable {
    service: Weak<MucService>,
}

impl DeliveryFailureStrategy for EvictUnreachable {
    fn on_failure(&self, error: &DeliveryError, stanza: &Stanza) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        let Some(to) = stanza.to() else {
            return;
        };
        let Ok(full) = to.clone().try_into_full() else {
            return;
        };
        let room = stanza
            .from()
            .filter(|f| f.domain().as_str() == service.domain())
            .and_then(|f| f.node())
            .and_then(|node| service.conference.find_room(node.as_str()));
        let Some(room) = room else {
            return;
        };
        if let Some(occupant) = room.occupant_by_jid(&full) {
            warn!(room = %room.jid(), occupant = %full, %error, "evicting unreachable occupant");
            service.schedule_departure(room, occupant, "unreachable");
        }
    }
}

/// Removes occupancies left behind by sessions that unbind without
/// leaving their rooms.
struct OccupancyCleanup {
    service: Weak<MucService>,
}

impl BindListener for OccupancyCleanup {
    fn resource_unbound(&self, jid: &jid::FullJid) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        for (room, occupant) in service.conference.occupancies_of(jid) {
            debug!(room = %room.jid(), occupant = %jid, "departing unbound occupant");
            service.schedule_departure(room, occupant, "session closed");
        }
    }
}

/// Groupchat and private messages addressed into the conference.
struct MucMessageHandler {
    service: Weak<MucService>,
}

impl MucMessageHandler {
    fn service(&self) -> Result<Arc<MucService>, XmppError> {
        self.service
            .upgrade()
            .ok_or_else(|| XmppError::internal("conference service gone"))
    }
}

impl StanzaHandler for MucMessageHandler {
    fn name(&self) -> &'static str {
        "muc-message"
    }

    fn verify(&self, stanza: &Stanza) -> bool {
        matches!(stanza, Stanza::Message(_))
    }

    fn execute(&self, stanza: &Stanza, from: &Jid) -> Result<Option<Stanza>, XmppError> {
        let service = self.service()?;
        let Stanza::Message(message) = stanza else {
            return Ok(None);
        };
        let Some(to) = message.to.clone() else {
            return Ok(None);
        };
        let Some(node) = to.node() else {
            // Messages to the bare service address have no meaning here.
            return Ok(None);
        };
        let room_bare = to.to_bare();
        let reply = |condition| {
            Ok(Some(Stanza::Message(message_error(
                &room_bare,
                from,
                message.id.clone(),
                condition,
            ))))
        };

        let Ok(sender) = from.clone().try_into_full() else {
            return reply(StanzaErrorCondition::JidMalformed);
        };
        let Some(room) = service.conference.find_room(node.as_str()) else {
            return reply(StanzaErrorCondition::ItemNotFound);
        };
        let Some(occupant) = room.occupant_by_jid(&sender) else {
            return reply(StanzaErrorCondition::NotAcceptable);
        };

        if let Some(target_nick) = to.resource() {
            // Private message: forwarded to the one occupant, sender
            // rewritten to their room address.
            let Some(target) = room.occupant_by_nick(target_nick.as_str()) else {
                return reply(StanzaErrorCondition::ItemNotFound);
            };
            let mut forwarded = message.clone();
            forwarded.from = Some(Jid::from(room_nick_jid(room.jid(), &occupant.nick())));
            forwarded.to = Some(Jid::from(target.jid().clone()));
            service.send(Stanza::Message(forwarded));
            return Ok(None);
        }

        if message.type_ != MessageType::Groupchat {
            return reply(StanzaErrorCondition::BadRequest);
        }

        // Subject changes arrive as body-less groupchat messages.
        if !message.subjects.is_empty() && message.bodies.is_empty() {
            if room.is_type(settings::RoomType::ModeratedSubject) && !occupant.is_moderator() {
                return reply(StanzaErrorCondition::Forbidden);
            }
            let subject = message
                .subjects
                .values()
                .next()
                .map(|s| s.0.clone())
                .unwrap_or_default();
            room.set_subject(Some(subject.clone()));
            for receiver in room.occupants() {
                let announcement =
                    stanzas::subject_message(room.jid(), receiver.jid(), &subject);
                service.send(Stanza::Message(announcement));
            }
            return Ok(None);
        }

        if !occupant.role().has_voice() {
            return reply(StanzaErrorCondition::Forbidden);
        }

        let nick = occupant.nick();
        room.with_history(|history| history.append(&nick, message.clone()));
        for receiver in room.occupants() {
            let mut fanned = message.clone();
            fanned.from = Some(Jid::from(room_nick_jid(room.jid(), &nick)));
            fanned.to = Some(Jid::from(receiver.jid().clone()));
            service.send(Stanza::Message(fanned));
        }
        Ok(None)
    }
}

/// IQ requests addressed to an occupant's room address, forwarded to the
/// occupant's real session with the answer correlated back.
struct OccupantIqRelay {
    service: Weak<MucService>,
}

impl StanzaHandler for OccupantIqRelay {
    fn name(&self) -> &'static str {
        "muc-iq-relay"
    }

    fn verify(&self, stanza: &Stanza) -> bool {
        matches!(stanza.shape(), StanzaShape::IqRequest(_))
    }

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
        let room_bare = to.to_bare();
        let reply = |condition| {
            Ok(Some(Stanza::Iq(crate::error::iq_error(
                &iq.id,
                Some(Jid::from(room_bare.clone())),
                Some(from.clone()),
                condition,
            ))))
        };

        let (Some(node), Some(target_nick)) = (to.node(), to.resource()) else {
            return reply(StanzaErrorCondition::ServiceUnavailable);
        };
        let Ok(sender) = from.clone().try_into_full() else {
            return reply(StanzaErrorCondition::JidMalformed);
        };
        let Some(room) = service.conference.find_room(node.as_str()) else {
            return reply(StanzaErrorCondition::ItemNotFound);
        };
        let Some(sender_occupant) = room.occupant_by_jid(&sender) else {
            return reply(StanzaErrorCondition::NotAcceptable);
        };
        let Some(target) = room.occupant_by_nick(target_nick.as_str()) else {
            return reply(StanzaErrorCondition::ItemNotFound);
        };

        let requester = Jid::from(sender.clone());
        let target_room_jid = Jid::from(room_nick_jid(room.jid(), target_nick.as_str()));
        let router = service.router.clone();
        service.pending.register(
            iq.id.clone(),
            Box::new(move |mut answer: Iq| {
                answer.from = Some(target_room_jid);
                answer.to = Some(requester);
                router.relay(Stanza::Iq(answer));
            }),
        );

        let mut forwarded = iq.clone();
        forwarded.from = Some(Jid::from(room_nick_jid(
            room.jid(),
            &sender_occupant.nick(),
        )));
        forwarded.to = Some(Jid::from(target.jid().clone()));
        debug!(id = %iq.id, "forwarding iq between occupants");
        service.send(Stanza::Iq(forwarded));
        Ok(None)
    }
}
