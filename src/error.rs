//! Error types and error-stanza construction.
//!
//! Protocol failures are expressed as [`StanzaErrorCondition`] values; each
//! condition knows the RFC 6120 error type it travels with, so call sites
//! only ever name the condition. Internal failures use [`XmppError`] and are
//! converted to wire errors at the dispatch boundary.

use jid::{BareJid, Jid};
use minidom::Element;
use thiserror::Error;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::{Message, MessageType};
use xmpp_parsers::presence::{self, Presence};
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

/// Internal error raised by stanza handlers.
#[derive(Debug, Error)]
pub enum XmppError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl XmppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        XmppError::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        XmppError::Internal(msg.into())
    }
}

/// Defined error conditions used by the routing core and the chat service,
/// each paired with its canonical error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    RegistrationRequired,
    RemoteServerNotFound,
    ServiceUnavailable,
}

impl StanzaErrorCondition {
    /// The error type a condition is reported with.
    pub fn error_type(self) -> ErrorType {
        match self {
            StanzaErrorCondition::BadRequest | StanzaErrorCondition::JidMalformed => {
                ErrorType::Modify
            }
            StanzaErrorCondition::NotAuthorized
            | StanzaErrorCondition::Forbidden
            | StanzaErrorCondition::RegistrationRequired => ErrorType::Auth,
            StanzaErrorCondition::Conflict
            | StanzaErrorCondition::FeatureNotImplemented
            | StanzaErrorCondition::ItemNotFound
            | StanzaErrorCondition::NotAcceptable
            | StanzaErrorCondition::NotAllowed
            | StanzaErrorCondition::InternalServerError
            | StanzaErrorCondition::RemoteServerNotFound => ErrorType::Cancel,
            StanzaErrorCondition::ServiceUnavailable => ErrorType::Wait,
        }
    }

    pub fn defined_condition(self) -> DefinedCondition {
        match self {
            StanzaErrorCondition::BadRequest => DefinedCondition::BadRequest,
            StanzaErrorCondition::Conflict => DefinedCondition::Conflict,
            StanzaErrorCondition::FeatureNotImplemented => DefinedCondition::FeatureNotImplemented,
            StanzaErrorCondition::Forbidden => DefinedCondition::Forbidden,
            StanzaErrorCondition::InternalServerError => DefinedCondition::InternalServerError,
            StanzaErrorCondition::ItemNotFound => DefinedCondition::ItemNotFound,
            StanzaErrorCondition::JidMalformed => DefinedCondition::JidMalformed,
            StanzaErrorCondition::NotAcceptable => DefinedCondition::NotAcceptable,
            StanzaErrorCondition::NotAllowed => DefinedCondition::NotAllowed,
            StanzaErrorCondition::NotAuthorized => DefinedCondition::NotAuthorized,
            StanzaErrorCondition::RegistrationRequired => DefinedCondition::RegistrationRequired,
            StanzaErrorCondition::RemoteServerNotFound => DefinedCondition::RemoteServerNotFound,
            StanzaErrorCondition::ServiceUnavailable => DefinedCondition::ServiceUnavailable,
        }
    }

    fn stanza_error(self, by: Option<Jid>) -> StanzaError {
        let mut error = StanzaError::new(self.error_type(), self.defined_condition(), "en", "");
        error.by = by;
        error
    }
}

/// Build a presence of type error, addressed back to the offending sender.
///
/// `by` names the entity reporting the error (the room, for chat failures).
pub fn presence_error(
    by: &BareJid,
    to: &Jid,
    id: Option<String>,
    condition: StanzaErrorCondition,
) -> Presence {
    let mut p = Presence::new(presence::Type::Error);
    p.from = Some(Jid::from(by.clone()));
    p.to = Some(to.clone());
    p.id = id;
    p.payloads
        .push(Element::from(condition.stanza_error(Some(Jid::from(by.clone())))));
    p
}

/// Build a message of type error, addressed back to the offending sender.
pub fn message_error(
    by: &BareJid,
    to: &Jid,
    id: Option<String>,
    condition: StanzaErrorCondition,
) -> Message {
    let mut m = Message::new(Some(to.clone()));
    m.from = Some(Jid::from(by.clone()));
    m.id = id;
    m.type_ = MessageType::Error;
    m.payloads
        .push(Element::from(condition.stanza_error(Some(Jid::from(by.clone())))));
    m
}

/// Build an IQ error response for a request stanza.
pub fn iq_error(
    id: &str,
    from: Option<Jid>,
    to: Option<Jid>,
    condition: StanzaErrorCondition,
) -> Iq {
    Iq {
        from,
        to,
        id: id.to_string(),
        payload: IqType::Error(condition.stanza_error(None)),
    }
}
