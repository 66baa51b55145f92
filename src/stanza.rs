//! Unified stanza type over the `xmpp_parsers` presence/message/iq models.
//!
//! The routing core moves whole stanzas between domain contexts without
//! caring which of the three kinds it is carrying; handlers are selected
//! by the stanza's *shape* (kind plus, for IQs, the payload namespace).

use jid::Jid;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;

/// One top-level XML unit exchanged over an XMPP stream.
#[derive(Debug, Clone)]
pub enum Stanza {
    Presence(Presence),
    Message(Message),
    Iq(Iq),
}

/// Classification of a stanza for handler lookup.
///
/// IQ requests are keyed by the namespace of their payload element; IQ
/// results and errors form their own shape because they are matched
/// against the pending-request table rather than a handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StanzaShape {
    Presence,
    Message,
    IqRequest(String),
    IqResponse,
}

impl Stanza {
    /// The destination address, if the stanza carries one.
    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Presence(p) => p.to.as_ref(),
            Stanza::Message(m) => m.to.as_ref(),
            Stanza::Iq(iq) => iq.to.as_ref(),
        }
    }

    /// The sender address, if the stanza carries one.
    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Presence(p) => p.from.as_ref(),
            Stanza::Message(m) => m.from.as_ref(),
            Stanza::Iq(iq) => iq.from.as_ref(),
        }
    }

    /// The stanza id. Always present on IQs, optional elsewhere.
    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Presence(p) => p.id.as_deref(),
            Stanza::Message(m) => m.id.as_deref(),
            Stanza::Iq(iq) => Some(&iq.id),
        }
    }

    /// Shape used for handler table lookup.
    pub fn shape(&self) -> StanzaShape {
        match self {
            Stanza::Presence(_) => StanzaShape::Presence,
            Stanza::Message(_) => StanzaShape::Message,
            Stanza::Iq(iq) => match &iq.payload {
                IqType::Get(elem) | IqType::Set(elem) => {
                    StanzaShape::IqRequest(elem.ns().to_string())
                }
                IqType::Result(_) | IqType::Error(_) => StanzaShape::IqResponse,
            },
        }
    }

    /// True for IQ stanzas of type result or error.
    pub fn is_iq_response(&self) -> bool {
        matches!(self.shape(), StanzaShape::IqResponse)
    }
}

impl From<Presence> for Stanza {
    fn from(p: Presence) -> Self {
        Stanza::Presence(p)
    }
}

impl From<Message> for Stanza {
    fn from(m: Message) -> Self {
        Stanza::Message(m)
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}
