//! Inbound stanza dispatch.
//!
//! Every inbound stanza flows through [`StanzaDispatcher::dispatch`]:
//! IQ responses are matched against the pending-request table first, then
//! the destination domain is resolved and the stanza is offered to that
//! context's handler table. A stanza no handler claims is delivered
//! directly to its destination address.

use std::collections::HashMap;
use std::sync::Arc;

use jid::{FullJid, Jid};
use tracing::{debug, warn};

use crate::correlate::PendingIqTable;
use crate::error::{iq_error, StanzaErrorCondition, XmppError};
use crate::router::DomainRouter;
use crate::stanza::{Stanza, StanzaShape};

/// A capability the server can apply to an inbound stanza.
///
/// Handlers are stateless with respect to the stream: they receive the
/// stanza and the already-resolved sender address, and may return one
/// stanza to write back to the originating session.
pub trait StanzaHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this handler only serves authenticated sessions.
    fn session_required(&self) -> bool {
        true
    }

    /// Cheap structural check that the stanza is really for this handler.
    fn verify(&self, stanza: &Stanza) -> bool;

    /// Process the stanza. `from` is the effective sender.
    fn execute(&self, stanza: &Stanza, from: &Jid) -> Result<Option<Stanza>, XmppError>;
}

/// Handler lookup table, keyed by stanza shape.
///
/// IQ requests resolve through their payload namespace; requests in a
/// namespace nobody registered fall through to the optional fallback
/// handler.
#[derive(Default)]
pub struct HandlerTable {
    presence: Option<Arc<dyn StanzaHandler>>,
    message: Option<Arc<dyn StanzaHandler>>,
    iq: HashMap<String, Arc<dyn StanzaHandler>>,
    iq_fallback: Option<Arc<dyn StanzaHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_presence(&mut self, handler: Arc<dyn StanzaHandler>) {
        self.presence = Some(handler);
    }

    pub fn set_message(&mut self, handler: Arc<dyn StanzaHandler>) {
        self.message = Some(handler);
    }

    pub fn register_iq(&mut self, namespace: impl Into<String>, handler: Arc<dyn StanzaHandler>) {
        self.iq.insert(namespace.into(), handler);
    }

    pub fn set_iq_fallback(&mut self, handler: Arc<dyn StanzaHandler>) {
        self.iq_fallback = Some(handler);
    }

    /// Select the handler for a stanza, if any claims it.
    pub fn select(&self, stanza: &Stanza) -> Option<Arc<dyn StanzaHandler>> {
        let candidate = match stanza.shape() {
            StanzaShape::Presence => self.presence.clone(),
            StanzaShape::Message => self.message.clone(),
            StanzaShape::IqRequest(ns) => self
                .iq
                .get(&ns)
                .cloned()
                .or_else(|| self.iq_fallback.clone()),
            StanzaShape::IqResponse => None,
        };
        candidate.filter(|handler| handler.verify(stanza))
    }
}

/// An authenticated client session, as far as dispatch is concerned.
#[derive(Debug, Clone)]
pub struct Session {
    pub jid: FullJid,
}

impl Session {
    pub fn new(jid: FullJid) -> Self {
        Self { jid }
    }
}

/// Routes inbound stanzas to handlers or to their destination.
pub struct StanzaDispatcher {
    router: Arc<DomainRouter>,
    pending: Arc<PendingIqTable>,
}

impl StanzaDispatcher {
    pub fn new(router: Arc<DomainRouter>, pending: Arc<PendingIqTable>) -> Self {
        Self { router, pending }
    }

    /// Process one inbound stanza.
    ///
    /// The returned stanza, if any, is the immediate answer to write back
    /// to the originating session.
    pub fn dispatch(&self, stanza: Stanza, session: Option<&Session>) -> Option<Stanza> {
        // IQ responses are answers to something this server forwarded;
        // the pending table owns them if anyone is still waiting.
        if stanza.is_iq_response() {
            if let Stanza::Iq(iq) = stanza {
                if let Some(handler) = self.pending.consume(&iq.id) {
                    handler(iq);
                } else {
                    self.router.relay(Stanza::Iq(iq));
                }
            }
            return None;
        }

        let to = match stanza.to() {
            Some(to) => to.clone(),
            None => {
                debug!("dropping stanza without destination");
                return None;
            }
        };

        let context = self.router.resolve(to.domain().as_str());
        let handler = match context.handler(&stanza) {
            Some(handler) => handler,
            None => {
                self.router.relay(stanza);
                return None;
            }
        };

        if handler.session_required() && session.is_none() {
            debug!(handler = handler.name(), "rejecting stanza from unbound stream");
            return self.reject(&stanza, StanzaErrorCondition::NotAuthorized);
        }

        let from = stanza
            .from()
            .cloned()
            .or_else(|| session.map(|s| Jid::from(s.jid.clone())));
        let from = match from {
            Some(from) => from,
            None => {
                debug!(handler = handler.name(), "stanza has no resolvable sender");
                return self.reject(&stanza, StanzaErrorCondition::JidMalformed);
            }
        };

        match handler.execute(&stanza, &from) {
            Ok(response) => response,
            Err(error) => {
                warn!(handler = handler.name(), %error, "stanza handler failed");
                self.reject(&stanza, StanzaErrorCondition::FeatureNotImplemented)
            }
        }
    }

    fn reject(&self, stanza: &Stanza, condition: StanzaErrorCondition) -> Option<Stanza> {
        match stanza {
            Stanza::Iq(iq) => Some(Stanza::Iq(iq_error(
                &iq.id,
                iq.to.clone(),
                iq.from.clone(),
                condition,
            ))),
            // Presence and message errors from the dispatch layer would
            // only invite retry loops; drop them.
            _ => None,
        }
    }
}
