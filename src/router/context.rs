//! Routing contexts: the per-domain view of the server.
//!
//! A [`RoutingContext`] answers two questions for its domain: how do we
//! deliver a stanza to an address there, and does the server itself want
//! to process a stanza addressed there. Configured domains get a
//! [`ServerContext`]; domains nobody configured resolve to a
//! [`RemoteContext`] stub that answers every request with
//! remote-server-not-found.

use std::sync::Arc;

use jid::Jid;
use tracing::debug;

use crate::dispatch::StanzaHandler;
use crate::error::{iq_error, presence_error, StanzaErrorCondition, XmppError};
use crate::registry::ResourceRegistry;
use crate::relay::{RefuseRelay, SessionRelay, StanzaRelay};
use crate::stanza::Stanza;

/// Per-domain routing surface.
pub trait RoutingContext: Send + Sync {
    /// The domain this context serves.
    fn domain(&self) -> &str;

    /// Delivery towards addresses in this domain.
    fn relay(&self) -> &dyn StanzaRelay;

    /// Handler this domain wants to run for the stanza, if any.
    fn handler(&self, stanza: &Stanza) -> Option<Arc<dyn StanzaHandler>>;

    /// Whether this context represents a domain served by this process.
    fn is_local(&self) -> bool {
        true
    }
}

/// A domain served directly by this server: stanzas addressed here are
/// delivered to bound sessions, and no handler intercepts them.
pub struct ServerContext {
    domain: String,
    relay: SessionRelay,
}

impl ServerContext {
    pub fn new(domain: impl Into<String>, registry: Arc<ResourceRegistry>) -> Self {
        Self {
            domain: domain.into(),
            relay: SessionRelay::new(registry),
        }
    }
}

impl RoutingContext for ServerContext {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn relay(&self) -> &dyn StanzaRelay {
        &self.relay
    }

    fn handler(&self, _stanza: &Stanza) -> Option<Arc<dyn StanzaHandler>> {
        None
    }
}

/// Stub context for a domain this deployment does not serve.
///
/// Federation is out of scope, so the stub refuses outbound delivery and
/// answers any stanza handed to it with remote-server-not-found through
/// the deployment's default relay.
pub struct RemoteContext {
    domain: String,
    relay: RefuseRelay,
    handler: Arc<RemoteDomainHandler>,
}

impl RemoteContext {
    pub fn new(domain: impl Into<String>, reply_relay: Arc<dyn StanzaRelay>) -> Self {
        let domain = domain.into();
        Self {
            relay: RefuseRelay::new(domain.clone()),
            handler: Arc::new(RemoteDomainHandler {
                domain: domain.clone(),
                reply_relay,
            }),
            domain,
        }
    }
}

impl RoutingContext for RemoteContext {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn relay(&self) -> &dyn StanzaRelay {
        &self.relay
    }

    fn handler(&self, _stanza: &Stanza) -> Option<Arc<dyn StanzaHandler>> {
        Some(self.handler.clone())
    }

    fn is_local(&self) -> bool {
        false
    }
}

struct RemoteDomainHandler {
    domain: String,
    reply_relay: Arc<dyn StanzaRelay>,
}

impl StanzaHandler for RemoteDomainHandler {
    fn name(&self) -> &'static str {
        "remote-domain"
    }

    fn session_required(&self) -> bool {
        false
    }

    fn verify(&self, _stanza: &Stanza) -> bool {
        true
    }

    fn execute(&self, stanza: &Stanza, from: &Jid) -> Result<Option<Stanza>, XmppError> {
        debug!(domain = %self.domain, %from, "answering stanza for unserved domain");
        let answer = match stanza {
            Stanza::Iq(iq) => Some(Stanza::Iq(iq_error(
                &iq.id,
                iq.to.clone(),
                Some(from.clone()),
                StanzaErrorCondition::RemoteServerNotFound,
            ))),
            Stanza::Presence(p) => {
                let by = match p.to.as_ref() {
                    Some(to) => to.to_bare(),
                    None => return Ok(None),
                };
                Some(Stanza::Presence(presence_error(
                    &by,
                    from,
                    p.id.clone(),
                    StanzaErrorCondition::RemoteServerNotFound,
                )))
            }
            Stanza::Message(_) => None,
        };
        if let Some(answer) = answer {
            if let Err(error) = self.reply_relay.deliver(from, &answer) {
                debug!(%error, "could not answer sender for unserved domain");
            }
        }
        Ok(None)
    }
}
