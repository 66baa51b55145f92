//! Stanza delivery seams.
//!
//! [`StanzaRelay`] is the narrow interface a routing context exposes for
//! putting a stanza on the wire towards one address. [`DeliveryFailureStrategy`]
//! lets callers decide what a failed delivery means: the core ignores
//! failures, while the chat service evicts unreachable occupants.

use std::fmt;
use std::sync::Arc;

use jid::Jid;
use thiserror::Error;
use tracing::debug;

use crate::registry::ResourceRegistry;
use crate::stanza::Stanza;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no session bound for {0}")]
    NoSession(Jid),
    #[error("relaying to domain {0} is not supported")]
    NotRelaying(String),
    #[error("delivery channel closed for {0}")]
    ChannelClosed(Jid),
}

/// Outbound delivery towards one address.
pub trait StanzaRelay: Send + Sync {
    fn deliver(&self, to: &Jid, stanza: &Stanza) -> Result<(), DeliveryError>;
}

/// Decides what to do when a delivery fails.
pub trait DeliveryFailureStrategy: Send + Sync {
    fn on_failure(&self, error: &DeliveryError, stanza: &Stanza);
}

/// Failure strategy that logs and moves on.
pub struct IgnoreFailure;

impl DeliveryFailureStrategy for IgnoreFailure {
    fn on_failure(&self, error: &DeliveryError, _stanza: &Stanza) {
        debug!(%error, "stanza delivery failed");
    }
}

/// Delivers to locally bound sessions through the resource registry.
///
/// A full JID goes to that exact resource; a bare JID fans out to every
/// resource bound under it.
pub struct SessionRelay {
    registry: Arc<ResourceRegistry>,
}

impl SessionRelay {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self { registry }
    }
}

impl StanzaRelay for SessionRelay {
    fn deliver(&self, to: &Jid, stanza: &Stanza) -> Result<(), DeliveryError> {
        match to.clone().try_into_full() {
            Ok(full) => {
                let sender = self
                    .registry
                    .sender_for(&full)
                    .ok_or_else(|| DeliveryError::NoSession(to.clone()))?;
                sender
                    .send(stanza.clone())
                    .map_err(|_| DeliveryError::ChannelClosed(to.clone()))
            }
            Err(bare) => {
                let senders = self.registry.senders_for_bare(&bare);
                if senders.is_empty() {
                    return Err(DeliveryError::NoSession(to.clone()));
                }
                for sender in senders {
                    // A closed channel here means the session is mid-teardown;
                    // the unbind notification will follow.
                    let _ = sender.send(stanza.clone());
                }
                Ok(())
            }
        }
    }
}

/// Relay for domains this deployment does not serve. Every delivery fails.
pub struct RefuseRelay {
    domain: String,
}

impl RefuseRelay {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }
}

impl fmt::Debug for RefuseRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefuseRelay").field("domain", &self.domain).finish()
    }
}

impl StanzaRelay for RefuseRelay {
    fn deliver(&self, _to: &Jid, _stanza: &Stanza) -> Result<(), DeliveryError> {
        Err(DeliveryError::NotRelaying(self.domain.clone()))
    }
}
