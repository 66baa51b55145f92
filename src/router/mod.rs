//! Domain resolution and relay.
//!
//! [`DomainRouter`] maps destination domains to [`RoutingContext`]s. A
//! domain resolves to its configured context if one exists, else to the
//! context configured for the domain with its leftmost label removed
//! (so `conference.example.org` can fall back to `example.org` while the
//! conference component is still registering), else to a remote stub.
//! Every resolution outcome, stubs included, is memoized so repeated
//! lookups return the same context instance.

mod context;

pub use context::{RemoteContext, RoutingContext, ServerContext};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::relay::{DeliveryFailureStrategy, IgnoreFailure, RefuseRelay, StanzaRelay};
use crate::stanza::Stanza;

struct RouterState {
    configured: HashMap<String, Arc<dyn RoutingContext>>,
    resolved: HashMap<String, Arc<dyn RoutingContext>>,
    // Relay remote stubs use for answering senders; taken from the first
    // registered local context.
    default_relay: Option<Arc<dyn StanzaRelay>>,
}

/// Resolves destination domains and relays stanzas to them.
pub struct DomainRouter {
    state: Mutex<RouterState>,
}

impl Default for DomainRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainRouter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RouterState {
                configured: HashMap::new(),
                resolved: HashMap::new(),
                default_relay: None,
            }),
        }
    }

    /// Register a context for the domain it serves.
    ///
    /// Registration may happen after resolution has begun; a domain that
    /// previously resolved to a fallback or stub is rebound to the new
    /// context.
    pub fn register(&self, context: Arc<dyn RoutingContext>, relay: Arc<dyn StanzaRelay>) {
        let domain = context.domain().to_string();
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.default_relay.is_none() {
            state.default_relay = Some(relay);
        }
        state.resolved.insert(domain.clone(), context.clone());
        if state.configured.insert(domain.clone(), context).is_some() {
            warn!(%domain, "replacing registered routing context");
        } else {
            debug!(%domain, "registered routing context");
        }
    }

    /// Resolve a domain to its routing context. Never fails: unknown
    /// domains produce a memoized remote stub.
    pub fn resolve(&self, domain: &str) -> Arc<dyn RoutingContext> {
        let Ok(mut state) = self.state.lock() else {
            // Lock poisoning only happens after a panic elsewhere; serve a
            // throwaway stub rather than propagating it.
            return Arc::new(RemoteContext::new(domain, Arc::new(RefuseRelay::new(domain))));
        };

        if let Some(context) = state.resolved.get(domain) {
            return context.clone();
        }

        let context = state
            .configured
            .get(domain)
            .cloned()
            .or_else(|| {
                // A subdomain of a configured domain is served by that
                // domain until a component claims the subdomain itself.
                domain
                    .split_once('.')
                    .and_then(|(_, parent)| state.configured.get(parent).cloned())
            })
            .unwrap_or_else(|| {
                debug!(%domain, "resolving unserved domain to remote stub");
                let reply_relay = state
                    .default_relay
                    .clone()
                    .unwrap_or_else(|| Arc::new(RefuseRelay::new(domain)));
                Arc::new(RemoteContext::new(domain, reply_relay))
            });

        state.resolved.insert(domain.to_string(), context.clone());
        context
    }

    /// Relay a stanza to its destination address, ignoring delivery
    /// failures.
    pub fn relay(&self, stanza: Stanza) -> bool {
        self.relay_with(stanza, &IgnoreFailure)
    }

    /// Relay a stanza to its destination address, running `strategy` if
    /// delivery fails. Returns whether delivery succeeded.
    pub fn relay_with(&self, stanza: Stanza, strategy: &dyn DeliveryFailureStrategy) -> bool {
        let Some(to) = stanza.to().cloned() else {
            warn!("refusing to relay stanza without destination");
            return false;
        };
        let context = self.resolve(to.domain().as_str());
        match context.relay().deliver(&to, &stanza) {
            Ok(()) => true,
            Err(error) => {
                strategy.on_failure(&error, &stanza);
                false
            }
        }
    }
}
