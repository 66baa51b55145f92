//! Multi-tenant XMPP routing core with a XEP-0045 Multi-User Chat engine.
//!
//! The crate is organised around three seams:
//!
//! - [`router::DomainRouter`] resolves destination domains to routing
//!   contexts and relays stanzas between them
//! - [`dispatch::StanzaDispatcher`] feeds inbound stanzas to the handler
//!   a domain context claims for them
//! - [`muc::MucService`] is the conference component registered for the
//!   chat subdomain
//!
//! [`Engine`] wires all of it together for one deployment.

pub mod config;
pub mod correlate;
pub mod dispatch;
pub mod error;
pub mod muc;
pub mod registry;
pub mod relay;
pub mod router;
pub mod stanza;

use std::sync::Arc;

use tracing::info;

use config::ServerConfig;
use correlate::PendingIqTable;
use dispatch::StanzaDispatcher;
use muc::MucService;
use registry::ResourceRegistry;
use relay::{SessionRelay, StanzaRelay};
use router::{DomainRouter, ServerContext};

pub use error::XmppError;
pub use stanza::{Stanza, StanzaShape};

/// A fully wired server core: router, registry, pending-IQ table, the
/// conference service and the dispatcher, sharing one set of domains.
pub struct Engine {
    pub config: ServerConfig,
    pub router: Arc<DomainRouter>,
    pub registry: Arc<ResourceRegistry>,
    pub pending: Arc<PendingIqTable>,
    pub muc: Arc<MucService>,
    pub dispatcher: StanzaDispatcher,
}

impl Engine {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ResourceRegistry::new());
        let router = Arc::new(DomainRouter::new());
        let pending = Arc::new(PendingIqTable::new());

        let session_relay: Arc<dyn StanzaRelay> = Arc::new(SessionRelay::new(registry.clone()));
        router.register(
            Arc::new(ServerContext::new(config.domain.clone(), registry.clone())),
            session_relay.clone(),
        );
        for domain in &config.extra_domains {
            router.register(
                Arc::new(ServerContext::new(domain.clone(), registry.clone())),
                session_relay.clone(),
            );
        }

        let muc = MucService::new(config.muc_domain(), router.clone(), pending.clone());
        router.register(muc.clone(), session_relay);
        registry.add_listener(muc.bind_listener());

        let dispatcher = StanzaDispatcher::new(router.clone(), pending.clone());
        info!(domain = %config.domain, "engine assembled");

        Self {
            config,
            router,
            registry,
            pending,
            muc,
            dispatcher,
        }
    }
}
