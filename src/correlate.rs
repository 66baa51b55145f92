//! Correlation of IQ requests with their eventual result or error.
//!
//! A component that forwards an IQ on behalf of someone else registers a
//! continuation under the stanza id before sending. When a response with
//! that id arrives, the dispatcher consumes the entry and runs the
//! continuation instead of routing the response further. Each entry fires
//! at most once.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;
use xmpp_parsers::iq::Iq;

/// Continuation invoked with the matching response stanza.
pub type PendingIqHandler = Box<dyn FnOnce(Iq) + Send + 'static>;

/// Table of in-flight IQ requests, keyed by stanza id.
#[derive(Default)]
pub struct PendingIqTable {
    entries: Mutex<HashMap<String, PendingIqHandler>>,
}

impl PendingIqTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a continuation for the given stanza id, replacing any
    /// previous entry under the same id.
    pub fn register(&self, id: impl Into<String>, handler: PendingIqHandler) {
        let id = id.into();
        if let Ok(mut entries) = self.entries.lock() {
            if entries.insert(id.clone(), handler).is_some() {
                debug!(%id, "replaced pending iq continuation");
            }
        }
    }

    /// Remove and return the continuation for an id, if one is registered.
    pub fn consume(&self, id: &str) -> Option<PendingIqHandler> {
        self.entries.lock().ok()?.remove(id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().map(|e| e.is_empty()).unwrap_or(true)
    }
}
