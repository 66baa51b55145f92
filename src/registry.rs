//! Bound-resource registry.
//!
//! Tracks which full JIDs currently have a live session and hands out the
//! delivery channel for each. Components can subscribe as [`BindListener`]s
//! to observe resources appearing and disappearing; the chat service uses
//! unbind notifications to clean up abandoned occupancies.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use jid::{BareJid, FullJid};
use tokio::sync::mpsc;
use tracing::debug;

use crate::stanza::Stanza;

/// Observer of resource bind / unbind events.
///
/// Both methods default to no-ops so listeners only implement the side
/// they care about.
pub trait BindListener: Send + Sync {
    fn resource_bound(&self, _jid: &FullJid) {}
    fn resource_unbound(&self, _jid: &FullJid) {}
}

struct BoundResource {
    jid: FullJid,
    sender: mpsc::UnboundedSender<Stanza>,
}

/// Registry of bound resources, keyed by bare JID.
#[derive(Default)]
pub struct ResourceRegistry {
    sessions: DashMap<BareJid, Vec<BoundResource>>,
    listeners: Mutex<Vec<Arc<dyn BindListener>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn BindListener>) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    /// Bind a resource and return the receiving end of its delivery channel.
    ///
    /// Binding the same full JID again replaces the previous channel.
    pub fn bind(&self, jid: FullJid) -> mpsc::UnboundedReceiver<Stanza> {
        let (tx, rx) = mpsc::unbounded_channel();
        let bare = jid.to_bare();
        {
            let mut entry = self.sessions.entry(bare).or_default();
            entry.retain(|r| r.jid != jid);
            entry.push(BoundResource {
                jid: jid.clone(),
                sender: tx,
            });
        }
        debug!(jid = %jid, "resource bound");
        self.notify(|l| l.resource_bound(&jid));
        rx
    }

    /// Remove a bound resource and notify listeners.
    pub fn unbind(&self, jid: &FullJid) {
        let bare = jid.to_bare();
        let mut removed = false;
        if let Some(mut entry) = self.sessions.get_mut(&bare) {
            let before = entry.len();
            entry.retain(|r| &r.jid != jid);
            removed = entry.len() != before;
        }
        self.sessions.remove_if(&bare, |_, resources| resources.is_empty());
        if removed {
            debug!(jid = %jid, "resource unbound");
            self.notify(|l| l.resource_unbound(jid));
        }
    }

    /// Delivery channel for an exact full JID.
    pub fn sender_for(&self, jid: &FullJid) -> Option<mpsc::UnboundedSender<Stanza>> {
        self.sessions
            .get(&jid.to_bare())
            .and_then(|entry| entry.iter().find(|r| &r.jid == jid).map(|r| r.sender.clone()))
    }

    /// Delivery channels for every resource bound under a bare JID.
    pub fn senders_for_bare(&self, bare: &BareJid) -> Vec<mpsc::UnboundedSender<Stanza>> {
        self.sessions
            .get(bare)
            .map(|entry| entry.iter().map(|r| r.sender.clone()).collect())
            .unwrap_or_default()
    }

    /// All full JIDs currently bound under a bare JID.
    pub fn resources_for(&self, bare: &BareJid) -> Vec<FullJid> {
        self.sessions
            .get(bare)
            .map(|entry| entry.iter().map(|r| r.jid.clone()).collect())
            .unwrap_or_default()
    }

    fn notify(&self, f: impl Fn(&Arc<dyn BindListener>)) {
        let listeners = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in &listeners {
            f(listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        bound: AtomicUsize,
        unbound: AtomicUsize,
    }

    impl BindListener for CountingListener {
        fn resource_bound(&self, _jid: &FullJid) {
            self.bound.fetch_add(1, Ordering::SeqCst);
        }
        fn resource_unbound(&self, _jid: &FullJid) {
            self.unbound.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn full(s: &str) -> FullJid {
        s.parse().unwrap()
    }

    #[test]
    fn test_bind_and_lookup() {
        let registry = ResourceRegistry::new();
        let _rx = registry.bind(full("alice@example.org/desk"));

        assert!(registry.sender_for(&full("alice@example.org/desk")).is_some());
        assert!(registry.sender_for(&full("alice@example.org/phone")).is_none());
        assert_eq!(
            registry.resources_for(&"alice@example.org".parse().unwrap()),
            vec![full("alice@example.org/desk")]
        );
    }

    #[test]
    fn test_unbind_notifies_listeners() {
        let registry = ResourceRegistry::new();
        let listener = Arc::new(CountingListener {
            bound: AtomicUsize::new(0),
            unbound: AtomicUsize::new(0),
        });
        registry.add_listener(listener.clone());

        let _rx = registry.bind(full("alice@example.org/desk"));
        registry.unbind(&full("alice@example.org/desk"));

        assert_eq!(listener.bound.load(Ordering::SeqCst), 1);
        assert_eq!(listener.unbound.load(Ordering::SeqCst), 1);
        assert!(registry.sender_for(&full("alice@example.org/desk")).is_none());
    }

    #[test]
    fn test_unbind_of_unknown_resource_is_silent() {
        let registry = ResourceRegistry::new();
        let listener = Arc::new(CountingListener {
            bound: AtomicUsize::new(0),
            unbound: AtomicUsize::new(0),
        });
        registry.add_listener(listener.clone());

        registry.unbind(&full("ghost@example.org/nowhere"));
        assert_eq!(listener.unbound.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_multiple_resources_per_bare_jid() {
        let registry = ResourceRegistry::new();
        let _a = registry.bind(full("alice@example.org/desk"));
        let _b = registry.bind(full("alice@example.org/phone"));

        let bare: BareJid = "alice@example.org".parse().unwrap();
        assert_eq!(registry.senders_for_bare(&bare).len(), 2);

        registry.unbind(&full("alice@example.org/desk"));
        assert_eq!(registry.senders_for_bare(&bare).len(), 1);
    }
}
