//! Event dispatch to application plugins.
//!
//! A plugin is any type that implements [Plugin]. It opts into events by
//! implementing one or more of the capability traits [OnAccept], [OnOpen],
//! [OnClose] and [OnMessage] and returning itself from the matching
//! accessor on [Plugin].
//!
//! ```
//! use tagrpc::{Message, OnMessage, Peer, Plugin};
//!
//! struct Echo;
//!
//! impl OnMessage for Echo {
//!     fn on_message(&self, peer: &Peer, message: &Message) {
//!         if message.expects_reply() {
//!             let _ = peer.reply(message, message.payload().to_vec());
//!         }
//!     }
//! }
//!
//! impl Plugin for Echo {
//!     fn as_on_message(&self) -> Option<&dyn OnMessage> {
//!         Some(self)
//!     }
//! }
//! ```
use std::sync::{Arc, RwLock};

use crate::message::Message;
use crate::session::Peer;

/// Called by a server when it accepted a connection.
pub trait OnAccept {
    fn on_accept(&self, peer: &Peer);
}

/// Called by a client when it connected to a server.
pub trait OnOpen {
    fn on_open(&self, peer: &Peer);
}

/// Called once when a session has been closed.
///
/// Sending on `peer` fails at this point. The session may still be
/// [crate::SessionState::Closing] while queued messages are flushed, for
/// example when [crate::Server] evicts an idle session.
pub trait OnClose {
    fn on_close(&self, peer: &Peer);
}

/// Called for every received request and one-way message.
///
/// Handlers run on the read loop of the session. A handler that blocks
/// delays all following messages of the session.
pub trait OnMessage {
    fn on_message(&self, peer: &Peer, message: &Message);
}

/// Object that can be registered in [Plugins].
pub trait Plugin: Send + Sync + 'static {
    fn as_on_accept(&self) -> Option<&dyn OnAccept> {
        None
    }

    fn as_on_open(&self) -> Option<&dyn OnOpen> {
        None
    }

    fn as_on_close(&self) -> Option<&dyn OnClose> {
        None
    }

    fn as_on_message(&self) -> Option<&dyn OnMessage> {
        None
    }
}

/// Ordered collection of [Plugin]s.
///
/// Dispatch iterates over a snapshot of the plugins, so plugins may be added
/// or removed from within an event handler.
#[derive(Default)]
pub struct Plugins {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
}

impl Plugins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `plugin` to the collection.
    pub fn add(&self, plugin: Arc<dyn Plugin>) {
        self.write().push(plugin);
    }

    /// Remove all entries that point to the same object as `plugin`.
    pub fn remove(&self, plugin: &Arc<dyn Plugin>) {
        // Compare data pointers only. Vtable pointers of the same type may differ.
        let target = Arc::as_ptr(plugin) as *const ();
        self.write().retain(|p| Arc::as_ptr(p) as *const () != target);
    }

    /// Call `f` for every plugin in registration order.
    pub fn range(&self, mut f: impl FnMut(&dyn Plugin)) {
        let snapshot = self.read().clone();
        for plugin in snapshot.iter() {
            f(plugin.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub(crate) fn on_accept(&self, peer: &Peer) {
        self.range(|plugin| {
            if let Some(plugin) = plugin.as_on_accept() {
                plugin.on_accept(peer)
            }
        })
    }

    pub(crate) fn on_open(&self, peer: &Peer) {
        self.range(|plugin| {
            if let Some(plugin) = plugin.as_on_open() {
                plugin.on_open(peer)
            }
        })
    }

    pub(crate) fn on_close(&self, peer: &Peer) {
        self.range(|plugin| {
            if let Some(plugin) = plugin.as_on_close() {
                plugin.on_close(peer)
            }
        })
    }

    pub(crate) fn on_message(&self, peer: &Peer, message: &Message) {
        self.range(|plugin| {
            if let Some(plugin) = plugin.as_on_message() {
                plugin.on_message(peer, message)
            }
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn Plugin>>> {
        self.plugins.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn Plugin>>> {
        self.plugins.write().unwrap_or_else(|err| err.into_inner())
    }
}

impl std::fmt::Debug for Plugins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugins").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl OnOpen for Recorder {
        fn on_open(&self, _peer: &Peer) {
            self.log.lock().unwrap().push(format!("{} open", self.name));
        }
    }

    impl OnMessage for Recorder {
        fn on_message(&self, _peer: &Peer, message: &Message) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{} message {}", self.name, message.tag()));
        }
    }

    struct OpenOnly(Recorder);

    impl Plugin for OpenOnly {
        fn as_on_open(&self) -> Option<&dyn OnOpen> {
            Some(&self.0)
        }
    }

    struct OpenAndMessage(Recorder);

    impl Plugin for OpenAndMessage {
        fn as_on_open(&self) -> Option<&dyn OnOpen> {
            Some(&self.0)
        }

        fn as_on_message(&self) -> Option<&dyn OnMessage> {
            Some(&self.0)
        }
    }

    struct Nothing;

    impl Plugin for Nothing {}

    #[test]
    fn dispatch_by_capability_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plugins = Plugins::new();
        plugins.add(Arc::new(OpenAndMessage(Recorder {
            name: "a",
            log: log.clone(),
        })));
        plugins.add(Arc::new(Nothing));
        plugins.add(Arc::new(OpenOnly(Recorder {
            name: "b",
            log: log.clone(),
        })));

        let peer = Peer::detached();
        plugins.on_open(&peer);
        plugins.on_message(&peer, &Message::one_way(7, Vec::new()));
        plugins.on_close(&peer);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a open", "b open", "a message 7"]
        );
    }

    #[test]
    fn remove_by_identity() {
        let plugins = Plugins::new();
        let first: Arc<dyn Plugin> = Arc::new(Nothing);
        let second: Arc<dyn Plugin> = Arc::new(Nothing);
        plugins.add(first.clone());
        plugins.add(second.clone());
        plugins.remove(&first);
        assert_eq!(plugins.len(), 1);
        plugins.remove(&first);
        assert_eq!(plugins.len(), 1);
        plugins.remove(&second);
        assert!(plugins.is_empty());
    }

    struct AddsAnother(Arc<Plugins>);

    impl OnOpen for AddsAnother {
        fn on_open(&self, _peer: &Peer) {
            self.0.add(Arc::new(Nothing));
        }
    }

    impl Plugin for AddsAnother {
        fn as_on_open(&self) -> Option<&dyn OnOpen> {
            Some(self)
        }
    }

    #[test]
    fn add_during_dispatch() {
        let plugins = Arc::new(Plugins::new());
        plugins.add(Arc::new(AddsAnother(plugins.clone())));
        plugins.on_open(&Peer::detached());
        assert_eq!(plugins.len(), 2);
    }

    #[test]
    fn remove_with_separately_coerced_handle() {
        let plugins = Plugins::new();
        let nothing = Arc::new(Nothing);
        plugins.add(nothing.clone());
        let handle: Arc<dyn Plugin> = nothing;
        plugins.remove(&handle);
        assert!(plugins.is_empty());
    }

    struct RemovesOther {
        plugins: Arc<Plugins>,
        other: Arc<dyn Plugin>,
    }

    impl OnMessage for RemovesOther {
        fn on_message(&self, _peer: &Peer, _message: &Message) {
            self.plugins.remove(&self.other);
        }
    }

    impl Plugin for RemovesOther {
        fn as_on_message(&self) -> Option<&dyn OnMessage> {
            Some(self)
        }
    }

    #[test]
    fn remove_during_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plugins = Arc::new(Plugins::new());
        let other: Arc<dyn Plugin> = Arc::new(OpenAndMessage(Recorder {
            name: "b",
            log: log.clone(),
        }));
        plugins.add(Arc::new(RemovesOther {
            plugins: plugins.clone(),
            other: other.clone(),
        }));
        plugins.add(other);

        let peer = Peer::detached();
        // The running dispatch still reaches the removed plugin.
        plugins.on_message(&peer, &Message::one_way(1, Vec::new()));
        assert_eq!(plugins.len(), 1);
        plugins.on_message(&peer, &Message::one_way(2, Vec::new()));

        assert_eq!(*log.lock().unwrap(), vec!["b message 1"]);
    }
}
