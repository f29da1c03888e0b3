//! Provides [Server] which accepts connections and keeps a table of open sessions.
use futures::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::config::Config;
use crate::error::{CallError, Error};
use crate::message::Message;
use crate::plugin::Plugins;
use crate::request_table::Callback;
use crate::session::{Peer, Role, Session};
use crate::transport::{Connection, Listener};
use crate::utils::spawn_named;

/// Identifies a session registered with a [Server].
pub type ConnectionId = u64;

/// Accepts connections and serves a session for each of them.
///
/// Cloning is cheap and all clones share the same session table. Plugins
/// receive [crate::OnAccept] when a session is registered and
/// [crate::OnClose] once when it is removed.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    plugins: Arc<Plugins>,
    // Sweeps and id listings iterate the table, which `CHashMap` cannot do.
    sessions: RwLock<HashMap<ConnectionId, Peer>>,
    last_id: Mutex<ConnectionId>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                plugins: Arc::new(Plugins::new()),
                sessions: RwLock::new(HashMap::new()),
                last_id: Mutex::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Plugins that receive events for all sessions of this server.
    pub fn plugins(&self) -> &Arc<Plugins> {
        &self.inner.plugins
    }

    /// Accept connections from `listener` and serve them until accepting fails.
    ///
    /// Also evicts idle sessions every [Config::sweep_interval]. Sessions
    /// that are already running keep running after this returns.
    pub async fn serve(&self, listener: impl Listener) -> std::io::Result<()> {
        let sweeper = spawn_named("server sweep", {
            let server = self.clone();
            async move {
                let mut ticks = async_std::stream::interval(server.inner.config.sweep_interval);
                while ticks.next().await.is_some() {
                    server.sweep_idle();
                }
            }
        });

        let result = loop {
            match listener.accept().await {
                Ok(connection) => {
                    let server = self.clone();
                    spawn_named("server connection", async move {
                        server.handle_connection(connection).await
                    });
                }
                Err(error) => {
                    tracing::error!(%error, "failed to accept connection");
                    break Err(error);
                }
            }
        };
        sweeper.cancel().await;
        result
    }

    /// Register `connection` and serve it until the session closes.
    ///
    /// The session is removed from the table afterwards.
    pub async fn handle_connection(&self, connection: Connection) {
        let (id, session) = self.add_client(connection);
        let _registered = Registered { server: self, id };
        if let Err(error) = session.run().await {
            tracing::info!(id, %error, "session ended with error");
        }
    }

    /// Register a session for `connection` and notify [crate::OnAccept] plugins.
    ///
    /// The returned session must be run by the caller. Use
    /// [Server::handle_connection] to do both.
    pub fn add_client(&self, connection: Connection) -> (ConnectionId, Session) {
        let mut sessions = self.write_sessions();
        let id = {
            let mut last_id = self.inner.last_id.lock().unwrap_or_else(|err| err.into_inner());
            loop {
                *last_id = last_id.wrapping_add(1);
                if *last_id != 0 && !sessions.contains_key(&*last_id) {
                    break *last_id;
                }
            }
        };
        let session = Session::new(
            connection,
            self.inner.config.clone(),
            Arc::clone(&self.inner.plugins),
            Role::Acceptor,
            Some(id),
        );
        let peer = session.peer().clone();
        sessions.insert(id, peer.clone());
        drop(sessions);

        tracing::debug!(id, "client added");
        self.inner.plugins.on_accept(&peer);
        (id, session)
    }

    /// Remove the session from the table, close it and notify [crate::OnClose] plugins.
    ///
    /// Returns `false` and does nothing if no session with `id` is registered.
    pub fn remove_client(&self, id: ConnectionId) -> bool {
        let peer = match self.write_sessions().remove(&id) {
            Some(peer) => peer,
            None => return false,
        };
        peer.close();
        tracing::debug!(id, "client removed");
        self.inner.plugins.on_close(&peer);
        true
    }

    /// Remove all sessions that have not received anything for [Config::idle_timeout].
    ///
    /// Returns the ids of the removed sessions.
    pub fn sweep_idle(&self) -> Vec<ConnectionId> {
        let idle_timeout = self.inner.config.idle_timeout;
        let idle = self
            .read_sessions()
            .iter()
            .filter(|(_, peer)| peer.idle_for() > idle_timeout)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in idle.iter() {
            tracing::info!(id, "evicting idle client");
            self.remove_client(*id);
        }
        idle
    }

    pub fn peer(&self, id: ConnectionId) -> Result<Peer, Error> {
        self.read_sessions()
            .get(&id)
            .cloned()
            .ok_or(Error::ConnectIdInvalid(id))
    }

    pub fn send(&self, id: ConnectionId, message: Message) -> Result<(), Error> {
        self.peer(id)?.send(message)
    }

    pub fn push(&self, id: ConnectionId, tag: u32, payload: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.peer(id)?.push(tag, payload)
    }

    pub fn request(
        &self,
        id: ConnectionId,
        tag: u32,
        payload: impl Into<Vec<u8>>,
        callback: Option<Callback>,
    ) -> Result<u32, Error> {
        self.peer(id)?.request(tag, payload, callback)
    }

    pub async fn call(
        &self,
        id: ConnectionId,
        tag: u32,
        payload: impl Into<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<Message, CallError> {
        let peer = self.peer(id)?;
        peer.call(tag, payload, timeout).await
    }

    /// Close the session with `id`. It is removed from the table once its run loop ends.
    pub fn close(&self, id: ConnectionId) -> Result<(), Error> {
        self.peer(id)?.close();
        Ok(())
    }

    /// Ids of all registered sessions in ascending order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids = self.read_sessions().keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.read_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_sessions().is_empty()
    }

    fn read_sessions(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ConnectionId, Peer>> {
        self.inner.sessions.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write_sessions(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ConnectionId, Peer>> {
        self.inner.sessions.write().unwrap_or_else(|err| err.into_inner())
    }
}

/// Removes the session from the table when dropped.
struct Registered<'a> {
    server: &'a Server,
    id: ConnectionId,
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        self.server.remove_client(self.id);
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("plugins", &self.inner.plugins)
            .field("sessions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plugin::{OnAccept, OnClose, Plugin};
    use crate::session::SessionState;
    use futures::channel::mpsc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        accepted: AtomicUsize,
        closed: AtomicUsize,
    }

    impl OnAccept for Counter {
        fn on_accept(&self, _peer: &Peer) {
            self.accepted.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl OnClose for Counter {
        fn on_close(&self, peer: &Peer) {
            assert!(!peer.is_open());
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Plugin for Counter {
        fn as_on_accept(&self) -> Option<&dyn OnAccept> {
            Some(self)
        }

        fn as_on_close(&self) -> Option<&dyn OnClose> {
            Some(self)
        }
    }

    fn pending_connection() -> (Connection, mpsc::UnboundedSender<Vec<u8>>) {
        let (in_sender, in_receiver) = mpsc::unbounded::<Vec<u8>>();
        let (out_sender, _) = mpsc::unbounded::<Vec<u8>>();
        (
            Connection::new(out_sender, in_receiver.map(Ok::<_, std::io::Error>)),
            in_sender,
        )
    }

    #[test]
    fn ids_are_unique_and_start_at_one() {
        let server = Server::new(Config::default());
        let (first, _session1) = server.add_client(pending_connection().0);
        let (second, _session2) = server.add_client(pending_connection().0);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(server.connection_ids(), vec![1, 2]);
    }

    #[test]
    fn skips_ids_in_use_after_wrap() {
        let server = Server::new(Config::default());
        let (first, _session1) = server.add_client(pending_connection().0);
        *server.inner.last_id.lock().unwrap() = ConnectionId::MAX;
        let (second, _session2) = server.add_client(pending_connection().0);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn remove_client_is_idempotent() {
        let server = Server::new(Config::default());
        let counter = Arc::new(Counter::default());
        server.plugins().add(counter.clone());

        let (id, session) = server.add_client(pending_connection().0);
        assert_eq!(counter.accepted.load(Ordering::SeqCst), 1);

        assert!(server.remove_client(id));
        assert!(!server.remove_client(id));
        assert_eq!(counter.closed.load(Ordering::SeqCst), 1);
        assert_eq!(session.peer().state(), SessionState::Closing);
        assert!(server.is_empty());
    }

    #[test]
    fn unknown_id_is_rejected() {
        let server = Server::new(Config::default());
        assert_eq!(server.push(9, 1, Vec::new()), Err(Error::ConnectIdInvalid(9)));
        assert_eq!(
            server.send(9, Message::keep()),
            Err(Error::ConnectIdInvalid(9))
        );
        assert_eq!(
            server.request(9, 1, Vec::new(), None),
            Err(Error::ConnectIdInvalid(9))
        );
        assert_eq!(server.close(9), Err(Error::ConnectIdInvalid(9)));
        let result = async_std::task::block_on(server.call(9, 1, Vec::new(), None));
        assert!(matches!(
            result,
            Err(CallError::Send(Error::ConnectIdInvalid(9)))
        ));
    }

    #[test]
    fn sweep_removes_idle_sessions_only() {
        let server = Server::new(Config {
            idle_timeout: Duration::from_millis(50),
            ..Config::default()
        });
        let counter = Arc::new(Counter::default());
        server.plugins().add(counter.clone());

        let (idle, _idle_session) = server.add_client(pending_connection().0);
        std::thread::sleep(Duration::from_millis(100));
        let (fresh, _fresh_session) = server.add_client(pending_connection().0);

        assert_eq!(server.sweep_idle(), vec![idle]);
        assert_eq!(server.connection_ids(), vec![fresh]);
        assert_eq!(counter.closed.load(Ordering::SeqCst), 1);
    }

    #[async_std::test]
    async fn closing_session_removes_it() {
        let server = Server::new(Config::default());
        let counter = Arc::new(Counter::default());
        server.plugins().add(counter.clone());

        let (connection, in_sender) = pending_connection();
        let handle = async_std::task::spawn({
            let server = server.clone();
            async move { server.handle_connection(connection).await }
        });
        while server.is_empty() {
            async_std::task::sleep(Duration::from_millis(5)).await;
        }
        drop(in_sender);
        handle.await;

        assert!(server.is_empty());
        assert_eq!(counter.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(counter.closed.load(Ordering::SeqCst), 1);
    }

    #[async_std::test]
    async fn dropped_handler_removes_session() {
        let server = Server::new(Config {
            read_timeout: None,
            ..Config::default()
        });
        let counter = Arc::new(Counter::default());
        server.plugins().add(counter.clone());

        let (connection, _in_sender) = pending_connection();
        let result = async_std::future::timeout(
            Duration::from_millis(50),
            server.handle_connection(connection),
        )
        .await;
        assert!(result.is_err());
        assert!(server.is_empty());
        assert_eq!(counter.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(counter.closed.load(Ordering::SeqCst), 1);
    }
}
