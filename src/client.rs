//! Provides [Client] which dials a server and serves the resulting session.
use anyhow::Context as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::error::{CallError, Error};
use crate::message::Message;
use crate::plugin::Plugins;
use crate::request_table::Callback;
use crate::session::{Peer, Role, Session, SessionState};
use crate::transport::Dialer;
use crate::utils::spawn_named;

/// Connects to a server with a [Dialer] and serves one session at a time.
///
/// Plugins receive [crate::OnOpen] when the connection is established and
/// [crate::OnClose] when the session ended. A closed client does not
/// reconnect on its own. Call [Client::reconnect] for that.
pub struct Client<D> {
    inner: Arc<Inner<D>>,
}

struct Inner<D> {
    dialer: D,
    config: Config,
    plugins: Arc<Plugins>,
    current: Mutex<Option<Peer>>,
    connecting: AtomicBool,
}

impl<D> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dialer> Client<D> {
    pub fn new(dialer: D, config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                dialer,
                config,
                plugins: Arc::new(Plugins::new()),
                current: Mutex::new(None),
                connecting: AtomicBool::new(false),
            }),
        }
    }

    /// Plugins that receive events for the sessions of this client.
    pub fn plugins(&self) -> &Arc<Plugins> {
        &self.inner.plugins
    }

    /// Dial the server and serve the session until it is closed.
    ///
    /// Fails right away if the client is already connected or connecting.
    pub async fn dial_and_serve(&self) -> anyhow::Result<()> {
        if self.inner.connecting.swap(true, Ordering::SeqCst) {
            anyhow::bail!("Client is already connecting");
        }
        let mut serving = Serving {
            inner: &self.inner,
            peer: None,
        };
        if self.peer().is_ok() {
            anyhow::bail!("Client is already connected");
        }
        let connection = self.inner.dialer.dial().await?;

        let session = Session::new(
            connection,
            self.inner.config.clone(),
            Arc::clone(&self.inner.plugins),
            Role::Initiator,
            None,
        );
        let peer = session.peer().clone();
        *self.current() = Some(peer.clone());
        serving.peer = Some(peer.clone());
        self.inner.connecting.store(false, Ordering::SeqCst);

        tracing::debug!("connected");
        self.inner.plugins.on_open(&peer);
        let result = session.run().await;
        drop(serving);
        result.context("Session failed")
    }

    /// Call [Client::dial_and_serve] after `delay` on a new task.
    pub fn reconnect(&self, delay: Duration) -> async_std::task::JoinHandle<anyhow::Result<()>> {
        let client = self.clone();
        spawn_named("client reconnect", async move {
            async_std::task::sleep(delay).await;
            tracing::debug!(?delay, "reconnecting");
            client.dial_and_serve().await
        })
    }

    /// Handle of the current session. Fails if the client is not connected.
    pub fn peer(&self) -> Result<Peer, Error> {
        self.current()
            .as_ref()
            .filter(|peer| peer.is_open())
            .cloned()
            .ok_or(Error::ConnectionInvalid)
    }

    pub fn state(&self) -> SessionState {
        if self.inner.connecting.load(Ordering::SeqCst) {
            return SessionState::Connecting;
        }
        match self.current().as_ref() {
            Some(peer) => peer.state(),
            None => SessionState::Closed,
        }
    }

    pub fn send(&self, message: Message) -> Result<(), Error> {
        self.peer()?.send(message)
    }

    pub fn push(&self, tag: u32, payload: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.peer()?.push(tag, payload)
    }

    pub fn request(
        &self,
        tag: u32,
        payload: impl Into<Vec<u8>>,
        callback: Option<Callback>,
    ) -> Result<u32, Error> {
        self.peer()?.request(tag, payload, callback)
    }

    pub async fn call(
        &self,
        tag: u32,
        payload: impl Into<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<Message, CallError> {
        let peer = self.peer()?;
        peer.call(tag, payload, timeout).await
    }

    /// Close the current session. Does nothing if the client is not connected.
    pub fn close(&self) {
        if let Ok(peer) = self.peer() {
            peer.close();
        }
    }

    fn current(&self) -> std::sync::MutexGuard<'_, Option<Peer>> {
        self.inner.current()
    }
}

impl<D> Inner<D> {
    fn current(&self) -> std::sync::MutexGuard<'_, Option<Peer>> {
        self.current.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// Resets the client when [Client::dial_and_serve] returns or its future is dropped.
///
/// Without a peer the dial did not finish and only the connecting flag is
/// cleared. With a peer the session is forgotten and [crate::OnClose] fires.
struct Serving<'a, D> {
    inner: &'a Inner<D>,
    peer: Option<Peer>,
}

impl<D> Drop for Serving<'_, D> {
    fn drop(&mut self) {
        match self.peer.take() {
            None => self.inner.connecting.store(false, Ordering::SeqCst),
            Some(peer) => {
                {
                    let mut current = self.inner.current();
                    if current.as_ref().map_or(false, |current| current.same_session(&peer)) {
                        *current = None;
                    }
                }
                self.inner.plugins.on_close(&peer);
            }
        }
    }
}

impl<D> std::fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("plugins", &self.inner.plugins)
            .field("connecting", &self.inner.connecting)
            .finish()
    }
}
