//! Provides [Session] which serves one connection and [Peer] to send messages on it.
use futures::channel::{mpsc, oneshot};
use futures::future::Either;
use futures::prelude::*;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_futures::Instrument as _;

use crate::config::Config;
use crate::error::{CallError, Error, SessionError};
use crate::message::{Message, MessageType};
use crate::message_stream::MessageStream;
use crate::plugin::Plugins;
use crate::request_table::{Callback, RequestTable};
use crate::server::ConnectionId;
use crate::transport::{BoxByteSink, BoxByteStream, Connection};
use crate::utils::spawn_named;

/// Side of the connection a session serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that dialed. Sends keepalive messages and closes the session
    /// when the peer is idle.
    Initiator,
    /// The side that accepted. Echoes keepalive messages. Idle sessions are
    /// evicted by [crate::Server].
    Acceptor,
}

/// Lifecycle of a session. A closed session is never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

#[derive(Debug)]
enum Outbound {
    Message(Message),
    /// Ends the write loop after everything queued before has been written.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Local,
    Idle,
    WriteFailed,
}

/// Why the read loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    /// The peer sent a close message or ended the stream.
    Remote,
    /// The session was closed locally.
    Local,
    WriteFailed,
}

struct Shared {
    id: Option<ConnectionId>,
    state: AtomicU8,
    max_payload_len: u32,
    last_seen: Mutex<Instant>,
    requests: RequestTable,
    outbound: mpsc::UnboundedSender<Outbound>,
    stop: mpsc::UnboundedSender<Stop>,
}

impl Shared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst)
    }

    /// Move from `Open` to `Closing`. Returns `false` if the session was not open.
    fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Open as u8,
                SessionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|err| err.into_inner()) = Instant::now();
    }

    fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn stop(&self, stop: Stop) {
        let _ = self.stop.unbounded_send(stop);
    }
}

/// Handle to send messages on a session.
///
/// Cloning is cheap. All clones share the send queue and the request table of
/// the session. Messages are written in the order they were queued.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<Shared>,
}

impl Peer {
    /// Id assigned by the server. `None` on the client side.
    pub fn id(&self) -> Option<ConnectionId> {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Time the last message was received from the peer.
    pub fn last_seen(&self) -> Instant {
        self.shared.last_seen()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen().elapsed()
    }

    /// Number of requests that still wait for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.requests.len()
    }

    /// Queue `message` for sending.
    ///
    /// Fails with [Error::PayloadTooLarge] if the payload exceeds
    /// [Config::max_payload_len].
    pub fn send(&self, message: Message) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::ConnectionInvalid);
        }
        let max = self.shared.max_payload_len;
        if message.payload().len() > max as usize {
            return Err(Error::PayloadTooLarge {
                len: message.payload().len(),
                max,
            });
        }
        tracing::trace!(?message, "queue message");
        self.shared
            .outbound
            .unbounded_send(Outbound::Message(message))
            .map_err(|_| Error::ConnectionInvalid)
    }

    /// Send a one-way message.
    pub fn push(&self, tag: u32, payload: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.send(Message::one_way(tag, payload))
    }

    /// Send a request and return its request id.
    ///
    /// `callback` is called with the response. It is never called if the
    /// session closes first. Without a callback the request is sent with
    /// request id `0` and the peer does not reply.
    pub fn request(
        &self,
        tag: u32,
        payload: impl Into<Vec<u8>>,
        callback: Option<Callback>,
    ) -> Result<u32, Error> {
        if !self.is_open() {
            return Err(Error::ConnectionInvalid);
        }
        let request_id = self.shared.requests.next_request_id(callback);
        if let Err(err) = self.send(Message::request(tag, request_id, payload)) {
            self.shared.requests.cancel(request_id);
            return Err(err);
        }
        Ok(request_id)
    }

    /// Send a request and wait for the response.
    ///
    /// If `timeout` elapses first the request is forgotten and a late
    /// response is dropped.
    #[tracing::instrument(level = "debug", skip(self, payload))]
    pub async fn call(
        &self,
        tag: u32,
        payload: impl Into<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<Message, CallError> {
        let (sender, receiver) = oneshot::channel();
        let request_id = self.request(
            tag,
            payload,
            Some(Box::new(move |response: Message| {
                let _ = sender.send(response);
            })),
        )?;
        let response = match timeout {
            Some(timeout) => match async_std::future::timeout(timeout, receiver).await {
                Ok(response) => response,
                Err(_) => {
                    self.shared.requests.cancel(request_id);
                    return Err(CallError::Timeout(timeout));
                }
            },
            None => receiver.await,
        };
        response.map_err(|_canceled| CallError::ConnectionClosed)
    }

    /// Send the response for `request`.
    ///
    /// Does nothing if the sender of `request` does not expect a response.
    pub fn reply(&self, request: &Message, payload: impl Into<Vec<u8>>) -> Result<(), Error> {
        if !request.expects_reply() {
            tracing::debug!(?request, "not replying to message that expects no reply");
            return Ok(());
        }
        self.send(request.reply(payload))
    }

    /// Close the session.
    ///
    /// Sends a close message to the peer after all queued messages. Calling
    /// this more than once or on a closed session does nothing.
    pub fn close(&self) {
        if self.shared.begin_close() {
            tracing::debug!(id = ?self.shared.id, "closing session");
            let _ = self
                .shared
                .outbound
                .unbounded_send(Outbound::Message(Message::close(Vec::new())));
            let _ = self.shared.outbound.unbounded_send(Outbound::Shutdown);
            self.shared.stop(Stop::Local);
        }
    }

    /// Returns `true` if both handles belong to the same session.
    pub fn same_session(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Peer that is not attached to a session. Sending always fails.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (outbound, _) = mpsc::unbounded();
        let (stop, _) = mpsc::unbounded();
        Self {
            shared: Arc::new(Shared {
                id: None,
                state: AtomicU8::new(SessionState::Closed as u8),
                max_payload_len: Config::default().max_payload_len,
                last_seen: Mutex::new(Instant::now()),
                requests: RequestTable::new(),
                outbound,
                stop,
            }),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("requests", &self.shared.requests)
            .finish()
    }
}

/// Serves one connection until either side closes it.
///
/// A session runs a read loop, a write loop and, for [Role::Initiator], a
/// keepalive timer. The write loop is the only writer to the connection.
pub struct Session {
    peer: Peer,
    connection: Connection,
    config: Config,
    plugins: Arc<Plugins>,
    role: Role,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    stop: mpsc::UnboundedReceiver<Stop>,
}

impl Session {
    /// Create a session for an established connection.
    ///
    /// The session is open right away. Messages sent through [Session::peer]
    /// are queued until [Session::run] is called.
    pub fn new(
        connection: Connection,
        config: Config,
        plugins: Arc<Plugins>,
        role: Role,
        id: Option<ConnectionId>,
    ) -> Self {
        let (outbound_sender, outbound) = mpsc::unbounded();
        let (stop_sender, stop) = mpsc::unbounded();
        let shared = Arc::new(Shared {
            id,
            state: AtomicU8::new(SessionState::Open as u8),
            max_payload_len: config.max_payload_len,
            last_seen: Mutex::new(Instant::now()),
            requests: RequestTable::new(),
            outbound: outbound_sender,
            stop: stop_sender,
        });
        Self {
            peer: Peer { shared },
            connection,
            config,
            plugins,
            role,
            outbound,
            stop,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Run the session until it is closed.
    ///
    /// Returns `Ok(())` if the session was closed by either side or the
    /// connection ended cleanly. Once this returns the session is
    /// [SessionState::Closed] and pending request callbacks have been dropped.
    pub async fn run(self) -> Result<(), SessionError> {
        let span = tracing::debug_span!("session", id = ?self.peer.id(), role = ?self.role);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> Result<(), SessionError> {
        let Session {
            peer,
            connection,
            config,
            plugins,
            role,
            outbound,
            stop,
        } = self;
        let Connection { send, receive } = connection;

        let writer = spawn_named(
            "session writer",
            write_loop(Arc::clone(&peer.shared), send, outbound, config.clone()),
        );
        let keepalive = match role {
            Role::Initiator => Some(spawn_named(
                "session keepalive",
                keepalive_loop(peer.clone(), config.clone()),
            )),
            Role::Acceptor => None,
        };
        let teardown = Teardown {
            shared: Arc::clone(&peer.shared),
            writer: Some(writer),
            keepalive,
        };

        let read_result = read_loop(&peer, receive, stop, &config, &plugins, role).await;
        let write_result = teardown.finish().await;

        match read_result {
            Ok(Ended::Remote) => {
                // Messages queued after the peer closed may fail to be written.
                if let Err(error) = write_result {
                    tracing::debug!(%error, "failed to write after peer closed");
                }
                tracing::debug!("session closed by peer");
                Ok(())
            }
            Ok(Ended::Local) | Ok(Ended::WriteFailed) => {
                tracing::debug!("session closed");
                write_result
            }
            Err(error) => {
                tracing::info!(%error, "session closed");
                Err(error)
            }
        }
    }
}

/// Stops the writer and keepalive tasks and marks the session closed.
///
/// Runs on drop as well, so a [Session::run] future that is dropped early
/// still closes the session.
struct Teardown {
    shared: Arc<Shared>,
    writer: Option<async_std::task::JoinHandle<Result<(), SessionError>>>,
    keepalive: Option<async_std::task::JoinHandle<()>>,
}

impl Teardown {
    /// Wait until queued messages are written. Returns the result of the write loop.
    async fn finish(mut self) -> Result<(), SessionError> {
        self.shared.begin_close();
        let _ = self.shared.outbound.unbounded_send(Outbound::Shutdown);
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.cancel().await;
        }
        match self.writer.take() {
            Some(writer) => writer.await,
            None => Ok(()),
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            async_std::task::spawn(keepalive.cancel());
        }
        if self.writer.is_some() {
            tracing::debug!("session dropped while running");
            // The detached writer ends after the shutdown marker.
            self.shared.begin_close();
            let _ = self.shared.outbound.unbounded_send(Outbound::Shutdown);
        }
        self.shared.requests.clear();
        self.shared.set_state(SessionState::Closed);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("config", &self.config)
            .finish()
    }
}

/// Receive messages and dispatch them until the connection ends or the session is stopped.
async fn read_loop(
    peer: &Peer,
    receive: BoxByteStream,
    mut stop: mpsc::UnboundedReceiver<Stop>,
    config: &Config,
    plugins: &Plugins,
    role: Role,
) -> Result<Ended, SessionError> {
    let mut messages = MessageStream::with_max_payload_len(receive, config.max_payload_len);
    loop {
        let next_message = async {
            match config.read_timeout {
                Some(read_timeout) => async_std::future::timeout(read_timeout, messages.next())
                    .await
                    .map_err(|_| SessionError::ReadTimeout(read_timeout)),
                None => Ok(messages.next().await),
            }
        };
        futures::pin_mut!(next_message);

        let received = match future::select(stop.next(), next_message).await {
            Either::Left((stop, _)) => {
                return match stop {
                    Some(Stop::Idle) => Err(SessionError::IdleTimeout(config.idle_timeout)),
                    Some(Stop::WriteFailed) => Ok(Ended::WriteFailed),
                    Some(Stop::Local) | None => Ok(Ended::Local),
                }
            }
            Either::Right((received, _)) => received?,
        };

        let message = match received {
            None => {
                tracing::debug!("connection ended");
                return Ok(Ended::Remote);
            }
            Some(Err(error)) => return Err(SessionError::Receive(error)),
            Some(Ok(message)) => message,
        };

        peer.shared.touch();
        tracing::trace!(?message, "received message");
        match message.type_() {
            MessageType::Keep => {
                if role == Role::Acceptor {
                    let _ = peer.send(Message::keep());
                }
            }
            MessageType::Response => {
                peer.shared.requests.on_reply(message);
            }
            MessageType::Request | MessageType::OneWay => plugins.on_message(peer, &message),
            MessageType::Close => {
                tracing::debug!(
                    reason = %String::from_utf8_lossy(message.payload()),
                    "peer closed session"
                );
                return Ok(Ended::Remote);
            }
        }
    }
}

/// Write queued messages to `send` until [Outbound::Shutdown] is received.
async fn write_loop(
    shared: Arc<Shared>,
    mut send: BoxByteSink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    config: Config,
) -> Result<(), SessionError> {
    let result = write_messages(&mut send, &mut outbound, &config).await;
    if let Err(error) = &result {
        tracing::warn!(%error, "failed to write message");
        shared.stop(Stop::WriteFailed);
    }
    shared.begin_close();
    let close = send.close();
    let _ = match config.write_timeout {
        Some(write_timeout) => async_std::future::timeout(write_timeout, close)
            .await
            .unwrap_or(Ok(())),
        None => close.await,
    };
    result
}

async fn write_messages(
    send: &mut BoxByteSink,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    config: &Config,
) -> Result<(), SessionError> {
    let mut buffer = bytes::BytesMut::new();
    let mut last_flush = Instant::now();
    loop {
        let next = match config.flush_interval {
            Some(flush_interval) if !buffer.is_empty() => {
                let remaining = flush_interval
                    .checked_sub(last_flush.elapsed())
                    .unwrap_or_default();
                match async_std::future::timeout(remaining, outbound.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        write_buffer(send, &mut buffer, config.write_timeout).await?;
                        last_flush = Instant::now();
                        continue;
                    }
                }
            }
            _ => outbound.next().await,
        };

        match next {
            Some(Outbound::Message(message)) => {
                message.encode(&mut buffer);
                let flush_due = match config.flush_interval {
                    Some(flush_interval) => last_flush.elapsed() >= flush_interval,
                    None => true,
                };
                if flush_due {
                    write_buffer(send, &mut buffer, config.write_timeout).await?;
                    last_flush = Instant::now();
                }
            }
            Some(Outbound::Shutdown) | None => {
                if !buffer.is_empty() {
                    write_buffer(send, &mut buffer, config.write_timeout).await?;
                }
                return Ok(());
            }
        }
    }
}

async fn write_buffer(
    send: &mut BoxByteSink,
    buffer: &mut bytes::BytesMut,
    write_timeout: Option<Duration>,
) -> Result<(), SessionError> {
    let data = buffer.split().to_vec();
    let write = send.send(data);
    let result = match write_timeout {
        Some(write_timeout) => async_std::future::timeout(write_timeout, write)
            .await
            .map_err(|_| SessionError::WriteTimeout(write_timeout))?,
        None => write.await,
    };
    result.map_err(SessionError::Send)
}

/// Send keepalive messages and close the session once the peer has been idle for too long.
async fn keepalive_loop(peer: Peer, config: Config) {
    let mut ticks = async_std::stream::interval(config.keepalive_interval);
    while ticks.next().await.is_some() {
        if !peer.is_open() {
            break;
        }
        let idle = peer.idle_for();
        if idle > config.idle_timeout {
            tracing::warn!(?idle, "peer idle, closing session");
            peer.shared.stop(Stop::Idle);
            break;
        }
        let _ = peer.send(Message::keep());
    }
}
