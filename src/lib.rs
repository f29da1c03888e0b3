//! Lightweight bidirectional RPC over ordered byte streams.
//!
//! Both sides of a connection exchange tagged [Message]s. A message is a
//! one-way notification, a request that expects a response, the response to
//! a request, a keepalive or a close notice. Application code reacts to
//! messages and connection lifecycle events through [Plugin]s.
//!
//! A [Server] accepts connections from a [Listener] and keeps a table of
//! open sessions addressed by [ConnectionId]. A [Client] connects through a
//! [Dialer]. Each connection is served by a [Session] which is driven by a
//! read loop, a single write loop and keepalive timers. [Peer] is the handle
//! used to send on a session.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use tagrpc::{Config, Message, OnMessage, Peer, Plugin, Server};
//!
//! struct Echo;
//!
//! impl OnMessage for Echo {
//!     fn on_message(&self, peer: &Peer, message: &Message) {
//!         let _ = peer.reply(message, message.payload().to_vec());
//!     }
//! }
//!
//! impl Plugin for Echo {
//!     fn as_on_message(&self) -> Option<&dyn OnMessage> {
//!         Some(self)
//!     }
//! }
//!
//! let server = Server::new(Config::default());
//! server.plugins().add(Arc::new(Echo));
//! let listener = async_std::net::TcpListener::bind("127.0.0.1:9000").await?;
//! server.serve(listener).await?;
//! # Ok(())
//! # }
//! ```
mod client;
mod config;
mod error;
mod message;
mod message_stream;
mod plugin;
mod request_table;
mod server;
mod session;
mod transport;
mod utils;

#[doc(inline)]
pub use client::Client;
#[doc(inline)]
pub use config::Config;
#[doc(inline)]
pub use error::{CallError, Error, SessionError};
#[doc(inline)]
pub use message::{Message, MessageParseError, MessageType};
#[doc(inline)]
pub use message_stream::{MessageStream, NextMessageError};
#[doc(inline)]
pub use plugin::{OnAccept, OnClose, OnMessage, OnOpen, Plugin, Plugins};
#[doc(inline)]
pub use request_table::{Callback, RequestTable};
#[doc(inline)]
pub use server::{ConnectionId, Server};
#[doc(inline)]
pub use session::{Peer, Role, Session, SessionState};
#[doc(inline)]
pub use transport::{BoxByteSink, BoxByteStream, Connection, Dialer, Listener, TcpDialer};
#[doc(inline)]
pub use utils::DynError;
