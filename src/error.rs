use crate::message_stream::NextMessageError;
use crate::server::ConnectionId;
use crate::utils::DynError;

/// Error returned when a message cannot be handed to a session.
///
/// Sending never reports transport failures. Those close the session and
/// are reported through [crate::OnClose].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The session is not open.
    #[error("Connection invalid")]
    ConnectionInvalid,
    /// No session with the given id is registered with the server.
    #[error("Connection id {0} invalid")]
    ConnectIdInvalid(ConnectionId),
    /// The payload is larger than the configured maximum.
    #[error("Payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: u32 },
}

/// Error returned by [crate::Peer::call].
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Failed to send request")]
    Send(
        #[source]
        #[from]
        Error,
    ),
    /// The session closed before the response arrived.
    #[error("Connection closed before the response arrived")]
    ConnectionClosed,
    #[error("No response within {0:?}")]
    Timeout(std::time::Duration),
}

/// Reason a session ended abnormally. Returned by [crate::Session::run].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No message received within {0:?}")]
    ReadTimeout(std::time::Duration),
    #[error("Writing a message took longer than {0:?}")]
    WriteTimeout(std::time::Duration),
    #[error("Peer idle for longer than {0:?}")]
    IdleTimeout(std::time::Duration),
    #[error("Failed to receive message")]
    Receive(#[source] NextMessageError),
    #[error("Failed to send message")]
    Send(#[source] DynError),
}
