//! Transport-agnostic connection abstraction.
//!
//! Each adapter turns one physical session into a pair: a stream of
//! [`ConnectionEvent`]s and a sink of outbound [`Envelope`]s. Both adapters
//! emit `Connect` first, then any number of `Message` and `Error` events, then
//! `Close` exactly once. A fatal error is always the last event before
//! `Close`.

pub mod socket;
pub mod websocket;

use std::fmt;
use std::pin::Pin;

use futures::future::ready;
use futures::stream::{self, BoxStream};
use futures::{Sink, Stream, StreamExt};
use nodecast_rpc::Envelope;

pub use socket::SocketConnection;
pub use websocket::WebSocketConnection;

/// Which listener a connection came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Newline-delimited JSON over a raw TCP stream.
    Socket,
    /// One JSON message per WebSocket frame.
    WebSocket,
}

impl TransportKind {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport faults.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// An inbound line exceeded the frame limit and was discarded.
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge {
        /// Configured limit.
        limit: usize,
    },
    /// An inbound unit was not a valid envelope.
    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),
    /// A binary frame was not UTF-8.
    #[error("binary frame is not valid UTF-8")]
    NonUtf8,
    /// An outbound envelope could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    /// The WebSocket layer failed.
    #[error("websocket error: {0}")]
    WebSocket(#[source] axum::Error),
}

impl TransportError {
    /// Whether the connection cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::WebSocket(_))
    }
}

/// Lifecycle and data events of one connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The transport is ready. Always first.
    Connect,
    /// A decoded inbound envelope.
    Message(Envelope),
    /// A transport fault. Fatal faults end the stream.
    Error(TransportError),
    /// The transport closed. Always last.
    Close,
}

/// Inbound half of a connection.
pub type EventStream = BoxStream<'static, ConnectionEvent>;

/// Outbound half of a connection; encodes and frames each envelope.
pub type EnvelopeSink = Pin<Box<dyn Sink<Envelope, Error = TransportError> + Send>>;

/// One transport session, as seen by the session loop.
pub trait Connection: Send + 'static {
    /// Transport this connection came from.
    fn kind(&self) -> TransportKind;

    /// Remote address, for logging.
    fn peer(&self) -> String;

    /// Split into the event stream and the outbound sink.
    fn into_parts(self) -> (EventStream, EnvelopeSink);
}

/// Decode one inbound text unit.
pub(crate) fn decode(text: &str) -> ConnectionEvent {
    match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => ConnectionEvent::Message(envelope),
        Err(e) => ConnectionEvent::Error(TransportError::Decode(e)),
    }
}

/// Wrap adapter events in `Connect` … `Close`, ending after the first fatal
/// error.
pub(crate) fn with_lifecycle<S>(inbound: S) -> EventStream
where
    S: Stream<Item = ConnectionEvent> + Send + 'static,
{
    let body = inbound.scan(false, |done, event| {
        if *done {
            return ready(None);
        }
        if let ConnectionEvent::Error(e) = &event {
            *done = e.is_fatal();
        }
        ready(Some(event))
    });
    stream::once(ready(ConnectionEvent::Connect))
        .chain(body)
        .chain(stream::once(ready(ConnectionEvent::Close)))
        .boxed()
}
