//! WebSocket adapter: one JSON envelope per text (or UTF-8 binary) frame.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use futures::future::ready;
use futures::{SinkExt, StreamExt};
use nodecast_rpc::Envelope;

use super::{
    Connection, ConnectionEvent, EnvelopeSink, EventStream, TransportError, TransportKind, decode,
    with_lifecycle,
};

/// A connection upgraded on the WebSocket listener.
#[derive(Debug)]
pub struct WebSocketConnection {
    socket: WebSocket,
    peer: SocketAddr,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    pub fn new(socket: WebSocket, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

impl Connection for WebSocketConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn into_parts(self) -> (EventStream, EnvelopeSink) {
        let (ws_tx, ws_rx) = self.socket.split();

        let inbound = ws_rx
            .take_while(|frame| ready(!matches!(frame, Ok(Message::Close(_)))))
            .filter_map(|frame| ready(frame_to_event(frame)));

        let outbound = ws_tx
            .sink_map_err(TransportError::WebSocket)
            .with(|envelope: Envelope| {
                ready(
                    serde_json::to_string(&envelope)
                        .map(|text| Message::Text(text.into()))
                        .map_err(TransportError::Encode),
                )
            });

        (with_lifecycle(inbound), Box::pin(outbound))
    }
}

fn frame_to_event(frame: Result<Message, axum::Error>) -> Option<ConnectionEvent> {
    match frame {
        Ok(Message::Text(text)) => Some(decode(text.as_str())),
        Ok(Message::Binary(bytes)) => Some(match std::str::from_utf8(&bytes) {
            Ok(text) => decode(text),
            Err(_) => ConnectionEvent::Error(TransportError::NonUtf8),
        }),
        // Ping/pong are answered by the protocol layer; close ends the stream.
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => None,
        Err(e) => Some(ConnectionEvent::Error(TransportError::WebSocket(e))),
    }
}
