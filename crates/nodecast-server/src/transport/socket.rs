//! Raw TCP adapter: one JSON envelope per `\n`-terminated line.

use std::net::SocketAddr;

use bytes::BytesMut;
use futures::StreamExt;
use futures::future::ready;
use nodecast_rpc::Envelope;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use super::{
    Connection, ConnectionEvent, EnvelopeSink, EventStream, TransportError, TransportKind, decode,
    with_lifecycle,
};

/// A connection accepted on the raw-stream listener.
#[derive(Debug)]
pub struct SocketConnection {
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_bytes: usize,
}

impl SocketConnection {
    /// Wrap an accepted stream. Inbound lines longer than `max_frame_bytes`
    /// are discarded and reported as non-fatal errors.
    pub fn new(stream: TcpStream, peer: SocketAddr, max_frame_bytes: usize) -> Self {
        Self {
            stream,
            peer,
            max_frame_bytes,
        }
    }
}

impl Connection for SocketConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn into_parts(self) -> (EventStream, EnvelopeSink) {
        let limit = self.max_frame_bytes;
        let (read_half, write_half) = self.stream.into_split();

        let inbound = FramedRead::new(read_half, EnvelopeLines::new(limit)).filter_map(move |line| {
            ready(match line {
                Ok(Line::Text(text)) if text.trim().is_empty() => None,
                Ok(Line::Text(text)) => Some(decode(&text)),
                Ok(Line::Oversized) => Some(ConnectionEvent::Error(TransportError::FrameTooLarge {
                    limit,
                })),
                Err(e) => Some(ConnectionEvent::Error(TransportError::Io(e))),
            })
        });
        let outbound = FramedWrite::new(write_half, EnvelopeLines::new(limit));

        (with_lifecycle(inbound), Box::pin(outbound))
    }
}

/// One inbound unit from [`EnvelopeLines`].
enum Line {
    Text(String),
    Oversized,
}

/// Newline framing for envelopes.
///
/// Decoding reports an over-long line as an item instead of an error, so the
/// framed stream keeps reading after discarding it. Encoding writes one
/// JSON envelope per line.
struct EnvelopeLines {
    inner: LinesCodec,
}

impl EnvelopeLines {
    fn new(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn lift(
        result: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Line>, std::io::Error> {
        match result {
            Ok(line) => Ok(line.map(Line::Text)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Line::Oversized)),
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for EnvelopeLines {
    type Item = Line;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, std::io::Error> {
        Self::lift(self.inner.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, std::io::Error> {
        Self::lift(self.inner.decode_eof(buf))
    }
}

impl Encoder<Envelope> for EnvelopeLines {
    type Error = TransportError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), TransportError> {
        let line = serde_json::to_string(&envelope).map_err(TransportError::Encode)?;
        self.inner.encode(line, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => TransportError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => TransportError::FrameTooLarge {
                limit: self.inner.max_length(),
            },
        })
    }
}
