//! Newline-delimited JSON codec for worker communication.
//!
//! One UTF-8 JSON object per line over the worker's stdin/stdout. Wraps
//! LinesCodec for line framing (partial lines are buffered across chunk
//! boundaries) and adds serde_json serialization.
//!
//! A line that fails JSON parsing is yielded as [`Decoded::Malformed`]
//! rather than a stream error, so one bad line never tears down the read
//! loop or blocks the lines behind it.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Result of decoding one line from the worker's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// A well-formed protocol message.
    Message(T),
    /// A completed line that was not valid JSON or not a known message
    /// type. Reported upstream, then dropped.
    Malformed { line: String, error: String },
}

/// Codec that frames messages with newlines and serializes with JSON.
pub struct NdJsonCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for NdJsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NdJsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new(),
            _phantom: PhantomData,
        }
    }

    fn parse(line: String) -> Decoded<T>
    where
        T: DeserializeOwned,
    {
        match serde_json::from_str(&line) {
            Ok(msg) => Decoded::Message(msg),
            Err(e) => Decoded::Malformed {
                error: e.to_string(),
                line,
            },
        }
    }
}

fn lines_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "max line length exceeded")
        }
    }
}

impl<T: DeserializeOwned> Decoder for NdJsonCodec<T> {
    type Item = Decoded<T>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src).map_err(lines_error)? {
            Some(line) => Ok(Some(Self::parse(line))),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Flush a trailing line the worker never terminated before exiting.
        match self.inner.decode_eof(src).map_err(lines_error)? {
            Some(line) => Ok(Some(Self::parse(line))),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for NdJsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        self.inner.encode(json, dst).map_err(lines_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::protocol::{WorkerMessage, WorkerRequest};

    fn decode_all(codec: &mut NdJsonCodec<WorkerMessage>, buf: &mut BytesMut) -> Vec<Decoded<WorkerMessage>> {
        let mut out = Vec::new();
        while let Some(item) = codec.decode(buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = NdJsonCodec::<WorkerRequest>::new();
        let mut buf = BytesMut::new();

        let req = WorkerRequest::new("stop", "req-1");
        codec.encode(req, &mut buf).unwrap();

        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
    }

    #[test]
    fn decode_buffers_partial_lines_across_chunks() {
        let mut codec = NdJsonCodec::<WorkerMessage>::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"{\"type\":\"ready\",\"req");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"uestId\":\"init\"}\n{\"type\":\"token\",");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Decoded::Message(WorkerMessage::Ready { .. })));
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\"requestId\":\"r1\",\"text\":\"hi\"}\n");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Decoded::Message(WorkerMessage::Token { .. })));
    }

    #[test]
    fn malformed_line_does_not_block_subsequent_lines() {
        let mut codec = NdJsonCodec::<WorkerMessage>::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"not json at all\n{\"type\":\"ready\",\"requestId\":\"init\"}\n");
        let items = decode_all(&mut codec, &mut buf);

        assert_eq!(items.len(), 2);
        match &items[0] {
            Decoded::Malformed { line, .. } => assert_eq!(line, "not json at all"),
            other => panic!("expected malformed, got {other:?}"),
        }
        assert!(matches!(&items[1], Decoded::Message(WorkerMessage::Ready { .. })));
    }

    #[test]
    fn unknown_message_type_is_malformed() {
        let mut codec = NdJsonCodec::<WorkerMessage>::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"{\"type\":\"telemetry\",\"requestId\":\"r1\"}\n");
        let items = decode_all(&mut codec, &mut buf);

        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Decoded::Malformed { .. }));
    }

    #[test]
    fn decode_eof_flushes_trailing_partial_line() {
        let mut codec = NdJsonCodec::<WorkerMessage>::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"{\"type\":\"ready\",\"requestId\":\"init\"}");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let item = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert!(matches!(item, Decoded::Message(WorkerMessage::Ready { .. })));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }
}
