//! Payload codec and the byte streams it produces.
//!
//! A [`Codec`] turns values into HTTP message bodies and back. It is
//! injected into both the client and the server, so the two sides agree
//! on content types by construction. The default [`JsonCodec`] encodes
//! structured values as JSON and passes pre-encoded streams through
//! untouched.
//!
//! [`Stream`] is an ownership-carrying handle: whoever receives one must
//! drain it to completion so the underlying connection is released.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::{
    CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET_STREAM, HEADER_CONTENT_LENGTH, HEADER_CONTENT_TYPE,
};

/// Message headers attached to a [`Stream`]. Keys are lowercase.
pub type Header = HashMap<String, String>;

/// The byte source a [`Stream`] reads from.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Errors from encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value could not be encoded.
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// The body could not be decoded into the requested type.
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// The body's content type does not decode into a structured value.
    #[error("cannot decode content type {content_type:?} into a structured value")]
    UnsupportedContentType {
        /// The content type found on the stream.
        content_type: String,
    },

    /// Reading the underlying byte stream failed.
    #[error("failed to read stream: {0}")]
    Io(#[from] io::Error),
}

/// A byte-oriented message body with its descriptive headers.
///
/// The reader is exclusively owned by whoever holds the stream; it must
/// be read to EOF and released.
pub struct Stream {
    /// Content headers describing the body (lowercase keys).
    pub header: Header,
    /// The body bytes.
    pub reader: ByteStream,
}

impl Stream {
    /// A stream over an in-memory buffer with the given content type.
    #[must_use]
    pub fn from_bytes(content_type: &str, bytes: Bytes) -> Self {
        let mut header = Header::new();
        header.insert(HEADER_CONTENT_TYPE.to_owned(), content_type.to_owned());
        header.insert(HEADER_CONTENT_LENGTH.to_owned(), bytes.len().to_string());
        Self {
            header,
            reader: stream::once(async move { Ok(bytes) }).boxed(),
        }
    }

    /// A stream with no headers and no bytes.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            header: Header::new(),
            reader: stream::empty().boxed(),
        }
    }

    /// The content type header, if set.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header.get(HEADER_CONTENT_TYPE).map(String::as_str)
    }

    /// Read the stream to EOF, releasing the underlying source.
    ///
    /// # Errors
    ///
    /// Fails if the byte source reports a read error.
    pub async fn collect(self) -> io::Result<Bytes> {
        drain(self.reader).await
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

async fn drain(mut reader: ByteStream) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = reader.try_next().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// A value on its way through a [`Codec`].
///
/// A closed sum rather than an open any-typed interface: the codec
/// dispatches on the variant and nothing else.
#[derive(Debug)]
pub enum Payload {
    /// No body.
    Empty,
    /// Raw bytes, carried as `application/octet-stream`.
    Bytes(Bytes),
    /// A structured value, carried in the codec's encoding.
    Value(serde_json::Value),
    /// A pre-encoded stream passed through with its own headers.
    Stream(Stream),
}

impl Payload {
    /// A structured payload for any serializable value.
    ///
    /// # Errors
    ///
    /// Fails if the value does not serialize.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        Ok(Self::Value(
            serde_json::to_value(value).map_err(CodecError::Encode)?,
        ))
    }

    /// A raw byte payload.
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self::Bytes(bytes.into())
    }
}

/// Turns payloads into streams and collected bodies back into values.
///
/// Implementations must be deterministic about header assignment: every
/// non-empty encoded body carries a content type.
pub trait Codec: fmt::Debug + Send + Sync {
    /// Encode a payload into a stream with content headers.
    ///
    /// Stream payloads pass through unchanged; once a stream has been
    /// handed to a response writer the codec is not consulted again.
    ///
    /// # Errors
    ///
    /// Fails if the payload cannot be encoded.
    fn encode(&self, payload: Payload) -> Result<Stream, CodecError>;

    /// Decode a fully collected body into a structured value.
    ///
    /// # Errors
    ///
    /// Fails on malformed input or on a content type the codec does not
    /// understand.
    fn decode(&self, header: &Header, body: &[u8]) -> Result<serde_json::Value, CodecError>;
}

/// The default codec: JSON bodies, raw octet-stream buffers, identity
/// passthrough for values that already are streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, payload: Payload) -> Result<Stream, CodecError> {
        match payload {
            Payload::Empty => Ok(Stream::empty()),
            Payload::Bytes(bytes) => Ok(Stream::from_bytes(CONTENT_TYPE_OCTET_STREAM, bytes)),
            Payload::Value(value) => {
                let encoded = serde_json::to_vec(&value).map_err(CodecError::Encode)?;
                Ok(Stream::from_bytes(CONTENT_TYPE_JSON, encoded.into()))
            }
            Payload::Stream(stream) => Ok(stream),
        }
    }

    fn decode(&self, header: &Header, body: &[u8]) -> Result<serde_json::Value, CodecError> {
        match header.get(HEADER_CONTENT_TYPE) {
            Some(content_type) if is_json(content_type) => {
                serde_json::from_slice(body).map_err(CodecError::Decode)
            }
            Some(content_type) => Err(CodecError::UnsupportedContentType {
                content_type: content_type.clone(),
            }),
            None if body.is_empty() => Ok(serde_json::Value::Null),
            None => serde_json::from_slice(body).map_err(CodecError::Decode),
        }
    }
}

fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(CONTENT_TYPE_JSON))
}

/// A [`Stream`] paired with the codec that understands its encoding.
#[derive(Debug)]
pub struct EncodedStream {
    stream: Stream,
    codec: Arc<dyn Codec>,
}

impl EncodedStream {
    /// Wrap a stream with the codec that encoded it.
    #[must_use]
    pub fn new(stream: Stream, codec: Arc<dyn Codec>) -> Self {
        Self { stream, codec }
    }

    /// The stream's content headers.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.stream.header
    }

    /// Read to EOF and decode the payload into `T`.
    ///
    /// # Errors
    ///
    /// Fails on stream read errors or if the body does not decode into
    /// `T`.
    pub async fn read<T: DeserializeOwned>(self) -> Result<T, CodecError> {
        let Self { stream, codec } = self;
        let Stream { header, reader } = stream;
        let body = drain(reader).await?;
        let value = codec.decode(&header, &body)?;
        serde_json::from_value(value).map_err(CodecError::Decode)
    }

    /// Read to EOF and return the raw bytes without consulting the
    /// codec.
    ///
    /// # Errors
    ///
    /// Fails if the byte source reports a read error.
    pub async fn read_bytes(self) -> Result<Bytes, CodecError> {
        Ok(drain(self.stream.reader).await?)
    }

    /// Recover the underlying stream, e.g. to echo it back.
    #[must_use]
    pub fn into_stream(self) -> Stream {
        self.stream
    }
}
