//! # Nexus RPC over HTTP
//!
//! A client and server SDK for a synchronous-or-asynchronous RPC protocol
//! over HTTP. A caller starts an *operation* by name with an arbitrary
//! payload; the server may answer inline, report a terminal unsuccessful
//! outcome, or accept the operation for asynchronous execution and hand
//! back an opaque operation ID that can later be polled, inspected, or
//! canceled.
//!
//! # Protocol
//!
//! | Endpoint                     | Method | Purpose                      |
//! |------------------------------|--------|------------------------------|
//! | `/{operation}`               | POST   | Start an operation           |
//! | `/{operation}/{id}`          | GET    | Fetch operation info         |
//! | `/{operation}/{id}/result`   | GET    | Fetch the result (long poll) |
//! | `/{operation}/{id}/cancel`   | POST   | Request cancelation          |
//!
//! ```text
//! ┌──────────┐                                      ┌──────────┐
//! │  Client  │                                      │  Server  │
//! └────┬─────┘                                      └────┬─────┘
//!      │  POST /{operation}                              │
//!      │ ───────────────────────────────────────────────►│
//!      │  200 + result body              (sync)          │
//!      │  201 + {id, state: "running"}   (async)         │
//!      │  424 + failure                  (terminal)      │
//!      │ ◄───────────────────────────────────────────────│
//!      │                                                 │
//!      │  GET /{operation}/{id}/result?wait=30s          │
//!      │ ───────────────────────────────────────────────►│
//!      │            ... (held open up to wait) ...       │
//!      │  200 + result / 412 still running / 408 timeout │
//!      │ ◄───────────────────────────────────────────────│
//! ```
//!
//! Operation names and IDs are percent-encoded path segments on the wire,
//! so both may contain `/`. Every error body is a JSON [`Failure`]
//! record; asynchronous acceptance carries an [`OperationInfo`] body.
//!
//! # Server
//!
//! Implement [`Handler`] and mount an [`HttpHandler`] on a hyper server.
//! Handler methods return [`OperationError`] variants which the HTTP
//! layer translates onto the wire.
//!
//! # Client
//!
//! [`Client`] issues the four requests and classifies responses into a
//! successful [`EncodedStream`], a pending [`OperationHandle`], or a
//! typed [`ClientError`]. Payloads travel through a pluggable [`Codec`];
//! the default encodes JSON and passes raw byte streams through
//! untouched.

pub mod client;
pub mod codec;
pub mod failure;
pub mod handle;
pub mod options;
pub mod server;

use std::time::Duration;

pub use client::{Client, ClientError, ClientOptions, OperationResult};
pub use codec::{ByteStream, Codec, CodecError, EncodedStream, Header, JsonCodec, Payload, Stream};
pub use failure::{
    Failure, HandlerError, HandlerErrorKind, OperationError, OperationInfo, OperationState,
    UnsuccessfulOperationError,
};
pub use handle::OperationHandle;
pub use options::{
    CancelOperationOptions, ExecuteOperationOptions, GetOperationInfoOptions,
    GetOperationResultOptions, StartOperationOptions,
};
pub use server::{Handler, HttpHandler, OperationResponse};

/// Default server-side cap on the duration of a single get-result long
/// poll. Configurable via [`HttpHandler::with_get_result_timeout`].
pub const DEFAULT_GET_RESULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound the client places on a single get-result attempt. Long
/// polls with a larger remaining budget are split into multiple
/// attempts.
pub const GET_RESULT_MAX_TIMEOUT: Duration = Duration::from_secs(10);

/// Margin added on top of the caller's wait so the side holding the
/// poll open expires after the waiting side, not before it.
pub const GET_RESULT_CONTEXT_PADDING: Duration = Duration::from_secs(1);

/// Header carrying the caller-supplied idempotency key on start
/// requests.
pub const HEADER_REQUEST_ID: &str = "nexus-request-id";

/// Header carrying the terminal state on unsuccessful-completion
/// responses. The value is the lowercase state literal.
pub const HEADER_OPERATION_STATE: &str = "nexus-operation-state";

/// Query parameter naming the delivery callback URL on start requests.
pub const QUERY_CALLBACK_URL: &str = "callback";

/// Query parameter carrying the long-poll wait duration on get-result
/// requests. The value is a duration literal such as `500ms` or `1m30s`.
pub const QUERY_WAIT: &str = "wait";

/// Content type of JSON bodies.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type of raw byte bodies.
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Exact User-Agent literal sent with every client request. Kept
/// bit-compatible with the wider SDK family so services that validate
/// the header keep accepting this client.
pub const USER_AGENT: &str = concat!("Nexus-go-sdk/v", env!("CARGO_PKG_VERSION"));

pub(crate) const HEADER_CONTENT_TYPE: &str = "content-type";
pub(crate) const HEADER_CONTENT_LENGTH: &str = "content-length";
pub(crate) const HEADER_USER_AGENT: &str = "user-agent";

/// Status of an operation that completed as failed or canceled.
pub(crate) const STATUS_OPERATION_FAILED: u16 = 424;

/// Status of a get-result request for an operation that is still
/// running.
pub(crate) const STATUS_OPERATION_RUNNING: u16 = 412;

/// Status reported by a gateway for an upstream application error.
pub(crate) const STATUS_UPSTREAM_ERROR: u16 = 520;

/// Status reported by a gateway for an upstream application timeout.
pub(crate) const STATUS_UPSTREAM_TIMEOUT: u16 = 521;
