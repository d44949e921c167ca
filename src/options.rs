//! Per-request option records shared by the client and the server
//! handler, so both sides speak in the same terms.

use std::time::Duration;

use crate::codec::Header;

/// Options for starting an operation.
///
/// On the client these shape the outgoing request; on the server they
/// carry what the request declared.
#[derive(Debug, Clone, Default)]
pub struct StartOperationOptions {
    /// Idempotency key for the start request.
    ///
    /// Client side the effective request ID is the first non-empty of
    /// this field, the `nexus-request-id` header, or a freshly
    /// generated UUIDv4.
    pub request_id: Option<String>,
    /// URL the server may deliver an asynchronous result to.
    ///
    /// The protocol only transports the URL; delivering to it is an
    /// application concern.
    pub callback_url: Option<String>,
    /// Request headers (lowercase keys).
    pub header: Header,
}

/// Options for fetching an operation result.
#[derive(Debug, Clone, Default)]
pub struct GetOperationResultOptions {
    /// How long to wait for the operation to complete.
    ///
    /// Zero is a single peek. Server side this is the duration the
    /// caller asked the poll to be held open; handlers must respect it
    /// and report still-running once it expires.
    pub wait: Duration,
    /// Request headers (lowercase keys).
    pub header: Header,
}

/// Options for fetching operation info.
#[derive(Debug, Clone, Default)]
pub struct GetOperationInfoOptions {
    /// Request headers (lowercase keys).
    pub header: Header,
}

/// Options for requesting cancelation.
#[derive(Debug, Clone, Default)]
pub struct CancelOperationOptions {
    /// Request headers (lowercase keys).
    pub header: Header,
}

/// Options for [`Client::execute_operation`](crate::Client::execute_operation).
#[derive(Debug, Clone)]
pub struct ExecuteOperationOptions {
    /// Idempotency key for the underlying start request.
    pub request_id: Option<String>,
    /// URL the server may deliver an asynchronous result to.
    pub callback_url: Option<String>,
    /// Request headers (lowercase keys).
    pub header: Header,
    /// Budget for waiting on an asynchronous result. Defaults to one
    /// minute.
    pub wait: Duration,
}

impl Default for ExecuteOperationOptions {
    fn default() -> Self {
        Self {
            request_id: None,
            callback_url: None,
            header: Header::default(),
            wait: Duration::from_secs(60),
        }
    }
}
