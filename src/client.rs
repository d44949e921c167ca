//! Client for issuing operations against a service.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::codec::{Codec, CodecError, EncodedStream, Header, JsonCodec, Payload, Stream};
use crate::failure::{
    Failure, HandlerError, HandlerErrorKind, OperationInfo, OperationState,
    UnsuccessfulOperationError,
};
use crate::handle::OperationHandle;
use crate::options::{
    ExecuteOperationOptions, GetOperationResultOptions, StartOperationOptions,
};
use crate::{
    HEADER_CONTENT_LENGTH, HEADER_OPERATION_STATE, HEADER_REQUEST_ID, HEADER_USER_AGENT,
    QUERY_CALLBACK_URL, STATUS_OPERATION_FAILED, STATUS_OPERATION_RUNNING, USER_AGENT,
};

/// Errors surfaced by [`Client`] and [`OperationHandle`] calls.
///
/// Classification happens in this order: unsuccessful completion,
/// still-running sentinel, categorized handler error, codec error,
/// transport error. The protocol layer never retries beyond the
/// long-poll loop; retrying is the caller's decision.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The asynchronous operation has not produced a result yet.
    ///
    /// A sentinel, not a failure: the operation is healthy. Distinct
    /// from [`ClientError::DeadlineExceeded`].
    #[error("operation still running")]
    OperationStillRunning,

    /// The operation completed as failed or canceled.
    #[error(transparent)]
    Unsuccessful(#[from] UnsuccessfulOperationError),

    /// The server rejected the request with a categorized failure.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The server-side long-poll bound expired before a result was
    /// available.
    #[error("deadline exceeded while waiting for operation result")]
    DeadlineExceeded,

    /// The response violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The payload could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The underlying HTTP transport failed.
    #[error("HTTP request error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The base URL does not parse or cannot carry path segments.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// A handle was constructed with an empty operation name or ID.
    #[error("invalid operation handle: {0}")]
    InvalidHandle(&'static str),
}

/// Configuration for [`Client::new`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Service base URL, e.g. `http://localhost:8080` or
    /// `https://host/prefix`.
    pub base_url: String,
    /// HTTP client to issue requests with. Defaults to a fresh
    /// [`reqwest::Client`].
    pub http_client: Option<reqwest::Client>,
    /// Payload codec. Defaults to [`JsonCodec`].
    pub codec: Option<Arc<dyn Codec>>,
    /// Overrides the `User-Agent` value sent with every request.
    pub user_agent: Option<String>,
}

impl ClientOptions {
    /// Options for the given base URL with every default.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

/// Outcome of [`Client::start_operation`]. Exactly one alternative.
#[derive(Debug)]
pub enum OperationResult {
    /// The operation completed synchronously with this result stream.
    Successful(EncodedStream),
    /// The operation runs asynchronously; poll through the handle.
    Pending(OperationHandle),
}

impl OperationResult {
    /// The successful stream, if the operation completed inline.
    #[must_use]
    pub fn into_successful(self) -> Option<EncodedStream> {
        match self {
            Self::Successful(stream) => Some(stream),
            Self::Pending(_) => None,
        }
    }

    /// The pending handle, if the operation runs asynchronously.
    #[must_use]
    pub fn into_pending(self) -> Option<OperationHandle> {
        match self {
            Self::Successful(_) => None,
            Self::Pending(handle) => Some(handle),
        }
    }
}

/// Client for a single service base URL.
///
/// Cheap to clone; all configuration is immutable after construction.
/// A call is canceled by dropping its future, which aborts the
/// in-flight request and releases the response stream.
#[derive(Debug, Clone)]
pub struct Client {
    base_url: Url,
    http: reqwest::Client,
    codec: Arc<dyn Codec>,
    user_agent: String,
}

impl Client {
    /// Construct a client from options.
    ///
    /// # Errors
    ///
    /// Fails if the base URL does not parse or cannot carry path
    /// segments.
    pub fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let base_url = Url::parse(options.base_url.trim_end_matches('/'))
            .map_err(|err| ClientError::InvalidUrl(err.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(
                "base URL cannot carry path segments".to_owned(),
            ));
        }

        Ok(Self {
            base_url,
            http: options.http_client.unwrap_or_default(),
            codec: options
                .codec
                .unwrap_or_else(|| Arc::new(JsonCodec)),
            user_agent: options.user_agent.unwrap_or_else(|| USER_AGENT.to_owned()),
        })
    }

    /// Start an operation.
    ///
    /// The effective request ID is the first non-empty of
    /// [`StartOperationOptions::request_id`], the `nexus-request-id`
    /// entry in [`StartOperationOptions::header`], or a freshly
    /// generated UUIDv4.
    ///
    /// # Errors
    ///
    /// An unsuccessful terminal completion surfaces as
    /// [`ClientError::Unsuccessful`]; see [`ClientError`] for the rest.
    pub async fn start_operation(
        &self,
        operation: &str,
        input: Payload,
        options: StartOperationOptions,
    ) -> Result<OperationResult, ClientError> {
        let stream = self.codec.encode(input)?;

        let request_id = options
            .request_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| options.header.get(HEADER_REQUEST_ID).cloned())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut url = self.url(&[operation])?;
        if let Some(callback) = &options.callback_url {
            url.query_pairs_mut()
                .append_pair(QUERY_CALLBACK_URL, callback);
        }

        let Stream {
            header: content_header,
            reader,
        } = stream;

        // Content headers produced by the codec win over caller headers.
        // The body goes out as a stream, so the transport owns the
        // length accounting.
        let mut headers = self.base_headers(&options.header);
        insert_header(&mut headers, HEADER_REQUEST_ID, &request_id);
        for (name, value) in &content_header {
            if name.as_str() == HEADER_CONTENT_LENGTH {
                continue;
            }
            insert_header(&mut headers, name, value);
        }

        tracing::debug!(operation, request_id = %request_id, "starting operation");

        let response = self
            .http
            .post(url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(reader))
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(OperationResult::Successful(self.encoded_stream(response))),
            201 => {
                let info = read_operation_info(response).await?;
                if info.state != OperationState::Running {
                    return Err(ClientError::Protocol(format!(
                        "expected a running operation, got state {}",
                        info.state
                    )));
                }
                Ok(OperationResult::Pending(self.new_handle(operation, &info.id)?))
            }
            _ => Err(self.error_from_response(response).await),
        }
    }

    /// Start an operation and wait for its result.
    ///
    /// A synchronous completion returns immediately; an asynchronous
    /// one is long polled until [`ExecuteOperationOptions::wait`] runs
    /// out, in which case the still-running sentinel surfaces.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub async fn execute_operation(
        &self,
        operation: &str,
        input: Payload,
        options: ExecuteOperationOptions,
    ) -> Result<EncodedStream, ClientError> {
        let started = Instant::now();
        let start_options = StartOperationOptions {
            request_id: options.request_id,
            callback_url: options.callback_url,
            header: options.header.clone(),
        };

        match self.start_operation(operation, input, start_options).await? {
            OperationResult::Successful(stream) => Ok(stream),
            OperationResult::Pending(handle) => {
                let remaining = options.wait.saturating_sub(started.elapsed());
                handle
                    .get_result(GetOperationResultOptions {
                        wait: remaining,
                        header: options.header,
                    })
                    .await
            }
        }
    }

    /// Reference an existing asynchronous operation without a network
    /// round trip.
    ///
    /// # Errors
    ///
    /// Fails if the operation name or ID is empty.
    pub fn new_handle(&self, operation: &str, id: &str) -> Result<OperationHandle, ClientError> {
        OperationHandle::new(self.clone(), operation, id)
    }

    /// A copy of the base URL with the given raw segments appended,
    /// each percent-encoded so `/` round-trips.
    pub(crate) fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                ClientError::InvalidUrl("base URL cannot carry path segments".to_owned())
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    /// Issue a GET with the standard headers.
    pub(crate) async fn get(
        &self,
        url: Url,
        header: &Header,
    ) -> Result<reqwest::Response, ClientError> {
        Ok(self
            .http
            .get(url)
            .headers(self.base_headers(header))
            .send()
            .await?)
    }

    /// Issue a bodyless POST with the standard headers.
    pub(crate) async fn post_empty(
        &self,
        url: Url,
        header: &Header,
    ) -> Result<reqwest::Response, ClientError> {
        Ok(self
            .http
            .post(url)
            .headers(self.base_headers(header))
            .send()
            .await?)
    }

    /// Caller headers plus the fixed `User-Agent`. Content headers and
    /// protocol-owned headers are not taken from the caller.
    fn base_headers(&self, header: &Header) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in header {
            let lower = name.to_lowercase();
            if lower.starts_with("content-")
                || lower == HEADER_REQUEST_ID
                || lower == HEADER_USER_AGENT
            {
                continue;
            }
            insert_header(&mut headers, &lower, value);
        }
        insert_header(&mut headers, HEADER_USER_AGENT, &self.user_agent);
        headers
    }

    /// Wrap a response body as an [`EncodedStream`] owned by the
    /// caller. The caller must read it to EOF to release the
    /// connection.
    pub(crate) fn encoded_stream(&self, response: reqwest::Response) -> EncodedStream {
        let header = response_header(&response);
        let reader = response
            .bytes_stream()
            .map_err(io::Error::other)
            .boxed();
        EncodedStream::new(Stream { header, reader }, Arc::clone(&self.codec))
    }

    /// Classify a non-successful response into a typed error.
    pub(crate) async fn error_from_response(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        match status {
            STATUS_OPERATION_RUNNING => ClientError::OperationStillRunning,
            408 => ClientError::DeadlineExceeded,
            STATUS_OPERATION_FAILED => {
                let state_header = response
                    .headers()
                    .get(HEADER_OPERATION_STATE)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned);
                let failure = read_failure(response).await;
                match state_header.as_deref().map(str::parse::<OperationState>) {
                    Some(Ok(state)) if state.is_terminal_unsuccessful() => {
                        ClientError::Unsuccessful(UnsuccessfulOperationError { state, failure })
                    }
                    _ => ClientError::Protocol(format!(
                        "unexpected operation state header on unsuccessful response: {state_header:?}"
                    )),
                }
            }
            _ => {
                let failure = read_failure(response).await;
                ClientError::Handler(HandlerError {
                    kind: kind_from_status(status),
                    failure: Some(failure),
                })
            }
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => tracing::warn!(header = name, "skipping header that does not fit on the wire"),
    }
}

fn response_header(response: &reqwest::Response) -> Header {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_owned()))
        })
        .collect()
}

async fn read_operation_info(response: reqwest::Response) -> Result<OperationInfo, ClientError> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body)
        .map_err(|err| ClientError::Protocol(format!("failed to parse operation info: {err}")))
}

/// Best-effort extraction of a [`Failure`] from an error response.
async fn read_failure(response: reqwest::Response) -> Failure {
    let status = response.status();
    match response.bytes().await {
        Ok(body) if body.is_empty() => Failure::from_message(status.to_string()),
        Ok(body) => serde_json::from_slice(&body).unwrap_or_else(|_| {
            Failure::from_message(String::from_utf8_lossy(&body).into_owned())
        }),
        Err(err) => Failure::from_message(err.to_string()),
    }
}

fn kind_from_status(status: u16) -> HandlerErrorKind {
    match status {
        400 => HandlerErrorKind::BadRequest,
        401 => HandlerErrorKind::Unauthenticated,
        403 => HandlerErrorKind::Unauthorized,
        404 => HandlerErrorKind::NotFound,
        501 => HandlerErrorKind::NotImplemented,
        520 => HandlerErrorKind::ApplicationError,
        521 => HandlerErrorKind::ApplicationTimeout,
        _ => HandlerErrorKind::Internal,
    }
}
