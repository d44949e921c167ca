//! Hyper-based HTTP front end for serving operations.
//!
//! Routes incoming requests to the four protocol endpoints and
//! translates [`Handler`] outcomes onto the wire:
//!
//! | Endpoint                     | Method | Purpose            |
//! |------------------------------|--------|--------------------|
//! | `/{operation}`               | POST   | Start an operation |
//! | `/{operation}/{id}`          | GET    | Operation info     |
//! | `/{operation}/{id}/result`   | GET    | Operation result   |
//! | `/{operation}/{id}/cancel`   | POST   | Cancel             |
//!
//! Routing happens on the percent-encoded path: segments are split
//! before they are unescaped, so operation names and IDs containing `/`
//! stay single segments. A router that decodes first would collapse
//! `a%2Fsync` into two segments and break async-ID routing.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyStream, Full};
use hyper::body::Incoming;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;
use serde::Serialize;

use crate::codec::{ByteStream, Codec, EncodedStream, Header, JsonCodec, Payload, Stream};
use crate::failure::{
    Failure, HandlerError, HandlerErrorKind, OperationError, OperationInfo, OperationState,
};
use crate::options::{
    CancelOperationOptions, GetOperationInfoOptions, GetOperationResultOptions,
    StartOperationOptions,
};
use crate::{
    CONTENT_TYPE_JSON, DEFAULT_GET_RESULT_TIMEOUT, GET_RESULT_CONTEXT_PADDING,
    HEADER_CONTENT_LENGTH, HEADER_CONTENT_TYPE, HEADER_OPERATION_STATE, HEADER_REQUEST_ID,
    QUERY_CALLBACK_URL, QUERY_WAIT, STATUS_UPSTREAM_ERROR, STATUS_UPSTREAM_TIMEOUT,
};

/// Outcome of starting an operation.
///
/// A closed sum: the wire encoding dispatches on the variant, nothing
/// else.
#[derive(Debug)]
pub enum OperationResponse {
    /// The operation completed inline with this payload.
    Sync(Payload),
    /// The operation was accepted and runs asynchronously under the
    /// given server-assigned ID.
    Async {
        /// Opaque ID the caller polls with.
        operation_id: String,
    },
}

/// Server-side contract for the four protocol operations.
///
/// Every method may fail with any [`OperationError`] variant; the HTTP
/// layer owns the mapping onto status codes and bodies. Each method has
/// a default body rejecting the request as not implemented, so a
/// handler only spells out what it supports.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Start an operation.
    ///
    /// Return [`OperationResponse::Sync`] to respond inline or
    /// [`OperationResponse::Async`] to acknowledge asynchronous
    /// execution. Return an
    /// [`UnsuccessfulOperationError`](crate::UnsuccessfulOperationError)
    /// to report that the operation completed as failed or canceled.
    async fn start_operation(
        &self,
        operation: &str,
        input: EncodedStream,
        options: StartOperationOptions,
    ) -> Result<OperationResponse, OperationError> {
        let _ = (operation, input, options);
        Err(HandlerError::from_kind(HandlerErrorKind::NotImplemented).into())
    }

    /// Return the result of an asynchronous operation.
    ///
    /// When [`GetOperationResultOptions::wait`] is non-zero the request
    /// is a long poll: respect the wait and return
    /// [`OperationError::StillRunning`] once it expires without a
    /// result. The surrounding request future is bounded by the
    /// configured get-result timeout, with a margin over the wait so
    /// the still-running answer gets out before the bound fires.
    async fn get_operation_result(
        &self,
        operation: &str,
        id: &str,
        options: GetOperationResultOptions,
    ) -> Result<Payload, OperationError> {
        let _ = (operation, id, options);
        Err(HandlerError::from_kind(HandlerErrorKind::NotImplemented).into())
    }

    /// Describe an asynchronous operation.
    async fn get_operation_info(
        &self,
        operation: &str,
        id: &str,
        options: GetOperationInfoOptions,
    ) -> Result<OperationInfo, OperationError> {
        let _ = (operation, id, options);
        Err(HandlerError::from_kind(HandlerErrorKind::NotImplemented).into())
    }

    /// Request cancelation of an asynchronous operation.
    ///
    /// Cancelation is delivered, not awaited: returning success only
    /// acknowledges the request, and the underlying operation may still
    /// ignore it. Duplicate cancels for the same operation must be
    /// tolerated.
    async fn cancel_operation(
        &self,
        operation: &str,
        id: &str,
        options: CancelOperationOptions,
    ) -> Result<(), OperationError> {
        let _ = (operation, id, options);
        Err(HandlerError::from_kind(HandlerErrorKind::NotImplemented).into())
    }
}

/// HTTP front end for a [`Handler`].
///
/// Cheap to clone; all configuration is immutable after construction.
#[derive(Debug)]
pub struct HttpHandler<H> {
    handler: Arc<H>,
    codec: Arc<dyn Codec>,
    get_result_timeout: Duration,
}

impl<H> Clone for HttpHandler<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            codec: Arc::clone(&self.codec),
            get_result_timeout: self.get_result_timeout,
        }
    }
}

impl<H: Handler> HttpHandler<H> {
    /// A front end for the given handler with the default JSON codec
    /// and get-result timeout.
    #[must_use]
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            codec: Arc::new(JsonCodec),
            get_result_timeout: DEFAULT_GET_RESULT_TIMEOUT,
        }
    }

    /// Replace the payload codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Cap the server-side duration of a single get-result long poll.
    #[must_use]
    pub const fn with_get_result_timeout(mut self, timeout: Duration) -> Self {
        self.get_result_timeout = timeout;
        self
    }

    /// Route one request and produce its response.
    ///
    /// Mount this at the service base path. The returned future is
    /// dropped by hyper when the peer disconnects, which cancels the
    /// in-flight handler call.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let segments: Vec<String> = req
            .uri()
            .path()
            .trim_start_matches('/')
            .split('/')
            .map(str::to_owned)
            .collect();

        tracing::debug!(%method, path = req.uri().path(), "routing request");

        let result = match (&method, segments.as_slice()) {
            (&Method::POST, [operation]) if !operation.is_empty() => {
                self.start_operation(operation, req).await
            }
            (&Method::GET, [operation, id]) => self.get_operation_info(operation, id, req).await,
            (&Method::GET, [operation, id, tail]) if tail.as_str() == "result" => {
                self.get_operation_result(operation, id, req).await
            }
            (&Method::POST, [operation, id, tail]) if tail.as_str() == "cancel" => {
                self.cancel_operation(operation, id, req).await
            }
            _ => Err(HandlerError::new(HandlerErrorKind::NotFound, "not found").into()),
        };

        result.unwrap_or_else(|err| self.write_failure(&err))
    }

    async fn start_operation(
        &self,
        operation: &str,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, OperationError> {
        let operation = decode_segment(operation)?;
        let query = query_map(req.uri().query());
        let header = header_map(req.headers());

        let options = StartOperationOptions {
            request_id: header
                .get(HEADER_REQUEST_ID)
                .filter(|id| !id.is_empty())
                .cloned(),
            callback_url: query.get(QUERY_CALLBACK_URL).cloned(),
            header: header.clone(),
        };

        // The input stream carries the request's content headers so the
        // codec can tell what it is looking at.
        let content_header: Header = header
            .iter()
            .filter(|(name, _)| name.starts_with("content-"))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let input = EncodedStream::new(
            Stream {
                header: content_header,
                reader: body_stream(req.into_body()),
            },
            Arc::clone(&self.codec),
        );

        match self
            .handler
            .start_operation(&operation, input, options)
            .await?
        {
            OperationResponse::Sync(payload) => self.write_result(payload).await,
            OperationResponse::Async { operation_id } => json_response(
                StatusCode::CREATED,
                &OperationInfo {
                    id: operation_id,
                    state: OperationState::Running,
                },
            ),
        }
    }

    async fn get_operation_result(
        &self,
        operation: &str,
        id: &str,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, OperationError> {
        let operation = decode_segment(operation)?;
        let id = decode_segment(id)?;
        let query = query_map(req.uri().query());

        let wait = match query.get(QUERY_WAIT).filter(|raw| !raw.is_empty()) {
            Some(raw) => parse_wait(raw)?,
            None => Duration::ZERO,
        };
        let options = GetOperationResultOptions {
            wait,
            header: header_map(req.headers()),
        };

        let fut = self.handler.get_operation_result(&operation, &id, options);
        let result = if wait.is_zero() {
            fut.await
        } else {
            // The bound outlives the caller's wait by a margin so a
            // wait-respecting handler answers still-running before the
            // request itself times out.
            let bound = self
                .get_result_timeout
                .min(wait + GET_RESULT_CONTEXT_PADDING);
            match tokio::time::timeout(bound, fut).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(%operation, %id, "get-result long poll hit the server bound");
                    return Ok(empty_response(StatusCode::REQUEST_TIMEOUT));
                }
            }
        };

        match result {
            Ok(payload) => self.write_result(payload).await,
            Err(OperationError::StillRunning) => Ok(empty_response(StatusCode::PRECONDITION_FAILED)),
            Err(err) => Err(err),
        }
    }

    async fn get_operation_info(
        &self,
        operation: &str,
        id: &str,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, OperationError> {
        let operation = decode_segment(operation)?;
        let id = decode_segment(id)?;
        let options = GetOperationInfoOptions {
            header: header_map(req.headers()),
        };

        let info = self
            .handler
            .get_operation_info(&operation, &id, options)
            .await?;
        json_response(StatusCode::OK, &info)
    }

    async fn cancel_operation(
        &self,
        operation: &str,
        id: &str,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, OperationError> {
        let operation = decode_segment(operation)?;
        let id = decode_segment(id)?;
        let options = CancelOperationOptions {
            header: header_map(req.headers()),
        };

        self.handler
            .cancel_operation(&operation, &id, options)
            .await?;
        Ok(empty_response(StatusCode::ACCEPTED))
    }

    /// Encode a successful payload into a `200 OK` response, copying
    /// the stream's content headers.
    async fn write_result(
        &self,
        payload: Payload,
    ) -> Result<Response<Full<Bytes>>, OperationError> {
        let stream = self
            .codec
            .encode(payload)
            .map_err(|err| OperationError::Other(err.into()))?;
        let Stream { header, reader } = stream;
        let body = collect_reader(reader)
            .await
            .map_err(|err| OperationError::Other(err.into()))?;

        let mut builder = Response::builder().status(StatusCode::OK);
        for (name, value) in &header {
            // The body is buffered here; the length header is recomputed.
            if name.as_str() == HEADER_CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(Full::new(body))
            .map_err(|err| OperationError::Other(err.into()))
    }

    /// Centralized translation of handler errors onto the wire.
    ///
    /// Discrimination order: unsuccessful completion, then categorized
    /// handler error, then everything else as a logged internal error
    /// whose cause never reaches the response body.
    fn write_failure(&self, err: &OperationError) -> Response<Full<Bytes>> {
        let mut state_header = None;
        let (status, failure) = match err {
            OperationError::Unsuccessful(unsuccessful) => {
                if !unsuccessful.state.is_terminal_unsuccessful() {
                    tracing::error!(state = %unsuccessful.state, "unexpected operation state");
                    return internal_failure_response();
                }
                state_header = Some(unsuccessful.state);
                (
                    StatusCode::FAILED_DEPENDENCY,
                    Some(unsuccessful.failure.clone()),
                )
            }
            OperationError::Handler(handler_error) => {
                let status = match handler_error.kind {
                    HandlerErrorKind::OperationCanceled => {
                        state_header = Some(OperationState::Canceled);
                        StatusCode::FAILED_DEPENDENCY
                    }
                    HandlerErrorKind::OperationFailed => {
                        state_header = Some(OperationState::Failed);
                        StatusCode::FAILED_DEPENDENCY
                    }
                    HandlerErrorKind::ApplicationTimeout => extended_status(STATUS_UPSTREAM_TIMEOUT),
                    HandlerErrorKind::ApplicationError => extended_status(STATUS_UPSTREAM_ERROR),
                    HandlerErrorKind::BadRequest => StatusCode::BAD_REQUEST,
                    HandlerErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
                    HandlerErrorKind::Unauthorized => StatusCode::FORBIDDEN,
                    HandlerErrorKind::NotFound => StatusCode::NOT_FOUND,
                    HandlerErrorKind::NotImplemented => StatusCode::NOT_IMPLEMENTED,
                    HandlerErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, handler_error.failure.clone())
            }
            OperationError::StillRunning => {
                // Still-running is consumed on the result path; anywhere
                // else it is a handler bug.
                tracing::error!("still-running returned outside get-result");
                return internal_failure_response();
            }
            OperationError::Other(cause) => {
                tracing::error!(error = %cause, "handler failed");
                return internal_failure_response();
            }
        };

        failure_response(status, state_header, failure.as_ref())
    }
}

fn decode_segment(segment: &str) -> Result<String, OperationError> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| HandlerError::bad_request("failed to parse URL path").into())
}

fn parse_wait(raw: &str) -> Result<Duration, OperationError> {
    // The duration grammar spells microseconds either way.
    let normalized = raw.replace("µs", "us");
    humantime::parse_duration(&normalized).map_err(|_| {
        tracing::warn!(wait = raw, "invalid wait duration query parameter");
        HandlerError::bad_request("invalid wait query parameter").into()
    })
}

fn header_map(headers: &HeaderMap) -> Header {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_owned()))
        })
        .collect()
}

fn query_map(query: Option<&str>) -> Header {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

fn body_stream(body: Incoming) -> ByteStream {
    BodyStream::new(body)
        .filter_map(|frame| async move {
            match frame {
                Ok(frame) => frame.into_data().ok().map(Ok),
                Err(err) => Some(Err(io::Error::other(err))),
            }
        })
        .boxed()
}

async fn collect_reader(mut reader: ByteStream) -> io::Result<Bytes> {
    use futures::TryStreamExt;

    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = reader.try_next().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn json_response<T: Serialize>(
    status: StatusCode,
    value: &T,
) -> Result<Response<Full<Bytes>>, OperationError> {
    let body = serde_json::to_vec(value).map_err(|err| OperationError::Other(err.into()))?;
    Response::builder()
        .status(status)
        .header(HEADER_CONTENT_TYPE, CONTENT_TYPE_JSON)
        .body(Full::new(Bytes::from(body)))
        .map_err(|err| OperationError::Other(err.into()))
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn internal_failure_response() -> Response<Full<Bytes>> {
    failure_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        None,
        Some(&Failure::from_message("internal server error")),
    )
}

fn failure_response(
    status: StatusCode,
    state: Option<OperationState>,
    failure: Option<&Failure>,
) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    if let Some(state) = state {
        builder = builder.header(HEADER_OPERATION_STATE, state.as_str());
    }

    let body = match failure {
        Some(failure) => match serde_json::to_vec(failure) {
            Ok(encoded) => {
                builder = builder.header(HEADER_CONTENT_TYPE, CONTENT_TYPE_JSON);
                Bytes::from(encoded)
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize failure");
                return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        },
        None => Bytes::new(),
    };

    builder.body(Full::new(body)).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to build failure response");
        empty_response(StatusCode::INTERNAL_SERVER_ERROR)
    })
}

/// 520 and 521 sit outside the named status range.
fn extended_status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
