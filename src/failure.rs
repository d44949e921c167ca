//! The wire-level failure record and the categorized error taxonomy.
//!
//! Three disjoint categories are observable to callers:
//!
//! 1. [`UnsuccessfulOperationError`]: the operation itself reached a
//!    terminal non-success state. A completion outcome, not a transport
//!    error.
//! 2. [`OperationError::StillRunning`]: a distinguished sentinel from
//!    get-result. Never conflated with a timeout.
//! 3. [`HandlerError`]: every other request failure, tagged with a
//!    [`HandlerErrorKind`] that fixes the HTTP status code.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    /// The operation was accepted and has not reached a terminal state.
    Running,
    /// The operation completed successfully.
    Succeeded,
    /// The operation completed as failed.
    Failed,
    /// The operation completed as canceled.
    Canceled,
}

impl OperationState {
    /// Whether this is a terminal unsuccessful state observable on the
    /// wire.
    #[must_use]
    pub const fn is_terminal_unsuccessful(self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }

    /// The lowercase wire literal for this state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wire value that is not one of the known operation states.
#[derive(Debug, Clone, Error)]
#[error("unknown operation state: {0:?}")]
pub struct UnknownOperationState(pub String);

impl FromStr for OperationState {
    type Err = UnknownOperationState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(UnknownOperationState(other.to_owned())),
        }
    }
}

/// Information about an asynchronous operation.
///
/// Returned by the info endpoint and embedded in the body of an
/// async-start response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    /// The server-assigned opaque operation ID.
    pub id: String,
    /// The operation's current state.
    pub state: OperationState,
}

/// The canonical structured error record.
///
/// Serialized as the JSON body of every error response and of terminal
/// unsuccessful completions. `details` travels as a base64 string on
/// the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Human-readable description of the failure.
    pub message: String,
    /// Optional key-value annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Optional opaque payload for machine consumption.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_details")]
    pub details: Option<Vec<u8>>,
}

impl Failure {
    /// A failure carrying only a message.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

mod base64_details {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// An operation completed with a terminal non-success state.
///
/// Distinct from transport and handler errors: the request itself was
/// handled, and the operation finished as `failed` or `canceled`.
#[derive(Debug, Clone)]
pub struct UnsuccessfulOperationError {
    /// The terminal state, one of `failed` or `canceled`.
    pub state: OperationState,
    /// The failure reported by the operation.
    pub failure: Failure,
}

impl fmt::Display for UnsuccessfulOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation completed as {}: {}",
            self.state, self.failure.message
        )
    }
}

impl std::error::Error for UnsuccessfulOperationError {}

/// Categories a request can fail with.
///
/// Each category maps onto exactly one HTTP status code; the wire
/// literal is the SCREAMING_SNAKE name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerErrorKind {
    /// The associated operation completed as canceled.
    OperationCanceled,
    /// The associated operation completed as failed.
    OperationFailed,
    /// An unexpected condition with no more specific category.
    Internal,
    /// A gateway observed an error response from an upstream server.
    ApplicationError,
    /// A gateway observed a timed-out request to an upstream server.
    ApplicationTimeout,
    /// The caller did not supply valid authentication credentials.
    Unauthenticated,
    /// The caller is not permitted to execute the operation.
    Unauthorized,
    /// The request is malformed by an apparent client error.
    BadRequest,
    /// The requested resource was not found; it may exist later.
    NotFound,
    /// The server does not recognize or cannot fulfil the request.
    NotImplemented,
}

impl HandlerErrorKind {
    /// The wire literal for this category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OperationCanceled => "OPERATION_CANCELED",
            Self::OperationFailed => "OPERATION_FAILED",
            Self::Internal => "INTERNAL",
            Self::ApplicationError => "APPLICATION_ERROR",
            Self::ApplicationTimeout => "APPLICATION_TIMEOUT",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::NotImplemented => "NOT_IMPLEMENTED",
        }
    }
}

impl fmt::Display for HandlerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A categorized request failure with an optional structured [`Failure`]
/// to report in the response body.
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// The failure category. Fixes the HTTP status code.
    pub kind: HandlerErrorKind,
    /// Failure to report back in the response. Optional.
    pub failure: Option<Failure>,
}

impl HandlerError {
    /// An error of the given kind carrying a failure message.
    pub fn new(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            failure: Some(Failure::from_message(message)),
        }
    }

    /// An error of the given kind with no failure body.
    #[must_use]
    pub const fn from_kind(kind: HandlerErrorKind) -> Self {
        Self {
            kind,
            failure: None,
        }
    }

    /// A bad-request error with the given message.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::BadRequest, message)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            Some(failure) => write!(f, "handler error ({}): {}", self.kind, failure.message),
            None => write!(f, "handler error ({})", self.kind),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Errors a [`Handler`](crate::server::Handler) method can return.
///
/// The HTTP layer owns the translation onto the wire. Anything carried
/// by [`OperationError::Other`] is logged server side and surfaced as a
/// generic internal failure; its message never reaches the response
/// body.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The asynchronous operation has not produced a result yet.
    ///
    /// Only meaningful from get-result.
    #[error("operation still running")]
    StillRunning,

    /// The operation completed as failed or canceled.
    #[error(transparent)]
    Unsuccessful(#[from] UnsuccessfulOperationError),

    /// The request failed with a categorized handler error.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
