use std::sync::Arc;
use thiserror::Error;

/// Boxed, shareable error source.
///
/// Outcomes are observed both through a [`DeliveryHandle`](crate::DeliveryHandle)
/// and through [`Rollbar::wait`](crate::Rollbar::wait), so sources are kept
/// behind an `Arc` to keep [`RollbarError`] cheaply cloneable.
pub type SharedSource = Arc<dyn std::error::Error + Send + Sync>;

/// Error reporting client errors
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RollbarError {
    /// The value passed to the logging API was neither a message nor an error
    #[error("must be string or error")]
    InvalidInput,

    /// Request body declared `application/json` but did not parse
    #[error("Invalid JSON request body: {0}")]
    InvalidJson(#[source] Arc<serde_json::Error>),

    /// Request body declared a form content type but did not parse
    #[error("Invalid form request body: {reason}")]
    Form {
        /// Diagnostic message from the form parser
        reason: String,
    },

    /// Reading the underlying request body stream failed
    #[error("Failed to read request body: {0}")]
    BodyRead(#[source] SharedSource),

    /// Payload could not be serialized to JSON
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[source] Arc<serde_json::Error>),

    /// Outbound request could not be assembled (bad header value, bad URL)
    #[error("Failed to build request: {0}")]
    InvalidRequest(#[source] SharedSource),

    /// Collector answered with a non-success status
    #[error("Failed to log to Rollbar: {body}")]
    Rejected {
        /// Status returned by the collector
        status: http::StatusCode,
        /// Response body text, as returned by the collector
        body: String,
    },

    /// Transport collaborator failed before an acknowledgement arrived
    #[error("Transport error: {0}")]
    Transport(#[source] Arc<TransportError>),

    /// Delivery task went away before it settled
    #[error("Delivery aborted before completion")]
    Aborted,
}

impl RollbarError {
    pub(crate) fn invalid_json(err: serde_json::Error) -> Self {
        Self::InvalidJson(Arc::new(err))
    }

    pub(crate) fn serialize(err: serde_json::Error) -> Self {
        Self::Serialize(Arc::new(err))
    }

    pub(crate) fn body_read<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::BodyRead(Arc::from(err.into()))
    }

    /// Returns `true` if the failure happened on the wire (rejected or transport).
    #[must_use]
    pub fn is_delivery_error(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::Transport(_))
    }
}

impl From<TransportError> for RollbarError {
    fn from(err: TransportError) -> Self {
        Self::Transport(Arc::new(err))
    }
}

impl From<http::Error> for RollbarError {
    fn from(err: http::Error) -> Self {
        Self::InvalidRequest(Arc::new(err))
    }
}

/// Transport collaborator failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// Network-level failure (connection refused, DNS, reset)
    #[error("{0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// TLS setup failure
    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Endpoint is not a valid URI
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: http::uri::InvalidUri,
    },

    /// Anything else reported by a custom transport
    #[error("{0}")]
    Other(String),
}

impl From<hyper::Error> for TransportError {
    fn from(err: hyper::Error) -> Self {
        TransportError::Connection(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for TransportError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        TransportError::Connection(Box::new(err))
    }
}
