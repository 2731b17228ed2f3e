use std::{error::Error as _, fmt, future::Future, io, pin::Pin, time::Duration};

use bytes::Bytes;
use hyper::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::writer::Payload;

pub mod http;

/// A boxed future returned by [`Transport::send`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>>;

/// Delivers request bodies to an ingest endpoint.
///
/// [`HttpTransport`](http::HttpTransport) is used by default. Other implementations can be plugged
/// in with [`DynatraceBuilder::build_with_transport`](crate::DynatraceBuilder::build_with_transport).
pub trait Transport: Send + Sync {
    /// Sends a single request body: newline-separated metric lines without a trailing newline.
    fn send(&self, body: Bytes) -> TransportFuture<'_>;
}

/// The response to a single ingest request.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    /// Status code of the response.
    pub status: StatusCode,

    /// Raw response body.
    pub body: Bytes,
}

/// Errors that prevent a request from getting a response.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be built.
    #[error("failed to build request: {0}")]
    InvalidRequest(String),

    /// The request could not be sent, or no response was received.
    #[error("failed to send request")]
    Request(#[source] hyper_util::client::legacy::Error),

    /// The response body could not be read.
    #[error("failed to read response body")]
    Body(#[source] hyper::Error),

    /// No response was received before the request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// An I/O error from a custom transport.
    #[error("I/O error")]
    Io(#[from] io::Error),
}

/// The acknowledgment body returned by the ingest API.
///
/// All fields are optional in the response; missing counts are treated as zero.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    /// Number of lines that were accepted.
    #[serde(default)]
    pub lines_ok: u64,

    /// Number of lines that were rejected as invalid.
    #[serde(default)]
    pub lines_invalid: u64,

    /// Error details, if any lines were rejected.
    #[serde(default)]
    pub error: Option<IngestError>,
}

impl IngestResponse {
    /// Parses an acknowledgment from a response body.
    ///
    /// # Errors
    ///
    /// If the body is not a JSON object of the expected shape, an error is returned.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Error details of an acknowledgment.
///
/// Depending on the API version, the error is either a plain message or an object that may also
/// point at the offending lines.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum IngestError {
    /// A plain error message.
    Message(String),

    /// A structured error.
    Details(IngestErrorDetails),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Message(message) => f.write_str(message),
            IngestError::Details(details) => write!(f, "{} (code {})", details.message, details.code),
        }
    }
}

/// A structured error of an acknowledgment.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngestErrorDetails {
    /// Error code, usually matching the HTTP status.
    #[serde(default)]
    pub code: u16,

    /// Human-readable error message.
    #[serde(default)]
    pub message: String,

    /// The rejected lines, if reported.
    #[serde(default)]
    pub invalid_lines: Vec<InvalidLine>,
}

/// A line rejected by the ingest API.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct InvalidLine {
    /// Line number within the request, starting at 1.
    #[serde(default)]
    pub line: u64,

    /// Why the line was rejected.
    #[serde(default)]
    pub error: String,
}

/// The result of sending one chunk of lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The chunk was accepted.
    Accepted {
        /// Status code of the response.
        status: StatusCode,
        /// The acknowledgment, if the body could be parsed.
        ack: Option<IngestResponse>,
    },

    /// The request succeeded, but the acknowledgment reports invalid lines.
    ///
    /// The valid lines of the chunk were still ingested, so this counts as delivered.
    PartiallyInvalid {
        /// Status code of the response.
        status: StatusCode,
        /// The acknowledgment.
        ack: IngestResponse,
    },

    /// The endpoint answered with a status other than 200 or 202.
    FailedStatus {
        /// Status code of the response.
        status: StatusCode,
        /// The acknowledgment, if the body could be parsed.
        ack: Option<IngestResponse>,
    },

    /// The chunk never got a response.
    FailedTransport {
        /// Description of the transport error.
        reason: String,
    },
}

impl ChunkOutcome {
    /// Returns `true` if the chunk was delivered.
    pub fn is_success(&self) -> bool {
        matches!(self, ChunkOutcome::Accepted { .. } | ChunkOutcome::PartiallyInvalid { .. })
    }

    /// Returns the status code of the response, if one was received.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ChunkOutcome::Accepted { status, .. }
            | ChunkOutcome::PartiallyInvalid { status, .. }
            | ChunkOutcome::FailedStatus { status, .. } => Some(*status),
            ChunkOutcome::FailedTransport { .. } => None,
        }
    }

    /// Returns the acknowledgment, if one was received and parsed.
    pub fn ack(&self) -> Option<&IngestResponse> {
        match self {
            ChunkOutcome::Accepted { ack, .. } | ChunkOutcome::FailedStatus { ack, .. } => ack.as_ref(),
            ChunkOutcome::PartiallyInvalid { ack, .. } => Some(ack),
            ChunkOutcome::FailedTransport { .. } => None,
        }
    }
}

/// Returns `true` if the ingest API accepted the request.
pub fn is_accepted_status(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::ACCEPTED
}

/// Classifies a response into a chunk outcome.
///
/// The body is parsed on a best-effort basis: an unparsable acknowledgment is logged but doesn't
/// change whether the chunk counts as delivered.
pub fn classify_response(response: &TransportResponse) -> ChunkOutcome {
    let status = response.status;
    let ack = parse_ack(&response.body);

    if !is_accepted_status(status) {
        return ChunkOutcome::FailedStatus { status, ack };
    }

    match ack {
        Some(ack) if ack.lines_invalid > 0 => ChunkOutcome::PartiallyInvalid { status, ack },
        ack => ChunkOutcome::Accepted { status, ack },
    }
}

fn parse_ack(body: &[u8]) -> Option<IngestResponse> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }

    match IngestResponse::parse(body) {
        Ok(ack) => Some(ack),
        Err(e) => {
            warn!(error = %e, body = %String::from_utf8_lossy(body), "Failed to parse ingest response.");
            None
        }
    }
}

// Joins an error and all of its sources into one message.
fn error_chain(error: &TransportError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Sends payloads through a transport, one request per payload.
pub(crate) struct Forwarder<T> {
    transport: T,
    request_timeout: Duration,
}

impl<T: Transport> Forwarder<T> {
    /// Creates a new `Forwarder`.
    pub fn new(transport: T, request_timeout: Duration) -> Self {
        Self { transport, request_timeout }
    }

    /// Sends a single payload, waiting at most for the request timeout.
    ///
    /// Failures are logged and reported in the outcome; the payload is never retried.
    pub async fn forward(&self, payload: Payload) -> ChunkOutcome {
        let Payload { index, body, lines } = payload;
        debug!(chunk = index, lines, bytes = body.len(), "Sending metric lines.");

        let result = match tokio::time::timeout(self.request_timeout, self.transport.send(body)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.request_timeout)),
        };

        let outcome = match result {
            Ok(response) => classify_response(&response),
            Err(e) => ChunkOutcome::FailedTransport { reason: error_chain(&e) },
        };

        match &outcome {
            ChunkOutcome::Accepted { status, ack } => {
                debug!(
                    chunk = index,
                    status = status.as_u16(),
                    lines_ok = ack.as_ref().map(|ack| ack.lines_ok),
                    "Metric lines accepted."
                );
            }
            ChunkOutcome::PartiallyInvalid { status, ack } => {
                warn!(
                    chunk = index,
                    status = status.as_u16(),
                    lines_ok = ack.lines_ok,
                    lines_invalid = ack.lines_invalid,
                    error = ack.error.as_ref().map(tracing::field::display),
                    "Ingest API rejected some metric lines."
                );
            }
            ChunkOutcome::FailedStatus { status, ack } => {
                error!(
                    chunk = index,
                    lines,
                    status = status.as_u16(),
                    error = ack.as_ref().and_then(|ack| ack.error.as_ref()).map(tracing::field::display),
                    "Unexpected status after sending metric lines."
                );
            }
            ChunkOutcome::FailedTransport { reason } => {
                error!(chunk = index, lines, error = %reason, "Failed to send metric lines.");
            }
        }

        outcome
    }
}
