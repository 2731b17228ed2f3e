use std::{num::NonZeroUsize, time::Duration};

use hyper::Uri;
use thiserror::Error;

use crate::{
    attributes::NormalizedAttributes,
    enrichment,
    exporter::{DynatraceExporter, ExporterConfiguration},
    forwarder::{http::HttpTransport, Forwarder, Transport},
    record::Attribute,
};

/// Default ingest endpoint, served by a OneAgent running on the local host.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:14499/metrics/ingest";

/// Maximum number of lines the ingest API accepts in a single request.
pub const DEFAULT_MAX_LINES_PER_REQUEST: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(max_lines) => max_lines,
    None => panic!("default line limit must be non-zero"),
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that could occur while building a Dynatrace exporter.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the ingest endpoint.
    #[error("invalid ingest endpoint: {reason}")]
    InvalidEndpoint {
        /// Details about the parsing failure.
        reason: String,
    },

    /// The API token contains characters that can't be sent in an HTTP header.
    #[error("API token is not a valid header value")]
    InvalidApiToken,

    /// The maximum number of lines per request was zero.
    #[error("maximum lines per request must be greater than zero")]
    InvalidMaxLines,
}

/// What the ingest endpoint is able to accept.
///
/// Different versions of the ingest API differ in what they accept. Rather than carrying one
/// encoder per version, the encoder checks these capabilities and skips metrics the endpoint
/// can't take.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProtocolCapabilities {
    /// Whether histograms and summaries can be sent, as `gauge,min=..,max=..,sum=..,count=..`.
    pub supports_histograms: bool,

    /// Whether gauge lines may carry a timestamp.
    pub supports_timestamps: bool,

    /// Maximum number of lines in a single request.
    pub max_lines_per_request: NonZeroUsize,
}

impl Default for ProtocolCapabilities {
    fn default() -> Self {
        Self {
            supports_histograms: true,
            supports_timestamps: true,
            max_lines_per_request: DEFAULT_MAX_LINES_PER_REQUEST,
        }
    }
}

/// Builder for a Dynatrace exporter.
pub struct DynatraceBuilder {
    endpoint: Uri,
    api_token: Option<String>,
    prefix: Option<String>,
    default_attributes: Vec<Attribute>,
    static_attributes: Vec<Attribute>,
    oneagent_metadata: bool,
    capabilities: ProtocolCapabilities,
    request_timeout: Duration,
    telemetry: bool,
}

impl DynatraceBuilder {
    /// Set the ingest endpoint to send metrics to.
    ///
    /// Both `http` and `https` endpoints are supported.
    ///
    /// Defaults to the local OneAgent endpoint, `http://localhost:14499/metrics/ingest`.
    ///
    /// # Errors
    ///
    /// If the given endpoint cannot be parsed into a valid URI, an error will be returned
    /// describing the reason.
    pub fn with_endpoint<T>(mut self, endpoint: T) -> Result<Self, BuildError>
    where
        T: AsRef<str>,
    {
        self.endpoint = Uri::try_from(endpoint.as_ref())
            .map_err(|e| BuildError::InvalidEndpoint { reason: e.to_string() })?;
        Ok(self)
    }

    /// Set the API token used to authenticate requests.
    ///
    /// The token is sent as `Authorization: Api-Token <token>`. It is not needed when sending to a
    /// local OneAgent.
    ///
    /// Defaults to no token.
    #[must_use]
    pub fn with_api_token<T: Into<String>>(mut self, api_token: T) -> Self {
        self.api_token = Some(api_token.into());
        self
    }

    /// Set a prefix to prepend to every metric name.
    ///
    /// The prefix and the name are joined with a `.` and then normalized together.
    ///
    /// Defaults to no prefix.
    #[must_use]
    pub fn with_prefix<T: Into<String>>(mut self, prefix: T) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set attributes that are added to every metric.
    ///
    /// Default attributes have the lowest precedence: they are overridden by a metric's own
    /// attributes and by static attributes with the same key.
    #[must_use]
    pub fn with_default_attributes<I>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = Attribute>,
    {
        self.default_attributes = attributes.into_iter().collect();
        self
    }

    /// Set static attributes describing the host or process.
    ///
    /// Static attributes have the highest precedence and override any other attribute with the
    /// same key.
    #[must_use]
    pub fn with_static_attributes<I>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = Attribute>,
    {
        self.static_attributes = attributes.into_iter().collect();
        self
    }

    /// Sets whether or not to enrich metrics with OneAgent host metadata.
    ///
    /// When enabled, the metadata exposed by a OneAgent running on the host is read once, while
    /// building, and added to the static attributes. If the metadata can't be read, a warning is
    /// logged and no attributes are added.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_oneagent_metadata(mut self, oneagent_metadata: bool) -> Self {
        self.oneagent_metadata = oneagent_metadata;
        self
    }

    /// Set the capabilities of the ingest endpoint.
    ///
    /// Defaults to [`ProtocolCapabilities::default`], which supports histograms and timestamps
    /// with up to 1,000 lines per request.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: ProtocolCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the maximum number of lines sent in a single request.
    ///
    /// Defaults to 1,000, the limit of the ingest API.
    ///
    /// # Errors
    ///
    /// If `max_lines` is zero, an error will be returned.
    pub fn with_max_lines_per_request(mut self, max_lines: usize) -> Result<Self, BuildError> {
        self.capabilities.max_lines_per_request =
            NonZeroUsize::new(max_lines).ok_or(BuildError::InvalidMaxLines)?;
        Ok(self)
    }

    /// Set the timeout for a single ingest request.
    ///
    /// When the timeout is reached, the request is aborted and its lines are dropped without
    /// retrying. Later requests of the same export are still sent.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets whether or not to enable telemetry for the exporter.
    ///
    /// When enabled, counters describing the exporter itself, such as how many lines were encoded
    /// or dropped and how many requests succeeded or failed, are emitted through the global
    /// `metrics` recorder.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: bool) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Builds the exporter, sending over HTTP.
    ///
    /// # Errors
    ///
    /// If the API token is not a valid header value, an error will be returned.
    pub fn build(self) -> Result<DynatraceExporter<HttpTransport>, BuildError> {
        let transport = HttpTransport::new(self.endpoint.clone(), self.api_token.as_deref())?;
        Ok(self.build_with_transport(transport))
    }

    /// Builds the exporter, sending through the given transport.
    ///
    /// The endpoint and API token are not used; the transport is responsible for delivering the
    /// request bodies.
    pub fn build_with_transport<T: Transport>(self, transport: T) -> DynatraceExporter<T> {
        let mut static_attributes = NormalizedAttributes::new(&self.static_attributes);
        if self.oneagent_metadata {
            static_attributes.extend(&enrichment::read_oneagent_metadata());
        }

        let config = ExporterConfiguration {
            prefix: self.prefix.filter(|prefix| !prefix.is_empty()),
            default_attributes: NormalizedAttributes::new(&self.default_attributes),
            static_attributes,
            capabilities: self.capabilities,
            telemetry: self.telemetry,
        };

        DynatraceExporter::new(config, Forwarder::new(transport, self.request_timeout))
    }
}

impl Default for DynatraceBuilder {
    fn default() -> Self {
        DynatraceBuilder {
            endpoint: Uri::from_static(DEFAULT_ENDPOINT),
            api_token: None,
            prefix: None,
            default_attributes: Vec::new(),
            static_attributes: Vec::new(),
            oneagent_metadata: false,
            capabilities: ProtocolCapabilities::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            telemetry: true,
        }
    }
}
