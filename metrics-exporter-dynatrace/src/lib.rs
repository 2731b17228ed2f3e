//! An exporter for sending metrics to the [Dynatrace metrics ingest API][ingest].
//!
//! [ingest]: https://docs.dynatrace.com/docs/extend-dynatrace/extend-metrics/reference/metric-ingestion-protocol
//!
//! # Usage
//!
//! The exporter takes metric records that were already aggregated elsewhere, such as by an SDK's
//! periodic reader, encodes them into the Dynatrace line protocol, and sends them to the ingest API:
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use metrics_exporter_dynatrace::{Attribute, DynatraceBuilder, MetricRecord};
//!
//! // First, create a builder.
//! //
//! // By default, metrics are sent to a OneAgent running on the local host, which needs no API token. To send
//! // directly to a Dynatrace environment instead, set its ingest endpoint and an API token.
//! let exporter = DynatraceBuilder::default()
//!     .with_endpoint("https://abc12345.live.dynatrace.com/api/v2/metrics/ingest")?
//!     .with_api_token("dt0c01.example")
//!     .with_prefix("my_app")
//!     .with_default_attributes([Attribute::new("env", "production")])
//!     .build()?;
//!
//! // Then, hand it a batch of records whenever a collection cycle completes.
//! let records = [
//!     MetricRecord::counter("requests", 42.0).with_attributes([Attribute::new("method", "GET")]),
//!     MetricRecord::gauge("queue_depth", 7.0),
//! ];
//! let summary = exporter.export(&records).await?;
//! println!("sent {} lines", summary.lines_encoded);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! ## Normalization
//!
//! Metric names and attribute keys are rewritten to fit the line protocol: invalid characters are replaced, leading
//! garbage is stripped, and overlong names are truncated. A metric whose name can't be salvaged is skipped with a
//! warning, along with any metric whose value can't be encoded, without failing the rest of the export.
//!
//! ## Attribute precedence
//!
//! Each line carries attributes from three sources. Default attributes configured on the builder have the lowest
//! precedence, followed by the metric's own attributes, and finally static attributes, which describe the host or
//! process and always win.
//!
//! ## OneAgent enrichment
//!
//! When running on a host monitored by a OneAgent, the exporter can read the host and process metadata exposed by the
//! OneAgent and attach it to every line as static attributes. See
//! [`DynatraceBuilder::with_oneagent_metadata`].
//!
//! ## Request splitting
//!
//! The ingest API accepts a limited number of lines per request. Larger exports are split into several requests, sent
//! one after the other. A request that fails is logged and reported, but doesn't stop the remaining requests, and is
//! never retried.
//!
//! ## Telemetry
//!
//! The exporter captures its own internal telemetry around the number of records encoded or dropped, requests sent or
//! failed, and lines accepted or rejected by the ingest API. This telemetry is emitted through the globally installed
//! `metrics` recorder, under the `dynatrace.exporter` namespace.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

#[cfg(not(any(feature = "aws-lc-rs", feature = "ring")))]
compile_error!("either the `aws-lc-rs` or the `ring` feature must be enabled for TLS support");

mod attributes;
pub use self::attributes::{
    escape_attribute_value, AttributeSet, NormalizedAttributes, MAX_ATTRIBUTE_VALUE_LEN,
};

mod builder;
pub use self::builder::{
    BuildError, DynatraceBuilder, ProtocolCapabilities, DEFAULT_ENDPOINT,
    DEFAULT_MAX_LINES_PER_REQUEST,
};

mod enrichment;
pub use self::enrichment::{parse_oneagent_metadata, read_oneagent_metadata, INDIRECTION_BASENAME};

mod exporter;
pub use self::exporter::{ChunkReport, DynatraceExporter, ExportError, ExportSummary};

mod forwarder;
pub use self::forwarder::{
    classify_response, http::HttpTransport, is_accepted_status, ChunkOutcome, IngestError,
    IngestErrorDetails, IngestResponse, InvalidLine, Transport, TransportError, TransportFuture,
    TransportResponse,
};

mod normalize;
pub use self::normalize::{
    normalize_attribute_key, normalize_metric_name, NormalizationError, MAX_ATTRIBUTE_KEY_LEN,
    MAX_METRIC_NAME_LEN,
};

mod record;
pub use self::record::{
    Aggregation, Attribute, AttributeValue, InstrumentKind, MetricRecord, Number, Temporality,
};

mod telemetry;

mod value;
pub use self::value::{
    encode_value, estimate_histogram_min_max, format_float, EncodingError, ValueClause,
};

mod writer;
pub use self::writer::assemble_line;
