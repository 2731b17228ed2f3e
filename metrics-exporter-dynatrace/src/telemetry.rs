use metrics::{counter, Counter};

use crate::{forwarder::ChunkOutcome, value::EncodingError};

/// Exporter telemetry.
///
/// `Telemetry` collects information about the exporter's behavior and can be optionally enabled to send this
/// information as normal metrics through the globally installed recorder.
pub struct Telemetry {
    records: Counter,
    lines_encoded: Counter,
    records_dropped_name: Counter,
    records_dropped_unsupported: Counter,
    records_dropped_histogram: Counter,
    records_dropped_non_finite: Counter,
    requests_sent: Counter,
    requests_failed_status: Counter,
    requests_failed_transport: Counter,
    bytes_sent: Counter,
    lines_ok: Counter,
    lines_invalid: Counter,
}

impl Telemetry {
    /// Creates a `Telemetry` instance.
    pub fn new() -> Self {
        let base_labels = telemetry_tags!();
        let name_labels = telemetry_tags!("reason" => "invalid_name");
        let unsupported_labels = telemetry_tags!("reason" => "unsupported_aggregation");
        let histogram_labels = telemetry_tags!("reason" => "invalid_histogram");
        let non_finite_labels = telemetry_tags!("reason" => "non_finite_value");
        let status_labels = telemetry_tags!("reason" => "status");
        let transport_labels = telemetry_tags!("reason" => "transport");

        Self {
            records: counter!("dynatrace.exporter.records", base_labels.iter()),
            lines_encoded: counter!("dynatrace.exporter.lines_encoded", base_labels.iter()),
            records_dropped_name: counter!(
                "dynatrace.exporter.records_dropped",
                name_labels.iter()
            ),
            records_dropped_unsupported: counter!(
                "dynatrace.exporter.records_dropped",
                unsupported_labels.iter()
            ),
            records_dropped_histogram: counter!(
                "dynatrace.exporter.records_dropped",
                histogram_labels.iter()
            ),
            records_dropped_non_finite: counter!(
                "dynatrace.exporter.records_dropped",
                non_finite_labels.iter()
            ),
            requests_sent: counter!("dynatrace.exporter.requests_sent", base_labels.iter()),
            requests_failed_status: counter!(
                "dynatrace.exporter.requests_failed",
                status_labels.iter()
            ),
            requests_failed_transport: counter!(
                "dynatrace.exporter.requests_failed",
                transport_labels.iter()
            ),
            bytes_sent: counter!("dynatrace.exporter.bytes_sent", base_labels.iter()),
            lines_ok: counter!("dynatrace.exporter.lines_ok", base_labels.iter()),
            lines_invalid: counter!("dynatrace.exporter.lines_invalid", base_labels.iter()),
        }
    }

    /// Applies the given telemetry update, updating the internal metrics.
    pub fn apply_update(&self, update: &TelemetryUpdate) {
        self.records.increment(update.records);
        self.lines_encoded.increment(update.lines_encoded);
        self.records_dropped_name.increment(update.dropped_invalid_name);
        self.records_dropped_unsupported.increment(update.dropped_unsupported);
        self.records_dropped_histogram.increment(update.dropped_invalid_histogram);
        self.records_dropped_non_finite.increment(update.dropped_non_finite);
        self.requests_sent.increment(update.requests_sent);
        self.requests_failed_status.increment(update.requests_failed_status);
        self.requests_failed_transport.increment(update.requests_failed_transport);
        self.bytes_sent.increment(update.bytes_sent);
        self.lines_ok.increment(update.lines_ok);
        self.lines_invalid.increment(update.lines_invalid);
    }
}

/// A buffer for collecting telemetry updates.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TelemetryUpdate {
    records: u64,
    lines_encoded: u64,
    dropped_invalid_name: u64,
    dropped_unsupported: u64,
    dropped_invalid_histogram: u64,
    dropped_non_finite: u64,
    requests_sent: u64,
    requests_failed_status: u64,
    requests_failed_transport: u64,
    bytes_sent: u64,
    lines_ok: u64,
    lines_invalid: u64,
}

impl TelemetryUpdate {
    /// Returns `true` if any updates have been recorded.
    pub fn had_updates(&self) -> bool {
        *self != Self::default()
    }

    /// Tracks the records handed to a single export call.
    pub fn track_records(&mut self, records: u64, lines_encoded: u64) {
        self.records += records;
        self.lines_encoded += lines_encoded;
    }

    /// Tracks a record dropped because its name could not be normalized.
    pub fn track_invalid_name(&mut self) {
        self.dropped_invalid_name += 1;
    }

    /// Tracks a record dropped because its value could not be encoded.
    pub fn track_encoding_failed(&mut self, error: &EncodingError) {
        match error {
            EncodingError::UnsupportedAggregation { .. } => self.dropped_unsupported += 1,
            EncodingError::InvalidHistogram { .. } => self.dropped_invalid_histogram += 1,
            EncodingError::NonFiniteValue => self.dropped_non_finite += 1,
        }
    }

    /// Tracks the outcome of a single request.
    pub fn track_request(&mut self, bytes_len: usize, outcome: &ChunkOutcome) {
        match outcome {
            ChunkOutcome::Accepted { .. } | ChunkOutcome::PartiallyInvalid { .. } => {
                self.requests_sent += 1;
                self.bytes_sent += bytes_len as u64;
            }
            ChunkOutcome::FailedStatus { .. } => self.requests_failed_status += 1,
            ChunkOutcome::FailedTransport { .. } => self.requests_failed_transport += 1,
        }

        if let Some(ack) = outcome.ack() {
            self.lines_ok += ack.lines_ok;
            self.lines_invalid += ack.lines_invalid;
        }
    }
}

macro_rules! _telemetry_tags {
    ($($k:literal => $v:expr),*) => {
        [
            ::metrics::Label::from_static_parts("client", "rust"),
            ::metrics::Label::from_static_parts("client_version", env!("CARGO_PKG_VERSION")),
            $(::metrics::Label::from_static_parts($k, $v),)*
        ]
    };
}

pub(crate) use _telemetry_tags as telemetry_tags;

#[cfg(test)]
mod tests {
    use hyper::StatusCode;

    use super::TelemetryUpdate;
    use crate::{
        forwarder::{ChunkOutcome, IngestResponse},
        value::EncodingError,
    };

    #[test]
    fn tracks_updates() {
        let mut update = TelemetryUpdate::default();
        assert!(!update.had_updates());

        update.track_invalid_name();
        assert!(update.had_updates());

        update.track_encoding_failed(&EncodingError::NonFiniteValue);
        update.track_encoding_failed(&EncodingError::UnsupportedAggregation { aggregation: "histogram" });
        assert_eq!(update.dropped_invalid_name, 1);
        assert_eq!(update.dropped_non_finite, 1);
        assert_eq!(update.dropped_unsupported, 1);

        let ack = IngestResponse { lines_ok: 4, lines_invalid: 1, error: None };
        update.track_request(100, &ChunkOutcome::PartiallyInvalid { status: StatusCode::ACCEPTED, ack });
        update.track_request(50, &ChunkOutcome::FailedStatus { status: StatusCode::BAD_GATEWAY, ack: None });
        update.track_request(50, &ChunkOutcome::FailedTransport { reason: "refused".to_owned() });

        assert_eq!(update.requests_sent, 1);
        assert_eq!(update.bytes_sent, 100);
        assert_eq!(update.requests_failed_status, 1);
        assert_eq!(update.requests_failed_transport, 1);
        assert_eq!((update.lines_ok, update.lines_invalid), (4, 1));
    }
}
