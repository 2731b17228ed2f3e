use std::{future::Future, sync::OnceLock};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    attributes::{AttributeSet, NormalizedAttributes},
    builder::ProtocolCapabilities,
    forwarder::{ChunkOutcome, Forwarder, Transport},
    normalize::normalize_metric_name,
    record::MetricRecord,
    telemetry::{Telemetry, TelemetryUpdate},
    value::encode_value,
    writer::{prefixed_name, write_line, LineWriter, Payloads},
};

/// Exporter configuration, fixed when the exporter is built.
pub(crate) struct ExporterConfiguration {
    pub prefix: Option<String>,
    pub default_attributes: NormalizedAttributes,
    pub static_attributes: NormalizedAttributes,
    pub capabilities: ProtocolCapabilities,
    pub telemetry: bool,
}

/// The result of sending one chunk, with its position in the export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkReport {
    /// Position of the chunk within the export, starting at zero.
    pub index: usize,

    /// Number of lines in the chunk.
    pub lines: usize,

    /// What happened to the chunk.
    pub outcome: ChunkOutcome,
}

/// Summary of a single export call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportSummary {
    /// Number of records handed to the export.
    pub records: usize,

    /// Number of lines that were encoded.
    pub lines_encoded: usize,

    /// Number of records that were skipped because they could not be encoded.
    pub records_dropped: usize,

    /// Outcome of every chunk that was sent, in order.
    pub chunks: Vec<ChunkReport>,
}

impl ExportSummary {
    /// Returns the chunks that were not delivered.
    pub fn failed_chunks(&self) -> impl Iterator<Item = &ChunkReport> {
        self.chunks.iter().filter(|chunk| !chunk.outcome.is_success())
    }
}

/// Errors that could occur during an export.
#[derive(Debug, Error)]
pub enum ExportError {
    /// At least one chunk was not delivered.
    ///
    /// Every chunk was still attempted; the summary has the outcome of each of them.
    #[error("failed to deliver {} of {} chunks (indices {failed:?})", .failed.len(), .summary.chunks.len())]
    Delivery {
        /// Indices of the chunks that were not delivered.
        failed: Vec<usize>,

        /// Summary of the whole export.
        summary: ExportSummary,
    },

    /// The export was cancelled before every chunk was sent.
    ///
    /// Chunks that weren't sent yet are dropped; the summary lists the chunks that were.
    #[error("export cancelled after {} of {total_chunks} chunks", .summary.chunks.len())]
    Cancelled {
        /// Number of chunks the export would have sent.
        total_chunks: usize,

        /// Summary of the chunks sent before cancellation.
        summary: ExportSummary,
    },
}

/// Encodes metric records into the Dynatrace line protocol and sends them to the ingest API.
///
/// Each call to [`export`](DynatraceExporter::export) encodes the given records into lines, splits
/// the lines into chunks no larger than the configured maximum, and sends the chunks one after the
/// other. A failed chunk is logged and never retried, and the remaining chunks are still sent.
///
/// The exporter keeps no state between calls: records must be fully aggregated by the caller.
pub struct DynatraceExporter<T> {
    config: ExporterConfiguration,
    forwarder: Forwarder<T>,
    telemetry: OnceLock<Telemetry>,
}

impl<T: Transport> DynatraceExporter<T> {
    pub(crate) fn new(config: ExporterConfiguration, forwarder: Forwarder<T>) -> Self {
        Self { config, forwarder, telemetry: OnceLock::new() }
    }

    /// Exports a batch of records.
    ///
    /// # Errors
    ///
    /// If any chunk was not delivered, [`ExportError::Delivery`] is returned after all chunks were
    /// attempted. Records that can't be encoded are skipped with a warning and don't fail the
    /// export.
    pub async fn export<'a, I>(&self, records: I) -> Result<ExportSummary, ExportError>
    where
        I: IntoIterator<Item = &'a MetricRecord>,
    {
        self.export_until(records, std::future::pending()).await
    }

    /// Exports a batch of records, stopping early once `cancel` completes.
    ///
    /// Cancellation is checked before every chunk and while a chunk is in flight. The in-flight
    /// request is abandoned and no further chunks are sent.
    ///
    /// # Errors
    ///
    /// If cancelled, [`ExportError::Cancelled`] is returned. Otherwise, behaves like
    /// [`export`](DynatraceExporter::export).
    pub async fn export_until<'a, I, F>(&self, records: I, cancel: F) -> Result<ExportSummary, ExportError>
    where
        I: IntoIterator<Item = &'a MetricRecord>,
        F: Future<Output = ()>,
    {
        let mut telemetry_update = TelemetryUpdate::default();
        let (payloads, summary) = self.encode(records, &mut telemetry_update);

        debug!(
            records = summary.records,
            lines = summary.lines_encoded,
            dropped = summary.records_dropped,
            num_payloads = payloads.len(),
            "Encoded metric records."
        );

        self.send_payloads(payloads, summary, telemetry_update, cancel).await
    }

    /// Sends already encoded lines.
    ///
    /// Items are lines in the line protocol. An item holding several `\n`-separated lines is split,
    /// so every line counts against the per-request limit. Empty lines are skipped. The lines are
    /// chunked and sent exactly as [`export`](DynatraceExporter::export) sends encoded records; the
    /// summary's record counts are zero.
    ///
    /// # Errors
    ///
    /// If any chunk was not delivered, [`ExportError::Delivery`] is returned after all chunks were
    /// attempted.
    pub async fn send_lines<I>(&self, lines: I) -> Result<ExportSummary, ExportError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut writer = LineWriter::new(self.config.capabilities.max_lines_per_request);
        for line in lines {
            writer.write_line(line.as_ref());
        }

        let summary = ExportSummary { lines_encoded: writer.lines_written() as usize, ..Default::default() };
        let payloads = writer.into_payloads();
        self.send_payloads(payloads, summary, TelemetryUpdate::default(), std::future::pending()).await
    }

    async fn send_payloads<F>(
        &self,
        payloads: Payloads,
        mut summary: ExportSummary,
        mut telemetry_update: TelemetryUpdate,
        cancel: F,
    ) -> Result<ExportSummary, ExportError>
    where
        F: Future<Output = ()>,
    {
        let total_chunks = payloads.len();
        let mut cancel = std::pin::pin!(cancel);
        let mut cancelled = false;

        for payload in payloads {
            let index = payload.index;
            let lines = payload.lines;
            let bytes_len = payload.body.len();

            let outcome = tokio::select! {
                biased;

                () = &mut cancel => {
                    cancelled = true;
                    break;
                }
                outcome = self.forwarder.forward(payload) => outcome,
            };

            telemetry_update.track_request(bytes_len, &outcome);
            summary.chunks.push(ChunkReport { index, lines, outcome });
        }

        self.update_telemetry(&telemetry_update);

        if cancelled {
            warn!(
                chunks_sent = summary.chunks.len(),
                total_chunks, "Export cancelled, dropping remaining metric lines."
            );
            return Err(ExportError::Cancelled { total_chunks, summary });
        }

        let failed = summary.failed_chunks().map(|chunk| chunk.index).collect::<Vec<_>>();
        if failed.is_empty() {
            debug!(chunks = total_chunks, "Finished sending metric lines.");
            Ok(summary)
        } else {
            Err(ExportError::Delivery { failed, summary })
        }
    }

    /// Encodes records into lines, without sending them.
    ///
    /// Records that can't be encoded are skipped, the same way [`export`](DynatraceExporter::export)
    /// skips them.
    pub fn encode_lines<'a, I>(&self, records: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a MetricRecord>,
    {
        let mut lines = Vec::new();
        let mut line = String::new();
        for record in records {
            if self.encode_record(record, &mut line, &mut TelemetryUpdate::default()) {
                lines.push(std::mem::take(&mut line));
            }
        }
        lines
    }

    fn encode<'a, I>(&self, records: I, telemetry_update: &mut TelemetryUpdate) -> (Payloads, ExportSummary)
    where
        I: IntoIterator<Item = &'a MetricRecord>,
    {
        let mut writer = LineWriter::new(self.config.capabilities.max_lines_per_request);
        let mut summary = ExportSummary::default();
        let mut line = String::new();

        for record in records {
            summary.records += 1;
            if self.encode_record(record, &mut line, telemetry_update) {
                writer.write_line(&line);
            } else {
                summary.records_dropped += 1;
            }
        }

        summary.lines_encoded = summary.records - summary.records_dropped;
        telemetry_update.track_records(summary.records as u64, writer.lines_written());

        (writer.into_payloads(), summary)
    }

    // Encodes a single record into `line`, returning `false` if the record was skipped.
    fn encode_record(
        &self,
        record: &MetricRecord,
        line: &mut String,
        telemetry_update: &mut TelemetryUpdate,
    ) -> bool {
        line.clear();

        let raw_name = prefixed_name(self.config.prefix.as_deref(), record.name());
        let name = match normalize_metric_name(&raw_name) {
            Ok(name) => name,
            Err(e) => {
                warn!(metric = %raw_name, error = %e, "Skipping metric with invalid name.");
                telemetry_update.track_invalid_name();
                return false;
            }
        };

        let value = match encode_value(
            record.aggregation(),
            record.instrument_kind(),
            record.temporality(),
            &self.config.capabilities,
        ) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    metric = %name,
                    aggregation = record.aggregation().kind_str(),
                    error = %e,
                    "Skipping metric that could not be encoded."
                );
                telemetry_update.track_encoding_failed(&e);
                return false;
            }
        };

        let attributes = AttributeSet::merge(
            record.attributes(),
            &self.config.default_attributes,
            &self.config.static_attributes,
        );

        write_line(line, &name, &attributes, &value);
        true
    }

    fn update_telemetry(&self, update: &TelemetryUpdate) {
        // If we processed any records, update our telemetry.
        //
        // Telemetry is created lazily so that its metrics are registered with whatever recorder is installed by the
        // time the first export runs, rather than at build time, when there may not be one yet.
        if self.config.telemetry && update.had_updates() {
            self.telemetry.get_or_init(Telemetry::new).apply_update(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::Mutex,
        time::{Duration, UNIX_EPOCH},
    };

    use bytes::Bytes;
    use hyper::StatusCode;
    use proptest::prelude::*;

    use super::{DynatraceExporter, ExportError};
    use crate::{
        builder::{DynatraceBuilder, ProtocolCapabilities},
        forwarder::{ChunkOutcome, Transport, TransportError, TransportFuture, TransportResponse},
        record::{Aggregation, Attribute, InstrumentKind, MetricRecord, Number, Temporality},
    };

    /// Records every request body, answering with a canned status per request.
    #[derive(Default)]
    struct MockTransport {
        requests: Mutex<Vec<Bytes>>,
        failing: HashSet<usize>,
        unreachable: HashSet<usize>,
        hang_from: Option<usize>,
    }

    impl MockTransport {
        fn failing(indices: &[usize]) -> Self {
            Self { failing: indices.iter().copied().collect(), ..Default::default() }
        }

        fn bodies(&self) -> Vec<String> {
            let requests = self.requests.lock().unwrap();
            requests.iter().map(|body| String::from_utf8(body.to_vec()).unwrap()).collect()
        }
    }

    impl Transport for &MockTransport {
        fn send(&self, body: Bytes) -> TransportFuture<'_> {
            let index = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(body.clone());
                requests.len() - 1
            };

            let hang = self.hang_from.is_some_and(|from| index >= from);
            let unreachable = self.unreachable.contains(&index);
            let status = if self.failing.contains(&index) {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::ACCEPTED
            };
            let lines = body.split(|b| *b == b'\n').count();

            Box::pin(async move {
                if hang {
                    std::future::pending::<()>().await;
                }
                if unreachable {
                    return Err(TransportError::Io(std::io::ErrorKind::ConnectionRefused.into()));
                }

                let ack = format!(r#"{{"linesOk":{lines},"linesInvalid":0,"error":null}}"#);
                Ok(TransportResponse { status, body: Bytes::from(ack) })
            })
        }
    }

    fn run<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(future)
    }

    fn exporter(transport: &MockTransport, max_lines: usize) -> DynatraceExporter<&MockTransport> {
        DynatraceBuilder::default()
            .with_max_lines_per_request(max_lines)
            .unwrap()
            .with_telemetry(false)
            .build_with_transport(transport)
    }

    fn gauges(count: usize) -> Vec<MetricRecord> {
        (0..count).map(|i| MetricRecord::gauge(format!("gauge_{i}"), i as f64)).collect()
    }

    #[test]
    fn encodes_records_into_lines() {
        let transport = MockTransport::default();
        let exporter = DynatraceBuilder::default()
            .with_prefix("prefix")
            .with_default_attributes([Attribute::new("env", "default"), Attribute::new("region", "eu")])
            .with_static_attributes([Attribute::new("env", "static")])
            .with_telemetry(false)
            .build_with_transport(&transport);

        let timestamp = UNIX_EPOCH + Duration::from_millis(1_617_294_000_000);
        let records = [
            MetricRecord::counter("requests", 11.0).with_attributes([Attribute::new("Status Code", 200i64)]),
            MetricRecord::counter("total", 110.0).with_temporality(Temporality::Cumulative),
            MetricRecord::new(
                "temperature",
                InstrumentKind::Gauge,
                Aggregation::LastValue { value: Number::F64(21.5), timestamp: Some(timestamp) },
            )
            .with_attributes([Attribute::new("region", "us")]),
            MetricRecord::new(
                "latency",
                InstrumentKind::Histogram,
                Aggregation::Histogram {
                    sum: 21.0,
                    count: 4,
                    boundaries: vec![2.0, 4.0, 8.0],
                    counts: vec![1, 1, 1, 1],
                },
            ),
        ];

        let lines = exporter.encode_lines(&records);
        assert_eq!(
            lines,
            [
                r#"prefix.requests,env="static",region="eu",status_code="200" count,delta=11"#,
                r#"prefix.total,env="static",region="eu" count,110"#,
                r#"prefix.temperature,env="static",region="us" gauge,21.5 1617294000000"#,
                r#"prefix.latency,env="static",region="eu" gauge,min=2,max=8,sum=21,count=4"#,
            ]
        );
    }

    #[test]
    fn skips_records_that_cannot_be_encoded() {
        let transport = MockTransport::default();
        let exporter = DynatraceBuilder::default()
            .with_capabilities(ProtocolCapabilities { supports_histograms: false, ..Default::default() })
            .with_telemetry(false)
            .build_with_transport(&transport);

        let records = [
            MetricRecord::gauge("valid", 1.0),
            MetricRecord::gauge("~~~", 1.0),
            MetricRecord::gauge("not_finite", f64::NAN),
            MetricRecord::new(
                "summary",
                InstrumentKind::Histogram,
                Aggregation::Summary { min: Number::F64(1.0), max: Number::F64(2.0), sum: Number::F64(3.0), count: 2 },
            ),
            MetricRecord::counter("also_valid", 2.0),
        ];

        let summary = run(exporter.export(&records)).unwrap();
        assert_eq!(summary.records, 5);
        assert_eq!(summary.records_dropped, 3);
        assert_eq!(summary.lines_encoded, 2);
        assert_eq!(transport.bodies(), ["valid gauge,1\nalso_valid count,delta=2"]);
    }

    #[test]
    fn empty_export_sends_nothing() {
        let transport = MockTransport::default();
        let exporter = exporter(&transport, 10);

        let summary = run(exporter.export(&gauges(0))).unwrap();
        assert_eq!(summary.records, 0);
        assert!(summary.chunks.is_empty());
        assert!(transport.bodies().is_empty());

        // Records that are all dropped also send nothing.
        let summary = run(exporter.export(&[MetricRecord::gauge("123", 1.0)])).unwrap();
        assert_eq!(summary.records_dropped, 1);
        assert!(transport.bodies().is_empty());
    }

    #[test]
    fn failed_chunk_does_not_stop_export() {
        let transport = MockTransport::failing(&[1]);
        let exporter = exporter(&transport, 2);

        let records = gauges(5);
        let result = run(exporter.export(&records));

        let Err(ExportError::Delivery { failed, summary }) = result else {
            panic!("expected delivery error");
        };
        assert_eq!(failed, [1]);
        assert_eq!(summary.chunks.len(), 3);
        assert!(summary.chunks[0].outcome.is_success());
        assert_eq!(
            summary.chunks[1].outcome,
            ChunkOutcome::FailedStatus {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                ack: Some(crate::forwarder::IngestResponse { lines_ok: 2, lines_invalid: 0, error: None }),
            }
        );
        assert!(summary.chunks[2].outcome.is_success());

        assert_eq!(
            transport.bodies(),
            ["gauge_0 gauge,0\ngauge_1 gauge,1", "gauge_2 gauge,2\ngauge_3 gauge,3", "gauge_4 gauge,4"]
        );
    }

    #[test]
    fn transport_errors_are_reported_per_chunk() {
        let transport = MockTransport { unreachable: [0, 2].into_iter().collect(), ..Default::default() };
        let exporter = exporter(&transport, 1);

        let records = gauges(3);
        let Err(ExportError::Delivery { failed, summary }) = run(exporter.export(&records)) else {
            panic!("expected delivery error");
        };
        assert_eq!(failed, [0, 2]);
        assert!(matches!(summary.chunks[0].outcome, ChunkOutcome::FailedTransport { .. }));
        assert!(summary.chunks[1].outcome.is_success());
        assert_eq!(transport.bodies().len(), 3);
    }

    #[test]
    fn cancellation_stops_remaining_chunks() {
        let transport = MockTransport { hang_from: Some(1), ..Default::default() };
        let exporter = exporter(&transport, 1);

        let records = gauges(4);
        let result = run(async {
            let cancel = tokio::time::sleep(Duration::from_millis(50));
            exporter.export_until(&records, cancel).await
        });

        let Err(ExportError::Cancelled { total_chunks, summary }) = result else {
            panic!("expected cancellation");
        };
        assert_eq!(total_chunks, 4);
        assert_eq!(summary.chunks.len(), 1);
        // The hanging request was started, but nothing after it.
        assert_eq!(transport.bodies().len(), 2);
    }

    #[test]
    fn sends_preencoded_lines() {
        let transport = MockTransport::default();
        let exporter = exporter(&transport, 2);

        let lines = ["a gauge,1", "", "b gauge,2", "c count,delta=3"];
        let summary = run(exporter.send_lines(lines)).unwrap();
        assert_eq!(summary.records, 0);
        assert_eq!(summary.lines_encoded, 3);
        assert_eq!(transport.bodies(), ["a gauge,1\nb gauge,2", "c count,delta=3"]);
    }

    #[test]
    fn multiline_items_respect_line_limit() {
        let transport = MockTransport::default();
        let exporter = exporter(&transport, 2);

        let summary = run(exporter.send_lines(["a gauge,1\nb gauge,2\nc gauge,3", "d gauge,4"])).unwrap();
        assert_eq!(summary.lines_encoded, 4);
        assert_eq!(summary.chunks.iter().map(|chunk| chunk.lines).collect::<Vec<_>>(), [2, 2]);
        assert_eq!(transport.bodies(), ["a gauge,1\nb gauge,2", "c gauge,3\nd gauge,4"]);
    }

    #[test]
    fn integer_values_are_not_rounded() {
        let transport = MockTransport::default();
        let exporter = exporter(&transport, 10);

        let records = [
            MetricRecord::counter("requests", 9_007_199_254_740_993i64),
            MetricRecord::gauge("bytes", i64::MAX),
            MetricRecord::counter("ratio", 0.25),
        ];
        assert_eq!(
            exporter.encode_lines(&records),
            [
                "requests count,delta=9007199254740993",
                "bytes gauge,9223372036854775807",
                "ratio count,delta=0.25",
            ]
        );
    }

    #[test]
    fn cancelled_before_start_sends_nothing() {
        let transport = MockTransport::default();
        let exporter = exporter(&transport, 1);

        let result = run(exporter.export_until(&gauges(3), std::future::ready(())));
        assert!(matches!(result, Err(ExportError::Cancelled { total_chunks: 3, .. })));
        assert!(transport.bodies().is_empty());
    }

    #[test]
    fn request_timeout_fails_chunk() {
        let transport = MockTransport { hang_from: Some(0), ..Default::default() };
        let exporter = DynatraceBuilder::default()
            .with_request_timeout(Duration::from_millis(10))
            .with_telemetry(false)
            .build_with_transport(&transport);

        let Err(ExportError::Delivery { failed, summary }) = run(exporter.export(&gauges(1))) else {
            panic!("expected delivery error");
        };
        assert_eq!(failed, [0]);
        let ChunkOutcome::FailedTransport { reason } = &summary.chunks[0].outcome else {
            panic!("expected transport failure");
        };
        assert!(reason.contains("timed out"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn sends_one_request_per_chunk(records in 0..200usize, max_lines in 1..50usize) {
            let transport = MockTransport::default();
            let exporter = exporter(&transport, max_lines);

            let summary = run(exporter.export(&gauges(records))).unwrap();
            let bodies = transport.bodies();
            prop_assert_eq!(bodies.len(), records.div_ceil(max_lines));
            prop_assert_eq!(summary.chunks.len(), bodies.len());

            let mut seen = 0;
            for (i, body) in bodies.iter().enumerate() {
                let lines = body.split('\n').collect::<Vec<_>>();
                prop_assert!(lines.len() <= max_lines);
                prop_assert_eq!(summary.chunks[i].lines, lines.len());
                for line in lines {
                    prop_assert_eq!(line, format!("gauge_{seen} gauge,{seen}"));
                    seen += 1;
                }
            }
            prop_assert_eq!(seen, records);
        }
    }
}
