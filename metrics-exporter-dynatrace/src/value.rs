//! Encoding of aggregation results into value clauses.
use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

use crate::{
    builder::ProtocolCapabilities,
    record::{Aggregation, InstrumentKind, Number, Temporality},
};

/// Errors that prevent an aggregation from being encoded.
///
/// The affected record is skipped; the rest of the export continues.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EncodingError {
    /// The aggregation kind can't be expressed with the configured protocol capabilities.
    #[error("unsupported aggregation '{aggregation}'")]
    UnsupportedAggregation {
        /// Name of the aggregation kind.
        aggregation: &'static str,
    },

    /// The histogram's bucket counts don't line up with its boundaries.
    #[error("histogram has {counts} bucket counts for {boundaries} boundaries (expected boundaries + 1)")]
    InvalidHistogram {
        /// Number of boundaries.
        boundaries: usize,
        /// Number of bucket counts.
        counts: usize,
    },

    /// A value is NaN or infinite, which the line protocol can't represent.
    #[error("value is not finite")]
    NonFiniteValue,
}

/// The value portion of a metric line.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ValueClause {
    /// A counter increase since the last report: `count,delta=<value>`.
    CounterDelta(Number),

    /// A counter running total: `count,<value>`.
    CounterTotal(Number),

    /// An instantaneous value: `gauge,<value>`, optionally followed by a Unix timestamp in
    /// milliseconds.
    Gauge {
        /// The value.
        value: Number,
        /// When the value was observed.
        timestamp_ms: Option<u64>,
    },

    /// A distribution summary: `gauge,min=<min>,max=<max>,sum=<sum>,count=<count>`.
    Summary {
        /// Smallest value, possibly estimated.
        min: Number,
        /// Largest value, possibly estimated.
        max: Number,
        /// Sum of all values.
        sum: Number,
        /// Number of values.
        count: u64,
    },
}

impl ValueClause {
    pub(crate) fn write_to(&self, buf: &mut String) {
        match *self {
            ValueClause::CounterDelta(value) => {
                buf.push_str("count,delta=");
                write_number(buf, value);
            }
            ValueClause::CounterTotal(value) => {
                buf.push_str("count,");
                write_number(buf, value);
            }
            ValueClause::Gauge { value, timestamp_ms } => {
                buf.push_str("gauge,");
                write_number(buf, value);
                if let Some(timestamp_ms) = timestamp_ms {
                    buf.push(' ');
                    buf.push_str(itoa::Buffer::new().format(timestamp_ms));
                }
            }
            ValueClause::Summary { min, max, sum, count } => {
                buf.push_str("gauge,min=");
                write_number(buf, min);
                buf.push_str(",max=");
                write_number(buf, max);
                buf.push_str(",sum=");
                write_number(buf, sum);
                buf.push_str(",count=");
                buf.push_str(itoa::Buffer::new().format(count));
            }
        }
    }
}

impl fmt::Display for ValueClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = String::new();
        self.write_to(&mut buf);
        f.write_str(&buf)
    }
}

/// Encodes an aggregation result into a value clause.
///
/// Integer values are written as plain decimals, float values with [`format_float`].
///
/// - A sum from a counter becomes `count,delta=<value>` with delta temporality, or
///   `count,<value>` with cumulative temporality.
/// - A sum from any other instrument becomes `gauge,<value>`.
/// - A last value becomes `gauge,<value>`, with its timestamp appended when the source supplied
///   one and the protocol supports timestamps.
/// - A histogram becomes a summary whose min/max are estimated from its buckets, see
///   [`estimate_histogram_min_max`].
/// - A summary is written as is.
///
/// # Errors
///
/// Returns an error if the aggregation is a histogram or summary and the protocol doesn't support
/// them, if a histogram's buckets are malformed, or if any value to be written is not finite.
pub fn encode_value(
    aggregation: &Aggregation,
    instrument_kind: InstrumentKind,
    temporality: Temporality,
    capabilities: &ProtocolCapabilities,
) -> Result<ValueClause, EncodingError> {
    let clause = match aggregation {
        Aggregation::Sum(value) if instrument_kind.is_monotonic() => match temporality {
            Temporality::Delta => ValueClause::CounterDelta(*value),
            Temporality::Cumulative => ValueClause::CounterTotal(*value),
        },
        Aggregation::Sum(value) => ValueClause::Gauge { value: *value, timestamp_ms: None },
        Aggregation::LastValue { value, timestamp } => {
            let timestamp_ms =
                if capabilities.supports_timestamps { (*timestamp).and_then(unix_millis) } else { None };
            ValueClause::Gauge { value: *value, timestamp_ms }
        }
        Aggregation::Histogram { sum, count, boundaries, counts } => {
            if !capabilities.supports_histograms {
                return Err(EncodingError::UnsupportedAggregation { aggregation: aggregation.kind_str() });
            }

            if counts.len() != boundaries.len() + 1 {
                return Err(EncodingError::InvalidHistogram {
                    boundaries: boundaries.len(),
                    counts: counts.len(),
                });
            }

            let (min, max) = if boundaries.is_empty() {
                // A single bucket unbounded on both sides says nothing about the extremes, so the
                // mean is the only estimate available.
                let mean = if *count == 0 { 0.0 } else { sum / *count as f64 };
                (mean, mean)
            } else {
                estimate_histogram_min_max(boundaries, counts)
            };

            ValueClause::Summary {
                min: Number::F64(min),
                max: Number::F64(max),
                sum: Number::F64(*sum),
                count: *count,
            }
        }
        Aggregation::Summary { min, max, sum, count } => {
            if !capabilities.supports_histograms {
                return Err(EncodingError::UnsupportedAggregation { aggregation: aggregation.kind_str() });
            }

            ValueClause::Summary { min: *min, max: *max, sum: *sum, count: *count }
        }
    };

    if clause_is_finite(&clause) {
        Ok(clause)
    } else {
        Err(EncodingError::NonFiniteValue)
    }
}

/// Estimates the minimum and maximum of a bucketed histogram.
///
/// A bucketed histogram doesn't track its true extremes, so they are approximated from the first
/// and last non-empty buckets. The minimum is the lower edge of the first non-empty bucket, or its
/// upper edge if it is the first bucket (which has no lower edge). The maximum is the upper edge of
/// the last non-empty bucket, or its lower edge if it is the last bucket (which has no upper edge).
/// If every bucket is empty, both are zero.
///
/// This is an approximation, not the true minimum/maximum of the recorded values.
///
/// `counts` must have exactly one more entry than `boundaries`, and `boundaries` must not be
/// empty; otherwise both estimates fall back to zero.
pub fn estimate_histogram_min_max(boundaries: &[f64], counts: &[u64]) -> (f64, f64) {
    if boundaries.is_empty() || counts.len() != boundaries.len() + 1 {
        return (0.0, 0.0);
    }

    let Some(min_idx) = counts.iter().position(|count| *count > 0) else {
        return (0.0, 0.0);
    };
    let max_idx = counts.iter().rposition(|count| *count > 0).unwrap_or(min_idx);
    let last_idx = counts.len() - 1;

    let min = if min_idx == 0 { boundaries[0] } else { boundaries[min_idx - 1] };
    let max = if max_idx == last_idx { boundaries[max_idx - 1] } else { boundaries[max_idx] };

    (min, max)
}

/// Formats a floating-point value for the line protocol.
///
/// The value is rounded to six decimal places, after which trailing zeros in the fraction and a
/// trailing decimal point are removed. Negative zero is written as `0`.
pub fn format_float(value: f64) -> String {
    let mut formatted = format!("{value:.6}");
    if formatted.contains('.') {
        let trimmed_len = formatted.trim_end_matches('0').trim_end_matches('.').len();
        formatted.truncate(trimmed_len);
    }

    if formatted.is_empty() || formatted == "-0" {
        formatted.clear();
        formatted.push('0');
    }

    formatted
}

fn write_number(buf: &mut String, value: Number) {
    match value {
        Number::I64(value) => buf.push_str(itoa::Buffer::new().format(value)),
        Number::F64(value) => buf.push_str(&format_float(value)),
    }
}

fn clause_is_finite(clause: &ValueClause) -> bool {
    match *clause {
        ValueClause::CounterDelta(value) | ValueClause::CounterTotal(value) => value.is_finite(),
        ValueClause::Gauge { value, .. } => value.is_finite(),
        ValueClause::Summary { min, max, sum, .. } => {
            min.is_finite() && max.is_finite() && sum.is_finite()
        }
    }
}

fn unix_millis(timestamp: SystemTime) -> Option<u64> {
    let since_epoch = timestamp.duration_since(UNIX_EPOCH).ok()?;
    u64::try_from(since_epoch.as_millis()).ok()
}
