//! Metric records handed to the exporter on every export cycle.
use std::{borrow::Cow, fmt, time::SystemTime};

/// A single attribute value.
///
/// Values are coerced to their textual representation when encoded.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    /// A string value.
    String(Cow<'static, str>),

    /// A signed integer value.
    Int(i64),

    /// A floating-point value.
    Float(f64),

    /// A boolean value.
    Bool(bool),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Int(v) => f.write_str(itoa::Buffer::new().format(*v)),
            AttributeValue::Float(v) => f.write_str(ryu::Buffer::new().format(*v)),
            AttributeValue::Bool(v) => f.write_str(if *v { "true" } else { "false" }),
        }
    }
}

impl From<&'static str> for AttributeValue {
    fn from(value: &'static str) -> Self {
        AttributeValue::String(Cow::Borrowed(value))
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(Cow::Owned(value))
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// A key/value pair attached to a metric.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    key: Cow<'static, str>,
    value: AttributeValue,
}

impl Attribute {
    /// Creates a new `Attribute`.
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<Cow<'static, str>>,
        V: Into<AttributeValue>,
    {
        Self { key: key.into(), value: value.into() }
    }

    /// Returns the raw, unnormalized key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the value.
    pub fn value(&self) -> &AttributeValue {
        &self.value
    }
}

impl From<&metrics::Label> for Attribute {
    fn from(label: &metrics::Label) -> Self {
        Attribute::new(label.key().to_owned(), label.value().to_owned())
    }
}

/// The kind of instrument a metric was recorded with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstrumentKind {
    /// A monotonic sum.
    Counter,

    /// A sum that can go up and down.
    UpDownCounter,

    /// An instantaneous value.
    Gauge,

    /// A distribution of values.
    Histogram,
}

impl InstrumentKind {
    /// Returns `true` if the instrument only ever increases.
    pub const fn is_monotonic(self) -> bool {
        matches!(self, InstrumentKind::Counter)
    }
}

/// Whether a reported value covers the last interval or everything since start.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Temporality {
    /// The value is the change since the previous report.
    #[default]
    Delta,

    /// The value is a running total since the start of collection.
    Cumulative,
}

/// A measured value, in the number kind the instrument recorded it with.
///
/// Integers are written as plain decimals and keep their full 64-bit precision.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Number {
    /// A signed integer.
    I64(i64),

    /// A floating-point value.
    F64(f64),
}

impl Number {
    /// Returns `true` unless this is a NaN or infinite float.
    pub fn is_finite(self) -> bool {
        match self {
            Number::I64(_) => true,
            Number::F64(v) => v.is_finite(),
        }
    }

    /// Returns the value as a float, rounding integers beyond 2^53.
    pub fn as_f64(self) -> f64 {
        match self {
            Number::I64(v) => v as f64,
            Number::F64(v) => v,
        }
    }
}

impl From<i64> for Number {
    fn from(value: i64) -> Self {
        Number::I64(value)
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        Number::F64(value)
    }
}

/// The result of aggregating measurements over a collection interval.
#[derive(Clone, Debug, PartialEq)]
pub enum Aggregation {
    /// The sum of all measurements.
    Sum(Number),

    /// The last observed measurement, optionally with the time it was observed.
    LastValue {
        /// The observed value.
        value: Number,
        /// When the value was observed.
        timestamp: Option<SystemTime>,
    },

    /// A bucketed distribution.
    ///
    /// `counts` holds one more entry than `boundaries`: bucket `i` covers
    /// `(boundaries[i - 1], boundaries[i]]`, with the first bucket unbounded below and the last
    /// bucket unbounded above.
    Histogram {
        /// Sum of all recorded values.
        sum: f64,
        /// Number of recorded values.
        count: u64,
        /// Upper bounds of every bucket except the last.
        boundaries: Vec<f64>,
        /// Number of values per bucket.
        counts: Vec<u64>,
    },

    /// A distribution summary with exact extremes.
    Summary {
        /// Smallest recorded value.
        min: Number,
        /// Largest recorded value.
        max: Number,
        /// Sum of all recorded values.
        sum: Number,
        /// Number of recorded values.
        count: u64,
    },
}

impl Aggregation {
    /// Returns a short name for the aggregation, used in diagnostics.
    pub const fn kind_str(&self) -> &'static str {
        match self {
            Aggregation::Sum(_) => "sum",
            Aggregation::LastValue { .. } => "last_value",
            Aggregation::Histogram { .. } => "histogram",
            Aggregation::Summary { .. } => "summary",
        }
    }
}

/// A single metric to be exported.
///
/// Records are read-only to the exporter and only need to live for the duration of one
/// [`export`][crate::DynatraceExporter::export] call.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricRecord {
    name: Cow<'static, str>,
    attributes: Vec<Attribute>,
    aggregation: Aggregation,
    instrument_kind: InstrumentKind,
    temporality: Temporality,
}

impl MetricRecord {
    /// Creates a new `MetricRecord` with delta temporality and no attributes.
    pub fn new<N>(name: N, instrument_kind: InstrumentKind, aggregation: Aggregation) -> Self
    where
        N: Into<Cow<'static, str>>,
    {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            aggregation,
            instrument_kind,
            temporality: Temporality::Delta,
        }
    }

    /// Creates a counter record holding the given delta.
    pub fn counter<N, V>(name: N, value: V) -> Self
    where
        N: Into<Cow<'static, str>>,
        V: Into<Number>,
    {
        Self::new(name, InstrumentKind::Counter, Aggregation::Sum(value.into()))
    }

    /// Creates a gauge record holding the given value.
    pub fn gauge<N, V>(name: N, value: V) -> Self
    where
        N: Into<Cow<'static, str>>,
        V: Into<Number>,
    {
        let aggregation = Aggregation::LastValue { value: value.into(), timestamp: None };
        Self::new(name, InstrumentKind::Gauge, aggregation)
    }

    /// Sets the attributes of this record.
    #[must_use]
    pub fn with_attributes<I>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = Attribute>,
    {
        self.attributes = attributes.into_iter().collect();
        self
    }

    /// Sets the temporality the aggregation was collected with.
    #[must_use]
    pub fn with_temporality(mut self, temporality: Temporality) -> Self {
        self.temporality = temporality;
        self
    }

    /// Returns the raw metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns an iterator over the attributes attached to this record.
    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    /// Returns the aggregation result.
    pub fn aggregation(&self) -> &Aggregation {
        &self.aggregation
    }

    /// Returns the instrument kind.
    pub fn instrument_kind(&self) -> InstrumentKind {
        self.instrument_kind
    }

    /// Returns the temporality.
    pub fn temporality(&self) -> Temporality {
        self.temporality
    }
}
