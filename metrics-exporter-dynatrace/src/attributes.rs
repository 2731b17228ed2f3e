//! Merging of attribute sources into the deduplicated set written on each line.
use std::fmt::Write as _;

use indexmap::IndexMap;
use tracing::debug;

use crate::{
    normalize::{normalize_attribute_key, truncate_chars},
    record::Attribute,
};

/// Maximum length of an attribute value, in characters, before escaping.
pub const MAX_ATTRIBUTE_VALUE_LEN: usize = 250;

/// A list of attributes whose keys are already normalized.
///
/// Process-wide default attributes and static (host-discovered) attributes are normalized once,
/// when the exporter is built, and then merged into every line.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NormalizedAttributes {
    entries: IndexMap<String, String>,
}

impl NormalizedAttributes {
    /// Normalizes the given attributes.
    ///
    /// Attributes whose key normalizes to nothing are dropped. If two attributes normalize to the
    /// same key, the later one wins.
    pub fn new<'a, I>(attributes: I) -> Self
    where
        I: IntoIterator<Item = &'a Attribute>,
    {
        let mut normalized = Self::default();
        normalized.extend(attributes);
        normalized
    }

    /// Adds more attributes, overwriting existing values on key collision.
    pub fn extend<'a, I>(&mut self, attributes: I)
    where
        I: IntoIterator<Item = &'a Attribute>,
    {
        for attribute in attributes {
            if let Some((key, value)) = normalize_attribute(attribute) {
                self.entries.insert(key, value);
            }
        }
    }

    /// Returns the number of attributes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns an iterator over the normalized key/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The merged, deduplicated attributes of a single metric line.
///
/// Built from three tiers. From highest to lowest precedence: static attributes, the metric's own
/// attributes, and default attributes. Keys keep the position in which they were first seen while
/// walking the tiers from lowest to highest precedence; a higher tier only replaces the value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeSet {
    entries: IndexMap<String, String>,
}

impl AttributeSet {
    /// Merges the attribute tiers for one metric.
    ///
    /// This never fails: per-metric attributes with keys that normalize to nothing are dropped,
    /// and all values are coerced to strings.
    pub fn merge<'a, I>(
        per_metric: I,
        defaults: &NormalizedAttributes,
        static_attributes: &NormalizedAttributes,
    ) -> Self
    where
        I: IntoIterator<Item = &'a Attribute>,
    {
        let mut entries = IndexMap::with_capacity(defaults.len() + static_attributes.len());

        for (key, value) in defaults.iter() {
            entries.insert(key.to_owned(), value.to_owned());
        }

        for attribute in per_metric {
            if let Some((key, value)) = normalize_attribute(attribute) {
                entries.insert(key, value);
            }
        }

        for (key, value) in static_attributes.iter() {
            entries.insert(key.to_owned(), value.to_owned());
        }

        Self { entries }
    }

    /// Returns the value for the given normalized key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Returns the number of attributes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns an iterator over the key/value pairs, in output order.
    ///
    /// Values are returned unescaped.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Writes `,key="value"` for every attribute.
    pub(crate) fn write_to(&self, buf: &mut String) {
        for (key, value) in &self.entries {
            buf.push(',');
            buf.push_str(key);
            buf.push_str("=\"");
            escape_attribute_value(value, buf);
            buf.push('"');
        }
    }
}

fn normalize_attribute(attribute: &Attribute) -> Option<(String, String)> {
    let Some(key) = normalize_attribute_key(attribute.key()) else {
        debug!(key = attribute.key(), "Dropping attribute with invalid key.");
        return None;
    };

    let value = attribute.value().to_string();
    let value = truncate_chars(&value, MAX_ATTRIBUTE_VALUE_LEN).to_owned();
    Some((key, value))
}

/// Escapes an attribute value for use between double quotes, appending it to `out`.
///
/// Backslashes, double quotes, commas and equals signs are prefixed with a backslash. Line feeds,
/// carriage returns and tabs become `\n`, `\r` and `\t`, and any other control character becomes
/// `\u{XXXX}` with its code point in hex. Everything else is copied as is, so an escaped value
/// never contains a raw newline or an unescaped quote.
pub fn escape_attribute_value(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '\\' | '"' | ',' | '=' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                // Writing into a `String` cannot fail.
                let _ = write!(out, "\\u{{{:04x}}}", c as u32);
            }
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{escape_attribute_value, AttributeSet, NormalizedAttributes, MAX_ATTRIBUTE_VALUE_LEN};
    use crate::record::Attribute;

    fn normalized(attributes: &[Attribute]) -> NormalizedAttributes {
        NormalizedAttributes::new(attributes)
    }

    fn escaped(value: &str) -> String {
        let mut out = String::new();
        escape_attribute_value(value, &mut out);
        out
    }

    // Reverses `escape_attribute_value`, returning `None` on malformed input.
    fn unescape(escaped: &str) -> Option<String> {
        let mut out = String::new();
        let mut chars = escaped.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }

            match chars.next()? {
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                't' => out.push('\t'),
                'u' => {
                    if chars.next()? != '{' {
                        return None;
                    }
                    let hex: String = chars.by_ref().take_while(|c| *c != '}').collect();
                    out.push(char::from_u32(u32::from_str_radix(&hex, 16).ok()?)?);
                }
                c @ ('\\' | '"' | ',' | '=') => out.push(c),
                _ => return None,
            }
        }

        Some(out)
    }

    #[test]
    fn precedence() {
        let defaults = normalized(&[Attribute::new("from", "default")]);
        let per_metric = [Attribute::new("from", "metric")];
        let static_attrs = normalized(&[Attribute::new("from", "static")]);
        let none = NormalizedAttributes::default();

        let set = AttributeSet::merge(&per_metric, &defaults, &none);
        assert_eq!(set.get("from"), Some("metric"));
        assert_eq!(set.len(), 1);

        let set = AttributeSet::merge(&per_metric, &defaults, &static_attrs);
        assert_eq!(set.get("from"), Some("static"));
        assert_eq!(set.len(), 1);

        let set = AttributeSet::merge(std::iter::empty(), &defaults, &none);
        assert_eq!(set.get("from"), Some("default"));
    }

    #[test]
    fn first_seen_order_is_kept() {
        let defaults = normalized(&[Attribute::new("b", "default"), Attribute::new("a", "default")]);
        let per_metric = [Attribute::new("c", "metric"), Attribute::new("a", "metric")];
        let static_attrs = normalized(&[Attribute::new("d", "static"), Attribute::new("b", "static")]);

        let set = AttributeSet::merge(&per_metric, &defaults, &static_attrs);
        let pairs = set.iter().collect::<Vec<_>>();
        assert_eq!(pairs, [("b", "static"), ("a", "metric"), ("c", "metric"), ("d", "static")]);
    }

    #[test]
    fn keys_collide_after_normalization() {
        let per_metric = [
            Attribute::new("Host Name", "first"),
            Attribute::new("host_name", "second"),
            Attribute::new("~~~", "dropped"),
        ];
        let none = NormalizedAttributes::default();

        let set = AttributeSet::merge(&per_metric, &none, &none);
        assert_eq!(set.iter().collect::<Vec<_>>(), [("host_name", "second")]);
    }

    #[test]
    fn values_are_coerced_and_truncated() {
        let long = "v".repeat(MAX_ATTRIBUTE_VALUE_LEN + 10);
        let per_metric = [
            Attribute::new("int", 7i64),
            Attribute::new("float", 0.25f64),
            Attribute::new("bool", true),
            Attribute::new("long", long),
        ];
        let none = NormalizedAttributes::default();

        let set = AttributeSet::merge(&per_metric, &none, &none);
        assert_eq!(set.get("int"), Some("7"));
        assert_eq!(set.get("float"), Some("0.25"));
        assert_eq!(set.get("bool"), Some("true"));
        assert_eq!(set.get("long").map(str::len), Some(MAX_ATTRIBUTE_VALUE_LEN));
    }

    #[test]
    fn write_to() {
        let per_metric = [Attribute::new("dim", "value"), Attribute::new("other", "a,b=c")];
        let none = NormalizedAttributes::default();

        let mut buf = String::from("metric");
        AttributeSet::merge(&per_metric, &none, &none).write_to(&mut buf);
        assert_eq!(buf, r#"metric,dim="value",other="a\,b\=c""#);

        let mut buf = String::from("metric");
        AttributeSet::merge(std::iter::empty(), &none, &none).write_to(&mut buf);
        assert_eq!(buf, "metric");
    }

    #[test]
    fn escaping() {
        let cases = [
            ("plain value", "plain value"),
            ("back\\slash", "back\\\\slash"),
            ("\"quoted\"", "\\\"quoted\\\""),
            ("a,b", "a\\,b"),
            ("a=b", "a\\=b"),
            ("line\nbreak", "line\\nbreak"),
            ("cr\rtab\t", "cr\\rtab\\t"),
            ("bell\u{7}", "bell\\u{0007}"),
            ("ünïcödé", "ünïcödé"),
            ("", ""),
        ];

        for (input, expected) in cases {
            assert_eq!(escaped(input), expected, "input: {input:?}");
        }
    }

    proptest! {
        #[test]
        fn escaping_round_trips(value in any::<String>()) {
            let escaped = escaped(&value);
            prop_assert!(!escaped.contains('\n'));
            prop_assert_eq!(unescape(&escaped), Some(value));
        }
    }
}
