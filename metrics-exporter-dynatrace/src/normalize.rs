//! Normalization of metric names and attribute keys into the line protocol grammar.
//!
//! Metric names may only contain `[A-Za-z0-9._-]`, must start with a letter, and are made up of
//! dot-separated sections. Attribute keys follow the same rules per section, but are lower-cased.
use thiserror::Error;

/// Maximum length of a metric name, in characters.
pub const MAX_METRIC_NAME_LEN: usize = 250;

/// Maximum length of an attribute key, in characters.
pub const MAX_ATTRIBUTE_KEY_LEN: usize = 100;

/// A metric name that cannot be made valid.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum NormalizationError {
    /// The first section of the name has no ASCII letter to start from.
    #[error("first section of metric name contains no ASCII letter")]
    NoLeadingLetter,
}

/// Normalizes a metric name.
///
/// The name is truncated to [`MAX_METRIC_NAME_LEN`] characters and split into sections on `.`.
/// Everything in the first section before its first ASCII letter is removed; if there is no such
/// letter, the whole name is rejected. In every section, leading non-alphanumeric characters are
/// removed and each run of characters outside `[A-Za-z0-9_-]` is replaced by a single `_`.
/// Sections that end up empty are dropped.
///
/// # Errors
///
/// If the first section contains no ASCII letter, [`NormalizationError::NoLeadingLetter`] is
/// returned. Callers should skip the metric.
pub fn normalize_metric_name(raw: &str) -> Result<String, NormalizationError> {
    let truncated = truncate_chars(raw, MAX_METRIC_NAME_LEN);
    let mut normalized = String::with_capacity(truncated.len());

    for (i, section) in truncated.split('.').enumerate() {
        let section = if i == 0 {
            match section.find(|c: char| c.is_ascii_alphabetic()) {
                Some(start) => &section[start..],
                None => return Err(NormalizationError::NoLeadingLetter),
            }
        } else {
            section
        };

        push_section(&mut normalized, section, false);
    }

    Ok(normalized)
}

/// Normalizes an attribute key.
///
/// The key is truncated to [`MAX_ATTRIBUTE_KEY_LEN`] characters, lower-cased, and then every
/// dot-separated section goes through the same replacement as a metric name section. Dots between
/// surviving sections are kept, so keys like `dt.entity.host` pass through unchanged.
///
/// Returns `None` if nothing is left, in which case the attribute should be dropped.
pub fn normalize_attribute_key(raw: &str) -> Option<String> {
    let truncated = truncate_chars(raw, MAX_ATTRIBUTE_KEY_LEN);
    let mut normalized = String::with_capacity(truncated.len());

    for section in truncated.split('.') {
        push_section(&mut normalized, section, true);
    }

    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

// Appends a normalized section to `out`, preceded by a `.` if `out` already holds a section.
// Sections that normalize to nothing are skipped entirely.
fn push_section(out: &mut String, section: &str, lowercase: bool) {
    let trimmed = section.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    if trimmed.is_empty() {
        return;
    }

    if !out.is_empty() {
        out.push('.');
    }

    let mut in_invalid_run = false;
    for c in trimmed.chars() {
        if is_valid_section_char(c) {
            out.push(if lowercase { c.to_ascii_lowercase() } else { c });
            in_invalid_run = false;
        } else if !in_invalid_run {
            out.push('_');
            in_invalid_run = true;
        }
    }
}

fn is_valid_section_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
