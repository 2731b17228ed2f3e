use std::{borrow::Cow, num::NonZeroUsize, vec::IntoIter};

use bytes::{Bytes, BytesMut};

use crate::{
    attributes::AttributeSet,
    normalize::{normalize_metric_name, NormalizationError},
    value::ValueClause,
};

/// Assembles a complete metric line.
///
/// The line is `<prefix>.<name>` (or just `<name>` without a prefix), normalized as a whole,
/// followed by `,key="value"` for every attribute, a single space, and the value clause. There is
/// no trailing newline.
///
/// # Errors
///
/// If the prefixed name can't be normalized, an error is returned and no line should be written.
pub fn assemble_line(
    name: &str,
    prefix: Option<&str>,
    attributes: &AttributeSet,
    value: &ValueClause,
) -> Result<String, NormalizationError> {
    let name = normalize_metric_name(&prefixed_name(prefix, name))?;

    let mut line = String::new();
    write_line(&mut line, &name, attributes, value);
    Ok(line)
}

/// Joins the prefix and the metric name with a `.`.
pub(crate) fn prefixed_name<'a>(prefix: Option<&str>, name: &'a str) -> Cow<'a, str> {
    match prefix {
        Some(prefix) if !prefix.is_empty() => Cow::Owned(format!("{prefix}.{name}")),
        _ => Cow::Borrowed(name),
    }
}

/// Writes a line from an already normalized name.
pub(crate) fn write_line(
    buf: &mut String,
    normalized_name: &str,
    attributes: &AttributeSet,
    value: &ValueClause,
) {
    buf.push_str(normalized_name);
    attributes.write_to(buf);
    buf.push(' ');
    value.write_to(buf);
}

/// A batch of lines ready to be sent in a single request.
#[derive(Clone, Debug)]
pub(crate) struct Payload {
    /// Position of this payload within the export call.
    pub index: usize,

    /// Newline-delimited lines, without a trailing newline.
    pub body: Bytes,

    /// Number of lines in `body`.
    pub lines: usize,
}

/// Collects lines into payloads of a bounded number of lines.
///
/// The ingest API limits how many lines a single request may carry, so lines are packed into
/// consecutive payloads holding at most `max_lines` lines each. Lines within a payload are joined
/// with `\n`.
pub(crate) struct LineWriter {
    max_lines: usize,
    payloads_buf: BytesMut,
    // End offset and line count of every finalized payload.
    offsets: Vec<(usize, usize)>,
    current_lines: usize,
    lines_written: u64,
}

impl LineWriter {
    /// Creates a new `LineWriter` with the given maximum number of lines per payload.
    pub fn new(max_lines: NonZeroUsize) -> Self {
        Self {
            max_lines: max_lines.get(),
            payloads_buf: BytesMut::new(),
            offsets: Vec::new(),
            current_lines: 0,
            lines_written: 0,
        }
    }

    fn last_offset(&self) -> usize {
        self.offsets.last().map_or(0, |(offset, _)| *offset)
    }

    /// Returns the number of bytes in the current payload.
    fn current_payload_len(&self) -> usize {
        self.payloads_buf.len() - self.last_offset()
    }

    /// Finalizes the current payload so that the next line starts a new one.
    ///
    /// If the current payload is empty, this method does nothing.
    fn finalize_current_payload(&mut self) {
        if self.current_payload_len() == 0 {
            return;
        }

        self.offsets.push((self.payloads_buf.len(), self.current_lines));
        self.current_lines = 0;
    }

    /// Appends lines to the current payload, starting a new payload whenever the current one is
    /// full.
    ///
    /// `lines` is split on `\n` and every part counts as a line of its own. Empty lines are
    /// ignored.
    pub fn write_line(&mut self, lines: &str) {
        for line in lines.split('\n') {
            self.push_line(line);
        }
    }

    fn push_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }

        if self.current_lines == self.max_lines {
            self.finalize_current_payload();
        }

        if self.current_lines > 0 {
            self.payloads_buf.extend_from_slice(b"\n");
        }
        self.payloads_buf.extend_from_slice(line.as_bytes());

        self.current_lines += 1;
        self.lines_written += 1;
    }

    /// Returns the total number of lines written.
    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    /// Consumes the writer, returning an iterator over all payloads in the order they were written.
    pub fn into_payloads(mut self) -> Payloads {
        self.finalize_current_payload();
        Payloads::new(self.payloads_buf, self.offsets)
    }
}

/// Iterator over all payloads written by a `LineWriter`.
pub(crate) struct Payloads {
    payloads_buf: BytesMut,
    start: usize,
    next_index: usize,
    offsets: IntoIter<(usize, usize)>,
}

impl Payloads {
    fn new(payloads_buf: BytesMut, offsets: Vec<(usize, usize)>) -> Self {
        Self { payloads_buf, start: 0, next_index: 0, offsets: offsets.into_iter() }
    }

    /// Returns the number of remaining payloads.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }
}

impl Iterator for Payloads {
    type Item = Payload;

    fn next(&mut self) -> Option<Payload> {
        let (offset, lines) = self.offsets.next()?;

        let body = self.payloads_buf.split_to(offset - self.start).freeze();
        self.start = offset;

        let index = self.next_index;
        self.next_index += 1;

        Some(Payload { index, body, lines })
    }
}
