//! Host metadata exposed by a locally running OneAgent.
//!
//! A OneAgent makes its metadata available through a well-known properties file. Reading that file
//! yields the path of the actual metadata file, which holds one `key=value` pair per line. The pairs
//! are attached to every line as static attributes, so that metrics can be mapped to the host and
//! process they came from.
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use tracing::{debug, warn};

use crate::record::Attribute;

/// Basename of the file pointing to the metadata file.
pub const INDIRECTION_BASENAME: &str = "dt_metadata_e617c525669e072eebe3d0f08212e8f2";

/// Reads the OneAgent metadata of the current host.
///
/// This never fails: if no OneAgent is running, or its metadata can't be read, a warning is logged
/// and no attributes are returned.
pub fn read_oneagent_metadata() -> Vec<Attribute> {
    let indirection_path = format!("{INDIRECTION_BASENAME}.properties");
    match read_oneagent_metadata_at(Path::new(&indirection_path)) {
        Ok(attributes) => {
            debug!(attributes = attributes.len(), "Read OneAgent metadata.");
            attributes
        }
        Err(e) => {
            warn!(error = %e, "Could not read OneAgent metadata.");
            Vec::new()
        }
    }
}

/// Parses metadata lines into attributes.
///
/// Every line is split on the first `=`; any further `=` belongs to the value. Lines without a
/// `=`, or with an empty key or value, are skipped with a warning. No normalization is done apart
/// from trimming whitespace around each line.
pub fn parse_oneagent_metadata<I>(lines: I) -> Vec<Attribute>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut attributes = Vec::new();
    for line in lines {
        let line = line.as_ref().trim();
        match line.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                attributes.push(Attribute::new(key.to_owned(), value.to_owned()));
            }
            _ => warn!(line, "Could not parse OneAgent metadata line."),
        }
    }
    attributes
}

pub(crate) fn read_oneagent_metadata_at(indirection_path: &Path) -> io::Result<Vec<Attribute>> {
    let indirection = BufReader::new(File::open(indirection_path)?);
    let metadata_path = read_indirection_file(indirection, INDIRECTION_BASENAME)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "metadata file name is empty"))?;

    let metadata = BufReader::new(File::open(metadata_path)?);
    let lines = read_metadata_file(metadata)?;

    Ok(parse_oneagent_metadata(lines))
}

// Returns the first line containing `basename`, trimmed.
fn read_indirection_file<R: BufRead>(reader: R, basename: &str) -> io::Result<Option<String>> {
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.contains(basename) {
            return Ok(Some(line.to_owned()));
        }
    }
    Ok(None)
}

// Returns all non-empty lines, trimmed.
fn read_metadata_file<R: BufRead>(reader: R) -> io::Result<Vec<String>> {
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            lines.push(line.to_owned());
        }
    }
    Ok(lines)
}
