//! Parameter file rewriting
//!
//! The external executables read a plain-text file of `KEY value` lines.
//! Rewriting replaces the value of every line whose leading key (text before
//! the first space) is in the resolved set and leaves every other line
//! byte-for-byte as it was, including order and line terminators.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Rewrite `contents`, returning the new text
pub fn rewrite(contents: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(contents.len());

    for line in contents.split_inclusive('\n') {
        let (body, terminator) = split_terminator(line);
        let key = body.split(' ').next().unwrap_or("");

        match values.get(key) {
            Some(value) if !key.is_empty() => {
                out.push_str(key);
                out.push(' ');
                out.push_str(value);
                out.push_str(terminator);
            }
            _ => out.push_str(line),
        }
    }

    out
}

/// Rewrite the file at `path` in place
///
/// The new contents go to a sibling temp file first and are renamed over
/// the existing file. An unchanged file is left untouched.
pub fn rewrite_file(path: &Path, values: &BTreeMap<String, String>) -> Result<()> {
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("Failed to read parameter file {}", path.display()), e))?;

    let updated = rewrite(&contents, values);
    if updated == contents {
        tracing::debug!("parameter file {} already up to date", path.display());
        return Ok(());
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &updated)
        .map_err(|e| Error::io(format!("Failed to write {}", tmp.display()), e))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::io(format!("Failed to replace parameter file {}", path.display()), e))?;

    Ok(())
}

pub(crate) fn split_terminator(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}
