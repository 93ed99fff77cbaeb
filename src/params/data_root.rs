//! Local data-root marker
//!
//! Registration leaves a one-line file holding the absolute path to this
//! party's input data. Only the first line is read; trailing whitespace is
//! dropped.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRoot {
    path: String,
}

impl DataRoot {
    /// Read the marker file at `marker`
    pub fn load(marker: &Path) -> Result<Self> {
        let contents = fs::read_to_string(marker).map_err(|e| Error::DataRoot {
            path: marker.to_path_buf(),
            reason: e.to_string(),
        })?;

        let path = contents.lines().next().unwrap_or("").trim_end().to_string();
        if path.is_empty() {
            return Err(Error::DataRoot {
                path: marker.to_path_buf(),
                reason: "marker file is empty".to_string(),
            });
        }

        Ok(Self { path })
    }

    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// `{root}/{name}` as written into the parameter file
    pub fn join(&self, name: &str) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), name)
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}
