use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use polars::prelude::{Column, CsvWriter, DataFrame, NamedFrom, SerWriter};
use tracing::debug;

/// Pending rows kept in memory before [`ScalarLog::flush_if_due`] appends
/// them to disk.
pub const DEFAULT_FLUSH_ROWS: usize = 1_000;

/// Collects `(tag, step, value)` scalars and appends them to one CSV per run.
pub struct ScalarLog {
    path: PathBuf,
    flush_rows: usize,
    tags: Vec<String>,
    steps: Vec<u64>,
    values: Vec<f64>,
    latest: HashMap<String, f64>,
    written: usize,
    header_written: bool,
}

impl ScalarLog {
    pub fn new<P: AsRef<Path>>(log_dir: P, run_name: &str) -> Self {
        Self {
            path: log_dir.as_ref().join(format!("{run_name}.csv")),
            flush_rows: DEFAULT_FLUSH_ROWS,
            tags: Vec::new(),
            steps: Vec::new(),
            values: Vec::new(),
            latest: HashMap::new(),
            written: 0,
            header_written: false,
        }
    }

    pub fn with_flush_rows(mut self, rows: usize) -> Self {
        self.flush_rows = rows.max(1);
        self
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: u64) {
        debug!(tag, value, step, "scalar");
        self.tags.push(tag.to_string());
        self.steps.push(step);
        self.values.push(value);
        self.latest.insert(tag.to_string(), value);
    }

    /// Rows recorded so far, written or not.
    pub fn len(&self) -> usize {
        self.written + self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows not yet on disk.
    pub fn pending(&self) -> usize {
        self.tags.len()
    }

    /// Latest value recorded under `tag`.
    pub fn last(&self, tag: &str) -> Option<f64> {
        self.latest.get(tag).copied()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends the pending rows once enough have accumulated.
    pub fn flush_if_due(&mut self) -> Result<()> {
        if self.tags.len() >= self.flush_rows {
            self.flush()?;
        }
        Ok(())
    }

    /// Appends the pending rows. The first flush of a run truncates the file
    /// and writes the header.
    pub fn flush(&mut self) -> Result<()> {
        if self.header_written && self.tags.is_empty() {
            return Ok(());
        }
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log dir {}", dir.display()))?;
        }
        let mut df = DataFrame::new(vec![
            Column::new("tag".into(), self.tags.as_slice()),
            Column::new("step".into(), self.steps.as_slice()),
            Column::new("value".into(), self.values.as_slice()),
        ])?;
        let mut file = if self.header_written {
            OpenOptions::new().append(true).open(&self.path)
        } else {
            File::create(&self.path)
        }
        .with_context(|| format!("Failed to open {}", self.path.display()))?;
        CsvWriter::new(&mut file)
            .include_header(!self.header_written)
            .finish(&mut df)?;

        self.header_written = true;
        self.written += self.tags.len();
        self.tags.clear();
        self.steps.clear();
        self.values.clear();
        Ok(())
    }
}
