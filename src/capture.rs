use std::{
    fs::{File, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
};

use anyhow::Context as _;

use crate::flow::FlowRecord;

/// Appends flows to a capture file, one JSON object per line.
///
/// Each record is written with a single `write_all` followed by a flush so a tailing reader
/// never observes a record split across two appends from this writer.
pub struct CaptureWriter {
    path: PathBuf,
    file: File,
}

impl CaptureWriter {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open capture file {} for append", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &FlowRecord) -> anyhow::Result<()> {
        let mut line = record.to_line().context("serialize flow")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .with_context(|| format!("append flow to {}", self.path.display()))
    }
}
