//! JSONL record sinks.
//!
//! Each pipeline stage that produces records appends them to a JSON Lines
//! file in its stage directory, one serialized value per line. Writes go
//! through a buffered writer; `finish` flushes and closes the file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use meshharvest_shared::{HarvestError, Result};

pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
    lines: u64,
}

impl JsonlSink {
    /// Create (truncating) the sink file, creating parent directories as
    /// needed.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
        }
        let file = File::create(&path).map_err(|e| HarvestError::io(&path, e))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            lines: 0,
        })
    }

    pub fn append<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let line = serde_json::to_string(value)
            .map_err(|e| HarvestError::parse(format!("serializing record: {e}")))?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .map_err(|e| HarvestError::io(&self.path, e))?;
        self.lines += 1;
        Ok(())
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush buffered lines and close the sink.
    pub fn finish(mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| HarvestError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Row {
        id: String,
        n: u32,
    }

    #[test]
    fn appends_one_json_value_per_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stage/records.jsonl");

        let mut sink = JsonlSink::create(&path).unwrap();
        sink.append(&Row { id: "a".into(), n: 1 }).unwrap();
        sink.append(&Row { id: "b".into(), n: 2 }).unwrap();
        assert_eq!(sink.lines(), 2);
        sink.finish().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<Row> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows, vec![Row { id: "a".into(), n: 1 }, Row { id: "b".into(), n: 2 }]);
    }

    #[test]
    fn creates_missing_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("deeply/nested/out.jsonl");

        let sink = JsonlSink::create(&path).unwrap();
        sink.finish().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn create_truncates_previous_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("records.jsonl");
        std::fs::write(&path, "stale\n").unwrap();

        let sink = JsonlSink::create(&path).unwrap();
        sink.finish().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
