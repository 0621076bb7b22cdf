//! Newline-delimited JSON change files.
//!
//! The source reads one raw event per line and skips blank lines. The
//! writeback appends one correlation per line to a sibling file.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};

use changebyte_types::record::CorrelationRecord;

use crate::connectors::ChangeSource;
use crate::writeback::SourceWriteback;

pub struct JsonlSource {
    path: PathBuf,
    reader: BufReader<File>,
    line: u64,
}

impl JsonlSource {
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open change file: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            line: 0,
        })
    }
}

impl ChangeSource for JsonlSource {
    fn poll(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = String::new();
        loop {
            buf.clear();
            let read = self.reader.read_line(&mut buf).with_context(|| {
                format!("Failed to read {} at line {}", self.path.display(), self.line + 1)
            })?;
            if read == 0 {
                return Ok(None);
            }
            self.line += 1;
            let trimmed = buf.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.as_bytes().to_vec()));
            }
        }
    }
}

/// Appends correlations to a JSONL file, flushing after every record.
pub struct JsonlWriteback {
    file: Mutex<File>,
}

impl JsonlWriteback {
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or opened for append.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open writeback file: {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl SourceWriteback for JsonlWriteback {
    fn write_correlation(&self, record: &CorrelationRecord) -> Result<()> {
        let line = serde_json::json!({
            "source_id": record.source_id,
            "destination_id": record.destination_id,
            "applied_sequence": record.applied_sequence,
            "written_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("writeback file lock poisoned"))?;
        writeln!(file, "{line}").context("Failed to append correlation")?;
        file.flush().context("Failed to flush correlation")?;
        Ok(())
    }
}

/// Default writeback path for a change file: `<stem>.writeback.jsonl`.
#[must_use]
pub fn default_writeback_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map_or_else(|| "changes".into(), |s| s.to_string_lossy().into_owned());
    source.with_file_name(format!("{stem}.writeback.jsonl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_lines_and_skips_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("changes.jsonl");
        std::fs::write(&path, "{\"a\":1}\n\n   \n{\"a\":2}\nnot json\n").unwrap();

        let mut source = JsonlSource::open(&path).unwrap();
        assert_eq!(source.poll().unwrap().unwrap(), b"{\"a\":1}".to_vec());
        assert_eq!(source.poll().unwrap().unwrap(), b"{\"a\":2}".to_vec());
        // Malformed lines are the ingestor's problem, not the reader's.
        assert_eq!(source.poll().unwrap().unwrap(), b"not json".to_vec());
        assert!(source.poll().unwrap().is_none());
    }

    #[test]
    fn test_open_missing_file_names_path() {
        let err = JsonlSource::open(Path::new("/nope/changes.jsonl"))
            .err()
            .unwrap()
            .to_string();
        assert!(err.contains("/nope/changes.jsonl"));
    }

    #[test]
    fn test_writeback_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("wb.jsonl");
        let wb = JsonlWriteback::open(&path).unwrap();
        for seq in 1..=2 {
            wb.write_correlation(&CorrelationRecord {
                source_id: "A1".into(),
                destination_id: "Customer:1".into(),
                applied_sequence: seq,
            })
            .unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["applied_sequence"], 2);
        assert_eq!(lines[0]["destination_id"], "Customer:1");
    }

    #[test]
    fn test_default_writeback_path() {
        assert_eq!(
            default_writeback_path(Path::new("/data/changes.jsonl")),
            PathBuf::from("/data/changes.writeback.jsonl")
        );
    }
}
