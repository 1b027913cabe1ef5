//! Append-only summary sinks.
//!
//! Each sink is a directory holding `events.jsonl`, one [`SummaryRecord`]
//! per line keyed by global step.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use gonet_core::GoNetError;
use gonet_model::Summary;
use serde::{Deserialize, Serialize};

/// File name of the event log inside a summary directory.
pub const EVENTS_FILE: &str = "events.jsonl";

/// One line of an event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub step: i64,
    /// Seconds since the Unix epoch.
    pub wall_time: f64,
    #[serde(flatten)]
    pub summary: Summary,
}

/// Writes summaries to `<dir>/events.jsonl`.
#[derive(Debug)]
pub struct SummaryWriter {
    path: PathBuf,
    file: File,
}

impl SummaryWriter {
    /// Opens (creating if needed) the event log in `dir` for appending.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Io`] if the directory or file cannot be created.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self, GoNetError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(EVENTS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    /// Appends one record for `step`.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Serde`] or [`GoNetError::Io`] on failure.
    pub fn add_summary(&mut self, summary: &Summary, step: i64) -> Result<(), GoNetError> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let record = SummaryRecord {
            step,
            wall_time,
            summary: summary.clone(),
        };
        let line = serde_json::to_string(&record)?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads every record from the event log in `dir`. A missing log is empty.
///
/// # Errors
///
/// Returns [`GoNetError::Io`] or [`GoNetError::Serde`] for unreadable or
/// malformed lines.
pub fn read_summaries(dir: impl AsRef<Path>) -> Result<Vec<SummaryRecord>, GoNetError> {
    let path = dir.as_ref().join(EVENTS_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(&path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(loss: f32) -> Summary {
        Summary {
            loss,
            move_accuracy: 0.25,
            outcome_accuracy: 0.5,
            learning_rate: 0.1,
            temperature: 1.0,
            grad_norm: Some(2.0),
        }
    }

    #[test]
    fn records_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SummaryWriter::create(dir.path().join("train_log")).unwrap();
        writer.add_summary(&summary(3.0), 0).unwrap();
        writer.add_summary(&summary(2.5), 1).unwrap();

        let records = read_summaries(dir.path().join("train_log")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].step, 0);
        assert_eq!(records[1].summary.loss, 2.5);
        assert!(records[1].wall_time > 0.0);
    }

    #[test]
    fn reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        SummaryWriter::create(dir.path()).unwrap().add_summary(&summary(1.0), 4).unwrap();
        SummaryWriter::create(dir.path()).unwrap().add_summary(&summary(1.0), 5).unwrap();
        let steps: Vec<i64> = read_summaries(dir.path()).unwrap().iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![4, 5]);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_summaries(dir.path().join("nope")).unwrap().is_empty());
    }
}
