//! Durable JSONL event log
//!
//! Append-only log of every published envelope, one JSON line per event,
//! one file per day with size rollover. The log is the durable truth that
//! replay and the HTTP replay window are served from.

use crate::envelope::Event;
use crate::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Default size rollover threshold per log file (64 MiB)
pub const DEFAULT_MAX_FILE_BYTES: u64 = 64 * 1024 * 1024;

const FILE_PREFIX: &str = "events-";
const FILE_SUFFIX: &str = ".jsonl";

/// A resumable position in the log, used as a replay checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    /// File name within the log directory; empty means start of log
    pub file: String,
    /// Zero-based line offset within that file
    pub line: u64,
}

struct WriterState {
    day: String,
    index: u32,
    bytes: u64,
    file: Option<BufWriter<File>>,
}

/// Append-only JSONL event log with day and size rollover
pub struct EventLog {
    dir: PathBuf,
    max_file_bytes: u64,
    writer: Mutex<WriterState>,
}

impl EventLog {
    /// Open (or create) a log under `dir` with the default rollover size.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_max_file_bytes(dir, DEFAULT_MAX_FILE_BYTES)
    }

    /// Open (or create) a log with a custom per-file size limit.
    ///
    /// If files for the current day already exist, appending resumes on the
    /// newest one.
    pub fn with_max_file_bytes(dir: impl Into<PathBuf>, max_file_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let today = today_stamp();
        let mut index = 0;
        let mut bytes = 0;
        for name in list_log_files(&dir)? {
            if let Some((day, idx)) = parse_file_name(&name) {
                if day == today && idx >= index {
                    index = idx;
                    bytes = fs::metadata(dir.join(&name)).map(|m| m.len()).unwrap_or(0);
                }
            }
        }

        Ok(Self {
            dir,
            max_file_bytes,
            writer: Mutex::new(WriterState {
                day: today,
                index,
                bytes,
                file: None,
            }),
        })
    }

    /// Append one event and flush it to disk.
    pub fn append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut state = self.writer.lock();

        let today = today_stamp();
        if state.day != today {
            state.day = today;
            state.index = 0;
            state.bytes = 0;
            state.file = None;
        } else if state.bytes + line.len() as u64 > self.max_file_bytes && state.bytes > 0 {
            state.index += 1;
            state.bytes = 0;
            state.file = None;
        }

        if state.file.is_none() {
            let path = self.dir.join(file_name(&state.day, state.index));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            state.file = Some(BufWriter::new(file));
        }

        let writer = state.file.as_mut().expect("writer opened above");
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        state.bytes += line.len() as u64;

        Ok(())
    }

    /// Read all events with `seq_from <= seq <= seq_to`, in log order.
    ///
    /// Corrupt lines are skipped.
    pub fn read_range(&self, seq_from: u64, seq_to: u64) -> Result<Vec<Event>> {
        let mut out = Vec::new();
        for name in list_log_files(&self.dir)? {
            let reader = BufReader::new(File::open(self.dir.join(&name))?);
            for line in reader.lines() {
                let line = line?;
                if let Ok(event) = serde_json::from_str::<Event>(&line) {
                    if event.seq >= seq_from && event.seq <= seq_to {
                        out.push(event);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Read everything after `position`, returning the events and the new
    /// position to checkpoint.
    pub fn read_from(&self, position: &LogPosition) -> Result<(Vec<Event>, LogPosition)> {
        let mut out = Vec::new();
        let mut new_position = position.clone();

        for name in list_log_files(&self.dir)? {
            if !position.file.is_empty() && name.as_str() < position.file.as_str() {
                continue;
            }
            let skip = if name == position.file { position.line } else { 0 };

            let reader = BufReader::new(File::open(self.dir.join(&name))?);
            let mut line_no = 0u64;
            for line in reader.lines() {
                let line = line?;
                line_no += 1;
                if line_no <= skip {
                    continue;
                }
                if let Ok(event) = serde_json::from_str::<Event>(&line) {
                    out.push(event);
                }
            }

            new_position = LogPosition {
                file: name,
                line: line_no.max(skip),
            };
        }

        Ok((out, new_position))
    }

    /// Highest sequence number present in the log, or `None` when empty.
    pub fn last_seq(&self) -> Result<Option<u64>> {
        let mut last = None;
        for name in list_log_files(&self.dir)? {
            let reader = BufReader::new(File::open(self.dir.join(&name))?);
            for line in reader.lines() {
                let line = line?;
                if let Ok(event) = serde_json::from_str::<Event>(&line) {
                    last = Some(last.map_or(event.seq, |prev: u64| prev.max(event.seq)));
                }
            }
        }
        Ok(last)
    }

    /// Directory this log writes to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn today_stamp() -> String {
    chrono::Utc::now().format("%Y%m%d").to_string()
}

fn file_name(day: &str, index: u32) -> String {
    format!("{}{}-{:03}{}", FILE_PREFIX, day, index, FILE_SUFFIX)
}

fn parse_file_name(name: &str) -> Option<(String, u32)> {
    let stem = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    let (day, index) = stem.split_once('-')?;
    Some((day.to_string(), index.parse().ok()?))
}

fn list_log_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if parse_file_name(&name).is_some() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventKind, SCHEMA_VERSION};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn make_event(seq: u64) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            seq,
            ts: Utc::now(),
            kind: EventKind::RunStep,
            schema_version: SCHEMA_VERSION,
            conversation_id: Some("conv".to_string()),
            trace_id: format!("trace-{}", seq),
            payload: json!({"n": seq}),
        }
    }

    #[test]
    fn test_append_and_read_range() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path()).unwrap();

        for seq in 1..=10 {
            log.append(&make_event(seq)).unwrap();
        }

        let events = log.read_range(3, 6).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_size_rollover() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::with_max_file_bytes(dir.path(), 256).unwrap();

        for seq in 1..=20 {
            log.append(&make_event(seq)).unwrap();
        }

        let files = list_log_files(dir.path()).unwrap();
        assert!(files.len() > 1, "expected rollover, got {:?}", files);

        // All events still readable across files, in order.
        let events = log.read_range(0, u64::MAX).unwrap();
        assert_eq!(events.len(), 20);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn test_resume_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = EventLog::new(dir.path()).unwrap();
            log.append(&make_event(1)).unwrap();
        }
        {
            let log = EventLog::new(dir.path()).unwrap();
            log.append(&make_event(2)).unwrap();
        }

        let log = EventLog::new(dir.path()).unwrap();
        assert_eq!(log.read_range(0, u64::MAX).unwrap().len(), 2);
        assert_eq!(log.last_seq().unwrap(), Some(2));
    }

    #[test]
    fn test_read_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path()).unwrap();

        for seq in 1..=5 {
            log.append(&make_event(seq)).unwrap();
        }

        let (first, checkpoint) = log.read_from(&LogPosition::default()).unwrap();
        assert_eq!(first.len(), 5);

        // Nothing new yet.
        let (empty, same) = log.read_from(&checkpoint).unwrap();
        assert!(empty.is_empty());
        assert_eq!(same, checkpoint);

        // New events appear after the checkpoint.
        log.append(&make_event(6)).unwrap();
        let (next, _) = log.read_from(&checkpoint).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].seq, 6);
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path()).unwrap();
        log.append(&make_event(1)).unwrap();

        let files = list_log_files(dir.path()).unwrap();
        let path = dir.path().join(&files[0]);
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("not json\n");
        fs::write(&path, content).unwrap();

        log.append(&make_event(2)).unwrap();
        assert_eq!(log.read_range(0, u64::MAX).unwrap().len(), 2);
    }

    #[test]
    fn test_last_seq_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path()).unwrap();
        assert_eq!(log.last_seq().unwrap(), None);
    }
}
