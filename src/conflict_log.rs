//! Append-only conflict audit log.
//!
//! One JSON object per line in `.mergeq/conflicts.jsonl`. Records are
//! never rewritten or removed; `status --json` and operators read them to
//! see exactly which files blocked a request, independent of whatever the
//! queue entry's state later became.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::types::RequestId;

/// One detected-conflict event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub request_id: RequestId,
    pub files: Vec<String>,
    pub recorded_at: u64,
}

#[derive(Debug)]
pub enum ConflictLogError {
    Serialize(serde_json::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for ConflictLogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialize(e) => write!(f, "failed to encode conflict record: {e}"),
            Self::Io(e) => write!(f, "conflict log I/O error: {e}"),
        }
    }
}

impl std::error::Error for ConflictLogError {}

/// Writer/reader over the JSONL file.
pub struct ConflictLog {
    path: PathBuf,
}

impl ConflictLog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. A single `write_all` of the full line keeps
    /// concurrent appenders from interleaving partial lines on any
    /// platform where O_APPEND writes are atomic for short records.
    pub fn append(&self, record: &ConflictRecord) -> Result<(), ConflictLogError> {
        let mut line = serde_json::to_string(record).map_err(ConflictLogError::Serialize)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(ConflictLogError::Io)?;
        file.write_all(line.as_bytes()).map_err(ConflictLogError::Io)?;
        file.sync_all().map_err(ConflictLogError::Io)?;
        Ok(())
    }

    /// All records, oldest first. Unparseable lines are skipped rather
    /// than failing the read: a torn tail line must not make the whole
    /// history unreadable.
    pub fn read_all(&self) -> Result<Vec<ConflictRecord>, ConflictLogError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ConflictLogError::Io(e)),
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Most recent record for one request, if any.
    pub fn latest_for(
        &self,
        request_id: RequestId,
    ) -> Result<Option<ConflictRecord>, ConflictLogError> {
        Ok(self
            .read_all()?
            .into_iter()
            .rev()
            .find(|r| r.request_id == request_id))
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    fn id(n: u64) -> RequestId {
        RequestId::new(n).unwrap()
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConflictLog::new(dir.path().join("conflicts.jsonl"));

        log.append(&ConflictRecord {
            request_id: id(102),
            files: vec!["x.txt".into()],
            recorded_at: 1000,
        })
        .unwrap();
        log.append(&ConflictRecord {
            request_id: id(103),
            files: vec!["a.rs".into(), "b.rs".into()],
            recorded_at: 1001,
        })
        .unwrap();

        let all = log.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].request_id, id(102));
        assert_eq!(all[1].files, vec!["a.rs".to_owned(), "b.rs".to_owned()]);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConflictLog::new(dir.path().join("absent.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn torn_tail_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conflicts.jsonl");
        let log = ConflictLog::new(&path);
        log.append(&ConflictRecord {
            request_id: id(1),
            files: vec!["ok.txt".into()],
            recorded_at: 5,
        })
        .unwrap();
        // Simulate a crash mid-append.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"request_id\":2,\"fil").unwrap();
        drop(file);

        let all = log.read_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].request_id, id(1));
    }

    #[test]
    fn latest_for_returns_newest_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConflictLog::new(dir.path().join("conflicts.jsonl"));
        for ts in [10, 20] {
            log.append(&ConflictRecord {
                request_id: id(102),
                files: vec![format!("at-{ts}.txt")],
                recorded_at: ts,
            })
            .unwrap();
        }
        let latest = log.latest_for(id(102)).unwrap().unwrap();
        assert_eq!(latest.recorded_at, 20);
        assert!(log.latest_for(id(999)).unwrap().is_none());
    }
}
