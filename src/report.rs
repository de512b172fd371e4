//! Queue status reporting.
//!
//! Builds the `status` view: queue position, state, elapsed wait, retry
//! count, and for failed/conflicted entries the last error class and the
//! conflicting files, so operators never need to dig through logs.

use serde::Serialize;

use crate::model::request::MergeRequest;
use crate::model::status::RequestStatus;

/// One row of the status view.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    /// 1-based position among queued entries; `None` once active/terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    pub request_id: u64,
    pub source_ref: String,
    pub target_ref: String,
    pub origin_id: String,
    pub status: RequestStatus,
    pub retry_count: u32,
    /// Seconds since enqueue.
    pub waited_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflict_files: Vec<String>,
}

/// The full status view, queued entries first in queue order.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub entries: Vec<StatusRow>,
}

impl StatusReport {
    /// Build from store entries (already in sequence order).
    #[must_use]
    pub fn build(entries: &[MergeRequest], now: u64) -> Self {
        let mut position = 0;
        let rows = entries
            .iter()
            .map(|entry| {
                let pos = if entry.status == RequestStatus::Queued {
                    position += 1;
                    Some(position)
                } else {
                    None
                };
                StatusRow {
                    position: pos,
                    request_id: entry.request_id.get(),
                    source_ref: entry.source_ref.to_string(),
                    target_ref: entry.target_ref.to_string(),
                    origin_id: entry.origin_id.to_string(),
                    status: entry.status,
                    retry_count: entry.retry_count,
                    waited_secs: entry.waited_secs(now),
                    last_error: entry
                        .last_error
                        .as_ref()
                        .map(|e| format!("{}: {}", e.class, e.message)),
                    conflict_files: entry.conflict_files.clone(),
                }
            })
            .collect();
        Self { entries: rows }
    }

    /// Plain-text table for terminal output.
    #[must_use]
    pub fn render_text(&self) -> String {
        if self.entries.is_empty() {
            return "queue is empty\n".to_owned();
        }
        let mut out = String::new();
        out.push_str(&format!(
            "{:<4} {:<10} {:<24} {:<18} {:>7} {:>9}\n",
            "POS", "REQUEST", "SOURCE", "STATUS", "RETRIES", "WAITED"
        ));
        for row in &self.entries {
            let pos = row
                .position
                .map_or_else(|| "-".to_owned(), |p| p.to_string());
            out.push_str(&format!(
                "{:<4} {:<10} {:<24} {:<18} {:>7} {:>8}s\n",
                pos,
                row.request_id,
                truncate(&row.source_ref, 24),
                row.status.to_string(),
                row.retry_count,
                row.waited_secs,
            ));
            if let Some(error) = &row.last_error {
                out.push_str(&format!("     last error: {error}\n"));
            }
            if !row.conflict_files.is_empty() {
                out.push_str(&format!(
                    "     conflicts: {}\n",
                    row.conflict_files.join(", ")
                ));
            }
        }
        out
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_owned()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{kept}\u{2026}")
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use crate::model::request::{ErrorClass, RecordedError};
    use crate::model::types::{BranchRef, RequestId, SessionId};

    fn request(id: u64, seq: u64, status: RequestStatus) -> MergeRequest {
        MergeRequest {
            seq,
            request_id: RequestId::new(id).unwrap(),
            source_ref: BranchRef::new(&format!("feature/{id}")).unwrap(),
            target_ref: BranchRef::new("main").unwrap(),
            origin_id: SessionId::new("session-a").unwrap(),
            status,
            retry_count: 0,
            enqueued_at: 1000,
            started_at: None,
            last_error: None,
            conflict_files: Vec::new(),
        }
    }

    #[test]
    fn positions_count_only_queued_entries() {
        let entries = vec![
            request(101, 1, RequestStatus::Merged),
            request(102, 2, RequestStatus::Queued),
            request(103, 3, RequestStatus::Merging),
            request(104, 4, RequestStatus::Queued),
        ];
        let report = StatusReport::build(&entries, 1060);
        assert_eq!(report.entries[0].position, None);
        assert_eq!(report.entries[1].position, Some(1));
        assert_eq!(report.entries[2].position, None);
        assert_eq!(report.entries[3].position, Some(2));
        assert_eq!(report.entries[1].waited_secs, 60);
    }

    #[test]
    fn failed_entry_surfaces_error_and_conflicts() {
        let mut entry = request(102, 1, RequestStatus::Failed);
        entry.last_error = Some(RecordedError {
            class: ErrorClass::ConflictDetected,
            message: "1 conflicting file(s)".into(),
        });
        entry.conflict_files = vec!["x.txt".into()];

        let report = StatusReport::build(&[entry], 1000);
        let row = &report.entries[0];
        assert_eq!(
            row.last_error.as_deref(),
            Some("conflict-detected: 1 conflicting file(s)")
        );
        assert_eq!(row.conflict_files, vec!["x.txt".to_owned()]);

        let text = report.render_text();
        assert!(text.contains("last error: conflict-detected"));
        assert!(text.contains("conflicts: x.txt"));
    }

    #[test]
    fn empty_queue_renders_message() {
        let report = StatusReport::build(&[], 0);
        assert_eq!(report.render_text(), "queue is empty\n");
    }

    #[test]
    fn json_serializes_without_empty_optionals() {
        let report = StatusReport::build(&[request(101, 1, RequestStatus::Queued)], 1000);
        let json = serde_json::to_value(&report).unwrap();
        let row = &json["entries"][0];
        assert_eq!(row["position"], 1);
        assert_eq!(row["status"], "queued");
        assert!(row.get("last_error").is_none());
        assert!(row.get("conflict_files").is_none());
    }
}
