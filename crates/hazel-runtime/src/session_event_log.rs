//! Bounded per-session event log with a durable JSONL mirror.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use hazel_core::format_base36;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::hazel_paths::chat_sessions_dir;

pub const EVENT_LOG_HARD_CAP: usize = 6_000;
pub const EVENT_LOG_COMPACT_TO: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    ThreadStarted,
    ThreadResumed,
    AssistantDelta,
    AssistantMessage,
    UserMessage,
    ToolCommand,
    ToolOutput,
    TurnStarted,
    TurnCompleted,
    ApprovalRequested,
    ApprovalResolved,
    Warning,
    Error,
    Stderr,
    SessionDone,
    Notice,
}

impl SessionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThreadStarted => "thread_started",
            Self::ThreadResumed => "thread_resumed",
            Self::AssistantDelta => "assistant_delta",
            Self::AssistantMessage => "assistant_message",
            Self::UserMessage => "user_message",
            Self::ToolCommand => "tool_command",
            Self::ToolOutput => "tool_output",
            Self::TurnStarted => "turn_started",
            Self::TurnCompleted => "turn_completed",
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalResolved => "approval_resolved",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Stderr => "stderr",
            Self::SessionDone => "session_done",
            Self::Notice => "notice",
        }
    }
}

/// One immutable entry of a session's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: SessionEventKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub turn_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub item_id: String,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied event fields; sequence and timestamp are assigned on append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    pub kind: SessionEventKind,
    pub text: String,
    pub thread_id: String,
    pub turn_id: String,
    pub item_id: String,
}

impl EventDraft {
    pub fn new(kind: SessionEventKind) -> Self {
        Self {
            kind,
            text: String::new(),
            thread_id: String::new(),
            turn_id: String::new(),
            item_id: String::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }

    pub fn with_turn_id(mut self, turn_id: impl Into<String>) -> Self {
        self.turn_id = turn_id.into();
        self
    }

    pub fn with_item_id(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = item_id.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventPage {
    pub events: Vec<SessionEvent>,
    pub cursor: usize,
}

/// In-memory event window plus optional append-only JSONL sink.
///
/// Cursors count every event ever appended, compacted ones included.
#[derive(Debug)]
pub struct SessionEventLog {
    events: Vec<SessionEvent>,
    next_seq: u64,
    compacted: usize,
    hard_cap: usize,
    compact_to: usize,
    sink: Option<File>,
    sink_path: Option<PathBuf>,
}

impl Default for SessionEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEventLog {
    pub fn new() -> Self {
        Self::with_limits(EVENT_LOG_HARD_CAP, EVENT_LOG_COMPACT_TO)
    }

    pub fn with_limits(hard_cap: usize, compact_to: usize) -> Self {
        let hard_cap = hard_cap.max(1);
        Self {
            events: Vec::with_capacity(256),
            next_seq: 1,
            compacted: 0,
            hard_cap,
            compact_to: compact_to.clamp(1, hard_cap),
            sink: None,
            sink_path: None,
        }
    }

    /// Mirrors every subsequent append to `path`, creating parent directories.
    pub fn attach_sink(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open session log {}", path.display()))?;
        self.sink = Some(file);
        self.sink_path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn sink_path(&self) -> Option<&Path> {
        self.sink_path.as_deref()
    }

    pub fn append(&mut self, draft: EventDraft) -> SessionEvent {
        let event = SessionEvent {
            seq: self.next_seq,
            kind: draft.kind,
            text: draft.text,
            thread_id: draft.thread_id,
            turn_id: draft.turn_id,
            item_id: draft.item_id,
            created_at: Utc::now(),
        };
        self.next_seq = self.next_seq.saturating_add(1);
        self.events.push(event.clone());
        if self.events.len() > self.hard_cap {
            let overflow = self.events.len() - self.compact_to;
            self.events.drain(..overflow);
            self.compacted = self.compacted.saturating_add(overflow);
        }
        self.mirror(&event);
        event
    }

    /// Events at or after `cursor`. Negative or out-of-range cursors restart
    /// from the beginning of the retained window.
    pub fn since(&self, cursor: i64) -> EventPage {
        let total = self.total_appended();
        let start = usize::try_from(cursor)
            .ok()
            .filter(|cursor| *cursor <= total)
            .map(|cursor| cursor.saturating_sub(self.compacted))
            .unwrap_or(0);
        EventPage {
            events: self.events[start..].to_vec(),
            cursor: total,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn total_appended(&self) -> usize {
        self.compacted.saturating_add(self.events.len())
    }

    fn mirror(&mut self, event: &SessionEvent) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let written = serde_json::to_string(event)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(sink, "{line}"));
        if let Err(error) = written {
            warn!(
                path = ?self.sink_path,
                error = %error,
                "disabling session log mirror after write failure"
            );
            self.sink = None;
        }
    }
}

/// `<root>/.hazel/chat/sessions/<YYYYMMDD>_<task>_<nonce>.jsonl`
pub fn session_log_path(root: &Path, task_id: &str, nonce_nanos: u128) -> PathBuf {
    let date = Local::now().format("%Y%m%d");
    let task = task_id.trim().replace('/', "-");
    chat_sessions_dir(root).join(format!(
        "{date}_{task}_{}.jsonl",
        format_base36(nonce_nanos)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn note(text: &str) -> EventDraft {
        EventDraft::new(SessionEventKind::Notice).with_text(text)
    }

    #[test]
    fn functional_sequence_numbers_start_at_one_without_gaps() {
        let mut log = SessionEventLog::new();
        for index in 0..25 {
            let event = log.append(note(&format!("n{index}")));
            assert_eq!(event.seq, index + 1);
        }
        let page = log.since(0);
        let seqs = page.events.iter().map(|event| event.seq).collect::<Vec<_>>();
        assert_eq!(seqs, (1..=25).collect::<Vec<_>>());
        assert_eq!(page.cursor, 25);
    }

    #[test]
    fn functional_overflow_compacts_to_most_recent_window_in_order() {
        let mut log = SessionEventLog::new();
        for index in 0..=EVENT_LOG_HARD_CAP {
            log.append(note(&index.to_string()));
        }
        assert_eq!(log.len(), EVENT_LOG_COMPACT_TO);
        let page = log.since(0);
        assert_eq!(page.events.first().map(|event| event.seq), Some(2_002));
        assert_eq!(page.events.last().map(|event| event.seq), Some(6_001));
        assert!(page
            .events
            .windows(2)
            .all(|pair| pair[1].seq == pair[0].seq + 1));
    }

    #[test]
    fn functional_cursor_polls_never_redeliver_events() {
        let mut log = SessionEventLog::new();
        log.append(note("a"));
        log.append(note("b"));
        let first = log.since(0);
        assert_eq!(first.events.len(), 2);
        log.append(note("c"));
        let second = log.since(first.cursor as i64);
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].text, "c");
        let third = log.since(second.cursor as i64);
        assert!(third.events.is_empty());
        assert_eq!(third.cursor, 3);
    }

    #[test]
    fn regression_out_of_range_cursor_clamps_to_zero() {
        let mut log = SessionEventLog::new();
        log.append(note("a"));
        assert_eq!(log.since(-5).events.len(), 1);
        assert_eq!(log.since(99).events.len(), 1);
        assert_eq!(log.since(99).cursor, 1);
    }

    #[test]
    fn regression_cursor_stays_monotonic_across_compaction() {
        let mut log = SessionEventLog::with_limits(10, 4);
        for index in 0..10 {
            log.append(note(&index.to_string()));
        }
        let before = log.since(0);
        assert_eq!(before.cursor, 10);
        log.append(note("10"));
        assert_eq!(log.len(), 4);
        let after = log.since(before.cursor as i64);
        assert_eq!(after.events.len(), 1);
        assert_eq!(after.events[0].seq, 11);
        assert_eq!(after.cursor, 11);

        let stale = log.since(2);
        assert_eq!(stale.events.first().map(|event| event.seq), Some(8));
    }

    #[test]
    fn functional_sink_mirrors_one_json_object_per_line() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("chat").join("sessions").join("log.jsonl");
        let mut log = SessionEventLog::new();
        log.attach_sink(&path).expect("attach sink");
        log.append(
            EventDraft::new(SessionEventKind::UserMessage)
                .with_text("hello")
                .with_thread_id("thr-1"),
        );
        log.append(EventDraft::new(SessionEventKind::TurnStarted).with_turn_id("turn-1"));

        let raw = std::fs::read_to_string(&path).expect("read sink");
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(first["seq"], 1);
        assert_eq!(first["type"], "user_message");
        assert_eq!(first["thread_id"], "thr-1");
        assert!(first.get("turn_id").is_none());
        assert!(first["created_at"].is_string());
        let second: SessionEvent = serde_json::from_str(lines[1]).expect("event line");
        assert_eq!(second.kind, SessionEventKind::TurnStarted);
        assert_eq!(second.turn_id, "turn-1");
    }

    #[test]
    fn unit_session_log_path_sanitizes_task_and_uses_sessions_dir() {
        let root = Path::new("/state");
        let path = session_log_path(root, " feature/HZ-7 ", 36);
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        assert!(path.starts_with("/state/.hazel/chat/sessions"));
        assert!(name.starts_with("20"));
        assert!(name.ends_with("_feature-HZ-7_10.jsonl"));
    }
}
