//! Read side of the durable session logs under `.hazel/chat/sessions`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::hazel_paths::chat_sessions_dir;
use crate::session_event_log::{SessionEvent, SessionEventKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSessionSummary {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    pub path: PathBuf,
    pub modified_at: DateTime<Utc>,
    pub event_count: usize,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_assistant: String,
}

/// Task id embedded in a session log name (`<YYYYMMDD>_<task>_<nonce>.jsonl`).
pub fn task_id_from_session_name(name: &str) -> String {
    let base = name.strip_suffix(".jsonl").unwrap_or(name);
    if !base.starts_with("20") {
        return String::new();
    }
    let parts = base.split('_').collect::<Vec<_>>();
    if parts.len() < 3 {
        return String::new();
    }
    parts[1].trim().to_string()
}

/// Parses a session log, skipping blank and malformed lines.
pub fn load_chat_session_events(path: &Path) -> Result<Vec<SessionEvent>> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(event) = serde_json::from_str::<SessionEvent>(trimmed) {
            events.push(event);
        }
    }
    Ok(events)
}

/// Latest assistant reply. Falls back to the streamed deltas of the last item
/// when no finalized message follows them.
pub fn last_assistant_text(events: &[SessionEvent]) -> String {
    let mut last_message = String::new();
    let mut streamed = String::new();
    let mut streamed_item = String::new();
    for event in events {
        match event.kind {
            SessionEventKind::AssistantMessage if !event.text.trim().is_empty() => {
                last_message = event.text.trim().to_string();
                streamed.clear();
                streamed_item.clear();
            }
            SessionEventKind::AssistantDelta => {
                if event.item_id != streamed_item {
                    streamed.clear();
                    streamed_item = event.item_id.clone();
                }
                streamed.push_str(&event.text);
            }
            _ => {}
        }
    }
    let streamed = streamed.trim();
    if streamed.is_empty() {
        last_message
    } else {
        streamed.to_string()
    }
}

/// Summaries of every session log, newest first. A missing directory is empty.
pub fn list_chat_sessions(root: &Path) -> Result<Vec<ChatSessionSummary>> {
    let dir = chat_sessions_dir(root);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to list {}", dir.display()))
        }
    };

    let mut summaries = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".jsonl") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            continue;
        }
        let path = entry.path();
        let events = load_chat_session_events(&path).unwrap_or_default();
        let modified_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        summaries.push(ChatSessionSummary {
            task_id: task_id_from_session_name(&name),
            name,
            path,
            modified_at,
            event_count: events.len(),
            last_assistant: last_assistant_text(&events),
        });
    }
    summaries.sort_by(|left, right| {
        right
            .modified_at
            .cmp(&left.modified_at)
            .then_with(|| right.name.cmp(&left.name))
    });
    Ok(summaries)
}

pub fn latest_chat_session_for_task(root: &Path, task_id: &str) -> Option<ChatSessionSummary> {
    let task_id = task_id.trim();
    if task_id.is_empty() {
        return None;
    }
    list_chat_sessions(root)
        .ok()?
        .into_iter()
        .find(|summary| summary.task_id == task_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_event_log::{EventDraft, SessionEventLog};
    use tempfile::tempdir;

    fn record(path: &Path, drafts: Vec<EventDraft>) {
        let mut log = SessionEventLog::new();
        log.attach_sink(path).expect("attach sink");
        for draft in drafts {
            log.append(draft);
        }
    }

    fn delta(item: &str, text: &str) -> EventDraft {
        EventDraft::new(SessionEventKind::AssistantDelta)
            .with_item_id(item)
            .with_text(text)
    }

    #[test]
    fn unit_task_id_from_session_name_requires_dated_three_part_names() {
        assert_eq!(task_id_from_session_name("20260101_HZ-0001_abc.jsonl"), "HZ-0001");
        assert_eq!(task_id_from_session_name("20260101__abc.jsonl"), "");
        assert_eq!(task_id_from_session_name("20260101_HZ-0001.jsonl"), "");
        assert_eq!(task_id_from_session_name("notes_HZ-0001_abc.jsonl"), "");
    }

    #[test]
    fn unit_last_assistant_text_prefers_final_message_over_its_deltas() {
        let mut log = SessionEventLog::new();
        log.append(delta("i1", "Hel"));
        log.append(delta("i1", "lo"));
        let streamed_only = log.since(0).events;
        assert_eq!(last_assistant_text(&streamed_only), "Hello");

        log.append(
            EventDraft::new(SessionEventKind::AssistantMessage)
                .with_item_id("i1")
                .with_text("Hello!"),
        );
        assert_eq!(last_assistant_text(&log.since(0).events), "Hello!");

        log.append(delta("i2", "Next"));
        assert_eq!(last_assistant_text(&log.since(0).events), "Next");
    }

    #[test]
    fn functional_list_chat_sessions_summarizes_logs() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        assert!(list_chat_sessions(root).expect("empty list").is_empty());

        let dir = chat_sessions_dir(root);
        record(
            &dir.join("20260101_HZ-0001_a.jsonl"),
            vec![
                EventDraft::new(SessionEventKind::UserMessage).with_text("hi"),
                EventDraft::new(SessionEventKind::AssistantMessage).with_text(" answer "),
            ],
        );
        std::fs::write(dir.join("ignored.txt"), "x").expect("write");
        let second = dir.join("20260102_HZ-0002_b.jsonl");
        record(&second, vec![delta("i", "partial")]);
        let mut raw = std::fs::read_to_string(&second).expect("read");
        raw.push_str("garbage\n\n");
        std::fs::write(&second, raw).expect("append garbage");

        let summaries = list_chat_sessions(root).expect("list");
        assert_eq!(summaries.len(), 2);
        let first = summaries
            .iter()
            .find(|summary| summary.task_id == "HZ-0001")
            .expect("HZ-0001 summary");
        assert_eq!(first.event_count, 2);
        assert_eq!(first.last_assistant, "answer");
        let other = summaries
            .iter()
            .find(|summary| summary.task_id == "HZ-0002")
            .expect("HZ-0002 summary");
        assert_eq!(other.event_count, 1);
        assert_eq!(other.last_assistant, "partial");
        assert!(summaries[0].modified_at >= summaries[1].modified_at);

        let latest = latest_chat_session_for_task(root, "HZ-0002").expect("latest");
        assert_eq!(latest.name, "20260102_HZ-0002_b.jsonl");
        assert!(latest_chat_session_for_task(root, "HZ-0404").is_none());
        assert!(latest_chat_session_for_task(root, " ").is_none());
    }
}
