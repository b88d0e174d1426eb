use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use hazel_core::write_text_atomic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::hazel_paths::thread_index_path;
use crate::lock_or_recover;

pub const DEFAULT_TASK_KEY: &str = "_default";

/// Serializes read-modify-write cycles on the index within this process.
static THREAD_INDEX_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ThreadIndexFile {
    #[serde(default)]
    tasks: BTreeMap<String, String>,
}

pub fn thread_task_key(task_id: &str) -> String {
    let trimmed = task_id.trim();
    if trimmed.is_empty() {
        DEFAULT_TASK_KEY.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Loads the index, keeping every well-formed entry.
///
/// Non-string values are dropped one by one; only an unparseable document or
/// a non-object root reads as empty.
fn read_index(root: &Path) -> ThreadIndexFile {
    let path = thread_index_path(root);
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return ThreadIndexFile::default();
    };
    let document = match serde_json::from_str::<Value>(&raw) {
        Ok(document) => document,
        Err(error) => {
            warn!(path = %path.display(), error = %error, "thread index is not valid JSON");
            return ThreadIndexFile::default();
        }
    };
    let Some(Value::Object(entries)) = document.get("tasks") else {
        return ThreadIndexFile::default();
    };
    let tasks = entries
        .iter()
        .filter_map(|(task, thread)| {
            thread
                .as_str()
                .map(|thread| (task.clone(), thread.to_string()))
        })
        .collect();
    ThreadIndexFile { tasks }
}

/// Persisted thread id for `task_id`, or empty when none is recorded.
pub fn read_thread_id(root: &Path, task_id: &str) -> String {
    read_index(root)
        .tasks
        .get(&thread_task_key(task_id))
        .map(|thread_id| thread_id.trim().to_string())
        .unwrap_or_default()
}

/// Records `thread_id` for `task_id`, keeping every other task's entry.
pub fn write_thread_id(root: &Path, task_id: &str, thread_id: &str) -> Result<()> {
    let path = thread_index_path(root);
    let _guard = lock_or_recover(&THREAD_INDEX_LOCK);
    let mut index = read_index(root);
    index
        .tasks
        .insert(thread_task_key(task_id), thread_id.trim().to_string());
    let mut rendered =
        serde_json::to_string_pretty(&index).context("failed to encode thread index")?;
    rendered.push('\n');
    write_text_atomic(&path, &rendered)
        .with_context(|| format!("failed to write {}", path.display()))
}
