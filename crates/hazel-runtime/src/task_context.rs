//! Developer-instruction text assembled from the task board and repo docs.

use std::path::Path;

use hazel_core::clip_text;
use serde::Deserialize;

use crate::hazel_config::resolve_repo_root;
use crate::hazel_paths::{board_path, task_file, wiki_file};

const TASK_MARKDOWN_LIMIT: usize = 4_000;
const AGENTS_LIMIT: usize = 2_500;
const WIKI_README_LIMIT: usize = 1_800;
const WIKI_FEATURES_LIMIT: usize = 1_800;
const WIKI_CHANGELOG_LIMIT: usize = 1_200;

#[derive(Debug, Default, Deserialize)]
struct Board {
    #[serde(default)]
    tasks: Vec<BoardTask>,
}

#[derive(Debug, Default, Deserialize)]
struct BoardTask {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: String,
}

fn read_optional(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

fn find_board_task(root: &Path, task_id: &str) -> Option<BoardTask> {
    let raw = std::fs::read_to_string(board_path(root)).ok()?;
    let board = serde_yaml::from_str::<Board>(&raw).ok()?;
    board.tasks.into_iter().find(|task| task.id == task_id)
}

fn push_fenced(out: &mut String, label: &str, body: &str, limit: usize) {
    if body.trim().is_empty() {
        return;
    }
    out.push('\n');
    out.push_str(label);
    out.push_str(":\n```markdown\n");
    out.push_str(&clip_text(body, limit));
    out.push_str("\n```\n");
}

/// Builds the task context for `task_id` under state root `root`.
///
/// Missing or unreadable inputs are skipped.
pub fn build_task_context(root: &Path, task_id: &str) -> String {
    let task_id = task_id.trim();
    let repo_root = resolve_repo_root(root);

    let (title, status, task_markdown) = if task_id.is_empty() {
        (String::new(), String::new(), String::new())
    } else {
        let task = find_board_task(root, task_id).unwrap_or_default();
        (
            task.title.trim().to_string(),
            task.status,
            read_optional(&task_file(root, task_id, "task.md")),
        )
    };

    let mut out = String::from("Hazel Nexus task context. Prioritize this context while responding.\n\n");
    out.push_str(&format!("State root: {}\n", root.display()));
    out.push_str(&format!("Repo root: {}\n", repo_root.display()));
    if !task_id.is_empty() {
        out.push_str(&format!("Task ID: {task_id}\n"));
    }
    if !title.is_empty() {
        out.push_str(&format!("Task Title: {title}\n"));
    }
    if !status.is_empty() {
        out.push_str(&format!("Task Status: {status}\n"));
    }
    push_fenced(&mut out, "Task markdown", &task_markdown, TASK_MARKDOWN_LIMIT);
    push_fenced(
        &mut out,
        "AGENTS.md",
        &read_optional(&repo_root.join("AGENTS.md")),
        AGENTS_LIMIT,
    );
    push_fenced(
        &mut out,
        "Wiki README",
        &read_optional(&wiki_file(root, "README.md")),
        WIKI_README_LIMIT,
    );
    push_fenced(
        &mut out,
        "Wiki FEATURES_AND_USAGE",
        &read_optional(&wiki_file(root, "FEATURES_AND_USAGE.md")),
        WIKI_FEATURES_LIMIT,
    );
    push_fenced(
        &mut out,
        "Wiki CHANGELOG",
        &read_optional(&wiki_file(root, "CHANGELOG.md")),
        WIKI_CHANGELOG_LIMIT,
    );
    out
}
