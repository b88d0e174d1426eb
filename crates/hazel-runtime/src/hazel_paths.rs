//! On-disk layout under a Hazel state root.

use std::path::{Path, PathBuf};

pub fn hazel_dir(root: &Path) -> PathBuf {
    root.join(".hazel")
}

pub fn config_path(root: &Path) -> PathBuf {
    hazel_dir(root).join("config.yaml")
}

pub fn board_path(root: &Path) -> PathBuf {
    hazel_dir(root).join("board.yaml")
}

pub fn project_meta_path(root: &Path) -> PathBuf {
    hazel_dir(root).join("project.json")
}

pub fn task_file(root: &Path, task_id: &str, name: &str) -> PathBuf {
    hazel_dir(root).join("tasks").join(task_id).join(name)
}

pub fn chat_sessions_dir(root: &Path) -> PathBuf {
    hazel_dir(root).join("chat").join("sessions")
}

pub fn thread_index_path(root: &Path) -> PathBuf {
    hazel_dir(root).join("chat").join("threads.json")
}

pub fn wiki_file(root: &Path, name: &str) -> PathBuf {
    root.join("wiki").join(name)
}
