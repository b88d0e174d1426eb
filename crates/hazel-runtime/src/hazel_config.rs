//! `.hazel/config.yaml` and `.hazel/project.json` readers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::app_server_transport_runtime::DEFAULT_APP_SERVER_COMMAND;
use crate::hazel_paths::{config_path, project_meta_path};

const APP_SERVER_MARKER: &str = "app-server";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApprovalPolicy {
    Never,
    #[default]
    OnRequest,
}

impl ApprovalPolicy {
    /// Unrecognized values fall back to `on-request`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "never" => Self::Never,
            _ => Self::OnRequest,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::OnRequest => "on-request",
        }
    }
}

/// Keys of `.hazel/config.yaml` consulted by chat sessions. Other keys are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HazelConfig {
    pub agent_chat_command: Option<String>,
    pub agent_command: Option<String>,
    pub codex_approval_policy: Option<String>,
}

impl HazelConfig {
    /// First configured command that launches an app-server, else the default.
    pub fn app_server_command(&self) -> String {
        [&self.agent_chat_command, &self.agent_command]
            .into_iter()
            .flatten()
            .map(|command| command.trim())
            .find(|command| command.contains(APP_SERVER_MARKER))
            .unwrap_or(DEFAULT_APP_SERVER_COMMAND)
            .to_string()
    }

    pub fn approval_policy(&self) -> ApprovalPolicy {
        self.codex_approval_policy
            .as_deref()
            .map(ApprovalPolicy::parse_lenient)
            .unwrap_or_default()
    }
}

/// Loads the state root's config. A missing file yields defaults.
pub fn load_hazel_config(root: &Path) -> Result<HazelConfig> {
    let path = config_path(root);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(HazelConfig::default())
        }
        Err(error) => {
            return Err(error).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    if raw.trim().is_empty() {
        return Ok(HazelConfig::default());
    }
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

#[derive(Debug, Default, Deserialize)]
struct ProjectMeta {
    #[serde(default)]
    repo_path: String,
}

/// Repository root from `.hazel/project.json`, falling back to the state root.
pub fn resolve_repo_root(root: &Path) -> PathBuf {
    std::fs::read_to_string(project_meta_path(root))
        .ok()
        .and_then(|raw| serde_json::from_str::<ProjectMeta>(&raw).ok())
        .map(|meta| meta.repo_path.trim().to_string())
        .filter(|repo_path| !repo_path.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| root.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, contents).expect("write");
    }

    #[test]
    fn unit_missing_config_yields_defaults() {
        let temp = tempdir().expect("tempdir");
        let config = load_hazel_config(temp.path()).expect("load");
        assert_eq!(config, HazelConfig::default());
        assert_eq!(config.app_server_command(), "codex app-server");
        assert_eq!(config.approval_policy(), ApprovalPolicy::OnRequest);
    }

    #[test]
    fn functional_command_selection_prefers_app_server_commands() {
        let config = HazelConfig {
            agent_chat_command: Some("codex exec".to_string()),
            agent_command: Some("  /opt/codex app-server --verbose ".to_string()),
            codex_approval_policy: Some(" NEVER ".to_string()),
        };
        assert_eq!(config.app_server_command(), "/opt/codex app-server --verbose");
        assert_eq!(config.approval_policy(), ApprovalPolicy::Never);

        let config = HazelConfig {
            agent_chat_command: Some("my-wrapper app-server".to_string()),
            agent_command: Some("other app-server".to_string()),
            codex_approval_policy: Some("always".to_string()),
        };
        assert_eq!(config.app_server_command(), "my-wrapper app-server");
        assert_eq!(config.approval_policy(), ApprovalPolicy::OnRequest);
    }

    #[test]
    fn functional_load_reads_yaml_and_ignores_unknown_keys() {
        let temp = tempdir().expect("tempdir");
        write(
            temp.path(),
            ".hazel/config.yaml",
            "agent_command: codex app-server --profile ci\ncodex_approval_policy: never\nmax_parallel: 3\n",
        );
        let config = load_hazel_config(temp.path()).expect("load");
        assert_eq!(config.app_server_command(), "codex app-server --profile ci");
        assert_eq!(config.approval_policy().as_str(), "never");
    }

    #[test]
    fn regression_invalid_yaml_is_an_error() {
        let temp = tempdir().expect("tempdir");
        write(temp.path(), ".hazel/config.yaml", "agent_command: [unterminated\n");
        let error = load_hazel_config(temp.path()).expect_err("invalid yaml");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn functional_repo_root_comes_from_project_meta() {
        let temp = tempdir().expect("tempdir");
        assert_eq!(resolve_repo_root(temp.path()), temp.path());
        write(temp.path(), ".hazel/project.json", r#"{"key":"HZ","repo_path":""}"#);
        assert_eq!(resolve_repo_root(temp.path()), temp.path());
        write(
            temp.path(),
            ".hazel/project.json",
            r#"{"key":"HZ","repo_path":"/srv/repo"}"#,
        );
        assert_eq!(resolve_repo_root(temp.path()), PathBuf::from("/srv/repo"));
    }
}
