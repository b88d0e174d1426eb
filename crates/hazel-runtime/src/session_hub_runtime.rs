//! Registry of live chat sessions, at most one per (state root, task) key.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hazel_core::{current_unix_timestamp_nanos, format_base36};
use serde::Serialize;
use tracing::{info, warn};

use crate::app_server_transport_runtime::SESSION_RPC_TIMEOUT;
use crate::codex_session_runtime::{
    CodexSession, PollResult, SessionError, SessionLaunch, TurnResult,
};
use crate::hazel_config::{load_hazel_config, resolve_repo_root};
use crate::lock_or_recover;
use crate::thread_index::thread_task_key;

/// Process-level settings applied to every session the hub creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Used verbatim instead of the command from `.hazel/config.yaml`.
    pub command_override: Option<String>,
    pub rpc_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_override: None,
            rpc_timeout: SESSION_RPC_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStartResult {
    pub session_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub thread_id: String,
    pub done: bool,
}

#[derive(Debug, Default)]
struct HubRegistry {
    by_key: HashMap<String, Arc<CodexSession>>,
    by_id: HashMap<String, Arc<CodexSession>>,
    last_id_nanos: u128,
}

impl HubRegistry {
    fn next_session_id(&mut self) -> String {
        let nanos = current_unix_timestamp_nanos().max(self.last_id_nanos.saturating_add(1));
        self.last_id_nanos = nanos;
        format_base36(nanos)
    }

    fn evict(&mut self, session: &Arc<CodexSession>) {
        if self
            .by_key
            .get(session.key())
            .is_some_and(|registered| Arc::ptr_eq(registered, session))
        {
            self.by_key.remove(session.key());
        }
        self.by_id.remove(session.id());
    }
}

/// Owns every chat session of the process.
#[derive(Debug, Default)]
pub struct SessionHub {
    config: HubConfig,
    registry: Mutex<HubRegistry>,
}

pub fn session_key(root: &Path, task_id: &str) -> String {
    format!("{}::{}", root.display(), thread_task_key(task_id))
}

impl SessionHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            registry: Mutex::new(HubRegistry::default()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Returns the live session for the key, or creates and bootstraps one.
    ///
    /// With `restart`, any registered session for the key is stopped and
    /// replaced. The check, eviction and registration happen under one lock
    /// acquisition; bootstrap runs after the lock is released.
    pub async fn start(
        &self,
        root: &Path,
        task_id: &str,
        restart: bool,
    ) -> Result<SessionStartResult, SessionError> {
        let task_id = task_id.trim().to_string();
        let config = load_hazel_config(root).map_err(SessionError::Config)?;
        let repo_root = resolve_repo_root(root);
        let command_line = self
            .config
            .command_override
            .as_deref()
            .map(str::trim)
            .filter(|command| !command.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| config.app_server_command());
        let key = session_key(root, &task_id);

        let session = {
            let mut registry = lock_or_recover(&self.registry);
            if let Some(existing) = registry.by_key.get(&key).cloned() {
                if !restart {
                    return Ok(SessionStartResult {
                        session_id: existing.id().to_string(),
                        task_id,
                        thread_id: existing.thread_id(),
                        done: existing.is_done(),
                    });
                }
                registry.evict(&existing);
                existing.stop();
                info!(
                    session_id = existing.id(),
                    key = key.as_str(),
                    "replaced chat session on restart"
                );
            }
            let session = CodexSession::spawn(SessionLaunch {
                session_id: registry.next_session_id(),
                key: key.clone(),
                root: root.to_path_buf(),
                repo_root,
                task_id: task_id.clone(),
                command_line,
                approval_policy: config.approval_policy(),
                rpc_timeout: self.config.rpc_timeout,
            })?;
            registry.by_key.insert(key, Arc::clone(&session));
            registry
                .by_id
                .insert(session.id().to_string(), Arc::clone(&session));
            session
        };

        if let Err(error) = session.bootstrap(restart).await {
            warn!(
                session_id = session.id(),
                error = %error,
                "chat session bootstrap failed"
            );
            session.stop();
            lock_or_recover(&self.registry).evict(&session);
            return Err(error);
        }
        Ok(SessionStartResult {
            session_id: session.id().to_string(),
            task_id,
            thread_id: session.thread_id(),
            done: false,
        })
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<CodexSession>, SessionError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(SessionError::MissingSessionId);
        }
        lock_or_recover(&self.registry)
            .by_id
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))
    }

    pub fn current_session_id(&self, root: &Path, task_id: &str) -> Option<String> {
        lock_or_recover(&self.registry)
            .by_key
            .get(&session_key(root, task_id))
            .map(|session| session.id().to_string())
    }

    pub fn session_count(&self) -> usize {
        lock_or_recover(&self.registry).by_id.len()
    }

    pub fn poll(&self, session_id: &str, cursor: i64) -> Result<PollResult, SessionError> {
        Ok(self.get(session_id)?.poll(cursor))
    }

    pub async fn send_user_message(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<TurnResult, SessionError> {
        let session = self.get(session_id)?;
        session.send_user_message(prompt).await
    }

    pub async fn resolve_approval(
        &self,
        session_id: &str,
        request_id: &str,
        decision: &str,
    ) -> Result<(), SessionError> {
        let session = self.get(session_id)?;
        session.resolve_approval(request_id, decision).await
    }

    pub fn stop(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self.get(session_id)?;
        lock_or_recover(&self.registry).evict(&session);
        session.stop();
        Ok(())
    }

    /// Stops and forgets every session.
    pub fn shutdown(&self) {
        let sessions = {
            let mut registry = lock_or_recover(&self.registry);
            registry.by_key.clear();
            std::mem::take(&mut registry.by_id)
        };
        if !sessions.is_empty() {
            info!(sessions = sessions.len(), "stopping all chat sessions");
        }
        for session in sessions.into_values() {
            session.stop();
        }
    }
}
