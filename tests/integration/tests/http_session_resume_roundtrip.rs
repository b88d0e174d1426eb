#![cfg(unix)]

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use hazel_gateway::{build_gateway_router, GatewayState};
use hazel_runtime::{
    latest_chat_session_for_task, list_chat_sessions, thread_index::read_thread_id, HubConfig,
    SessionHub, UsageTelemetry,
};
use reqwest::Client;
use serde_json::Value;
use tokio::net::TcpListener;

static WORKSPACE_COUNTER: AtomicU64 = AtomicU64::new(1);

const FAKE_APP_SERVER: &str = r#"capture="$(dirname "$0")/capture.log"
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$capture"
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":\([0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"id":%s,"result":{}}\n' "$id" ;;
    *'"method":"thread/resume"'*)
      printf '{"id":%s,"result":{"thread":{"id":"thr-persist"}}}\n' "$id" ;;
    *'"method":"thread/start"'*)
      printf '{"id":%s,"result":{"thread":{"id":"thr-persist"}}}\n' "$id" ;;
    *'"method":"turn/start"'*)
      printf '{"id":%s,"result":{"turn":{"id":"turn-1"}}}\n' "$id"
      printf '{"method":"item/agentMessage/delta","params":{"threadId":"thr-persist","turnId":"turn-1","itemId":"msg-1","delta":"Integration"}}\n'
      printf '{"method":"item/completed","params":{"threadId":"thr-persist","turnId":"turn-1","item":{"type":"agentMessage","id":"msg-1","text":"Integration reply"}}}\n'
      printf '{"method":"turn/completed","params":{"threadId":"thr-persist","turn":{"id":"turn-1","status":"completed"}}}\n'
      ;;
  esac
done
"#;

struct IsolatedWorkspace {
    root: PathBuf,
}

impl IsolatedWorkspace {
    fn new(label: &str) -> Self {
        let tick = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let count = WORKSPACE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "hazel-{label}-{}-{tick}-{count}",
            std::process::id()
        ));
        fs::create_dir_all(root.join(".hazel")).expect("must create isolated workspace root");
        Self { root }
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn capture(&self) -> Vec<String> {
        fs::read_to_string(self.root.join("capture.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn seed_workspace(workspace: &IsolatedWorkspace) {
    let root = workspace.root();
    let script = root.join("fake-app-server.sh");
    fs::write(&script, FAKE_APP_SERVER).expect("write fake app-server");
    fs::write(
        root.join(".hazel").join("config.yaml"),
        format!(
            "agent_chat_command: sh '{}'\ncodex_approval_policy: never\n",
            script.display()
        ),
    )
    .expect("write config");
    fs::write(
        root.join(".hazel").join("board.yaml"),
        "tasks:\n  - id: T-42\n    title: Wire the bridge\n    status: doing\n",
    )
    .expect("write board");
}

async fn spawn_gateway(state: Arc<GatewayState>) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral listener");
    let addr = listener.local_addr().expect("resolve listener addr");
    let app = build_gateway_router(state);
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, handle)
}

async fn post_form(client: &Client, addr: SocketAddr, path: &str, form: &[(&str, &str)]) -> Value {
    let response = client
        .post(format!("http://{addr}{path}"))
        .form(form)
        .send()
        .await
        .expect("post form");
    assert!(response.status().is_success(), "{path} failed: {}", response.status());
    response.json::<Value>().await.expect("json payload")
}

async fn poll_until<F>(client: &Client, addr: SocketAddr, session_id: &str, condition: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let payload = client
            .get(format!(
                "http://{addr}/api/codex/session/poll?session_id={session_id}&cursor=0"
            ))
            .send()
            .await
            .expect("poll session")
            .json::<Value>()
            .await
            .expect("poll payload");
        if condition(&payload) {
            return payload;
        }
        assert!(Instant::now() < deadline, "session never reached condition");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn has_event(payload: &Value, kind: &str) -> bool {
    payload["events"]
        .as_array()
        .is_some_and(|events| events.iter().any(|event| event["type"] == kind))
}

#[tokio::test]
async fn integration_thread_persists_across_sessions_and_transcripts_are_listed() {
    let workspace = IsolatedWorkspace::new("resume");
    seed_workspace(&workspace);
    let hub = Arc::new(SessionHub::new(HubConfig {
        command_override: None,
        rpc_timeout: Duration::from_secs(10),
    }));
    let state = Arc::new(GatewayState::new(
        workspace.root().to_path_buf(),
        Arc::clone(&hub),
        Arc::new(UsageTelemetry::new()),
    ));
    let (addr, server) = spawn_gateway(state).await;
    let client = Client::new();

    let first = post_form(&client, addr, "/api/codex/session/start", &[("task_id", "T-42")]).await;
    let first_id = first["session_id"].as_str().expect("session id").to_string();
    assert_eq!(first["thread_id"], "thr-persist");
    assert_eq!(read_thread_id(workspace.root(), "T-42"), "thr-persist");

    let thread_start = workspace
        .capture()
        .into_iter()
        .find(|line| line.contains(r#""method":"thread/start""#))
        .expect("thread/start was sent");
    let thread_start: Value = serde_json::from_str(&thread_start).expect("thread/start json");
    assert_eq!(thread_start["params"]["approvalPolicy"], "never");
    let instructions = thread_start["params"]["developerInstructions"]
        .as_str()
        .expect("developer instructions");
    assert!(instructions.contains("Task Title: Wire the bridge"));
    assert!(instructions.contains("Task Status: doing"));

    let turn = post_form(
        &client,
        addr,
        "/api/codex/turn",
        &[("session_id", first_id.as_str()), ("prompt", "summarize the task")],
    )
    .await;
    assert_eq!(turn["turn_id"], "turn-1");
    let poll = poll_until(&client, addr, &first_id, |payload| {
        has_event(payload, "turn_completed")
    })
    .await;
    assert!(poll["events"].as_array().expect("events").iter().any(|event| {
        event["type"] == "assistant_message" && event["text"] == "Integration reply"
    }));
    let stopped = client
        .post(format!("http://{addr}/api/codex/session/stop"))
        .form(&[("session_id", first_id.as_str())])
        .send()
        .await
        .expect("stop first session");
    assert_eq!(stopped.status(), reqwest::StatusCode::NO_CONTENT);

    let second = post_form(&client, addr, "/api/codex/session/start", &[("task_id", "T-42")]).await;
    let second_id = second["session_id"].as_str().expect("session id").to_string();
    assert_ne!(second_id, first_id);
    assert_eq!(second["thread_id"], "thr-persist");
    let poll = poll_until(&client, addr, &second_id, |_| true).await;
    assert!(has_event(&poll, "thread_resumed"));
    assert!(workspace.capture().iter().any(|line| {
        line.contains(r#""method":"thread/resume""#) && line.contains(r#""threadId":"thr-persist""#)
    }));

    let history = client
        .get(format!("http://{addr}/api/codex/history?task_id=T-42"))
        .send()
        .await
        .expect("history")
        .json::<Value>()
        .await
        .expect("history payload");
    let sessions = history["sessions"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 2);
    assert!(sessions
        .iter()
        .any(|summary| summary["last_assistant"] == "Integration reply"));
    assert!(latest_chat_session_for_task(workspace.root(), "T-42").is_some());
    assert_eq!(list_chat_sessions(workspace.root()).expect("list").len(), 2);

    hub.shutdown();
    assert_eq!(hub.session_count(), 0);
    server.abort();
}
