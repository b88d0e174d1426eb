//! Scripted `sh` app-servers for session and hub tests.

use std::path::Path;

pub(crate) const RESUME_OK: &str = r#""result":{"thread":{"id":"thr-resumed"}}"#;
pub(crate) const RESUME_WITHOUT_THREAD: &str = r#""result":{}"#;
pub(crate) const RESUME_FAILS: &str = r#""error":{"code":-32000,"message":"no rollout found"}"#;

const CHAT_SERVER_TEMPLATE: &str = r#"while IFS= read -r line; do
  printf '%s\n' "$line" >> '__CAPTURE__'
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":\([0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"id":%s,"result":{"userAgent":"fake/0.1"}}\n' "$id" ;;
    *'"method":"thread/resume"'*)
      printf '{"id":%s,__RESUME__}\n' "$id" ;;
    *'"method":"thread/start"'*)
      printf '{"id":%s,"result":{"thread":{"id":"__THREAD__"}}}\n' "$id" ;;
    *'"method":"turn/start"'*)
      printf '{"id":%s,"result":{"turn":{"id":"turn-1"}}}\n' "$id"
      printf '{"method":"turn/started","params":{"threadId":"thr-new","turn":{"id":"turn-1"}}}\n'
      printf '{"method":"item/agentMessage/delta","params":{"threadId":"thr-new","turnId":"turn-1","itemId":"msg-1","delta":"Hel"}}\n'
      printf '{"method":"item/reasoning/summaryTextDelta","params":{"delta":"hidden"}}\n'
      printf '{"id":77,"method":"item/commandExecution/requestApproval","params":{"threadId":"thr-new","turnId":"turn-1","itemId":"cmd-1","command":"cargo test","cwd":"/repo","reason":"run tests"}}\n'
      printf '{"id":"file-9","method":"item/fileChange/requestApproval","params":{"reason":"edit src"}}\n'
      printf '{"id":78,"method":"item/tool/requestUserInput","params":{}}\n'
      printf '{"id":79,"method":"item/unknown/request","params":{}}\n'
      printf '{"method":"item/completed","params":{"threadId":"thr-new","turnId":"turn-1","item":{"type":"agentMessage","id":"msg-1","text":"Hello"}}}\n'
      printf '{"method":"turn/completed","params":{"threadId":"thr-new","turn":{"id":"turn-1","status":"completed"}}}\n'
      ;;
  esac
done"#;

/// Chat app-server that appends every received line to `capture`.
pub(crate) fn chat_server_script(capture: &Path, resume_reply: &str) -> String {
    chat_server_script_with_thread(capture, resume_reply, "thr-new")
}

pub(crate) fn chat_server_script_with_thread(
    capture: &Path,
    resume_reply: &str,
    new_thread_id: &str,
) -> String {
    CHAT_SERVER_TEMPLATE
        .replace("__CAPTURE__", &capture.display().to_string())
        .replace("__RESUME__", resume_reply)
        .replace("__THREAD__", new_thread_id)
}

pub(crate) fn captured_lines(capture: &Path) -> Vec<String> {
    std::fs::read_to_string(capture)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

pub(crate) async fn wait_for_captured_line(capture: &Path, expected: &str) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        if captured_lines(capture).iter().any(|line| line == expected) {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "app-server never received {expected}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
