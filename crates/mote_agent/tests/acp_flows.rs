#![cfg(unix)]

use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf, sync::Arc, time::Duration};

use serde_json::json;
use tokio::time;

use mote_agent::{
    AgentAdapter, AgentConfig, AgentEvent, AgentStream, ChatMessage, FnToolRegistry, MessageRole,
    StreamRequest,
};

const FAKE_COPILOT: &str = r#"#!/usr/bin/env python3
import json
import os
import sys

PROTOCOL = __PROTOCOL__
MODE = "__MODE__"

session_count = 0
pending_prompt = None

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

def update(session_id, body):
    method = "session.event" if PROTOCOL >= 2 else "session/update"
    send({"jsonrpc": "2.0", "method": method, "params": {"sessionId": session_id, "update": body}})

def chunk(session_id, text):
    update(session_id, {"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": text}})

def finish(req_id):
    send({"jsonrpc": "2.0", "id": req_id, "result": {"stopReason": "end_turn"}})

def fail(req_id, message):
    send({"jsonrpc": "2.0", "id": req_id, "error": {"code": -32602, "message": message}})

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    msg = json.loads(line)
    method = msg.get("method")
    req_id = msg.get("id")
    params = msg.get("params") or {}

    if method == "initialize":
        send({"jsonrpc": "2.0", "id": req_id, "result": {"protocolVersion": PROTOCOL, "pid": os.getpid()}})
        send({"jsonrpc": "2.0", "id": 0, "result": {}})
        continue

    if method in ("session.create", "session/new"):
        if PROTOCOL >= 2 and method != "session.create":
            fail(req_id, "legacy method on new protocol")
            continue
        if PROTOCOL < 2:
            if method != "session/new":
                fail(req_id, "new method on legacy protocol")
                continue
            servers = params.get("mcpServers")
            if not isinstance(servers, list):
                fail(req_id, "mcpServers must be a list")
                continue
            if any(not isinstance(s.get("args"), list) or not isinstance(s.get("env"), list) for s in servers):
                fail(req_id, "args and env must be arrays")
                continue
        session_count += 1
        send({"jsonrpc": "2.0", "id": req_id, "result": {"sessionId": "sess-%d-%d" % (os.getpid(), session_count)}})
        continue

    if method in ("session.send", "session/prompt"):
        session_id = params.get("sessionId")
        prompt_text = json.dumps(params.get("prompt"))
        if MODE == "hang" and "HANG" in prompt_text:
            continue
        if MODE == "permission":
            pending_prompt = (req_id, session_id)
            name = "permission.request" if PROTOCOL >= 2 else "session/request_permission"
            send({"jsonrpc": "2.0", "id": 9001, "method": name, "params": {"sessionId": session_id, "options": [
                {"optionId": "allow_once", "kind": "allow_once"},
                {"optionId": "allow_always", "kind": "allow_always"},
            ]}})
            continue
        if MODE == "tool":
            pending_prompt = (req_id, session_id)
            send({"jsonrpc": "2.0", "id": 7001, "method": "tool.call", "params": {"name": "mote_lookup", "arguments": {"q": "x"}}})
            continue
        chunk(session_id, "hello ")
        update(session_id, {"sessionUpdate": "agent_thought_chunk", "content": {"type": "text", "text": "mulling"}})
        update(session_id, {"sessionUpdate": "tool_call", "toolCallId": "tc-1", "title": "search", "rawInput": {"q": "x"}})
        update(session_id, {"sessionUpdate": "tool_call_update", "toolCall": {"toolCallId": "tc-1", "status": "completed"}})
        finish(req_id)
        continue

    if req_id == 9001 and "result" in msg:
        option = msg["result"].get("outcome", {}).get("optionId", "")
        prompt_id, session_id = pending_prompt
        chunk(session_id, "approved:" + option)
        finish(prompt_id)
        continue

    if req_id == 7001 and "result" in msg:
        outcome = msg["result"].get("type", "unknown")
        prompt_id, session_id = pending_prompt
        chunk(session_id, "tool:" + outcome)
        finish(prompt_id)
        continue
"#;

fn write_fake_copilot(dir: &tempfile::TempDir, protocol: u32, mode: &str) -> PathBuf {
    let script = FAKE_COPILOT
        .replace("__PROTOCOL__", &protocol.to_string())
        .replace("__MODE__", mode);
    let path = dir.path().join("fake-copilot");
    fs::write(&path, script).expect("write script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path
}

fn adapter_for(binary: PathBuf) -> Arc<AgentAdapter> {
    Arc::new(AgentAdapter::new(AgentConfig {
        binary: Some(binary),
        ..Default::default()
    }))
}

fn user_request(conversation: &str, text: &str) -> StreamRequest {
    StreamRequest {
        conversation_id: Some(conversation.to_string()),
        messages: vec![ChatMessage::new(MessageRole::User, text)],
        ..Default::default()
    }
}

async fn collect_until_done(stream: &mut AgentStream) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    loop {
        let event = time::timeout(Duration::from_secs(10), stream.next_event())
            .await
            .expect("event timeout")
            .expect("stream ended before Done");
        let done = matches!(event, AgentEvent::Done { .. });
        events.push(event);
        if done {
            return events;
        }
    }
}

#[tokio::test]
async fn streams_content_thinking_and_tool_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let adapter = adapter_for(write_fake_copilot(&dir, 2, "basic"));

    // The fake emits a spurious id=0 acknowledgment right after
    // initialize; the flow completing proves it was discarded quietly.
    let mut stream = adapter
        .stream(user_request("c1", "hi"))
        .await
        .expect("stream");
    let events = collect_until_done(&mut stream).await;

    assert_eq!(
        events,
        vec![
            AgentEvent::ContentDelta {
                text: "hello ".into()
            },
            AgentEvent::ThinkingDelta {
                text: "mulling".into()
            },
            AgentEvent::ToolCall {
                id: "tc-1".into(),
                name: "search".into(),
                arguments: Some(json!({"q": "x"})),
            },
            AgentEvent::ToolCallUpdate {
                id: "tc-1".into(),
                status: "running".into(),
            },
            AgentEvent::ToolCallUpdate {
                id: "tc-1".into(),
                status: "completed".into(),
            },
            AgentEvent::Done {
                finish_reason: "stop"
            },
        ]
    );
}

#[tokio::test]
async fn legacy_protocol_converts_mcp_servers_to_arrays() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mcp_path = dir.path().join("mcp_servers.json");
    fs::write(
        &mcp_path,
        r#"{"mcpServers": {"search": {"command": "search-server"}}}"#,
    )
    .expect("write mcp config");

    let adapter = Arc::new(AgentAdapter::new(AgentConfig {
        binary: Some(write_fake_copilot(&dir, 1, "basic")),
        mcp_config_path: Some(mcp_path),
        ..Default::default()
    }));

    // The fake rejects `session/new` unless mcpServers is an array whose
    // entries carry non-null args and env arrays, so completing at all
    // proves the conversion.
    let mut stream = adapter
        .stream(user_request("c1", "hi"))
        .await
        .expect("stream");
    let events = collect_until_done(&mut stream).await;
    assert!(matches!(events.last(), Some(AgentEvent::Done { .. })));
}

#[tokio::test]
async fn session_reuse_and_model_switch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let adapter = adapter_for(write_fake_copilot(&dir, 2, "basic"));

    let mut stream = adapter
        .stream(user_request("c1", "hi"))
        .await
        .expect("stream");
    collect_until_done(&mut stream).await;
    let first_session = adapter.session_for("c1").expect("session bound");

    // Same model: the remote session is reused.
    let mut stream = adapter
        .stream(user_request("c1", "again"))
        .await
        .expect("stream");
    collect_until_done(&mut stream).await;
    assert_eq!(adapter.session_for("c1").as_deref(), Some(first_session.as_str()));

    // A model the CLI cannot drive falls back to the default, which still
    // matches the recorded binding.
    let mut request = user_request("c1", "again");
    request.model = Some("mystery-9000".to_string());
    let mut stream = adapter.stream(request).await.expect("stream");
    collect_until_done(&mut stream).await;
    assert_eq!(adapter.session_for("c1").as_deref(), Some(first_session.as_str()));

    // A real model switch invalidates the binding and creates a fresh
    // remote session.
    let mut request = user_request("c1", "switch");
    request.model = Some("claude-sonnet-4".to_string());
    let mut stream = adapter.stream(request).await.expect("stream");
    collect_until_done(&mut stream).await;
    let second_session = adapter.session_for("c1").expect("session bound");
    assert_ne!(first_session, second_session);
}

#[tokio::test]
async fn cancellation_restarts_the_cli() {
    let dir = tempfile::tempdir().expect("tempdir");
    let adapter = adapter_for(write_fake_copilot(&dir, 2, "hang"));

    let mut stream = adapter
        .stream(user_request("c1", "HANG on this"))
        .await
        .expect("stream");
    let first_pid = adapter.connected_pid().await.expect("pid");
    let first_session = adapter.session_for("c1").expect("session bound");

    stream.cancel();
    let events = collect_until_done(&mut stream).await;
    assert!(events
        .iter()
        .any(|event| matches!(event, AgentEvent::Error { message } if message.contains("cancelled"))));

    // All bindings belonged to the dead process.
    assert_eq!(adapter.session_for("c1"), None);
    assert_eq!(adapter.connected_pid().await, None);

    // The next stream spawns a fresh CLI and a fresh session.
    let mut stream = adapter
        .stream(user_request("c1", "hello"))
        .await
        .expect("stream");
    let events = collect_until_done(&mut stream).await;
    assert!(matches!(events.last(), Some(AgentEvent::Done { .. })));

    let second_pid = adapter.connected_pid().await.expect("pid");
    let second_session = adapter.session_for("c1").expect("session bound");
    assert_ne!(first_pid, second_pid);
    assert_ne!(first_session, second_session);
}

#[tokio::test]
async fn permission_requests_are_auto_approved_preferring_allow_always() {
    let dir = tempfile::tempdir().expect("tempdir");
    let adapter = adapter_for(write_fake_copilot(&dir, 2, "permission"));

    let mut stream = adapter
        .stream(user_request("c1", "do something gated"))
        .await
        .expect("stream");
    let events = collect_until_done(&mut stream).await;

    assert!(
        events.contains(&AgentEvent::ContentDelta {
            text: "approved:allow_always".into()
        }),
        "expected the fake to observe an allow_always approval, got {events:?}"
    );
}

#[tokio::test]
async fn bridged_tools_are_invoked_through_the_channel() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = FnToolRegistry(|name: &str, arguments| {
        let name = name.to_string();
        Box::pin(async move {
            assert_eq!(name, "lookup");
            assert_eq!(arguments, json!({"q": "x"}));
            Ok(json!({"answer": 42}))
        }) as mote_agent::tools::ToolFuture
    });
    let adapter = Arc::new(
        AgentAdapter::new(AgentConfig {
            binary: Some(write_fake_copilot(&dir, 2, "tool")),
            ..Default::default()
        })
        .with_tools(Arc::new(registry)),
    );

    let mut stream = adapter
        .stream(user_request("c1", "use the tool"))
        .await
        .expect("stream");
    let events = collect_until_done(&mut stream).await;

    assert!(
        events.contains(&AgentEvent::ContentDelta {
            text: "tool:success".into()
        }),
        "expected the fake to observe a successful bridged call, got {events:?}"
    );
}
