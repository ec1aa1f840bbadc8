//! Integration tests for the JSON-RPC host.
//!
//! The server runs in-process on an ephemeral port; a fake editor plugin
//! attaches over the real editor link when a test needs one.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use unity_bridge::link::protocol::{read_message, write_message};
use unity_bridge::link::{BridgeMessage, EditorMessage};
use unity_bridge::{Bridge, BridgeConfig, EditorLinkHandle, EditorLinkServer, EditorState};

struct TestHost {
    bridge: Arc<Bridge>,
    link: EditorLinkHandle,
    port: u16,
}

impl TestHost {
    async fn start(config: BridgeConfig) -> Self {
        let bridge = Bridge::new(config).expect("valid config");
        let link = EditorLinkServer::start(bridge.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind editor link");
        let addr = unity_bridge_rpc::start_server(bridge.clone(), "127.0.0.1", 0)
            .await
            .expect("bind rpc server");
        Self {
            bridge,
            link,
            port: addr.port(),
        }
    }

    /// Make an RPC call and return the full JSON-RPC payload.
    async fn rpc_call_raw(&self, method: &str, params: Value) -> Value {
        self.post(json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .await
    }

    async fn rpc_result(&self, method: &str, params: Value) -> Value {
        let response = self.rpc_call_raw(method, params).await;
        assert!(
            response.get("error").is_none(),
            "{} failed: {}",
            method,
            response
        );
        response["result"].clone()
    }

    /// Call `method` expecting a classified tool error; returns its `data`.
    async fn rpc_tool_error(&self, method: &str, params: Value) -> Value {
        let response = self.rpc_call_raw(method, params).await;
        assert_eq!(response["error"]["code"], -32000, "{}", response);
        response["error"]["data"].clone()
    }

    async fn post(&self, body: Value) -> Value {
        self.post_raw(body.to_string()).await
    }

    async fn post_raw(&self, body: String) -> Value {
        reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/rpc", self.port))
            .header("content-type", "application/json")
            .body(body)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .expect("rpc request")
            .json::<Value>()
            .await
            .expect("rpc response body")
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.link.shutdown();
        self.bridge.mark_stopped();
    }
}

struct FakeEditor {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl FakeEditor {
    async fn attach(host: &TestHost, instance: &str) -> Self {
        let stream = TcpStream::connect(host.link.addr()).await.expect("connect");
        let (reader, writer) = stream.into_split();
        let mut editor = Self { reader, writer };
        editor
            .send(&EditorMessage::Hello {
                editor_instance_id: instance.to_string(),
                editor_state: EditorState::Ready,
                protocol_version: Some(1),
            })
            .await;
        match editor.recv().await {
            Some(BridgeMessage::Welcome { .. }) => editor,
            other => panic!("Expected welcome, got: {:?}", other),
        }
    }

    async fn send(&mut self, message: &EditorMessage) {
        write_message(&mut self.writer, message)
            .await
            .expect("editor write");
    }

    async fn recv(&mut self) -> Option<BridgeMessage> {
        tokio::time::timeout(
            Duration::from_secs(5),
            read_message::<_, BridgeMessage>(&mut self.reader),
        )
        .await
        .expect("bridge did not send in time")
        .unwrap_or(None)
    }

    async fn next_request(&mut self) -> (u64, String, Value) {
        loop {
            match self.recv().await {
                Some(BridgeMessage::Ping { probe }) => {
                    self.send(&EditorMessage::Pong { probe }).await
                }
                Some(BridgeMessage::Request {
                    id,
                    command,
                    params,
                }) => return (id, command, params),
                other => panic!("Expected request, got: {:?}", other),
            }
        }
    }

    async fn reply(&mut self, id: u64, result: Value) {
        self.send(&EditorMessage::Response {
            id,
            result: Some(result),
            error: None,
        })
        .await;
    }
}

async fn wait_connected(bridge: &Bridge) {
    let mut watcher = bridge.runtime().subscribe();
    tokio::time::timeout(Duration::from_secs(5), watcher.wait_for(|s| s.connected))
        .await
        .expect("editor did not connect");
}

#[tokio::test]
async fn test_health() {
    let host = TestHost::start(BridgeConfig::default()).await;
    let response = reqwest::get(format!("http://127.0.0.1:{}/health", host.port))
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(response["status"], "ok");
    assert_eq!(response["server_state"], "waiting_editor");
    assert_eq!(response["connected"], false);
}

#[tokio::test]
async fn test_ping() {
    let host = TestHost::start(BridgeConfig::default()).await;
    assert_eq!(host.rpc_result("ping", json!({})).await, "pong");
}

#[tokio::test]
async fn test_status_without_editor() {
    let host = TestHost::start(BridgeConfig::default()).await;
    let status = host.rpc_result("get_editor_status", json!({})).await;
    assert_eq!(status["server_state"], "waiting_editor");
    assert_eq!(status["connected"], false);
    assert_eq!(status["waiting_reason"], "reconnecting");
    assert_eq!(status["active_connection_id"], Value::Null);
    assert_eq!(status["queued_requests"], 0);
}

#[tokio::test]
async fn test_wait_policy_follows_editor_state() {
    let config = BridgeConfig::default()
        .with_reconnect_wait(Duration::from_millis(1500))
        .with_compile_grace(Duration::from_millis(9000));
    let host = TestHost::start(config).await;

    let policy = host.rpc_result("get_wait_policy", json!({})).await;
    assert_eq!(policy["timeout_ms"], 1500);
    assert_eq!(policy["timeout_error_code"], "EDITOR_NOT_READY");
    assert_eq!(policy["waiting_reason"], "reconnecting");

    let mut editor = FakeEditor::attach(&host, "editor-a").await;
    wait_connected(&host.bridge).await;
    editor
        .send(&EditorMessage::Status {
            editor_state: EditorState::Compiling,
            seq: 1,
        })
        .await;
    let mut watcher = host.bridge.runtime().subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        watcher.wait_for(|s| s.editor_state == EditorState::Compiling),
    )
    .await
    .unwrap();
    drop(editor);

    let mut watcher = host.bridge.runtime().subscribe();
    tokio::time::timeout(Duration::from_secs(5), watcher.wait_for(|s| !s.connected))
        .await
        .unwrap();
    let policy = host.rpc_result("get_wait_policy", json!({})).await;
    assert_eq!(policy["timeout_ms"], 9000);
    assert_eq!(policy["timeout_error_code"], "COMPILE_TIMEOUT");
    assert_eq!(policy["waiting_reason"], "compiling");
}

#[tokio::test]
async fn test_unknown_method() {
    let host = TestHost::start(BridgeConfig::default()).await;
    let response = host.rpc_call_raw("scene.explode", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);
    assert_eq!(response["id"], 1);
}

#[tokio::test]
async fn test_malformed_requests() {
    let host = TestHost::start(BridgeConfig::default()).await;

    let response = host.post_raw("{not json".to_string()).await;
    assert_eq!(response["error"]["code"], -32700);
    assert_eq!(response["id"], Value::Null);

    let response = host
        .post(json!({"jsonrpc": "1.0", "method": "ping", "id": 3}))
        .await;
    assert_eq!(response["error"]["code"], -32600);
    assert_eq!(response["id"], 3);

    let response = host.post(json!({"jsonrpc": "2.0", "id": 4})).await;
    assert_eq!(response["error"]["code"], -32600);
    assert_eq!(response["id"], 4);
}

#[tokio::test]
async fn test_call_editor_requires_command() {
    let host = TestHost::start(BridgeConfig::default()).await;
    let data = host.rpc_tool_error("call_editor", json!({"params": {}})).await;
    assert_eq!(data["code"], "INVALID_PARAMS");
    assert_eq!(data["retryable"], false);
    assert_eq!(data["details"]["recovery_action"], "fix_input_then_retry");
}

#[tokio::test]
async fn test_call_editor_without_editor_times_out_not_executed() {
    let config = BridgeConfig::default().with_reconnect_wait(Duration::from_millis(100));
    let host = TestHost::start(config).await;

    let data = host
        .rpc_tool_error("call_editor", json!({"command": "scene.list"}))
        .await;
    assert_eq!(data["code"], "EDITOR_NOT_READY");
    assert_eq!(data["retryable"], true);
    assert_eq!(data["details"]["execution_guarantee"], "not_executed");
    assert_eq!(data["details"]["waiting_reason"], "reconnecting");
}

#[tokio::test]
async fn test_call_editor_round_trip() {
    let host = TestHost::start(BridgeConfig::default()).await;
    let mut editor = FakeEditor::attach(&host, "editor-a").await;
    wait_connected(&host.bridge).await;

    let editor_task = tokio::spawn(async move {
        let (id, command, params) = editor.next_request().await;
        assert_eq!(command, "scene.list");
        assert_eq!(params, json!({"include_hidden": true}));
        editor.reply(id, json!({"scenes": ["Main"]})).await;
        editor
    });

    let result = host
        .rpc_result(
            "call_editor",
            json!({"command": "scene.list", "params": {"include_hidden": true}}),
        )
        .await;
    assert_eq!(result, json!({"scenes": ["Main"]}));
    let _editor = editor_task.await.unwrap();
}

#[tokio::test]
async fn test_call_editor_timeout_after_send_is_unknown() {
    let host = TestHost::start(BridgeConfig::default()).await;
    let mut editor = FakeEditor::attach(&host, "editor-a").await;
    wait_connected(&host.bridge).await;

    // Receives the request and never answers
    let editor_task = tokio::spawn(async move {
        let request = editor.next_request().await;
        (editor, request)
    });

    let data = host
        .rpc_tool_error(
            "call_editor",
            json!({"command": "build.player", "timeout_ms": 300}),
        )
        .await;
    assert_eq!(data["code"], "REQUEST_TIMEOUT");
    assert_eq!(data["retryable"], false);
    assert_eq!(data["details"]["dispatch_stage"], "after_send");
    // Budget counts from when the bridge took the call, so it can be a hair under 300
    let waited = data["details"]["timeout_ms"].as_u64().unwrap();
    assert!(waited > 0 && waited <= 300, "timeout_ms = {}", waited);
    assert_eq!(data["details"]["caller_deadline"], true);
    assert_eq!(data["details"]["execution_guarantee"], "unknown");
    assert_eq!(
        data["details"]["recovery_action"],
        "inspect_state_then_retry_if_needed"
    );

    let (_editor, (_, command, _)) = editor_task.await.unwrap();
    assert_eq!(command, "build.player");
}

#[tokio::test]
async fn test_get_job_status_checks_token() {
    let host = TestHost::start(BridgeConfig::default()).await;
    let mut editor = FakeEditor::attach(&host, "editor-a").await;
    wait_connected(&host.bridge).await;

    let editor_task = tokio::spawn(async move {
        let (id, command, params) = editor.next_request().await;
        assert_eq!(command, "get_job_status");
        assert_eq!(params, json!({"job_id": "job-1"}));
        editor
            .reply(id, json!({"job_state": "succeeded", "progress": 1.0}))
            .await;

        let (id, _, params) = editor.next_request().await;
        assert_eq!(params, json!({"job_id": "job-2"}));
        editor.reply(id, json!({"job_state": "exploded"})).await;
        editor
    });

    let known = host
        .rpc_result("get_job_status", json!({"job_id": "job-1"}))
        .await;
    assert_eq!(known["job_state"], "succeeded");
    assert_eq!(known["job_state_recognized"], true);
    assert_eq!(known["terminal"], true);
    assert_eq!(known["progress"], 1.0);
    assert!(known.get("raw_job_state").is_none());

    let unknown = host
        .rpc_result("get_job_status", json!({"jobId": "job-2"}))
        .await;
    assert_eq!(unknown["job_state_recognized"], false);
    assert_eq!(unknown["raw_job_state"], "exploded");
    assert_eq!(unknown["terminal"], false);

    let _editor = editor_task.await.unwrap();
}

#[tokio::test]
async fn test_status_reports_connected_editor() {
    let host = TestHost::start(BridgeConfig::default()).await;
    let _editor = FakeEditor::attach(&host, "editor-a").await;
    wait_connected(&host.bridge).await;

    let status = host.rpc_result("get_editor_status", json!({})).await;
    assert_eq!(status["server_state"], "ready");
    assert_eq!(status["connected"], true);
    assert_eq!(status["editor_state"], "ready");
    assert_eq!(status["waiting_reason"], "none");
    assert_eq!(status["editor_instance_id"], "editor-a");
}

#[tokio::test]
async fn test_calls_after_shutdown_are_refused() {
    let host = TestHost::start(BridgeConfig::default()).await;
    host.bridge.mark_stopped();

    let data = host
        .rpc_tool_error("call_editor", json!({"command": "scene.list"}))
        .await;
    assert_eq!(data["code"], "SERVER_STOPPING");
    assert_eq!(data["retryable"], false);
}
