//! End-to-end session manager flows against a scripted mock agent.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use agent_gateway_error::GatewayError;
use tempfile::TempDir;
use tokio::sync::mpsc;

use agent_gateway::logbuf::DebugRing;
use agent_gateway::session::{SessionManager, SessionPhase};
use agent_gateway::store::ConfigStore;

use common::{next_event, wait_for_event, wait_for_state, write_mock_agent};

const TOKEN: &str = "sk-ant-oat01-test-token";

struct Harness {
    manager: Arc<SessionManager>,
    store: Arc<ConfigStore>,
    dir: TempDir,
}

impl Harness {
    fn new(permission_timeout: Duration) -> Self {
        let store = Arc::new(ConfigStore::open_memory().expect("open store"));
        let log = Arc::new(DebugRing::new());
        let manager = Arc::new(SessionManager::with_permission_timeout(
            store.clone(),
            log,
            permission_timeout,
        ));
        Self {
            manager,
            store,
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    async fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.manager.add_subscriber(tx).await;
        rx
    }
}

const PERMISSION_SCRIPT: &str = r#"read first
echo '{"type":"system","subtype":"init","session_id":"native-1"}'
echo '{"type":"assistant","message":{"id":"m1","content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}'
echo '{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"},"tool_use_id":"t1","description":"Run ls"}}'
read reply
echo '{"type":"result","total_cost_usd":0.01,"num_turns":1}'
"#;

#[tokio::test]
async fn permission_allow_flow_delivers_ordered_events() {
    let harness = Harness::new(Duration::from_secs(300));
    let wrapper = write_mock_agent(harness.dir.path(), "agent.sh", PERMISSION_SCRIPT);
    let mut rx = harness.subscribe().await;

    // A new subscriber is synchronized with the current state first.
    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], "session_state");
    assert_eq!(event["state"], "idle");

    let record_id = harness
        .manager
        .start_session(TOKEN, &wrapper)
        .await
        .expect("start session");
    harness.manager.send_message("hi").await.expect("send");

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], "session_state");
    assert_eq!(event["state"], "running");

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], "tool_start");
    assert_eq!(event["tool"], "Bash");
    assert_eq!(event["toolUseId"], "t1");
    assert_eq!(event["input"]["command"], "ls");

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], "session_state");
    assert_eq!(event["state"], "waiting_permission");

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], "permission_request");
    assert_eq!(event["id"], "t1");
    assert_eq!(event["tool"], "Bash");
    assert_eq!(harness.manager.phase().await, SessionPhase::WaitingPermission);

    harness.manager.handle_permission_response("t1", true).await;

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], "session_state");
    assert_eq!(event["state"], "running");

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], "cost");
    assert_eq!(event["totalUsd"], 0.01);

    let event = next_event(&mut rx).await;
    assert_eq!(event["type"], "session_state");
    assert_eq!(event["state"], "done");

    // The persisted record reflects the finished turn.
    let record = harness.store.session(&record_id).unwrap().unwrap();
    assert_eq!(record.status, "stopped");
    assert_eq!(record.turn_count, 1);
    assert!(record.ended_at.is_some());
}

#[tokio::test]
async fn permission_timeout_resolves_deny_and_session_completes() {
    let harness = Harness::new(Duration::from_millis(200));
    let wrapper = write_mock_agent(harness.dir.path(), "agent.sh", PERMISSION_SCRIPT);
    let mut rx = harness.subscribe().await;

    harness
        .manager
        .start_session(TOKEN, &wrapper)
        .await
        .expect("start session");
    harness.manager.send_message("hi").await.expect("send");

    wait_for_event(&mut rx, "permission_request").await;

    // No browser response: the deadline resolves the permission as deny and
    // the state returns to running, then the turn finishes normally.
    let event = wait_for_event(&mut rx, "session_state").await;
    assert_eq!(event["state"], "running");
    wait_for_event(&mut rx, "cost").await;
    let event = wait_for_event(&mut rx, "session_state").await;
    assert_eq!(event["state"], "done");
}

#[tokio::test]
async fn text_and_tool_end_events_flow_through() {
    let script = r#"read first
echo '{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"Listing files"},{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}'
echo '{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"README.md"}]}}'
echo '{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":" done."}]}}'
echo '{"type":"result","total_cost_usd":0.002,"num_turns":1}'
"#;
    let harness = Harness::new(Duration::from_secs(300));
    let wrapper = write_mock_agent(harness.dir.path(), "agent.sh", script);
    let mut rx = harness.subscribe().await;

    harness
        .manager
        .start_session(TOKEN, &wrapper)
        .await
        .expect("start session");
    harness.manager.send_message("list files").await.expect("send");

    let event = wait_for_event(&mut rx, "text").await;
    assert_eq!(event["content"], "Listing files");

    let event = wait_for_event(&mut rx, "tool_start").await;
    assert_eq!(event["toolUseId"], "t1");

    let event = wait_for_event(&mut rx, "tool_end").await;
    assert_eq!(event["tool"], "Bash");
    assert_eq!(event["toolUseId"], "t1");
    assert_eq!(event["output"], "README.md");

    let event = wait_for_event(&mut rx, "text").await;
    assert_eq!(event["content"], " done.");
}

#[tokio::test]
async fn oauth_token_reaches_agent_environment() {
    let script = r#"read first
echo "{\"type\":\"assistant\",\"message\":{\"id\":\"m1\",\"content\":[{\"type\":\"text\",\"text\":\"$CLAUDE_CODE_OAUTH_TOKEN\"}]}}"
echo '{"type":"result","total_cost_usd":0,"num_turns":1}'
"#;
    let harness = Harness::new(Duration::from_secs(300));
    let wrapper = write_mock_agent(harness.dir.path(), "agent.sh", script);
    let mut rx = harness.subscribe().await;

    harness
        .manager
        .start_session("sk-ant-oat01-fresh", &wrapper)
        .await
        .expect("start session");
    harness.manager.send_message("whoami").await.expect("send");

    let event = wait_for_event(&mut rx, "text").await;
    assert_eq!(event["content"], "sk-ant-oat01-fresh");
}

#[tokio::test]
async fn concurrent_start_fails_with_invalid_state() {
    // Blocks on a second stdin line that never comes until interrupt.
    let script = "read first\nread second\n";
    let harness = Harness::new(Duration::from_secs(300));
    let wrapper = write_mock_agent(harness.dir.path(), "agent.sh", script);
    let mut rx = harness.subscribe().await;

    harness
        .manager
        .start_session(TOKEN, &wrapper)
        .await
        .expect("first start");
    harness.manager.send_message("hold").await.expect("send");
    wait_for_state(&mut rx, "running").await;

    let err = harness
        .manager
        .start_session(TOKEN, &wrapper)
        .await
        .expect_err("second start must fail");
    assert!(matches!(err, GatewayError::InvalidState { .. }));

    harness.manager.interrupt().await;
    wait_for_state(&mut rx, "done").await;
}

#[tokio::test]
async fn interrupt_is_idempotent_from_any_state() {
    let harness = Harness::new(Duration::from_secs(300));
    harness.manager.interrupt().await;
    harness.manager.interrupt().await;
    assert_eq!(harness.manager.phase().await, SessionPhase::Idle);
}

#[tokio::test]
async fn send_message_without_session_fails() {
    let harness = Harness::new(Duration::from_secs(300));
    let err = harness.manager.send_message("hi").await.expect_err("no session");
    assert!(matches!(err, GatewayError::NoActiveSession));
}

#[tokio::test]
async fn unknown_permission_response_is_a_noop() {
    let harness = Harness::new(Duration::from_secs(300));
    harness
        .manager
        .handle_permission_response("never-issued", true)
        .await;
    assert_eq!(harness.manager.phase().await, SessionPhase::Idle);
}

#[tokio::test]
async fn removed_subscriber_stops_receiving_while_others_continue() {
    let harness = Harness::new(Duration::from_secs(300));
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let id_a = harness.manager.add_subscriber(tx_a).await;
    harness.manager.add_subscriber(tx_b).await;
    next_event(&mut rx_a).await;
    next_event(&mut rx_b).await;

    harness.manager.remove_subscriber(id_a).await;
    harness
        .manager
        .broadcast(&agent_gateway::protocol::ServerEvent::Text {
            content: "after removal".to_string(),
        })
        .await;

    let event = next_event(&mut rx_b).await;
    assert_eq!(event["content"], "after removal");
    assert!(rx_a.try_recv().is_err());
    assert_eq!(harness.manager.phase().await, SessionPhase::Idle);
}

#[tokio::test]
async fn late_subscriber_sees_state_then_cost() {
    let script = r#"read first
echo '{"type":"result","total_cost_usd":0.5,"num_turns":1}'
read second
"#;
    let harness = Harness::new(Duration::from_secs(300));
    let wrapper = write_mock_agent(harness.dir.path(), "agent.sh", script);
    let mut rx = harness.subscribe().await;

    harness
        .manager
        .start_session(TOKEN, &wrapper)
        .await
        .expect("start session");
    harness.manager.send_message("hi").await.expect("send");
    wait_for_event(&mut rx, "cost").await;

    // A subscriber joining mid-session gets the state, then the running cost.
    let mut late = harness.subscribe().await;
    let event = next_event(&mut late).await;
    assert_eq!(event["type"], "session_state");
    assert_eq!(event["state"], "running");
    let event = next_event(&mut late).await;
    assert_eq!(event["type"], "cost");
    assert_eq!(event["totalUsd"], 0.5);

    harness.manager.interrupt().await;
}

#[tokio::test]
async fn agent_failure_finalizes_session_as_error() {
    let script = "read first\nexit 3\n";
    let harness = Harness::new(Duration::from_secs(300));
    let wrapper = write_mock_agent(harness.dir.path(), "agent.sh", script);
    let mut rx = harness.subscribe().await;

    let record_id = harness
        .manager
        .start_session(TOKEN, &wrapper)
        .await
        .expect("start session");
    harness.manager.send_message("hi").await.expect("send");

    wait_for_state(&mut rx, "running").await;
    wait_for_state(&mut rx, "error").await;
    let event = wait_for_event(&mut rx, "error").await;
    assert!(event["message"].as_str().unwrap().contains("exited"));

    let record = harness.store.session(&record_id).unwrap().unwrap();
    assert_eq!(record.status, "error");
}
