//! Single-active-session state machine driving the Agent subprocess.
//!
//! The manager owns the subscriber set, the pending-permission map, and the
//! lifecycle of the current Agent child. Browser input from any number of
//! connections is merged into the Agent's stdin; every semantic event parsed
//! from its stdout is fanned out to all subscribers.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::Arc;
use std::time::Duration;

use agent_gateway_error::GatewayError;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::logbuf::DebugRing;
use crate::store::{ConfigStore, SessionStatus};
use crate::protocol::ServerEvent;

pub const PERMISSION_TIMEOUT: Duration = Duration::from_secs(300);

const TOKEN_ENV_VAR: &str = "CLAUDE_CODE_OAUTH_TOKEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Running,
    WaitingPermission,
    Done,
    Error,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::WaitingPermission => "waiting_permission",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// True in the states from which a new session may be started.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Done | Self::Error)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::WaitingPermission)
    }
}

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    sender: mpsc::UnboundedSender<String>,
}

struct PendingPermission {
    request_id: String,
    tool: String,
    timeout: JoinHandle<()>,
}

type ChildHandle = Arc<std::sync::Mutex<Option<Child>>>;

struct SessionInner {
    phase: SessionPhase,
    record_id: Option<String>,
    native_session_id: Option<String>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: SubscriberId,
    pending_permissions: HashMap<String, PendingPermission>,
    tool_names: HashMap<String, String>,
    input: Option<mpsc::UnboundedSender<String>>,
    child: Option<ChildHandle>,
    interrupted: bool,
    total_cost_usd: f64,
    turn_count: u64,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Idle,
            record_id: None,
            native_session_id: None,
            subscribers: Vec::new(),
            next_subscriber_id: 0,
            pending_permissions: HashMap::new(),
            tool_names: HashMap::new(),
            input: None,
            child: None,
            interrupted: false,
            total_cost_usd: 0.0,
            turn_count: 0,
        }
    }

    fn sender_snapshot(&self) -> Vec<mpsc::UnboundedSender<String>> {
        self.subscribers
            .iter()
            .map(|subscriber| subscriber.sender.clone())
            .collect()
    }

    fn set_phase(&mut self, phase: SessionPhase) -> ServerEvent {
        self.phase = phase;
        ServerEvent::SessionState {
            state: phase.as_str().to_string(),
        }
    }

    fn send_input_line(&self, line: String) -> bool {
        match &self.input {
            Some(sender) => sender.send(line).is_ok(),
            None => false,
        }
    }
}

pub struct SessionManager {
    store: Arc<ConfigStore>,
    log: Arc<DebugRing>,
    inner: Mutex<SessionInner>,
    permission_timeout: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<ConfigStore>, log: Arc<DebugRing>) -> Self {
        Self::with_permission_timeout(store, log, PERMISSION_TIMEOUT)
    }

    /// Timeout override for tests; production uses [`PERMISSION_TIMEOUT`].
    pub fn with_permission_timeout(
        store: Arc<ConfigStore>,
        log: Arc<DebugRing>,
        permission_timeout: Duration,
    ) -> Self {
        Self {
            store,
            log,
            inner: Mutex::new(SessionInner::new()),
            permission_timeout,
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase
    }

    pub async fn total_cost_usd(&self) -> f64 {
        self.inner.lock().await.total_cost_usd
    }

    /// Registers a connection and synchronizes it: the current state first,
    /// then the accumulated cost when non-zero.
    pub async fn add_subscriber(&self, sender: mpsc::UnboundedSender<String>) -> SubscriberId {
        let mut inner = self.inner.lock().await;
        inner.next_subscriber_id += 1;
        let id = inner.next_subscriber_id;
        let state_event = ServerEvent::SessionState {
            state: inner.phase.as_str().to_string(),
        };
        let _ = sender.send(state_event.to_json());
        if inner.total_cost_usd > 0.0 {
            let _ = sender.send(
                ServerEvent::Cost {
                    total_usd: inner.total_cost_usd,
                }
                .to_json(),
            );
        }
        inner.subscribers.push(Subscriber { id, sender });
        id
    }

    pub async fn remove_subscriber(&self, id: SubscriberId) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.retain(|subscriber| subscriber.id != id);
    }

    /// Best-effort fan-out; individual send failures are swallowed (the dead
    /// connection is cleaned up by its own close handler).
    pub async fn broadcast(&self, event: &ServerEvent) {
        let senders = self.inner.lock().await.sender_snapshot();
        deliver(&senders, event);
    }

    /// Launches the Agent through the wrapper program and begins the output
    /// loop. Fails with *InvalidState* while a session is active.
    pub async fn start_session(
        self: &Arc<Self>,
        oauth_token: &str,
        wrapper_path: &Path,
    ) -> Result<String, GatewayError> {
        let mut inner = self.inner.lock().await;
        if !inner.phase.can_start() {
            return Err(GatewayError::InvalidState {
                state: inner.phase.as_str().to_string(),
            });
        }

        let record_id = Uuid::new_v4().to_string();
        self.store
            .create_session(&record_id, time::OffsetDateTime::now_utc())
            .map_err(|err| GatewayError::Storage {
                message: err.to_string(),
            })?;

        let spawn = spawn_agent(wrapper_path, oauth_token).await?;
        let AgentSpawn {
            child,
            stdin,
            stdout,
            stderr,
        } = spawn;

        let (input_tx, input_rx) = mpsc::unbounded_channel::<String>();
        tokio::task::spawn_blocking(move || write_lines(stdin, input_rx));

        let (output_tx, output_rx) = mpsc::unbounded_channel::<String>();
        tokio::task::spawn_blocking(move || read_lines(stdout, output_tx));

        let stderr_log = self.log.clone();
        tokio::task::spawn_blocking(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if !line.trim().is_empty() {
                    tracing::debug!(line = %line, "agent stderr");
                    stderr_log.push("agent.stderr", &line, None);
                }
            }
        });

        let child: ChildHandle = Arc::new(std::sync::Mutex::new(Some(child)));
        inner.record_id = Some(record_id.clone());
        inner.native_session_id = None;
        inner.input = Some(input_tx);
        inner.child = Some(child.clone());
        inner.interrupted = false;
        inner.total_cost_usd = 0.0;
        inner.turn_count = 0;
        let state_event = inner.set_phase(SessionPhase::Running);
        let senders = inner.sender_snapshot();
        drop(inner);
        deliver(&senders, &state_event);

        self.log.push("session.started", &record_id, None);
        let manager = Arc::clone(self);
        let loop_record_id = record_id.clone();
        tokio::spawn(async move {
            manager.run_output_loop(loop_record_id, output_rx, child).await;
        });

        Ok(record_id)
    }

    /// Enqueues a user turn. The Agent reads turns lazily, so the call never
    /// waits; it fails with *NoActiveSession* outside an active session.
    pub async fn send_message(&self, content: &str) -> Result<(), GatewayError> {
        let inner = self.inner.lock().await;
        if !inner.phase.is_active() {
            return Err(GatewayError::NoActiveSession);
        }
        let session_id = inner
            .native_session_id
            .clone()
            .or_else(|| inner.record_id.clone())
            .unwrap_or_default();
        let line = user_message_line(&session_id, content);
        if !inner.send_input_line(line) {
            return Err(GatewayError::NoActiveSession);
        }
        Ok(())
    }

    /// Resolves a pending permission. Unknown ids are no-ops: the client may
    /// be racing a timeout or duplicating another subscriber's answer.
    pub async fn handle_permission_response(&self, id: &str, allow: bool) {
        let mut inner = self.inner.lock().await;
        let Some(pending) = inner.pending_permissions.remove(id) else {
            return;
        };
        pending.timeout.abort();
        let behavior = if allow { "allow" } else { "deny" };
        let message = (!allow).then(|| "Permission denied.".to_string());
        let line = control_response_line(&pending.request_id, behavior, message);
        if !inner.send_input_line(line) {
            tracing::warn!(tool = %pending.tool, "permission verdict could not reach agent");
        }
        let state_event = inner.set_phase(SessionPhase::Running);
        let senders = inner.sender_snapshot();
        drop(inner);
        deliver(&senders, &state_event);
    }

    /// Best-effort cancellation of the current Agent subprocess. Idempotent
    /// and callable from any state.
    pub async fn interrupt(&self) {
        let child = {
            let mut inner = self.inner.lock().await;
            inner.interrupted = true;
            inner.child.clone()
        };
        if let Some(child) = child {
            let _ = tokio::task::spawn_blocking(move || {
                if let Ok(mut guard) = child.lock() {
                    if let Some(child) = guard.as_mut() {
                        let _ = child.kill();
                    }
                }
            })
            .await;
        }
    }

    async fn run_output_loop(
        self: Arc<Self>,
        record_id: String,
        mut output_rx: mpsc::UnboundedReceiver<String>,
        child: ChildHandle,
    ) {
        while let Some(line) = output_rx.recv().await {
            self.handle_agent_line(&record_id, &line).await;
        }

        let status = tokio::task::spawn_blocking(move || {
            let taken = child.lock().ok().and_then(|mut guard| guard.take());
            taken.map(|mut child| child.wait())
        })
        .await;

        let outcome = match status {
            Ok(Some(Ok(status))) if status.success() => Ok(()),
            Ok(Some(Ok(status))) => Err(format!("agent exited with status {status}")),
            Ok(Some(Err(err))) => Err(format!("failed to wait for agent: {err}")),
            Ok(None) => Err("agent process handle lost".to_string()),
            Err(err) => Err(format!("failed to join agent wait: {err}")),
        };
        self.finalize(&record_id, outcome).await;
    }

    async fn handle_agent_line(self: &Arc<Self>, record_id: &str, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(error = %err, "unparseable agent line");
                self.log.push("agent.unparsed", trimmed, None);
                return;
            }
        };

        match value.get("type").and_then(Value::as_str).unwrap_or("") {
            "system" => {
                if let Some(native) = value.get("session_id").and_then(Value::as_str) {
                    let mut inner = self.inner.lock().await;
                    if inner.native_session_id.is_none() {
                        inner.native_session_id = Some(native.to_string());
                    }
                }
            }
            "assistant" => self.handle_assistant(&value).await,
            "user" => self.handle_tool_results(&value).await,
            "control_request" => self.handle_control_request(&value).await,
            "result" => self.handle_result(record_id, &value).await,
            other => {
                // tool_progress and friends carry nothing the browser needs.
                tracing::trace!(kind = other, "ignored agent event");
            }
        }
    }

    async fn handle_assistant(&self, value: &Value) {
        let blocks = value
            .get("message")
            .and_then(|message| message.get("content"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            for block in &blocks {
                match block.get("type").and_then(Value::as_str).unwrap_or("") {
                    "text" => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            events.push(ServerEvent::Text {
                                content: text.to_string(),
                            });
                        }
                    }
                    "tool_use" => {
                        let tool = block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string();
                        let tool_use_id = block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let input = block.get("input").cloned().unwrap_or(Value::Null);
                        inner.tool_names.insert(tool_use_id.clone(), tool.clone());
                        events.push(ServerEvent::ToolStart {
                            tool,
                            tool_use_id,
                            input,
                        });
                    }
                    _ => {}
                }
            }
            let senders = inner.sender_snapshot();
            drop(inner);
            for event in &events {
                deliver(&senders, event);
            }
        }
    }

    async fn handle_tool_results(&self, value: &Value) {
        let blocks = value
            .get("message")
            .and_then(|message| message.get("content"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut events = Vec::new();
        let inner = self.inner.lock().await;
        for block in &blocks {
            if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                continue;
            }
            let tool_use_id = block
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let tool = inner
                .tool_names
                .get(&tool_use_id)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            let output = match block.get("content") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            events.push(ServerEvent::ToolEnd {
                tool,
                tool_use_id,
                output,
            });
        }
        let senders = inner.sender_snapshot();
        drop(inner);
        for event in &events {
            deliver(&senders, event);
        }
    }

    async fn handle_control_request(self: &Arc<Self>, value: &Value) {
        let request = value.get("request").cloned().unwrap_or(Value::Null);
        if request.get("subtype").and_then(Value::as_str) != Some("can_use_tool") {
            return;
        }
        let request_id = value
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tool = request
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let input = request.get("input").cloned().unwrap_or(Value::Null);
        let description = request
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Use the {tool} tool"));
        let id = request
            .get("tool_use_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| request_id.clone());

        let manager = Arc::clone(self);
        let timeout_id = id.clone();
        let timeout_duration = self.permission_timeout;
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(timeout_duration).await;
            manager.expire_permission(&timeout_id).await;
        });

        let mut inner = self.inner.lock().await;
        inner.pending_permissions.insert(
            id.clone(),
            PendingPermission {
                request_id,
                tool: tool.clone(),
                timeout,
            },
        );
        let state_event = inner.set_phase(SessionPhase::WaitingPermission);
        let request_event = ServerEvent::PermissionRequest {
            id,
            tool,
            input,
            description,
        };
        let senders = inner.sender_snapshot();
        drop(inner);
        deliver(&senders, &state_event);
        deliver(&senders, &request_event);
    }

    async fn handle_result(&self, record_id: &str, value: &Value) {
        let mut inner = self.inner.lock().await;
        if let Some(cost) = value.get("total_cost_usd").and_then(Value::as_f64) {
            inner.total_cost_usd = cost;
        }
        inner.turn_count = value
            .get("num_turns")
            .and_then(Value::as_u64)
            .unwrap_or(inner.turn_count + 1);
        if let Err(err) = self
            .store
            .record_turn(record_id, inner.turn_count, inner.total_cost_usd)
        {
            tracing::warn!(error = %err, "failed to persist turn");
        }
        let event = ServerEvent::Cost {
            total_usd: inner.total_cost_usd,
        };
        let senders = inner.sender_snapshot();
        drop(inner);
        deliver(&senders, &event);
    }

    async fn expire_permission(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(pending) = inner.pending_permissions.remove(id) else {
            return;
        };
        let line = control_response_line(
            &pending.request_id,
            "deny",
            Some("Permission request timed out.".to_string()),
        );
        let _ = inner.send_input_line(line);
        self.log.push("permission.timeout", id, None);
        let state_event = inner.set_phase(SessionPhase::Running);
        let senders = inner.sender_snapshot();
        drop(inner);
        deliver(&senders, &state_event);
    }

    async fn finalize(&self, record_id: &str, outcome: Result<(), String>) {
        let mut inner = self.inner.lock().await;
        if inner.record_id.as_deref() != Some(record_id) || !inner.phase.is_active() {
            return;
        }

        let drained = std::mem::take(&mut inner.pending_permissions);
        for (_, pending) in drained {
            pending.timeout.abort();
            // The verdict may no longer reach a dead process; that is fine.
            let line = control_response_line(
                &pending.request_id,
                "deny",
                Some("Session ended.".to_string()),
            );
            let _ = inner.send_input_line(line);
        }
        inner.input = None;
        inner.child = None;
        inner.tool_names.clear();

        let interrupted = inner.interrupted;
        let (phase, status, error_message) = match &outcome {
            Ok(()) => (SessionPhase::Done, SessionStatus::Stopped, None),
            Err(_) if interrupted => (SessionPhase::Done, SessionStatus::Stopped, None),
            Err(message) => (
                SessionPhase::Error,
                SessionStatus::Error,
                Some(message.clone()),
            ),
        };
        if let Err(err) =
            self.store
                .finish_session(record_id, time::OffsetDateTime::now_utc(), status)
        {
            tracing::warn!(error = %err, "failed to persist session end");
        }

        let state_event = inner.set_phase(phase);
        let senders = inner.sender_snapshot();
        drop(inner);
        deliver(&senders, &state_event);
        if let Some(message) = error_message {
            tracing::warn!(message = %message, "agent session failed");
            self.log.push("session.error", &message, None);
            deliver(&senders, &ServerEvent::Error { message });
        } else {
            self.log.push("session.ended", record_id, None);
        }
    }
}

fn deliver(senders: &[mpsc::UnboundedSender<String>], event: &ServerEvent) {
    let payload = event.to_json();
    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

struct AgentSpawn {
    child: Child,
    stdin: std::process::ChildStdin,
    stdout: std::process::ChildStdout,
    stderr: std::process::ChildStderr,
}

async fn spawn_agent(wrapper_path: &Path, oauth_token: &str) -> Result<AgentSpawn, GatewayError> {
    let wrapper: PathBuf = wrapper_path.to_path_buf();
    let token = oauth_token.to_string();
    tokio::task::spawn_blocking(move || -> Result<AgentSpawn, GatewayError> {
        let mut command = std::process::Command::new(&wrapper);
        command
            .env(TOKEN_ENV_VAR, token)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|err| GatewayError::Agent {
            message: format!("failed to spawn wrapper {}: {err}", wrapper.display()),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| GatewayError::Agent {
            message: "agent stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GatewayError::Agent {
            message: "agent stdout unavailable".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| GatewayError::Agent {
            message: "agent stderr unavailable".to_string(),
        })?;
        Ok(AgentSpawn {
            child,
            stdin,
            stdout,
            stderr,
        })
    })
    .await
    .map_err(|err| GatewayError::Internal {
        message: format!("spawn task failed: {err}"),
    })?
}

fn read_lines<R: std::io::Read>(reader: R, sender: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
                if sender.send(trimmed).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

fn write_lines<W: Write>(mut writer: W, mut receiver: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = receiver.blocking_recv() {
        if writeln!(writer, "{line}").is_err() {
            break;
        }
        if writer.flush().is_err() {
            break;
        }
    }
}

fn user_message_line(session_id: &str, content: &str) -> String {
    serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": content,
        },
        "parent_tool_use_id": null,
        "session_id": session_id,
    })
    .to_string()
}

fn control_response_line(request_id: &str, behavior: &str, message: Option<String>) -> String {
    let mut response = serde_json::Map::new();
    response.insert(
        "behavior".to_string(),
        Value::String(behavior.to_string()),
    );
    if let Some(message) = message {
        response.insert("message".to_string(), Value::String(message));
    }
    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": Value::Object(response),
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_line_shape() {
        let line = user_message_line("native-1", "hello");
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["role"], "user");
        assert_eq!(value["message"]["content"], "hello");
        assert_eq!(value["session_id"], "native-1");
    }

    #[test]
    fn control_response_line_shape() {
        let line = control_response_line("r1", "deny", Some("Permission denied.".to_string()));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "control_response");
        assert_eq!(value["response"]["request_id"], "r1");
        assert_eq!(value["response"]["response"]["behavior"], "deny");
        assert_eq!(
            value["response"]["response"]["message"],
            "Permission denied."
        );

        let allow = control_response_line("r2", "allow", None);
        let value: Value = serde_json::from_str(&allow).unwrap();
        assert_eq!(value["response"]["response"]["behavior"], "allow");
        assert!(value["response"]["response"].get("message").is_none());
    }

    #[test]
    fn phase_transition_predicates() {
        assert!(SessionPhase::Idle.can_start());
        assert!(SessionPhase::Done.can_start());
        assert!(SessionPhase::Error.can_start());
        assert!(!SessionPhase::Running.can_start());
        assert!(!SessionPhase::WaitingPermission.can_start());
        assert!(SessionPhase::Running.is_active());
        assert!(SessionPhase::WaitingPermission.is_active());
        assert!(!SessionPhase::Idle.is_active());
    }
}
