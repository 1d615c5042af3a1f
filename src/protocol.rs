//! MCP Protocol Handler
//!
//! Stateful JSON-RPC 2.0 endpoint implementing the MCP lifecycle, tool
//! discovery and tool invocation on top of the skill registry.
//! Reference: https://modelcontextprotocol.io/specification

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::composer::Composer;
use crate::error::SkillError;
use crate::registry::SkillMetadata;

/// Protocol revision this server speaks
pub const PROTOCOL_VERSION: &str = "2025-06-18";
pub const SERVER_NAME: &str = "skilld";

/// JSON-RPC / MCP error codes
pub mod error_codes {
    // JSON-RPC standard errors
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    // Server errors for the skills/* extension methods
    pub const SKILL_NOT_FOUND: i32 = -32001;
    pub const REGISTRATION_FAILED: i32 = -32002;
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    fn from_skill_error(id: Value, err: &SkillError) -> Self {
        let code = match err {
            SkillError::NotFound(_) => error_codes::SKILL_NOT_FOUND,
            SkillError::Registration { .. } => error_codes::REGISTRATION_FAILED,
            _ => error_codes::INTERNAL_ERROR,
        };
        let mut response = Self::error(id, code, err.to_string());
        if let Some(error) = response.error.as_mut() {
            error.data = Some(json!({"kind": err.kind()}));
        }
        response
    }
}

/// A validated inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Incoming {
    /// Parse one raw message. Malformed input, including bytes that are not
    /// UTF-8, yields the error response to send back.
    pub fn parse(raw: impl AsRef<[u8]>) -> Result<Self, RpcResponse> {
        let value: Value = serde_json::from_slice(raw.as_ref()).map_err(|e| {
            RpcResponse::error(
                Value::Null,
                error_codes::PARSE_ERROR,
                format!("Parse error: {}", e),
            )
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, RpcResponse> {
        let Value::Object(mut object) = value else {
            return Err(RpcResponse::error(
                Value::Null,
                error_codes::INVALID_REQUEST,
                "Invalid Request: message must be a JSON object",
            ));
        };

        // A null id is legal JSON-RPC but indistinguishable from the null id
        // of error replies, so it is refused like any other non-scalar id.
        let id = match object.remove("id") {
            None => None,
            Some(id @ (Value::String(_) | Value::Number(_))) => Some(id),
            Some(_) => {
                return Err(RpcResponse::error(
                    Value::Null,
                    error_codes::INVALID_REQUEST,
                    "Invalid Request: id must be a string or a number",
                ))
            }
        };
        let reply_id = id.clone().unwrap_or(Value::Null);

        if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err(RpcResponse::error(
                reply_id,
                error_codes::INVALID_REQUEST,
                "Invalid Request: jsonrpc must be \"2.0\"",
            ));
        }
        let method = match object.remove("method") {
            Some(Value::String(method)) => method,
            Some(_) => {
                return Err(RpcResponse::error(
                    reply_id,
                    error_codes::INVALID_REQUEST,
                    "Invalid Request: method must be a string",
                ))
            }
            None => {
                return Err(RpcResponse::error(
                    reply_id,
                    error_codes::INVALID_REQUEST,
                    "Invalid Request: missing method",
                ))
            }
        };
        let params = object.remove("params");

        Ok(match id {
            Some(id) => Self::Request { id, method, params },
            None => Self::Notification { method, params },
        })
    }

    pub fn method(&self) -> &str {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => method,
        }
    }

    /// Tool calls may run long; transports run them off the read loop
    pub fn is_tool_call(&self) -> bool {
        matches!(self, Self::Request { method, .. } if method == "tools/call")
    }
}

/// `notifications/tools/list_changed` message
pub fn list_changed_notification() -> Value {
    json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"})
}

/// What the client told us in `initialize`
#[derive(Debug, Clone, Default)]
pub struct ClientSession {
    pub protocol_version: Option<String>,
    pub client_info: Value,
    pub capabilities: Value,
}

#[derive(Debug, Clone)]
enum SessionState {
    Uninitialized,
    Initialized(ClientSession),
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: Option<Value>,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RegisterParams {
    metadata: SkillMetadata,
    code: String,
}

#[derive(Debug, Deserialize)]
struct NameParams {
    name: String,
}

/// Removes a finished call from the in-flight table and cancels it if the
/// caller went away before it finished
struct InFlight<'a> {
    handler: &'a ProtocolHandler,
    key: String,
    seq: u64,
    token: CancellationToken,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.token.cancel();
        }
        let mut calls = self.handler.in_flight();
        if let Some(entries) = calls.get_mut(&self.key) {
            entries.retain(|(seq, _)| *seq != self.seq);
            if entries.is_empty() {
                calls.remove(&self.key);
            }
        }
    }
}

/// Live calls by request id. Separate clients may reuse an id, so each
/// entry carries its own sequence number.
type CallTable = HashMap<String, Vec<(u64, CancellationToken)>>;

pub struct ProtocolHandler {
    composer: Composer,
    session: RwLock<SessionState>,
    calls: Mutex<CallTable>,
    next_call: AtomicU64,
    allow_registration: bool,
}

impl ProtocolHandler {
    pub fn new(composer: Composer) -> Self {
        Self {
            composer,
            session: RwLock::new(SessionState::Uninitialized),
            calls: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(0),
            allow_registration: true,
        }
    }

    /// Expose or hide the skills/* extension methods
    pub fn with_registration(mut self, allow: bool) -> Self {
        self.allow_registration = allow;
        self
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn is_initialized(&self) -> bool {
        matches!(
            *self.session.read().unwrap_or_else(PoisonError::into_inner),
            SessionState::Initialized(_)
        )
    }

    pub fn client_session(&self) -> Option<ClientSession> {
        match &*self.session.read().unwrap_or_else(PoisonError::into_inner) {
            SessionState::Initialized(session) => Some(session.clone()),
            SessionState::Uninitialized => None,
        }
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, CallTable> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one raw message; `None` means nothing is sent back
    pub async fn handle_raw(&self, raw: impl AsRef<[u8]>) -> Option<RpcResponse> {
        let raw = raw.as_ref();
        debug!("← {}", String::from_utf8_lossy(raw).trim_end());
        match Incoming::parse(raw) {
            Ok(message) => self.handle(message).await,
            Err(response) => {
                warn!(
                    code = response.error.as_ref().map(|e| e.code),
                    "Rejected malformed message"
                );
                Some(response)
            }
        }
    }

    pub async fn handle(&self, message: Incoming) -> Option<RpcResponse> {
        match message {
            Incoming::Notification { method, params } => {
                self.handle_notification(&method, params);
                None
            }
            Incoming::Request { id, method, params } => {
                Some(self.handle_request(id, &method, params).await)
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            "notifications/initialized" | "initialized" => {
                debug!("Client finished initialization")
            }
            "notifications/cancelled" => {
                let request_id = params
                    .as_ref()
                    .and_then(|p| p.get("requestId"))
                    .map(Value::to_string);
                let Some(key) = request_id else {
                    warn!("Cancellation without requestId ignored");
                    return;
                };
                match self.in_flight().get(&key) {
                    Some(entries) => {
                        info!(request_id = %key, calls = entries.len(), "Cancelling tool call");
                        for (_, token) in entries {
                            token.cancel();
                        }
                    }
                    None => debug!(request_id = %key, "Cancellation for unknown request"),
                }
            }
            other => debug!(method = other, "Ignoring notification"),
        }
    }

    async fn handle_request(&self, id: Value, method: &str, params: Option<Value>) -> RpcResponse {
        match method {
            // Lifecycle
            "initialize" => self.handle_initialize(id, params),
            "ping" => RpcResponse::success(id, json!({})),

            // Tools
            "tools/list" => match self.require_initialized(&id) {
                Err(response) => response,
                Ok(()) => self.handle_tools_list(id),
            },
            "tools/call" => match self.require_initialized(&id) {
                Err(response) => response,
                Ok(()) => self.handle_tools_call(id, params).await,
            },

            // Skill management
            "skills/register" | "skills/unregister" | "skills/code" if self.allow_registration => {
                match self.require_initialized(&id) {
                    Err(response) => response,
                    Ok(()) => self.handle_skills(id, method, params).await,
                }
            }

            _ => {
                debug!(method, "Unknown method");
                RpcResponse::error(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("Method not found: {}", method),
                )
            }
        }
    }

    fn require_initialized(&self, id: &Value) -> Result<(), RpcResponse> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(RpcResponse::error(
                id.clone(),
                error_codes::INTERNAL_ERROR,
                "Not initialized",
            ))
        }
    }

    fn handle_initialize(&self, id: Value, params: Option<Value>) -> RpcResponse {
        let params = params.unwrap_or_else(|| json!({}));
        let requested = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        match requested.as_deref() {
            Some(PROTOCOL_VERSION) => {}
            Some(other) => warn!(
                requested = other,
                supported = PROTOCOL_VERSION,
                "Protocol version mismatch; answering with ours"
            ),
            None => warn!("initialize without protocolVersion"),
        }

        let session = ClientSession {
            protocol_version: requested,
            client_info: params.get("clientInfo").cloned().unwrap_or(Value::Null),
            capabilities: params.get("capabilities").cloned().unwrap_or(Value::Null),
        };
        let client = session
            .client_info
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        {
            let mut state = self.session.write().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, SessionState::Initialized(_)) {
                warn!(client = %client, "Client re-initialized the session");
            }
            *state = SessionState::Initialized(session);
        }
        info!(client = %client, "Session initialized");

        RpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {"listChanged": true}
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        )
    }

    fn handle_tools_list(&self, id: Value) -> RpcResponse {
        let mut skills = self.composer.registry().list();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        let tools: Vec<Value> = skills.iter().map(tool_descriptor).collect();
        debug!(count = tools.len(), "Listing tools");
        RpcResponse::success(id, json!({ "tools": tools }))
    }

    async fn handle_tools_call(&self, id: Value, params: Option<Value>) -> RpcResponse {
        let params: CallParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) | Err(_) => {
                return RpcResponse::error(
                    id,
                    error_codes::INVALID_PARAMS,
                    "Invalid params: tools/call expects {name, arguments}",
                )
            }
        };
        let Some(Value::String(name)) = params.name else {
            return RpcResponse::error(
                id,
                error_codes::INVALID_PARAMS,
                "Invalid params: missing tool name",
            );
        };
        let arguments = match params.arguments {
            None | Some(Value::Null) => json!({}),
            Some(args @ Value::Object(_)) => args,
            Some(_) => {
                return RpcResponse::error(
                    id,
                    error_codes::INVALID_PARAMS,
                    "Invalid params: arguments must be an object",
                )
            }
        };

        let token = CancellationToken::new();
        let mut guard = InFlight {
            handler: self,
            key: id.to_string(),
            seq: self.next_call.fetch_add(1, Ordering::Relaxed),
            token: token.clone(),
            finished: false,
        };
        self.in_flight()
            .entry(guard.key.clone())
            .or_default()
            .push((guard.seq, token.clone()));

        info!(tool = %name, "Calling tool");
        let composer = self.composer.clone();
        let tool = name.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            composer.run_with_cancel(&tool, arguments, token)
        })
        .await;
        guard.finished = true;
        drop(guard);

        let (text, is_error) = match outcome {
            Ok(Ok(value)) => (result_text(&value), false),
            Ok(Err(err)) => {
                info!(tool = %name, kind = err.kind(), error = %err, "Tool call failed");
                (format!("Error: {}", err), true)
            }
            Err(join) => {
                warn!(tool = %name, error = %join, "Tool task aborted");
                (format!("Error: skill '{}' aborted", name), true)
            }
        };

        RpcResponse::success(
            id,
            json!({
                "content": [{"type": "text", "text": text}],
                "isError": is_error
            }),
        )
    }

    async fn handle_skills(&self, id: Value, method: &str, params: Option<Value>) -> RpcResponse {
        let params = params.unwrap_or(Value::Null);
        let registry = self.composer.registry().clone();

        match method {
            "skills/register" => {
                let params: RegisterParams = match serde_json::from_value(params) {
                    Ok(p) => p,
                    Err(e) => {
                        return RpcResponse::error(
                            id,
                            error_codes::INVALID_PARAMS,
                            format!("Invalid params: {}", e),
                        )
                    }
                };
                let name = params.metadata.name.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    registry.register(params.metadata, params.code)
                })
                .await;
                match outcome {
                    Ok(Ok(())) => RpcResponse::success(id, json!({ "registered": name })),
                    Ok(Err(err)) => RpcResponse::from_skill_error(id, &err),
                    Err(join) => RpcResponse::error(
                        id,
                        error_codes::INTERNAL_ERROR,
                        format!("registration aborted: {}", join),
                    ),
                }
            }
            "skills/unregister" | "skills/code" => {
                let name = match serde_json::from_value::<NameParams>(params) {
                    Ok(p) => p.name,
                    Err(e) => {
                        return RpcResponse::error(
                            id,
                            error_codes::INVALID_PARAMS,
                            format!("Invalid params: {}", e),
                        )
                    }
                };
                let outcome = if method == "skills/unregister" {
                    registry
                        .unregister(&name)
                        .map(|()| json!({ "unregistered": name }))
                } else {
                    registry
                        .get_code(&name)
                        .map(|code| json!({ "name": name, "code": code }))
                };
                match outcome {
                    Ok(result) => RpcResponse::success(id, result),
                    Err(err) => RpcResponse::from_skill_error(id, &err),
                }
            }
            _ => RpcResponse::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {}", method),
            ),
        }
    }
}

/// MCP tool descriptor for a skill
pub fn tool_descriptor(metadata: &SkillMetadata) -> Value {
    json!({
        "name": metadata.name,
        "description": metadata.description,
        "inputSchema": metadata.input_schema(),
    })
}

/// Strings are sent as-is; everything else as compact JSON
pub fn result_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
