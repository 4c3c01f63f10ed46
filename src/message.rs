//! The closed message/response data model shared by every transport (§3).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// A closed set of transport kinds. Order here is only definitional — the
/// configured `fallback_chain` (see [`crate::config`]) governs tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportKind {
    Http,
    WebSocket,
    FileSystem,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Http => "http",
            Self::WebSocket => "websocket",
            Self::FileSystem => "filesystem",
        };
        f.write_str(s)
    }
}

/// Per-transport connection state (§3 "Transport identity").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Manager-level active-transport state machine (§4.5 "State machine —
/// active transport"). Distinct from `ConnectionState`, which tracks a
/// single transport's own lifecycle; this tracks which transport (if any)
/// is currently carrying traffic and whether it is healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveTransportState {
    /// No `connect()` has completed yet.
    Offline,
    /// A `connect()` call is in flight.
    Initializing,
    /// `transport` is connected and its circuit breaker is closed.
    Active(TransportKind),
    /// `transport` is the last one that carried traffic, but its circuit
    /// breaker is open; `alternatives` lists other connected transports the
    /// next `send()` would fail over to.
    Degraded {
        transport: TransportKind,
        alternatives: Vec<TransportKind>,
    },
}

/// Priority attached to a selection context. Higher priority does not bypass
/// scoring — it only shifts the derived realtime/latency requirements (see
/// [`crate::selection`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Task type a caller of the model selection service is asking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    TextGeneration,
    CodeGeneration,
    Chat,
    Summarization,
    Translation,
    Embedding,
    Editing,
    Analysis,
    Planning,
    WorkflowExecution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityRequirement {
    Low,
    Medium,
    High,
}

/// The closed set of message payload types (§3, §9 — a tagged variant
/// instead of a stringly-typed dispatch table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessagePayload {
    ModelSelectionRequest(crate::selection::ModelSelectionRequest),
    HealthCheckRequest(HealthCheckRequest),
    PreferencesUpdate(crate::selection::UserPreferences),
    ChatEnhanced(ChatEnhancedRequest),
    WorkflowRequest(WorkflowRequest),
    TaskPlanningRequest(TaskPlanningRequest),
    // Push-only types — never sent by a caller, only emitted by a transport.
    HealthUpdate(HealthUpdate),
    PerformanceMetrics(PerformanceMetrics),
    StreamChunk(StreamChunk),
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ModelSelectionRequest(_) => MessageType::ModelSelectionRequest,
            Self::HealthCheckRequest(_) => MessageType::HealthCheckRequest,
            Self::PreferencesUpdate(_) => MessageType::PreferencesUpdate,
            Self::ChatEnhanced(_) => MessageType::ChatEnhanced,
            Self::WorkflowRequest(_) => MessageType::WorkflowRequest,
            Self::TaskPlanningRequest(_) => MessageType::TaskPlanningRequest,
            Self::HealthUpdate(_) => MessageType::HealthUpdate,
            Self::PerformanceMetrics(_) => MessageType::PerformanceMetrics,
            Self::StreamChunk(_) => MessageType::StreamChunk,
        }
    }
}

/// The tag half of [`MessagePayload`], used wherever only the type (not the
/// body) matters — capability filtering, routing tables, subscriber keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ModelSelectionRequest,
    HealthCheckRequest,
    PreferencesUpdate,
    ChatEnhanced,
    WorkflowRequest,
    TaskPlanningRequest,
    HealthUpdate,
    PerformanceMetrics,
    StreamChunk,
}

impl MessageType {
    /// Whether this type can ever originate as an unsolicited push (i.e. has
    /// no request counterpart).
    pub fn is_push_only(self) -> bool {
        matches!(
            self,
            Self::HealthUpdate | Self::PerformanceMetrics | Self::StreamChunk
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEnhancedRequest {
    pub conversation_id: String,
    pub message: String,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRequest {
    pub workflow_id: String,
    pub inputs: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPlanningRequest {
    pub goal: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthUpdate {
    pub transport: TransportKind,
    pub health: HealthSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub transport: TransportKind,
    pub latency_ms: f64,
    pub throughput_per_sec: f64,
}

/// A single chunk of a streaming response, carried over `correlationId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub correlation_id: String,
    pub content: String,
    pub is_complete: bool,
    pub metadata: Option<serde_json::Value>,
}

/// Every outbound and inbound payload (§3 "Message"). Field names follow the
/// wire protocol's camelCase convention (the peer is not a Rust process).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(flatten)]
    pub payload: MessagePayload,
    pub timestamp: u64,
    /// Present only on responses — echoes the request `id`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn new_request(payload: MessagePayload) -> Self {
        Self {
            id: generate_id(),
            payload,
            timestamp: now_millis(),
            correlation_id: None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

/// A correlated reply to a [`Message`] (§3 "Response").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: String,
    pub correlation_id: String,
    pub success: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
    pub timestamp: u64,
}

impl Response {
    pub fn success(correlation_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: generate_id(),
            correlation_id: correlation_id.into(),
            success: true,
            payload,
            error: None,
            timestamp: now_millis(),
        }
    }

    pub fn failure(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            correlation_id: correlation_id.into(),
            success: false,
            payload: serde_json::Value::Null,
            error: Some(error.into()),
            timestamp: now_millis(),
        }
    }
}

/// Selection metadata attached to every outbound send (§3 "Selection context").
#[derive(Debug, Clone)]
pub struct SelectionContext {
    pub message_type: MessageType,
    pub priority: Priority,
    pub requires_realtime: bool,
    pub max_latency_ms: Option<u64>,
}

/// Capability descriptor, immutable after construction (§3).
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    pub bidirectional: bool,
    pub streaming: bool,
    pub realtime_capable: bool,
    pub offline_capable: bool,
    pub max_message_bytes: usize,
    pub supported_types: Vec<MessageType>,
}

impl CapabilityDescriptor {
    pub fn supports(&self, message_type: MessageType) -> bool {
        self.supported_types.contains(&message_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Rolling per-transport health record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub latency_ms: f64,
    pub error_rate: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success_at: Option<u64>,
    pub last_failure_at: Option<u64>,
    pub consecutive_failures: u32,
    pub circuit_state: CircuitState,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            latency_ms: 0.0,
            error_rate: 0.0,
            success_count: 0,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
            consecutive_failures: 0,
            circuit_state: CircuitState::Closed,
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 128-bit random id rendered as hex — client-generated, used to correlate
/// responses (§3).
pub fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
