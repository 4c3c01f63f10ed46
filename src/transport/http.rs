//! HTTP transport: request/response over HTTP with an optional persistent
//! event-stream subscription for server-initiated push (§4.2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use crate::config::{Config, HttpConfig};
use crate::error::TransportError;
use crate::message::{
    CapabilityDescriptor, ConnectionState, HealthSnapshot, Message, MessagePayload, MessageType,
    SelectionContext, StreamChunk, TransportKind,
};
use crate::transport::{unwrap_envelope, BaseTransport, CircuitBreaker, HealthTracker, InboundSink};

/// Bound on in-flight stream-chunk buffering per correlation (§9 "Streaming
/// back-pressure", resolved in SPEC_FULL §11): 64 chunks or 1 MiB, whichever
/// comes first.
const STREAM_CHUNK_LIMIT: usize = 64;
const STREAM_BYTE_LIMIT: usize = 1024 * 1024;

const EVENT_RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const EVENT_RECONNECT_CAP: Duration = Duration::from_secs(30);
const EVENT_RECONNECT_MAX_ATTEMPTS: u32 = 10;

pub struct HttpTransport {
    client: Client,
    server_url: Option<String>,
    api_key: Option<String>,
    config: HttpConfig,
    default_timeout: Duration,
    state: Mutex<ConnectionState>,
    circuit: CircuitBreaker,
    health: HealthTracker,
    capabilities: CapabilityDescriptor,
    inbound: Arc<dyn InboundSink>,
    event_task_running: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: &Config, inbound: Arc<dyn InboundSink>) -> Self {
        let client = Client::builder()
            .pool_max_idle_per_host(config.http.max_connections)
            .build()
            .expect("failed to build HTTP client");

        let bidirectional = config.http.enable_sse;
        let capabilities = CapabilityDescriptor {
            bidirectional,
            streaming: true,
            realtime_capable: false,
            offline_capable: false,
            max_message_bytes: 16 * 1024 * 1024,
            supported_types: vec![
                MessageType::ModelSelectionRequest,
                MessageType::HealthCheckRequest,
                MessageType::PreferencesUpdate,
                MessageType::ChatEnhanced,
                MessageType::WorkflowRequest,
                MessageType::TaskPlanningRequest,
            ],
        };

        Self {
            client,
            server_url: config.server_url.clone(),
            api_key: config.api_key.clone(),
            config: config.http.clone(),
            default_timeout: config.timeout,
            state: Mutex::new(ConnectionState::Disconnected),
            circuit: CircuitBreaker::default(),
            health: HealthTracker::default(),
            capabilities,
            inbound,
            event_task_running: AtomicBool::new(false),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn url(&self, path: &str) -> Result<String, TransportError> {
        let base = self
            .server_url
            .as_ref()
            .ok_or_else(|| TransportError::TransportUnavailable("no server_url configured".into()))?;
        Ok(format!("{}{}", base.trim_end_matches('/'), path))
    }

    fn endpoint_for(&self, message_type: MessageType, streaming: bool) -> Option<(&str, reqwest::Method)> {
        use reqwest::Method;
        let path: &str = match message_type {
            MessageType::ModelSelectionRequest => &self.config.selection_path,
            MessageType::HealthCheckRequest => &self.config.health_path,
            MessageType::PreferencesUpdate => &self.config.preferences_path,
            MessageType::ChatEnhanced if streaming => &self.config.chat_stream_path,
            MessageType::ChatEnhanced => &self.config.chat_path,
            MessageType::WorkflowRequest => &self.config.workflow_path,
            MessageType::TaskPlanningRequest => &self.config.task_planning_path,
            MessageType::HealthUpdate | MessageType::PerformanceMetrics | MessageType::StreamChunk => {
                return None
            }
        };
        let method = if message_type == MessageType::HealthCheckRequest {
            Method::GET
        } else {
            Method::POST
        };
        Some((path, method))
    }

    /// Spawns the persistent SSE subscription for server push, if configured.
    /// Safe to call more than once — only one subscription task runs at a time.
    pub fn spawn_event_subscription(self: &Arc<Self>) {
        if !self.config.enable_sse {
            return;
        }
        if self.event_task_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_event_subscription().await;
            this.event_task_running.store(false, Ordering::SeqCst);
        });
    }

    async fn run_event_subscription(&self) {
        let mut attempt = 0u32;
        loop {
            let url = match self.url(&self.config.events_path) {
                Ok(u) => u,
                Err(_) => return,
            };
            let mut request = self.client.get(&url).header("Accept", "text/event-stream");
            if let Some(ref key) = self.api_key {
                request = request.header("Authorization", format!("Bearer {key}"));
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    attempt = 0;
                    let mut stream = response.bytes_stream().eventsource();
                    while let Some(event) = stream.next().await {
                        match event {
                            Ok(ev) => self.handle_push_event(&ev.data),
                            Err(e) => {
                                tracing::warn!("HTTP event stream error: {e}");
                                break;
                            }
                        }
                    }
                }
                Ok(response) => {
                    tracing::warn!("HTTP event stream subscribe failed: {}", response.status());
                }
                Err(e) => {
                    tracing::warn!("HTTP event stream connect failed: {e}");
                }
            }

            attempt += 1;
            if attempt > EVENT_RECONNECT_MAX_ATTEMPTS {
                tracing::error!("HTTP event stream giving up after {attempt} attempts");
                return;
            }
            let delay = (EVENT_RECONNECT_INITIAL * 2u32.pow(attempt.saturating_sub(1))).min(EVENT_RECONNECT_CAP);
            tokio::time::sleep(delay).await;
        }
    }

    fn handle_push_event(&self, data: &str) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
            tracing::warn!("HTTP push event was not valid JSON, dropping");
            return;
        };
        let Some(push) = parse_push_payload(&value) else {
            return;
        };
        let message = Message {
            id: crate::message::generate_id(),
            payload: push,
            timestamp: crate::message::now_millis(),
            correlation_id: None,
        };
        self.inbound.dispatch(TransportKind::Http, message);
    }

    async fn send_streaming(
        &self,
        url: String,
        body: serde_json::Value,
        correlation_id: String,
        deadline: Instant,
    ) -> Result<serde_json::Value, TransportError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut request = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = tokio::time::timeout(remaining, request.send())
            .await
            .map_err(|_| TransportError::Timeout(remaining.as_millis() as u64))??;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::ServiceUnavailable(format!("{status}: {text}")));
        }

        let mut stream = response.bytes_stream().eventsource();
        let mut accumulated = String::new();
        let mut chunk_count = 0usize;
        let mut byte_count = 0usize;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(0));
            }
            let next = tokio::time::timeout(remaining, stream.next()).await;
            let event = match next {
                Ok(Some(Ok(ev))) => ev,
                Ok(Some(Err(e))) => {
                    return Err(TransportError::ProtocolError(format!("stream error: {e}")))
                }
                Ok(None) => break,
                Err(_) => return Err(TransportError::Timeout(0)),
            };

            let Ok(chunk) = serde_json::from_str::<StreamChunkWire>(&event.data) else {
                continue;
            };

            chunk_count += 1;
            byte_count += chunk.content.len();
            if chunk_count > STREAM_CHUNK_LIMIT || byte_count > STREAM_BYTE_LIMIT {
                return Err(TransportError::ProtocolError(
                    "stream back-pressure limit exceeded".into(),
                ));
            }

            accumulated.push_str(&chunk.content);

            self.inbound.dispatch(
                TransportKind::Http,
                Message {
                    id: crate::message::generate_id(),
                    payload: MessagePayload::StreamChunk(StreamChunk {
                        correlation_id: correlation_id.clone(),
                        content: chunk.content.clone(),
                        is_complete: chunk.is_complete,
                        metadata: chunk.metadata.clone(),
                    }),
                    timestamp: crate::message::now_millis(),
                    correlation_id: Some(correlation_id.clone()),
                },
            );

            if chunk.is_complete {
                break;
            }
        }

        Ok(serde_json::json!({ "success": true, "content": accumulated }))
    }
}

#[derive(Deserialize)]
struct StreamChunkWire {
    content: String,
    #[serde(default, rename = "isComplete")]
    is_complete: bool,
    metadata: Option<serde_json::Value>,
}

fn parse_push_payload(value: &serde_json::Value) -> Option<MessagePayload> {
    let ty = value.get("type")?.as_str()?;
    match ty {
        "health_update" => serde_json::from_value(value.get("data")?.clone())
            .ok()
            .map(MessagePayload::HealthUpdate),
        "performance_metrics" => serde_json::from_value(value.get("data")?.clone())
            .ok()
            .map(MessagePayload::PerformanceMetrics),
        _ => {
            tracing::debug!(event_type = ty, "ignoring unrecognized HTTP push event type");
            None
        }
    }
}

#[async_trait]
impl BaseTransport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if *self.state.lock().unwrap() == ConnectionState::Connected {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);

        let url = self.url(&self.config.health_path)?;
        let result = tokio::time::timeout(self.config.probe_timeout, self.client.get(&url).send()).await;

        match result {
            Ok(Ok(response)) if response.status().is_success() => {
                self.set_state(ConnectionState::Connected);
                tracing::info!("HTTP transport connected");
                Ok(())
            }
            Ok(Ok(response)) => {
                self.set_state(ConnectionState::Failed);
                Err(TransportError::TransportUnavailable(format!(
                    "health probe returned {}",
                    response.status()
                )))
            }
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Failed);
                Err(TransportError::TransportUnavailable(format!("health probe failed: {e}")))
            }
            Err(_) => {
                self.set_state(ConnectionState::Failed);
                Err(TransportError::TransportUnavailable("health probe timed out".into()))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn send(
        &self,
        message: Message,
        context: &SelectionContext,
    ) -> Result<serde_json::Value, TransportError> {
        self.circuit.admit()?;

        if *self.state.lock().unwrap() != ConnectionState::Connected {
            self.circuit.record_failure();
            return Err(TransportError::NotConnected);
        }

        let start = Instant::now();
        let timeout = context
            .max_latency_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        let streaming = matches!(&message.payload, MessagePayload::ChatEnhanced(c) if c.stream);
        let Some((path, method)) = self.endpoint_for(message.message_type(), streaming) else {
            self.circuit.record_failure();
            return Err(TransportError::NoSuitableTransport);
        };

        let url = match self.url(path) {
            Ok(u) => u,
            Err(e) => {
                self.circuit.record_failure();
                return Err(e);
            }
        };

        let result = if streaming {
            self.send_streaming(url, serde_json::to_value(&message)?, message.id.clone(), deadline)
                .await
        } else {
            self.send_request(url, method, &message, deadline)
                .await
                .and_then(unwrap_envelope)
        };

        let elapsed = start.elapsed();
        match &result {
            Ok(_) => {
                self.circuit.record_success();
                let (snapshot, changed) = self.health.record(true, elapsed, self.circuit.state());
                if changed {
                    self.inbound.health_changed(TransportKind::Http, snapshot);
                }
            }
            Err(e) if e.is_retryable() => {
                self.circuit.record_failure();
                let (snapshot, changed) = self.health.record(false, elapsed, self.circuit.state());
                if changed {
                    self.inbound.health_changed(TransportKind::Http, snapshot);
                }
            }
            Err(_) => {}
        }
        result
    }

    fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn health(&self) -> HealthSnapshot {
        self.health.snapshot(self.circuit.state())
    }
}

impl HttpTransport {
    async fn send_request(
        &self,
        url: String,
        method: reqwest::Method,
        message: &Message,
        deadline: Instant,
    ) -> Result<serde_json::Value, TransportError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout(0));
        }

        let mut request = self.client.request(method.clone(), &url);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        if method == reqwest::Method::POST {
            request = request
                .header("Content-Type", "application/json")
                .json(&message.payload);
        }

        let response = tokio::time::timeout(remaining, request.send())
            .await
            .map_err(|_| TransportError::Timeout(remaining.as_millis() as u64))??;

        let status = response.status();
        if status.is_client_error() {
            // §4.2: a 4xx is the request being rejected, not a transport
            // failure — surfaced directly as an error, no circuit/health
            // accounting and no failover to another transport.
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::ClientError(format!("{status}: {text}")));
        }
        if !status.is_success() {
            return Err(TransportError::ServiceUnavailable(format!("HTTP {status}")));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| TransportError::ProtocolError(format!("invalid JSON response: {e}")))
    }
}
