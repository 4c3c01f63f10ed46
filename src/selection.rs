//! Model Selection Service: the highest-value client of the transport core
//! (§4.6). Translates task-typed requests into messages, derives a selection
//! context, applies user preferences, caches health, and guarantees a sane
//! response even when every transport is down via a static fallback table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::Config;
use crate::error::TransportError;
use crate::manager::{ManagerEvent, TransportManager};
use crate::message::{
    HealthSnapshot, HealthUpdate, Message, MessagePayload, MessageType, PerformanceMetrics,
    Priority, QualityRequirement, SelectionContext, TaskType, TransportKind,
};

// Field names are snake_case per spec §3 ("task_type", "quality_requirement", ...) —
// unlike the transport envelope (Message/Response), this payload mirrors the
// remote model-selection API's own naming convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSelectionRequest {
    pub task_type: TaskType,
    pub quality_requirement: QualityRequirement,
    pub max_cost: Option<f64>,
    pub context_length: Option<u32>,
    pub preferred_providers: Option<Vec<String>>,
    pub timeout_ms: Option<u64>,
    pub user_preferences: Option<UserPreferences>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub cost_per_token: f64,
    pub max_tokens: u32,
    pub response_time_avg_ms: f64,
    pub availability_score: f64,
    pub quality_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionMetadata {
    pub selection_time_ms: u64,
    pub factors_considered: Vec<String>,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResponse {
    pub selected_model: ModelInfo,
    pub reasoning: String,
    pub fallback_models: Vec<ModelInfo>,
    pub estimated_cost: f64,
    pub estimated_time_ms: f64,
    pub selection_metadata: SelectionMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferencePriority {
    Performance,
    Cost,
    Balanced,
}

/// Process-wide, mutable by the caller (§3 "User preferences").
/// Invariant: `quality_threshold ∈ [0,1]`, `max_cost_per_request ≥ 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    pub priority: PreferencePriority,
    pub max_cost_per_request: f64,
    pub preferred_providers: Vec<String>,
    pub fallback_enabled: bool,
    pub quality_threshold: f64,
    pub timeout_preference_ms: u64,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            priority: PreferencePriority::Balanced,
            max_cost_per_request: 1.0,
            preferred_providers: Vec::new(),
            fallback_enabled: true,
            quality_threshold: 0.5,
            timeout_preference_ms: 30_000,
        }
    }
}

/// Partial update merged into the process-wide preferences record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPreferencesPatch {
    pub priority: Option<PreferencePriority>,
    pub max_cost_per_request: Option<f64>,
    pub preferred_providers: Option<Vec<String>>,
    pub fallback_enabled: Option<bool>,
    pub quality_threshold: Option<f64>,
    pub timeout_preference_ms: Option<u64>,
}

fn fallback_table() -> HashMap<TaskType, ModelInfo> {
    let gpt4_class = ModelInfo {
        id: "gpt-4-class-fallback".to_string(),
        name: "GPT-4 class (fallback)".to_string(),
        provider: "unknown".to_string(),
        capabilities: vec!["reasoning".to_string(), "code".to_string()],
        cost_per_token: 0.00003,
        max_tokens: 8192,
        response_time_avg_ms: 2000.0,
        availability_score: 0.5,
        quality_score: 0.9,
    };
    let gpt35_class = ModelInfo {
        id: "gpt-3.5-turbo-class-fallback".to_string(),
        name: "GPT-3.5-turbo class (fallback)".to_string(),
        provider: "unknown".to_string(),
        capabilities: vec!["general".to_string()],
        cost_per_token: 0.000002,
        max_tokens: 4096,
        response_time_avg_ms: 800.0,
        availability_score: 0.5,
        quality_score: 0.6,
    };

    let mut table = HashMap::new();
    table.insert(TaskType::CodeGeneration, gpt4_class.clone());
    table.insert(TaskType::Analysis, gpt4_class);
    for t in [
        TaskType::TextGeneration,
        TaskType::Chat,
        TaskType::Summarization,
        TaskType::Translation,
        TaskType::Embedding,
        TaskType::Editing,
        TaskType::Planning,
        TaskType::WorkflowExecution,
    ] {
        table.insert(t, gpt35_class.clone());
    }
    table
}

struct CachedHealth {
    updates: Vec<HealthUpdate>,
    updated_at: Instant,
}

/// Sends `health_check_request` via `manager` and refreshes `shared`'s cache
/// on success; returns the (possibly stale) cached values on failure. Shared
/// between the caller-driven `refresh_model_health()` and the periodic
/// refresh loop so both observe the same cache-update semantics.
async fn fetch_health(manager: &TransportManager, shared: &Shared) -> Vec<HealthUpdate> {
    let message = Message::new_request(MessagePayload::HealthCheckRequest(
        crate::message::HealthCheckRequest::default(),
    ));
    let context = SelectionContext {
        message_type: MessageType::HealthCheckRequest,
        priority: Priority::Low,
        requires_realtime: false,
        max_latency_ms: None,
    };

    match manager.send(message, context).await {
        Ok(value) => {
            let updates: Vec<HealthUpdate> = serde_json::from_value(value).unwrap_or_default();
            *shared.cached_health.lock().unwrap() = Some(CachedHealth {
                updates: updates.clone(),
                updated_at: Instant::now(),
            });
            updates
        }
        Err(e) => {
            tracing::debug!("health refresh failed, returning cached values: {e}");
            shared
                .cached_health
                .lock()
                .unwrap()
                .as_ref()
                .map(|c| c.updates.clone())
                .unwrap_or_default()
        }
    }
}

/// Domain-facing events (§4.6 "Events"), realized as a typed broadcast
/// channel rather than the source's string-keyed emitter (§9 design note) —
/// the same pattern [`crate::manager::ManagerEvent`] uses one layer down.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Connected,
    Disconnected,
    TransportChanged {
        from: Option<TransportKind>,
        to: TransportKind,
    },
    ConnectionError(String),
    TransportHealth(HashMap<TransportKind, HealthSnapshot>),
    ModelSelected(SelectionResponse),
    HealthUpdated(Vec<HealthUpdate>),
    PerformanceMetrics(PerformanceMetrics),
    PreferencesUpdated(UserPreferences),
}

/// State a detached push-listener task needs, held separately from
/// [`ModelSelectionService`] itself so the task can outlive any particular
/// `&self` borrow without requiring `Arc<ModelSelectionService>` (§9 "Cyclic
/// references" applies here too — the listener only needs this narrow slice).
struct Shared {
    cached_health: Mutex<Option<CachedHealth>>,
    events: broadcast::Sender<ServiceEvent>,
}

/// Domain facade over [`TransportManager`] (§4.6). Owns process-wide user
/// preferences and a cached health snapshot; never mutated from outside this
/// module.
pub struct ModelSelectionService {
    manager: Arc<TransportManager>,
    preferences: Mutex<UserPreferences>,
    shared: Arc<Shared>,
    cache_duration: Duration,
    health_refresh_interval: Duration,
    fallback_models: HashMap<TaskType, ModelInfo>,
    push_listener_started: Mutex<bool>,
    health_refresh_started: Mutex<bool>,
}

impl ModelSelectionService {
    pub fn new(config: Config) -> Self {
        let cache_duration = config.cache_duration;
        let health_refresh_interval = config.monitoring_interval;
        let (tx, _rx) = broadcast::channel(256);
        Self {
            manager: Arc::new(TransportManager::new(config)),
            preferences: Mutex::new(UserPreferences::default()),
            shared: Arc::new(Shared {
                cached_health: Mutex::new(None),
                events: tx,
            }),
            cache_duration,
            health_refresh_interval,
            fallback_models: fallback_table(),
            push_listener_started: Mutex::new(false),
            health_refresh_started: Mutex::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.shared.events.send(event);
    }

    /// Connects the manager, starts the push-event listener, performs an
    /// initial health refresh, and starts the periodic health-refresh loop
    /// (§4.6, default every 30 s).
    pub async fn initialize(&self) -> Result<(), TransportError> {
        self.spawn_push_listener();
        match self.manager.connect().await {
            Ok(()) => self.emit(ServiceEvent::Connected),
            Err(e) => {
                self.emit(ServiceEvent::ConnectionError(e.user_message()));
                return Err(e);
            }
        }
        let _ = self.refresh_model_health().await;
        self.spawn_health_refresh_loop();
        Ok(())
    }

    /// Periodically re-sends `health_check_request` and refreshes the cache,
    /// independent of any caller-driven `refreshModelHealth()` call (§4.6).
    /// Safe to call more than once — only one loop task runs at a time.
    fn spawn_health_refresh_loop(&self) {
        let mut started = self.health_refresh_started.lock().unwrap();
        if *started {
            return;
        }
        *started = true;

        let manager = Arc::clone(&self.manager);
        let shared = Arc::clone(&self.shared);
        let interval = self.health_refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it, `initialize` already refreshed once
            loop {
                ticker.tick().await;
                let updates = fetch_health(&manager, &shared).await;
                let _ = shared.events.send(ServiceEvent::HealthUpdated(updates));
            }
        });
    }

    /// Forwards [`ManagerEvent`]s into the service's own typed event surface
    /// and keeps the cached health list current from push updates (§2 "Data
    /// flow (push)": "the service consumes health/metric updates to refresh
    /// caches and emit domain events"). Safe to call more than once — only
    /// one listener task runs at a time.
    fn spawn_push_listener(&self) {
        let mut started = self.push_listener_started.lock().unwrap();
        if *started {
            return;
        }
        *started = true;

        let mut rx = self.manager.subscribe();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ManagerEvent::TransportSwitched { from, to, .. }) => {
                        let _ = shared.events.send(ServiceEvent::TransportChanged { from, to });
                    }
                    Ok(ManagerEvent::TransportFailed { kind, error }) => {
                        let _ = shared
                            .events
                            .send(ServiceEvent::ConnectionError(format!("{kind}: {error}")));
                    }
                    Ok(ManagerEvent::HealthUpdated(snapshot)) => {
                        let _ = shared.events.send(ServiceEvent::TransportHealth(snapshot));
                    }
                    Ok(ManagerEvent::Message(message)) => match message.payload {
                        MessagePayload::HealthUpdate(update) => {
                            let updates = {
                                let mut cache = shared.cached_health.lock().unwrap();
                                let mut updates = cache
                                    .as_ref()
                                    .map(|c| c.updates.clone())
                                    .unwrap_or_default();
                                updates.retain(|u| u.transport != update.transport);
                                updates.push(update);
                                *cache = Some(CachedHealth {
                                    updates: updates.clone(),
                                    updated_at: Instant::now(),
                                });
                                updates
                            };
                            let _ = shared.events.send(ServiceEvent::HealthUpdated(updates));
                        }
                        MessagePayload::PerformanceMetrics(metrics) => {
                            let _ = shared.events.send(ServiceEvent::PerformanceMetrics(metrics));
                        }
                        _ => {}
                    },
                    Ok(ManagerEvent::TransportConnected(_) | ManagerEvent::TransportDisconnected(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    fn derive_context(&self, request: &ModelSelectionRequest, preferences: &UserPreferences) -> SelectionContext {
        let priority = if request.quality_requirement == QualityRequirement::High && request.max_cost.is_none() {
            Priority::Critical
        } else if request.quality_requirement == QualityRequirement::Low {
            Priority::High
        } else {
            Priority::Normal
        };

        SelectionContext {
            message_type: MessageType::ModelSelectionRequest,
            priority,
            requires_realtime: request.task_type == TaskType::Chat,
            max_latency_ms: request.timeout_ms.or(Some(preferences.timeout_preference_ms)),
        }
    }

    /// Builds a message, derives the selection context, and sends via the
    /// manager. Falls back to the static table on any manager failure when
    /// `fallback_enabled` (§4.6, §7 "the only place the core intentionally
    /// masks errors").
    pub async fn select_model(&self, request: ModelSelectionRequest) -> Result<SelectionResponse, TransportError> {
        let preferences = self.preferences.lock().unwrap().clone();
        let context = self.derive_context(&request, &preferences);
        let fallback_enabled = request
            .user_preferences
            .as_ref()
            .map(|p| p.fallback_enabled)
            .unwrap_or(preferences.fallback_enabled);

        let start = Instant::now();
        let message = Message::new_request(MessagePayload::ModelSelectionRequest(request.clone()));

        let outcome = match self.manager.send(message, context).await {
            Ok(value) => match serde_json::from_value::<SelectionResponse>(value) {
                Ok(response) => {
                    if let Some(budget) = request.max_cost {
                        if response.estimated_cost > budget {
                            return Err(TransportError::BudgetExceeded {
                                estimated: response.estimated_cost,
                                budget,
                            });
                        }
                    }
                    Ok(response)
                }
                Err(e) => {
                    tracing::warn!("selection response failed to parse: {e}");
                    if fallback_enabled {
                        Ok(self.static_fallback(&request, start.elapsed()))
                    } else {
                        Err(TransportError::ProtocolError(e.to_string()))
                    }
                }
            },
            Err(e) => {
                tracing::warn!("model selection send failed: {e}");
                if fallback_enabled {
                    Ok(self.static_fallback(&request, start.elapsed()))
                } else {
                    Err(e)
                }
            }
        };
        if let Ok(ref response) = outcome {
            self.emit(ServiceEvent::ModelSelected(response.clone()));
        }
        outcome
    }

    fn static_fallback(&self, request: &ModelSelectionRequest, elapsed: Duration) -> SelectionResponse {
        let model = self
            .fallback_models
            .get(&request.task_type)
            .cloned()
            .unwrap_or_else(|| self.fallback_models[&TaskType::Chat].clone());

        SelectionResponse {
            estimated_cost: model.cost_per_token * 1000.0,
            estimated_time_ms: model.response_time_avg_ms,
            selected_model: model,
            reasoning: "no transport could deliver the selection request — returning a static fallback".to_string(),
            fallback_models: Vec::new(),
            selection_metadata: SelectionMetadata {
                selection_time_ms: elapsed.as_millis() as u64,
                factors_considered: vec!["fallback".to_string()],
                confidence_score: 0.3,
            },
        }
    }

    /// Merges a partial update into the process-wide preferences record and
    /// best-effort notifies the server (§4.6). Failure to notify is logged,
    /// not raised.
    pub async fn update_user_preferences(&self, patch: UserPreferencesPatch) {
        let updated = {
            let mut preferences = self.preferences.lock().unwrap();
            if let Some(v) = patch.priority {
                preferences.priority = v;
            }
            if let Some(v) = patch.max_cost_per_request {
                preferences.max_cost_per_request = v.max(0.0);
            }
            if let Some(v) = patch.preferred_providers {
                preferences.preferred_providers = v;
            }
            if let Some(v) = patch.fallback_enabled {
                preferences.fallback_enabled = v;
            }
            if let Some(v) = patch.quality_threshold {
                preferences.quality_threshold = v.clamp(0.0, 1.0);
            }
            if let Some(v) = patch.timeout_preference_ms {
                preferences.timeout_preference_ms = v;
            }
            preferences.clone()
        };

        self.emit(ServiceEvent::PreferencesUpdated(updated.clone()));

        let message = Message::new_request(MessagePayload::PreferencesUpdate(updated));
        let context = SelectionContext {
            message_type: MessageType::PreferencesUpdate,
            priority: Priority::Low,
            requires_realtime: false,
            max_latency_ms: None,
        };
        if let Err(e) = self.manager.send(message, context).await {
            tracing::debug!("preferences-update notification failed (best effort): {e}");
        }
    }

    pub fn get_user_preferences(&self) -> UserPreferences {
        self.preferences.lock().unwrap().clone()
    }

    /// Sends a `health_check_request` and refreshes the cache on success;
    /// returns the (possibly stale) cached values on failure.
    pub async fn refresh_model_health(&self) -> Vec<HealthUpdate> {
        let updates = fetch_health(&self.manager, &self.shared).await;
        self.emit(ServiceEvent::HealthUpdated(updates.clone()));
        updates
    }

    /// Returns the last successful snapshot, possibly stale — see
    /// `cache_duration` for staleness accounting (§4.6 caching; §8 invariant
    /// 5 — never older than the most recent successful refresh).
    pub fn get_cached_health(&self) -> Vec<HealthUpdate> {
        self.shared
            .cached_health
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.updates.clone())
            .unwrap_or_default()
    }

    pub fn is_cache_stale(&self) -> bool {
        match self.shared.cached_health.lock().unwrap().as_ref() {
            Some(c) => c.updated_at.elapsed() > self.cache_duration,
            None => true,
        }
    }

    pub fn is_healthy(&self) -> bool {
        !self.manager.available_transports().is_empty()
    }

    pub fn get_connection_status(&self) -> crate::message::ConnectionState {
        self.manager.connection_status()
    }

    pub fn get_transport_status(&self) -> HashMap<crate::message::TransportKind, crate::message::HealthSnapshot> {
        self.manager.transport_health()
    }

    /// Stops monitoring and disconnects the manager; clears the health cache
    /// (§9 design note — "on `disconnect()`, clear health caches").
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let result = self.manager.disconnect().await;
        *self.shared.cached_health.lock().unwrap() = None;
        self.emit(ServiceEvent::Disconnected);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_table_assigns_gpt4_class_to_code_generation_and_analysis() {
        let table = fallback_table();
        assert_eq!(table[&TaskType::CodeGeneration].id, "gpt-4-class-fallback");
        assert_eq!(table[&TaskType::Analysis].id, "gpt-4-class-fallback");
        assert_eq!(table[&TaskType::Chat].id, "gpt-3.5-turbo-class-fallback");
    }

    #[test]
    fn user_preferences_patch_clamps_quality_threshold() {
        let service = ModelSelectionService::new(Config::default());
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(service.update_user_preferences(UserPreferencesPatch {
            quality_threshold: Some(5.0),
            ..Default::default()
        }));
        assert_eq!(service.get_user_preferences().quality_threshold, 1.0);
    }

    #[test]
    fn derive_context_marks_chat_as_realtime() {
        let service = ModelSelectionService::new(Config::default());
        let request = ModelSelectionRequest {
            task_type: TaskType::Chat,
            quality_requirement: QualityRequirement::Medium,
            max_cost: None,
            context_length: None,
            preferred_providers: None,
            timeout_ms: None,
            user_preferences: None,
        };
        let prefs = UserPreferences::default();
        let context = service.derive_context(&request, &prefs);
        assert!(context.requires_realtime);
    }

    #[test]
    fn update_user_preferences_emits_preferences_updated() {
        let service = ModelSelectionService::new(Config::default());
        let mut events = service.subscribe();
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(service.update_user_preferences(UserPreferencesPatch {
            max_cost_per_request: Some(2.5),
            ..Default::default()
        }));
        let event = runtime.block_on(events.recv()).unwrap();
        assert!(matches!(
            event,
            ServiceEvent::PreferencesUpdated(p) if p.max_cost_per_request == 2.5
        ));
    }
}
