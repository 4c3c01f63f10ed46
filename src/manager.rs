//! Transport Manager: the single coordinator that owns every transport,
//! selects which one carries a given send, fans out inbound push messages,
//! monitors health, and performs failover under the circuit-breaker
//! discipline each transport already enforces locally (§4.5).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::config::{Config, SelectionWeights};
use crate::error::TransportError;
use crate::message::{
    ActiveTransportState, CircuitState, ConnectionState, HealthSnapshot, Message, SelectionContext,
    TransportKind,
};
use crate::transport::filesystem::FileSystemTransport;
use crate::transport::http::HttpTransport;
use crate::transport::websocket::WebSocketTransport;
use crate::transport::{BaseTransport, InboundSink};

/// Events a caller can subscribe to via [`TransportManager::subscribe`]
/// (§4.5 public contract — `on(event, listener)`, realized here as a typed
/// broadcast channel rather than a string-keyed emitter, per §9 design note).
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    TransportConnected(TransportKind),
    TransportDisconnected(TransportKind),
    TransportSwitched {
        from: Option<TransportKind>,
        to: TransportKind,
        reason: String,
    },
    TransportFailed {
        kind: TransportKind,
        error: String,
    },
    HealthUpdated(HashMap<TransportKind, HealthSnapshot>),
    /// A push message that did not correlate to a pending request, fanned
    /// out by the caller's message type (§4.5 "Inbound message fan-out").
    Message(Message),
}

/// Narrow state shared between the manager and the [`InboundSink`] its
/// transports hold, kept free of any reference back to the transports
/// themselves so no `Arc` cycle is formed (§9 "Cyclic references").
struct Shared {
    events: broadcast::Sender<ManagerEvent>,
}

struct Sink {
    shared: Arc<Shared>,
}

impl InboundSink for Sink {
    fn dispatch(&self, _kind: TransportKind, message: Message) {
        let _ = self.shared.events.send(ManagerEvent::Message(message));
    }

    fn health_changed(&self, kind: TransportKind, health: HealthSnapshot) {
        let mut snapshot = HashMap::with_capacity(1);
        snapshot.insert(kind, health);
        let _ = self.shared.events.send(ManagerEvent::HealthUpdated(snapshot));
    }
}

pub struct TransportManager {
    config: Config,
    shared: Arc<Shared>,
    http: Arc<HttpTransport>,
    websocket: Arc<WebSocketTransport>,
    filesystem: Arc<FileSystemTransport>,
    transports: HashMap<TransportKind, Arc<dyn BaseTransport>>,
    active_transport: Mutex<Option<TransportKind>>,
    monitor_started: Mutex<bool>,
    connecting: Mutex<bool>,
}

impl TransportManager {
    pub fn new(config: Config) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        let shared = Arc::new(Shared { events: tx });
        let inbound: Arc<dyn InboundSink> = Arc::new(Sink {
            shared: Arc::clone(&shared),
        });

        let http = Arc::new(HttpTransport::new(&config, Arc::clone(&inbound)));
        let websocket = Arc::new(WebSocketTransport::new(&config, Arc::clone(&inbound)));
        let filesystem = Arc::new(FileSystemTransport::new(&config, Arc::clone(&inbound)));

        let mut transports: HashMap<TransportKind, Arc<dyn BaseTransport>> = HashMap::new();
        transports.insert(TransportKind::Http, http.clone() as Arc<dyn BaseTransport>);
        transports.insert(TransportKind::WebSocket, websocket.clone() as Arc<dyn BaseTransport>);
        transports.insert(TransportKind::FileSystem, filesystem.clone() as Arc<dyn BaseTransport>);

        Self {
            config,
            shared,
            http,
            websocket,
            filesystem,
            transports,
            active_transport: Mutex::new(None),
            monitor_started: Mutex::new(false),
            connecting: Mutex::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.shared.events.send(event);
    }

    /// Connects every configured transport in parallel; resolves once at
    /// least one reaches `connected`. Partial failures are recorded, not
    /// rejected. Fails with `NoTransportAvailable` if none connect.
    pub async fn connect(&self) -> Result<(), TransportError> {
        *self.connecting.lock().unwrap() = true;
        let result = self.connect_inner().await;
        *self.connecting.lock().unwrap() = false;
        result
    }

    async fn connect_inner(&self) -> Result<(), TransportError> {
        let mut handles = Vec::new();
        for (&kind, transport) in &self.transports {
            let transport = Arc::clone(transport);
            handles.push(async move {
                let result = transport.connect().await;
                (kind, result)
            });
        }

        let results = futures_util::future::join_all(handles).await;
        let mut any_connected = false;
        for (kind, result) in results {
            match result {
                Ok(()) => {
                    any_connected = true;
                    self.emit(ManagerEvent::TransportConnected(kind));
                }
                Err(e) => {
                    tracing::warn!("transport {kind} failed to connect: {e}");
                    self.emit(ManagerEvent::TransportFailed {
                        kind,
                        error: e.user_message(),
                    });
                }
            }
        }

        if self.filesystem.connection_state() == ConnectionState::Connected {
            crate::transport::filesystem::start_polling(&self.filesystem);
        }
        if self.http.connection_state() == ConnectionState::Connected {
            self.http.spawn_event_subscription();
        }

        if !any_connected {
            return Err(TransportError::NoTransportAvailable);
        }

        self.spawn_health_monitor();
        Ok(())
    }

    fn spawn_health_monitor(&self) {
        let mut started = self.monitor_started.lock().unwrap();
        if *started {
            return;
        }
        *started = true;

        let shared = Arc::clone(&self.shared);
        let transports = self.transports.clone();
        let interval = self.config.monitoring_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let mut snapshot = HashMap::new();
                for (&kind, transport) in &transports {
                    snapshot.insert(kind, transport.health());
                }
                let _ = shared.events.send(ManagerEvent::HealthUpdated(snapshot));
            }
        });
    }

    /// Returns the set of transports currently `connected`.
    pub fn available_transports(&self) -> Vec<TransportKind> {
        self.transports
            .iter()
            .filter(|(_, t)| t.connection_state() == ConnectionState::Connected)
            .map(|(&k, _)| k)
            .collect()
    }

    pub fn transport_health(&self) -> HashMap<TransportKind, HealthSnapshot> {
        self.transports.iter().map(|(&k, t)| (k, t.health())).collect()
    }

    /// The overall connection status (§4.6 `getConnectionStatus`): connected
    /// if any transport is connected, otherwise the "worst" observed state.
    pub fn connection_status(&self) -> ConnectionState {
        let states: Vec<ConnectionState> = self.transports.values().map(|t| t.connection_state()).collect();
        if states.iter().any(|s| *s == ConnectionState::Connected) {
            ConnectionState::Connected
        } else if states.iter().any(|s| *s == ConnectionState::Reconnecting) {
            ConnectionState::Reconnecting
        } else if states.iter().any(|s| *s == ConnectionState::Connecting) {
            ConnectionState::Connecting
        } else if states.iter().all(|s| *s == ConnectionState::Failed) {
            ConnectionState::Failed
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn active_transport(&self) -> Option<TransportKind> {
        *self.active_transport.lock().unwrap()
    }

    /// The manager-level active-transport state machine (§4.5): `initializing`
    /// while a `connect()` is in flight, `active(T)` once `T` has carried
    /// traffic and its circuit is closed, `degraded` if `T`'s circuit has
    /// since opened but other connected transports remain, and `offline`
    /// before the first successful connect.
    pub fn active_transport_state(&self) -> ActiveTransportState {
        if *self.connecting.lock().unwrap() {
            return ActiveTransportState::Initializing;
        }

        let Some(current) = self.active_transport() else {
            return ActiveTransportState::Offline;
        };

        let health = self.transport_health();
        let current_open = health.get(&current).map(|h| h.circuit_state == CircuitState::Open).unwrap_or(false);

        if !current_open {
            return ActiveTransportState::Active(current);
        }

        let alternatives = self
            .available_transports()
            .into_iter()
            .filter(|&k| k != current)
            .collect();
        ActiveTransportState::Degraded {
            transport: current,
            alternatives,
        }
    }

    /// Scores candidates and returns them best-first (§4.5 selection
    /// algorithm, steps 1–4).
    fn rank_candidates(&self, context: &SelectionContext, exclude: &[TransportKind]) -> Vec<TransportKind> {
        let weights = normalize_weights(&self.config.selection_weights);

        let base_candidates: Vec<TransportKind> = self
            .transports
            .iter()
            .filter(|(&kind, _)| !exclude.contains(&kind))
            .filter(|(_, t)| t.connection_state() == ConnectionState::Connected)
            .filter(|(_, t)| t.health().circuit_state != CircuitState::Open)
            .filter(|(_, t)| t.capabilities().supports(context.message_type))
            .map(|(&kind, _)| kind)
            .collect();

        // `requiresRealtime` is a preference, not a hard filter (§8 scenario
        // 1: a chat request with only a non-realtime transport reachable
        // must still resolve rather than fail with `NoSuitableTransport`).
        // Narrow to realtime-capable candidates only when at least one
        // exists; otherwise fall back to ranking the full candidate set.
        let realtime_candidates: Vec<TransportKind> = base_candidates
            .iter()
            .copied()
            .filter(|kind| self.transports[kind].capabilities().realtime_capable)
            .collect();

        let pool = if context.requires_realtime && !realtime_candidates.is_empty() {
            realtime_candidates
        } else {
            base_candidates
        };

        let mut scored: Vec<(TransportKind, f64)> = pool
            .into_iter()
            .map(|kind| (kind, score(self.transports[&kind].as_ref(), &weights)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| fallback_rank(&self.config.fallback_chain, a.0).cmp(&fallback_rank(&self.config.fallback_chain, b.0)))
        });
        scored.into_iter().map(|(k, _)| k).collect()
    }

    /// Picks the active transport, dispatches, and on failure consults the
    /// fallback chain — bounded by `min(retry_attempts, candidates)` (§4.5
    /// "Failover").
    pub async fn send(&self, message: Message, context: SelectionContext) -> Result<serde_json::Value, TransportError> {
        let mut tried = Vec::new();
        let mut last_error = TransportError::NoSuitableTransport;
        // `autoFailover = false` means the first failure is final — no walk
        // down the fallback chain (§6 "autoFailover (default true)").
        let max_attempts = if self.config.auto_failover {
            self.config.retry_attempts.max(1)
        } else {
            1
        };

        loop {
            let candidates = self.rank_candidates(&context, &tried);
            let Some(kind) = candidates.into_iter().next() else {
                if tried.is_empty() {
                    return Err(TransportError::NoSuitableTransport);
                }
                return Err(last_error);
            };

            let transport = self.transports.get(&kind).expect("ranked transport must exist").clone();
            let previous = self.active_transport();

            match transport.send(message.clone(), &context).await {
                Ok(value) => {
                    *self.active_transport.lock().unwrap() = Some(kind);
                    if previous != Some(kind) {
                        self.emit(ManagerEvent::TransportSwitched {
                            from: previous,
                            to: kind,
                            reason: "selection".to_string(),
                        });
                    }
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!("send via {kind} failed: {e}");
                    self.emit(ManagerEvent::TransportFailed {
                        kind,
                        error: e.user_message(),
                    });
                    // Non-retryable errors (e.g. an HTTP 4xx — §4.2 "no
                    // retry") are final: the request itself was rejected, so
                    // another transport would fare no better.
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    tried.push(kind);
                    last_error = e;
                    if tried.len() >= max_attempts {
                        return Err(last_error);
                    }
                }
            }
        }
    }

    /// Disconnects every transport; cancels in-flight operations.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        for (&kind, transport) in &self.transports {
            if let Err(e) = transport.disconnect().await {
                tracing::warn!("transport {kind} failed to disconnect cleanly: {e}");
            }
            self.emit(ManagerEvent::TransportDisconnected(kind));
        }
        *self.active_transport.lock().unwrap() = None;
        Ok(())
    }
}

fn fallback_rank(chain: &[TransportKind], kind: TransportKind) -> usize {
    chain.iter().position(|&k| k == kind).unwrap_or(chain.len())
}

struct NormalizedWeights {
    latency: f64,
    reliability: f64,
    capability: f64,
    cost: f64,
}

/// Normalizes nonnegative relative weights to sum to 1.0; falls back to
/// equal weighting if the input sums to zero (§9 open question, resolved in
/// SPEC_FULL §11).
fn normalize_weights(weights: &SelectionWeights) -> NormalizedWeights {
    let sum = weights.latency + weights.reliability + weights.capability + weights.cost;
    if sum <= 0.0 {
        return NormalizedWeights {
            latency: 0.25,
            reliability: 0.25,
            capability: 0.25,
            cost: 0.25,
        };
    }
    NormalizedWeights {
        latency: weights.latency / sum,
        reliability: weights.reliability / sum,
        capability: weights.capability / sum,
        cost: weights.cost / sum,
    }
}

/// Weighted score for a single candidate (§4.5 step 3). Each factor is
/// normalized to `[0, 1]`, higher is better. Cost has no direct per-transport
/// signal in this core (it belongs to the model, not the channel), so the
/// capability descriptor's offline/realtime richness stands in as a proxy —
/// a transport capable of more is assumed cheaper to keep warm.
fn score(transport: &dyn BaseTransport, weights: &NormalizedWeights) -> f64 {
    let health = transport.health();
    let latency_score = 1.0 / (1.0 + health.latency_ms.max(0.0) / 100.0);
    let reliability_score = 1.0 - health.error_rate.clamp(0.0, 1.0);
    let capability_score = capability_fit(transport.capabilities());
    let cost_score = if transport.capabilities().offline_capable { 1.0 } else { 0.5 };

    weights.latency * latency_score
        + weights.reliability * reliability_score
        + weights.capability * capability_score
        + weights.cost * cost_score
}

/// Fraction of "nice-to-have" traits a transport satisfies: bidirectional,
/// streaming, realtime-capable, offline-capable.
fn capability_fit(capabilities: &crate::message::CapabilityDescriptor) -> f64 {
    let traits = [
        capabilities.bidirectional,
        capabilities.streaming,
        capabilities.realtime_capable,
        capabilities.offline_capable,
    ];
    traits.iter().filter(|t| **t).count() as f64 / traits.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_weights_falls_back_to_equal_on_all_zero() {
        let weights = SelectionWeights {
            latency: 0.0,
            reliability: 0.0,
            capability: 0.0,
            cost: 0.0,
        };
        let normalized = normalize_weights(&weights);
        assert_eq!(normalized.latency, 0.25);
        assert_eq!(normalized.reliability, 0.25);
        assert_eq!(normalized.capability, 0.25);
        assert_eq!(normalized.cost, 0.25);
    }

    #[test]
    fn normalize_weights_sums_to_one() {
        let weights = SelectionWeights {
            latency: 1.0,
            reliability: 1.0,
            capability: 1.0,
            cost: 1.0,
        };
        let normalized = normalize_weights(&weights);
        let total = normalized.latency + normalized.reliability + normalized.capability + normalized.cost;
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fallback_rank_orders_by_configured_chain() {
        let chain = vec![TransportKind::WebSocket, TransportKind::Http, TransportKind::FileSystem];
        assert!(fallback_rank(&chain, TransportKind::WebSocket) < fallback_rank(&chain, TransportKind::Http));
        assert!(fallback_rank(&chain, TransportKind::Http) < fallback_rank(&chain, TransportKind::FileSystem));
    }

    #[test]
    fn active_transport_state_starts_offline() {
        let manager = TransportManager::new(Config::default());
        assert_eq!(manager.active_transport_state(), ActiveTransportState::Offline);
    }
}
