//! `BaseTransport` cross-cutting behavior shared by every transport (§4.1):
//! circuit breaker, health-record maintenance, and a uniform event surface.

pub mod filesystem;
pub mod http;
pub mod websocket;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::TransportError;
use crate::message::{
    CapabilityDescriptor, CircuitState, ConnectionState, HealthSnapshot, Message, MessageType,
    SelectionContext, TransportKind,
};

/// Rolling window length used for the error-rate computation (§4.1).
const ERROR_RATE_WINDOW: usize = 50;
/// Consecutive failures before the breaker trips (§4.1, §8 boundary behavior).
const CIRCUIT_TRIP_THRESHOLD: u32 = 5;
/// Cool-down before a half-open trial is permitted (§4.1).
const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(30);
const LATENCY_EMA_ALPHA: f64 = 0.3;

/// The narrow surface a transport needs to deliver inbound messages to the
/// manager, instead of holding a reference to the manager itself (§9 "Cyclic
/// references between manager and transports").
pub trait InboundSink: Send + Sync {
    fn dispatch(&self, kind: TransportKind, message: Message);

    /// Called when a transport's health crosses an error-rate band, its
    /// latency average doubles, or its circuit state changes (§4.1, §9).
    /// Default no-op so mocks that only care about `dispatch` don't need
    /// to implement it.
    fn health_changed(&self, kind: TransportKind, health: HealthSnapshot) {
        let _ = (kind, health);
    }
}

/// Every transport implementation's public contract (§4.1).
#[async_trait]
pub trait BaseTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Idempotent. Resolves once state becomes `connected`.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Idempotent. Cancels outstanding operations and releases resources.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Fails with `CircuitOpen`/`NotConnected`/`Timeout` per §4.1; otherwise
    /// returns the correlated response payload.
    async fn send(
        &self,
        message: Message,
        context: &SelectionContext,
    ) -> Result<serde_json::Value, TransportError>;

    fn capabilities(&self) -> &CapabilityDescriptor;

    fn connection_state(&self) -> ConnectionState;

    fn health(&self) -> HealthSnapshot;
}

/// Per-transport circuit breaker state machine (§4.1).
pub struct CircuitBreaker {
    inner: Mutex<CircuitInner>,
}

struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    window_start: Instant,
    opened_at: Option<Instant>,
    half_open_trial_in_flight: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window_start: Instant::now(),
                opened_at: None,
                half_open_trial_in_flight: false,
            }),
        }
    }
}

impl CircuitBreaker {
    /// Whether a `send` attempt may proceed right now. If the breaker is
    /// `half_open` and the cooldown has elapsed, this call itself performs
    /// the `open -> half_open` transition and reserves the single trial slot.
    pub fn admit(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if inner.half_open_trial_in_flight {
                    Err(TransportError::CircuitOpen)
                } else {
                    inner.half_open_trial_in_flight = true;
                    Ok(())
                }
            }
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= CIRCUIT_COOLDOWN {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_trial_in_flight = true;
                    Ok(())
                } else {
                    Err(TransportError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        inner.half_open_trial_in_flight = false;
        inner.state = CircuitState::Closed;
        inner.window_start = Instant::now();
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_trial_in_flight = false;
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            return;
        }

        if inner.window_start.elapsed() > Duration::from_secs(60) {
            inner.consecutive_failures = 0;
            inner.window_start = Instant::now();
        }
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= CIRCUIT_TRIP_THRESHOLD {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }
}

/// The three error-rate bands §4.1 defines crossings over: `<5%`, `<20%`,
/// `>=20%`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorBand {
    Good,
    Warn,
    Bad,
}

fn error_band(error_rate: f64) -> ErrorBand {
    if error_rate < 0.05 {
        ErrorBand::Good
    } else if error_rate < 0.20 {
        ErrorBand::Warn
    } else {
        ErrorBand::Bad
    }
}

/// Tracks the rolling health record for a single transport (§3, §4.1).
pub struct HealthTracker {
    inner: Mutex<HealthInner>,
}

struct HealthInner {
    latency_ms: f64,
    samples: std::collections::VecDeque<bool>,
    success_count: u64,
    failure_count: u64,
    last_success_at: Option<u64>,
    last_failure_at: Option<u64>,
    consecutive_failures: u32,
    last_error_band: Option<ErrorBand>,
    last_circuit_state: Option<CircuitState>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HealthInner {
                latency_ms: 0.0,
                samples: std::collections::VecDeque::with_capacity(ERROR_RATE_WINDOW),
                success_count: 0,
                failure_count: 0,
                last_success_at: None,
                last_failure_at: None,
                consecutive_failures: 0,
                last_error_band: None,
                last_circuit_state: None,
            }),
        }
    }
}

impl HealthTracker {
    /// Updates the rolling record for one completed send and reports whether
    /// a `health_changed` event should fire (§4.1: error-rate band crossing,
    /// latency average doubling, or a circuit-state change).
    pub fn record(&self, success: bool, latency: Duration, circuit_state: CircuitState) -> (HealthSnapshot, bool) {
        let mut inner = self.inner.lock().unwrap();
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let previous_latency_ms = inner.latency_ms;
        let has_prior_sample = inner.success_count + inner.failure_count > 0;
        inner.latency_ms = if !has_prior_sample {
            latency_ms
        } else {
            LATENCY_EMA_ALPHA * latency_ms + (1.0 - LATENCY_EMA_ALPHA) * inner.latency_ms
        };

        if inner.samples.len() == ERROR_RATE_WINDOW {
            inner.samples.pop_front();
        }
        inner.samples.push_back(success);

        let now = crate::message::now_millis();
        if success {
            inner.success_count += 1;
            inner.last_success_at = Some(now);
            inner.consecutive_failures = 0;
        } else {
            inner.failure_count += 1;
            inner.last_failure_at = Some(now);
            inner.consecutive_failures += 1;
        }

        let snapshot = self.snapshot_locked(&inner, circuit_state);

        let band = error_band(snapshot.error_rate);
        let band_crossed = inner.last_error_band.is_some_and(|b| b != band);
        let latency_doubled = has_prior_sample && previous_latency_ms > 0.0 && inner.latency_ms >= previous_latency_ms * 2.0;
        let circuit_changed = inner.last_circuit_state.is_some_and(|s| s != circuit_state);

        inner.last_error_band = Some(band);
        inner.last_circuit_state = Some(circuit_state);

        (snapshot, band_crossed || latency_doubled || circuit_changed)
    }

    pub fn snapshot(&self, circuit_state: CircuitState) -> HealthSnapshot {
        let inner = self.inner.lock().unwrap();
        self.snapshot_locked(&inner, circuit_state)
    }

    fn snapshot_locked(&self, inner: &HealthInner, circuit_state: CircuitState) -> HealthSnapshot {
        let failures_in_window = inner.samples.iter().filter(|s| !**s).count();
        let error_rate = if inner.samples.is_empty() {
            0.0
        } else {
            failures_in_window as f64 / inner.samples.len() as f64
        };

        HealthSnapshot {
            latency_ms: inner.latency_ms,
            error_rate,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            last_success_at: inner.last_success_at,
            last_failure_at: inner.last_failure_at,
            consecutive_failures: inner.consecutive_failures,
            circuit_state,
        }
    }
}

/// Pure classification of whether a `message_type` still matters given a
/// transport's declared capabilities — used by the manager's selection
/// filter (§4.5 step 1) and reused by transports to reject unsupported sends.
pub fn supports(capabilities: &CapabilityDescriptor, message_type: MessageType) -> bool {
    capabilities.supports(message_type)
}

/// Unwraps a resolved pending-request value into the domain payload a caller
/// actually asked for (§3 "Response": `{ id, correlationId, success, payload,
/// error, timestamp }`). WebSocket and FileSystem correlate on the full wire
/// envelope, so the envelope must be peeled back here rather than handed to
/// the caller as-is — otherwise e.g. a `SelectionResponse` deserialization
/// would be attempted against `{success, payload, ...}` instead of the
/// `payload` it actually wraps. A `success: false` envelope is surfaced as a
/// transport failure, matching the HTTP transport's 4xx handling. Values with
/// no `success` field (not a `Response` envelope) pass through unchanged.
pub fn unwrap_envelope(value: serde_json::Value) -> Result<serde_json::Value, TransportError> {
    match value.get("success").and_then(|v| v.as_bool()) {
        Some(true) => Ok(value.get("payload").cloned().unwrap_or(serde_json::Value::Null)),
        Some(false) => {
            let error = value
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("remote reported failure")
                .to_string();
            Err(TransportError::ServiceUnavailable(error))
        }
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_opens_on_fifth_consecutive_failure() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            assert!(breaker.admit().is_ok());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.admit().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn circuit_half_open_single_trial() {
        let breaker = CircuitBreaker::default();
        for _ in 0..5 {
            let _ = breaker.admit();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        // Can't advance wall-clock in a unit test; verify fail-fast behavior
        // while still within the cooldown instead.
        assert!(matches!(breaker.admit(), Err(TransportError::CircuitOpen)));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            let _ = breaker.admit();
            breaker.record_failure();
        }
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        for _ in 0..4 {
            let _ = breaker.admit();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn health_tracker_computes_error_rate_over_window() {
        let tracker = HealthTracker::default();
        for _ in 0..3 {
            tracker.record(true, Duration::from_millis(10), CircuitState::Closed);
        }
        let (snapshot, _) = tracker.record(false, Duration::from_millis(10), CircuitState::Closed);
        assert!((snapshot.error_rate - 0.25).abs() < 1e-9);
        assert_eq!(snapshot.consecutive_failures, 1);
    }

    #[test]
    fn health_changed_fires_on_error_band_crossing() {
        let tracker = HealthTracker::default();
        let (_, changed) = tracker.record(true, Duration::from_millis(10), CircuitState::Closed);
        assert!(!changed, "first sample establishes the baseline band, no prior band to cross");
        for _ in 0..10 {
            let (_, changed) = tracker.record(false, Duration::from_millis(10), CircuitState::Closed);
            if changed {
                return;
            }
        }
        panic!("expected a band crossing once the error rate climbs past 20%");
    }

    #[test]
    fn health_changed_fires_on_circuit_state_change() {
        let tracker = HealthTracker::default();
        tracker.record(true, Duration::from_millis(10), CircuitState::Closed);
        let (_, changed) = tracker.record(false, Duration::from_millis(10), CircuitState::Open);
        assert!(changed);
    }

    #[test]
    fn health_changed_fires_on_latency_doubling() {
        let tracker = HealthTracker::default();
        tracker.record(true, Duration::from_millis(10), CircuitState::Closed);
        let (_, changed) = tracker.record(true, Duration::from_millis(1000), CircuitState::Closed);
        assert!(changed);
    }
}
