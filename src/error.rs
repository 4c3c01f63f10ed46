use thiserror::Error;

/// Closed error taxonomy for the transport core.
///
/// Every failure surfaced to a caller of [`crate::manager::TransportManager`] or
/// [`crate::selection::ModelSelectionService`] is one of these variants — the core
/// never lets an arbitrary error type escape its public API.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("not connected")]
    NotConnected,

    #[error("circuit open")]
    CircuitOpen,

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("no suitable transport for this message type")]
    NoSuitableTransport,

    #[error("no transport available")]
    NoTransportAvailable,

    #[error("queue full")]
    QueueFull,

    #[error("request cancelled")]
    Cancelled,

    #[error("estimated cost {estimated} exceeds budget {budget}")]
    BudgetExceeded { estimated: f64, budget: f64 },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A 4xx response from the remote peer (§4.2): the request itself was
    /// rejected, not the transport — no circuit/health accounting and no
    /// failover to another transport.
    #[error("client error: {0}")]
    ClientError(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether failing over to a *different* transport is worth attempting.
    /// `BudgetExceeded` and `Cancelled` are caller-level outcomes — no transport
    /// switch will change them. `ClientError` (HTTP 4xx) means the request
    /// itself was rejected, not the channel that carried it — another
    /// transport would get the same 4xx, so it is final, not retryable
    /// (§4.2: "no retry").
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::BudgetExceeded { .. } | Self::Cancelled | Self::ClientError(_))
    }

    /// Sanitized message safe to hand back to a caller — never leaks URLs,
    /// tokens, or raw upstream bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::TransportUnavailable(_) => "transport unavailable".to_string(),
            Self::NotConnected => "not connected".to_string(),
            Self::CircuitOpen => "transport temporarily disabled (circuit open)".to_string(),
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::ProtocolError(_) => "malformed response from transport".to_string(),
            Self::NoSuitableTransport => "no transport can carry this message".to_string(),
            Self::NoTransportAvailable => "no transport is currently connected".to_string(),
            Self::QueueFull => "outbound queue is full".to_string(),
            Self::Cancelled => "request cancelled".to_string(),
            Self::BudgetExceeded { .. } => "selection exceeded cost budget".to_string(),
            Self::ServiceUnavailable(_) => "remote service unavailable".to_string(),
            Self::ClientError(_) => "request rejected by remote service".to_string(),
            Self::Request(_) => "request to transport failed".to_string(),
            Self::Serde(_) => "failed to parse message".to_string(),
            Self::Io(_) => "filesystem transport error".to_string(),
        }
    }
}
