//! FileSystem transport: message exchange through a shared directory when no
//! network channel is available (§4.4).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, FileSystemConfig};
use crate::error::TransportError;
use crate::message::{
    CapabilityDescriptor, ConnectionState, HealthSnapshot, Message, MessageType, SelectionContext,
    TransportKind,
};
use crate::transport::{unwrap_envelope, BaseTransport, CircuitBreaker, HealthTracker, InboundSink};

type PendingMap = Arc<Mutex<std::collections::HashMap<String, oneshot::Sender<serde_json::Value>>>>;

pub struct FileSystemTransport {
    root: PathBuf,
    config: FileSystemConfig,
    default_timeout: Duration,
    state: Mutex<ConnectionState>,
    circuit: CircuitBreaker,
    health: HealthTracker,
    capabilities: CapabilityDescriptor,
    pending: PendingMap,
    inbound: Arc<dyn InboundSink>,
    write_counter: AtomicU64,
    poll_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

impl FileSystemTransport {
    pub fn new(config: &Config, inbound: Arc<dyn InboundSink>) -> Self {
        let capabilities = CapabilityDescriptor {
            bidirectional: true,
            streaming: false,
            realtime_capable: false,
            offline_capable: true,
            max_message_bytes: 8 * 1024 * 1024,
            supported_types: vec![
                MessageType::ModelSelectionRequest,
                MessageType::HealthCheckRequest,
                MessageType::PreferencesUpdate,
                MessageType::WorkflowRequest,
                MessageType::TaskPlanningRequest,
            ],
        };

        Self {
            root: config.filesystem.root.clone(),
            config: config.filesystem.clone(),
            default_timeout: config.timeout,
            state: Mutex::new(ConnectionState::Disconnected),
            circuit: CircuitBreaker::default(),
            health: HealthTracker::default(),
            capabilities,
            pending: Arc::new(Mutex::new(std::collections::HashMap::new())),
            inbound,
            write_counter: AtomicU64::new(0),
            poll_handle: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    fn outgoing_dir(&self) -> PathBuf {
        self.root.join("outgoing")
    }
    fn incoming_dir(&self) -> PathBuf {
        self.root.join("incoming")
    }
    fn processing_dir(&self) -> PathBuf {
        self.root.join("processing")
    }
    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Writes to a temp name inside `outgoing/` then atomically renames —
    /// the rename is the commit boundary (§4.4 "Protocol").
    async fn write_atomic(&self, dir: &Path, basename: &str, contents: &[u8]) -> Result<(), TransportError> {
        let n = self.write_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(".{basename}.{n}.tmp"));
        let target = dir.join(basename);
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, &target).await?;
        Ok(())
    }

    async fn queue_depth(&self) -> usize {
        let mut count = 0usize;
        if let Ok(mut entries) = fs::read_dir(self.outgoing_dir()).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !name.starts_with('.') {
                    count += 1;
                }
            }
        }
        count
    }

    fn spawn_poll_loop(self: &Arc<Self>) {
        let mut guard = self.poll_handle.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let token = {
            let mut cancel = self.cancel.lock().unwrap();
            *cancel = CancellationToken::new();
            cancel.clone()
        };
        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            this.run_poll_loop(token).await;
        }));
    }

    /// Runs until `token` is cancelled, letting an in-flight `poll_once()`
    /// finish its current file rather than aborting it mid-rename — an
    /// abrupt `JoinHandle::abort()` could strand a message in `processing/`
    /// with its lock never released.
    async fn run_poll_loop(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.watch_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }
            if *self.state.lock().unwrap() != ConnectionState::Connected {
                continue;
            }
            if let Err(e) = self.poll_once().await {
                tracing::warn!("filesystem poll iteration failed: {e}");
            }
        }
    }

    async fn poll_once(&self) -> Result<(), TransportError> {
        let mut entries = match fs::read_dir(self.incoming_dir()).await {
            Ok(e) => e,
            Err(e) => return Err(TransportError::Io(e)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(TransportError::Io)? {
            let path = entry.path();
            let Some(basename) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if basename.starts_with('.') {
                continue;
            }

            if !self.try_acquire_lock(&basename).await {
                continue;
            }

            let processing_path = self.processing_dir().join(&basename);
            if fs::rename(&path, &processing_path).await.is_err() {
                self.release_lock(&basename).await;
                continue;
            }

            let result = self.handle_message_file(&processing_path).await;
            if let Err(e) = result {
                tracing::warn!("failed to process filesystem message {basename}: {e}");
            }
            let _ = fs::remove_file(&processing_path).await;
            self.release_lock(&basename).await;
        }
        Ok(())
    }

    /// Acquires the lock by creating a zero-byte sentinel; a stale sentinel
    /// (older than `lock_timeout`) may be stolen (§4.4). The sentinel name is
    /// a content hash of the message basename rather than the basename
    /// itself, so two incoming files that only differ by characters an
    /// underlying filesystem treats as equivalent (case folding, unicode
    /// normalization) can't collide on the same lock.
    async fn try_acquire_lock(&self, basename: &str) -> bool {
        let lock_path = self.locks_dir().join(lock_name(basename));
        match fs::OpenOptions::new().write(true).create_new(true).open(&lock_path).await {
            Ok(_) => true,
            Err(_) => {
                if let Ok(meta) = fs::metadata(&lock_path).await {
                    if let Ok(modified) = meta.modified() {
                        if modified.elapsed().unwrap_or_default() > self.config.lock_timeout {
                            let _ = fs::remove_file(&lock_path).await;
                            return fs::OpenOptions::new()
                                .write(true)
                                .create_new(true)
                                .open(&lock_path)
                                .await
                                .is_ok();
                        }
                    }
                }
                false
            }
        }
    }

    async fn release_lock(&self, basename: &str) {
        let _ = fs::remove_file(self.locks_dir().join(lock_name(basename))).await;
    }

    async fn handle_message_file(&self, path: &Path) -> Result<(), TransportError> {
        let contents = fs::read(path).await?;
        let value: serde_json::Value = serde_json::from_slice(&contents)?;

        if let Some(correlation_id) = value.get("correlationId").and_then(|v| v.as_str()) {
            if let Some(tx) = self.pending.lock().unwrap().remove(correlation_id) {
                let _ = tx.send(value);
                return Ok(());
            }
        }

        let message: Message = serde_json::from_value(value)?;
        self.inbound.dispatch(TransportKind::FileSystem, message);
        Ok(())
    }
}

#[async_trait]
impl BaseTransport for FileSystemTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::FileSystem
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if *self.state.lock().unwrap() == ConnectionState::Connected {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);

        for dir in [
            self.root.clone(),
            self.outgoing_dir(),
            self.incoming_dir(),
            self.processing_dir(),
            self.locks_dir(),
        ] {
            if let Err(e) = fs::create_dir_all(&dir).await {
                self.set_state(ConnectionState::Failed);
                return Err(TransportError::TransportUnavailable(format!(
                    "cannot create devpipe directory {}: {e}",
                    dir.display()
                )));
            }
        }

        let probe = self.root.join(".conduit-probe");
        if let Err(e) = fs::write(&probe, b"ok").await {
            self.set_state(ConnectionState::Failed);
            return Err(TransportError::TransportUnavailable(format!(
                "devpipe root not writable: {e}"
            )));
        }
        let _ = fs::remove_file(&probe).await;

        self.set_state(ConnectionState::Connected);
        tracing::info!(root = %self.root.display(), "FileSystem transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.cancel.lock().unwrap().cancel();
        if let Some(handle) = self.poll_handle.lock().unwrap().take() {
            let _ = handle.await;
        }
        for (_, tx) in self.pending.lock().unwrap().drain() {
            let _ = tx.send(serde_json::json!({ "success": false, "error": "cancelled" }));
        }
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

        if self.queue_depth().await >= self.config.max_queue_size {
            return Err(TransportError::QueueFull);
        }

        let start = Instant::now();
        let basename = format!("{}-{}.json", message.timestamp, message.id);
        let body = match serde_json::to_vec(&message) {
            Ok(b) => b,
            Err(e) => return Err(TransportError::Serde(e)),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(message.id.clone(), tx);

        if let Err(e) = self.write_atomic(&self.outgoing_dir(), &basename, &body).await {
            self.pending.lock().unwrap().remove(&message.id);
            self.circuit.record_failure();
            return Err(e);
        }

        let timeout = context
            .max_latency_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => unwrap_envelope(value),
            Ok(Err(_)) => Err(TransportError::Cancelled),
            Err(_) => {
                self.pending.lock().unwrap().remove(&message.id);
                Err(TransportError::Timeout(timeout.as_millis() as u64))
            }
        };

        let elapsed = start.elapsed();
        match &result {
            Ok(_) => {
                self.circuit.record_success();
                let (snapshot, changed) = self.health.record(true, elapsed, self.circuit.state());
                if changed {
                    self.inbound.health_changed(TransportKind::FileSystem, snapshot);
                }
            }
            Err(e) if e.is_retryable() => {
                self.circuit.record_failure();
                let (snapshot, changed) = self.health.record(false, elapsed, self.circuit.state());
                if changed {
                    self.inbound.health_changed(TransportKind::FileSystem, snapshot);
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

/// Lock sentinel basename for a given message basename.
fn lock_name(basename: &str) -> String {
    let digest = Sha256::digest(basename.as_bytes());
    hex::encode(digest)
}

/// Starts the background poll loop. Must be called once after `connect()`
/// succeeds — split out from `connect()` because it needs an `Arc<Self>`,
/// which `BaseTransport::connect(&self)` cannot provide.
pub fn start_polling(transport: &Arc<FileSystemTransport>) {
    transport.spawn_poll_loop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InboundSink;

    struct NullSink;
    impl InboundSink for NullSink {
        fn dispatch(&self, _kind: TransportKind, _message: Message) {}
    }

    #[tokio::test]
    async fn connect_creates_directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.filesystem.root = dir.path().join("devpipe");

        let transport = FileSystemTransport::new(&config, Arc::new(NullSink));
        transport.connect().await.unwrap();

        assert!(transport.outgoing_dir().is_dir());
        assert!(transport.incoming_dir().is_dir());
        assert!(transport.processing_dir().is_dir());
        assert!(transport.locks_dir().is_dir());
    }

    #[tokio::test]
    async fn send_writes_file_into_outgoing_via_atomic_rename() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.filesystem.root = dir.path().join("devpipe");
        config.timeout = Duration::from_millis(50);

        let transport = FileSystemTransport::new(&config, Arc::new(NullSink));
        transport.connect().await.unwrap();

        let message = Message::new_request(crate::message::MessagePayload::HealthCheckRequest(
            crate::message::HealthCheckRequest::default(),
        ));
        let context = SelectionContext {
            message_type: MessageType::HealthCheckRequest,
            priority: crate::message::Priority::Normal,
            requires_realtime: false,
            max_latency_ms: Some(50),
        };

        let result = transport.send(message, &context).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));

        let mut entries = fs::read_dir(transport.outgoing_dir()).await.unwrap();
        let mut found = false;
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if !entry.file_name().to_string_lossy().starts_with('.') {
                found = true;
            }
        }
        assert!(found, "expected a committed file in outgoing/");
    }

    #[tokio::test]
    async fn queue_full_rejects_further_sends() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.filesystem.root = dir.path().join("devpipe");
        config.filesystem.max_queue_size = 1;
        config.timeout = Duration::from_millis(20);

        let transport = FileSystemTransport::new(&config, Arc::new(NullSink));
        transport.connect().await.unwrap();

        let context = SelectionContext {
            message_type: MessageType::HealthCheckRequest,
            priority: crate::message::Priority::Normal,
            requires_realtime: false,
            max_latency_ms: Some(20),
        };

        let first = Message::new_request(crate::message::MessagePayload::HealthCheckRequest(
            crate::message::HealthCheckRequest::default(),
        ));
        let _ = transport.send(first, &context).await;

        let second = Message::new_request(crate::message::MessagePayload::HealthCheckRequest(
            crate::message::HealthCheckRequest::default(),
        ));
        let result = transport.send(second, &context).await;
        assert!(matches!(result, Err(TransportError::QueueFull)));
    }
}
