//! Download manager
//!
//! The `DownloadManager` is the primary entry point for the library. It
//! persists every request as a queued record, admits queued records under
//! a fixed concurrency ceiling and the host's network/charging conditions,
//! runs one transfer task per admitted download, throttles chunk writes
//! through the shared bandwidth limiter, and turns failures into retries
//! with linear backoff via the deferred work trigger.
//!
//! Cancellation is cooperative: the in-memory session set is the signal.
//! A transfer checks its own membership before every chunk write, so
//! pausing or cancelling never interrupts a write mid-chunk.

use crate::conditions::{AlwaysReady, ConditionProvider};
use crate::config::ManagerConfig;
use crate::error::{ManagerError, NetworkErrorKind, Result};
use crate::events::DownloadEvent;
use crate::http;
use crate::limiter::BandwidthLimiter;
use crate::store::{MemoryStore, QueueStore, SqliteStore};
use crate::trigger::{TimerTrigger, TriggerFire, TriggerOp, WorkTrigger};
use crate::types::{
    BandwidthStats, DownloadId, DownloadProgress, DownloadRecord, DownloadRequest, DownloadState,
    QueueStats,
};
use chrono::Utc;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Maximum number of events to buffer
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// In-memory handle for one actively-running transfer.
///
/// Exists only while the transfer task runs; removal from the session map
/// is the cooperative stop signal. Never persisted.
struct Session {
    /// `None` while the slot is reserved but the task not yet spawned
    task: Option<tokio::task::JoinHandle<()>>,
}

/// How a transfer task ended
enum TransferEnd {
    /// Stream finished and the byte count checks out
    Completed { bytes: u64, total: u64 },
    /// The session was removed mid-transfer (pause/cancel/shutdown)
    Detached,
}

/// Queue-based, resumable, bandwidth-limited download manager
pub struct DownloadManager {
    /// Weak self-reference for spawning transfer tasks from `&self` methods
    self_ref: Weak<Self>,

    config: ManagerConfig,

    /// Shared HTTP client with bounded timeouts
    client: reqwest::Client,

    /// Source of truth for every download record
    store: Arc<dyn QueueStore>,

    /// Process-wide throughput governor
    limiter: Arc<BandwidthLimiter>,

    /// Host admission signals (network type, charging)
    conditions: Arc<dyn ConditionProvider>,

    /// Deferred start/retry scheduling
    trigger: Arc<dyn WorkTrigger>,

    /// Active transfers, keyed by download id
    sessions: RwLock<HashMap<DownloadId, Session>>,

    /// Event broadcaster
    event_tx: broadcast::Sender<DownloadEvent>,

    /// Shutdown flag
    shutdown: CancellationToken,
}

impl DownloadManager {
    /// Obtain a strong `Arc<Self>` reference for spawning transfer tasks
    fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref.upgrade().ok_or(ManagerError::Shutdown)
    }

    /// Create a manager with the store implied by the configuration
    /// (SQLite when `database_path` is set, in-memory otherwise) and
    /// permissive admission conditions.
    pub async fn new(config: ManagerConfig) -> Result<Arc<Self>> {
        let store: Arc<dyn QueueStore> = match &config.database_path {
            Some(path) => Arc::new(SqliteStore::new(path).await?),
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_store(config, store, Arc::new(AlwaysReady)).await
    }

    /// Create a manager over an explicit store and condition provider
    pub async fn with_store(
        config: ManagerConfig,
        store: Arc<dyn QueueStore>,
        conditions: Arc<dyn ConditionProvider>,
    ) -> Result<Arc<Self>> {
        let (trigger, fired) = TimerTrigger::new();
        Self::with_trigger(config, store, conditions, trigger, fired).await
    }

    /// Create a manager with a caller-supplied work trigger.
    ///
    /// `fired` is the channel the trigger delivers invocations on; the
    /// manager drains it and treats firings for downloads that are no
    /// longer startable as no-ops.
    pub async fn with_trigger(
        config: ManagerConfig,
        store: Arc<dyn QueueStore>,
        conditions: Arc<dyn ConditionProvider>,
        trigger: Arc<dyn WorkTrigger>,
        fired: mpsc::UnboundedReceiver<TriggerFire>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let client = http::build_client(&config.http)?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let limiter = Arc::new(BandwidthLimiter::new(config.limit_kbps));

        let manager = Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            config,
            client,
            store,
            limiter,
            conditions,
            trigger,
            sessions: RwLock::new(HashMap::new()),
            event_tx,
            shutdown: CancellationToken::new(),
        });

        manager.recover().await?;
        Self::start_trigger_task(Arc::clone(&manager), fired);

        Ok(manager)
    }

    /// Reconcile persisted state on startup.
    ///
    /// Records a crash left `Downloading` are parked as `Paused` so they
    /// stay resumable; `RetryScheduled` records get their trigger re-armed.
    async fn recover(&self) -> Result<()> {
        for record in self.store.list_all().await? {
            match record.state {
                DownloadState::Downloading => {
                    let mut record = record;
                    record.state = DownloadState::Paused;
                    record.speed_bps = 0;
                    record.updated_at = Utc::now();
                    self.store.update(&record).await?;
                    tracing::info!(
                        "Restored download {} ({}) as paused",
                        record.id,
                        record.request.file_name
                    );
                }
                DownloadState::RetryScheduled => {
                    self.trigger.schedule_after(
                        Duration::from_secs(self.config.retry_delay_base_secs),
                        TriggerOp::Start,
                        record.id,
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Drain trigger firings into manager operations.
    ///
    /// A firing for a download that was cancelled, paused, or completed in
    /// the meantime is a no-op by construction of `start`/`retry`.
    fn start_trigger_task(manager: Arc<Self>, mut fired: mpsc::UnboundedReceiver<TriggerFire>) {
        let shutdown = manager.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    fire = fired.recv() => {
                        let Some((op, id)) = fire else { break };
                        let outcome = match op {
                            TriggerOp::Start => manager.start(id).await.map(|_| ()),
                            TriggerOp::Retry => manager.retry(id).await.map(|_| ()),
                        };
                        if let Err(e) = outcome {
                            tracing::debug!("Deferred {:?} for {} ignored: {}", op, id, e);
                        }
                    }
                }
            }
        });
    }

    /// Persist a request as a queued record and arrange its start.
    ///
    /// Requests scheduled in the future are handed to the work trigger;
    /// everything else goes through an immediate queue drain.
    pub async fn schedule(&self, request: DownloadRequest) -> Result<DownloadId> {
        if self.shutdown.is_cancelled() {
            return Err(ManagerError::Shutdown);
        }

        let parsed = url::Url::parse(&request.url)?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(ManagerError::invalid_input(
                    "url",
                    format!("Unsupported scheme: {}", scheme),
                ));
            }
        }
        if request.file_name.is_empty() {
            return Err(ManagerError::invalid_input("file_name", "Must not be empty"));
        }

        let mut request = request;
        if request.directory.as_os_str().is_empty() {
            request.directory = self.config.download_dir.clone();
        }

        let id = DownloadId::new();
        let now = Utc::now();
        let record = DownloadRecord::new(id, request, now);
        self.store.insert(&record).await?;

        let _ = self.event_tx.send(DownloadEvent::Added { id });
        tracing::info!("Scheduled download {} ({})", id, record.request.url);

        if record.request.scheduled_at > now {
            let delay = (record.request.scheduled_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            self.trigger.schedule_after(delay, TriggerOp::Start, id);
        } else {
            self.process_queue().await?;
        }

        Ok(id)
    }

    /// Admission-controlled start.
    ///
    /// Returns `Ok(true)` when a transfer is running afterwards, including
    /// the idempotent case where one already was. Returns `Ok(false)`
    /// without side effects when the record is not in a startable state,
    /// the concurrency ceiling is reached, or a network/charging
    /// requirement is unmet.
    pub async fn start(&self, id: DownloadId) -> Result<bool> {
        if self.shutdown.is_cancelled() {
            return Err(ManagerError::Shutdown);
        }

        if self.sessions.read().contains_key(&id) {
            return Ok(true);
        }

        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

        if !record.state.is_startable() {
            return Ok(false);
        }
        if !self.conditions.network().satisfies(record.request.constraint) {
            return Ok(false);
        }
        if record.request.requires_charging && !self.conditions.charging() {
            return Ok(false);
        }

        // Reserve the session slot before persisting so concurrent starts
        // cannot exceed the ceiling.
        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&id) {
                return Ok(true);
            }
            if sessions.len() >= self.config.max_concurrent {
                return Ok(false);
            }
            sessions.insert(id, Session { task: None });
        }

        let old_state = record.state;
        let mut record = record;
        record.state = DownloadState::Downloading;
        record.started_at.get_or_insert_with(Utc::now);
        record.speed_bps = 0;
        record.updated_at = Utc::now();

        if let Err(e) = self.store.update(&record).await {
            self.sessions.write().remove(&id);
            return Err(e);
        }

        let manager = match self.arc() {
            Ok(manager) => manager,
            Err(e) => {
                self.sessions.write().remove(&id);
                return Err(e);
            }
        };
        let task = tokio::spawn(manager.run_transfer(id));
        if let Some(session) = self.sessions.write().get_mut(&id) {
            session.task = Some(task);
        }
        // A concurrent pause may have removed the reservation already; the
        // orphaned task notices at its first liveness check and exits.

        let _ = self.event_tx.send(DownloadEvent::StateChanged {
            id,
            old_state,
            new_state: DownloadState::Downloading,
        });
        let _ = self.event_tx.send(DownloadEvent::Started { id });
        if old_state == DownloadState::Paused {
            let _ = self.event_tx.send(DownloadEvent::Resumed { id });
        }
        tracing::info!("Started download {} ({})", id, record.request.file_name);

        Ok(true)
    }

    /// Stop an active transfer, keeping partial bytes for later resume.
    ///
    /// Idempotent when no transfer is active.
    pub async fn pause(&self, id: DownloadId) -> Result<()> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

        // Removing the session stops the transfer loop before its next
        // chunk write; no further progress is persisted for this attempt.
        self.sessions.write().remove(&id);
        self.trigger.cancel(id);
        self.limiter.remove(id);

        if matches!(
            record.state,
            DownloadState::Queued | DownloadState::Downloading | DownloadState::RetryScheduled
        ) {
            let old_state = record.state;
            let mut record = record;
            record.state = DownloadState::Paused;
            record.speed_bps = 0;
            record.updated_at = Utc::now();
            self.store.update(&record).await?;

            let _ = self.event_tx.send(DownloadEvent::StateChanged {
                id,
                old_state,
                new_state: DownloadState::Paused,
            });
            let _ = self.event_tx.send(DownloadEvent::Paused { id });
            tracing::info!("Paused download {}", id);
        }

        Ok(())
    }

    /// Abort a download and remove its partially-written destination file.
    ///
    /// Idempotent once the record is terminal.
    pub async fn cancel(&self, id: DownloadId) -> Result<()> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

        self.sessions.write().remove(&id);
        self.trigger.cancel(id);
        self.limiter.remove(id);

        if !record.state.is_terminal() {
            let old_state = record.state;
            let mut record = record;
            record.state = DownloadState::Cancelled;
            record.speed_bps = 0;
            record.completed_at = Some(Utc::now());
            record.updated_at = Utc::now();
            self.store.update(&record).await?;

            let _ = tokio::fs::remove_file(record.destination()).await;

            let _ = self.event_tx.send(DownloadEvent::StateChanged {
                id,
                old_state,
                new_state: DownloadState::Cancelled,
            });
            let _ = self.event_tx.send(DownloadEvent::Cancelled { id });
            tracing::info!("Cancelled download {}", id);
        }

        Ok(())
    }

    /// Consume one retry attempt and start again.
    ///
    /// Returns `Ok(false)` when the retry budget is exhausted.
    pub async fn retry(&self, id: DownloadId) -> Result<bool> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

        if record.retry_count >= record.request.max_retries {
            return Ok(false);
        }
        if self.sessions.read().contains_key(&id) {
            return Ok(true);
        }

        let old_state = record.state;
        let mut record = record;
        record.retry_count += 1;
        record.last_error = None;
        record.state = DownloadState::Queued;
        record.updated_at = Utc::now();
        self.store.update(&record).await?;

        let _ = self.event_tx.send(DownloadEvent::StateChanged {
            id,
            old_state,
            new_state: DownloadState::Queued,
        });

        self.start(id).await
    }

    /// Drain the ready queue up to the concurrency ceiling.
    ///
    /// Queued records whose scheduled time has elapsed are started in
    /// ascending priority order (ties broken by creation time, then id).
    /// Returns the number of transfers started.
    pub async fn process_queue(&self) -> Result<usize> {
        let queued = self.store.list_queued(Utc::now()).await?;
        let mut started = 0;

        for record in queued {
            if self.active_count() >= self.config.max_concurrent {
                break;
            }
            if self.start(record.id).await? {
                started += 1;
            }
        }

        Ok(started)
    }

    /// Forward a new global limit (KB/s, 0 = unlimited) to the limiter
    pub fn set_limit_kbps(&self, kbps: u64) {
        tracing::info!("Global bandwidth limit set to {} KB/s", kbps);
        self.limiter.set_limit_kbps(kbps);
    }

    /// Live progress observation for a download.
    ///
    /// The receiver always holds the latest view; an unknown or deleted
    /// identifier yields the synthetic `NotFound` state.
    pub async fn progress(&self, id: DownloadId) -> watch::Receiver<DownloadProgress> {
        let mut records = self.store.watch(id).await;
        let initial = records
            .borrow()
            .as_ref()
            .map(DownloadProgress::from_record)
            .unwrap_or_else(|| DownloadProgress::not_found(id));

        let (tx, rx) = watch::channel(initial);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = records.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let progress = records
                            .borrow_and_update()
                            .as_ref()
                            .map(DownloadProgress::from_record)
                            .unwrap_or_else(|| DownloadProgress::not_found(id));
                        if tx.send(progress).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        rx
    }

    /// Snapshot of one record
    pub async fn record(&self, id: DownloadId) -> Result<Option<DownloadRecord>> {
        self.store.get(id).await
    }

    /// Snapshot of all records
    pub async fn list(&self) -> Result<Vec<DownloadRecord>> {
        self.store.list_all().await
    }

    /// Per-state counts over the whole queue
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            queued: self.store.count_by_state(DownloadState::Queued).await?,
            downloading: self
                .store
                .count_by_state(DownloadState::Downloading)
                .await?,
            paused: self.store.count_by_state(DownloadState::Paused).await?,
            retry_scheduled: self
                .store
                .count_by_state(DownloadState::RetryScheduled)
                .await?,
            completed: self.store.count_by_state(DownloadState::Completed).await?,
            failed: self.store.count_by_state(DownloadState::Failed).await?,
            cancelled: self.store.count_by_state(DownloadState::Cancelled).await?,
        })
    }

    /// Aggregate throughput snapshot
    pub fn bandwidth_stats(&self) -> BandwidthStats {
        self.limiter.stats()
    }

    /// Subscribe to manager events
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    /// Number of active transfers
    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether a transfer session exists for this id
    pub fn is_active(&self, id: DownloadId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    /// Purge a record, cancelling any active transfer first.
    ///
    /// Completed files are left on disk; partial artifacts are removed.
    pub async fn delete(&self, id: DownloadId) -> Result<()> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

        self.sessions.write().remove(&id);
        self.trigger.cancel(id);
        self.limiter.remove(id);
        self.store.delete(id).await?;

        if record.state != DownloadState::Completed {
            let _ = tokio::fs::remove_file(record.destination()).await;
        }

        let _ = self.event_tx.send(DownloadEvent::Removed { id });
        tracing::info!("Removed download {}", id);
        Ok(())
    }

    /// Graceful shutdown: stop background tasks and wait for active
    /// transfers to notice their sessions are gone.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let sessions: Vec<(DownloadId, Session)> = {
            let mut sessions = self.sessions.write();
            sessions.drain().collect()
        };

        for (id, session) in sessions {
            self.limiter.remove(id);
            if let Some(task) = session.task {
                let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
            }
        }
    }

    /// Body of one transfer task.
    ///
    /// Returns a boxed future with an explicitly-declared `Send` type. This
    /// breaks the self-referential auto-trait inference cycle the compiler
    /// cannot resolve otherwise: `run_transfer` drains the queue, which
    /// calls `start`, which spawns `run_transfer` again.
    fn run_transfer(
        self: Arc<Self>,
        id: DownloadId,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let outcome = self.transfer(id).await;

            self.sessions.write().remove(&id);
            self.limiter.remove(id);

            match outcome {
                Ok(TransferEnd::Completed { bytes, total }) => {
                    self.finish_completed(id, bytes, total).await;
                }
                Ok(TransferEnd::Detached) => {
                    // Pause/cancel already persisted their state. If this was a
                    // cancel, sweep any bytes written after the file removal.
                    if let Ok(Some(record)) = self.store.get(id).await {
                        if record.state == DownloadState::Cancelled {
                            let _ = tokio::fs::remove_file(record.destination()).await;
                        }
                    }
                }
                Err(e) => self.handle_failure(id, e).await,
            }

            if !self.shutdown.is_cancelled() {
                if let Err(e) = self.process_queue().await {
                    tracing::debug!("Queue drain after {} failed: {}", id, e);
                }
            }
        })
    }

    /// The chunked, throttled, resumable transfer loop
    async fn transfer(&self, id: DownloadId) -> Result<TransferEnd> {
        if !self.is_active(id) {
            return Ok(TransferEnd::Detached);
        }

        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        let destination = record.destination();

        if let Some(parent) = destination.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    ManagerError::storage(
                        crate::error::StorageErrorKind::Io,
                        parent,
                        format!("Failed to create directory: {}", e),
                    )
                })?;
            }
        }

        let plan = http::open_transfer(&self.client, &record, &self.config.user_agent).await?;
        let mut total = plan.total_bytes;
        let mut downloaded = plan.resumed_from;

        // The connection open may have raced a pause/cancel; once the
        // session is gone nothing more may be persisted for this attempt.
        if !self.is_active(id) {
            return Ok(TransferEnd::Detached);
        }

        // Persist the now-known expected size
        if let Err(e) = self
            .store
            .update_progress(id, downloaded, total, 0, Utc::now())
            .await
        {
            tracing::warn!("Failed to persist size for {}: {}", id, e);
        }

        let mut file = if plan.resumed_from > 0 {
            OpenOptions::new()
                .append(true)
                .open(&destination)
                .await
                .map_err(|e| {
                    ManagerError::storage(
                        crate::error::StorageErrorKind::Io,
                        &destination,
                        format!("Failed to open file for append: {}", e),
                    )
                })?
        } else {
            File::create(&destination).await.map_err(|e| {
                ManagerError::storage(
                    crate::error::StorageErrorKind::Io,
                    &destination,
                    format!("Failed to create file: {}", e),
                )
            })?
        };

        let cap = record.request.limit_bps;
        let interval = Duration::from_millis(self.config.progress_interval_ms);
        let mut stream = plan.response.bytes_stream();
        let mut last_persist = tokio::time::Instant::now();
        let mut bytes_since: u64 = 0;

        while let Some(next) = stream.next().await {
            let chunk = next.map_err(|e| {
                ManagerError::network(NetworkErrorKind::Other, format!("Stream error: {}", e))
            })?;

            for span in http::chunk_spans(chunk.len(), self.config.chunk_size) {
                // Cooperative exit: session removal is the stop signal.
                if !self.is_active(id) {
                    file.flush().await.ok();
                    return Ok(TransferEnd::Detached);
                }

                let slice = chunk.slice(span);
                self.limiter.throttle(id, slice.len() as u64, cap).await;
                file.write_all(&slice).await?;
                downloaded += slice.len() as u64;
                bytes_since += slice.len() as u64;
            }

            // Persist at most once per interval to bound write amplification
            let elapsed = last_persist.elapsed();
            if elapsed >= interval {
                let speed = bytes_since.saturating_mul(1000) / (elapsed.as_millis().max(1) as u64);
                if let Err(e) = self
                    .store
                    .update_progress(id, downloaded, total, speed, Utc::now())
                    .await
                {
                    // Store trouble must not kill the transfer; the next
                    // successful persist reconciles.
                    tracing::warn!("Failed to persist progress for {}: {}", id, e);
                }
                let _ = self.event_tx.send(DownloadEvent::Progress {
                    id,
                    progress: DownloadProgress::new(
                        id,
                        DownloadState::Downloading,
                        downloaded,
                        total,
                        speed,
                    ),
                });
                last_persist = tokio::time::Instant::now();
                bytes_since = 0;
            }
        }

        file.flush().await?;
        file.sync_all().await.ok();

        if total > 0 && downloaded < total {
            return Err(ManagerError::network(
                NetworkErrorKind::Truncated,
                format!("Body ended at {} of {} bytes", downloaded, total),
            ));
        }
        if total == 0 {
            total = downloaded;
        }

        Ok(TransferEnd::Completed {
            bytes: downloaded,
            total,
        })
    }

    /// Persist the terminal completed state
    async fn finish_completed(&self, id: DownloadId, bytes: u64, total: u64) {
        let record = match self.store.get(id).await {
            Ok(Some(record)) => record,
            _ => return,
        };

        let old_state = record.state;
        let mut record = record;
        record.state = DownloadState::Completed;
        record.downloaded_bytes = bytes;
        record.total_bytes = total;
        record.speed_bps = 0;
        record.completed_at = Some(Utc::now());
        record.updated_at = Utc::now();

        if let Err(e) = self.store.update(&record).await {
            tracing::warn!("Failed to persist completion for {}: {}", id, e);
        }

        let _ = self.event_tx.send(DownloadEvent::StateChanged {
            id,
            old_state,
            new_state: DownloadState::Completed,
        });
        let _ = self.event_tx.send(DownloadEvent::Completed { id });
        tracing::info!("Download {} completed ({} bytes)", id, bytes);
    }

    /// Route a transfer failure into retry scheduling or terminal failure
    async fn handle_failure(&self, id: DownloadId, error: ManagerError) {
        let record = match self.store.get(id).await {
            Ok(Some(record)) => record,
            _ => return,
        };

        // A pause or cancel that raced the failure wins.
        if record.state != DownloadState::Downloading {
            return;
        }

        let message = error.to_string();
        let old_state = record.state;
        let mut record = record;
        record.speed_bps = 0;
        record.last_error = Some(message.clone());
        record.updated_at = Utc::now();

        if record.retry_count < record.request.max_retries {
            record.retry_count += 1;
            record.state = DownloadState::RetryScheduled;
            let delay_secs = self.config.retry_delay_base_secs * record.retry_count as u64;

            if let Err(e) = self.store.update(&record).await {
                tracing::warn!("Failed to persist retry state for {}: {}", id, e);
            }
            self.trigger
                .schedule_after(Duration::from_secs(delay_secs), TriggerOp::Start, id);

            let _ = self.event_tx.send(DownloadEvent::StateChanged {
                id,
                old_state,
                new_state: DownloadState::RetryScheduled,
            });
            let _ = self.event_tx.send(DownloadEvent::RetryScheduled {
                id,
                retry_count: record.retry_count,
                delay_secs,
            });
            tracing::info!(
                "Download {} failed ({}), retry {}/{} in {}s",
                id,
                message,
                record.retry_count,
                record.request.max_retries,
                delay_secs
            );
        } else {
            record.state = DownloadState::Failed;
            record.completed_at = Some(Utc::now());

            if let Err(e) = self.store.update(&record).await {
                tracing::warn!("Failed to persist failure for {}: {}", id, e);
            }

            let _ = self.event_tx.send(DownloadEvent::StateChanged {
                id,
                old_state,
                new_state: DownloadState::Failed,
            });
            let _ = self.event_tx.send(DownloadEvent::Failed {
                id,
                error: message.clone(),
            });
            tracing::warn!("Download {} failed permanently: {}", id, message);
        }
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        // Signal shutdown on drop
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{NetworkState, ToggleConditions};
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    async fn test_manager(
        dir: &TempDir,
        conditions: Arc<ToggleConditions>,
    ) -> Arc<DownloadManager> {
        let config = ManagerConfig::new()
            .download_dir(dir.path())
            .retry_delay_base_secs(0);
        DownloadManager::with_store(config, Arc::new(MemoryStore::new()), conditions)
            .await
            .expect("manager should build")
    }

    #[tokio::test]
    async fn start_unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, Arc::new(ToggleConditions::default())).await;

        let result = manager.start(DownloadId::new()).await;
        assert!(matches!(result, Err(ManagerError::NotFound(_))));
    }

    #[tokio::test]
    async fn schedule_rejects_bad_urls() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, Arc::new(ToggleConditions::default())).await;

        let ftp = DownloadRequest::new("ftp://example.com/a.bin", "a.bin");
        assert!(matches!(
            manager.schedule(ftp).await,
            Err(ManagerError::InvalidInput { field: "url", .. })
        ));

        let garbage = DownloadRequest::new("not a url", "a.bin");
        assert!(manager.schedule(garbage).await.is_err());
    }

    #[tokio::test]
    async fn offline_network_rejects_admission() {
        let dir = TempDir::new().unwrap();
        let conditions = Arc::new(ToggleConditions::default());
        conditions.set_network(NetworkState {
            connected: false,
            unmetered: false,
        });
        let manager = test_manager(&dir, Arc::clone(&conditions)).await;

        let id = manager
            .schedule(DownloadRequest::new("http://127.0.0.1:9/a.bin", "a.bin"))
            .await
            .unwrap();

        assert!(!manager.start(id).await.unwrap());
        let record = manager.record(id).await.unwrap().unwrap();
        assert_eq!(record.state, DownloadState::Queued);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn metered_network_rejects_unmetered_only_downloads() {
        let dir = TempDir::new().unwrap();
        let conditions = Arc::new(ToggleConditions::default());
        conditions.set_network(NetworkState {
            connected: true,
            unmetered: false,
        });
        let manager = test_manager(&dir, Arc::clone(&conditions)).await;

        let id = manager
            .schedule(
                DownloadRequest::new("http://127.0.0.1:9/a.bin", "a.bin").unmetered_only(),
            )
            .await
            .unwrap();

        assert!(!manager.start(id).await.unwrap());
        assert_eq!(
            manager.record(id).await.unwrap().unwrap().state,
            DownloadState::Queued
        );
    }

    #[tokio::test]
    async fn charging_requirement_gates_admission() {
        let dir = TempDir::new().unwrap();
        let conditions = Arc::new(ToggleConditions::default());
        conditions.set_charging(false);
        let manager = test_manager(&dir, Arc::clone(&conditions)).await;

        let id = manager
            .schedule(
                DownloadRequest::new("http://127.0.0.1:9/a.bin", "a.bin")
                    .requires_charging(true),
            )
            .await
            .unwrap();

        assert!(!manager.start(id).await.unwrap());
        assert_eq!(
            manager.record(id).await.unwrap().unwrap().state,
            DownloadState::Queued
        );
    }

    #[tokio::test]
    async fn future_schedule_stays_queued() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, Arc::new(ToggleConditions::default())).await;

        let id = manager
            .schedule(
                DownloadRequest::new("http://127.0.0.1:9/a.bin", "a.bin")
                    .scheduled_at(Utc::now() + ChronoDuration::hours(1)),
            )
            .await
            .unwrap();

        assert_eq!(
            manager.record(id).await.unwrap().unwrap().state,
            DownloadState::Queued
        );
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_returns_false() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let config = ManagerConfig::new().download_dir(dir.path());
        let manager = DownloadManager::with_store(
            config,
            Arc::clone(&store) as Arc<dyn QueueStore>,
            Arc::new(ToggleConditions::default()),
        )
        .await
        .unwrap();

        let mut record = DownloadRecord::new(
            DownloadId::new(),
            DownloadRequest::new("http://127.0.0.1:9/a.bin", "a.bin")
                .directory(dir.path())
                .max_retries(2),
            Utc::now(),
        );
        record.state = DownloadState::Failed;
        record.retry_count = 2;
        store.insert(&record).await.unwrap();

        assert!(!manager.retry(record.id).await.unwrap());
        assert_eq!(
            manager.record(record.id).await.unwrap().unwrap().retry_count,
            2
        );
    }

    #[tokio::test]
    async fn pause_and_cancel_are_idempotent_on_inactive_records() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, Arc::new(ToggleConditions::default())).await;

        let id = manager
            .schedule(
                DownloadRequest::new("http://127.0.0.1:9/a.bin", "a.bin")
                    .scheduled_at(Utc::now() + ChronoDuration::hours(1)),
            )
            .await
            .unwrap();

        manager.pause(id).await.unwrap();
        assert_eq!(
            manager.record(id).await.unwrap().unwrap().state,
            DownloadState::Paused
        );
        // Second pause is a no-op
        manager.pause(id).await.unwrap();

        manager.cancel(id).await.unwrap();
        assert_eq!(
            manager.record(id).await.unwrap().unwrap().state,
            DownloadState::Cancelled
        );
        // Cancelling a terminal record is a no-op
        manager.cancel(id).await.unwrap();
    }

    #[tokio::test]
    async fn progress_for_unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(&dir, Arc::new(ToggleConditions::default())).await;

        let rx = manager.progress(DownloadId::new()).await;
        assert_eq!(rx.borrow().state, DownloadState::NotFound);
    }

    /// Trigger double that records every scheduling call
    struct RecordingTrigger {
        calls: parking_lot::Mutex<Vec<(Duration, TriggerOp, DownloadId)>>,
    }

    impl RecordingTrigger {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    impl WorkTrigger for RecordingTrigger {
        fn schedule_after(&self, delay: Duration, op: TriggerOp, id: DownloadId) {
            self.calls.lock().push((delay, op, id));
        }

        fn cancel(&self, _id: DownloadId) {}
    }

    #[tokio::test]
    async fn failure_backoff_grows_linearly() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let trigger = RecordingTrigger::new();
        let (_unused_tx, fired) = mpsc::unbounded_channel();

        let config = ManagerConfig::new()
            .download_dir(dir.path())
            .retry_delay_base_secs(30);
        let manager = DownloadManager::with_trigger(
            config,
            Arc::clone(&store) as Arc<dyn QueueStore>,
            Arc::new(ToggleConditions::default()),
            Arc::clone(&trigger) as Arc<dyn WorkTrigger>,
            fired,
        )
        .await
        .unwrap();

        let mut record = DownloadRecord::new(
            DownloadId::new(),
            DownloadRequest::new("http://127.0.0.1:9/a.bin", "a.bin")
                .directory(dir.path())
                .max_retries(5),
            Utc::now(),
        );
        record.state = DownloadState::Downloading;
        record.retry_count = 1;
        store.insert(&record).await.unwrap();

        manager
            .handle_failure(
                record.id,
                ManagerError::network(NetworkErrorKind::Timeout, "read timed out"),
            )
            .await;

        let updated = manager.record(record.id).await.unwrap().unwrap();
        assert_eq!(updated.state, DownloadState::RetryScheduled);
        assert_eq!(updated.retry_count, 2);
        assert_eq!(updated.last_error.as_deref(), Some("Network error: read timed out"));

        let calls = trigger.calls.lock();
        assert_eq!(calls.len(), 1);
        let (delay, op, id) = calls[0];
        assert_eq!(delay, Duration::from_secs(60));
        assert_eq!(op, TriggerOp::Start);
        assert_eq!(id, record.id);
    }

    #[tokio::test]
    async fn recover_parks_crashed_downloads_as_paused() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());

        let mut record = DownloadRecord::new(
            DownloadId::new(),
            DownloadRequest::new("http://127.0.0.1:9/a.bin", "a.bin").directory(dir.path()),
            Utc::now(),
        );
        record.state = DownloadState::Downloading;
        record.downloaded_bytes = 512;
        store.insert(&record).await.unwrap();

        let config = ManagerConfig::new().download_dir(dir.path());
        let manager = DownloadManager::with_store(
            config,
            Arc::clone(&store) as Arc<dyn QueueStore>,
            Arc::new(ToggleConditions::default()),
        )
        .await
        .unwrap();

        let recovered = manager.record(record.id).await.unwrap().unwrap();
        assert_eq!(recovered.state, DownloadState::Paused);
        assert_eq!(recovered.downloaded_bytes, 512);
    }
}
