//! Queue store
//!
//! Durable record of every download request and its current status. The
//! store is the single source of truth: the manager consults it for
//! admission and updates it on every state transition, and progress
//! observers subscribe to push-based watch channels instead of polling.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::types::{DownloadId, DownloadRecord, DownloadState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::watch;

/// Persistence contract consumed by the manager.
///
/// All operations are atomic per record; implementations serialize
/// concurrent updates to the same record so the periodic progress writer
/// cannot race a pause/cancel state write.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new record
    async fn insert(&self, record: &DownloadRecord) -> Result<()>;

    /// Replace an existing record
    async fn update(&self, record: &DownloadRecord) -> Result<()>;

    /// Update only the progress columns of a record.
    ///
    /// Leaves state and scheduling fields untouched, so a concurrent
    /// pause/cancel writer is never clobbered.
    async fn update_progress(
        &self,
        id: DownloadId,
        downloaded_bytes: u64,
        total_bytes: u64,
        speed_bps: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Load a record by id
    async fn get(&self, id: DownloadId) -> Result<Option<DownloadRecord>>;

    /// Queued records whose scheduled time has elapsed, ordered by
    /// `(priority ASC, created_at ASC, id ASC)`
    async fn list_queued(&self, before: DateTime<Utc>) -> Result<Vec<DownloadRecord>>;

    /// All records
    async fn list_all(&self) -> Result<Vec<DownloadRecord>>;

    /// Number of records in the given state
    async fn count_by_state(&self, state: DownloadState) -> Result<u64>;

    /// Remove a record permanently
    async fn delete(&self, id: DownloadId) -> Result<()>;

    /// Push-based observation of a record.
    ///
    /// The receiver holds the current record (or `None` if absent) and is
    /// updated on every mutation; deletion publishes `None`.
    async fn watch(&self, id: DownloadId) -> watch::Receiver<Option<DownloadRecord>>;
}

/// Watch-channel fan-out shared by store implementations.
///
/// Channels are created lazily on first subscription and kept until the
/// record is deleted and all receivers drop.
#[derive(Default)]
pub struct ProgressHub {
    channels: RwLock<HashMap<DownloadId, watch::Sender<Option<DownloadRecord>>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a mutation to any subscribers
    pub fn publish(&self, id: DownloadId, record: Option<DownloadRecord>) {
        let mut channels = self.channels.write();
        if let Some(sender) = channels.get(&id) {
            if sender.is_closed() && record.is_none() {
                channels.remove(&id);
            } else {
                sender.send_replace(record);
            }
        }
    }

    /// Subscribe, seeding the channel with the current record
    pub fn watch(
        &self,
        id: DownloadId,
        current: Option<DownloadRecord>,
    ) -> watch::Receiver<Option<DownloadRecord>> {
        let mut channels = self.channels.write();
        match channels.get(&id) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = watch::channel(current);
                channels.insert(id, sender);
                receiver
            }
        }
    }
}

/// In-memory store for tests and storage-less hosts
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<DownloadId, DownloadRecord>>,
    hub: ProgressHub,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert(&self, record: &DownloadRecord) -> Result<()> {
        self.records.write().insert(record.id, record.clone());
        self.hub.publish(record.id, Some(record.clone()));
        Ok(())
    }

    async fn update(&self, record: &DownloadRecord) -> Result<()> {
        self.records.write().insert(record.id, record.clone());
        self.hub.publish(record.id, Some(record.clone()));
        Ok(())
    }

    async fn update_progress(
        &self,
        id: DownloadId,
        downloaded_bytes: u64,
        total_bytes: u64,
        speed_bps: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = {
            let mut records = self.records.write();
            match records.get_mut(&id) {
                Some(record) => {
                    record.downloaded_bytes = downloaded_bytes;
                    record.total_bytes = total_bytes;
                    record.speed_bps = speed_bps;
                    record.updated_at = updated_at;
                    Some(record.clone())
                }
                None => None,
            }
        };
        if let Some(record) = updated {
            self.hub.publish(id, Some(record));
        }
        Ok(())
    }

    async fn get(&self, id: DownloadId) -> Result<Option<DownloadRecord>> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn list_queued(&self, before: DateTime<Utc>) -> Result<Vec<DownloadRecord>> {
        let mut queued: Vec<DownloadRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.state == DownloadState::Queued && r.request.scheduled_at <= before)
            .cloned()
            .collect();
        queued.sort_by(|a, b| {
            a.request
                .priority
                .cmp(&b.request.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(queued)
    }

    async fn list_all(&self) -> Result<Vec<DownloadRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn count_by_state(&self, state: DownloadState) -> Result<u64> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.state == state)
            .count() as u64)
    }

    async fn delete(&self, id: DownloadId) -> Result<()> {
        self.records.write().remove(&id);
        self.hub.publish(id, None);
        Ok(())
    }

    async fn watch(&self, id: DownloadId) -> watch::Receiver<Option<DownloadRecord>> {
        let current = self.records.read().get(&id).cloned();
        self.hub.watch(id, current)
    }
}
