//! Download events
//!
//! Events emitted by the download manager.

use crate::types::{DownloadId, DownloadProgress, DownloadState};
use serde::{Deserialize, Serialize};

/// Events emitted by the download manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DownloadEvent {
    /// Download was scheduled
    Added { id: DownloadId },
    /// Transfer started
    Started { id: DownloadId },
    /// Progress update
    Progress {
        id: DownloadId,
        progress: DownloadProgress,
    },
    /// State changed
    StateChanged {
        id: DownloadId,
        old_state: DownloadState,
        new_state: DownloadState,
    },
    /// Download completed successfully
    Completed { id: DownloadId },
    /// Retry budget exhausted
    Failed { id: DownloadId, error: String },
    /// Transient failure; a deferred restart was armed
    RetryScheduled {
        id: DownloadId,
        retry_count: u32,
        delay_secs: u64,
    },
    /// Download was paused
    Paused { id: DownloadId },
    /// Paused download was admitted again
    Resumed { id: DownloadId },
    /// Download was cancelled
    Cancelled { id: DownloadId },
    /// Record was purged from the store
    Removed { id: DownloadId },
}
