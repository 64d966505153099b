//! Core types for fetchq
//!
//! Download identifiers, request/record data, and the progress and
//! statistics views derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DownloadId(Uuid);

impl DownloadId {
    /// Create a new random download ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse from the hyphenated string form produced by `Display`
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for DownloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current state of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    /// Waiting in queue for admission
    Queued,
    /// An active session exists and bytes are being transferred
    Downloading,
    /// Stopped by the caller; partial bytes retained, resumable
    Paused,
    /// A transient failure occurred; a deferred trigger will restart it
    RetryScheduled,
    /// All bytes written and verified against the expected total
    Completed,
    /// Retry budget exhausted
    Failed,
    /// Aborted by the caller; partial file removed
    Cancelled,
    /// Synthetic state for progress queries against an unknown identifier.
    /// Never persisted.
    NotFound,
}

impl DownloadState {
    /// Check if a session may exist for this state
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading)
    }

    /// Check if the download reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if `start` may admit a download in this state
    pub fn is_startable(&self) -> bool {
        matches!(self, Self::Queued | Self::Paused | Self::RetryScheduled)
    }

    /// Stable string form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::RetryScheduled => "retry_scheduled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DownloadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "retry_scheduled" => Ok(Self::RetryScheduled),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "not_found" => Ok(Self::NotFound),
            other => Err(format!("Invalid download state: {}", other)),
        }
    }
}

/// Network type a download is allowed to run on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkConstraint {
    /// Any connected network
    #[default]
    Any,
    /// Unmetered networks only (Wi-Fi / ethernet)
    Unmetered,
}

impl NetworkConstraint {
    /// Stable string form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Unmetered => "unmetered",
        }
    }
}

impl std::str::FromStr for NetworkConstraint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(Self::Any),
            "unmetered" => Ok(Self::Unmetered),
            other => Err(format!("Invalid network constraint: {}", other)),
        }
    }
}

/// Caller-supplied description of a download. Immutable once scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Source URL (http or https)
    pub url: String,
    /// Destination file name
    pub file_name: String,
    /// Destination directory; empty means the manager's configured default
    pub directory: PathBuf,
    /// Queue priority; lower values drain first
    pub priority: i32,
    /// Network type required for admission
    pub constraint: NetworkConstraint,
    /// Only start while the device is charging
    pub requires_charging: bool,
    /// Earliest start time
    pub scheduled_at: DateTime<Utc>,
    /// Maximum automatic retry attempts
    pub max_retries: u32,
    /// Per-download bandwidth cap in bytes/sec (overrides the global limit)
    pub limit_bps: Option<u64>,
    /// Additional HTTP headers
    pub headers: Vec<(String, String)>,
    /// Free-form caller metadata
    pub metadata: HashMap<String, String>,
}

impl DownloadRequest {
    /// Create a request with default scheduling options
    pub fn new(url: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_name: file_name.into(),
            directory: PathBuf::new(),
            priority: 0,
            constraint: NetworkConstraint::Any,
            requires_charging: false,
            scheduled_at: Utc::now(),
            max_retries: 3,
            limit_bps: None,
            headers: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Set the destination directory
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = dir.into();
        self
    }

    /// Set the queue priority (lower drains first)
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Restrict the download to unmetered networks
    pub fn unmetered_only(mut self) -> Self {
        self.constraint = NetworkConstraint::Unmetered;
        self
    }

    /// Require the device to be charging
    pub fn requires_charging(mut self, required: bool) -> Self {
        self.requires_charging = required;
        self
    }

    /// Defer the earliest start time
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    /// Set the maximum automatic retry attempts
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Cap this download's throughput in bytes/sec
    pub fn limit_bps(mut self, bps: u64) -> Self {
        self.limit_bps = Some(bps);
        self
    }

    /// Add an HTTP header sent with the transfer request
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a caller metadata entry
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Durable record of a download and its current progress.
///
/// The queue store is the source of truth for these; the manager never
/// holds one in memory longer than a single active transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Unique identifier, stable for the record's lifetime
    pub id: DownloadId,
    /// The originating request
    pub request: DownloadRequest,
    /// Current state
    pub state: DownloadState,
    /// Bytes written to the destination file so far
    pub downloaded_bytes: u64,
    /// Expected total bytes; 0 until known from the server response
    pub total_bytes: u64,
    /// Most recently measured speed in bytes/sec
    pub speed_bps: u64,
    /// Automatic retry attempts consumed
    pub retry_count: u32,
    /// Message from the most recent failure
    pub last_error: Option<String>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the first transfer attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached
    pub completed_at: Option<DateTime<Utc>>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl DownloadRecord {
    /// Create a fresh queued record for a request
    pub fn new(id: DownloadId, request: DownloadRequest, now: DateTime<Utc>) -> Self {
        Self {
            id,
            request,
            state: DownloadState::Queued,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed_bps: 0,
            retry_count: 0,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Full path of the destination file
    pub fn destination(&self) -> PathBuf {
        self.request.directory.join(&self.request.file_name)
    }

    /// Derive the progress view for this record
    pub fn progress(&self) -> DownloadProgress {
        DownloadProgress::from_record(self)
    }
}

/// Live progress view derived from a [`DownloadRecord`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Download identifier
    pub id: DownloadId,
    /// Current state (`NotFound` when the record does not exist)
    pub state: DownloadState,
    /// Bytes downloaded so far
    pub downloaded_bytes: u64,
    /// Expected total bytes (0 when unknown)
    pub total_bytes: u64,
    /// Completed fraction in `0.0..=1.0`; 0.0 while the total is unknown
    pub fraction: f64,
    /// Current speed in bytes/sec
    pub speed_bps: u64,
    /// Estimated seconds remaining; `None` when speed or total is unknown
    pub eta_seconds: Option<u64>,
}

impl DownloadProgress {
    /// Compute the view from raw counters
    pub fn new(
        id: DownloadId,
        state: DownloadState,
        downloaded_bytes: u64,
        total_bytes: u64,
        speed_bps: u64,
    ) -> Self {
        let fraction = if total_bytes > 0 {
            downloaded_bytes as f64 / total_bytes as f64
        } else {
            0.0
        };
        let eta_seconds = if speed_bps > 0 && total_bytes > downloaded_bytes {
            Some((total_bytes - downloaded_bytes) / speed_bps)
        } else {
            None
        };
        Self {
            id,
            state,
            downloaded_bytes,
            total_bytes,
            fraction,
            speed_bps,
            eta_seconds,
        }
    }

    /// Build the progress view from a record
    pub fn from_record(record: &DownloadRecord) -> Self {
        Self::new(
            record.id,
            record.state,
            record.downloaded_bytes,
            record.total_bytes,
            record.speed_bps,
        )
    }

    /// Synthetic view for an identifier with no record
    pub fn not_found(id: DownloadId) -> Self {
        Self {
            id,
            state: DownloadState::NotFound,
            downloaded_bytes: 0,
            total_bytes: 0,
            fraction: 0.0,
            speed_bps: 0,
            eta_seconds: None,
        }
    }
}

/// Aggregate throughput snapshot from the bandwidth limiter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BandwidthStats {
    /// Sum of all tracked per-download speeds, bytes/sec
    pub current_bps: u64,
    /// Configured global limit in bytes/sec (0 = unlimited)
    pub limit_bps: u64,
    /// `current_bps / limit_bps`; 0.0 when unlimited
    pub utilization: f64,
    /// Number of downloads currently tracked
    pub tracked_downloads: usize,
}

/// Per-state counts over the whole queue store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub downloading: u64,
    pub paused: u64,
    pub retry_scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}
