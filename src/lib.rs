//! # fetchq
//!
//! A queue-based, resumable, bandwidth-limited HTTP download manager.
//!
//! ## Features
//!
//! - **Durable queue**: every request becomes a persisted record; the
//!   store (SQLite or in-memory) is the source of truth across restarts
//! - **Admission control**: a fixed concurrency ceiling plus host-supplied
//!   network-type and charging conditions gate when queued work starts
//! - **Resume**: partial files continue from their last written byte via
//!   HTTP range requests
//! - **Bandwidth limiting**: a global ceiling and optional per-download
//!   caps enforced by delaying chunk writes
//! - **Retry with backoff**: transient failures reschedule through a
//!   deferred work trigger with linearly increasing delays
//! - **Async**: built on Tokio, one task per active transfer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fetchq::{DownloadManager, DownloadRequest, ManagerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ManagerConfig::new().download_dir("/tmp/downloads");
//!     let manager = DownloadManager::new(config).await?;
//!
//!     let id = manager
//!         .schedule(DownloadRequest::new(
//!             "https://example.com/file.zip",
//!             "file.zip",
//!         ))
//!         .await?;
//!
//!     // Observe progress through the push-based watch channel
//!     let mut progress = manager.progress(id).await;
//!     while progress.changed().await.is_ok() {
//!         let view = progress.borrow().clone();
//!         println!("{}: {:.1}%", view.id, view.fraction * 100.0);
//!         if view.state.is_terminal() {
//!             break;
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

// Modules
pub mod conditions;
pub mod config;
pub mod error;
pub mod events;
pub mod limiter;
pub mod manager;
pub mod store;
pub mod trigger;
pub mod types;

mod http;

// Re-exports for convenience
pub use conditions::{AlwaysReady, ConditionProvider, NetworkState, ToggleConditions};
pub use config::{HttpConfig, ManagerConfig};
pub use error::{ManagerError, NetworkErrorKind, Result, StorageErrorKind};
pub use events::DownloadEvent;
pub use limiter::BandwidthLimiter;
pub use manager::DownloadManager;
pub use store::{MemoryStore, ProgressHub, QueueStore, SqliteStore};
pub use trigger::{TimerTrigger, TriggerFire, TriggerOp, WorkTrigger};
pub use types::{
    BandwidthStats, DownloadId, DownloadProgress, DownloadRecord, DownloadRequest, DownloadState,
    NetworkConstraint, QueueStats,
};
