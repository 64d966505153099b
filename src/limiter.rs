//! Bandwidth limiting
//!
//! A process-wide throughput governor shared by all active transfers. Each
//! transfer awaits [`BandwidthLimiter::throttle`] before writing a chunk;
//! with a limit configured, chunk admissions draw from a rolling one-second
//! byte budget and callers suspend until the next window when the budget is
//! spent. The limiter also tracks near-real-time per-download speeds for
//! stats reporting.

use crate::types::{BandwidthStats, DownloadId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Length of the throttle budget window
const WINDOW: Duration = Duration::from_secs(1);

/// Span over which per-download speeds are averaged
const METER_SPAN: Duration = Duration::from_secs(2);

/// One rolling byte-budget window
#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    consumed: u64,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            consumed: 0,
        }
    }

    /// Try to admit `chunk` bytes under `limit_bps`.
    ///
    /// Returns `None` when admitted, or the time to sleep before retrying.
    /// The caller holds the lock, so at most one caller resets an expired
    /// window and no bytes are double-counted across the rollover.
    fn try_consume(&mut self, limit_bps: u64, chunk: u64, now: Instant) -> Option<Duration> {
        if now.duration_since(self.started) >= WINDOW {
            self.started = now;
            self.consumed = 0;
        }

        // A chunk larger than the whole budget is admitted alone into a
        // fresh window rather than blocking forever.
        if self.consumed == 0 || self.consumed + chunk <= limit_bps {
            self.consumed += chunk;
            None
        } else {
            Some(WINDOW.saturating_sub(now.duration_since(self.started)))
        }
    }
}

/// Sliding-window speed measurement for one download
#[derive(Debug, Default)]
struct SpeedMeter {
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    fn record(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back((now, bytes));
        while let Some(&(ts, _)) = self.samples.front() {
            if now.duration_since(ts) > METER_SPAN {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes/sec over the retained samples; 0 until two samples exist
    fn speed(&self, now: Instant) -> u64 {
        let first = match self.samples.front() {
            Some(&(ts, _)) => ts,
            None => return 0,
        };
        if now.duration_since(first) > METER_SPAN + WINDOW {
            // Stale; nothing recorded recently
            return 0;
        }
        let last = self.samples.back().map(|&(ts, _)| ts).unwrap_or(first);
        let elapsed = last.duration_since(first).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        let bytes: u64 = self.samples.iter().map(|&(_, b)| b).sum();
        (bytes as f64 / elapsed) as u64
    }
}

/// Per-download tracking state
#[derive(Debug)]
struct Tracker {
    meter: SpeedMeter,
    /// Budget window for this download's own cap
    window: Window,
}

impl Tracker {
    fn new(now: Instant) -> Self {
        Self {
            meter: SpeedMeter::default(),
            window: Window::new(now),
        }
    }
}

/// Global throughput governor shared by all concurrent downloads
pub struct BandwidthLimiter {
    /// Global limit in bytes/sec (0 = unlimited)
    limit_bps: AtomicU64,
    /// Shared budget window for the global limit
    window: Mutex<Window>,
    /// Per-download speed meters and cap windows
    trackers: Mutex<HashMap<DownloadId, Tracker>>,
}

impl BandwidthLimiter {
    /// Create a limiter; `limit_kbps == 0` means unlimited
    pub fn new(limit_kbps: u64) -> Self {
        Self {
            limit_bps: AtomicU64::new(limit_kbps.saturating_mul(1024)),
            window: Mutex::new(Window::new(Instant::now())),
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Set or clear (0) the global limit in KB/s.
    ///
    /// Takes effect for subsequent chunks; reads already in flight are not
    /// throttled retroactively.
    pub fn set_limit_kbps(&self, kbps: u64) {
        self.limit_bps
            .store(kbps.saturating_mul(1024), Ordering::Relaxed);
    }

    /// Current global limit in bytes/sec (0 = unlimited)
    pub fn limit_bps(&self) -> u64 {
        self.limit_bps.load(Ordering::Relaxed)
    }

    /// Gate a chunk write.
    ///
    /// `cap_bps` is the download's own cap; when set it replaces the global
    /// limit for this download and draws from a private window. Suspends
    /// until a window with budget for `chunk` bytes opens, then records the
    /// bytes against the download's speed meter.
    pub async fn throttle(&self, id: DownloadId, chunk: u64, cap_bps: Option<u64>) {
        let cap = cap_bps.filter(|c| *c > 0);

        loop {
            // Re-read each pass so limit changes apply mid-wait.
            let limit = match cap {
                Some(c) => c,
                None => self.limit_bps.load(Ordering::Relaxed),
            };
            if limit == 0 {
                break;
            }

            let now = Instant::now();
            let wait = match cap {
                Some(_) => {
                    let mut trackers = self.trackers.lock();
                    trackers
                        .entry(id)
                        .or_insert_with(|| Tracker::new(now))
                        .window
                        .try_consume(limit, chunk, now)
                }
                None => self.window.lock().try_consume(limit, chunk, now),
            };

            match wait {
                None => break,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }

        let now = Instant::now();
        self.trackers
            .lock()
            .entry(id)
            .or_insert_with(|| Tracker::new(now))
            .meter
            .record(chunk, now);
    }

    /// Most recently measured speed for a download in bytes/sec.
    ///
    /// Returns 0 for untracked identifiers.
    pub fn current_speed(&self, id: DownloadId) -> u64 {
        let now = Instant::now();
        self.trackers
            .lock()
            .get(&id)
            .map(|t| t.meter.speed(now))
            .unwrap_or(0)
    }

    /// Drop tracking state for a finished download.
    ///
    /// Must be called when a download ends so tracker growth stays bounded.
    pub fn remove(&self, id: DownloadId) {
        self.trackers.lock().remove(&id);
    }

    /// Aggregate snapshot across all tracked downloads
    pub fn stats(&self) -> BandwidthStats {
        let now = Instant::now();
        let trackers = self.trackers.lock();
        let current_bps: u64 = trackers.values().map(|t| t.meter.speed(now)).sum();
        let limit_bps = self.limit_bps.load(Ordering::Relaxed);
        let utilization = if limit_bps > 0 {
            current_bps as f64 / limit_bps as f64
        } else {
            0.0
        };
        BandwidthStats {
            current_bps,
            limit_bps,
            utilization,
            tracked_downloads: trackers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unlimited_returns_immediately() {
        let limiter = BandwidthLimiter::new(0);
        let id = DownloadId::new();
        let start = Instant::now();
        limiter.throttle(id, 1024 * 1024, None).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn window_blocks_until_rollover() {
        let limiter = BandwidthLimiter::new(1); // 1024 bytes/sec
        let id = DownloadId::new();

        limiter.throttle(id, 800, None).await;

        let start = Instant::now();
        limiter.throttle(id, 800, None).await;
        assert!(
            start.elapsed() >= Duration::from_millis(900),
            "second chunk should wait for the next window, waited {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_chunk_admitted_into_fresh_window() {
        let limiter = BandwidthLimiter::new(1); // 1024 bytes/sec
        let id = DownloadId::new();

        // Larger than the whole budget; must not block forever.
        limiter.throttle(id, 4096, None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn per_download_cap_overrides_global() {
        let limiter = BandwidthLimiter::new(0); // global unlimited
        let id = DownloadId::new();

        limiter.throttle(id, 800, Some(1024)).await;

        let start = Instant::now();
        limiter.throttle(id, 800, Some(1024)).await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn caps_do_not_share_windows() {
        let limiter = BandwidthLimiter::new(0);
        let a = DownloadId::new();
        let b = DownloadId::new();

        limiter.throttle(a, 1000, Some(1024)).await;

        // A different download's cap window is untouched.
        let start = Instant::now();
        limiter.throttle(b, 1000, Some(1024)).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_tracking_and_removal() {
        let limiter = BandwidthLimiter::new(0);
        let id = DownloadId::new();

        limiter.throttle(id, 1000, None).await;
        tokio::time::advance(Duration::from_millis(500)).await;
        limiter.throttle(id, 1000, None).await;

        // 2000 bytes over 0.5s
        assert_eq!(limiter.current_speed(id), 4000);
        assert_eq!(limiter.stats().tracked_downloads, 1);

        limiter.remove(id);
        assert_eq!(limiter.current_speed(id), 0);
        assert_eq!(limiter.stats().tracked_downloads, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_report_limit_and_utilization() {
        let limiter = BandwidthLimiter::new(4); // 4096 bytes/sec
        let id = DownloadId::new();

        limiter.throttle(id, 1024, None).await;
        tokio::time::advance(Duration::from_millis(500)).await;
        limiter.throttle(id, 1024, None).await;

        let stats = limiter.stats();
        assert_eq!(stats.limit_bps, 4096);
        assert_eq!(stats.current_bps, 4096);
        assert!((stats.utilization - 1.0).abs() < f64::EPSILON);
        assert_eq!(stats.tracked_downloads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_change_applies_to_subsequent_chunks() {
        let limiter = BandwidthLimiter::new(1);
        let id = DownloadId::new();
        limiter.throttle(id, 1024, None).await;

        limiter.set_limit_kbps(0);
        let start = Instant::now();
        limiter.throttle(id, 1024 * 1024, None).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
