use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

pub const DEFAULT_LIMIT: usize = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

type WindowLog = Arc<Mutex<VecDeque<Instant>>>;

/// Per-caller sliding-window-log limiter.
///
/// Each caller owns a log of admitted request instants behind its own mutex,
/// so the check-and-append for one caller is serialized while callers never
/// wait on each other. The table itself only takes a shard lock long enough
/// to fetch or create a log.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    windows: DashMap<String, WindowLog>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT, DEFAULT_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn allow(&self, caller_id: &str) -> bool {
        self.allow_at(caller_id, Instant::now())
    }

    /// Admits one request at `now`. Entries at least `window` old are
    /// evicted first; a full window rejects without recording.
    pub fn allow_at(&self, caller_id: &str, now: Instant) -> bool {
        let log = self.log_for(caller_id);
        let mut log = log.lock();
        log.retain(|t| now.saturating_duration_since(*t) < self.window);
        if log.len() >= self.limit {
            return false;
        }
        log.push_back(now);
        true
    }

    /// Requests currently counted against `caller_id` at `now`.
    pub fn in_window(&self, caller_id: &str, now: Instant) -> usize {
        self.windows
            .get(caller_id)
            .map(|log| {
                log.lock()
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn tracked_callers(&self) -> usize {
        self.windows.len()
    }

    /// Drops callers with no request inside the window at `now`. A log that
    /// an in-flight `allow_at` still holds is left alone; the shard write
    /// lock taken by `retain` keeps new holders out while the count is read.
    pub fn purge_idle(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, log| {
            if Arc::strong_count(log) > 1 {
                return true;
            }
            let mut entries = log.lock();
            entries.retain(|t| now.saturating_duration_since(*t) < self.window);
            !entries.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    fn log_for(&self, caller_id: &str) -> WindowLog {
        if let Some(log) = self.windows.get(caller_id) {
            return Arc::clone(log.value());
        }
        Arc::clone(
            self.windows
                .entry(caller_id.to_string())
                .or_default()
                .value(),
        )
    }
}
