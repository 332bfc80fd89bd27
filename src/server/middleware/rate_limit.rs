use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tracing::debug;

use crate::server::client::ClientIdentity;

/// Per-client sliding-window limiter for check requests.
///
/// Each identity keeps the timestamps of its admitted requests. A request is
/// admitted when fewer than `max_requests` of them fall inside the trailing
/// window. The map entry guard serializes callers that share an identity, so
/// two simultaneous requests can never both take the last slot.
#[derive(Clone)]
pub struct CheckRateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    max_requests: usize,
    window: Duration,
    windows: DashMap<ClientIdentity, VecDeque<Instant>>,
}

impl CheckRateLimiter {
    /// Creates a limiter allowing `max_requests` admissions per `window`.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                max_requests,
                window,
                windows: DashMap::new(),
            }),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.inner.max_requests
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Records a request for `identity` if its quota allows one.
    ///
    /// Returns `false`, leaving the window untouched, when the quota is spent.
    pub fn admit(&self, identity: &ClientIdentity) -> bool {
        self.admit_at(identity, Instant::now())
    }

    /// Same as [`admit`](Self::admit) with an explicit clock reading.
    pub fn admit_at(&self, identity: &ClientIdentity, now: Instant) -> bool {
        let mut entry = self.inner.windows.entry(identity.clone()).or_default();
        let timestamps = entry.value_mut();
        self.purge(timestamps, now);

        if timestamps.len() >= self.inner.max_requests {
            debug!(%identity, count = timestamps.len(), "Rate limit reached");
            return false;
        }

        timestamps.push_back(now);
        true
    }

    /// Time until `identity` regains a slot, or `None` if one is free now.
    pub fn retry_after(&self, identity: &ClientIdentity) -> Option<Duration> {
        self.retry_after_at(identity, Instant::now())
    }

    pub fn retry_after_at(&self, identity: &ClientIdentity, now: Instant) -> Option<Duration> {
        let entry = self.inner.windows.get(identity)?;
        let live: Vec<&Instant> = entry
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.inner.window)
            .collect();

        if live.len() < self.inner.max_requests {
            return None;
        }

        // The slot frees up when the oldest live request leaves the window.
        let oldest = live.first()?;
        Some(self.inner.window - now.saturating_duration_since(**oldest))
    }

    /// Admissions still available to `identity` in the current window.
    pub fn remaining(&self, identity: &ClientIdentity) -> usize {
        let now = Instant::now();
        let used = self
            .inner
            .windows
            .get(identity)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < self.inner.window)
                    .count()
            })
            .unwrap_or(0);
        self.inner.max_requests.saturating_sub(used)
    }

    /// Drops identities whose windows hold no live requests.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    pub fn cleanup_at(&self, now: Instant) {
        self.inner.windows.retain(|_, timestamps| {
            self.purge(timestamps, now);
            !timestamps.is_empty()
        });
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.inner.windows.len()
    }

    fn purge(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.inner.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}
