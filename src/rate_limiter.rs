//! Per-source admission control.
//!
//! Buckets live in a [`DashMap`] so concurrent publishers only contend on
//! their own shard. A bucket holds a window start and a count; once the
//! window has elapsed the next attempt starts a fresh window.

use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub max_events: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub max_connections_per_source: usize,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_events: 10,
            window: Duration::from_secs(1),
            max_connections_per_source: 20,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny { retry_after: Duration },
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    buckets: DashMap<String, Bucket>,
    connections: Arc<DashMap<String, usize>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            buckets: DashMap::new(),
            connections: Arc::new(DashMap::new()),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    pub fn admit(&self, source: &str) -> Admission {
        self.admit_at(source, Instant::now())
    }

    pub fn admit_at(&self, source: &str, now: Instant) -> Admission {
        let mut bucket = self.buckets.entry(source.to_string()).or_insert(Bucket {
            window_start: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(bucket.window_start);
        if elapsed > self.settings.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        bucket.count = bucket.count.saturating_add(1);
        if bucket.count > self.settings.max_events {
            let elapsed = now.saturating_duration_since(bucket.window_start);
            let retry_after = self.settings.window.saturating_sub(elapsed);
            debug!(
                "Source {} over limit ({} in window), retry after {:?}",
                source, bucket.count, retry_after
            );
            return Admission::Deny { retry_after };
        }

        Admission::Allow
    }

    /// Reserves a connection slot for `source`. The slot is released when the
    /// returned permit is dropped.
    pub fn acquire_connection(&self, source: &str) -> Option<ConnectionPermit> {
        let mut count = self.connections.entry(source.to_string()).or_insert(0);
        if *count >= self.settings.max_connections_per_source {
            return None;
        }
        *count += 1;
        Some(ConnectionPermit {
            source: source.to_string(),
            connections: self.connections.clone(),
        })
    }

    pub fn connection_count(&self, source: &str) -> usize {
        self.connections.get(source).map(|count| *count).unwrap_or(0)
    }

    /// Drops buckets whose window ended long enough ago that they would be
    /// reset on next use anyway.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        let window = self.settings.window;
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.window_start) <= window);
        before - self.buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[derive(Debug)]
pub struct ConnectionPermit {
    source: String,
    connections: Arc<DashMap<String, usize>>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let remove = match self.connections.get_mut(&self.source) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if remove {
            self.connections.remove_if(&self.source, |_, count| *count == 0);
        }
    }
}
