//! Relay throughput metrics.
//!
//! Counters are updated on every forwarded chunk and rolled up on a fixed
//! interval. A roll-up resets everything except the active connection
//! gauge; an interval with no traffic produces no snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Percentile summary over a set of observations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub p50: u64,
    pub p95: u64,
    pub max: u64,
}

impl HistogramSummary {
    fn from_observations(mut obs: Vec<u64>) -> Self {
        if obs.is_empty() {
            return Self::default();
        }
        obs.sort_unstable();
        let count = obs.len();
        Self {
            count: count as u64,
            p50: obs[count / 2],
            p95: obs[((count as f64 * 0.95) as usize).min(count - 1)],
            max: obs[count - 1],
        }
    }
}

/// One rolled-up interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub messages_processed: u64,
    pub bytes_transferred: u64,
    pub active_connections: u64,
    pub average_message_size: f64,
    pub average_latency_ms: f64,
    pub peak_latency_ms: f64,
    pub p50_message_size: u64,
    pub p95_message_size: u64,
    pub taken_at: DateTime<Utc>,
}

/// Lifetime counters, never reset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsTotals {
    pub messages: u64,
    pub bytes: u64,
    pub active_connections: u64,
}

pub struct MetricsAggregator {
    messages: AtomicU64,
    bytes: AtomicU64,
    latency_sum_us: AtomicU64,
    peak_latency_us: AtomicU64,
    active: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    samples: Mutex<Vec<u64>>,
    max_samples: usize,
    latest: RwLock<Option<MetricsSnapshot>>,
}

impl MetricsAggregator {
    pub fn new(max_samples: usize) -> Self {
        Self {
            messages: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            peak_latency_us: AtomicU64::new(0),
            active: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            samples: Mutex::new(Vec::new()),
            max_samples,
            latest: RwLock::new(None),
        }
    }

    /// Record one forwarded chunk.
    pub fn record_message(&self, size: usize, latency: Duration) {
        let size = size as u64;
        let latency_us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.peak_latency_us.fetch_max(latency_us, Ordering::Relaxed);

        let mut samples = self.samples.lock();
        if samples.len() < self.max_samples {
            samples.push(size);
        }
    }

    pub fn connection_opened(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn active_connections(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn totals(&self) -> MetricsTotals {
        MetricsTotals {
            messages: self.total_messages.load(Ordering::Relaxed),
            bytes: self.total_bytes.load(Ordering::Relaxed),
            active_connections: self.active_connections(),
        }
    }

    /// Most recent snapshot produced by [`Self::roll_up`].
    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.latest.read().clone()
    }

    /// Close the current interval. Returns `None` when nothing was relayed.
    pub fn roll_up(&self) -> Option<MetricsSnapshot> {
        let messages = self.messages.swap(0, Ordering::Relaxed);
        let bytes = self.bytes.swap(0, Ordering::Relaxed);
        let latency_sum_us = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let peak_latency_us = self.peak_latency_us.swap(0, Ordering::Relaxed);
        let samples = std::mem::take(&mut *self.samples.lock());

        if messages == 0 {
            return None;
        }

        let sizes = HistogramSummary::from_observations(samples);
        let snapshot = MetricsSnapshot {
            messages_processed: messages,
            bytes_transferred: bytes,
            active_connections: self.active_connections(),
            average_message_size: bytes as f64 / messages as f64,
            average_latency_ms: latency_sum_us as f64 / messages as f64 / 1000.0,
            peak_latency_ms: peak_latency_us as f64 / 1000.0,
            p50_message_size: sizes.p50,
            p95_message_size: sizes.p95,
            taken_at: Utc::now(),
        };
        *self.latest.write() = Some(snapshot.clone());
        Some(snapshot)
    }

    /// Roll up every `interval` until `cancel` fires.
    pub fn spawn_reporter(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately.
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.roll_up() {
                            Some(s) => info!(
                                messages = s.messages_processed,
                                bytes = s.bytes_transferred,
                                active = s.active_connections,
                                avg_size = s.average_message_size,
                                p95_size = s.p95_message_size,
                                peak_latency_ms = s.peak_latency_ms,
                                "metrics snapshot"
                            ),
                            None => debug!(
                                active = self.active_connections(),
                                "no traffic this interval"
                            ),
                        }
                    }
                }
            }
            debug!("metrics reporter stopped");
        })
    }
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("messages", &self.messages.load(Ordering::Relaxed))
            .field("active", &self.active_connections())
            .finish_non_exhaustive()
    }
}
