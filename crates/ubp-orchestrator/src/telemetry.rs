// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Metrics collection with atomic counters and latency percentiles.
//!
//! Thread-safe: gauges and plain counters use atomics (Relaxed ordering),
//! keyed counters and latency samples sit behind short-lived mutexes.
//! A JSON snapshot is served at `GET /v1/metrics`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Envelope processing outcomes for the per-kind counters.
pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_ERROR: &str = "error";
pub const OUTCOME_DROPPED: &str = "dropped";

const MAX_LATENCY_SAMPLES: usize = 4096;

/// Central metrics collector shared by every component.
pub struct MetricsCollector {
    started: Instant,
    active_instances: AtomicI64,
    task_queue_depth: AtomicI64,
    heartbeat_miss_total: AtomicU64,
    /// (envelope kind, outcome) -> count
    envelopes: Mutex<BTreeMap<(&'static str, &'static str), u64>>,
    /// command_name -> recent latency samples
    latencies: Mutex<BTreeMap<String, LatencyWindow>>,
}

struct LatencyWindow {
    count: u64,
    samples_ms: Vec<f64>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            active_instances: AtomicI64::new(0),
            task_queue_depth: AtomicI64::new(0),
            heartbeat_miss_total: AtomicU64::new(0),
            envelopes: Mutex::new(BTreeMap::new()),
            latencies: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn instance_connected(&self) {
        self.active_instances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn instance_disconnected(&self) {
        self.active_instances.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_instances(&self) -> i64 {
        self.active_instances.load(Ordering::Relaxed)
    }

    pub fn heartbeat_missed(&self) {
        self.heartbeat_miss_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_enqueued(&self) {
        self.task_queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_dequeued(&self) {
        self.task_queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count one processed envelope by kind and outcome.
    pub fn envelope(&self, kind: &'static str, outcome: &'static str) {
        *self.envelopes.lock().entry((kind, outcome)).or_insert(0) += 1;
    }

    /// Record one completed command round-trip.
    pub fn command_latency(&self, command_name: &str, elapsed: Duration) {
        let mut latencies = self.latencies.lock();
        let window = latencies
            .entry(command_name.to_string())
            .or_insert_with(|| LatencyWindow {
                count: 0,
                samples_ms: Vec::new(),
            });
        window.count += 1;
        if window.samples_ms.len() == MAX_LATENCY_SAMPLES {
            window.samples_ms.remove(0);
        }
        window.samples_ms.push(elapsed.as_secs_f64() * 1000.0);
    }

    /// Point-in-time snapshot of every metric.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let envelopes = self
            .envelopes
            .lock()
            .iter()
            .map(|((kind, outcome), count)| (format!("{}.{}", kind, outcome), *count))
            .collect();

        let commands = self
            .latencies
            .lock()
            .iter()
            .map(|(name, window)| {
                let mut sorted = window.samples_ms.clone();
                sorted.sort_by(|a, b| a.total_cmp(b));
                (
                    name.clone(),
                    CommandLatency {
                        count: window.count,
                        p50_ms: percentile(&sorted, 0.50),
                        p95_ms: percentile(&sorted, 0.95),
                        p99_ms: percentile(&sorted, 0.99),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            active_instances: self.active_instances.load(Ordering::Relaxed),
            task_queue_depth: self.task_queue_depth.load(Ordering::Relaxed),
            heartbeat_miss_total: self.heartbeat_miss_total.load(Ordering::Relaxed),
            envelopes_total: envelopes,
            command_latency: commands,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted_ms: &[f64], q: f64) -> f64 {
    if sorted_ms.is_empty() {
        return 0.0;
    }
    let rank = ((sorted_ms.len() as f64 - 1.0) * q).round() as usize;
    sorted_ms[rank.min(sorted_ms.len() - 1)]
}

/// Serializable snapshot served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub active_instances: i64,
    pub task_queue_depth: i64,
    pub heartbeat_miss_total: u64,
    pub envelopes_total: BTreeMap<String, u64>,
    pub command_latency: BTreeMap<String, CommandLatency>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandLatency {
    pub count: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Milliseconds since the Unix epoch; the timestamp format used across
/// records and the admin API.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges() {
        let m = MetricsCollector::new();
        m.instance_connected();
        m.instance_connected();
        m.instance_disconnected();
        assert_eq!(m.active_instances(), 1);

        m.task_enqueued();
        m.task_enqueued();
        m.task_dequeued();
        assert_eq!(m.snapshot().task_queue_depth, 1);
    }

    #[test]
    fn test_envelope_counters() {
        let m = MetricsCollector::new();
        m.envelope("heartbeat", OUTCOME_OK);
        m.envelope("heartbeat", OUTCOME_OK);
        m.envelope("command_response", OUTCOME_DROPPED);

        let snap = m.snapshot();
        assert_eq!(snap.envelopes_total.get("heartbeat.ok"), Some(&2));
        assert_eq!(snap.envelopes_total.get("command_response.dropped"), Some(&1));
    }

    #[test]
    fn test_latency_percentiles() {
        let m = MetricsCollector::new();
        for i in 1..=100 {
            m.command_latency("t.exec", Duration::from_millis(i));
        }
        let snap = m.snapshot();
        let lat = snap.command_latency.get("t.exec").unwrap();
        assert_eq!(lat.count, 100);
        assert!(lat.p50_ms >= 45.0 && lat.p50_ms <= 55.0);
        assert!(lat.p99_ms >= 95.0);
    }

    #[test]
    fn test_latency_window_bounded() {
        let m = MetricsCollector::new();
        for _ in 0..(MAX_LATENCY_SAMPLES + 100) {
            m.command_latency("t.exec", Duration::from_millis(1));
        }
        let snap = m.snapshot();
        assert_eq!(
            snap.command_latency.get("t.exec").unwrap().count,
            (MAX_LATENCY_SAMPLES + 100) as u64
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = MetricsCollector::new();
        m.envelope("event", OUTCOME_OK);
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"event.ok\":1"));
    }
}
