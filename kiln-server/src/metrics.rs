//! Request counters served as JSON by `GET /metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use kiln_core::serving::FinishReason;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Default)]
pub struct Metrics {
    requests_total: AtomicU64,
    requests_in_flight: AtomicU64,
    requests_stream_total: AtomicU64,
    requests_error_total: AtomicU64,
    requests_cancelled_total: AtomicU64,
    finished_total: AtomicU64,
    latency_ms_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_in_flight: u64,
    pub requests_stream_total: u64,
    pub requests_error_total: u64,
    pub requests_cancelled_total: u64,
    pub avg_latency_ms: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request passed validation and was handed to the scheduler.
    pub fn record_accept(&self, stream: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_in_flight.fetch_add(1, Ordering::Relaxed);
        if stream {
            self.requests_stream_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A request reached its terminal state.
    pub fn record_finish(&self, reason: FinishReason, latency: Duration) {
        self.requests_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.finished_total.fetch_add(1, Ordering::Relaxed);
        self.latency_ms_total
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        match reason {
            FinishReason::Error => {
                self.requests_error_total.fetch_add(1, Ordering::Relaxed);
            }
            FinishReason::Cancelled => {
                self.requests_cancelled_total.fetch_add(1, Ordering::Relaxed);
            }
            FinishReason::Stop | FinishReason::Length => {}
        }
    }

    /// A request was rejected before the scheduler accepted it.
    pub fn record_rejected(&self) {
        self.requests_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.requests_error_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let finished = self.finished_total.load(Ordering::Relaxed);
        let latency_total = self.latency_ms_total.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_in_flight: self.requests_in_flight.load(Ordering::Relaxed),
            requests_stream_total: self.requests_stream_total.load(Ordering::Relaxed),
            requests_error_total: self.requests_error_total.load(Ordering::Relaxed),
            requests_cancelled_total: self.requests_cancelled_total.load(Ordering::Relaxed),
            avg_latency_ms: if finished == 0 {
                0
            } else {
                latency_total / finished
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finish_updates_counters_and_latency() {
        let m = Metrics::new();
        m.record_accept(true);
        m.record_accept(false);
        m.record_finish(FinishReason::Stop, Duration::from_millis(10));
        m.record_finish(FinishReason::Cancelled, Duration::from_millis(30));

        let snap = m.snapshot();
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.requests_in_flight, 0);
        assert_eq!(snap.requests_stream_total, 1);
        assert_eq!(snap.requests_cancelled_total, 1);
        assert_eq!(snap.requests_error_total, 0);
        assert_eq!(snap.avg_latency_ms, 20);
    }
}
