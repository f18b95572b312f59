//! Byte counters and throughput sampling for a transport endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cumulative and derived traffic counters, in kilobits per second.
#[derive(Debug, Default)]
pub struct Stats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    last_bytes_sent: AtomicU64,
    last_bytes_received: AtomicU64,
    kbps_sent_x100: AtomicU64,
    kbps_received_x100: AtomicU64,
}

impl Stats {
    pub fn record_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn kbps_sent(&self) -> f64 {
        self.kbps_sent_x100.load(Ordering::Relaxed) as f64 / 100.0
    }

    pub fn kbps_received(&self) -> f64 {
        self.kbps_received_x100.load(Ordering::Relaxed) as f64 / 100.0
    }

    /// Recomputes throughput from the delta since the last call, over
    /// `check_interval`. Intended to be invoked by a recurring scheduled
    /// callback that reschedules itself.
    pub fn recalculate(&self, check_interval: Duration) {
        let secs = check_interval.as_secs_f64().max(f64::EPSILON);

        let sent = self.bytes_sent.load(Ordering::Relaxed);
        let last_sent = self.last_bytes_sent.swap(sent, Ordering::Relaxed);
        let kbps_sent = ((sent.saturating_sub(last_sent)) as f64 / 1024.0) / secs;
        self.kbps_sent_x100
            .store((kbps_sent * 100.0) as u64, Ordering::Relaxed);

        let received = self.bytes_received.load(Ordering::Relaxed);
        let last_received = self.last_bytes_received.swap(received, Ordering::Relaxed);
        let kbps_received = ((received.saturating_sub(last_received)) as f64 / 1024.0) / secs;
        self.kbps_received_x100
            .store((kbps_received * 100.0) as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recalculate_reports_delta_since_last_call() {
        let stats = Stats::default();
        stats.record_sent(1024);
        stats.recalculate(Duration::from_secs(1));
        assert!((stats.kbps_sent() - 1.0).abs() < 0.01);

        // No new bytes sent -> next interval reports zero.
        stats.recalculate(Duration::from_secs(1));
        assert_eq!(stats.kbps_sent(), 0.0);
    }
}
