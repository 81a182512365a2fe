use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::time::sleep;

/// Global runtime metrics of the proxy itself.
///
/// Purpose:
/// - Track how many servers are scraped
/// - Track scrape outcomes and evictions
/// - Track how much aggregate data is served
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe in async + multithreaded contexts
///
/// These counters only feed the periodic log line; they are not
/// part of the aggregated payload served on `/metrics`.
#[derive(Default)]
pub struct RuntimeMetrics {
    // Registry
    pub servers_tracked: AtomicUsize,
    pub schedules_installed: AtomicUsize,

    // Scrapes
    pub fetches_ok: AtomicUsize,
    pub fetch_failures: AtomicUsize,
    pub evictions: AtomicUsize,

    // Serving
    pub aggregate_requests: AtomicUsize,
    pub bytes_served: AtomicUsize,
}

impl RuntimeMetrics {
    pub fn summary(&self) -> String {
        format!(
            "servers={} schedules={} fetch_ok={} fetch_err={} evicted={} scrapes_served={} bytes_served={}",
            self.servers_tracked.load(Ordering::Relaxed),
            self.schedules_installed.load(Ordering::Relaxed),
            self.fetches_ok.load(Ordering::Relaxed),
            self.fetch_failures.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
            self.aggregate_requests.load(Ordering::Relaxed),
            self.bytes_served.load(Ordering::Relaxed),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));

/// Starts the periodic, low-noise metrics reporter.
///
/// A zero period disables reporting.
pub fn spawn_reporter(period: Duration) {
    if period.is_zero() {
        return;
    }

    tokio::spawn(async move {
        loop {
            sleep(period).await;
            log::info!("[METRICS] {}", METRICS.summary());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reflects_counters() {
        let metrics = RuntimeMetrics::default();
        metrics.fetches_ok.fetch_add(3, Ordering::Relaxed);
        metrics.evictions.fetch_add(1, Ordering::Relaxed);

        let line = metrics.summary();
        assert!(line.contains("fetch_ok=3"));
        assert!(line.contains("evicted=1"));
        assert!(line.contains("servers=0"));
    }
}
