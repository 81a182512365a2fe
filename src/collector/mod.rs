/// Collector module
///
/// This module groups all logic responsible for:
/// - Holding the cached payload of ONE tracked server
/// - Counting its failed scrapes
/// - Performing scrapes through a `Fetcher`
/// - Driving scrapes periodically (runner submodule)
///
/// Design notes:
/// - A collector never removes itself. It reports
///   `FetchOutcome::ExceededThreshold` and the registry decides.
/// - Registry bookkeeping MUST NOT live here
///
pub mod fetcher;
pub mod runner;

use bytes::Bytes;
use std::sync::atomic::Ordering;
use tokio::sync::Mutex;

use crate::metrics::METRICS;
use crate::util::ServerId;
use fetcher::Fetcher;

/// Result of one `Collector::fetch_now` call, interpreted by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Payload replaced with a fresh body.
    Updated,

    /// Scrape failed; the stale payload is kept.
    Failed { failures: u32 },

    /// Scrape failed and the counter is now above the threshold.
    /// The collector should be evicted.
    ExceededThreshold { failures: u32 },
}

/// When a collector asks to be evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    /// Eviction once failures exceed this value
    pub max_failures: u32,

    /// Whether a successful scrape clears the counter
    pub reset_on_success: bool,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_on_success: false,
        }
    }
}

#[derive(Debug, Default)]
struct CollectorState {
    payload: Bytes,
    failures: u32,
}

/// Per-server unit of state: identity, cached payload, failure count.
///
/// The payload is never cleared on failure: a stale payload is served
/// rather than none.
#[derive(Debug)]
pub struct Collector {
    server: ServerId,
    policy: FailurePolicy,
    state: Mutex<CollectorState>,
}

impl Collector {
    pub fn new(server: ServerId, policy: FailurePolicy) -> Self {
        Self {
            server,
            policy,
            state: Mutex::new(CollectorState::default()),
        }
    }

    pub fn server(&self) -> &ServerId {
        &self.server
    }

    /// Performs one scrape and folds the result into the cached state.
    ///
    /// The lock is NOT held across the request, so overlapping scrapes of
    /// the same server are possible; the last one to finish wins.
    pub async fn fetch_now(&self, fetcher: &dyn Fetcher) -> FetchOutcome {
        let result = fetcher.fetch(&self.server).await;
        let mut state = self.state.lock().await;

        match result {
            Ok(body) => {
                log::debug!("<< Server {} got {} bytes of data", self.server, body.len());
                state.payload = body;
                if self.policy.reset_on_success {
                    state.failures = 0;
                }
                METRICS.fetches_ok.fetch_add(1, Ordering::Relaxed);
                FetchOutcome::Updated
            }
            Err(e) => {
                state.failures = state.failures.saturating_add(1);
                METRICS.fetch_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Failed to get data from {} ({}/{}): {e}",
                    self.server,
                    state.failures,
                    self.policy.max_failures
                );

                if state.failures > self.policy.max_failures {
                    FetchOutcome::ExceededThreshold {
                        failures: state.failures,
                    }
                } else {
                    FetchOutcome::Failed {
                        failures: state.failures,
                    }
                }
            }
        }
    }

    /// Last successfully scraped payload; empty until the first success.
    pub async fn cached_payload(&self) -> Bytes {
        self.state.lock().await.payload.clone()
    }

    pub async fn failures(&self) -> u32 {
        self.state.lock().await.failures
    }
}

/// In-memory fetcher used by the collector and registry tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::fetcher::{FetchError, Fetcher};
    use crate::util::ServerId;

    #[derive(Debug, Clone)]
    pub enum Reply {
        Body(&'static str),
        Status(u16),
        /// Never answers, like a server that accepted the connection and hung.
        Hang,
    }

    /// Answers per server with a scripted reply; unknown servers get 404.
    #[derive(Default)]
    pub struct ScriptedFetcher {
        replies: Mutex<HashMap<ServerId, Reply>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        pub fn reply(&self, server: &str, reply: Reply) {
            self.replies
                .lock()
                .unwrap()
                .insert(ServerId::parse(server).unwrap(), reply);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, server: &ServerId) -> Result<Bytes, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap().get(server).cloned();
            match reply {
                Some(Reply::Body(body)) => Ok(Bytes::from_static(body.as_bytes())),
                Some(Reply::Status(code)) => Err(FetchError::Status(code)),
                Some(Reply::Hang) => std::future::pending().await,
                None => Err(FetchError::Status(404)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Reply, ScriptedFetcher};
    use super::*;

    fn collector(policy: FailurePolicy) -> Collector {
        Collector::new(ServerId::parse("node-1:9100").unwrap(), policy)
    }

    #[tokio::test]
    async fn starts_empty() {
        let c = collector(FailurePolicy::default());
        assert!(c.cached_payload().await.is_empty());
        assert_eq!(c.failures().await, 0);
    }

    #[tokio::test]
    async fn success_replaces_payload() {
        let fetcher = ScriptedFetcher::default();
        let c = collector(FailurePolicy::default());

        fetcher.reply("node-1:9100", Reply::Body("a 1\n"));
        assert_eq!(c.fetch_now(&fetcher).await, FetchOutcome::Updated);
        fetcher.reply("node-1:9100", Reply::Body("a 2\n"));
        assert_eq!(c.fetch_now(&fetcher).await, FetchOutcome::Updated);

        assert_eq!(&c.cached_payload().await[..], b"a 2\n");
    }

    #[tokio::test]
    async fn failure_keeps_stale_payload() {
        let fetcher = ScriptedFetcher::default();
        let c = collector(FailurePolicy::default());

        fetcher.reply("node-1:9100", Reply::Body("a 1\n"));
        c.fetch_now(&fetcher).await;
        fetcher.reply("node-1:9100", Reply::Status(500));

        assert_eq!(
            c.fetch_now(&fetcher).await,
            FetchOutcome::Failed { failures: 1 }
        );
        assert_eq!(&c.cached_payload().await[..], b"a 1\n");
    }

    #[tokio::test]
    async fn exceeding_threshold_requests_eviction() {
        let fetcher = ScriptedFetcher::default();
        let c = collector(FailurePolicy {
            max_failures: 2,
            reset_on_success: false,
        });

        assert_eq!(c.fetch_now(&fetcher).await, FetchOutcome::Failed { failures: 1 });
        assert_eq!(c.fetch_now(&fetcher).await, FetchOutcome::Failed { failures: 2 });
        assert_eq!(
            c.fetch_now(&fetcher).await,
            FetchOutcome::ExceededThreshold { failures: 3 }
        );
    }

    #[tokio::test]
    async fn success_does_not_reset_counter_by_default() {
        let fetcher = ScriptedFetcher::default();
        let c = collector(FailurePolicy::default());

        c.fetch_now(&fetcher).await;
        fetcher.reply("node-1:9100", Reply::Body("a 1\n"));
        c.fetch_now(&fetcher).await;

        assert_eq!(c.failures().await, 1);
    }

    #[tokio::test]
    async fn success_resets_counter_when_configured() {
        let fetcher = ScriptedFetcher::default();
        let c = collector(FailurePolicy {
            max_failures: 5,
            reset_on_success: true,
        });

        c.fetch_now(&fetcher).await;
        c.fetch_now(&fetcher).await;
        fetcher.reply("node-1:9100", Reply::Body("a 1\n"));
        c.fetch_now(&fetcher).await;

        assert_eq!(c.failures().await, 0);
    }
}
