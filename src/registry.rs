//! Registry of tracked metrics servers.
//!
//! The registry owns:
//! - One `Collector` per tracked server, in insertion order
//! - The poll interval and the active `Schedule`
//!
//! and exposes the operations the HTTP surface maps onto: add, remove,
//! set the interval, list ids, aggregate payloads.
//!
//! Eviction is driven by `FetchOutcome::ExceededThreshold`, returned by
//! the collector to the scrape task, which then calls back into the
//! registry. Collectors hold no reference to the registry.

use std::net::IpAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::collector::fetcher::Fetcher;
use crate::collector::runner::Schedule;
use crate::collector::{Collector, FailurePolicy, FetchOutcome};
use crate::config::Config;
use crate::metrics::METRICS;
use crate::util::{self, ServerId, ServerIdError};

/// Longest accepted poll interval (one week).
pub const MAX_POLL_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Timeout must be between 1 and {MAX_POLL_INTERVAL_SECS} seconds, got {0}")]
    InvalidInterval(i64),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Server or port is not provided")]
    NotProvided,

    #[error("Invalid server: {0}")]
    Invalid(#[from] ServerIdError),
}

/// Everything about an inbound request that can name a target server.
///
/// Built by the HTTP layer; resolution itself does not depend on the
/// web framework.
#[derive(Debug, Default, Clone)]
pub struct RequestContext {
    /// `server` query parameter
    pub server: Option<String>,

    /// `port` query parameter
    pub port: Option<String>,

    /// `X-Forwarded-For` header
    pub forwarded_for: Option<String>,

    /// `X-Real-IP` header
    pub real_ip: Option<String>,

    /// TCP peer of the connection
    pub peer: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub poll_interval: Duration,
    pub policy: FailurePolicy,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            policy: FailurePolicy::default(),
        }
    }
}

impl From<&Config> for RegistrySettings {
    fn from(cfg: &Config) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            policy: FailurePolicy {
                max_failures: cfg.max_failures,
                reset_on_success: cfg.reset_failures_on_success,
            },
        }
    }
}

struct Scheduling {
    interval: Duration,
    schedule: Option<Schedule>,
    installs: usize,
}

struct Inner {
    fetcher: Arc<dyn Fetcher>,
    policy: FailurePolicy,
    collectors: RwLock<Vec<Arc<Collector>>>,
    scheduling: Mutex<Scheduling>,
}

/// Cheaply cloneable handle; all clones share one registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Creates an empty registry. No schedule runs until the first
    /// `add` or `set_poll_interval`.
    pub fn new(fetcher: Arc<dyn Fetcher>, settings: RegistrySettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                policy: settings.policy,
                collectors: RwLock::new(Vec::new()),
                scheduling: Mutex::new(Scheduling {
                    interval: settings.poll_interval,
                    schedule: None,
                    installs: 0,
                }),
            }),
        }
    }

    /// Determines which server a registration request talks about.
    ///
    /// Order:
    /// 1. explicit `server`
    /// 2. `port` combined with the caller address, taken from
    ///    X-Forwarded-For, then X-Real-IP, then the TCP peer
    ///
    /// Empty parameters count as absent.
    pub fn resolve_server_identity(ctx: &RequestContext) -> Result<ServerId, ResolveError> {
        if let Some(server) = non_empty(&ctx.server) {
            return Ok(ServerId::parse(server)?);
        }

        let Some(port) = non_empty(&ctx.port) else {
            return Err(ResolveError::NotProvided);
        };

        log::debug!(
            "Server is not provided. port={port} x-forwarded-for={:?} x-real-ip={:?} peer={:?}",
            ctx.forwarded_for,
            ctx.real_ip,
            ctx.peer
        );

        let host = non_empty(&ctx.forwarded_for)
            .or(non_empty(&ctx.real_ip))
            .and_then(util::last_forwarded_hop)
            .map(str::to_string)
            .or_else(|| ctx.peer.map(util::peer_host))
            .ok_or(ResolveError::NotProvided)?;

        let server = ServerId::from_host_and_port(&host, port)?;
        log::debug!("Resolved server {server}");
        Ok(server)
    }

    /// Starts tracking `server`. Idempotent.
    ///
    /// Returns the tracked ids after the call.
    pub async fn add(&self, server: ServerId) -> Vec<ServerId> {
        let ids = {
            let mut collectors = self.inner.collectors.write().await;
            if !collectors.iter().any(|c| c.server() == &server) {
                log::info!("Adding server {server}");
                collectors.push(Arc::new(Collector::new(server, self.inner.policy)));
                METRICS
                    .servers_tracked
                    .store(collectors.len(), Ordering::Relaxed);
            }
            ids_of(&collectors)
        };

        let mut scheduling = self.inner.scheduling.lock().await;
        if scheduling.schedule.is_none() {
            self.install_schedule(&mut scheduling);
        }

        ids
    }

    /// Stops tracking `server`. Unknown servers are a no-op.
    pub async fn remove(&self, server: &ServerId) -> Vec<ServerId> {
        let mut collectors = self.inner.collectors.write().await;
        let before = collectors.len();
        collectors.retain(|c| c.server() != server);

        if collectors.len() != before {
            log::info!("Removing server {server}");
            METRICS
                .servers_tracked
                .store(collectors.len(), Ordering::Relaxed);
        } else {
            log::debug!("Remove of untracked server {server} ignored");
        }

        ids_of(&collectors)
    }

    /// Involuntary removal of a collector that exceeded the failure
    /// threshold.
    ///
    /// Only this exact instance is removed: if the server was removed and
    /// added again in the meantime, the fresh collector stays.
    async fn evict(&self, collector: &Arc<Collector>, failures: u32) {
        let mut collectors = self.inner.collectors.write().await;
        let Some(pos) = collectors.iter().position(|c| Arc::ptr_eq(c, collector)) else {
            return;
        };

        collectors.remove(pos);
        METRICS
            .servers_tracked
            .store(collectors.len(), Ordering::Relaxed);
        METRICS.evictions.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "!! Server {} is unresponsive after {failures} failed scrapes => removing from server list",
            collector.server()
        );
    }

    /// Changes the poll interval.
    ///
    /// Values outside `1..=MAX_POLL_INTERVAL_SECS` are rejected and leave
    /// the interval as is.
    /// The schedule is replaced only when the value changes, or when
    /// no schedule runs yet. Returns the effective interval.
    pub async fn set_poll_interval(&self, secs: i64) -> Result<Duration, RegistryError> {
        let period = u64::try_from(secs)
            .ok()
            .filter(|s| (1..=MAX_POLL_INTERVAL_SECS).contains(s))
            .map(Duration::from_secs)
            .ok_or(RegistryError::InvalidInterval(secs))?;

        let mut scheduling = self.inner.scheduling.lock().await;
        if period != scheduling.interval || scheduling.schedule.is_none() {
            scheduling.interval = period;
            self.install_schedule(&mut scheduling);
        }

        Ok(scheduling.interval)
    }

    /// Replaces the active schedule (if any) with one at the current
    /// interval. Runs under the scheduling lock, so two schedules never
    /// coexist.
    fn install_schedule(&self, scheduling: &mut Scheduling) {
        let owner = Arc::downgrade(&self.inner);
        let schedule = Schedule::start(scheduling.interval, move || {
            let owner = owner.clone();
            async move {
                match owner.upgrade() {
                    Some(inner) => {
                        Registry { inner }.fetch_all().await;
                        ControlFlow::Continue(())
                    }
                    None => ControlFlow::Break(()),
                }
            }
        });

        if let Some(previous) = scheduling.schedule.replace(schedule) {
            previous.cancel();
        }
        scheduling.installs += 1;
        METRICS.schedules_installed.fetch_add(1, Ordering::Relaxed);

        log::info!(
            "Data collection interval is set to {} sec",
            scheduling.interval.as_secs()
        );
    }

    /// Dispatches one scrape per tracked collector.
    ///
    /// Each scrape runs as its own task, so a hung server never delays
    /// the others or the next tick. The returned handles may be awaited
    /// or simply dropped.
    pub async fn fetch_all(&self) -> Vec<JoinHandle<()>> {
        let collectors = self.inner.collectors.read().await.clone();
        log::debug!("Start collecting data from {} servers", collectors.len());

        collectors
            .into_iter()
            .map(|collector| {
                let registry = self.clone();
                tokio::spawn(async move {
                    let outcome = collector.fetch_now(registry.inner.fetcher.as_ref()).await;
                    if let FetchOutcome::ExceededThreshold { failures } = outcome {
                        registry.evict(&collector, failures).await;
                    }
                })
            })
            .collect()
    }

    /// Concatenation of every cached payload, in insertion order, with
    /// no separator added.
    pub async fn aggregate(&self) -> Bytes {
        let collectors = self.inner.collectors.read().await.clone();

        let mut data = BytesMut::new();
        for collector in &collectors {
            let payload = collector.cached_payload().await;
            log::debug!(
                ">> Server {} returns {} bytes of data",
                collector.server(),
                payload.len()
            );
            data.extend_from_slice(&payload);
        }

        METRICS.aggregate_requests.fetch_add(1, Ordering::Relaxed);
        METRICS.bytes_served.fetch_add(data.len(), Ordering::Relaxed);
        data.freeze()
    }

    /// Snapshot of tracked ids, in insertion order.
    pub async fn list_ids(&self) -> Vec<ServerId> {
        ids_of(&self.inner.collectors.read().await)
    }

    /// Configured poll interval.
    pub async fn poll_interval(&self) -> Duration {
        self.inner.scheduling.lock().await.interval
    }

    /// Period of the running schedule, `None` before collection started.
    pub async fn schedule_interval(&self) -> Option<Duration> {
        self.inner
            .scheduling
            .lock()
            .await
            .schedule
            .as_ref()
            .map(Schedule::period)
    }

    /// How many schedules were installed over the registry's lifetime.
    pub async fn schedules_installed(&self) -> usize {
        self.inner.scheduling.lock().await.installs
    }

    /// Cancels the schedule. Scrapes already in flight still complete.
    pub async fn shutdown(&self) {
        if let Some(schedule) = self.inner.scheduling.lock().await.schedule.take() {
            schedule.cancel();
            log::info!("Data collection stopped");
        }
    }
}

fn ids_of(collectors: &[Arc<Collector>]) -> Vec<ServerId> {
    collectors.iter().map(|c| c.server().clone()).collect()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
