//! Acquisition filters.
//!
//! Before a ready job is handed to a worker, every filter that applies to its
//! spec is asked whether the job may start. A denial puts the trigger back to
//! waiting; it is looked at again after the scheduler's filter recheck delay.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;
use governor::{Quota, RateLimiter};
use sched_core::{JobSpec, RemoteService};

/// A filter's verdict for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Deny { reason: String },
}

impl FilterDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        FilterDecision::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, FilterDecision::Allow)
    }
}

/// A gate consulted before a job starts.
///
/// `admit` runs on the dispatch path and must not block.
pub trait AcquisitionFilter: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Whether this filter cares about jobs of `spec`.
    fn applies_to(&self, spec: &JobSpec) -> bool;

    fn admit(&self, spec: &JobSpec) -> FilterDecision;
}

/// The chain's verdict, naming the filter that denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny { filter: String, reason: String },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow)
    }
}

/// Ordered set of filters. The first denial wins.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn AcquisitionFilter>>,
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F: AcquisitionFilter>(mut self, filter: F) -> Self {
        self.push(filter);
        self
    }

    pub fn push<F: AcquisitionFilter>(&mut self, filter: F) {
        self.filters.push(Arc::new(filter));
    }

    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn admit(&self, spec: &JobSpec) -> Admission {
        for filter in self.filters.iter().filter(|f| f.applies_to(spec)) {
            if let FilterDecision::Deny { reason } = filter.admit(spec) {
                return Admission::Deny {
                    filter: filter.name().to_string(),
                    reason,
                };
            }
        }
        Admission::Allow
    }
}

/// A shared up/down flag maintained by some probe.
#[derive(Debug, Clone)]
pub struct Readiness {
    up: Arc<AtomicBool>,
}

/// Whether the network is reachable.
pub type NetworkState = Readiness;

/// Whether the database is ready.
pub type DatabaseState = Readiness;

impl Readiness {
    pub fn new(up: bool) -> Self {
        Self {
            up: Arc::new(AtomicBool::new(up)),
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Set the flag, returning whether it changed.
    pub fn set_up(&self, up: bool) -> bool {
        self.up.swap(up, Ordering::AcqRel) != up
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Denies jobs that need the network while it is down.
#[derive(Debug, Clone)]
pub struct NetworkRequiredFilter {
    network: NetworkState,
}

impl NetworkRequiredFilter {
    pub fn new(network: NetworkState) -> Self {
        Self { network }
    }
}

impl AcquisitionFilter for NetworkRequiredFilter {
    fn name(&self) -> &str {
        "NetworkRequired"
    }

    fn applies_to(&self, spec: &JobSpec) -> bool {
        spec.requires_network
    }

    fn admit(&self, _spec: &JobSpec) -> FilterDecision {
        if self.network.is_up() {
            FilterDecision::Allow
        } else {
            FilterDecision::deny("network is unavailable")
        }
    }
}

/// Denies jobs that need the database before it is ready.
#[derive(Debug, Clone)]
pub struct DatabaseRequiredFilter {
    database: DatabaseState,
}

impl DatabaseRequiredFilter {
    pub fn new(database: DatabaseState) -> Self {
        Self { database }
    }
}

impl AcquisitionFilter for DatabaseRequiredFilter {
    fn name(&self) -> &str {
        "DatabaseRequired"
    }

    fn applies_to(&self, spec: &JobSpec) -> bool {
        spec.requires_database
    }

    fn admit(&self, _spec: &JobSpec) -> FilterDecision {
        if self.database.is_up() {
            FilterDecision::Allow
        } else {
            FilterDecision::deny("database is not ready")
        }
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Token bucket shared by every job calling one remote service.
pub struct RateLimitedFilter {
    name: String,
    service: RemoteService,
    limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimitedFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedFilter")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl RateLimitedFilter {
    /// One start per `period`, with up to `burst` starts back to back.
    pub fn new(service: RemoteService, period: Duration, burst: u32) -> Self {
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);

        Self {
            name: format!("RateLimited({})", service.as_str()),
            service,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn service(&self) -> RemoteService {
        self.service
    }
}

impl AcquisitionFilter for RateLimitedFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self, spec: &JobSpec) -> bool {
        spec.rate_limited == Some(self.service)
    }

    fn admit(&self, _spec: &JobSpec) -> FilterDecision {
        match self.limiter.check() {
            Ok(()) => FilterDecision::Allow,
            Err(_) => FilterDecision::deny(format!(
                "rate limit reached for {}",
                self.service.as_str()
            )),
        }
    }
}

/// The standard chain: network, database, then one bucket per remote service.
pub fn default_filters(network: &NetworkState, database: &DatabaseState) -> FilterChain {
    FilterChain::new()
        .with(NetworkRequiredFilter::new(network.clone()))
        .with(DatabaseRequiredFilter::new(database.clone()))
        .with(RateLimitedFilter::new(
            RemoteService::Http,
            Duration::from_secs(2),
            5,
        ))
        .with(RateLimitedFilter::new(
            RemoteService::Udp,
            Duration::from_secs(4),
            1,
        ))
}
