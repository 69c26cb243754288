//! Read-request gate for the registry.
//!
//! Registrations and heartbeats are cheap and must always get through, so
//! rate limiting applies only to registry fetches. Delta fetches are much
//! smaller than full fetches, and a dropped delta usually triggers a
//! follow-up full fetch, so deltas get relatively higher priority: one
//! bucket caps the overall fetch rate (higher threshold) and a second caps
//! full fetches alone (lower threshold).
//!
//! Enforcement can stay off while the candidate counters size the
//! thresholds; in that mode the gate admits everything but records what it
//! would have dropped.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use regex::Regex;
use tracing::debug;

use crate::config::RegistryConfig;
use crate::constants::gate::DEFAULT_CLIENT_NAME;
use crate::constants::gate::DEFAULT_SERVER_NAME;
use crate::constants::gate::FETCH_TARGET_PATTERN;
use crate::rate_limit::RateUnit;
use crate::rate_limit::TokenBucket;
use crate::util::now_unix_ms;

/// Classification of an inbound read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTarget {
    /// Fetch of the entire registry snapshot.
    FullFetch,
    /// Fetch of only the changes since the client's last snapshot.
    DeltaFetch,
    /// Fetch of a single application's instances.
    ApplicationFetch,
    /// Anything else (writes, heartbeats); always admitted.
    Other,
}

/// Verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Pass the request through.
    Admitted,
    /// Drop the request with a 503-equivalent.
    Rejected,
}

/// Transport-agnostic view of an inbound request.
///
/// Embedders map their HTTP framing onto this: `identity` is the value of
/// the [`DiscoveryIdentity-Name`](crate::constants::gate::IDENTITY_HEADER)
/// header, if present.
#[derive(Debug, Clone, Copy)]
pub struct GateRequest<'a> {
    /// Request method, e.g. `GET`.
    pub method: &'a str,
    /// Request path, e.g. `/registry/apps/delta`.
    pub path: &'a str,
    /// Calling client's identity name, if the transport carried one.
    pub identity: Option<&'a str>,
}

/// Throttling statistics, split by enforcement state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateStatsSnapshot {
    /// Requests dropped while enforcement was on.
    pub rate_limited: u64,
    /// Full fetches dropped while enforcement was on.
    pub rate_limited_full_fetch: u64,
    /// Requests that would have been dropped while enforcement was off.
    pub rate_limited_candidates: u64,
    /// Full fetches that would have been dropped while enforcement was off.
    pub rate_limited_full_fetch_candidates: u64,
}

#[derive(Debug, Default)]
struct GateStats {
    rate_limited: AtomicU64,
    rate_limited_full_fetch: AtomicU64,
    rate_limited_candidates: AtomicU64,
    rate_limited_full_fetch_candidates: AtomicU64,
}

/// Rate-limiting gate over the registry's read endpoints.
pub struct RequestGate {
    config: RegistryConfig,
    target_re: Regex,
    /// Caps full and delta fetches together.
    registry_fetch_bucket: TokenBucket,
    /// Caps full fetches alone.
    full_fetch_bucket: TokenBucket,
    stats: GateStats,
}

impl RequestGate {
    /// Build a gate from the registry configuration.
    pub fn new(config: RegistryConfig) -> Self {
        let target_re = Regex::new(FETCH_TARGET_PATTERN).expect("fetch target pattern is valid");
        Self {
            config,
            target_re,
            registry_fetch_bucket: TokenBucket::new(RateUnit::Seconds),
            full_fetch_bucket: TokenBucket::new(RateUnit::Seconds),
            stats: GateStats::default(),
        }
    }

    /// Evaluate one request, using the wall clock for the buckets.
    pub fn evaluate(&self, request: &GateRequest<'_>) -> GateDecision {
        self.evaluate_at(request, now_unix_ms())
    }

    /// Evaluate one request at time `now_ms`.
    pub fn evaluate_at(&self, request: &GateRequest<'_>, now_ms: u64) -> GateDecision {
        let target = self.classify(request);
        if target == FetchTarget::Other {
            return GateDecision::Admitted;
        }
        if self.is_rate_limited(request, target, now_ms) {
            self.record_throttle(target);
            if self.config.rate_limiter_enabled {
                return GateDecision::Rejected;
            }
        }
        GateDecision::Admitted
    }

    /// Classify the request by method and URL shape.
    pub fn classify(&self, request: &GateRequest<'_>) -> FetchTarget {
        if request.method != "GET" {
            return FetchTarget::Other;
        }
        let Some(captures) = self.target_re.captures(request.path) else {
            debug!(path = %request.path, "path not matched by rate limiting gate");
            return FetchTarget::Other;
        };
        match captures.get(1).map(|m| m.as_str()) {
            None | Some("/") => FetchTarget::FullFetch,
            Some("/delta") => FetchTarget::DeltaFetch,
            Some(_) => FetchTarget::ApplicationFetch,
        }
    }

    /// Current throttling statistics.
    pub fn stats(&self) -> GateStatsSnapshot {
        GateStatsSnapshot {
            rate_limited: self.stats.rate_limited.load(Ordering::Relaxed),
            rate_limited_full_fetch: self.stats.rate_limited_full_fetch.load(Ordering::Relaxed),
            rate_limited_candidates: self.stats.rate_limited_candidates.load(Ordering::Relaxed),
            rate_limited_full_fetch_candidates: self
                .stats
                .rate_limited_full_fetch_candidates
                .load(Ordering::Relaxed),
        }
    }

    fn is_rate_limited(&self, request: &GateRequest<'_>, target: FetchTarget, now_ms: u64) -> bool {
        if self.is_privileged(request) {
            debug!(?target, "privileged request");
            return false;
        }
        if self.is_overloaded(target, now_ms) {
            debug!(?target, "overloaded request, discarding");
            return true;
        }
        debug!(?target, "request admitted");
        false
    }

    fn is_privileged(&self, request: &GateRequest<'_>) -> bool {
        if self.config.throttle_standard_clients {
            return false;
        }
        let Some(identity) = request.identity else {
            return false;
        };
        self.config.privileged_clients.iter().any(|c| c == identity)
            || identity == DEFAULT_CLIENT_NAME
            || identity == DEFAULT_SERVER_NAME
    }

    /// Consult the combined bucket for every fetch, and additionally the
    /// full-only bucket for full fetches. Both share one burst size.
    fn is_overloaded(&self, target: FetchTarget, now_ms: u64) -> bool {
        let burst = i64::from(self.config.burst_size);
        let mut overloaded = !self.registry_fetch_bucket.acquire(
            burst,
            i64::from(self.config.registry_fetch_average_rate),
            now_ms,
        );
        if target == FetchTarget::FullFetch {
            overloaded |= !self.full_fetch_bucket.acquire(
                burst,
                i64::from(self.config.full_fetch_average_rate),
                now_ms,
            );
        }
        overloaded
    }

    fn record_throttle(&self, target: FetchTarget) {
        if self.config.rate_limiter_enabled {
            self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            if target == FetchTarget::FullFetch {
                self.stats.rate_limited_full_fetch.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.stats.rate_limited_candidates.fetch_add(1, Ordering::Relaxed);
            if target == FetchTarget::FullFetch {
                self.stats
                    .rate_limited_full_fetch_candidates
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drain both buckets back to empty. Test hook.
    #[cfg(test)]
    fn reset(&self) {
        self.registry_fetch_bucket.reset();
        self.full_fetch_bucket.reset();
    }
}
