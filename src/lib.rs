//! Beacon library entry point.
//!
//! Beacon is the hard core of a service-discovery system: instances register
//! with a central registry, renew their registration through periodic
//! heartbeats, and discover peers by fetching a view of the registry. This
//! crate provides the registry-side admission machinery (token-bucket rate
//! limiting, the read-request gate, the eviction policy that bounds a sweep)
//! and the client-side machinery (supervised periodic tasks, zone/region
//! topology, DNS-based endpoint discovery, and the authoritative instance
//! descriptor with its manager).
//!
//! Wire formats, replication, and authentication are deliberately out of
//! scope; embedders adapt their transport to the abstract request gate and
//! drive the periodic jobs with [`supervisor::TimedSupervisorTask`].

#![warn(missing_docs)]

/// Cloud instance-metadata fetching for cloud-hosted deployments.
pub mod cloud;
/// Environment-backed configuration with defaults and validation.
pub mod config;
/// Centralized constants, grouped by concern.
pub mod constants;
/// Low-level DNS lookups: A-record chase, CNAME resolution, TXT listing.
pub mod dns;
/// Eviction policy bounding how many stale registrations one sweep may expire.
pub mod eviction;
/// Read-request gate classifying inbound fetches and applying rate limits.
pub mod gate;
/// Instance descriptor, status propagation, and the instance manager.
pub mod instance;
/// Lock-free token-bucket rate limiter.
pub mod rate_limit;
/// Supervised periodic task runner with timeouts and exponential back-off.
pub mod supervisor;
/// Availability-zone to region topology mapping.
pub mod topology;

mod util;

pub use config::ClientConfig;
pub use config::CloudMetadataConfig;
pub use config::ConfigError;
pub use config::RegistryConfig;
pub use eviction::PercentageDropEvictionStrategy;
pub use eviction::RenewalAverage;
pub use gate::FetchTarget;
pub use gate::GateDecision;
pub use gate::GateRequest;
pub use gate::RequestGate;
pub use instance::InstanceInfo;
pub use instance::InstanceManager;
pub use instance::InstanceStatus;
pub use instance::StatusChangeEvent;
pub use instance::StatusChangeListener;
pub use rate_limit::RateUnit;
pub use rate_limit::TokenBucket;
pub use supervisor::TimedSupervisorTask;
pub use supervisor::WorkerPool;
pub use topology::AzToRegionMapper;
pub use topology::InstanceRegionChecker;
pub use topology::ZoneSource;
