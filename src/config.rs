//! Centralized configuration for the discovery core.
//!
//! A single source of truth for the recognized options, supporting
//! environment variables with sensible defaults and validation. The
//! registry side and the client side load independently; embedders that
//! configure programmatically can build the structs directly.

use std::collections::HashMap;
use std::env;

use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

use crate::constants::lease::DEFAULT_DURATION_SECS;
use crate::constants::lease::DEFAULT_RENEWAL_INTERVAL_SECS;
use crate::constants::topology::DEFAULT_ZONE;

/// Configuration errors. Fatal at startup; a deployment running on a bad
/// option is worse than one that refuses to boot.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A supplied value failed parsing or validation.
    #[snafu(display("invalid value '{value}' for {key}: {reason}"))]
    InvalidValue {
        /// Environment variable name.
        key: String,
        /// Observed value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A required option was not supplied.
    #[snafu(display("missing required configuration {key}: {hint}"))]
    MissingRequired {
        /// Environment variable name.
        key: String,
        /// How to supply it.
        hint: String,
    },
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Registry-side configuration: the request gate and the eviction sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Whether the gate enforces (vs. only counts candidates).
    #[serde(default)]
    pub rate_limiter_enabled: bool,
    /// If true, clients named in the privileged lists are throttled too.
    #[serde(default)]
    pub throttle_standard_clients: bool,
    /// Additional identity names treated as privileged.
    #[serde(default)]
    pub privileged_clients: Vec<String>,
    /// Shared burst ceiling for both gate buckets.
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// Combined full+delta fetch rate, per second.
    #[serde(default = "default_registry_fetch_rate")]
    pub registry_fetch_average_rate: u32,
    /// Full-fetch-only rate, per second.
    #[serde(default = "default_full_fetch_rate")]
    pub full_fetch_average_rate: u32,
    /// Percentage of the expected registry size one sweep may evict, 0-100.
    #[serde(default = "default_allowed_percentage_drop")]
    pub allowed_percentage_drop: u32,
}

fn default_burst_size() -> u32 {
    10
}

fn default_registry_fetch_rate() -> u32 {
    500
}

fn default_full_fetch_rate() -> u32 {
    100
}

fn default_allowed_percentage_drop() -> u32 {
    20
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            rate_limiter_enabled: false,
            throttle_standard_clients: false,
            privileged_clients: Vec::new(),
            burst_size: default_burst_size(),
            registry_fetch_average_rate: default_registry_fetch_rate(),
            full_fetch_average_rate: default_full_fetch_rate(),
            allowed_percentage_drop: default_allowed_percentage_drop(),
        }
    }
}

impl RegistryConfig {
    /// Load registry configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let allowed_percentage_drop: u32 = parse_env("ALLOWED_PERCENTAGE_DROP", default_allowed_percentage_drop())?;
        if allowed_percentage_drop > 100 {
            return Err(ConfigError::InvalidValue {
                key: "ALLOWED_PERCENTAGE_DROP".to_string(),
                value: allowed_percentage_drop.to_string(),
                reason: "must be a percentage within 0..=100".to_string(),
            });
        }
        let privileged_clients = env::var("RATE_LIMITER_PRIVILEGED_CLIENTS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            rate_limiter_enabled: parse_env("RATE_LIMITER_ENABLED", false)?,
            throttle_standard_clients: parse_env("RATE_LIMITER_THROTTLE_STANDARD_CLIENTS", false)?,
            privileged_clients,
            burst_size: parse_env("RATE_LIMITER_BURST_SIZE", default_burst_size())?,
            registry_fetch_average_rate: parse_env(
                "RATE_LIMITER_REGISTRY_FETCH_AVERAGE_RATE",
                default_registry_fetch_rate(),
            )?,
            full_fetch_average_rate: parse_env(
                "RATE_LIMITER_FULL_FETCH_AVERAGE_RATE",
                default_full_fetch_rate(),
            )?,
            allowed_percentage_drop,
        })
    }
}

/// Client-side configuration: topology, DNS discovery, and lease timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Region this client lives in.
    #[serde(default = "default_region")]
    pub region: String,
    /// Static zone list per region; consulted by the static zone source.
    #[serde(default)]
    pub availability_zones: HashMap<String, Vec<String>>,
    /// If true, the topology mapper discovers zones via DNS TXT records.
    #[serde(default)]
    pub use_dns_for_zones: bool,
    /// Base domain for DNS TXT lookups (`txt.<region>.<domain>`).
    #[serde(default)]
    pub discovery_domain: Option<String>,
    /// Port composed into discovered server URLs.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Context path composed into discovered server URLs.
    #[serde(default = "default_discovery_context")]
    pub discovery_context: String,
    /// Heartbeat interval pushed into the instance lease.
    #[serde(default = "default_lease_renewal")]
    pub lease_renewal_interval_secs: u32,
    /// Lease duration pushed into the instance lease.
    #[serde(default = "default_lease_duration")]
    pub lease_expiration_duration_secs: u32,
    /// Ordered descriptor field names used to pick the advertised address.
    #[serde(default)]
    pub default_address_resolution_order: Vec<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_discovery_port() -> u16 {
    8080
}

fn default_discovery_context() -> String {
    "v2".to_string()
}

fn default_lease_renewal() -> u32 {
    DEFAULT_RENEWAL_INTERVAL_SECS
}

fn default_lease_duration() -> u32 {
    DEFAULT_DURATION_SECS
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            availability_zones: HashMap::new(),
            use_dns_for_zones: false,
            discovery_domain: None,
            discovery_port: default_discovery_port(),
            discovery_context: default_discovery_context(),
            lease_renewal_interval_secs: default_lease_renewal(),
            lease_expiration_duration_secs: default_lease_duration(),
            default_address_resolution_order: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Load client configuration from environment variables.
    ///
    /// `AVAILABILITY_ZONES` uses the form
    /// `region1=zoneA,zoneB;region2=zoneC`.
    pub fn load() -> Result<Self, ConfigError> {
        let availability_zones = match env::var("AVAILABILITY_ZONES") {
            Err(_) => HashMap::new(),
            Ok(raw) => parse_zone_map(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "AVAILABILITY_ZONES".to_string(),
                value: raw.clone(),
                reason: "expected region1=zoneA,zoneB;region2=zoneC".to_string(),
            })?,
        };

        Ok(Self {
            region: env::var("DISCOVERY_REGION").unwrap_or_else(|_| default_region()),
            availability_zones,
            use_dns_for_zones: parse_env("USE_DNS_FOR_ZONES", false)?,
            discovery_domain: env::var("DISCOVERY_SERVER_DOMAIN").ok(),
            discovery_port: parse_env("DISCOVERY_SERVER_PORT", default_discovery_port())?,
            discovery_context: env::var("DISCOVERY_SERVER_CONTEXT")
                .unwrap_or_else(|_| default_discovery_context()),
            lease_renewal_interval_secs: parse_env(
                "LEASE_RENEWAL_INTERVAL_IN_SECONDS",
                default_lease_renewal(),
            )?,
            lease_expiration_duration_secs: parse_env(
                "LEASE_EXPIRATION_DURATION_IN_SECONDS",
                default_lease_duration(),
            )?,
            default_address_resolution_order: env::var("DEFAULT_ADDRESS_RESOLUTION_ORDER")
                .map(|raw| raw.split(',').map(str::trim).map(String::from).collect())
                .unwrap_or_default(),
        })
    }

    /// Zones configured for `region`, or the `defaultZone` sentinel when
    /// the region has no explicit entry.
    pub fn availability_zones(&self, region: &str) -> Vec<String> {
        match self.availability_zones.get(region) {
            Some(zones) if !zones.is_empty() => zones.clone(),
            _ => vec![DEFAULT_ZONE.to_string()],
        }
    }
}

fn parse_zone_map(raw: &str) -> Option<HashMap<String, Vec<String>>> {
    let mut map = HashMap::new();
    for entry in raw.split(';').filter(|e| !e.trim().is_empty()) {
        let (region, zones) = entry.split_once('=')?;
        let region = region.trim();
        if region.is_empty() {
            return None;
        }
        let zones: Vec<String> = zones
            .split(',')
            .map(str::trim)
            .filter(|z| !z.is_empty())
            .map(String::from)
            .collect();
        map.insert(region.to_string(), zones);
    }
    Some(map)
}

/// Cloud metadata fetch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudMetadataConfig {
    /// Attempts per metadata key before giving up on it.
    #[serde(default = "default_metadata_retries")]
    pub num_retries: u32,
    /// Connect timeout per attempt, milliseconds.
    #[serde(default = "default_metadata_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Read timeout per attempt, milliseconds.
    #[serde(default = "default_metadata_read_timeout")]
    pub read_timeout_ms: u64,
    /// Whether failed metadata lookups are logged at warn level.
    #[serde(default)]
    pub log_metadata_errors: bool,
    /// Abort the whole build when the instance id cannot be fetched.
    #[serde(default = "default_fail_fast")]
    pub fail_fast_on_first_load: bool,
}

fn default_metadata_retries() -> u32 {
    3
}

fn default_metadata_connect_timeout() -> u64 {
    3_000
}

fn default_metadata_read_timeout() -> u64 {
    5_000
}

fn default_fail_fast() -> bool {
    true
}

impl Default for CloudMetadataConfig {
    fn default() -> Self {
        Self {
            num_retries: default_metadata_retries(),
            connect_timeout_ms: default_metadata_connect_timeout(),
            read_timeout_ms: default_metadata_read_timeout(),
            log_metadata_errors: false,
            fail_fast_on_first_load: default_fail_fast(),
        }
    }
}

impl CloudMetadataConfig {
    /// Load cloud metadata configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            num_retries: parse_env("CLOUD_METADATA_NUM_RETRIES", default_metadata_retries())?,
            connect_timeout_ms: parse_env(
                "CLOUD_METADATA_CONNECT_TIMEOUT_MS",
                default_metadata_connect_timeout(),
            )?,
            read_timeout_ms: parse_env(
                "CLOUD_METADATA_READ_TIMEOUT_MS",
                default_metadata_read_timeout(),
            )?,
            log_metadata_errors: parse_env("CLOUD_METADATA_LOG_ERRORS", false)?,
            fail_fast_on_first_load: parse_env("CLOUD_METADATA_FAIL_FAST", default_fail_fast())?,
        })
    }
}
