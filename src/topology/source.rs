//! Zone sources feeding the topology mapper.

use async_trait::async_trait;
use tracing::warn;

use crate::config::ClientConfig;
use crate::config::ConfigError;
use crate::dns::DnsResolver;

/// Provider of the availability zones belonging to a region.
///
/// Implementations report what they know; an empty answer (or the lone
/// `defaultZone` sentinel) makes the mapper fall back to its built-in
/// default table.
#[async_trait]
pub trait ZoneSource: Send + Sync {
    /// All zones in `region`, as far as this source knows.
    async fn zones_for_region(&self, region: &str) -> Vec<String>;
}

/// Zone source answering from the static `availability_zones`
/// configuration.
pub struct StaticZoneSource {
    config: ClientConfig,
}

impl StaticZoneSource {
    /// Wrap the client configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ZoneSource for StaticZoneSource {
    async fn zones_for_region(&self, region: &str) -> Vec<String> {
        self.config.availability_zones(region)
    }
}

/// Zone source discovering zones from the DNS TXT records at
/// `txt.<region>.<domain>`.
#[derive(Debug)]
pub struct DnsZoneSource {
    resolver: DnsResolver,
    domain: String,
    port: u16,
    context: String,
}

impl DnsZoneSource {
    /// Build from the client configuration; requires `discovery_domain`.
    pub fn from_config(resolver: DnsResolver, config: &ClientConfig) -> Result<Self, ConfigError> {
        let domain = config
            .discovery_domain
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "DISCOVERY_SERVER_DOMAIN".to_string(),
                hint: "DNS-based zone discovery needs the TXT record base domain".to_string(),
            })?;
        Ok(Self {
            resolver,
            domain,
            port: config.discovery_port,
            context: config.discovery_context.clone(),
        })
    }
}

#[async_trait]
impl ZoneSource for DnsZoneSource {
    async fn zones_for_region(&self, region: &str) -> Vec<String> {
        let urls_by_zone = self
            .resolver
            .zone_discovery_urls(region, &self.domain, self.port, &self.context)
            .await;
        if urls_by_zone.is_empty() {
            warn!(region = %region, domain = %self.domain, "DNS discovery returned no zones");
        }
        urls_by_zone.into_keys().collect()
    }
}
