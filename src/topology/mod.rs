//! Availability-zone to region topology mapping.
//!
//! A multi-region deployment needs to know which region a given
//! availability zone belongs to, both to find registry endpoints and to
//! tell local instances apart from remote ones. The mapper maintains a
//! `zone -> region` table rebuilt from a [`ZoneSource`] (static
//! configuration or DNS TXT discovery), with a built-in default table so a
//! misconfigured deployment still boots with sensible behavior for the
//! canonical cloud regions.

mod region_checker;
mod source;

use std::collections::HashMap;
use std::sync::Arc;

pub use region_checker::InstanceRegionChecker;
pub use source::DnsZoneSource;
pub use source::StaticZoneSource;
pub use source::ZoneSource;

use parking_lot::Mutex as PlMutex;
use parking_lot::RwLock;
use snafu::Snafu;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::constants::topology::DEFAULT_ZONE;

/// Topology configuration errors. Fatal at startup: a region that must be
/// fetched but has no zone information cannot be silently skipped.
#[derive(Debug, Snafu)]
pub enum TopologyError {
    /// A remote region yielded no zone information and has no default
    /// mapping to fall back on.
    #[snafu(display(
        "no availability zone information available for remote region {region}; \
         this is required if registry information for this region is configured to be fetched"
    ))]
    NoZoneInformation {
        /// The region without zone information.
        region: String,
    },
}

/// Built-in default region to zones table.
///
/// Seeds the canonical cloud regions so a deployment that forgot to
/// configure zones still resolves them.
fn default_region_zones() -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    let seed = |map: &mut HashMap<String, Vec<String>>, region: &str, suffixes: &[&str]| {
        map.insert(
            region.to_string(),
            suffixes.iter().map(|s| format!("{}{}", region, s)).collect(),
        );
    };
    seed(&mut map, "us-east-1", &["a", "c", "d", "e"]);
    seed(&mut map, "us-west-1", &["a", "c"]);
    seed(&mut map, "us-west-2", &["a", "b", "c"]);
    seed(&mut map, "eu-west-1", &["a", "b", "c"]);
    map
}

/// Mapper from availability zone to region.
///
/// Rebuilds are serialized and atomic from the caller's perspective:
/// lookups observe either the pre-rebuild table or the post-rebuild table,
/// never a partial merge.
pub struct AzToRegionMapper {
    source: Arc<dyn ZoneSource>,
    /// Serializes rebuilds, which await on the zone source.
    rebuild_lock: AsyncMutex<()>,
    regions_to_fetch: PlMutex<Vec<String>>,
    az_to_region: RwLock<HashMap<String, String>>,
    default_region_zones: HashMap<String, Vec<String>>,
}

impl AzToRegionMapper {
    /// Create a mapper over the given zone source. The table is empty
    /// until [`set_regions_to_fetch`](Self::set_regions_to_fetch) runs.
    pub fn new(source: Arc<dyn ZoneSource>) -> Self {
        Self {
            source,
            rebuild_lock: AsyncMutex::new(()),
            regions_to_fetch: PlMutex::new(Vec::new()),
            az_to_region: RwLock::new(HashMap::new()),
            default_region_zones: default_region_zones(),
        }
    }

    /// Update the set of regions this mapper knows about and rebuild the
    /// table from the zone source.
    ///
    /// Per region: zones reported by the source map to that region; an
    /// empty report (or the lone `defaultZone` sentinel) falls back to the
    /// built-in default table; a region in neither is a fatal
    /// configuration error, and the pre-rebuild table stays in place.
    pub async fn set_regions_to_fetch(&self, regions: &[String]) -> Result<(), TopologyError> {
        let _rebuild = self.rebuild_lock.lock().await;
        *self.regions_to_fetch.lock() = regions.to_vec();
        info!(regions = ?regions, "fetching availability zone to region mapping");

        let mut rebuilt: HashMap<String, String> = HashMap::new();
        for remote_region in regions {
            let zones = self.source.zones_for_region(remote_region).await;
            let unusable =
                zones.is_empty() || (zones.len() == 1 && zones[0] == DEFAULT_ZONE);
            if unusable {
                info!(
                    region = %remote_region,
                    "no availability zone information for remote region, checking default mapping"
                );
                let default_zones = self
                    .default_region_zones
                    .get(remote_region)
                    .ok_or_else(|| TopologyError::NoZoneInformation {
                        region: remote_region.clone(),
                    })?;
                for zone in default_zones {
                    rebuilt.insert(zone.clone(), remote_region.clone());
                }
            } else {
                for zone in zones {
                    rebuilt.insert(zone, remote_region.clone());
                }
            }
        }

        info!(mapping = ?rebuilt, "availability zone to region mapping for all remote regions");
        *self.az_to_region.write() = rebuilt;
        Ok(())
    }

    /// Rebuild the table for the last requested regions; for sources that
    /// depend on an external system (DNS), this picks up changes.
    pub async fn refresh(&self) -> Result<(), TopologyError> {
        let regions = self.regions_to_fetch.lock().clone();
        info!("refreshing availability zone to region mappings");
        self.set_regions_to_fetch(&regions).await
    }

    /// Region for `availability_zone`, or `None` meaning "local region".
    ///
    /// Zones absent from the table fall back to a naming heuristic: zones
    /// usually follow `<region><one letter>`, so the zone minus its last
    /// character is accepted when it names a known region.
    pub fn region_for_zone(&self, availability_zone: &str) -> Option<String> {
        let map = self.az_to_region.read();
        if let Some(region) = map.get(availability_zone) {
            return Some(region.clone());
        }
        if availability_zone.is_empty() {
            return None;
        }
        let mut chars = availability_zone.chars();
        chars.next_back();
        let possible_region = chars.as_str();
        if map.values().any(|region| region == possible_region) {
            return Some(possible_region.to_string());
        }
        None
    }
}
