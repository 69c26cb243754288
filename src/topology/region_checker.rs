//! Region resolution for peer instance descriptors.

use std::sync::Arc;

use tracing::warn;

use super::AzToRegionMapper;
use crate::cloud::MetadataKey;
use crate::instance::DataCenterInfo;
use crate::instance::InstanceInfo;

/// Resolves which region a peer instance lives in, and whether that is
/// the local region.
pub struct InstanceRegionChecker {
    mapper: Arc<AzToRegionMapper>,
    local_region: String,
}

impl InstanceRegionChecker {
    /// Create a checker for `local_region`.
    pub fn new(mapper: Arc<AzToRegionMapper>, local_region: impl Into<String>) -> Self {
        Self {
            mapper,
            local_region: local_region.into(),
        }
    }

    /// Region of `instance`, derived from its cloud availability-zone
    /// metadata. `None` means the instance could not be placed, which
    /// callers treat as local.
    pub fn instance_region(&self, instance: &InstanceInfo) -> Option<String> {
        match instance.data_center_info() {
            DataCenterInfo::Cloud(cloud) => {
                let availability_zone = cloud.get(MetadataKey::AvailabilityZone)?;
                if availability_zone.is_empty() {
                    return None;
                }
                self.mapper.region_for_zone(availability_zone)
            }
            DataCenterInfo::MyOwn => {
                warn!(
                    instance_id = %instance.instance_id(),
                    app = %instance.app_name(),
                    local_region = %self.local_region,
                    "cannot resolve region without cloud data center info"
                );
                None
            }
        }
    }

    /// Whether `instance_region` is the local region; no region counts as
    /// local.
    pub fn is_local_region(&self, instance_region: Option<&str>) -> bool {
        instance_region.is_none_or(|region| region == self.local_region)
    }

    /// The configured local region.
    pub fn local_region(&self) -> &str {
        &self.local_region
    }

    /// The mapper this checker consults.
    pub fn mapper(&self) -> &Arc<AzToRegionMapper> {
        &self.mapper
    }
}
