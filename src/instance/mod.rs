//! The authoritative instance descriptor.
//!
//! One [`InstanceInfo`] identifies one running process for the lifetime of
//! that process: who it is (id, application), where it listens (host, ip,
//! ports, virtual host names), whether it should receive traffic
//! ([`InstanceStatus`]), how its lease is renewed, and where it runs
//! ([`DataCenterInfo`]). The descriptor carries two monotonic dirty flags
//! telling the push pipeline that the registry's copy is stale; the paths
//! in this crate only ever set them.
//!
//! Mutation goes through the [`InstanceManager`], which enforces the
//! single-writer discipline.

mod manager;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

pub use manager::BasicInstanceConfig;
pub use manager::InstanceConfig;
pub use manager::InstanceManager;
pub use manager::StatusMapper;

use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

use crate::cloud::MetadataKey;
use crate::constants::lease::DEFAULT_DURATION_SECS;
use crate::constants::lease::DEFAULT_RENEWAL_INTERVAL_SECS;
use crate::util::now_unix_ms;

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Still initializing; not ready for traffic.
    Starting,
    /// Ready to receive traffic.
    Up,
    /// Failing its health signal.
    Down,
    /// Intentionally removed from traffic.
    OutOfService,
    /// Status cannot be determined.
    #[default]
    Unknown,
}

impl InstanceStatus {
    /// Parse from the wire representation; anything unrecognized is
    /// [`Unknown`](Self::Unknown).
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "STARTING" => Self::Starting,
            "UP" => Self::Up,
            "DOWN" => Self::Down,
            "OUT_OF_SERVICE" => Self::OutOfService,
            _ => Self::Unknown,
        }
    }

    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::OutOfService => "OUT_OF_SERVICE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Lease parameters advertised to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    /// Heartbeat interval in seconds.
    pub renewal_interval_secs: u32,
    /// How long the registry waits past the last renewal before eviction.
    pub duration_secs: u32,
}

impl Default for LeaseInfo {
    fn default() -> Self {
        Self {
            renewal_interval_secs: DEFAULT_RENEWAL_INTERVAL_SECS,
            duration_secs: DEFAULT_DURATION_SECS,
        }
    }
}

/// Metadata of a cloud-hosted instance, keyed by [`MetadataKey`] names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CloudInfo {
    metadata: HashMap<String, String>,
}

impl CloudInfo {
    /// Empty cloud info; populated by the builder or by hand in tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for a well-known metadata key.
    pub fn get(&self, key: MetadataKey) -> Option<&str> {
        self.metadata.get(key.name()).map(String::as_str)
    }

    /// Install a value for a well-known metadata key.
    pub fn insert(&mut self, key: MetadataKey, value: impl Into<String>) {
        self.metadata.insert(key.name().to_string(), value.into());
    }

    /// The cloud-assigned instance id, when it was obtainable.
    pub fn instance_id(&self) -> Option<&str> {
        self.get(MetadataKey::InstanceId)
    }

    /// The full metadata map.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

/// Where an instance runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "name", content = "info")]
pub enum DataCenterInfo {
    /// A self-managed data center; no further metadata.
    #[default]
    MyOwn,
    /// A cloud data center described by its instance metadata.
    Cloud(CloudInfo),
}

/// Event dispatched to listeners on a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChangeEvent {
    /// Status before the transition.
    pub previous: InstanceStatus,
    /// Status after the transition.
    pub current: InstanceStatus,
}

/// Observer of instance status transitions.
///
/// Errors returned from [`notify`](Self::notify) are logged and swallowed;
/// one faulty listener must not break the fan-out to the others.
pub trait StatusChangeListener: Send + Sync {
    /// Stable identifier used for registration and removal.
    fn id(&self) -> &str;

    /// Receive one status transition.
    fn notify(&self, event: StatusChangeEvent) -> anyhow::Result<()>;
}

/// Hook executed synchronously before the instance is first advertised,
/// so embedders can finish wiring (warm caches, load late metadata) with
/// the guarantee that nothing has been pushed yet.
///
/// Installed via
/// [`InstanceManager::with_pre_registration_handler`]; the manager invokes
/// it exactly once, before applying and dispatching the first status
/// transition.
pub trait PreRegistrationHandler: Send + Sync {
    /// Called exactly once, before the first status transition.
    fn before_registration(&self);
}

/// Failure to build an [`InstanceInfo`].
#[derive(Debug, Snafu)]
pub enum InstanceBuildError {
    /// A required descriptor field was not supplied.
    #[snafu(display("required descriptor field missing: {field}"))]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },
}

/// The instance descriptor registered with the registry.
///
/// Created once at startup and alive for the process lifetime. The id is
/// immutable after creation. Data fields are mutated only through the
/// manager; the dirty flags are monotonic atomics that may be set from any
/// path and are cleared only by the push pipeline.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceInfo {
    instance_id: String,
    app_name: String,
    app_group_name: Option<String>,
    host_name: String,
    ip_addr: String,
    port: u16,
    port_enabled: bool,
    secure_port: u16,
    secure_port_enabled: bool,
    vip_address: Option<String>,
    secure_vip_address: Option<String>,
    status: InstanceStatus,
    lease_info: LeaseInfo,
    data_center_info: DataCenterInfo,
    metadata: HashMap<String, String>,
    #[serde(skip)]
    is_dirty: AtomicBool,
    #[serde(skip)]
    is_status_dirty: AtomicBool,
    #[serde(skip)]
    last_dirty_ms: AtomicU64,
}

impl Clone for InstanceInfo {
    fn clone(&self) -> Self {
        Self {
            instance_id: self.instance_id.clone(),
            app_name: self.app_name.clone(),
            app_group_name: self.app_group_name.clone(),
            host_name: self.host_name.clone(),
            ip_addr: self.ip_addr.clone(),
            port: self.port,
            port_enabled: self.port_enabled,
            secure_port: self.secure_port,
            secure_port_enabled: self.secure_port_enabled,
            vip_address: self.vip_address.clone(),
            secure_vip_address: self.secure_vip_address.clone(),
            status: self.status,
            lease_info: self.lease_info,
            data_center_info: self.data_center_info.clone(),
            metadata: self.metadata.clone(),
            is_dirty: AtomicBool::new(self.is_dirty.load(Ordering::Relaxed)),
            is_status_dirty: AtomicBool::new(self.is_status_dirty.load(Ordering::Relaxed)),
            last_dirty_ms: AtomicU64::new(self.last_dirty_ms.load(Ordering::Relaxed)),
        }
    }
}

impl InstanceInfo {
    /// Start building a descriptor.
    pub fn builder() -> InstanceInfoBuilder {
        InstanceInfoBuilder::default()
    }

    /// Unique id, scoped to the application name. Immutable.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Application this instance belongs to.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Optional application group.
    pub fn app_group_name(&self) -> Option<&str> {
        self.app_group_name.as_deref()
    }

    /// Advertised host name.
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Advertised IP address.
    pub fn ip_addr(&self) -> &str {
        &self.ip_addr
    }

    /// Non-secure port and whether it accepts traffic.
    pub fn port(&self) -> (u16, bool) {
        (self.port, self.port_enabled)
    }

    /// Secure port and whether it accepts traffic.
    pub fn secure_port(&self) -> (u16, bool) {
        (self.secure_port, self.secure_port_enabled)
    }

    /// Virtual host name for non-secure traffic.
    pub fn vip_address(&self) -> Option<&str> {
        self.vip_address.as_deref()
    }

    /// Virtual host name for secure traffic; unobservable while the
    /// secure port is disabled.
    pub fn secure_vip_address(&self) -> Option<&str> {
        if !self.secure_port_enabled {
            return None;
        }
        self.secure_vip_address.as_deref()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    /// Lease parameters.
    pub fn lease_info(&self) -> &LeaseInfo {
        &self.lease_info
    }

    /// Where this instance runs.
    pub fn data_center_info(&self) -> &DataCenterInfo {
        &self.data_center_info
    }

    /// Open-ended string metadata pushed to the registry.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Whether the registry's copy of this descriptor is stale.
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    /// Whether the status alone needs pushing.
    pub fn is_status_dirty(&self) -> bool {
        self.is_status_dirty.load(Ordering::Acquire)
    }

    /// Timestamp of the most recent dirty marking, Unix milliseconds.
    pub fn last_dirty_timestamp_ms(&self) -> u64 {
        self.last_dirty_ms.load(Ordering::Acquire)
    }

    /// Mark the descriptor as needing a push. Monotonic; never cleared by
    /// the paths in this crate.
    pub fn set_is_dirty(&self) {
        self.is_dirty.store(true, Ordering::Release);
        self.last_dirty_ms.store(now_unix_ms(), Ordering::Release);
    }

    /// Clear the dirty flag, but only if no marking happened after the
    /// push pipeline took its snapshot at `snapshot_ms`.
    pub fn unset_is_dirty(&self, snapshot_ms: u64) {
        if self.last_dirty_ms.load(Ordering::Acquire) <= snapshot_ms {
            self.is_dirty.store(false, Ordering::Release);
            self.is_status_dirty.store(false, Ordering::Release);
        }
    }

    pub(crate) fn set_status(&mut self, next: InstanceStatus) -> Option<InstanceStatus> {
        if self.status == next {
            return None;
        }
        let previous = self.status;
        self.status = next;
        self.is_status_dirty.store(true, Ordering::Release);
        self.set_is_dirty();
        Some(previous)
    }

    pub(crate) fn set_host_name(&mut self, host_name: String) {
        self.host_name = host_name;
    }

    pub(crate) fn set_ip_addr(&mut self, ip_addr: String) {
        self.ip_addr = ip_addr;
    }

    pub(crate) fn set_data_center_info(&mut self, data_center_info: DataCenterInfo) {
        self.data_center_info = data_center_info;
    }

    pub(crate) fn set_lease_info(&mut self, lease_info: LeaseInfo) {
        self.lease_info = lease_info;
    }

    pub(crate) fn register_runtime_metadata(&mut self, app_metadata: HashMap<String, String>) {
        self.metadata.extend(app_metadata);
        self.set_is_dirty();
    }
}

/// Builder for [`InstanceInfo`].
#[derive(Debug, Default)]
pub struct InstanceInfoBuilder {
    instance_id: Option<String>,
    app_name: Option<String>,
    app_group_name: Option<String>,
    host_name: Option<String>,
    ip_addr: Option<String>,
    port: Option<(u16, bool)>,
    secure_port: Option<(u16, bool)>,
    vip_address: Option<String>,
    secure_vip_address: Option<String>,
    status: Option<InstanceStatus>,
    lease_info: Option<LeaseInfo>,
    data_center_info: Option<DataCenterInfo>,
    metadata: HashMap<String, String>,
}

impl InstanceInfoBuilder {
    /// Unique id, scoped to the application name. Required.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Application name. Required.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Optional application group.
    pub fn app_group_name(mut self, name: impl Into<String>) -> Self {
        self.app_group_name = Some(name.into());
        self
    }

    /// Advertised host name.
    pub fn host_name(mut self, host: impl Into<String>) -> Self {
        self.host_name = Some(host.into());
        self
    }

    /// Advertised IP address.
    pub fn ip_addr(mut self, ip: impl Into<String>) -> Self {
        self.ip_addr = Some(ip.into());
        self
    }

    /// Non-secure port and enabled bit.
    pub fn port(mut self, port: u16, enabled: bool) -> Self {
        self.port = Some((port, enabled));
        self
    }

    /// Secure port and enabled bit.
    pub fn secure_port(mut self, port: u16, enabled: bool) -> Self {
        self.secure_port = Some((port, enabled));
        self
    }

    /// Virtual host name for non-secure traffic.
    pub fn vip_address(mut self, vip: impl Into<String>) -> Self {
        self.vip_address = Some(vip.into());
        self
    }

    /// Virtual host name for secure traffic.
    pub fn secure_vip_address(mut self, vip: impl Into<String>) -> Self {
        self.secure_vip_address = Some(vip.into());
        self
    }

    /// Initial status; defaults to [`InstanceStatus::Starting`].
    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Lease parameters.
    pub fn lease_info(mut self, lease: LeaseInfo) -> Self {
        self.lease_info = Some(lease);
        self
    }

    /// Data-center info.
    pub fn data_center_info(mut self, info: DataCenterInfo) -> Self {
        self.data_center_info = Some(info);
        self
    }

    /// Add one metadata entry.
    pub fn add_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Finish building.
    pub fn build(self) -> Result<InstanceInfo, InstanceBuildError> {
        let instance_id = self.instance_id.ok_or(InstanceBuildError::MissingField {
            field: "instance_id",
        })?;
        let app_name = self
            .app_name
            .ok_or(InstanceBuildError::MissingField { field: "app_name" })?;
        Ok(InstanceInfo {
            instance_id,
            app_name,
            app_group_name: self.app_group_name,
            host_name: self.host_name.unwrap_or_else(|| "localhost".to_string()),
            ip_addr: self.ip_addr.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.map(|(p, _)| p).unwrap_or(80),
            port_enabled: self.port.map(|(_, e)| e).unwrap_or(true),
            secure_port: self.secure_port.map(|(p, _)| p).unwrap_or(443),
            secure_port_enabled: self.secure_port.map(|(_, e)| e).unwrap_or(false),
            vip_address: self.vip_address,
            secure_vip_address: self.secure_vip_address,
            status: self.status.unwrap_or(InstanceStatus::Starting),
            lease_info: self.lease_info.unwrap_or_default(),
            data_center_info: self.data_center_info.unwrap_or_default(),
            metadata: self.metadata,
            is_dirty: AtomicBool::new(false),
            is_status_dirty: AtomicBool::new(false),
            last_dirty_ms: AtomicU64::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> InstanceInfo {
        InstanceInfo::builder()
            .instance_id("i-001")
            .app_name("billing")
            .host_name("billing-1.example.com")
            .ip_addr("10.0.0.4")
            .vip_address("billing.example.com")
            .secure_vip_address("billing-secure.example.com")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_identity() {
        let err = InstanceInfo::builder().app_name("billing").build().unwrap_err();
        assert!(err.to_string().contains("instance_id"));

        let err = InstanceInfo::builder().instance_id("i-001").build().unwrap_err();
        assert!(err.to_string().contains("app_name"));
    }

    #[test]
    fn test_builder_defaults() {
        let info = descriptor();
        assert_eq!(info.status(), InstanceStatus::Starting);
        assert_eq!(info.port(), (80, true));
        assert_eq!(info.secure_port(), (443, false));
        assert_eq!(info.lease_info(), &LeaseInfo::default());
        assert_eq!(info.data_center_info(), &DataCenterInfo::MyOwn);
        assert!(!info.is_dirty());
    }

    #[test]
    fn test_secure_vip_hidden_while_secure_port_disabled() {
        let info = descriptor();
        assert_eq!(info.secure_vip_address(), None);

        let secured = InstanceInfo::builder()
            .instance_id("i-002")
            .app_name("billing")
            .secure_port(8443, true)
            .secure_vip_address("billing-secure.example.com")
            .build()
            .unwrap();
        assert_eq!(secured.secure_vip_address(), Some("billing-secure.example.com"));
    }

    #[test]
    fn test_set_status_records_previous_and_marks_dirty() {
        let mut info = descriptor();
        let prev = info.set_status(InstanceStatus::Up);
        assert_eq!(prev, Some(InstanceStatus::Starting));
        assert!(info.is_dirty());
        assert!(info.is_status_dirty());

        // Same status again is a no-op.
        assert_eq!(info.set_status(InstanceStatus::Up), None);
    }

    #[test]
    fn test_unset_dirty_honors_later_markings() {
        let info = descriptor();
        info.set_is_dirty();
        let snapshot = info.last_dirty_timestamp_ms();

        info.unset_is_dirty(snapshot);
        assert!(!info.is_dirty());

        info.set_is_dirty();
        // A stale snapshot must not clear a newer marking.
        info.unset_is_dirty(snapshot.saturating_sub(1));
        assert!(info.is_dirty());
    }

    #[test]
    fn test_runtime_metadata_merge_marks_dirty() {
        let mut info = descriptor();
        let mut extra = HashMap::new();
        extra.insert("build".to_string(), "1.4.2".to_string());
        info.register_runtime_metadata(extra);

        assert_eq!(info.metadata()["build"], "1.4.2");
        assert!(info.is_dirty());
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(InstanceStatus::OutOfService.as_str(), "OUT_OF_SERVICE");
        assert_eq!(InstanceStatus::parse("out_of_service"), InstanceStatus::OutOfService);
        assert_eq!(InstanceStatus::parse("bogus"), InstanceStatus::Unknown);

        let json = serde_json::to_string(&InstanceStatus::OutOfService).unwrap();
        assert_eq!(json, "\"OUT_OF_SERVICE\"");
    }

    #[test]
    fn test_descriptor_round_trips_through_serde() {
        let mut info = descriptor();
        info.set_status(InstanceStatus::Up);

        let json = serde_json::to_string(&info).unwrap();
        let back: InstanceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instance_id(), "i-001");
        assert_eq!(back.status(), InstanceStatus::Up);
        // Dirty flags are local state, not wire state.
        assert!(!back.is_dirty());
    }

    #[test]
    fn test_cloud_data_center_info_tagging() {
        let mut cloud = CloudInfo::new();
        cloud.insert(MetadataKey::InstanceId, "i-0abc");
        cloud.insert(MetadataKey::AvailabilityZone, "us-east-1c");
        let info = DataCenterInfo::Cloud(cloud);

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"name\":\"Cloud\""));
        let back: DataCenterInfo = serde_json::from_str(&json).unwrap();
        match back {
            DataCenterInfo::Cloud(cloud) => {
                assert_eq!(cloud.instance_id(), Some("i-0abc"));
                assert_eq!(cloud.get(MetadataKey::AvailabilityZone), Some("us-east-1c"));
            }
            DataCenterInfo::MyOwn => panic!("expected cloud data center info"),
        }
    }
}
