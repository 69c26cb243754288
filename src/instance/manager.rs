//! The instance manager: single writer of the local descriptor.
//!
//! Owns the [`InstanceInfo`] for this process and serializes every
//! mutation behind one mutex, held across both the descriptor update and
//! the listener fan-out so observers always see `(previous, current)`
//! pairs consistent with one total order of [`set_status`] calls.
//!
//! [`set_status`]: InstanceManager::set_status

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::info;
use tracing::warn;

use super::DataCenterInfo;
use super::InstanceInfo;
use super::InstanceStatus;
use super::LeaseInfo;
use super::PreRegistrationHandler;
use super::StatusChangeEvent;
use super::StatusChangeListener;
use crate::cloud::MetadataKey;

/// Maps a requested status to the status actually applied, or `None` for
/// "no change". The identity mapper applies every request as-is.
pub type StatusMapper = Arc<dyn Fn(InstanceStatus) -> Option<InstanceStatus> + Send + Sync>;

/// Configuration surface the manager consults when refreshing the
/// descriptor. Implementations that can re-resolve their address should
/// honor `refresh` by querying the underlying source again.
pub trait InstanceConfig: Send + Sync {
    /// Host name to advertise; `refresh` asks for a re-resolution.
    fn host_name(&self, refresh: bool) -> String;

    /// IP address to advertise.
    fn ip_address(&self) -> String;

    /// Data-center info to advertise.
    fn data_center_info(&self) -> DataCenterInfo;

    /// Lease renewal interval, seconds.
    fn lease_renewal_interval_secs(&self) -> u32;

    /// Lease expiration duration, seconds.
    fn lease_expiration_duration_secs(&self) -> u32;

    /// Up-to-date default address. Refreshable configs resolve through
    /// their address-resolution order; the default is the host name.
    fn resolve_default_address(&self, refresh: bool) -> String {
        self.host_name(refresh)
    }
}

/// A fixed [`InstanceConfig`] for embedders that configure statically.
#[derive(Debug, Clone)]
pub struct BasicInstanceConfig {
    /// Advertised host name.
    pub host_name: String,
    /// Advertised IP address.
    pub ip_address: String,
    /// Advertised data-center info.
    pub data_center_info: DataCenterInfo,
    /// Lease renewal interval, seconds.
    pub lease_renewal_interval_secs: u32,
    /// Lease expiration duration, seconds.
    pub lease_expiration_duration_secs: u32,
}

impl InstanceConfig for BasicInstanceConfig {
    fn host_name(&self, _refresh: bool) -> String {
        self.host_name.clone()
    }

    fn ip_address(&self) -> String {
        self.ip_address.clone()
    }

    fn data_center_info(&self) -> DataCenterInfo {
        self.data_center_info.clone()
    }

    fn lease_renewal_interval_secs(&self) -> u32 {
        self.lease_renewal_interval_secs
    }

    fn lease_expiration_duration_secs(&self) -> u32 {
        self.lease_expiration_duration_secs
    }
}

// Legacy process-wide pointer; see `InstanceManager::default_instance`.
static DEFAULT_INSTANCE: StdRwLock<Option<Arc<InstanceManager>>> = StdRwLock::new(None);

/// Owner of this process's instance descriptor.
pub struct InstanceManager {
    config: Arc<dyn InstanceConfig>,
    /// Serializes mutate+dispatch; listener order follows lock order.
    write_lock: Mutex<()>,
    info: RwLock<InstanceInfo>,
    listeners: DashMap<String, Arc<dyn StatusChangeListener>>,
    status_mapper: StatusMapper,
    pre_registration: Option<Arc<dyn PreRegistrationHandler>>,
    pre_registration_done: AtomicBool,
}

impl InstanceManager {
    /// Create a manager applying requested statuses as-is.
    pub fn new(config: Arc<dyn InstanceConfig>, info: InstanceInfo) -> Arc<Self> {
        Self::with_status_mapper(config, info, Arc::new(Some))
    }

    /// Create a manager with a custom status mapper.
    pub fn with_status_mapper(
        config: Arc<dyn InstanceConfig>,
        info: InstanceInfo,
        status_mapper: StatusMapper,
    ) -> Arc<Self> {
        Self::build(config, info, status_mapper, None)
    }

    /// Create a manager that runs `handler` once before the first status
    /// transition is applied and dispatched.
    pub fn with_pre_registration_handler(
        config: Arc<dyn InstanceConfig>,
        info: InstanceInfo,
        status_mapper: StatusMapper,
        handler: Arc<dyn PreRegistrationHandler>,
    ) -> Arc<Self> {
        Self::build(config, info, status_mapper, Some(handler))
    }

    fn build(
        config: Arc<dyn InstanceConfig>,
        info: InstanceInfo,
        status_mapper: StatusMapper,
        pre_registration: Option<Arc<dyn PreRegistrationHandler>>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            write_lock: Mutex::new(()),
            info: RwLock::new(info),
            listeners: DashMap::new(),
            status_mapper,
            pre_registration,
            pre_registration_done: AtomicBool::new(false),
        });
        // Latest construction wins, mirroring how legacy callers expect
        // the process-wide pointer to behave.
        *DEFAULT_INSTANCE.write().expect("default instance lock poisoned") =
            Some(Arc::clone(&manager));
        manager
    }

    /// Process-wide default manager, for legacy callers that cannot be
    /// injected. This is a migration aid, not a contract: new code should
    /// receive its manager by injection.
    pub fn default_instance() -> Option<Arc<InstanceManager>> {
        DEFAULT_INSTANCE
            .read()
            .expect("default instance lock poisoned")
            .clone()
    }

    /// Snapshot of the current descriptor.
    pub fn info(&self) -> InstanceInfo {
        self.info.read().clone()
    }

    /// Merge user metadata into the descriptor's runtime metadata. The
    /// merged entries ride along on the next descriptor push.
    pub fn register_app_metadata(&self, app_metadata: HashMap<String, String>) {
        let _guard = self.write_lock.lock();
        self.info.write().register_runtime_metadata(app_metadata);
    }

    /// Set the instance status, notifying every registered listener of the
    /// transition. The configured status mapper filters the request first;
    /// a `None` mapping or an unchanged status is a no-op.
    ///
    /// The first real transition runs the pre-registration handler, if one
    /// was installed, before the descriptor changes or any listener fires.
    pub fn set_status(&self, status: InstanceStatus) {
        let _guard = self.write_lock.lock();
        let Some(next) = (self.status_mapper)(status) else {
            return;
        };
        if self.info.read().status() == next {
            return;
        }
        if let Some(handler) = &self.pre_registration
            && !self.pre_registration_done.swap(true, Ordering::AcqRel)
        {
            handler.before_registration();
        }
        let previous = self.info.write().set_status(next);
        let Some(previous) = previous else {
            return;
        };
        let event = StatusChangeEvent { previous, current: next };
        for listener in self.listeners.iter() {
            if let Err(error) = listener.notify(event) {
                warn!(listener = %listener.key(), error = %error, "failed to notify listener");
            }
        }
    }

    /// Register a status-change listener under its id.
    pub fn register_status_change_listener(&self, listener: Arc<dyn StatusChangeListener>) {
        self.listeners.insert(listener.id().to_string(), listener);
    }

    /// Remove the listener registered under `listener_id`.
    pub fn unregister_status_change_listener(&self, listener_id: &str) {
        self.listeners.remove(listener_id);
    }

    /// Re-resolve the advertised address and rebuild host, ip and
    /// data-center info if it changed; also pick up a changed spot
    /// termination action for cloud instances. Any change marks the
    /// descriptor dirty so the next heartbeat pushes it.
    pub fn refresh_data_center_info_if_required(&self) {
        let _guard = self.write_lock.lock();
        let (existing_address, existing_spot_action) = {
            let info = self.info.read();
            let spot = match info.data_center_info() {
                DataCenterInfo::Cloud(cloud) => {
                    cloud.get(MetadataKey::SpotInstanceAction).map(String::from)
                }
                DataCenterInfo::MyOwn => None,
            };
            (info.host_name().to_string(), spot)
        };

        let new_address = self.config.resolve_default_address(true);
        let new_ip = self.config.ip_address();

        if !new_address.is_empty() && new_address != existing_address {
            warn!(old = %existing_address, new = %new_address, "the address changed");
            self.update_instance_info(Some(new_address), Some(new_ip));
        }

        if let DataCenterInfo::Cloud(config_cloud) = self.config.data_center_info() {
            let new_spot_action = config_cloud.get(MetadataKey::SpotInstanceAction);
            if new_spot_action.is_some()
                && new_spot_action != existing_spot_action.as_deref()
            {
                info!(
                    old = ?existing_spot_action,
                    new = ?new_spot_action,
                    "the spot instance termination action changed"
                );
                self.update_instance_info(None, None);
            }
        }
    }

    /// Install a new lease record if the configured lease parameters
    /// differ from the descriptor's, marking it dirty.
    pub fn refresh_lease_info_if_required(&self) {
        let _guard = self.write_lock.lock();
        let renewal = self.config.lease_renewal_interval_secs();
        let duration = self.config.lease_expiration_duration_secs();

        let mut info = self.info.write();
        let lease = info.lease_info();
        if lease.renewal_interval_secs != renewal || lease.duration_secs != duration {
            info.set_lease_info(LeaseInfo {
                renewal_interval_secs: renewal,
                duration_secs: duration,
            });
            info.set_is_dirty();
        }
    }

    fn update_instance_info(&self, new_address: Option<String>, new_ip: Option<String>) {
        let mut info = self.info.write();
        if let Some(address) = new_address {
            info.set_host_name(address);
        }
        if let Some(ip) = new_ip {
            info.set_ip_addr(ip);
        }
        info.set_data_center_info(self.config.data_center_info());
        info.set_is_dirty();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::instance::CloudInfo;

    fn config() -> BasicInstanceConfig {
        BasicInstanceConfig {
            host_name: "billing-1.example.com".to_string(),
            ip_address: "10.0.0.4".to_string(),
            data_center_info: DataCenterInfo::MyOwn,
            lease_renewal_interval_secs: 30,
            lease_expiration_duration_secs: 90,
        }
    }

    fn descriptor() -> InstanceInfo {
        InstanceInfo::builder()
            .instance_id("i-001")
            .app_name("billing")
            .host_name("billing-1.example.com")
            .ip_addr("10.0.0.4")
            .build()
            .unwrap()
    }

    struct RecordingListener {
        id: String,
        events: Arc<PlMutex<Vec<StatusChangeEvent>>>,
        fail: bool,
    }

    impl StatusChangeListener for RecordingListener {
        fn id(&self) -> &str {
            &self.id
        }

        fn notify(&self, event: StatusChangeEvent) -> anyhow::Result<()> {
            self.events.lock().push(event);
            if self.fail {
                anyhow::bail!("listener {} is broken", self.id);
            }
            Ok(())
        }
    }

    fn listener(id: &str, fail: bool) -> (Arc<RecordingListener>, Arc<PlMutex<Vec<StatusChangeEvent>>>) {
        let events = Arc::new(PlMutex::new(Vec::new()));
        let listener = Arc::new(RecordingListener {
            id: id.to_string(),
            events: Arc::clone(&events),
            fail,
        });
        (listener, events)
    }

    #[test]
    fn test_status_dispatch_reaches_all_listeners() {
        let manager = InstanceManager::new(Arc::new(config()), descriptor());
        let (l1, events1) = listener("l1", true);
        let (l2, events2) = listener("l2", false);
        manager.register_status_change_listener(l1);
        manager.register_status_change_listener(l2);

        manager.set_status(InstanceStatus::Up);

        let expected = StatusChangeEvent {
            previous: InstanceStatus::Starting,
            current: InstanceStatus::Up,
        };
        // The broken listener still receives its event, and its failure
        // does not block the other listener.
        assert_eq!(events1.lock().as_slice(), &[expected]);
        assert_eq!(events2.lock().as_slice(), &[expected]);
        assert_eq!(manager.info().status(), InstanceStatus::Up);
    }

    #[test]
    fn test_repeated_status_is_noop() {
        let manager = InstanceManager::new(Arc::new(config()), descriptor());
        let (l1, events) = listener("l1", false);
        manager.register_status_change_listener(l1);

        manager.set_status(InstanceStatus::Up);
        manager.set_status(InstanceStatus::Up);

        assert_eq!(events.lock().len(), 1, "an unchanged status must not dispatch");
    }

    #[test]
    fn test_status_mapper_filters_and_rewrites() {
        // Mapper that refuses DOWN and rewrites STARTING to UP.
        let mapper: StatusMapper = Arc::new(|requested| match requested {
            InstanceStatus::Down => None,
            InstanceStatus::Starting => Some(InstanceStatus::Up),
            other => Some(other),
        });
        let manager =
            InstanceManager::with_status_mapper(Arc::new(config()), descriptor(), mapper);

        manager.set_status(InstanceStatus::Down);
        assert_eq!(manager.info().status(), InstanceStatus::Starting, "DOWN was filtered out");

        manager.set_status(InstanceStatus::Starting);
        assert_eq!(manager.info().status(), InstanceStatus::Up);
    }

    #[test]
    fn test_unregistered_listener_stops_receiving() {
        let manager = InstanceManager::new(Arc::new(config()), descriptor());
        let (l1, events) = listener("l1", false);
        manager.register_status_change_listener(l1);

        manager.set_status(InstanceStatus::Up);
        manager.unregister_status_change_listener("l1");
        manager.set_status(InstanceStatus::OutOfService);

        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn test_status_transitions_totally_ordered() {
        let manager = Arc::new(InstanceManager::new(Arc::new(config()), descriptor()));
        let (l1, events) = listener("l1", false);
        manager.register_status_change_listener(l1);

        let statuses = [
            InstanceStatus::Up,
            InstanceStatus::OutOfService,
            InstanceStatus::Down,
            InstanceStatus::Up,
        ];
        let mut handles = Vec::new();
        for status in statuses {
            let manager = Arc::clone(&manager);
            handles.push(std::thread::spawn(move || manager.set_status(status)));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Whatever interleaving won, each event's previous must equal the
        // prior event's current: a single total order.
        let events = events.lock();
        let mut expected_previous = InstanceStatus::Starting;
        for event in events.iter() {
            assert_eq!(event.previous, expected_previous);
            expected_previous = event.current;
        }
        assert_eq!(manager.info().status(), expected_previous);
    }

    #[test]
    fn test_pre_registration_handler_runs_once_before_first_transition() {
        struct OrderedHandler {
            log: Arc<PlMutex<Vec<String>>>,
        }

        impl PreRegistrationHandler for OrderedHandler {
            fn before_registration(&self) {
                self.log.lock().push("pre-registration".to_string());
            }
        }

        struct OrderedListener {
            log: Arc<PlMutex<Vec<String>>>,
        }

        impl StatusChangeListener for OrderedListener {
            fn id(&self) -> &str {
                "ordered"
            }

            fn notify(&self, event: StatusChangeEvent) -> anyhow::Result<()> {
                self.log
                    .lock()
                    .push(format!("event:{}->{}", event.previous.as_str(), event.current.as_str()));
                Ok(())
            }
        }

        let log = Arc::new(PlMutex::new(Vec::new()));
        let manager = InstanceManager::with_pre_registration_handler(
            Arc::new(config()),
            descriptor(),
            Arc::new(Some),
            Arc::new(OrderedHandler { log: Arc::clone(&log) }),
        );
        manager.register_status_change_listener(Arc::new(OrderedListener {
            log: Arc::clone(&log),
        }));

        // Re-asserting the current status is not a transition and must not
        // trigger the handler.
        manager.set_status(InstanceStatus::Starting);
        assert!(log.lock().is_empty());

        manager.set_status(InstanceStatus::Up);
        manager.set_status(InstanceStatus::OutOfService);

        let log = log.lock();
        assert_eq!(log.as_slice(), &[
            "pre-registration".to_string(),
            "event:STARTING->UP".to_string(),
            "event:UP->OUT_OF_SERVICE".to_string(),
        ]);
    }

    #[test]
    fn test_app_metadata_merge() {
        let manager = InstanceManager::new(Arc::new(config()), descriptor());
        let mut extra = HashMap::new();
        extra.insert("build".to_string(), "1.4.2".to_string());
        manager.register_app_metadata(extra);

        let info = manager.info();
        assert_eq!(info.metadata()["build"], "1.4.2");
        assert!(info.is_dirty());
    }

    #[test]
    fn test_refresh_rebuilds_on_address_change() {
        #[derive(Debug)]
        struct FlappingConfig {
            resolutions: AtomicU32,
        }

        impl InstanceConfig for FlappingConfig {
            fn host_name(&self, refresh: bool) -> String {
                if refresh {
                    self.resolutions.fetch_add(1, Ordering::Relaxed);
                    "billing-replacement.example.com".to_string()
                } else {
                    "billing-1.example.com".to_string()
                }
            }

            fn ip_address(&self) -> String {
                "10.0.0.9".to_string()
            }

            fn data_center_info(&self) -> DataCenterInfo {
                DataCenterInfo::MyOwn
            }

            fn lease_renewal_interval_secs(&self) -> u32 {
                30
            }

            fn lease_expiration_duration_secs(&self) -> u32 {
                90
            }
        }

        let config = Arc::new(FlappingConfig {
            resolutions: AtomicU32::new(0),
        });
        let manager = InstanceManager::new(Arc::clone(&config) as Arc<dyn InstanceConfig>, descriptor());

        manager.refresh_data_center_info_if_required();

        let info = manager.info();
        assert_eq!(info.host_name(), "billing-replacement.example.com");
        assert_eq!(info.ip_addr(), "10.0.0.9");
        assert!(info.is_dirty());
        assert_eq!(config.resolutions.load(Ordering::Relaxed), 1, "refresh must re-resolve");
    }

    #[test]
    fn test_refresh_noop_when_address_stable() {
        let manager = InstanceManager::new(Arc::new(config()), descriptor());
        manager.refresh_data_center_info_if_required();
        assert!(!manager.info().is_dirty());
    }

    #[test]
    fn test_spot_action_change_rebuilds_data_center_info() {
        let mut cloud = CloudInfo::new();
        cloud.insert(MetadataKey::InstanceId, "i-0abc");
        cloud.insert(MetadataKey::SpotInstanceAction, "terminate");
        let mut cfg = config();
        cfg.data_center_info = DataCenterInfo::Cloud(cloud);

        // Descriptor still carries no spot action.
        let manager = InstanceManager::new(Arc::new(cfg), descriptor());
        manager.refresh_data_center_info_if_required();

        let info = manager.info();
        assert!(info.is_dirty());
        match info.data_center_info() {
            DataCenterInfo::Cloud(cloud) => {
                assert_eq!(cloud.get(MetadataKey::SpotInstanceAction), Some("terminate"));
            }
            DataCenterInfo::MyOwn => panic!("data center info must have been rebuilt"),
        }
    }

    #[test]
    fn test_lease_refresh_installs_new_lease() {
        let mut cfg = config();
        cfg.lease_renewal_interval_secs = 10;
        cfg.lease_expiration_duration_secs = 30;
        let manager = InstanceManager::new(Arc::new(cfg), descriptor());

        manager.refresh_lease_info_if_required();

        let info = manager.info();
        assert_eq!(info.lease_info().renewal_interval_secs, 10);
        assert_eq!(info.lease_info().duration_secs, 30);
        assert!(info.is_dirty());

        // Second refresh with unchanged config is a no-op.
        let before = info.last_dirty_timestamp_ms();
        manager.refresh_lease_info_if_required();
        assert_eq!(manager.info().last_dirty_timestamp_ms(), before);
    }

    #[test]
    fn test_default_instance_pointer() {
        let manager = InstanceManager::new(Arc::new(config()), descriptor());
        let default = InstanceManager::default_instance().expect("constructor installs pointer");
        assert_eq!(default.info().instance_id(), manager.info().instance_id());
    }
}
