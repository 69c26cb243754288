//! Cloud instance-metadata fetching.
//!
//! Cloud-hosted instances describe themselves by querying the provider's
//! link-local metadata service. The builder walks the well-known keys in
//! order, retrying each a configured number of times; the instance id
//! comes first so a dead metadata service can fail the whole build fast
//! instead of burning retries on every remaining key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use snafu::Snafu;
use tracing::warn;

use crate::config::CloudMetadataConfig;
use crate::constants::cloud::ACCOUNT_ID_PATTERN;
use crate::constants::cloud::IDENTITY_DOCUMENT_URL;
use crate::constants::cloud::METADATA_BASE_URL;
use crate::constants::cloud::RETRY_SLEEP_MS;
use crate::instance::CloudInfo;

/// Well-known instance metadata keys.
///
/// Declaration order is fetch order: the instance id leads as the
/// fail-fast probe, and `Mac` precedes `VpcId`, whose metadata path
/// embeds the previously fetched MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    /// Cloud-assigned instance id.
    InstanceId,
    /// Machine image id.
    AmiId,
    /// Instance hardware type.
    InstanceType,
    /// Private IPv4 address.
    LocalIpv4,
    /// Private host name.
    LocalHostname,
    /// Availability zone the instance is placed in.
    AvailabilityZone,
    /// Public host name, when one is attached.
    PublicHostname,
    /// Public IPv4 address, when one is attached.
    PublicIpv4,
    /// Scheduled spot termination time, when the instance is spot.
    SpotTerminationTime,
    /// Pending spot lifecycle action, when the instance is spot.
    SpotInstanceAction,
    /// Primary interface MAC address.
    Mac,
    /// VPC id; its path requires the previously fetched MAC.
    VpcId,
    /// Account id, extracted from the instance-identity document.
    AccountId,
}

impl MetadataKey {
    /// Every key, in fetch order.
    pub const ALL: [MetadataKey; 13] = [
        MetadataKey::InstanceId,
        MetadataKey::AmiId,
        MetadataKey::InstanceType,
        MetadataKey::LocalIpv4,
        MetadataKey::LocalHostname,
        MetadataKey::AvailabilityZone,
        MetadataKey::PublicHostname,
        MetadataKey::PublicIpv4,
        MetadataKey::SpotTerminationTime,
        MetadataKey::SpotInstanceAction,
        MetadataKey::Mac,
        MetadataKey::VpcId,
        MetadataKey::AccountId,
    ];

    /// Metadata name, used both in the URL and as the map key.
    pub fn name(&self) -> &'static str {
        match self {
            MetadataKey::InstanceId => "instance-id",
            MetadataKey::AmiId => "ami-id",
            MetadataKey::InstanceType => "instance-type",
            MetadataKey::LocalIpv4 => "local-ipv4",
            MetadataKey::LocalHostname => "local-hostname",
            MetadataKey::AvailabilityZone => "availability-zone",
            MetadataKey::PublicHostname => "public-hostname",
            MetadataKey::PublicIpv4 => "public-ipv4",
            MetadataKey::SpotTerminationTime => "termination-time",
            MetadataKey::SpotInstanceAction => "instance-action",
            MetadataKey::Mac => "mac",
            MetadataKey::VpcId => "vpc-id",
            MetadataKey::AccountId => "accountId",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            MetadataKey::AvailabilityZone => "placement/",
            MetadataKey::SpotTerminationTime | MetadataKey::SpotInstanceAction => "spot/",
            MetadataKey::VpcId => "network/interfaces/macs/",
            _ => "",
        }
    }

    /// URL to fetch this key from, or `None` when a prerequisite (the MAC
    /// for [`VpcId`](Self::VpcId)) is not available yet.
    fn url(&self, mac: Option<&str>) -> Option<String> {
        match self {
            MetadataKey::AccountId => Some(IDENTITY_DOCUMENT_URL.to_string()),
            MetadataKey::VpcId => {
                mac.map(|mac| format!("{}{}{}/{}", METADATA_BASE_URL, self.path(), mac, self.name()))
            }
            _ => Some(format!("{}{}{}", METADATA_BASE_URL, self.path(), self.name())),
        }
    }
}

impl std::fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata fetch errors. All transient: the builder retries and then
/// carries on without the key.
#[derive(Debug, Snafu)]
pub enum MetadataError {
    /// The HTTP client could not be constructed.
    #[snafu(display("failed to build metadata client: {reason}"))]
    ClientInit {
        /// Construction failure detail.
        reason: String,
    },

    /// One metadata URL could not be fetched.
    #[snafu(display("metadata fetch for {url} failed: {reason}"))]
    Fetch {
        /// URL that was queried.
        url: String,
        /// Failure detail.
        reason: String,
    },

    /// A key's prerequisite value is missing.
    #[snafu(display("metadata key {key} needs {prerequisite} fetched first"))]
    MissingPrerequisite {
        /// Key being fetched.
        key: &'static str,
        /// The value it depends on.
        prerequisite: &'static str,
    },
}

/// Seam over the metadata HTTP endpoint so tests run offline.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    /// GET `url` and return the response body.
    async fn fetch(&self, url: &str) -> Result<String, MetadataError>;
}

/// [`MetadataFetcher`] over reqwest with per-attempt timeouts.
pub struct HttpMetadataFetcher {
    client: reqwest::Client,
}

impl HttpMetadataFetcher {
    /// Build a client honoring the configured timeouts.
    pub fn new(config: &CloudMetadataConfig) -> Result<Self, MetadataError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()
            .map_err(|e| MetadataError::ClientInit { reason: e.to_string() })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MetadataFetcher for HttpMetadataFetcher {
    async fn fetch(&self, url: &str) -> Result<String, MetadataError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| MetadataError::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        response.text().await.map_err(|e| MetadataError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Builder assembling a [`CloudInfo`] from the metadata service.
pub struct CloudInfoBuilder {
    config: CloudMetadataConfig,
    fetcher: Arc<dyn MetadataFetcher>,
    account_id_re: Regex,
}

impl CloudInfoBuilder {
    /// Build against the real metadata endpoint.
    pub fn new(config: CloudMetadataConfig) -> Result<Self, MetadataError> {
        let fetcher = Arc::new(HttpMetadataFetcher::new(&config)?);
        Ok(Self::with_fetcher(config, fetcher))
    }

    /// Build against a custom fetcher (tests, alternative transports).
    pub fn with_fetcher(config: CloudMetadataConfig, fetcher: Arc<dyn MetadataFetcher>) -> Self {
        Self {
            config,
            fetcher,
            account_id_re: Regex::new(ACCOUNT_ID_PATTERN).expect("account id pattern is valid"),
        }
    }

    /// Fetch every metadata key, retrying each per the configuration.
    ///
    /// Returns whatever was collected; keys that stayed unreachable are
    /// simply absent. When fail-fast is configured and the instance id
    /// cannot be fetched, the remaining keys are skipped outright.
    pub async fn auto_build(&self) -> CloudInfo {
        let mut info = CloudInfo::new();
        for key in MetadataKey::ALL {
            self.fetch_one(&mut info, key).await;

            if key == MetadataKey::InstanceId
                && self.config.fail_fast_on_first_load
                && info.get(MetadataKey::InstanceId).is_none()
            {
                warn!(
                    retries = self.config.num_retries,
                    "skipping the rest of cloud metadata init; instance id unavailable \
                     after the configured retries"
                );
                break;
            }
        }
        info
    }

    async fn fetch_one(&self, info: &mut CloudInfo, key: MetadataKey) {
        let mut remaining = self.config.num_retries;
        while remaining > 0 {
            remaining -= 1;
            let result = match self.key_url(info, key) {
                Ok(url) => self.fetcher.fetch(&url).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(body) => {
                    let value = match key {
                        MetadataKey::AccountId => self.parse_account_id(&body),
                        _ => Some(body),
                    };
                    if let Some(value) = value {
                        info.insert(key, value);
                    }
                    return;
                }
                Err(error) => {
                    if self.config.log_metadata_errors {
                        warn!(key = %key, error = %error, "cannot get the value for the metadata key");
                    }
                    if remaining > 0 {
                        tokio::time::sleep(Duration::from_millis(RETRY_SLEEP_MS)).await;
                    }
                }
            }
        }
    }

    fn key_url(&self, info: &CloudInfo, key: MetadataKey) -> Result<String, MetadataError> {
        let mac = info.get(MetadataKey::Mac);
        key.url(mac).ok_or(MetadataError::MissingPrerequisite {
            key: key.name(),
            prerequisite: MetadataKey::Mac.name(),
        })
    }

    fn parse_account_id(&self, document: &str) -> Option<String> {
        self.account_id_re
            .captures(document)
            .and_then(|captures| captures.get(1))
            .map(|account_id| account_id.as_str().to_string())
    }
}
