//! Low-level DNS lookups for endpoint discovery.
//!
//! Three wrappers over the platform resolver: walking a CNAME chain down to
//! the host carrying the A record, listing A records when no CNAME shadows
//! them, and listing the entries of a TXT record. DNS misconfiguration must
//! never take the client down, so every failure here degrades to a benign
//! fallback (the original host, `None`, or the empty set) with a warning.
//!
//! Lookups go through the [`DnsProvider`] seam; production uses
//! [`HickoryProvider`], tests stub the seam to run offline.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::Resolver;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::RData;
use hickory_resolver::proto::rr::RecordType;
use snafu::Snafu;
use tracing::debug;
use tracing::warn;

use crate::constants::topology::TXT_HOST_PREFIX;

/// Errors surfaced by a [`DnsProvider`].
///
/// Callers inside this module treat every variant as transient and fall
/// back; the type exists so providers can say what went wrong in the logs.
#[derive(Debug, Snafu)]
pub enum DnsError {
    /// The underlying resolver could not be constructed.
    #[snafu(display("failed to build resolver: {reason}"))]
    ResolverInit {
        /// Resolver construction failure detail.
        reason: String,
    },

    /// A lookup failed or returned no usable answer.
    #[snafu(display("lookup for {name} failed: {reason}"))]
    Lookup {
        /// Name that was queried.
        name: String,
        /// Failure detail from the resolver.
        reason: String,
    },
}

/// Answer to a combined A + CNAME query for one name.
#[derive(Debug, Clone, Default)]
pub struct HostRecords {
    /// A-record values owned by the queried name.
    pub a_records: Vec<String>,
    /// CNAME target of the queried name, if one exists.
    pub cname: Option<String>,
}

/// Seam over the platform DNS interface.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// A-type query returning the queried name's own A records and CNAME.
    async fn lookup_host(&self, name: &str) -> Result<HostRecords, DnsError>;

    /// TXT query returning the first record's character-strings joined,
    /// or `None` when the name has no TXT record.
    async fn lookup_txt(&self, name: &str) -> Result<Option<String>, DnsError>;
}

/// [`DnsProvider`] backed by hickory-resolver with the system configuration.
pub struct HickoryProvider {
    resolver: Resolver<TokioConnectionProvider>,
}

impl HickoryProvider {
    /// Build a provider from `/etc/resolv.conf` (or platform equivalent).
    pub fn from_system_conf() -> Result<Self, DnsError> {
        let resolver = Resolver::builder_tokio()
            .map_err(|e| DnsError::ResolverInit { reason: e.to_string() })?
            .build();
        Ok(Self { resolver })
    }
}

#[async_trait]
impl DnsProvider for HickoryProvider {
    async fn lookup_host(&self, name: &str) -> Result<HostRecords, DnsError> {
        let lookup = self
            .resolver
            .lookup(name, RecordType::A)
            .await
            .map_err(|e| DnsError::Lookup {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let queried = normalize(name);
        let mut records = HostRecords::default();
        for record in lookup.record_iter() {
            let owner = normalize(&record.name().to_utf8());
            if owner != queried {
                // Answer-section records for chased names belong to the
                // next hop, not to the queried name.
                continue;
            }
            match record.data() {
                RData::A(a) => records.a_records.push(a.to_string()),
                RData::CNAME(cname) => {
                    records.cname = Some(cname.to_utf8().trim_end_matches('.').to_string());
                }
                _ => {}
            }
        }
        Ok(records)
    }

    async fn lookup_txt(&self, name: &str) -> Result<Option<String>, DnsError> {
        let lookup = self
            .resolver
            .txt_lookup(name)
            .await
            .map_err(|e| DnsError::Lookup {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(lookup.iter().next().map(|txt| {
            txt.txt_data()
                .iter()
                .map(|segment| String::from_utf8_lossy(segment).into_owned())
                .collect::<String>()
        }))
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_or_ip(host: &str) -> bool {
    host == "localhost" || host.parse::<IpAddr>().is_ok()
}

/// DNS resolution wrappers used by endpoint discovery.
#[derive(Clone)]
pub struct DnsResolver {
    provider: Arc<dyn DnsProvider>,
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver").finish_non_exhaustive()
    }
}

impl DnsResolver {
    /// Wrap a provider.
    pub fn new(provider: Arc<dyn DnsProvider>) -> Self {
        Self { provider }
    }

    /// Build a resolver over the system DNS configuration.
    pub fn from_system_conf() -> Result<Self, DnsError> {
        Ok(Self::new(Arc::new(HickoryProvider::from_system_conf()?)))
    }

    /// Resolve `original_host` down the CNAME chain to the host carrying
    /// the A record, or the latest reachable CNAME target.
    ///
    /// Local host names and IP literals are returned as-is; so is the
    /// original host when resolution fails.
    pub async fn resolve(&self, original_host: &str) -> String {
        if is_local_or_ip(original_host) {
            return original_host.to_string();
        }
        let mut current_host = original_host.to_string();
        loop {
            let records = match self.provider.lookup_host(&current_host).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(
                        host = %current_host,
                        error = %e,
                        "cannot resolve registry server address, returning original value"
                    );
                    return original_host.to_string();
                }
            };
            let mut target_host = records.a_records.first().cloned();
            match records.cname {
                Some(cname) => current_host = cname,
                None => target_host = Some(current_host.clone()),
            }
            if let Some(target) = target_host {
                return target;
            }
        }
    }

    /// A-record IPs of `root_domain_name`, but only when the name carries
    /// no CNAME; `None` otherwise or on failure.
    pub async fn a_records(&self, root_domain_name: &str) -> Option<Vec<String>> {
        if is_local_or_ip(root_domain_name) {
            return None;
        }
        match self.provider.lookup_host(root_domain_name).await {
            Ok(records) if records.cname.is_none() && !records.a_records.is_empty() => {
                Some(records.a_records)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(
                    host = %root_domain_name,
                    error = %e,
                    "cannot load A-record for registry server address"
                );
                None
            }
        }
    }

    /// Entries of the TXT record at `discovery_dns_name`, as a sorted set.
    ///
    /// One layer of surrounding quotes is stripped for providers that
    /// return the record quoted, then the value is split on ASCII space
    /// (some DNS services only support the `host1 host2 host3` form).
    /// A missing or empty record yields the empty set.
    pub async fn txt_entries(&self, discovery_dns_name: &str) -> BTreeSet<String> {
        let raw = match self.provider.lookup_txt(discovery_dns_name).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    name = %discovery_dns_name,
                    error = %e,
                    "cannot load TXT record"
                );
                return BTreeSet::new();
            }
        };
        let Some(mut record) = raw else {
            return BTreeSet::new();
        };
        if record.len() >= 2 && record.starts_with('"') && record.ends_with('"') {
            record = record[1..record.len() - 1].to_string();
        }
        record
            .split(' ')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(String::from)
            .collect()
    }

    /// Discovery-URL map for `region`: zone name to server URLs.
    ///
    /// Two-level TXT walk: `txt.<region>.<domain>` lists the zone host
    /// names (zone = first dot-label), and `txt.<zone host>` lists the
    /// servers in that zone, composed into `http://<host>:<port>/<context>/`
    /// URLs.
    pub async fn zone_discovery_urls(
        &self,
        region: &str,
        domain: &str,
        port: u16,
        context: &str,
    ) -> BTreeMap<String, Vec<String>> {
        let region_dns_name = format!("{}{}.{}", TXT_HOST_PREFIX, region, domain);
        let zone_hosts = self.txt_entries(&region_dns_name).await;
        if zone_hosts.is_empty() {
            debug!(region = %region, name = %region_dns_name, "no zone TXT entries for region");
            return BTreeMap::new();
        }

        let mut urls_by_zone: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for zone_host in zone_hosts {
            let Some(zone) = zone_host.split('.').next().filter(|z| !z.is_empty()) else {
                continue;
            };
            let zone_dns_name = format!("{}{}", TXT_HOST_PREFIX, zone_host);
            let servers = self.txt_entries(&zone_dns_name).await;
            let urls = urls_by_zone.entry(zone.to_string()).or_default();
            for server in servers {
                urls.push(format!("http://{}:{}/{}/", server, port, context));
            }
        }
        urls_by_zone
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;

    /// Offline stub: canned host and TXT answers.
    #[derive(Default)]
    pub(crate) struct StubDnsProvider {
        pub hosts: HashMap<String, HostRecords>,
        pub txt: HashMap<String, String>,
        pub fail_all: bool,
    }

    #[async_trait]
    impl DnsProvider for StubDnsProvider {
        async fn lookup_host(&self, name: &str) -> Result<HostRecords, DnsError> {
            if self.fail_all {
                return Err(DnsError::Lookup {
                    name: name.to_string(),
                    reason: "stub failure".to_string(),
                });
            }
            self.hosts.get(name).cloned().ok_or_else(|| DnsError::Lookup {
                name: name.to_string(),
                reason: "no such host".to_string(),
            })
        }

        async fn lookup_txt(&self, name: &str) -> Result<Option<String>, DnsError> {
            if self.fail_all {
                return Err(DnsError::Lookup {
                    name: name.to_string(),
                    reason: "stub failure".to_string(),
                });
            }
            Ok(self.txt.get(name).cloned())
        }
    }

    fn resolver(stub: StubDnsProvider) -> DnsResolver {
        DnsResolver::new(Arc::new(stub))
    }

    fn a_only(ips: &[&str]) -> HostRecords {
        HostRecords {
            a_records: ips.iter().map(|s| s.to_string()).collect(),
            cname: None,
        }
    }

    fn cname_only(target: &str) -> HostRecords {
        HostRecords {
            a_records: Vec::new(),
            cname: Some(target.to_string()),
        }
    }

    #[tokio::test]
    async fn test_resolve_follows_cname_chain() {
        let mut stub = StubDnsProvider::default();
        stub.hosts.insert("discovery.example.com".to_string(), cname_only("edge.example.com"));
        stub.hosts.insert("edge.example.com".to_string(), a_only(&["10.0.0.7"]));

        let resolved = resolver(stub).resolve("discovery.example.com").await;
        assert_eq!(resolved, "edge.example.com", "chase ends at the host carrying the A record");
    }

    #[tokio::test]
    async fn test_resolve_local_and_ip_short_circuit() {
        let resolver = resolver(StubDnsProvider {
            fail_all: true,
            ..Default::default()
        });
        assert_eq!(resolver.resolve("localhost").await, "localhost");
        assert_eq!(resolver.resolve("127.0.0.1").await, "127.0.0.1");
        assert_eq!(resolver.resolve("10.1.2.3").await, "10.1.2.3");
    }

    #[tokio::test]
    async fn test_resolve_failure_returns_original() {
        let mut stub = StubDnsProvider::default();
        stub.hosts.insert("discovery.example.com".to_string(), cname_only("missing.example.com"));

        let resolved = resolver(stub).resolve("discovery.example.com").await;
        assert_eq!(resolved, "discovery.example.com");
    }

    #[tokio::test]
    async fn test_a_records_without_cname() {
        let mut stub = StubDnsProvider::default();
        stub.hosts.insert("edge.example.com".to_string(), a_only(&["10.0.0.7", "10.0.0.8"]));

        let ips = resolver(stub).a_records("edge.example.com").await;
        assert_eq!(ips, Some(vec!["10.0.0.7".to_string(), "10.0.0.8".to_string()]));
    }

    #[tokio::test]
    async fn test_a_records_shadowed_by_cname() {
        let mut stub = StubDnsProvider::default();
        stub.hosts.insert("discovery.example.com".to_string(), HostRecords {
            a_records: vec!["10.0.0.7".to_string()],
            cname: Some("edge.example.com".to_string()),
        });

        assert_eq!(resolver(stub).a_records("discovery.example.com").await, None);
    }

    #[tokio::test]
    async fn test_a_records_failure_is_none() {
        let resolver = resolver(StubDnsProvider {
            fail_all: true,
            ..Default::default()
        });
        assert_eq!(resolver.a_records("edge.example.com").await, None);
    }

    #[tokio::test]
    async fn test_txt_entries_quoted_and_split() {
        let mut stub = StubDnsProvider::default();
        stub.txt.insert(
            "txt.us-east-1.example.com".to_string(),
            "\"zone-a.example.com zone-b.example.com\"".to_string(),
        );

        let entries = resolver(stub).txt_entries("txt.us-east-1.example.com").await;
        let expected: BTreeSet<String> =
            ["zone-a.example.com", "zone-b.example.com"].iter().map(|s| s.to_string()).collect();
        assert_eq!(entries, expected);
    }

    #[tokio::test]
    async fn test_txt_entries_missing_or_failed_is_empty() {
        let stub = StubDnsProvider::default();
        assert!(resolver(stub).txt_entries("txt.nowhere.example.com").await.is_empty());

        let failing = resolver(StubDnsProvider {
            fail_all: true,
            ..Default::default()
        });
        assert!(failing.txt_entries("txt.nowhere.example.com").await.is_empty());
    }

    #[tokio::test]
    async fn test_zone_discovery_urls() {
        let mut stub = StubDnsProvider::default();
        stub.txt.insert(
            "txt.us-east-1.example.com".to_string(),
            "us-east-1c.example.com us-east-1d.example.com".to_string(),
        );
        stub.txt.insert(
            "txt.us-east-1c.example.com".to_string(),
            "server1.example.com server2.example.com".to_string(),
        );
        stub.txt
            .insert("txt.us-east-1d.example.com".to_string(), "server3.example.com".to_string());

        let urls = resolver(stub).zone_discovery_urls("us-east-1", "example.com", 8080, "v2").await;
        assert_eq!(urls.len(), 2);
        assert_eq!(urls["us-east-1c"], vec![
            "http://server1.example.com:8080/v2/".to_string(),
            "http://server2.example.com:8080/v2/".to_string(),
        ]);
        assert_eq!(urls["us-east-1d"], vec!["http://server3.example.com:8080/v2/".to_string()]);
    }
}
