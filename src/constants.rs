//! Centralized constants for the discovery core.
//!
//! Constants are fixed and immutable, enforced at compile time. Each bound
//! exists to keep resource usage and retry behavior explicit rather than
//! scattered through the modules that consume them.

/// Request-gate constants.
pub mod gate {
    /// Header carrying the calling client's identity name.
    pub const IDENTITY_HEADER: &str = "DiscoveryIdentity-Name";

    /// Identity of the standard discovery client shipped with this crate.
    pub const DEFAULT_CLIENT_NAME: &str = "DefaultClient";

    /// Identity used by peer registry servers replicating traffic.
    pub const DEFAULT_SERVER_NAME: &str = "DefaultServer";

    /// URL shape selecting registry fetches: `.../apps`, `.../apps/`,
    /// `.../apps/delta`, `.../apps/<name>`.
    pub const FETCH_TARGET_PATTERN: &str = r"^.*/apps(/[^/]*)?$";
}

/// Supervised-task constants.
pub mod supervisor {
    /// Worker pool size used when the embedder does not supply one.
    pub const DEFAULT_WORKER_POOL_SIZE: usize = 5;
}

/// Lease defaults for the instance descriptor.
pub mod lease {
    /// Default heartbeat interval in seconds.
    pub const DEFAULT_RENEWAL_INTERVAL_SECS: u32 = 30;

    /// Default lease duration in seconds; a lease not renewed within this
    /// window is eligible for eviction.
    pub const DEFAULT_DURATION_SECS: u32 = 90;
}

/// Topology-mapper constants.
pub mod topology {
    /// Sentinel zone name meaning "no real zone information configured".
    pub const DEFAULT_ZONE: &str = "defaultZone";

    /// Prefix of the structured host names carrying discovery TXT records,
    /// as in `txt.<region>.<domain>`.
    pub const TXT_HOST_PREFIX: &str = "txt.";
}

/// Cloud metadata endpoint constants.
pub mod cloud {
    /// Base URL of the instance metadata service.
    pub const METADATA_BASE_URL: &str = "http://169.254.169.254/latest/meta-data/";

    /// URL of the dynamic instance-identity document.
    pub const IDENTITY_DOCUMENT_URL: &str =
        "http://169.254.169.254/latest/dynamic/instance-identity/document";

    /// Sleep between failed attempts for one metadata key, in milliseconds.
    pub const RETRY_SLEEP_MS: u64 = 100;

    /// Pattern extracting the account id from the identity document.
    pub const ACCOUNT_ID_PATTERN: &str = r#""accountId"\s?:\s?"([A-Za-z0-9]*)""#;
}
