//! Data model: subscriptions, destination groups, and the global settings
//! reflected from configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// An outbound collector address, `host:port`. Invariant: non-empty.
pub type Destination = String;

/// Validates and parses a comma-separated `dst_addr` field into an ordered,
/// non-empty list of destinations. Returns a `ConfigError::EmptyDestination`
/// if any entry (or the whole field) is empty.
pub fn parse_destinations(
    group: &str,
    dst_addr: &str,
) -> Result<Vec<Destination>, crate::error::ConfigError> {
    let destinations: Vec<Destination> = dst_addr
        .split(',')
        .map(|s| s.trim().to_owned())
        .collect();

    if destinations.is_empty() || destinations.iter().any(std::string::String::is_empty) {
        return Err(crate::error::ConfigError::EmptyDestination {
            group: group.to_owned(),
            dst_addr: dst_addr.to_owned(),
        });
    }

    Ok(destinations)
}

/// Report type a subscription publishes under. `Unknown` covers both the
/// reserved `once` value and any unrecognized token; it is always treated
/// as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportType {
    Periodic,
    Stream,
    Unknown,
}

impl ReportType {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "periodic" => Self::Periodic,
            "stream" => Self::Stream,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Periodic | Self::Stream)
    }
}

/// Default report interval when a subscription row omits one: 5000 ms.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(5000);

/// A named subscription: what to publish, from where, to which destination
/// group, in which mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub name: String,
    /// Used as the `target` field of every notification's prefix.
    pub path_target: String,
    pub paths: Vec<String>,
    /// Empty means "registered, but no session should run".
    pub dst_group: Option<String>,
    pub report_type: ReportType,
    pub report_interval: Duration,
}

impl Subscription {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path_target: String::new(),
            paths: Vec::new(),
            dst_group: None,
            report_type: ReportType::Unknown,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }
}

/// Global settings reflected from the `Global` row. Encoding is fixed to
/// JSON-IETF and `unidirectional` fixed to `true` in this revision,
/// preserved deliberately rather than silently "fixed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSettings {
    pub src_ip: Option<String>,
    pub retry_interval: Duration,
    pub encoding: Encoding,
    pub unidirectional: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            src_ip: None,
            retry_interval: Duration::from_secs(30),
            encoding: Encoding::JsonIetf,
            unidirectional: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    JsonIetf,
}

/// Static bootstrap configuration: read once, before any row is reflected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub kv_store: KvStoreEndpoint,
    /// Logical database index holding `TELEMETRY_CLIENT` rows.
    #[serde(default = "default_config_db")]
    pub config_db: u8,
    /// Table-key separator (e.g. `Subscription<sep>HS_RDMA`).
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_config_db() -> u8 {
    4
}

fn default_separator() -> String {
    "|".to_owned()
}

/// How to reach the configuration key/value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KvStoreEndpoint {
    Tcp { host: String, port: u16 },
    UnixSocket { path: String },
}
