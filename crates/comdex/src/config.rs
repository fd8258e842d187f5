// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node configuration.
//!
//! Read once at startup (TOML file, then CLI overrides) and threaded
//! through every component by value. Two optional side files are also
//! supported: the location awareness file and the credential mapping
//! file used when connecting to discovered remote brokers.

use crate::broker::{Credentials, Endpoint, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Local broker endpoint.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Credentials for the local broker.
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,

    /// Routing area entities are written to.
    #[serde(default = "default_area")]
    pub area: String,

    /// Location tag carried by advertisements.
    #[serde(default = "default_location")]
    pub location: String,

    #[serde(default)]
    pub advertisement: AdvertisementConfig,

    /// Delivery level for attribute writes (0, 1 or 2).
    #[serde(default)]
    pub qos: u8,

    /// Resolve query providers through advertisements.
    #[serde(default = "default_true")]
    pub forwarding: bool,

    /// Result limit applied when a query names none.
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    #[serde(default)]
    pub timing: TimingConfig,
}

fn default_area() -> String {
    "unknown_area".to_string()
}

fn default_location() -> String {
    "unknown_location".to_string()
}

fn default_true() -> bool {
    true
}

fn default_limit() -> usize {
    1800
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            credentials: None,
            area: default_area(),
            location: default_location(),
            advertisement: AdvertisementConfig::default(),
            qos: 0,
            forwarding: true,
            default_limit: default_limit(),
            timing: TimingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::Invalid("Broker host is empty".into()));
        }
        if self.broker.host.contains(['/', '+', '#']) {
            return Err(ConfigError::Invalid(format!(
                "Broker host '{}' contains a routing separator",
                self.broker.host
            )));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Invalid("Broker port must be non-zero".into()));
        }
        for (name, value) in [("area", &self.area), ("location", &self.location)] {
            if value.is_empty() || value.contains(['/', '+', '#']) {
                return Err(ConfigError::Invalid(format!(
                    "{name} '{value}' is empty or contains a routing separator"
                )));
            }
        }
        if QoS::from_level(self.qos).is_none() {
            return Err(ConfigError::Invalid(format!(
                "QoS level {} is not one of 0, 1, 2",
                self.qos
            )));
        }
        if self.default_limit == 0 {
            return Err(ConfigError::Invalid("default_limit must be at least 1".into()));
        }
        Ok(())
    }

    /// Local broker endpoint.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.broker.host.clone(), self.broker.port)
            .with_credentials(self.credentials.clone().map(Credentials::from))
    }

    /// Endpoint of a discovered provider. The local broker keeps the
    /// configured credentials; remote ones use the credential store.
    pub fn provider_endpoint(&self, host: &str, port: u16, store: &CredentialStore) -> Endpoint {
        if host == self.broker.host && port == self.broker.port {
            return self.endpoint();
        }
        Endpoint::new(host, port).with_credentials(store.lookup(host, port))
    }

    /// Delivery level for attribute writes.
    pub fn write_qos(&self) -> QoS {
        QoS::from_level(self.qos).unwrap_or(QoS::AtMostOnce)
    }

    /// Apply a location awareness file entry for the local endpoint, if any.
    pub fn apply_location_awareness(&mut self, awareness: &LocationAwareness) {
        if let Some(area) = awareness.area(&self.broker.host, self.broker.port) {
            debug!("Area '{}' from location awareness file", area);
            self.area = area.to_string();
        }
        if let Some(loc) = awareness.location(&self.broker.host, self.broker.port) {
            debug!("Location '{}' from location awareness file", loc);
            self.location = loc.to_string();
        }
    }

    /// Example configuration written by `comdex gen-config`.
    pub fn example_toml() -> String {
        let config = Self {
            credentials: Some(CredentialsConfig {
                username: "user".into(),
                password: "secret".into(),
            }),
            area: "zoneA".into(),
            location: "building1".into(),
            qos: 1,
            ..Self::default()
        };
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Local broker address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1026
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Username/password pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub username: String,
    pub password: String,
}

impl From<CredentialsConfig> for Credentials {
    fn from(c: CredentialsConfig) -> Self {
        Credentials::new(c.username, c.password)
    }
}

/// Advertisement key granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One advertisement per (endpoint, area, context, type).
    #[default]
    Coarse,
    /// One advertisement per entity id.
    PerEntity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvertisementConfig {
    #[serde(default)]
    pub granularity: Granularity,

    /// Retract the coarse advertisement when the last entity of its
    /// shape is deleted.
    #[serde(default = "default_true")]
    pub retract_on_last_delete: bool,
}

impl Default for AdvertisementConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::Coarse,
            retract_on_last_delete: true,
        }
    }
}

/// Listening window budgets, in milliseconds unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Existence probe deadline.
    #[serde(default = "default_probe_ms")]
    pub probe_ms: u64,

    /// Advertisement existence probe deadline.
    #[serde(default = "default_advert_ms")]
    pub advertisement_ms: u64,

    /// Base query window.
    #[serde(default = "default_query_ms")]
    pub query_ms: u64,

    /// Extension granted per newly seen entity.
    #[serde(default = "default_query_grace_ms")]
    pub query_grace_ms: u64,

    /// Base window for retained clears.
    #[serde(default = "default_clear_ms")]
    pub clear_ms: u64,

    /// Extension granted per cleared path.
    #[serde(default = "default_clear_grace_ms")]
    pub clear_grace_ms: u64,

    /// Subscription lifetime when the document names none (seconds).
    #[serde(default = "default_expiry_secs")]
    pub subscription_expiry_secs: u64,
}

fn default_probe_ms() -> u64 {
    1000
}

fn default_advert_ms() -> u64 {
    100
}

fn default_query_ms() -> u64 {
    500
}

fn default_query_grace_ms() -> u64 {
    500
}

fn default_clear_ms() -> u64 {
    500
}

fn default_clear_grace_ms() -> u64 {
    100
}

fn default_expiry_secs() -> u64 {
    3600
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            probe_ms: default_probe_ms(),
            advertisement_ms: default_advert_ms(),
            query_ms: default_query_ms(),
            query_grace_ms: default_query_grace_ms(),
            clear_ms: default_clear_ms(),
            clear_grace_ms: default_clear_grace_ms(),
            subscription_expiry_secs: default_expiry_secs(),
        }
    }
}

impl TimingConfig {
    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms)
    }

    pub fn advertisement(&self) -> Duration {
        Duration::from_millis(self.advertisement_ms)
    }

    pub fn query(&self) -> Duration {
        Duration::from_millis(self.query_ms)
    }

    pub fn query_grace(&self) -> Duration {
        Duration::from_millis(self.query_grace_ms)
    }

    pub fn clear(&self) -> Duration {
        Duration::from_millis(self.clear_ms)
    }

    pub fn clear_grace(&self) -> Duration {
        Duration::from_millis(self.clear_grace_ms)
    }

    pub fn subscription_expiry(&self) -> Duration {
        Duration::from_secs(self.subscription_expiry_secs)
    }
}

/// Area and location tags per broker endpoint.
///
/// The file holds a single dictionary literal:
///
/// ```text
/// {"localhost:1026:area": "zoneA", "localhost:1026:loc": "building1"}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationAwareness {
    entries: HashMap<String, String>,
}

impl LocationAwareness {
    /// Parse the file contents. Malformed content yields an empty table.
    pub fn parse(content: &str) -> Self {
        let parsed = serde_json::from_str::<HashMap<String, String>>(content).or_else(|_| {
            serde_json::from_str::<HashMap<String, String>>(&content.replace('\'', "\""))
        });
        match parsed {
            Ok(entries) => Self { entries },
            Err(e) => {
                warn!("Ignoring malformed location awareness file: {}", e);
                Self::default()
            }
        }
    }

    /// Load from disk. A missing file yields an empty table.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                debug!(
                    "No location awareness file at {}: {}",
                    path.as_ref().display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn area(&self, host: &str, port: u16) -> Option<&str> {
        self.entries
            .get(&format!("{host}:{port}:area"))
            .map(String::as_str)
    }

    pub fn location(&self, host: &str, port: u16) -> Option<&str> {
        self.entries
            .get(&format!("{host}:{port}:loc"))
            .map(String::as_str)
    }
}

/// Credentials for remote brokers, keyed by `host:port`.
///
/// One entry per line: `<host>:<port> <username> <password>`.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    entries: HashMap<(String, u16), Credentials>,
}

impl CredentialStore {
    /// Parse the file contents, skipping malformed lines.
    pub fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let parsed = match fields.as_slice() {
                [addr, user, pass] => addr
                    .rsplit_once(':')
                    .and_then(|(host, port)| port.parse::<u16>().ok().map(|p| (host, p)))
                    .map(|(host, port)| ((host.to_string(), port), Credentials::new(*user, *pass))),
                _ => None,
            };
            match parsed {
                Some((key, creds)) => {
                    entries.insert(key, creds);
                }
                None => warn!("Skipping malformed credential line {}", lineno + 1),
            }
        }
        Self { entries }
    }

    /// Load from disk. A missing file yields an empty store.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                debug!("No credential file at {}: {}", path.as_ref().display(), e);
                Self::default()
            }
        }
    }

    /// Credentials for an endpoint; `None` means anonymous connect.
    pub fn lookup(&self, host: &str, port: u16) -> Option<Credentials> {
        self.entries.get(&(host.to_string(), port)).cloned()
    }

    pub fn insert(&mut self, host: impl Into<String>, port: u16, credentials: Credentials) {
        self.entries.insert((host.into(), port), credentials);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 1026);
        assert_eq!(config.area, "unknown_area");
        assert_eq!(config.location, "unknown_location");
        assert_eq!(config.default_limit, 1800);
        assert!(config.forwarding);
        assert!(config.advertisement.retract_on_last_delete);
        assert_eq!(config.advertisement.granularity, Granularity::Coarse);
        assert_eq!(config.timing.probe(), Duration::from_millis(1000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            area = "zoneA"
            qos = 1

            [broker]
            host = "10.0.0.5"
            port = 1883

            [advertisement]
            granularity = "per_entity"
            retract_on_last_delete = false

            [timing]
            query_ms = 250
        "#;

        let config: NodeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.area, "zoneA");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.write_qos(), QoS::AtLeastOnce);
        assert_eq!(config.advertisement.granularity, Granularity::PerEntity);
        assert!(!config.advertisement.retract_on_last_delete);
        assert_eq!(config.timing.query_ms, 250);
        assert_eq!(config.timing.query_grace_ms, 500);
        assert_eq!(config.location, "unknown_location");
    }

    #[test]
    fn test_validate_rejects_bad_qos() {
        let config = NodeConfig {
            qos: 3,
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_separator_in_area() {
        let config = NodeConfig {
            area: "zone/A".into(),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "area = \"lab\"\n[broker]\nport = 1884").unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.area, "lab");
        assert_eq!(config.broker.port, 1884);
        assert_eq!(config.broker.host, "localhost");
    }

    #[test]
    fn test_from_file_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "qos = 7").unwrap();
        assert!(matches!(
            NodeConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_example_toml_roundtrips() {
        let text = NodeConfig::example_toml();
        let config: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(config.area, "zoneA");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_location_awareness_dict_literal() {
        let awareness = LocationAwareness::parse(
            "{'localhost:1026:area': 'zoneB', 'localhost:1026:loc': 'floor2'}",
        );
        assert_eq!(awareness.area("localhost", 1026), Some("zoneB"));
        assert_eq!(awareness.location("localhost", 1026), Some("floor2"));
        assert_eq!(awareness.area("localhost", 1883), None);

        let mut config = NodeConfig::default();
        config.apply_location_awareness(&awareness);
        assert_eq!(config.area, "zoneB");
        assert_eq!(config.location, "floor2");
    }

    #[test]
    fn test_location_awareness_malformed_keeps_defaults() {
        let awareness = LocationAwareness::parse("not a dictionary");
        let mut config = NodeConfig::default();
        config.apply_location_awareness(&awareness);
        assert_eq!(config.area, "unknown_area");
    }

    #[test]
    fn test_location_awareness_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let awareness = LocationAwareness::load(dir.path().join("absent.txt"));
        assert_eq!(awareness, LocationAwareness::default());
    }

    #[test]
    fn test_credential_store() {
        let store = CredentialStore::parse(
            "remote.example:1883 alice pw1\n\
             broken line\n\
             10.0.0.2:1026 bob pw2\n\
             host:notaport carol pw3\n",
        );
        assert_eq!(store.len(), 2);
        let alice = store.lookup("remote.example", 1883).unwrap();
        assert_eq!(alice.username, "alice");
        assert_eq!(alice.password, "pw1");
        assert!(store.lookup("10.0.0.2", 1026).is_some());
        assert!(store.lookup("10.0.0.2", 1883).is_none());
    }

    #[test]
    fn test_provider_endpoint_credentials() {
        let config = NodeConfig {
            credentials: Some(CredentialsConfig {
                username: "local".into(),
                password: "pw".into(),
            }),
            ..NodeConfig::default()
        };
        let store = CredentialStore::parse("edge:1883 remote pw2\n");

        let local = config.provider_endpoint("localhost", 1026, &store);
        assert_eq!(local.credentials.map(|c| c.username).as_deref(), Some("local"));
        let edge = config.provider_endpoint("edge", 1883, &store);
        assert_eq!(edge.credentials.map(|c| c.username).as_deref(), Some("remote"));
        assert!(config
            .provider_endpoint("other", 1883, &store)
            .credentials
            .is_none());
    }
}
